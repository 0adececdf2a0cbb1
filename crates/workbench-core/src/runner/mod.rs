// Run engines. `engine` drives the classic planned state machine; `agent_loop`
// drives the LLM tool-calling backend. Shared approval/cancel/continue entry
// points live here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use workbench_providers::{ChatMessage, ChatProvider};
use workbench_store::{Store, StoreError, TaskUpdate, StepUpdate};
use workbench_tools::ToolRegistry;
use workbench_types::{
    Backend, EngineEvent, Plan, PolicyScope, Step, StepStatus, TaskStatus,
};

use crate::config::Settings;
use crate::permissions::{scope_for_tool, PolicyEngine};

pub mod agent_loop;
pub mod engine;

pub use agent_loop::AgentLaunch;

/// One cancellation token per in-flight task so the cancel path can stop the
/// agent loop cooperatively. In-flight tool calls are not preempted.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .await
            .insert(task_id.to_string(), token.clone());
        token
    }

    pub async fn cancel(&self, task_id: &str) {
        if let Some(token) = self.tokens.lock().await.get(task_id) {
            token.cancel();
        }
    }

    pub async fn remove(&self, task_id: &str) {
        self.tokens.lock().await.remove(task_id);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContinueError {
    #[error("message required")]
    EmptyMessage,
    #[error("task is waiting approval; reply approve/reject (同意/拒绝) or use the approval endpoint")]
    NeedsDecision,
    #[error("task is waiting approval but no pending approval found")]
    NoPendingApproval,
    #[error("task is busy (status={0})")]
    Busy(TaskStatus),
    #[error("continue is supported only for agent-loop backend tasks")]
    UnsupportedBackend,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone)]
pub enum ContinueOutcome {
    ApprovalDecision { decision: String, step_id: String },
    Resumed,
}

/// Owns the subsystems a run needs and launches workers. One value per
/// process, shared behind an `Arc`.
pub struct Runner {
    pub(crate) store: Arc<Store>,
    pub(crate) tools: ToolRegistry,
    pub(crate) policy: Arc<PolicyEngine>,
    pub(crate) provider: Arc<dyn ChatProvider>,
    pub(crate) settings: Arc<Settings>,
    pub(crate) cancellations: CancellationRegistry,
}

impl Runner {
    pub fn new(
        store: Arc<Store>,
        tools: ToolRegistry,
        policy: Arc<PolicyEngine>,
        provider: Arc<dyn ChatProvider>,
        settings: Arc<Settings>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            tools,
            policy,
            provider,
            settings,
            cancellations: CancellationRegistry::new(),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    pub(crate) async fn is_canceled(&self, task_id: &str) -> bool {
        matches!(
            self.store.get_task(task_id).await,
            Ok(task) if task.status == TaskStatus::Canceled
        )
    }

    /// Launch (or resume) a task on a background worker. The backend comes
    /// from the task row, then the `WORKBENCH_AGENT_BACKEND` env default.
    pub fn start_task_background(self: &Arc<Self>, task_id: &str) {
        let runner = self.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            let backend = match runner.resolve_backend(&task_id).await {
                Ok(Some(backend)) => backend,
                Ok(None) => return,
                Err(err) => {
                    tracing::error!(task_id, "failed to resolve task backend: {err}");
                    return;
                }
            };
            match backend {
                Backend::Classic => engine::run_classic(&runner, &task_id).await,
                Backend::AgentLoop => {
                    agent_loop::run_agent(&runner, &task_id, AgentLaunch::Start).await
                }
            }
        });
    }

    async fn resolve_backend(&self, task_id: &str) -> anyhow::Result<Option<Backend>> {
        let task = self.store.get_task(task_id).await?;
        if task.status == TaskStatus::Canceled {
            return Ok(None);
        }
        if let Some(backend) = task.backend {
            return Ok(Some(backend));
        }
        let backend = std::env::var("WORKBENCH_AGENT_BACKEND")
            .ok()
            .and_then(|v| v.parse::<Backend>().ok())
            .unwrap_or(Backend::Classic);
        self.store
            .update_task(
                task_id,
                TaskUpdate {
                    backend: Some(backend),
                    ..TaskUpdate::default()
                },
            )
            .await?;
        Ok(Some(backend))
    }

    /// Durable approval rendezvous. Records the decision (idempotently), then
    /// relaunches the run: approve grants the ask-once scope and spawns a
    /// fresh worker; reject fails the step (for the classic backend the whole
    /// task; the agent loop is resumed so the model observes the denial).
    /// Returns `false` when the approval was already decided.
    pub async fn approve_step(
        self: &Arc<Self>,
        task_id: &str,
        step_id: &str,
        decision: &str,
        reason: Option<&str>,
    ) -> anyhow::Result<bool> {
        let approve = decision == "approve";
        let status = if approve {
            workbench_types::ApprovalStatus::Approved
        } else {
            workbench_types::ApprovalStatus::Rejected
        };
        let changed = self
            .store
            .decide_latest_approval(step_id, status, decision, reason)
            .await?;
        if !changed {
            return Ok(false);
        }

        let task = self.store.get_task(task_id).await?;
        let step = self.store.get_step(step_id).await?;
        let scope = scope_for_tool(&step.tool);
        let payload = json!({
            "decision": decision,
            "reason": reason.unwrap_or(""),
            "tool": step.tool.clone(),
            "scope": scope.as_str(),
        });
        let seq = self
            .store
            .append_event(task_id, Some(step_id), "approval_decided", payload.clone())
            .await?;
        let mut published = payload;
        published["task_id"] = json!(task_id);
        published["step_id"] = json!(step_id);
        published["seq"] = json!(seq);
        self.store
            .bus()
            .publish(EngineEvent::new("approval_decided", published));

        // A canceled task stays canceled; the decision is recorded but the
        // run must not come back to life.
        if task.status == TaskStatus::Canceled {
            return Ok(true);
        }

        let agent_backend = task.backend == Some(Backend::AgentLoop);
        if approve {
            self.policy.grant_scope(task_id, scope).await;
            self.store
                .update_task(
                    task_id,
                    TaskUpdate {
                        status: Some(TaskStatus::Running),
                        error: Some(None),
                        ..TaskUpdate::default()
                    },
                )
                .await?;
            if agent_backend {
                self.spawn_agent(task_id, AgentLaunch::Resume { approve: true });
            } else {
                self.start_task_background(task_id);
            }
        } else {
            let message = format!("Rejected by user: {}", reason.unwrap_or(""))
                .trim()
                .to_string();
            self.store
                .update_step(
                    step_id,
                    StepUpdate {
                        status: Some(StepStatus::Failed),
                        error: Some(Some(message.clone())),
                        ..StepUpdate::default()
                    },
                )
                .await?;
            if agent_backend {
                self.store
                    .update_task(
                        task_id,
                        TaskUpdate {
                            status: Some(TaskStatus::Running),
                            error: Some(None),
                            ..TaskUpdate::default()
                        },
                    )
                    .await?;
                self.spawn_agent(task_id, AgentLaunch::Resume { approve: false });
            } else {
                self.store
                    .update_task(task_id, TaskUpdate::failed(message))
                    .await?;
                self.policy.clear_task_grants(task_id).await;
            }
        }
        Ok(true)
    }

    /// Cancellation is a status write observed at every loop checkpoint.
    /// Returns `false` when the task does not exist.
    pub async fn cancel_task(&self, task_id: &str, reason: Option<&str>) -> anyhow::Result<bool> {
        let task = match self.store.get_task(task_id).await {
            Ok(task) => task,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        if task.status.is_terminal() {
            return Ok(true);
        }
        let message = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or("Canceled by user.")
            .to_string();
        self.store
            .update_task(
                task_id,
                TaskUpdate {
                    status: Some(TaskStatus::Canceled),
                    error: Some(Some(message)),
                    backend_interrupt_id: Some(None),
                    backend_resume_token: Some(None),
                    ..TaskUpdate::default()
                },
            )
            .await?;
        self.policy.clear_task_grants(task_id).await;
        self.cancellations.cancel(task_id).await;
        Ok(true)
    }

    /// Follow-up message handling: while waiting for approval the message is
    /// an approve/reject decision (English or Chinese); otherwise an
    /// agent-loop task gets the message as a new user turn.
    pub async fn continue_task(
        self: &Arc<Self>,
        task_id: &str,
        message: &str,
    ) -> Result<ContinueOutcome, ContinueError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ContinueError::EmptyMessage);
        }
        let task = self.store.get_task(task_id).await?;

        if task.status == TaskStatus::WaitingApproval {
            let Some(decision) = parse_approval_decision(message) else {
                return Err(ContinueError::NeedsDecision);
            };
            let Some(approval) = self.store.latest_pending_approval(task_id).await? else {
                return Err(ContinueError::NoPendingApproval);
            };
            self.approve_step(task_id, &approval.step_id, decision, Some(message))
                .await
                .map_err(|err| ContinueError::Other(err.to_string()))?;
            return Ok(ContinueOutcome::ApprovalDecision {
                decision: decision.to_string(),
                step_id: approval.step_id,
            });
        }

        if matches!(
            task.status,
            TaskStatus::Queued | TaskStatus::Planning | TaskStatus::Running
        ) {
            return Err(ContinueError::Busy(task.status));
        }
        if task.backend != Some(Backend::AgentLoop) {
            return Err(ContinueError::UnsupportedBackend);
        }

        self.spawn_agent(
            task_id,
            AgentLaunch::Continue {
                message: message.to_string(),
            },
        );
        Ok(ContinueOutcome::Resumed)
    }

    pub(crate) fn spawn_agent(self: &Arc<Self>, task_id: &str, launch: AgentLaunch) {
        let runner = self.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            agent_loop::run_agent(&runner, &task_id, launch).await;
        });
    }
}

/// Interpret a free-form follow-up as an approval decision. Rejections are
/// checked first: "不同意" contains "同意".
pub fn parse_approval_decision(message: &str) -> Option<&'static str> {
    let raw = message.trim();
    if raw.is_empty() {
        return None;
    }
    if ["拒绝", "不同意", "不允许"].iter().any(|k| raw.contains(k)) {
        return Some("reject");
    }
    let low = raw.to_lowercase();
    if matches!(low.as_str(), "no" | "n" | "reject" | "deny" | "refuse") {
        return Some("reject");
    }
    if ["同意", "允许"].iter().any(|k| raw.contains(k)) {
        return Some("approve");
    }
    if matches!(low.as_str(), "yes" | "y" | "ok" | "approve" | "allow") {
        return Some("approve");
    }
    None
}

/// Render `<var>` and `{{ var }}` placeholders in a skill prompt.
pub fn render_prompt_template(text: &str, vars: &[(&str, String)]) -> String {
    let mut out = text.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("<{key}>"), value);
        out = out.replace(&format!("{{{{{key}}}}}"), value);
        out = out.replace(&format!("{{{{ {key} }}}}"), value);
    }
    out
}

/// Bilingual approval prompt surfaced as a system chat bubble, so users can
/// answer conversationally from any client.
pub(crate) fn approval_chat_text(tool: &str, scope: PolicyScope) -> String {
    format!(
        "Approval required for tool: `{tool}` ({scope}). Reply: approve / reject.\n需要确认：是否允许调用工具 `{tool}`（{scope}）。请回复：同意 / 拒绝。",
        tool = tool,
        scope = scope.as_str(),
    )
}

/// Chat history reconstructed from persisted `chat_message` events.
pub(crate) async fn load_chat_history(
    store: &Store,
    task_id: &str,
    limit: usize,
) -> Result<Vec<ChatMessage>, StoreError> {
    let events = store.list_events(task_id, 0, 2000, false).await?;
    let mut history: Vec<ChatMessage> = events
        .into_iter()
        .filter(|e| e.event_type == "chat_message")
        .filter_map(|e| {
            let role = e.payload.get("role")?.as_str()?.to_string();
            let content = e.payload.get("content")?.as_str()?.to_string();
            Some(ChatMessage { role, content })
        })
        .collect();
    if history.len() > limit {
        history = history.split_off(history.len() - limit);
    }
    Ok(history)
}

/// Files a task's tools produced under `artifacts/<task_id>/`.
pub(crate) fn collect_artifacts(artifacts_dir: &Path) -> Vec<Value> {
    let mut items = Vec::new();
    let mut pending = vec![artifacts_dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if let Ok(meta) = entry.metadata() {
                items.push(json!({"path": path.display().to_string(), "size": meta.len()}));
            }
        }
    }
    items.sort_by(|a, b| {
        a["path"]
            .as_str()
            .unwrap_or("")
            .cmp(b["path"].as_str().unwrap_or(""))
    });
    items
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn wrap_report_html(markdown: &str) -> String {
    format!(
        "<html><head><meta charset='utf-8'><title>Run Report</title></head><body><pre>{}</pre></body></html>",
        html_escape(markdown)
    )
}

pub(crate) struct ReportPaths {
    pub markdown: PathBuf,
    pub html: PathBuf,
}

fn write_report_files(
    ws_root: &Path,
    task_id: &str,
    markdown: &str,
) -> anyhow::Result<ReportPaths> {
    let out_dir = ws_root.join("outputs").join(task_id);
    std::fs::create_dir_all(&out_dir)?;
    let md_path = out_dir.join("report.md");
    let html_path = out_dir.join("report.html");
    std::fs::write(&md_path, markdown)?;
    std::fs::write(&html_path, wrap_report_html(markdown))?;
    Ok(ReportPaths {
        markdown: md_path,
        html: html_path,
    })
}

/// Classic-backend report: plan summary, step outcomes, artifact listing.
pub(crate) fn write_classic_report(
    ws_root: &Path,
    task_id: &str,
    goal: &str,
    plan: &Plan,
    steps: &[Step],
    artifacts: &[Value],
) -> anyhow::Result<ReportPaths> {
    let mut lines = Vec::new();
    lines.push(format!("# Run Report: {task_id}"));
    lines.push(String::new());
    lines.push("## Goal".to_string());
    lines.push(goal.to_string());
    lines.push(String::new());
    lines.push("## Plan Summary".to_string());
    lines.push(plan.summary.clone());
    lines.push(String::new());
    lines.push("## Steps".to_string());
    for step in steps {
        lines.push(format!(
            "- **{}. {}** (`{}`) — {}",
            step.idx + 1,
            step.name,
            step.tool,
            step.status.as_str()
        ));
        if let Some(error) = &step.error {
            lines.push(format!("  - Error: {error}"));
        }
    }
    lines.push(String::new());
    lines.push("## Artifacts".to_string());
    push_artifact_lines(&mut lines, artifacts);
    write_report_files(ws_root, task_id, &lines.join("\n"))
}

/// Agent-loop report: backend identity, goal, final output, artifacts.
pub(crate) fn write_agent_report(
    ws_root: &Path,
    task_id: &str,
    goal: &str,
    run_id: &str,
    output: &str,
    warning: Option<&str>,
    artifacts: &[Value],
) -> anyhow::Result<ReportPaths> {
    let mut lines = Vec::new();
    lines.push(format!("# Run Report: {task_id}"));
    lines.push(String::new());
    lines.push("## Backend".to_string());
    lines.push("- runtime: agent-loop".to_string());
    lines.push(format!("- run_id: `{run_id}`"));
    lines.push(String::new());
    lines.push("## Goal".to_string());
    lines.push(goal.to_string());
    lines.push(String::new());
    if let Some(warning) = warning {
        lines.push("## Warning".to_string());
        lines.push(warning.to_string());
        lines.push(String::new());
    }
    lines.push("## Output".to_string());
    lines.push(output.to_string());
    lines.push(String::new());
    lines.push("## Artifacts".to_string());
    push_artifact_lines(&mut lines, artifacts);
    write_report_files(ws_root, task_id, &lines.join("\n"))
}

fn push_artifact_lines(lines: &mut Vec<String>, artifacts: &[Value]) {
    if artifacts.is_empty() {
        lines.push("_No artifacts generated._".to_string());
        return;
    }
    for artifact in artifacts {
        lines.push(format!(
            "- `{}` ({} bytes)",
            artifact["path"].as_str().unwrap_or(""),
            artifact["size"].as_u64().unwrap_or(0)
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_parsing_covers_both_languages() {
        assert_eq!(parse_approval_decision("approve"), Some("approve"));
        assert_eq!(parse_approval_decision("YES"), Some("approve"));
        assert_eq!(parse_approval_decision("同意"), Some("approve"));
        assert_eq!(parse_approval_decision("允许执行"), Some("approve"));
        assert_eq!(parse_approval_decision("reject"), Some("reject"));
        assert_eq!(parse_approval_decision("拒绝"), Some("reject"));
        // "不同意" must not read as approval.
        assert_eq!(parse_approval_decision("不同意"), Some("reject"));
        assert_eq!(parse_approval_decision("不允许"), Some("reject"));
        assert_eq!(parse_approval_decision("maybe later"), None);
        assert_eq!(parse_approval_decision(""), None);
    }

    #[test]
    fn prompt_template_renders_both_placeholder_styles() {
        let vars = [("workspace_root", "/tmp/w1".to_string())];
        assert_eq!(
            render_prompt_template("root is <workspace_root>", &vars),
            "root is /tmp/w1"
        );
        assert_eq!(
            render_prompt_template("root is {{workspace_root}}", &vars),
            "root is /tmp/w1"
        );
        assert_eq!(
            render_prompt_template("root is {{ workspace_root }}", &vars),
            "root is /tmp/w1"
        );
    }

    #[test]
    fn report_html_escapes_markdown() {
        let html = wrap_report_html("a < b & c");
        assert!(html.contains("a &lt; b &amp; c"));
    }

    #[test]
    fn artifacts_are_listed_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("step1")).unwrap();
        std::fs::write(dir.path().join("step1/b.txt"), "bb").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        let artifacts = collect_artifacts(dir.path());
        assert_eq!(artifacts.len(), 2);
        let first = artifacts[0]["path"].as_str().unwrap();
        assert!(first.ends_with("a.txt"));
    }

    #[test]
    fn missing_artifact_dir_is_empty() {
        assert!(collect_artifacts(Path::new("/nonexistent/xyz")).is_empty());
    }
}
