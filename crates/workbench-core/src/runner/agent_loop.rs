// Agent-loop run engine: a single LLM tool-calling loop over the same task
// record. Approval pauses are encoded as persisted interrupts with stable
// resume tokens; loop events are mirrored into the task's event log.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use workbench_providers::{ChatMessage, ChatRequest, ToolCall};
use workbench_store::{StepUpdate, TaskUpdate};
use workbench_tools::{openai_tool_schema, ToolContext};
use workbench_types::{
    new_id, now_iso, Backend, EngineEvent, Step, StepStatus, TaskStatus, Workspace,
};

use crate::permissions::{scope_for_tool, PolicyMode};

use super::{collect_artifacts, engine, load_chat_history, render_prompt_template, write_agent_report, Runner};

const MAX_LOOP_ITERATIONS: usize = 25;
const HISTORY_LIMIT: usize = 200;
const TOOL_OUTPUT_PREVIEW: usize = 2000;

/// Loop event types mirrored into the main event log as `agent_event` rows.
const MIRRORED_EVENT_PREFIXES: &[&str] = &[
    "run.",
    "step.",
    "llm.",
    "tool.",
    "approval.",
    "interrupt.",
    "guardrail.",
    "mcp.",
    "handoff.",
];

pub(crate) fn should_mirror(event_type: &str) -> bool {
    MIRRORED_EVENT_PREFIXES
        .iter()
        .any(|p| event_type.starts_with(p))
}

#[derive(Debug, Clone)]
pub enum AgentLaunch {
    Start,
    Resume { approve: bool },
    Continue { message: String },
}

/// Worker entry point; errors become task failures unless the task was
/// canceled while the worker ran.
pub(crate) async fn run_agent(runner: &Arc<Runner>, task_id: &str, launch: AgentLaunch) {
    let cancel = runner.cancellations.create(task_id).await;
    let result = run_agent_inner(runner, task_id, launch, cancel).await;
    runner.cancellations.remove(task_id).await;
    if let Err(err) = result {
        if runner.is_canceled(task_id).await {
            return;
        }
        tracing::error!(task_id, "agent loop failed: {err:#}");
        let _ = runner
            .store
            .update_task(task_id, TaskUpdate::failed(format!("{err:#}")))
            .await;
        runner.policy.clear_task_grants(task_id).await;
    }
}

/// Copies loop events into the event log with a monotonically advancing
/// offset stored on the task (quietly; offset writes emit no task_update).
struct EventMirror {
    task_id: String,
    run_id: String,
    offset: i64,
}

impl EventMirror {
    async fn emit(
        &mut self,
        runner: &Runner,
        step_id: Option<&str>,
        event_type: &str,
        payload: Value,
    ) -> anyhow::Result<()> {
        if !should_mirror(event_type) {
            return Ok(());
        }
        self.offset += 1;
        let seq = runner
            .store
            .append_event(
                &self.task_id,
                step_id,
                "agent_event",
                json!({
                    "run_id": self.run_id,
                    "event": {"type": event_type, "payload": payload, "offset": self.offset},
                }),
            )
            .await?;
        runner
            .store
            .set_backend_last_offset(&self.task_id, self.offset)
            .await?;
        runner.store.bus().publish(EngineEvent::new(
            "event_log",
            json!({"task_id": self.task_id, "type": "agent_event", "seq": seq,
                   "payload": {"event_type": event_type}}),
        ));
        Ok(())
    }
}

struct LoopContext {
    workspace: Workspace,
    ws_root: PathBuf,
    artifacts_dir: PathBuf,
    model: String,
    allowed_tools: Vec<String>,
    system_prompt: String,
    citations_required: bool,
}

async fn build_loop_context(
    runner: &Runner,
    task_id: &str,
    goal_text: &str,
) -> anyhow::Result<LoopContext> {
    let task = runner.store.get_task(task_id).await?;
    let workspace = runner.store.get_workspace(&task.workspace_id).await?;
    let skill = runner.store.get_skill(&task.skill_id).await?;
    let ws_root = PathBuf::from(&workspace.path);
    let artifacts_dir = runner.settings.task_artifacts_dir(task_id);

    let vars = [
        ("task_id", task_id.to_string()),
        ("workspace_root", ws_root.display().to_string()),
        (
            "outputs_dir",
            ws_root.join("outputs").join(task_id).display().to_string(),
        ),
        ("artifacts_dir", artifacts_dir.display().to_string()),
    ];
    let skill_prompt = render_prompt_template(skill.system_prompt.trim(), &vars);

    let run_context = format!(
        "RUN_CONTEXT (do not ask the user for these):\n\
         - task_id: {task_id}\n\
         - workspace_root: {ws}\n\
         - outputs_dir: outputs/{task_id}\n\
         - artifacts_dir: {artifacts}\n\
         \n\
         Filesystem paths are relative to workspace_root. If a path starts with 'workspace/', treat it as workspace_root.",
        ws = ws_root.display(),
        artifacts = artifacts_dir.display(),
    );
    let autonomy = "AUTONOMY:\n\
         - Do not ask the user to confirm your plan.\n\
         - Do not narrate what you will do; proceed to tool calls.\n\
         - Ask at most ONE clarification question only if truly blocked.\n\
         - If reasonable assumptions are possible, state them briefly and proceed.";

    let citations_required = citations_required(goal_text);
    let mut system_prompt = format!("{run_context}\n\n{autonomy}");
    if !skill_prompt.is_empty() {
        system_prompt.push_str("\n\n");
        system_prompt.push_str(&skill_prompt);
    }
    if citations_required {
        system_prompt.push_str(
            "\n\nCitations required:\n- Ground key claims in fetched evidence.\n- Add inline [source: <url-or-path>] markers for key claims.",
        );
    }

    let model = runner.settings.model_for(task.mode);
    Ok(LoopContext {
        workspace,
        ws_root,
        artifacts_dir,
        model,
        allowed_tools: skill.allowed_tools,
        system_prompt,
        citations_required,
    })
}

/// Whether the final answer must carry evidence markers, per the runtime
/// citations mode (`auto` gates on the goal, `require` always, `off` never).
fn citations_required(goal: &str) -> bool {
    let mode = std::env::var("WORKBENCH_CITATIONS_MODE").unwrap_or_else(|_| "auto".to_string());
    match mode.trim().to_lowercase().as_str() {
        "off" => false,
        "require" => true,
        _ => {
            let g = goal.to_lowercase();
            ["research", "survey", "paper", "report", "调研", "研究", "论文", "综述", "报告"]
                .iter()
                .any(|k| g.contains(k))
        }
    }
}

fn has_evidence_marker(text: &str) -> bool {
    text.contains("http://") || text.contains("https://") || text.contains("[source:") || text.contains("[chunk:")
}

fn tool_output_preview(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() <= TOOL_OUTPUT_PREVIEW {
        return text;
    }
    let truncated: String = text.chars().take(TOOL_OUTPUT_PREVIEW).collect();
    format!("{truncated}...")
}

fn summarize_tool_outputs(outputs: &[String]) -> String {
    format!(
        "TOOL_RESULTS:\n{}\nContinue with a concise final response and avoid repeating identical tool calls.",
        outputs.join("\n---\n")
    )
}

async fn run_agent_inner(
    runner: &Arc<Runner>,
    task_id: &str,
    launch: AgentLaunch,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let store = &runner.store;
    let task = store.get_task(task_id).await?;
    if task.status == TaskStatus::Canceled {
        return Ok(());
    }

    let mut followup: Option<String> = None;
    let history;
    let run_id;

    match &launch {
        AgentLaunch::Start => {
            // A fresh agent run owns the step table; clear classic leftovers.
            store.delete_steps(task_id).await?;
            store.delete_approvals(task_id).await?;
            run_id = new_id();
            let thread_id = new_id();
            store
                .update_task(
                    task_id,
                    TaskUpdate {
                        status: Some(TaskStatus::Running),
                        error: Some(None),
                        backend: Some(Backend::AgentLoop),
                        backend_run_id: Some(run_id.clone()),
                        backend_thread_id: Some(thread_id),
                        backend_interrupt_id: Some(None),
                        backend_resume_token: Some(None),
                        backend_last_offset: Some(0),
                        ..TaskUpdate::default()
                    },
                )
                .await?;
            history = load_chat_history(store, task_id, HISTORY_LIMIT).await?;
        }
        AgentLaunch::Continue { message } => {
            // History is captured before the new message; the message itself
            // becomes the run goal.
            history = load_chat_history(store, task_id, HISTORY_LIMIT).await?;
            store
                .append_chat_message(task_id, None, "user", message)
                .await?;
            run_id = match &task.backend_run_id {
                Some(id) if !id.is_empty() => id.clone(),
                _ => new_id(),
            };
            store
                .update_task(
                    task_id,
                    TaskUpdate {
                        status: Some(TaskStatus::Running),
                        error: Some(None),
                        backend: Some(Backend::AgentLoop),
                        backend_run_id: Some(run_id.clone()),
                        ..TaskUpdate::default()
                    },
                )
                .await?;
        }
        AgentLaunch::Resume { .. } => {
            run_id = task
                .backend_run_id
                .clone()
                .ok_or_else(|| anyhow::anyhow!("missing backend_run_id for resume"))?;
            history = load_chat_history(store, task_id, HISTORY_LIMIT).await?;
        }
    }

    let mut mirror = EventMirror {
        task_id: task_id.to_string(),
        run_id: run_id.clone(),
        offset: match &launch {
            AgentLaunch::Start => 0,
            _ => task.backend_last_offset.unwrap_or(0),
        },
    };

    let goal_text = match &launch {
        AgentLaunch::Continue { message } => message.clone(),
        _ => history
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_else(|| task.goal.clone()),
    };
    let ctx = build_loop_context(runner, task_id, &goal_text).await?;

    match &launch {
        AgentLaunch::Start => {
            mirror
                .emit(runner, None, "run.started", json!({"goal": goal_text.clone()}))
                .await?;
        }
        AgentLaunch::Continue { .. } => {
            mirror
                .emit(runner, None, "run.continued", json!({"goal": goal_text.clone()}))
                .await?;
        }
        AgentLaunch::Resume { approve } => {
            // Idempotent: once a decision has been applied the interrupt
            // fields are cleared, and a repeated submission is a no-op.
            let (Some(interrupt_id), Some(resume_token)) = (
                task.backend_interrupt_id.clone(),
                task.backend_resume_token.clone(),
            ) else {
                return Ok(());
            };
            let pending = latest_interrupt_payload(runner, task_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("missing interrupt record for resume"))?;
            if pending["interrupt_id"].as_str() != Some(interrupt_id.as_str())
                || pending["resume_token"].as_str() != Some(resume_token.as_str())
            {
                anyhow::bail!("interrupt id/token mismatch on resume");
            }
            let step_id = pending["step_id"].as_str().unwrap_or_default().to_string();
            let tool_name = pending["pending_tool_name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let tool_args = pending["pending_args"].clone();

            store
                .update_task(
                    task_id,
                    TaskUpdate {
                        status: Some(TaskStatus::Running),
                        error: Some(None),
                        backend_interrupt_id: Some(None),
                        backend_resume_token: Some(None),
                        ..TaskUpdate::default()
                    },
                )
                .await?;
            mirror
                .emit(
                    runner,
                    Some(&step_id),
                    "interrupt.resumed",
                    json!({"interrupt_id": interrupt_id, "approve": approve}),
                )
                .await?;

            if *approve {
                runner
                    .policy
                    .grant_scope(task_id, scope_for_tool(&tool_name))
                    .await;
                let output = execute_pending_call(
                    runner,
                    task_id,
                    &ctx,
                    &mut mirror,
                    &step_id,
                    &tool_name,
                    tool_args,
                )
                .await?;
                followup = Some(summarize_tool_outputs(&[output]));
            } else {
                mirror
                    .emit(
                        runner,
                        Some(&step_id),
                        "approval.rejected",
                        json!({"tool": tool_name.clone()}),
                    )
                    .await?;
                followup = Some(format!(
                    "Tool call `{tool_name}` was rejected by the user. Do not call it again; explain your findings or choose a different approach."
                ));
            }
        }
    }

    let specs = runner.tools.list_specs(&ctx.allowed_tools).await;
    let tool_schemas: Vec<Value> = specs.iter().map(openai_tool_schema).collect();

    let mut final_text: Option<String> = None;
    for iteration in 0..MAX_LOOP_ITERATIONS {
        if cancel.is_cancelled() || runner.is_canceled(task_id).await {
            return Ok(());
        }

        let mut messages = vec![ChatMessage::system(ctx.system_prompt.clone())];
        messages.extend(history.iter().cloned());
        if let Some(extra) = followup.take() {
            messages.push(ChatMessage::user(extra));
        }

        mirror
            .emit(runner, None, "llm.started", json!({"iteration": iteration}))
            .await?;
        let response = runner
            .provider
            .chat(ChatRequest::new(ctx.model.as_str(), messages).with_tools(tool_schemas.clone()))
            .await?;
        mirror
            .emit(
                runner,
                None,
                "llm.completed",
                json!({"iteration": iteration, "tool_calls": response.tool_calls.len(),
                       "has_content": !response.content.trim().is_empty()}),
            )
            .await?;

        if response.tool_calls.is_empty() {
            if response.content.trim().is_empty() {
                let message = "The model gateway returned an empty stream (no content/tool_calls). Check the API key / base_url / model name and retry.\n模型网关返回了空流（没有 content/tool_calls）。请检查 API Key / base_url / 模型名 / 网络后重试。";
                store
                    .append_chat_message(task_id, None, "system", message)
                    .await?;
                if !runner.is_canceled(task_id).await {
                    store
                        .update_task(
                            task_id,
                            TaskUpdate::failed(
                                "Gateway returned an empty stream (no content/tool_calls).",
                            ),
                        )
                        .await?;
                }
                runner.policy.clear_task_grants(task_id).await;
                return Ok(());
            }
            final_text = Some(response.content);
            break;
        }

        let mut outputs = Vec::new();
        for call in &response.tool_calls {
            if cancel.is_cancelled() || runner.is_canceled(task_id).await {
                return Ok(());
            }
            let args: Value = serde_json::from_str(&call.arguments).unwrap_or(json!({}));

            if !ctx.allowed_tools.is_empty() && !ctx.allowed_tools.contains(&call.name) {
                outputs.push(format!("Tool `{}` is not enabled for this skill.", call.name));
                continue;
            }
            let Some(spec) = runner.tools.get_spec(&call.name).await else {
                outputs.push(format!("Unknown tool: {}", call.name));
                continue;
            };

            let decision = runner
                .policy
                .decide(&ctx.workspace.id, &call.name, task_id, false, Some(spec.risky))
                .await?;
            match decision.mode {
                PolicyMode::Deny => {
                    let step_id =
                        insert_loop_step(runner, task_id, &call.name, args.clone(), StepStatus::Failed)
                            .await?;
                    store
                        .update_step(
                            &step_id,
                            StepUpdate {
                                error: Some(Some(format!(
                                    "Denied by policy ({}).",
                                    scope_for_tool(&call.name).as_str()
                                ))),
                                ..StepUpdate::default()
                            },
                        )
                        .await?;
                    mirror
                        .emit(
                            runner,
                            Some(&step_id),
                            "tool.denied",
                            json!({"tool": call.name.clone(), "reason": decision.reason}),
                        )
                        .await?;
                    outputs.push(format!(
                        "Tool `{}` was denied by workspace policy.",
                        call.name
                    ));
                }
                PolicyMode::RequireApproval => {
                    raise_interrupt(runner, task_id, &mut mirror, call, args).await?;
                    return Ok(());
                }
                PolicyMode::Auto => {
                    let step_id = insert_loop_step(
                        runner,
                        task_id,
                        &call.name,
                        args.clone(),
                        StepStatus::Running,
                    )
                    .await?;
                    let output = execute_pending_call(
                        runner,
                        task_id,
                        &ctx,
                        &mut mirror,
                        &step_id,
                        &call.name,
                        args,
                    )
                    .await?;
                    outputs.push(output);
                }
            }
        }
        followup = Some(summarize_tool_outputs(&outputs));
    }

    let Some(text) = final_text else {
        anyhow::bail!("agent loop exceeded its iteration budget without a final answer");
    };

    let artifacts = collect_artifacts(&ctx.artifacts_dir);
    if ctx.citations_required && !has_evidence_marker(&text) && artifacts.is_empty() {
        // Guardrail failures are recovered: show the salvaged output with a
        // warning, keep it in the report, and fail the task for auditing.
        let warning = "Output failed citation checks; showing the model's last output for reference.\n输出未通过引用校验，已展示模型最后一次输出供参考。";
        store
            .append_chat_message(task_id, None, "assistant", &text)
            .await?;
        store
            .append_chat_message(task_id, None, "system", warning)
            .await?;
        mirror
            .emit(runner, None, "guardrail.failed", json!({"reason": "missing_citations"}))
            .await?;
        let report = write_agent_report(
            &ctx.ws_root,
            task_id,
            &goal_text,
            &run_id,
            &text,
            Some(warning),
            &artifacts,
        )?;
        if !runner.is_canceled(task_id).await {
            store
                .update_task(
                    task_id,
                    TaskUpdate {
                        status: Some(TaskStatus::Failed),
                        error: Some(Some(warning.to_string())),
                        output_path: Some(report.markdown.display().to_string()),
                        backend_interrupt_id: Some(None),
                        backend_resume_token: Some(None),
                        ..TaskUpdate::default()
                    },
                )
                .await?;
        }
        runner.policy.clear_task_grants(task_id).await;
        return Ok(());
    }

    store
        .append_chat_message(task_id, None, "assistant", &text)
        .await?;
    let report = write_agent_report(
        &ctx.ws_root,
        task_id,
        &goal_text,
        &run_id,
        &text,
        None,
        &artifacts,
    )?;
    mirror.emit(runner, None, "run.completed", json!({})).await?;
    if !runner.is_canceled(task_id).await {
        store
            .update_task(
                task_id,
                TaskUpdate {
                    status: Some(TaskStatus::Succeeded),
                    error: Some(None),
                    output_path: Some(report.markdown.display().to_string()),
                    backend_interrupt_id: Some(None),
                    backend_resume_token: Some(None),
                    ..TaskUpdate::default()
                },
            )
            .await?;
    }
    runner.policy.clear_task_grants(task_id).await;
    Ok(())
}

/// Newest persisted `interrupt.raised` payload for the task, if any.
async fn latest_interrupt_payload(
    runner: &Runner,
    task_id: &str,
) -> anyhow::Result<Option<Value>> {
    let events = runner.store.list_events(task_id, 0, 2000, false).await?;
    Ok(events
        .into_iter()
        .rev()
        .filter(|e| e.event_type == "agent_event")
        .find(|e| e.payload["event"]["type"] == "interrupt.raised")
        .map(|e| e.payload["event"]["payload"].clone()))
}

/// Insert a step row for a loop tool call, idx assigned in first-seen order.
async fn insert_loop_step(
    runner: &Runner,
    task_id: &str,
    tool: &str,
    args: Value,
    status: StepStatus,
) -> anyhow::Result<String> {
    let idx = runner
        .store
        .max_step_idx(task_id)
        .await?
        .map(|m| m + 1)
        .unwrap_or(0);
    let now = now_iso();
    let step = Step {
        id: new_id(),
        task_id: task_id.to_string(),
        idx,
        name: tool.to_string(),
        tool: tool.to_string(),
        args,
        status,
        requires_approval: false,
        result: None,
        error: None,
        created_at: now.clone(),
        updated_at: now,
    };
    runner.store.insert_step(&step).await?;
    Ok(step.id)
}

async fn execute_pending_call(
    runner: &Runner,
    task_id: &str,
    ctx: &LoopContext,
    mirror: &mut EventMirror,
    step_id: &str,
    tool: &str,
    args: Value,
) -> anyhow::Result<String> {
    // Pending-approval steps wrap the real args.
    let args = match args.get("args") {
        Some(inner) if args.get("tool_call_id").is_some() => inner.clone(),
        _ => args,
    };

    mirror
        .emit(runner, Some(step_id), "step.started", json!({"node": tool}))
        .await?;
    mirror
        .emit(runner, Some(step_id), "tool.started", json!({"tool": tool}))
        .await?;
    runner
        .store
        .update_step(
            step_id,
            StepUpdate {
                status: Some(StepStatus::Running),
                error: Some(None),
                ..StepUpdate::default()
            },
        )
        .await?;

    let tool_ctx = ToolContext {
        workspace_root: ctx.ws_root.clone(),
        artifacts_dir: ctx.artifacts_dir.join(step_id),
        task_id: task_id.to_string(),
        step_id: step_id.to_string(),
    };
    match runner.tools.run_tool(&tool_ctx, tool, args).await {
        Ok(result) => {
            runner
                .store
                .update_step(
                    step_id,
                    StepUpdate {
                        status: Some(StepStatus::Succeeded),
                        result: Some(result.clone()),
                        ..StepUpdate::default()
                    },
                )
                .await?;
            mirror
                .emit(runner, Some(step_id), "tool.completed", json!({"tool": tool}))
                .await?;
            mirror
                .emit(runner, Some(step_id), "step.completed", json!({"node": tool}))
                .await?;
            Ok(format!(
                "Tool `{tool}` output:\n{}",
                tool_output_preview(&result)
            ))
        }
        Err(err) => {
            runner
                .store
                .update_step(
                    step_id,
                    StepUpdate {
                        status: Some(StepStatus::Failed),
                        error: Some(Some(err.to_string())),
                        ..StepUpdate::default()
                    },
                )
                .await?;
            mirror
                .emit(
                    runner,
                    Some(step_id),
                    "tool.failed",
                    json!({"tool": tool, "error": err.to_string()}),
                )
                .await?;
            mirror
                .emit(runner, Some(step_id), "step.failed", json!({"node": tool}))
                .await?;
            Ok(format!("Tool `{tool}` failed: {err}"))
        }
    }
}

/// Persist the interrupt, create the approval rendezvous, and park the task.
async fn raise_interrupt(
    runner: &Runner,
    task_id: &str,
    mirror: &mut EventMirror,
    call: &ToolCall,
    args: Value,
) -> anyhow::Result<()> {
    let interrupt_id = new_id();
    let resume_token = new_id();
    let idx = runner
        .store
        .max_step_idx(task_id)
        .await?
        .map(|m| m + 1)
        .unwrap_or(0);
    let now = now_iso();
    let step = Step {
        id: new_id(),
        task_id: task_id.to_string(),
        idx,
        name: format!("Approval: {}", call.name),
        tool: call.name.clone(),
        args: json!({"tool_call_id": call.id, "args": args}),
        status: StepStatus::WaitingApproval,
        requires_approval: true,
        result: None,
        error: None,
        created_at: now.clone(),
        updated_at: now,
    };
    runner.store.insert_step(&step).await?;

    mirror
        .emit(
            runner,
            Some(&step.id),
            "step.scheduled",
            json!({"node": step.name.clone()}),
        )
        .await?;
    mirror
        .emit(
            runner,
            Some(&step.id),
            "interrupt.raised",
            json!({
                "interrupt_id": interrupt_id.clone(),
                "resume_token": resume_token.clone(),
                "pending_tool_call_id": call.id.clone(),
                "pending_tool_name": call.name.clone(),
                "pending_args": step.args.clone(),
                "step_id": step.id.clone(),
            }),
        )
        .await?;

    runner
        .store
        .update_task(
            task_id,
            TaskUpdate {
                backend_interrupt_id: Some(Some(interrupt_id)),
                backend_resume_token: Some(Some(resume_token)),
                ..TaskUpdate::default()
            },
        )
        .await?;
    engine::pause_for_approval(runner, task_id, &step.id, &call.name).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_filter_keeps_loop_prefixes_only() {
        for keep in [
            "run.started",
            "step.completed",
            "llm.completed",
            "tool.failed",
            "approval.rejected",
            "interrupt.raised",
            "guardrail.failed",
            "mcp.connected",
            "handoff.requested",
        ] {
            assert!(should_mirror(keep), "{keep}");
        }
        for drop in ["chat_message", "task_update", "debug.trace", "runx"] {
            assert!(!should_mirror(drop), "{drop}");
        }
    }

    #[test]
    fn citations_goal_detection_spans_languages() {
        std::env::remove_var("WORKBENCH_CITATIONS_MODE");
        assert!(citations_required("write a research report on RISC-V"));
        assert!(citations_required("帮我做一个行业调研"));
        assert!(!citations_required("rename the files in my downloads folder"));
    }

    #[test]
    fn evidence_markers_recognized() {
        assert!(has_evidence_marker("see https://example.com/a"));
        assert!(has_evidence_marker("claim [source: notes.txt]"));
        assert!(!has_evidence_marker("no evidence here"));
    }

    #[test]
    fn tool_output_preview_truncates() {
        let value = json!({"content": "x".repeat(5000)});
        let preview = tool_output_preview(&value);
        assert!(preview.chars().count() <= TOOL_OUTPUT_PREVIEW + 3);
        assert!(preview.ends_with("..."));
    }
}
