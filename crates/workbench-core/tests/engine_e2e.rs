// End-to-end run-engine scenarios over a temp-dir store and a scripted chat
// provider: approval gating, ask-once scopes, plan patching, cancellation,
// continue-as-approve, the agent-loop interrupt/resume cycle, and cron
// materialization.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use workbench_core::config::Settings;
use workbench_core::permissions::{ApprovalDefaults, PolicyEngine};
use workbench_core::runner::{ContinueError, ContinueOutcome, Runner};
use workbench_core::scheduler;
use workbench_core::EventBus;
use workbench_providers::{ChatProvider, ChatRequest, ChatResponse, ToolCall};
use workbench_store::Store;
use workbench_tools::{register_builtin_tools, ShellOptions, ToolRegistry};
use workbench_types::{
    ApprovalStatus, Backend, Mode, PolicyScope, Skill, StepStatus, TaskStatus, Workspace,
    WorkspacePolicy,
};

fn text_response(text: impl Into<String>) -> ChatResponse {
    ChatResponse {
        content: text.into(),
        tool_calls: Vec::new(),
        raw: json!({}),
    }
}

fn tool_call_response(id: &str, name: &str, args: Value) -> ChatResponse {
    ChatResponse {
        content: String::new(),
        tool_calls: vec![ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: args.to_string(),
        }],
        raw: json!({}),
    }
}

/// Routes role calls by their system prompt: planner/executor/critic get
/// scripted JSON; everything else is an agent-loop turn.
struct ScriptedProvider {
    plan: Value,
    patches: Mutex<VecDeque<Value>>,
    critics: Mutex<VecDeque<Value>>,
    agent_turns: Mutex<VecDeque<ChatResponse>>,
}

impl ScriptedProvider {
    fn with_plan(plan: Value) -> Self {
        Self {
            plan,
            patches: Mutex::new(VecDeque::new()),
            critics: Mutex::new(VecDeque::new()),
            agent_turns: Mutex::new(VecDeque::new()),
        }
    }

    fn for_agent(turns: Vec<ChatResponse>) -> Self {
        Self {
            plan: json!({}),
            patches: Mutex::new(VecDeque::new()),
            critics: Mutex::new(VecDeque::new()),
            agent_turns: Mutex::new(turns.into()),
        }
    }

    fn push_patch(&self, patch: Value) {
        self.patches.try_lock().unwrap().push_back(patch);
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        let system = req
            .messages
            .first()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if system.contains("agent planner") {
            return Ok(text_response(self.plan.to_string()));
        }
        if system.contains("agent executor") {
            let next = self
                .patches
                .lock()
                .await
                .pop_front()
                .unwrap_or(json!({"patch": null}));
            return Ok(text_response(next.to_string()));
        }
        if system.contains("reviewer (critic)") {
            let next = self
                .critics
                .lock()
                .await
                .pop_front()
                .unwrap_or(json!({"ok": true, "issues": [], "fix_steps": []}));
            return Ok(text_response(next.to_string()));
        }
        let next = self
            .agent_turns
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| text_response("done"));
        Ok(next)
    }
}

struct Harness {
    runner: Arc<Runner>,
    store: Arc<Store>,
    workspace: Workspace,
    skill: Skill,
    ws_dir: PathBuf,
    data_dir: PathBuf,
    _dir: tempfile::TempDir,
}

async fn harness(provider: ScriptedProvider, allowed_tools: &[&str]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let ws_dir = dir.path().join("w1");
    std::fs::create_dir_all(&ws_dir).unwrap();

    let store = Arc::new(
        Store::open(&data_dir.join("workbench.db"), EventBus::new())
            .await
            .unwrap(),
    );
    let tools = ToolRegistry::new();
    register_builtin_tools(
        &tools,
        ShellOptions {
            enabled: false,
            ..ShellOptions::default()
        },
    )
    .await
    .unwrap();

    let settings = Arc::new(Settings {
        data_dir: data_dir.clone(),
        db_path: data_dir.join("workbench.db"),
        workspaces_dir: data_dir.join("workspaces"),
        artifacts_dir: data_dir.join("artifacts"),
        logs_dir: data_dir.join("logs"),
        llm_base_url: "http://localhost:1/v1".to_string(),
        llm_api_key: "test".to_string(),
        model_fast: "fast-model".to_string(),
        model_pro: "pro-model".to_string(),
        require_approval_shell: true,
        require_approval_fs_write: true,
        require_approval_fs_delete: true,
        require_approval_browser_click: true,
        scheduler_enabled: false,
        scheduler_tick_seconds: 5,
        shell_allow: false,
        shell_container_image: None,
        browser_enabled: false,
        browser_headless: true,
        browser_timeout_ms: 45_000,
        ui_admin_token: None,
        log_retention_days: 14,
    });
    let policy = Arc::new(PolicyEngine::new(store.clone(), ApprovalDefaults::default()));
    let runner = Runner::new(
        store.clone(),
        tools,
        policy,
        Arc::new(provider),
        settings,
    );

    let workspace = store
        .create_workspace("W1", ws_dir.to_str().unwrap())
        .await
        .unwrap();
    let skill_tools: Vec<String> = allowed_tools.iter().map(|s| s.to_string()).collect();
    let skill = store
        .create_skill(
            "S1",
            None,
            None,
            "You write files under <workspace_root>.",
            &skill_tools,
            Mode::Fast,
        )
        .await
        .unwrap();

    Harness {
        runner,
        store,
        workspace,
        skill,
        ws_dir,
        data_dir,
        _dir: dir,
    }
}

async fn wait_for_status(store: &Store, task_id: &str, expected: TaskStatus) -> TaskStatus {
    for _ in 0..250 {
        let task = store.get_task(task_id).await.unwrap();
        if task.status == expected {
            return task.status;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    store.get_task(task_id).await.unwrap().status
}

fn write_step(name: &str, path: &str, content: &str, requires_approval: bool) -> Value {
    json!({
        "name": name,
        "tool": "filesystem.write_text",
        "args": {"path": path, "content": content},
        "requires_approval": requires_approval,
    })
}

fn single_write_plan() -> Value {
    json!({
        "summary": "Write a note",
        "artifacts": [{"path": "notes.txt", "description": "the note"}],
        "steps": [write_step("Write notes", "notes.txt", "hi", true)],
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn approval_gate_drives_write_to_success() {
    let h = harness(
        ScriptedProvider::with_plan(single_write_plan()),
        &["filesystem.write_text"],
    )
    .await;
    let task = h
        .store
        .create_task(&h.workspace.id, &h.skill.id, "Create notes.txt with 'hi'", Mode::Fast, None)
        .await
        .unwrap();
    h.runner.start_task_background(&task.id);

    assert_eq!(
        wait_for_status(&h.store, &task.id, TaskStatus::WaitingApproval).await,
        TaskStatus::WaitingApproval
    );
    // Invariant: waiting_approval implies a pending approval on a waiting step.
    let approval = h.store.latest_pending_approval(&task.id).await.unwrap().unwrap();
    let step = h.store.get_step(&approval.step_id).await.unwrap();
    assert_eq!(step.status, StepStatus::WaitingApproval);
    assert!(!h.ws_dir.join("notes.txt").exists());

    let changed = h
        .runner
        .approve_step(&task.id, &approval.step_id, "approve", None)
        .await
        .unwrap();
    assert!(changed);

    assert_eq!(
        wait_for_status(&h.store, &task.id, TaskStatus::Succeeded).await,
        TaskStatus::Succeeded
    );
    assert_eq!(
        std::fs::read_to_string(h.ws_dir.join("notes.txt")).unwrap(),
        "hi"
    );
    // The engine completed a critic iteration, so the report exists; no tool
    // wrote artifacts, so the artifact directory does not.
    let final_task = h.store.get_task(&task.id).await.unwrap();
    let report = PathBuf::from(final_task.output_path.unwrap());
    assert!(report.ends_with("report.md"));
    assert!(report.exists());
    assert!(report.with_extension("html").exists());
    assert!(!h.data_dir.join("artifacts").join(&task.id).exists());

    // Re-approving the same step is a no-op.
    let again = h
        .runner
        .approve_step(&task.id, &approval.step_id, "approve", None)
        .await
        .unwrap();
    assert!(!again);
}

#[tokio::test(flavor = "multi_thread")]
async fn ask_once_scope_needs_exactly_one_approval() {
    let plan = json!({
        "summary": "Write two notes",
        "artifacts": [],
        "steps": [
            write_step("first", "a.txt", "1", true),
            write_step("second", "b.txt", "2", true),
        ],
    });
    let h = harness(ScriptedProvider::with_plan(plan), &["filesystem.write_text"]).await;
    h.store
        .set_policy(&h.workspace.id, PolicyScope::FsWrite, WorkspacePolicy::AskOnce)
        .await
        .unwrap();
    let task = h
        .store
        .create_task(&h.workspace.id, &h.skill.id, "two writes", Mode::Fast, None)
        .await
        .unwrap();
    h.runner.start_task_background(&task.id);

    wait_for_status(&h.store, &task.id, TaskStatus::WaitingApproval).await;
    let approval = h.store.latest_pending_approval(&task.id).await.unwrap().unwrap();
    h.runner
        .approve_step(&task.id, &approval.step_id, "approve", None)
        .await
        .unwrap();

    assert_eq!(
        wait_for_status(&h.store, &task.id, TaskStatus::Succeeded).await,
        TaskStatus::Succeeded
    );
    assert!(h.ws_dir.join("a.txt").exists());
    assert!(h.ws_dir.join("b.txt").exists());
    // The second write rode the ask-once grant: one approval row total.
    let approvals = h.store.list_approvals(&task.id).await.unwrap();
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].status, ApprovalStatus::Approved);
}

#[tokio::test(flavor = "multi_thread")]
async fn executor_patch_appends_step_and_logs_event() {
    let plan = json!({
        "summary": "One write, then patched",
        "artifacts": [],
        "steps": [write_step("first", "a.txt", "1", false)],
    });
    let provider = ScriptedProvider::with_plan(plan);
    provider.push_patch(json!({
        "patch": {
            "reason": "missing dependency file",
            "add_steps": [write_step("patched", "dep.txt", "dep", false)],
            "replace_steps_from_idx": null,
            "remove_steps": [],
        }
    }));
    let h = harness(provider, &["filesystem.write_text"]).await;
    h.store
        .set_policy(&h.workspace.id, PolicyScope::FsWrite, WorkspacePolicy::AlwaysAllow)
        .await
        .unwrap();
    let task = h
        .store
        .create_task(&h.workspace.id, &h.skill.id, "patch me", Mode::Fast, None)
        .await
        .unwrap();
    h.runner.start_task_background(&task.id);

    assert_eq!(
        wait_for_status(&h.store, &task.id, TaskStatus::Succeeded).await,
        TaskStatus::Succeeded
    );
    let steps = h.store.list_steps(&task.id).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert!(steps.len() <= 25);
    assert!(h.ws_dir.join("dep.txt").exists());

    // Replay shows the patch.
    let events = h.store.list_events(&task.id, 0, 500, false).await.unwrap();
    assert!(events.iter().any(|e| {
        e.event_type == "agent_event" && e.payload["event"]["type"] == "plan.patched"
    }));
}

#[tokio::test(flavor = "multi_thread")]
async fn critic_fix_steps_run_in_second_iteration() {
    let plan = json!({
        "summary": "Write then fix",
        "artifacts": [],
        "steps": [write_step("first", "a.txt", "1", false)],
    });
    let provider = ScriptedProvider::with_plan(plan);
    provider.critics.try_lock().unwrap().push_back(json!({
        "ok": false,
        "issues": ["missing summary file"],
        "fix_steps": [write_step("fix", "summary.txt", "done", false)],
    }));
    let h = harness(provider, &["filesystem.write_text"]).await;
    h.store
        .set_policy(&h.workspace.id, PolicyScope::FsWrite, WorkspacePolicy::AlwaysAllow)
        .await
        .unwrap();
    let task = h
        .store
        .create_task(&h.workspace.id, &h.skill.id, "fix loop", Mode::Fast, None)
        .await
        .unwrap();
    h.runner.start_task_background(&task.id);

    assert_eq!(
        wait_for_status(&h.store, &task.id, TaskStatus::Succeeded).await,
        TaskStatus::Succeeded
    );
    assert!(h.ws_dir.join("summary.txt").exists());
    assert_eq!(h.store.list_steps(&task.id).await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_during_wait_is_sticky() {
    let h = harness(
        ScriptedProvider::with_plan(single_write_plan()),
        &["filesystem.write_text"],
    )
    .await;
    let task = h
        .store
        .create_task(&h.workspace.id, &h.skill.id, "to be canceled", Mode::Fast, None)
        .await
        .unwrap();
    h.runner.start_task_background(&task.id);
    wait_for_status(&h.store, &task.id, TaskStatus::WaitingApproval).await;

    assert!(h.runner.cancel_task(&task.id, None).await.unwrap());
    assert_eq!(
        h.store.get_task(&task.id).await.unwrap().status,
        TaskStatus::Canceled
    );

    // A late approval records the decision but must not resume the run.
    let approval = h.store.latest_pending_approval(&task.id).await.unwrap().unwrap();
    h.runner
        .approve_step(&task.id, &approval.step_id, "approve", None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let task_after = h.store.get_task(&task.id).await.unwrap();
    assert_eq!(task_after.status, TaskStatus::Canceled);
    assert!(!h.ws_dir.join("notes.txt").exists());

    // Canceling again is fine and terminal states stay put.
    assert!(h.runner.cancel_task(&task.id, None).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn continue_message_acts_as_approval_in_both_languages() {
    let h = harness(
        ScriptedProvider::with_plan(single_write_plan()),
        &["filesystem.write_text"],
    )
    .await;
    let task = h
        .store
        .create_task(&h.workspace.id, &h.skill.id, "approve via chat", Mode::Fast, None)
        .await
        .unwrap();
    h.runner.start_task_background(&task.id);
    wait_for_status(&h.store, &task.id, TaskStatus::WaitingApproval).await;

    let outcome = h.runner.continue_task(&task.id, "同意").await.unwrap();
    match outcome {
        ContinueOutcome::ApprovalDecision { decision, .. } => assert_eq!(decision, "approve"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(
        wait_for_status(&h.store, &task.id, TaskStatus::Succeeded).await,
        TaskStatus::Succeeded
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn continue_message_rejects_in_chinese() {
    let h = harness(
        ScriptedProvider::with_plan(single_write_plan()),
        &["filesystem.write_text"],
    )
    .await;
    let task = h
        .store
        .create_task(&h.workspace.id, &h.skill.id, "reject via chat", Mode::Fast, None)
        .await
        .unwrap();
    h.runner.start_task_background(&task.id);
    wait_for_status(&h.store, &task.id, TaskStatus::WaitingApproval).await;

    let outcome = h.runner.continue_task(&task.id, "拒绝").await.unwrap();
    match outcome {
        ContinueOutcome::ApprovalDecision { decision, .. } => assert_eq!(decision, "reject"),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(
        wait_for_status(&h.store, &task.id, TaskStatus::Failed).await,
        TaskStatus::Failed
    );
    let task = h.store.get_task(&task.id).await.unwrap();
    assert!(task.error.unwrap().starts_with("Rejected by user"));

    // An ambiguous message while waiting is a decision error, not a crash.
    let err = h.runner.continue_task(&task.id, "maybe").await;
    assert!(matches!(err, Err(ContinueError::UnsupportedBackend)));
}

#[tokio::test(flavor = "multi_thread")]
async fn agent_loop_interrupt_resume_cycle() {
    let provider = ScriptedProvider::for_agent(vec![
        tool_call_response(
            "call_1",
            "filesystem.write_text",
            json!({"path": "notes.txt", "content": "hi"}),
        ),
        text_response("Created notes.txt with the requested content."),
    ]);
    let h = harness(provider, &[]).await;
    let task = h
        .store
        .create_task(
            &h.workspace.id,
            &h.skill.id,
            "Create notes.txt with 'hi'",
            Mode::Fast,
            Some(Backend::AgentLoop),
        )
        .await
        .unwrap();
    h.runner.start_task_background(&task.id);

    assert_eq!(
        wait_for_status(&h.store, &task.id, TaskStatus::WaitingApproval).await,
        TaskStatus::WaitingApproval
    );
    let paused = h.store.get_task(&task.id).await.unwrap();
    assert!(paused.backend_interrupt_id.is_some());
    assert!(paused.backend_resume_token.is_some());
    let approval = h.store.latest_pending_approval(&task.id).await.unwrap().unwrap();
    let step = h.store.get_step(&approval.step_id).await.unwrap();
    assert_eq!(step.tool, "filesystem.write_text");
    assert_eq!(step.status, StepStatus::WaitingApproval);

    h.runner
        .approve_step(&task.id, &approval.step_id, "approve", None)
        .await
        .unwrap();

    assert_eq!(
        wait_for_status(&h.store, &task.id, TaskStatus::Succeeded).await,
        TaskStatus::Succeeded
    );
    assert_eq!(
        std::fs::read_to_string(h.ws_dir.join("notes.txt")).unwrap(),
        "hi"
    );
    let done = h.store.get_task(&task.id).await.unwrap();
    assert!(done.backend_interrupt_id.is_none());
    assert!(done.backend_resume_token.is_none());
    assert!(done.output_path.is_some());

    // The loop's timeline was mirrored into the event log.
    let events = h.store.list_events(&task.id, 0, 500, false).await.unwrap();
    let agent_types: Vec<String> = events
        .iter()
        .filter(|e| e.event_type == "agent_event")
        .filter_map(|e| e.payload["event"]["type"].as_str().map(str::to_string))
        .collect();
    assert!(agent_types.iter().any(|t| t == "run.started"));
    assert!(agent_types.iter().any(|t| t == "interrupt.raised"));
    assert!(agent_types.iter().any(|t| t == "interrupt.resumed"));
    assert!(agent_types.iter().any(|t| t == "run.completed"));

    // The final assistant message landed in the chat history.
    assert!(events.iter().any(|e| {
        e.event_type == "chat_message"
            && e.payload["role"] == "assistant"
            && e.payload["content"]
                .as_str()
                .unwrap_or("")
                .contains("Created notes.txt")
    }));

    // Submitting the same decision again is a no-op.
    let again = h
        .runner
        .approve_step(&task.id, &approval.step_id, "approve", None)
        .await
        .unwrap();
    assert!(!again);
}

#[tokio::test(flavor = "multi_thread")]
async fn agent_loop_reject_lets_model_observe_denial() {
    let provider = ScriptedProvider::for_agent(vec![
        tool_call_response(
            "call_1",
            "filesystem.write_text",
            json!({"path": "notes.txt", "content": "hi"}),
        ),
        text_response("Understood; the write was not permitted, so nothing was changed."),
    ]);
    let h = harness(provider, &[]).await;
    let task = h
        .store
        .create_task(
            &h.workspace.id,
            &h.skill.id,
            "try a write",
            Mode::Fast,
            Some(Backend::AgentLoop),
        )
        .await
        .unwrap();
    h.runner.start_task_background(&task.id);
    wait_for_status(&h.store, &task.id, TaskStatus::WaitingApproval).await;

    let approval = h.store.latest_pending_approval(&task.id).await.unwrap().unwrap();
    h.runner
        .approve_step(&task.id, &approval.step_id, "reject", Some("not now"))
        .await
        .unwrap();

    // The loop resumes with the denial and finishes naturally.
    assert_eq!(
        wait_for_status(&h.store, &task.id, TaskStatus::Succeeded).await,
        TaskStatus::Succeeded
    );
    assert!(!h.ws_dir.join("notes.txt").exists());
    let step = h.store.get_step(&approval.step_id).await.unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert!(step.error.unwrap().starts_with("Rejected by user"));
}

#[tokio::test(flavor = "multi_thread")]
async fn cron_schedule_materializes_a_task() {
    let plan = json!({
        "summary": "noop",
        "artifacts": [],
        "steps": [write_step("write", "tick.txt", "t", false)],
    });
    let h = harness(ScriptedProvider::with_plan(plan), &["filesystem.write_text"]).await;
    h.store
        .set_policy(&h.workspace.id, PolicyScope::FsWrite, WorkspacePolicy::AlwaysAllow)
        .await
        .unwrap();
    let schedule = h
        .store
        .create_schedule(
            "every-minute",
            "*/1 * * * *",
            &h.workspace.id,
            &h.skill.id,
            Mode::Fast,
            true,
            Some(json!({"goal": "scheduled goal"})),
        )
        .await
        .unwrap();

    let now = chrono::Utc::now();
    // First tick backfills next_run_at; second tick fires it.
    scheduler::tick_at(&h.runner, now).await.unwrap();
    let backfilled = h.store.get_schedule(&schedule.id).await.unwrap();
    assert!(backfilled.next_run_at.is_some());
    assert!(backfilled.last_run_at.is_none());

    scheduler::tick_at(&h.runner, now + chrono::Duration::minutes(2))
        .await
        .unwrap();
    let fired = h.store.get_schedule(&schedule.id).await.unwrap();
    assert!(fired.last_run_at.is_some());
    assert!(fired.next_run_at.unwrap() > fired.last_run_at.unwrap());

    let tasks = h.store.list_tasks().await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].goal, "scheduled goal");
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_cron_disables_schedule() {
    let h = harness(ScriptedProvider::with_plan(json!({})), &[]).await;
    let schedule = h
        .store
        .create_schedule(
            "broken",
            "not a cron",
            &h.workspace.id,
            &h.skill.id,
            Mode::Fast,
            true,
            None,
        )
        .await
        .unwrap();
    scheduler::tick_at(&h.runner, chrono::Utc::now()).await.unwrap();
    let after = h.store.get_schedule(&schedule.id).await.unwrap();
    assert!(!after.enabled);
}
