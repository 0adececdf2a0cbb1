// Workbench Types
// Core type definitions shared by the store, engines, and boundary API.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Entity ids are hyphenless UUIDv4 strings.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Second-resolution UTC timestamp, the store's canonical time format.
pub fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// ============================================================================
// Modes & Backends
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Fast,
    Pro,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Fast => "fast",
            Mode::Pro => "pro",
        }
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Fast
    }
}

impl FromStr for Mode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fast" => Ok(Mode::Fast),
            "pro" => Ok(Mode::Pro),
            _ => Err(()),
        }
    }
}

/// Which run engine drives a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Classic,
    AgentLoop,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Classic => "classic",
            Backend::AgentLoop => "agent_loop",
        }
    }
}

impl FromStr for Backend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "classic" => Ok(Backend::Classic),
            "agent_loop" | "agent-loop" => Ok(Backend::AgentLoop),
            _ => Err(()),
        }
    }
}

// ============================================================================
// Statuses
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Planning,
    Running,
    WaitingApproval,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Planning => "planning",
            TaskStatus::Running => "running",
            TaskStatus::WaitingApproval => "waiting_approval",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    /// Terminal statuses are sticky: once reached, no further updates apply.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

impl FromStr for TaskStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "queued" => Ok(TaskStatus::Queued),
            "planning" => Ok(TaskStatus::Planning),
            "running" => Ok(TaskStatus::Running),
            "waiting_approval" => Ok(TaskStatus::WaitingApproval),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "canceled" => Ok(TaskStatus::Canceled),
            _ => Err(()),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    WaitingApproval,
    Succeeded,
    Failed,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::WaitingApproval => "waiting_approval",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
        }
    }
}

impl FromStr for StepStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "waiting_approval" => Ok(StepStatus::WaitingApproval),
            "succeeded" => Ok(StepStatus::Succeeded),
            "failed" => Ok(StepStatus::Failed),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for ApprovalStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            _ => Err(()),
        }
    }
}

// ============================================================================
// Entities
// ============================================================================

/// A filesystem directory that bounds a task's file tools and holds outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub path: String,
    pub created_at: String,
}

/// A prompt + tool-allowlist profile specializing the engine for one class of goal.
/// An empty `allowed_tools` means "all registered tools".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub source_file: Option<String>,
    pub system_prompt: String,
    pub allowed_tools: Vec<String>,
    pub default_mode: Mode,
    pub created_at: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub workspace_id: String,
    pub skill_id: String,
    pub status: TaskStatus,
    pub mode: Mode,
    pub goal: String,
    pub plan: Option<Plan>,
    pub current_step: i64,
    pub output_path: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<Backend>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_interrupt_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_resume_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_last_offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub task_id: String,
    pub idx: i64,
    pub name: String,
    pub tool: String,
    pub args: Value,
    pub status: StepStatus,
    pub requires_approval: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A persisted request for user consent before one step runs.
/// At most one pending approval exists per step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub task_id: String,
    pub step_id: String,
    pub status: ApprovalStatus,
    pub requested_at: String,
    pub decided_at: Option<String>,
    pub decision: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    pub cron_expr: String,
    pub workspace_id: String,
    pub skill_id: String,
    pub mode: Mode,
    pub enabled: bool,
    pub payload: Option<Value>,
    pub next_run_at: Option<String>,
    pub last_run_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// External subprocess advertising tools under `mcp/<name>/<tool>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerEntry {
    pub id: String,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub healthcheck_args: Vec<String>,
    pub enabled: bool,
    pub created_at: String,
    pub updated_at: String,
}

// ============================================================================
// Permission policies
// ============================================================================

/// Coarse permission domain a tool belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyScope {
    Shell,
    FsRead,
    FsWrite,
    FsDelete,
    BrowserClick,
    Network,
    Mcp,
    Other,
}

impl PolicyScope {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyScope::Shell => "shell",
            PolicyScope::FsRead => "fs_read",
            PolicyScope::FsWrite => "fs_write",
            PolicyScope::FsDelete => "fs_delete",
            PolicyScope::BrowserClick => "browser_click",
            PolicyScope::Network => "network",
            PolicyScope::Mcp => "mcp",
            PolicyScope::Other => "other",
        }
    }

    pub const ALL: [PolicyScope; 8] = [
        PolicyScope::Shell,
        PolicyScope::FsRead,
        PolicyScope::FsWrite,
        PolicyScope::FsDelete,
        PolicyScope::BrowserClick,
        PolicyScope::Network,
        PolicyScope::Mcp,
        PolicyScope::Other,
    ];
}

impl FromStr for PolicyScope {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "shell" => Ok(PolicyScope::Shell),
            "fs_read" => Ok(PolicyScope::FsRead),
            "fs_write" => Ok(PolicyScope::FsWrite),
            "fs_delete" => Ok(PolicyScope::FsDelete),
            "browser_click" => Ok(PolicyScope::BrowserClick),
            "network" => Ok(PolicyScope::Network),
            "mcp" => Ok(PolicyScope::Mcp),
            "other" => Ok(PolicyScope::Other),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspacePolicy {
    AskOnce,
    AlwaysAllow,
    AlwaysDeny,
}

impl WorkspacePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkspacePolicy::AskOnce => "ask_once",
            WorkspacePolicy::AlwaysAllow => "always_allow",
            WorkspacePolicy::AlwaysDeny => "always_deny",
        }
    }
}

impl FromStr for WorkspacePolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ask_once" => Ok(WorkspacePolicy::AskOnce),
            "always_allow" => Ok(WorkspacePolicy::AlwaysAllow),
            "always_deny" => Ok(WorkspacePolicy::AlwaysDeny),
            _ => Err(()),
        }
    }
}

// ============================================================================
// Plans
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanArtifact {
    pub path: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub name: String,
    pub tool: String,
    pub args: Value,
    #[serde(default)]
    pub requires_approval: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub artifacts: Vec<PlanArtifact>,
    pub steps: Vec<PlanStep>,
}

/// Structured modification to the step list proposed between steps.
///
/// `remove_steps` is applied before `replace_steps_from_idx`, so a patch that
/// sets both may delete steps outside the replaced range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPatch {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub add_steps: Vec<PlanStep>,
    #[serde(default)]
    pub replace_steps_from_idx: Option<i64>,
    #[serde(default)]
    pub remove_steps: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriticVerdict {
    pub ok: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub fix_steps: Vec<PlanStep>,
}

// ============================================================================
// Events
// ============================================================================

/// In-memory bus record, also the SSE wire shape: `{type, data, ts}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub ts: f64,
}

impl EngineEvent {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            ts: Utc::now().timestamp_millis() as f64 / 1000.0,
        }
    }
}

/// Durable event-log row. `seq` is the per-task replay cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: i64,
    pub id: String,
    pub task_id: String,
    pub step_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub ts: f64,
    pub created_at: String,
}

// ============================================================================
// Tests
// ============================================================================
