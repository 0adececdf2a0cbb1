// Workbench Store
// Single-file SQLite persistence: entities, event log, workspace policies.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;

use workbench_types::{
    new_id, now_iso, Approval, ApprovalStatus, Backend, EngineEvent, EventRecord, McpServerEntry,
    Mode, Plan, PlanStep, PolicyScope, Schedule, Skill, Step, StepStatus, Task, TaskStatus,
    Workspace, WorkspacePolicy,
};

mod bus;

pub use bus::EventBus;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database is busy, please retry")]
    Busy,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const WRITE_RETRY_ATTEMPTS: u64 = 6;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS workspaces (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    path TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS skills (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT,
    source_file TEXT,
    system_prompt TEXT NOT NULL,
    allowed_tools_json TEXT NOT NULL,
    default_mode TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS skill_meta (
    skill_id TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL DEFAULT 1,
    source TEXT,
    updated_at TEXT NOT NULL,
    FOREIGN KEY(skill_id) REFERENCES skills(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    workspace_id TEXT NOT NULL,
    skill_id TEXT NOT NULL,
    status TEXT NOT NULL,
    mode TEXT NOT NULL,
    goal TEXT NOT NULL,
    plan_json TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    current_step INTEGER NOT NULL DEFAULT 0,
    output_path TEXT,
    error TEXT,
    FOREIGN KEY(workspace_id) REFERENCES workspaces(id) ON DELETE CASCADE,
    FOREIGN KEY(skill_id) REFERENCES skills(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS steps (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    idx INTEGER NOT NULL,
    name TEXT NOT NULL,
    tool TEXT NOT NULL,
    args_json TEXT NOT NULL,
    status TEXT NOT NULL,
    requires_approval INTEGER NOT NULL DEFAULT 0,
    result_json TEXT,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY(task_id) REFERENCES tasks(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS approvals (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    step_id TEXT NOT NULL,
    status TEXT NOT NULL,
    requested_at TEXT NOT NULL,
    decided_at TEXT,
    decision TEXT,
    reason TEXT,
    FOREIGN KEY(task_id) REFERENCES tasks(id) ON DELETE CASCADE,
    FOREIGN KEY(step_id) REFERENCES steps(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS schedules (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    cron_expr TEXT NOT NULL,
    workspace_id TEXT NOT NULL,
    skill_id TEXT NOT NULL,
    mode TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    payload_json TEXT,
    next_run_at TEXT,
    last_run_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY(workspace_id) REFERENCES workspaces(id) ON DELETE CASCADE,
    FOREIGN KEY(skill_id) REFERENCES skills(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS event_log (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    step_id TEXT,
    type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    ts REAL NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY(task_id) REFERENCES tasks(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_event_log_task ON event_log (task_id);

CREATE TABLE IF NOT EXISTS workspace_policies (
    workspace_id TEXT NOT NULL,
    scope TEXT NOT NULL,
    policy TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (workspace_id, scope),
    FOREIGN KEY(workspace_id) REFERENCES workspaces(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS mcp_servers (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    command TEXT NOT NULL,
    args_json TEXT NOT NULL,
    env_json TEXT NOT NULL,
    healthcheck_args_json TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_steps_task ON steps(task_id);
CREATE INDEX IF NOT EXISTS idx_approvals_task ON approvals(task_id);
";

// Backend columns arrived after the first schema version. SQLite has no
// IF NOT EXISTS for columns, so these run every startup and duplicate-column
// errors are swallowed.
const MIGRATIONS: &[&str] = &[
    "ALTER TABLE tasks ADD COLUMN backend TEXT;",
    "ALTER TABLE tasks ADD COLUMN backend_run_id TEXT;",
    "ALTER TABLE tasks ADD COLUMN backend_thread_id TEXT;",
    "ALTER TABLE tasks ADD COLUMN backend_interrupt_id TEXT;",
    "ALTER TABLE tasks ADD COLUMN backend_resume_token TEXT;",
    "ALTER TABLE tasks ADD COLUMN backend_last_offset INTEGER;",
];

/// Partial task update. `Some(None)` on a nested option clears the column.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub plan: Option<Plan>,
    pub current_step: Option<i64>,
    pub output_path: Option<String>,
    pub error: Option<Option<String>>,
    pub backend: Option<Backend>,
    pub backend_run_id: Option<String>,
    pub backend_thread_id: Option<String>,
    pub backend_interrupt_id: Option<Option<String>>,
    pub backend_resume_token: Option<Option<String>>,
    pub backend_last_offset: Option<i64>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(TaskStatus::Failed),
            error: Some(Some(message.into())),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StepUpdate {
    pub status: Option<StepStatus>,
    pub name: Option<String>,
    pub requires_approval: Option<bool>,
    pub result: Option<Value>,
    pub error: Option<Option<String>>,
}

impl StepUpdate {
    pub fn status(status: StepStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Durable persistence plus the process-local event bus. State-changing task
/// and step updates append to the event log and publish on the bus only after
/// the row change has committed.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    bus: EventBus,
    db_path: PathBuf,
}

impl Store {
    pub async fn open(db_path: &Path, bus: EventBus) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        // WAL can fail transiently while the file is being created.
        if conn
            .query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .is_err()
        {
            conn.query_row("PRAGMA journal_mode = DELETE", [], |_| Ok(()))?;
        }
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        conn.execute_batch(SCHEMA)?;
        for ddl in MIGRATIONS {
            if let Err(err) = conn.execute(ddl, []) {
                let text = err.to_string().to_lowercase();
                if !text.contains("duplicate column") {
                    return Err(err.into());
                }
            }
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            bus,
            db_path: db_path.to_path_buf(),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Run an operation, retrying on `busy`/`locked` with linear backoff.
    async fn with_retry<T, F>(&self, op: F) -> Result<T>
    where
        F: Fn(&Connection) -> rusqlite::Result<T>,
    {
        for attempt in 1..=WRITE_RETRY_ATTEMPTS {
            let result = {
                let conn = self.conn.lock().await;
                op(&conn)
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) if is_busy(&err) && attempt < WRITE_RETRY_ATTEMPTS => {
                    tokio::time::sleep(Duration::from_millis(150 * attempt)).await;
                }
                Err(err) if is_busy(&err) => {
                    tracing::warn!("store write still contended after retries: {err}");
                    return Err(StoreError::Busy);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::Busy)
    }

    // ------------------------------------------------------------------
    // Workspaces
    // ------------------------------------------------------------------

    pub async fn create_workspace(&self, name: &str, path: &str) -> Result<Workspace> {
        let ws = Workspace {
            id: new_id(),
            name: name.to_string(),
            path: path.to_string(),
            created_at: now_iso(),
        };
        let row = ws.clone();
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT INTO workspaces (id, name, path, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![row.id, row.name, row.path, row.created_at],
            )
        })
        .await?;
        Ok(ws)
    }

    pub async fn get_workspace(&self, id: &str) -> Result<Workspace> {
        let id = id.to_string();
        self.with_retry(move |conn| {
            conn.query_row(
                "SELECT id, name, path, created_at FROM workspaces WHERE id = ?1",
                params![id],
                workspace_from_row,
            )
            .optional()
        })
        .await?
        .ok_or(StoreError::NotFound("workspace"))
    }

    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        self.with_retry(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, path, created_at FROM workspaces ORDER BY created_at ASC",
            )?;
            let rows = stmt.query_map([], workspace_from_row)?;
            rows.collect()
        })
        .await
    }

    pub async fn delete_workspace(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_retry(move |conn| conn.execute("DELETE FROM workspaces WHERE id = ?1", params![id]))
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Skills
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn create_skill(
        &self,
        name: &str,
        description: Option<&str>,
        source_file: Option<&str>,
        system_prompt: &str,
        allowed_tools: &[String],
        default_mode: Mode,
    ) -> Result<Skill> {
        let skill = Skill {
            id: new_id(),
            name: name.to_string(),
            description: description.map(str::to_string),
            source_file: source_file.map(str::to_string),
            system_prompt: system_prompt.to_string(),
            allowed_tools: allowed_tools.to_vec(),
            default_mode,
            created_at: now_iso(),
            enabled: true,
        };
        let row = skill.clone();
        let tools_json = serde_json::to_string(&row.allowed_tools)?;
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT INTO skills (id, name, description, source_file, system_prompt, allowed_tools_json, default_mode, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    row.id,
                    row.name,
                    row.description,
                    row.source_file,
                    row.system_prompt,
                    tools_json,
                    row.default_mode.as_str(),
                    row.created_at
                ],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO skill_meta (skill_id, enabled, source, updated_at) VALUES (?1, 1, ?2, ?3)",
                params![row.id, row.source_file.clone().unwrap_or_default(), row.created_at],
            )
        })
        .await?;
        Ok(skill)
    }

    pub async fn get_skill(&self, id: &str) -> Result<Skill> {
        let id = id.to_string();
        self.with_retry(move |conn| {
            conn.query_row(
                &format!("{SKILL_SELECT} WHERE s.id = ?1"),
                params![id],
                skill_from_row,
            )
            .optional()
        })
        .await?
        .ok_or(StoreError::NotFound("skill"))
    }

    pub async fn list_skills(&self, enabled_only: bool) -> Result<Vec<Skill>> {
        self.with_retry(move |conn| {
            let sql = if enabled_only {
                format!("{SKILL_SELECT} WHERE COALESCE(m.enabled, 1) = 1 ORDER BY s.created_at ASC")
            } else {
                format!("{SKILL_SELECT} ORDER BY s.created_at ASC")
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], skill_from_row)?;
            rows.collect()
        })
        .await
    }

    pub async fn set_skill_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let id = id.to_string();
        let now = now_iso();
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT INTO skill_meta (skill_id, enabled, source, updated_at) VALUES (?1, ?2, '', ?3)
                 ON CONFLICT(skill_id) DO UPDATE SET enabled = excluded.enabled, updated_at = excluded.updated_at",
                params![id, enabled as i64, now],
            )
        })
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    pub async fn create_task(
        &self,
        workspace_id: &str,
        skill_id: &str,
        goal: &str,
        mode: Mode,
        backend: Option<Backend>,
    ) -> Result<Task> {
        let now = now_iso();
        let task = Task {
            id: new_id(),
            workspace_id: workspace_id.to_string(),
            skill_id: skill_id.to_string(),
            status: TaskStatus::Queued,
            mode,
            goal: goal.to_string(),
            plan: None,
            current_step: 0,
            output_path: None,
            error: None,
            created_at: now.clone(),
            updated_at: now,
            backend,
            backend_run_id: None,
            backend_thread_id: None,
            backend_interrupt_id: None,
            backend_resume_token: None,
            backend_last_offset: None,
        };
        let row = task.clone();
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT INTO tasks (id, workspace_id, skill_id, status, mode, goal, plan_json, created_at, updated_at, current_step, output_path, error, backend)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, 0, NULL, NULL, ?9)",
                params![
                    row.id,
                    row.workspace_id,
                    row.skill_id,
                    row.status.as_str(),
                    row.mode.as_str(),
                    row.goal,
                    row.created_at,
                    row.updated_at,
                    row.backend.map(|b| b.as_str()),
                ],
            )
        })
        .await?;

        // Seed the chat history with the goal as the first user turn.
        self.append_chat_message(&task.id, None, "user", goal).await?;
        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> Result<Task> {
        let id = id.to_string();
        self.with_retry(move |conn| {
            conn.query_row(
                &format!("{TASK_SELECT} WHERE id = ?1"),
                params![id],
                task_from_row,
            )
            .optional()
        })
        .await?
        .ok_or(StoreError::NotFound("task"))
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.with_retry(|conn| {
            let mut stmt =
                conn.prepare(&format!("{TASK_SELECT} ORDER BY created_at DESC"))?;
            let rows = stmt.query_map([], task_from_row)?;
            rows.collect()
        })
        .await
    }

    /// Atomic field update. After commit, appends a `task_update` event-log row
    /// and publishes the same event on the bus.
    pub async fn update_task(&self, task_id: &str, update: TaskUpdate) -> Result<()> {
        let (mut sets, mut values, fields) = task_update_parts(&update)?;
        let now = now_iso();
        sets.push("updated_at = ?");
        values.push(Box::new(now));
        let sql = format!("UPDATE tasks SET {} WHERE id = ?", sets.join(", "));
        let id = task_id.to_string();
        values.push(Box::new(id));
        self.with_retry(move |conn| {
            conn.execute(
                &sql,
                rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
            )
        })
        .await?;

        let payload = json!({ "fields": Value::Object(fields.clone()) });
        let seq = self
            .append_event(task_id, None, "task_update", payload)
            .await?;
        self.bus.publish(EngineEvent::new(
            "task_update",
            json!({"task_id": task_id, "fields": Value::Object(fields), "seq": seq}),
        ));
        Ok(())
    }

    /// Bookkeeping write for the agent-loop event mirror. Deliberately quiet:
    /// no `task_update` event, the offset advances with every mirrored row.
    pub async fn set_backend_last_offset(&self, task_id: &str, offset: i64) -> Result<()> {
        let id = task_id.to_string();
        let now = now_iso();
        self.with_retry(move |conn| {
            conn.execute(
                "UPDATE tasks SET backend_last_offset = ?1, updated_at = ?2 WHERE id = ?3",
                params![offset, now, id],
            )
        })
        .await?;
        Ok(())
    }

    /// Idempotent: deleting a missing task is a no-op.
    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        let id = task_id.to_string();
        self.with_retry(move |conn| conn.execute("DELETE FROM tasks WHERE id = ?1", params![id]))
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    pub async fn insert_plan_steps(
        &self,
        task_id: &str,
        steps: &[PlanStep],
        start_idx: i64,
    ) -> Result<()> {
        let now = now_iso();
        let rows: Vec<(String, i64, String, String, String, bool)> = steps
            .iter()
            .enumerate()
            .map(|(offset, s)| -> Result<(String, i64, String, String, String, bool)> {
                let idx = start_idx + offset as i64;
                let name = if s.name.trim().is_empty() {
                    format!("Step {}", idx + 1)
                } else {
                    s.name.clone()
                };
                Ok((
                    new_id(),
                    idx,
                    name,
                    s.tool.clone(),
                    serde_json::to_string(&s.args)?,
                    s.requires_approval,
                ))
            })
            .collect::<Result<_>>()?;
        let task_id = task_id.to_string();
        self.with_retry(move |conn| {
            for (id, idx, name, tool, args, requires_approval) in &rows {
                conn.execute(
                    "INSERT INTO steps (id, task_id, idx, name, tool, args_json, status, requires_approval, result_json, error, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, NULL, NULL, ?8, ?8)",
                    params![id, task_id, idx, name, tool, args, *requires_approval as i64, now],
                )?;
            }
            Ok(())
        })
        .await
    }

    /// Insert a standalone step row (used by the agent-loop backend for
    /// approval placeholders and executed tool calls).
    pub async fn insert_step(&self, step: &Step) -> Result<()> {
        let row = step.clone();
        let args = serde_json::to_string(&row.args)?;
        let result = match &row.result {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        };
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO steps (id, task_id, idx, name, tool, args_json, status, requires_approval, result_json, error, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    row.id,
                    row.task_id,
                    row.idx,
                    row.name,
                    row.tool,
                    args,
                    row.status.as_str(),
                    row.requires_approval as i64,
                    result,
                    row.error,
                    row.created_at,
                    row.updated_at
                ],
            )
        })
        .await?;
        Ok(())
    }

    pub async fn get_step(&self, step_id: &str) -> Result<Step> {
        let id = step_id.to_string();
        self.with_retry(move |conn| {
            conn.query_row(
                &format!("{STEP_SELECT} WHERE id = ?1"),
                params![id],
                step_from_row,
            )
            .optional()
        })
        .await?
        .ok_or(StoreError::NotFound("step"))
    }

    pub async fn list_steps(&self, task_id: &str) -> Result<Vec<Step>> {
        let task_id = task_id.to_string();
        self.with_retry(move |conn| {
            let mut stmt =
                conn.prepare(&format!("{STEP_SELECT} WHERE task_id = ?1 ORDER BY idx ASC"))?;
            let rows = stmt.query_map(params![task_id], step_from_row)?;
            rows.collect()
        })
        .await
    }

    pub async fn max_step_idx(&self, task_id: &str) -> Result<Option<i64>> {
        let task_id = task_id.to_string();
        self.with_retry(move |conn| {
            conn.query_row(
                "SELECT MAX(idx) FROM steps WHERE task_id = ?1",
                params![task_id],
                |row| row.get::<_, Option<i64>>(0),
            )
        })
        .await
    }

    pub async fn count_steps(&self, task_id: &str) -> Result<i64> {
        let task_id = task_id.to_string();
        self.with_retry(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM steps WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
        })
        .await
    }

    pub async fn delete_steps(&self, task_id: &str) -> Result<()> {
        let task_id = task_id.to_string();
        self.with_retry(move |conn| {
            conn.execute("DELETE FROM steps WHERE task_id = ?1", params![task_id])
        })
        .await?;
        Ok(())
    }

    pub async fn delete_step_at_idx(&self, task_id: &str, idx: i64) -> Result<()> {
        let task_id = task_id.to_string();
        self.with_retry(move |conn| {
            conn.execute(
                "DELETE FROM steps WHERE task_id = ?1 AND idx = ?2",
                params![task_id, idx],
            )
        })
        .await?;
        Ok(())
    }

    pub async fn delete_steps_from_idx(&self, task_id: &str, idx: i64) -> Result<()> {
        let task_id = task_id.to_string();
        self.with_retry(move |conn| {
            conn.execute(
                "DELETE FROM steps WHERE task_id = ?1 AND idx >= ?2",
                params![task_id, idx],
            )
        })
        .await?;
        Ok(())
    }

    /// Atomic field update; appends + publishes `step_update` after commit.
    pub async fn update_step(&self, step_id: &str, update: StepUpdate) -> Result<()> {
        let (mut sets, mut values, fields) = step_update_parts(&update)?;
        let now = now_iso();
        sets.push("updated_at = ?");
        values.push(Box::new(now));
        let sql = format!("UPDATE steps SET {} WHERE id = ?", sets.join(", "));
        let id = step_id.to_string();
        values.push(Box::new(id));
        self.with_retry(move |conn| {
            conn.execute(
                &sql,
                rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
            )
        })
        .await?;

        let step_key = step_id.to_string();
        let task_id: Option<String> = self
            .with_retry(move |conn| {
                conn.query_row(
                    "SELECT task_id FROM steps WHERE id = ?1",
                    params![step_key],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;

        if let Some(task_id) = task_id {
            let payload = json!({ "fields": Value::Object(fields.clone()) });
            let seq = self
                .append_event(&task_id, Some(step_id), "step_update", payload)
                .await?;
            self.bus.publish(EngineEvent::new(
                "step_update",
                json!({"step_id": step_id, "task_id": task_id, "fields": Value::Object(fields), "seq": seq}),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Approvals
    // ------------------------------------------------------------------

    pub async fn create_approval(&self, task_id: &str, step_id: &str) -> Result<Approval> {
        let approval = Approval {
            id: new_id(),
            task_id: task_id.to_string(),
            step_id: step_id.to_string(),
            status: ApprovalStatus::Pending,
            requested_at: now_iso(),
            decided_at: None,
            decision: None,
            reason: None,
        };
        let row = approval.clone();
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT INTO approvals (id, task_id, step_id, status, requested_at, decided_at, decision, reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, NULL)",
                params![row.id, row.task_id, row.step_id, row.status.as_str(), row.requested_at],
            )
        })
        .await?;
        Ok(approval)
    }

    pub async fn list_approvals(&self, task_id: &str) -> Result<Vec<Approval>> {
        let task_id = task_id.to_string();
        self.with_retry(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{APPROVAL_SELECT} WHERE task_id = ?1 ORDER BY requested_at DESC, rowid DESC"
            ))?;
            let rows = stmt.query_map(params![task_id], approval_from_row)?;
            rows.collect()
        })
        .await
    }

    pub async fn latest_approval_for_step(&self, step_id: &str) -> Result<Option<Approval>> {
        let step_id = step_id.to_string();
        self.with_retry(move |conn| {
            conn.query_row(
                &format!(
                    "{APPROVAL_SELECT} WHERE step_id = ?1 ORDER BY requested_at DESC, rowid DESC LIMIT 1"
                ),
                params![step_id],
                approval_from_row,
            )
            .optional()
        })
        .await
    }

    pub async fn latest_pending_approval(&self, task_id: &str) -> Result<Option<Approval>> {
        let task_id = task_id.to_string();
        self.with_retry(move |conn| {
            conn.query_row(
                &format!(
                    "{APPROVAL_SELECT} WHERE task_id = ?1 AND status = 'pending' ORDER BY requested_at DESC, rowid DESC LIMIT 1"
                ),
                params![task_id],
                approval_from_row,
            )
            .optional()
        })
        .await
    }

    /// Decide the newest approval for a step. Only a pending row transitions;
    /// repeating a decision is a no-op and returns `false`.
    pub async fn decide_latest_approval(
        &self,
        step_id: &str,
        status: ApprovalStatus,
        decision: &str,
        reason: Option<&str>,
    ) -> Result<bool> {
        let step_id = step_id.to_string();
        let decision = decision.to_string();
        let reason = reason.map(str::to_string);
        let now = now_iso();
        let changed = self
            .with_retry(move |conn| {
                conn.execute(
                    "UPDATE approvals SET status = ?1, decided_at = ?2, decision = ?3, reason = ?4
                     WHERE id = (SELECT id FROM approvals WHERE step_id = ?5 AND status = 'pending'
                                 ORDER BY requested_at DESC, rowid DESC LIMIT 1)",
                    params![status.as_str(), now, decision, reason, step_id],
                )
            })
            .await?;
        Ok(changed > 0)
    }

    pub async fn delete_approvals(&self, task_id: &str) -> Result<()> {
        let task_id = task_id.to_string();
        self.with_retry(move |conn| {
            conn.execute("DELETE FROM approvals WHERE task_id = ?1", params![task_id])
        })
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Schedules
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn create_schedule(
        &self,
        name: &str,
        cron_expr: &str,
        workspace_id: &str,
        skill_id: &str,
        mode: Mode,
        enabled: bool,
        payload: Option<Value>,
    ) -> Result<Schedule> {
        let now = now_iso();
        let schedule = Schedule {
            id: new_id(),
            name: name.to_string(),
            cron_expr: cron_expr.to_string(),
            workspace_id: workspace_id.to_string(),
            skill_id: skill_id.to_string(),
            mode,
            enabled,
            payload,
            next_run_at: None,
            last_run_at: None,
            created_at: now.clone(),
            updated_at: now,
        };
        let row = schedule.clone();
        let payload_json = match &row.payload {
            Some(v) => Some(serde_json::to_string(v)?),
            None => None,
        };
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT INTO schedules (id, name, cron_expr, workspace_id, skill_id, mode, enabled, payload_json, next_run_at, last_run_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, NULL, ?9, ?9)",
                params![
                    row.id,
                    row.name,
                    row.cron_expr,
                    row.workspace_id,
                    row.skill_id,
                    row.mode.as_str(),
                    row.enabled as i64,
                    payload_json,
                    row.created_at
                ],
            )
        })
        .await?;
        Ok(schedule)
    }

    pub async fn list_schedules(&self, enabled_only: bool) -> Result<Vec<Schedule>> {
        self.with_retry(move |conn| {
            let sql = if enabled_only {
                format!("{SCHEDULE_SELECT} WHERE enabled = 1 ORDER BY created_at ASC")
            } else {
                format!("{SCHEDULE_SELECT} ORDER BY created_at ASC")
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], schedule_from_row)?;
            rows.collect()
        })
        .await
    }

    pub async fn get_schedule(&self, id: &str) -> Result<Schedule> {
        let id = id.to_string();
        self.with_retry(move |conn| {
            conn.query_row(
                &format!("{SCHEDULE_SELECT} WHERE id = ?1"),
                params![id],
                schedule_from_row,
            )
            .optional()
        })
        .await?
        .ok_or(StoreError::NotFound("schedule"))
    }

    pub async fn set_schedule_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let id = id.to_string();
        let now = now_iso();
        self.with_retry(move |conn| {
            conn.execute(
                "UPDATE schedules SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
                params![enabled as i64, now, id],
            )
        })
        .await?;
        Ok(())
    }

    pub async fn set_schedule_next_run(&self, id: &str, next_run_at: Option<&str>) -> Result<()> {
        let id = id.to_string();
        let next = next_run_at.map(str::to_string);
        let now = now_iso();
        self.with_retry(move |conn| {
            conn.execute(
                "UPDATE schedules SET next_run_at = ?1, updated_at = ?2 WHERE id = ?3",
                params![next, now, id],
            )
        })
        .await?;
        Ok(())
    }

    pub async fn set_schedule_last_run(&self, id: &str, last_run_at: &str) -> Result<()> {
        let id = id.to_string();
        let last = last_run_at.to_string();
        let now = now_iso();
        self.with_retry(move |conn| {
            conn.execute(
                "UPDATE schedules SET last_run_at = ?1, updated_at = ?2 WHERE id = ?3",
                params![last, now, id],
            )
        })
        .await?;
        Ok(())
    }

    pub async fn delete_schedule(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_retry(move |conn| conn.execute("DELETE FROM schedules WHERE id = ?1", params![id]))
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Workspace policies
    // ------------------------------------------------------------------

    pub async fn get_policy(
        &self,
        workspace_id: &str,
        scope: PolicyScope,
    ) -> Result<Option<WorkspacePolicy>> {
        let workspace_id = workspace_id.to_string();
        let raw: Option<String> = self
            .with_retry(move |conn| {
                conn.query_row(
                    "SELECT policy FROM workspace_policies WHERE workspace_id = ?1 AND scope = ?2",
                    params![workspace_id, scope.as_str()],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        Ok(raw.and_then(|p| WorkspacePolicy::from_str(&p).ok()))
    }

    pub async fn set_policy(
        &self,
        workspace_id: &str,
        scope: PolicyScope,
        policy: WorkspacePolicy,
    ) -> Result<()> {
        let workspace_id = workspace_id.to_string();
        let now = now_iso();
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT INTO workspace_policies (workspace_id, scope, policy, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(workspace_id, scope) DO UPDATE SET policy = excluded.policy, updated_at = excluded.updated_at",
                params![workspace_id, scope.as_str(), policy.as_str(), now],
            )
        })
        .await?;
        Ok(())
    }

    pub async fn list_policies(
        &self,
        workspace_id: &str,
    ) -> Result<Vec<(PolicyScope, WorkspacePolicy)>> {
        let workspace_id = workspace_id.to_string();
        let rows: Vec<(String, String)> = self
            .with_retry(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT scope, policy FROM workspace_policies WHERE workspace_id = ?1",
                )?;
                let rows = stmt.query_map(params![workspace_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                rows.collect()
            })
            .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(scope, policy)| {
                Some((
                    PolicyScope::from_str(&scope).ok()?,
                    WorkspacePolicy::from_str(&policy).ok()?,
                ))
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // MCP servers
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn create_mcp_server(
        &self,
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        healthcheck_args: &[String],
        enabled: bool,
    ) -> Result<McpServerEntry> {
        let now = now_iso();
        let entry = McpServerEntry {
            id: new_id(),
            name: name.to_string(),
            command: command.to_string(),
            args: args.to_vec(),
            env: env.clone(),
            healthcheck_args: healthcheck_args.to_vec(),
            enabled,
            created_at: now.clone(),
            updated_at: now,
        };
        let row = entry.clone();
        let args_json = serde_json::to_string(&row.args)?;
        let env_json = serde_json::to_string(&row.env)?;
        let health_json = serde_json::to_string(&row.healthcheck_args)?;
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT INTO mcp_servers (id, name, command, args_json, env_json, healthcheck_args_json, enabled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    row.id,
                    row.name,
                    row.command,
                    args_json,
                    env_json,
                    health_json,
                    row.enabled as i64,
                    row.created_at
                ],
            )
        })
        .await?;
        Ok(entry)
    }

    pub async fn update_mcp_server(&self, entry: &McpServerEntry) -> Result<()> {
        let row = entry.clone();
        let args_json = serde_json::to_string(&row.args)?;
        let env_json = serde_json::to_string(&row.env)?;
        let health_json = serde_json::to_string(&row.healthcheck_args)?;
        let now = now_iso();
        self.with_retry(move |conn| {
            conn.execute(
                "UPDATE mcp_servers SET name = ?1, command = ?2, args_json = ?3, env_json = ?4, healthcheck_args_json = ?5, enabled = ?6, updated_at = ?7
                 WHERE id = ?8",
                params![
                    row.name,
                    row.command,
                    args_json,
                    env_json,
                    health_json,
                    row.enabled as i64,
                    now,
                    row.id
                ],
            )
        })
        .await?;
        Ok(())
    }

    pub async fn get_mcp_server(&self, id: &str) -> Result<McpServerEntry> {
        let id = id.to_string();
        self.with_retry(move |conn| {
            conn.query_row(
                &format!("{MCP_SELECT} WHERE id = ?1"),
                params![id],
                mcp_from_row,
            )
            .optional()
        })
        .await?
        .ok_or(StoreError::NotFound("mcp server"))
    }

    pub async fn list_mcp_servers(&self, enabled_only: bool) -> Result<Vec<McpServerEntry>> {
        self.with_retry(move |conn| {
            let sql = if enabled_only {
                format!("{MCP_SELECT} WHERE enabled = 1 ORDER BY updated_at DESC")
            } else {
                format!("{MCP_SELECT} ORDER BY updated_at DESC")
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], mcp_from_row)?;
            rows.collect()
        })
        .await
    }

    pub async fn delete_mcp_server(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_retry(move |conn| {
            conn.execute("DELETE FROM mcp_servers WHERE id = ?1", params![id])
        })
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event log
    // ------------------------------------------------------------------

    /// Append one event row; returns the rowid, which is the client cursor.
    pub async fn append_event(
        &self,
        task_id: &str,
        step_id: Option<&str>,
        event_type: &str,
        payload: Value,
    ) -> Result<i64> {
        let id = new_id();
        let task_id = task_id.to_string();
        let step_id = step_id.map(str::to_string);
        let event_type = event_type.to_string();
        let payload_json = serde_json::to_string(&payload)?;
        let ts = Utc::now().timestamp_millis() as f64 / 1000.0;
        let created_at = now_iso();
        self.with_retry(move |conn| {
            conn.execute(
                "INSERT INTO event_log (id, task_id, step_id, type, payload_json, ts, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![id, task_id, step_id, event_type, payload_json, ts, created_at],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Append a `chat_message` event and publish it on the bus as `event_log`.
    pub async fn append_chat_message(
        &self,
        task_id: &str,
        step_id: Option<&str>,
        role: &str,
        content: &str,
    ) -> Result<i64> {
        let payload = json!({"role": role, "content": content});
        let seq = self
            .append_event(task_id, step_id, "chat_message", payload.clone())
            .await?;
        self.bus.publish(EngineEvent::new(
            "event_log",
            json!({"task_id": task_id, "type": "chat_message", "payload": payload, "seq": seq}),
        ));
        Ok(seq)
    }

    /// Event replay, ascending by seq. `tail=true` returns the latest `limit`
    /// rows, still in chronological order.
    pub async fn list_events(
        &self,
        task_id: &str,
        after_seq: i64,
        limit: usize,
        tail: bool,
    ) -> Result<Vec<EventRecord>> {
        let task_id = task_id.to_string();
        let limit = limit.clamp(1, 2000) as i64;
        let after = after_seq.max(0);
        self.with_retry(move |conn| {
            let mut records = if tail {
                let mut stmt = conn.prepare(
                    "SELECT rowid, id, task_id, step_id, type, payload_json, ts, created_at
                     FROM event_log WHERE task_id = ?1 ORDER BY rowid DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![task_id, limit], event_from_row)?;
                let mut out: Vec<EventRecord> = rows.collect::<rusqlite::Result<_>>()?;
                out.reverse();
                out
            } else {
                let mut stmt = conn.prepare(
                    "SELECT rowid, id, task_id, step_id, type, payload_json, ts, created_at
                     FROM event_log WHERE task_id = ?1 AND rowid > ?2 ORDER BY rowid ASC LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![task_id, after, limit], event_from_row)?;
                rows.collect::<rusqlite::Result<_>>()?
            };
            for record in &mut records {
                if record.payload.is_null() {
                    record.payload = json!({});
                }
            }
            Ok(records)
        })
        .await
    }
}

// ------------------------------------------------------------------
// Row mapping & update plumbing
// ------------------------------------------------------------------

const SKILL_SELECT: &str = "SELECT s.id, s.name, s.description, s.source_file, s.system_prompt, s.allowed_tools_json, s.default_mode, s.created_at, COALESCE(m.enabled, 1)
     FROM skills s LEFT JOIN skill_meta m ON m.skill_id = s.id";

const TASK_SELECT: &str = "SELECT id, workspace_id, skill_id, status, mode, goal, plan_json, created_at, updated_at, current_step, output_path, error, backend, backend_run_id, backend_thread_id, backend_interrupt_id, backend_resume_token, backend_last_offset FROM tasks";

const STEP_SELECT: &str = "SELECT id, task_id, idx, name, tool, args_json, status, requires_approval, result_json, error, created_at, updated_at FROM steps";

const APPROVAL_SELECT: &str = "SELECT id, task_id, step_id, status, requested_at, decided_at, decision, reason FROM approvals";

const SCHEDULE_SELECT: &str = "SELECT id, name, cron_expr, workspace_id, skill_id, mode, enabled, payload_json, next_run_at, last_run_at, created_at, updated_at FROM schedules";

const MCP_SELECT: &str = "SELECT id, name, command, args_json, env_json, healthcheck_args_json, enabled, created_at, updated_at FROM mcp_servers";

fn is_busy(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

fn parse_json_column(raw: Option<String>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn workspace_from_row(row: &Row<'_>) -> rusqlite::Result<Workspace> {
    Ok(Workspace {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn skill_from_row(row: &Row<'_>) -> rusqlite::Result<Skill> {
    let tools_json: String = row.get(5)?;
    let mode: String = row.get(6)?;
    let enabled: i64 = row.get(8)?;
    Ok(Skill {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        source_file: row.get(3)?,
        system_prompt: row.get(4)?,
        allowed_tools: serde_json::from_str(&tools_json).unwrap_or_default(),
        default_mode: Mode::from_str(&mode).unwrap_or_default(),
        created_at: row.get(7)?,
        enabled: enabled != 0,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(3)?;
    let mode: String = row.get(4)?;
    let plan_json: Option<String> = row.get(6)?;
    let backend: Option<String> = row.get(12)?;
    Ok(Task {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        skill_id: row.get(2)?,
        status: TaskStatus::from_str(&status).unwrap_or(TaskStatus::Failed),
        mode: Mode::from_str(&mode).unwrap_or_default(),
        goal: row.get(5)?,
        plan: plan_json.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        current_step: row.get(9)?,
        output_path: row.get(10)?,
        error: row.get(11)?,
        backend: backend.and_then(|b| Backend::from_str(&b).ok()),
        backend_run_id: row.get(13)?,
        backend_thread_id: row.get(14)?,
        backend_interrupt_id: row.get(15)?,
        backend_resume_token: row.get(16)?,
        backend_last_offset: row.get(17)?,
    })
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<Step> {
    let args_json: String = row.get(5)?;
    let status: String = row.get(6)?;
    let requires_approval: i64 = row.get(7)?;
    let result_json: Option<String> = row.get(8)?;
    Ok(Step {
        id: row.get(0)?,
        task_id: row.get(1)?,
        idx: row.get(2)?,
        name: row.get(3)?,
        tool: row.get(4)?,
        args: serde_json::from_str(&args_json).unwrap_or(Value::Null),
        status: StepStatus::from_str(&status).unwrap_or(StepStatus::Failed),
        requires_approval: requires_approval != 0,
        result: parse_json_column(result_json),
        error: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn approval_from_row(row: &Row<'_>) -> rusqlite::Result<Approval> {
    let status: String = row.get(3)?;
    Ok(Approval {
        id: row.get(0)?,
        task_id: row.get(1)?,
        step_id: row.get(2)?,
        status: ApprovalStatus::from_str(&status).unwrap_or(ApprovalStatus::Pending),
        requested_at: row.get(4)?,
        decided_at: row.get(5)?,
        decision: row.get(6)?,
        reason: row.get(7)?,
    })
}

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    let mode: String = row.get(5)?;
    let enabled: i64 = row.get(6)?;
    let payload_json: Option<String> = row.get(7)?;
    Ok(Schedule {
        id: row.get(0)?,
        name: row.get(1)?,
        cron_expr: row.get(2)?,
        workspace_id: row.get(3)?,
        skill_id: row.get(4)?,
        mode: Mode::from_str(&mode).unwrap_or_default(),
        enabled: enabled != 0,
        payload: parse_json_column(payload_json),
        next_run_at: row.get(8)?,
        last_run_at: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn mcp_from_row(row: &Row<'_>) -> rusqlite::Result<McpServerEntry> {
    let args_json: String = row.get(3)?;
    let env_json: String = row.get(4)?;
    let health_json: String = row.get(5)?;
    let enabled: i64 = row.get(6)?;
    Ok(McpServerEntry {
        id: row.get(0)?,
        name: row.get(1)?,
        command: row.get(2)?,
        args: serde_json::from_str(&args_json).unwrap_or_default(),
        env: serde_json::from_str(&env_json).unwrap_or_default(),
        healthcheck_args: serde_json::from_str(&health_json).unwrap_or_default(),
        enabled: enabled != 0,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    let payload_json: String = row.get(5)?;
    Ok(EventRecord {
        seq: row.get(0)?,
        id: row.get(1)?,
        task_id: row.get(2)?,
        step_id: row.get(3)?,
        event_type: row.get(4)?,
        payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
        ts: row.get(6)?,
        created_at: row.get(7)?,
    })
}

type SqlValues = Vec<Box<dyn rusqlite::ToSql + Send>>;

fn task_update_parts(update: &TaskUpdate) -> Result<(Vec<&'static str>, SqlValues, Map<String, Value>)> {
    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: SqlValues = Vec::new();
    let mut fields = Map::new();

    if let Some(status) = update.status {
        sets.push("status = ?");
        values.push(Box::new(status.as_str().to_string()));
        fields.insert("status".into(), json!(status.as_str()));
    }
    if let Some(plan) = &update.plan {
        sets.push("plan_json = ?");
        values.push(Box::new(serde_json::to_string(plan)?));
        fields.insert("plan".into(), serde_json::to_value(plan)?);
    }
    if let Some(step) = update.current_step {
        sets.push("current_step = ?");
        values.push(Box::new(step));
        fields.insert("current_step".into(), json!(step));
    }
    if let Some(path) = &update.output_path {
        sets.push("output_path = ?");
        values.push(Box::new(path.clone()));
        fields.insert("output_path".into(), json!(path));
    }
    if let Some(error) = &update.error {
        sets.push("error = ?");
        values.push(Box::new(error.clone()));
        fields.insert("error".into(), json!(error));
    }
    if let Some(backend) = update.backend {
        sets.push("backend = ?");
        values.push(Box::new(backend.as_str().to_string()));
        fields.insert("backend".into(), json!(backend.as_str()));
    }
    if let Some(run_id) = &update.backend_run_id {
        sets.push("backend_run_id = ?");
        values.push(Box::new(run_id.clone()));
        fields.insert("backend_run_id".into(), json!(run_id));
    }
    if let Some(thread_id) = &update.backend_thread_id {
        sets.push("backend_thread_id = ?");
        values.push(Box::new(thread_id.clone()));
        fields.insert("backend_thread_id".into(), json!(thread_id));
    }
    if let Some(interrupt) = &update.backend_interrupt_id {
        sets.push("backend_interrupt_id = ?");
        values.push(Box::new(interrupt.clone()));
        fields.insert("backend_interrupt_id".into(), json!(interrupt));
    }
    if let Some(token) = &update.backend_resume_token {
        sets.push("backend_resume_token = ?");
        values.push(Box::new(token.clone()));
        fields.insert("backend_resume_token".into(), json!(token));
    }
    if let Some(offset) = update.backend_last_offset {
        sets.push("backend_last_offset = ?");
        values.push(Box::new(offset));
        fields.insert("backend_last_offset".into(), json!(offset));
    }

    Ok((sets, values, fields))
}

fn step_update_parts(update: &StepUpdate) -> Result<(Vec<&'static str>, SqlValues, Map<String, Value>)> {
    let mut sets: Vec<&'static str> = Vec::new();
    let mut values: SqlValues = Vec::new();
    let mut fields = Map::new();

    if let Some(status) = update.status {
        sets.push("status = ?");
        values.push(Box::new(status.as_str().to_string()));
        fields.insert("status".into(), json!(status.as_str()));
    }
    if let Some(name) = &update.name {
        sets.push("name = ?");
        values.push(Box::new(name.clone()));
        fields.insert("name".into(), json!(name));
    }
    if let Some(requires_approval) = update.requires_approval {
        sets.push("requires_approval = ?");
        values.push(Box::new(requires_approval as i64));
        fields.insert("requires_approval".into(), json!(requires_approval));
    }
    if let Some(result) = &update.result {
        sets.push("result_json = ?");
        values.push(Box::new(serde_json::to_string(result)?));
        fields.insert("result".into(), result.clone());
    }
    if let Some(error) = &update.error {
        sets.push("error = ?");
        values.push(Box::new(error.clone()));
        fields.insert("error".into(), json!(error));
    }

    Ok((sets, values, fields))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    async fn open_store(dir: &Path) -> Store {
        Store::open(&dir.join("workbench.db"), EventBus::new())
            .await
            .unwrap()
    }

    async fn seed_task(store: &Store) -> Task {
        let ws = store.create_workspace("W1", "/tmp/w1").await.unwrap();
        let skill = store
            .create_skill("S1", None, None, "prompt", &[], Mode::Fast)
            .await
            .unwrap();
        store
            .create_task(&ws.id, &skill.id, "write notes", Mode::Fast, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn reopening_runs_migrations_idempotently() {
        let dir = tempdir().unwrap();
        {
            let _store = open_store(dir.path()).await;
        }
        // Second open must not trip over the backend columns.
        let store = open_store(dir.path()).await;
        let task = seed_task(&store).await;
        assert!(task.backend.is_none());
    }

    #[tokio::test]
    async fn skill_allowed_tools_round_trip() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let tools = vec!["filesystem.write_text".to_string(), "shell.exec".to_string()];
        let skill = store
            .create_skill("S1", Some("desc"), None, "prompt", &tools, Mode::Pro)
            .await
            .unwrap();
        let loaded = store.get_skill(&skill.id).await.unwrap();
        assert_eq!(loaded.allowed_tools, tools);
        assert_eq!(loaded.default_mode, Mode::Pro);
        assert!(loaded.enabled);

        store.set_skill_enabled(&skill.id, false).await.unwrap();
        let disabled = store.get_skill(&skill.id).await.unwrap();
        assert!(!disabled.enabled);
        assert!(store.list_skills(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_task_seeds_chat_history() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let task = seed_task(&store).await;

        let events = store.list_events(&task.id, 0, 100, false).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "chat_message");
        assert_eq!(events[0].payload["role"], "user");
        assert_eq!(events[0].payload["content"], "write notes");
    }

    #[tokio::test]
    async fn update_task_appends_and_publishes_after_commit() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let task = seed_task(&store).await;
        let mut rx = store.bus().subscribe();

        store
            .update_task(&task.id, TaskUpdate::status(TaskStatus::Planning))
            .await
            .unwrap();

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.event_type, "task_update");
        assert_eq!(ev.data["task_id"], task.id);
        assert_eq!(ev.data["fields"]["status"], "planning");

        // The bus event must refer to an already-durable row.
        let events = store.list_events(&task.id, 0, 100, false).await.unwrap();
        let logged = events
            .iter()
            .find(|e| e.event_type == "task_update")
            .unwrap();
        assert_eq!(logged.payload["fields"]["status"], "planning");
        assert_eq!(logged.seq, ev.data["seq"].as_i64().unwrap());

        let reloaded = store.get_task(&task.id).await.unwrap();
        assert_eq!(reloaded.status, TaskStatus::Planning);
    }

    #[tokio::test]
    async fn event_pagination_never_overlaps() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let task = seed_task(&store).await;
        for i in 0..10 {
            store
                .append_event(&task.id, None, "agent_event", json!({"i": i}))
                .await
                .unwrap();
        }

        let first = store.list_events(&task.id, 0, 5, false).await.unwrap();
        let last_seq = first.last().unwrap().seq;
        let second = store.list_events(&task.id, last_seq, 100, false).await.unwrap();
        let first_ids: Vec<i64> = first.iter().map(|e| e.seq).collect();
        for record in &second {
            assert!(!first_ids.contains(&record.seq));
            assert!(record.seq > last_seq);
        }
        // Seqs are strictly monotonic.
        let mut all = first;
        all.extend(second);
        for pair in all.windows(2) {
            assert!(pair[0].seq < pair[1].seq);
        }
    }

    #[tokio::test]
    async fn tail_returns_latest_in_chronological_order() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let task = seed_task(&store).await;
        for i in 0..6 {
            store
                .append_event(&task.id, None, "agent_event", json!({"i": i}))
                .await
                .unwrap();
        }
        let tail = store.list_events(&task.id, 0, 3, true).await.unwrap();
        assert_eq!(tail.len(), 3);
        assert!(tail[0].seq < tail[1].seq && tail[1].seq < tail[2].seq);
        assert_eq!(tail[2].payload["i"], 5);
    }

    #[tokio::test]
    async fn steps_and_patch_deletions() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let task = seed_task(&store).await;
        let plan_steps: Vec<PlanStep> = (0..4)
            .map(|i| PlanStep {
                name: format!("step {i}"),
                tool: "filesystem.write_text".to_string(),
                args: json!({"path": format!("{i}.txt"), "content": "x"}),
                requires_approval: false,
            })
            .collect();
        store
            .insert_plan_steps(&task.id, &plan_steps, 0)
            .await
            .unwrap();
        assert_eq!(store.count_steps(&task.id).await.unwrap(), 4);
        assert_eq!(store.max_step_idx(&task.id).await.unwrap(), Some(3));

        store.delete_step_at_idx(&task.id, 1).await.unwrap();
        store.delete_steps_from_idx(&task.id, 3).await.unwrap();
        let remaining = store.list_steps(&task.id).await.unwrap();
        let idxs: Vec<i64> = remaining.iter().map(|s| s.idx).collect();
        assert_eq!(idxs, vec![0, 2]);
    }

    #[tokio::test]
    async fn approval_decision_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let task = seed_task(&store).await;
        store
            .insert_plan_steps(
                &task.id,
                &[PlanStep {
                    name: "write".into(),
                    tool: "filesystem.write_text".into(),
                    args: json!({}),
                    requires_approval: true,
                }],
                0,
            )
            .await
            .unwrap();
        let step = store.list_steps(&task.id).await.unwrap().remove(0);
        store.create_approval(&task.id, &step.id).await.unwrap();

        let first = store
            .decide_latest_approval(&step.id, ApprovalStatus::Approved, "approve", None)
            .await
            .unwrap();
        assert!(first);
        let second = store
            .decide_latest_approval(&step.id, ApprovalStatus::Approved, "approve", None)
            .await
            .unwrap();
        assert!(!second, "second decision must be a no-op");

        let latest = store
            .latest_approval_for_step(&step.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.status, ApprovalStatus::Approved);
        assert!(latest.decided_at.is_some());
    }

    #[tokio::test]
    async fn delete_task_cascades_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let task = seed_task(&store).await;
        store
            .insert_plan_steps(
                &task.id,
                &[PlanStep {
                    name: "s".into(),
                    tool: "filesystem.list".into(),
                    args: json!({}),
                    requires_approval: false,
                }],
                0,
            )
            .await
            .unwrap();
        let step = store.list_steps(&task.id).await.unwrap().remove(0);
        store.create_approval(&task.id, &step.id).await.unwrap();

        store.delete_task(&task.id).await.unwrap();
        assert!(matches!(
            store.get_task(&task.id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.list_steps(&task.id).await.unwrap().is_empty());
        assert!(store.list_approvals(&task.id).await.unwrap().is_empty());
        assert!(store.list_events(&task.id, 0, 10, false).await.unwrap().is_empty());

        // Second delete is a no-op, not an error.
        store.delete_task(&task.id).await.unwrap();
    }

    #[tokio::test]
    async fn policies_upsert_and_read_back() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let ws = store.create_workspace("W", "/tmp/w").await.unwrap();

        assert!(store
            .get_policy(&ws.id, PolicyScope::FsWrite)
            .await
            .unwrap()
            .is_none());
        store
            .set_policy(&ws.id, PolicyScope::FsWrite, WorkspacePolicy::AskOnce)
            .await
            .unwrap();
        store
            .set_policy(&ws.id, PolicyScope::FsWrite, WorkspacePolicy::AlwaysDeny)
            .await
            .unwrap();
        assert_eq!(
            store.get_policy(&ws.id, PolicyScope::FsWrite).await.unwrap(),
            Some(WorkspacePolicy::AlwaysDeny)
        );
        assert_eq!(store.list_policies(&ws.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn schedule_run_bookkeeping() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let ws = store.create_workspace("W", "/tmp/w").await.unwrap();
        let skill = store
            .create_skill("S", None, None, "p", &[], Mode::Fast)
            .await
            .unwrap();
        let schedule = store
            .create_schedule(
                "nightly",
                "*/1 * * * *",
                &ws.id,
                &skill.id,
                Mode::Fast,
                true,
                Some(json!({"goal": "tick"})),
            )
            .await
            .unwrap();

        store
            .set_schedule_next_run(&schedule.id, Some("2026-01-01T00:00:00Z"))
            .await
            .unwrap();
        store
            .set_schedule_last_run(&schedule.id, "2026-01-01T00:00:00Z")
            .await
            .unwrap();
        let loaded = store.get_schedule(&schedule.id).await.unwrap();
        assert_eq!(loaded.next_run_at.as_deref(), Some("2026-01-01T00:00:00Z"));
        assert_eq!(loaded.last_run_at.as_deref(), Some("2026-01-01T00:00:00Z"));
        assert_eq!(loaded.payload.as_ref().unwrap()["goal"], "tick");

        store.set_schedule_enabled(&schedule.id, false).await.unwrap();
        assert!(store.list_schedules(true).await.unwrap().is_empty());
        assert_eq!(store.list_schedules(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mcp_server_round_trip() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let mut env = HashMap::new();
        env.insert("TOKEN".to_string(), "x".to_string());
        let entry = store
            .create_mcp_server(
                "files",
                "mcp-files",
                &["--stdio".to_string()],
                &env,
                &[],
                true,
            )
            .await
            .unwrap();
        let loaded = store.get_mcp_server(&entry.id).await.unwrap();
        assert_eq!(loaded.args, vec!["--stdio".to_string()]);
        assert_eq!(loaded.env.get("TOKEN").map(String::as_str), Some("x"));

        let mut updated = loaded.clone();
        updated.enabled = false;
        store.update_mcp_server(&updated).await.unwrap();
        assert!(store.list_mcp_servers(true).await.unwrap().is_empty());
        store.delete_mcp_server(&entry.id).await.unwrap();
        assert!(store.list_mcp_servers(false).await.unwrap().is_empty());
    }
}
