use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use workbench_store::{Store, StoreError};
use workbench_types::{PolicyScope, WorkspacePolicy};

/// Map a tool name onto its coarse permission scope.
pub fn scope_for_tool(tool_name: &str) -> PolicyScope {
    let t = tool_name.trim();
    if t == "shell.exec" {
        return PolicyScope::Shell;
    }
    // Slide rendering writes an artifact file; treat like a local write.
    if t == "ppt.render" {
        return PolicyScope::FsWrite;
    }
    if matches!(t, "filesystem.list" | "filesystem.read_text" | "filesystem.stat") {
        return PolicyScope::FsRead;
    }
    if matches!(t, "filesystem.write_text" | "filesystem.mkdir" | "filesystem.move") {
        return PolicyScope::FsWrite;
    }
    if t == "filesystem.delete" {
        return PolicyScope::FsDelete;
    }
    if t == "browser.click" {
        return PolicyScope::BrowserClick;
    }
    if t.starts_with("web.") || t.starts_with("browser.") {
        return PolicyScope::Network;
    }
    if t.starts_with("mcp/") {
        return PolicyScope::Mcp;
    }
    PolicyScope::Other
}

// Network is open unless the workspace opts in to gating. Reads run
// unattended anyway (they are never approval-flagged); gated scopes default
// to ask-once so the first risky call in a task pauses for consent.
fn default_policy(scope: PolicyScope) -> WorkspacePolicy {
    match scope {
        PolicyScope::Network => WorkspacePolicy::AlwaysAllow,
        _ => WorkspacePolicy::AskOnce,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    Auto,
    RequireApproval,
    Deny,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyDecision {
    pub allow: bool,
    pub mode: PolicyMode,
    pub reason: String,
}

impl PolicyDecision {
    fn auto(reason: &str) -> Self {
        Self {
            allow: true,
            mode: PolicyMode::Auto,
            reason: reason.to_string(),
        }
    }

    fn require_approval(reason: &str) -> Self {
        Self {
            allow: true,
            mode: PolicyMode::RequireApproval,
            reason: reason.to_string(),
        }
    }

    fn deny(reason: &str) -> Self {
        Self {
            allow: false,
            mode: PolicyMode::Deny,
            reason: reason.to_string(),
        }
    }
}

/// Per-scope approval defaults from configuration; tools outside these scopes
/// fall back to their registry `risky` flag.
#[derive(Debug, Clone)]
pub struct ApprovalDefaults {
    pub shell: bool,
    pub fs_write: bool,
    pub fs_delete: bool,
    pub browser_click: bool,
}

impl Default for ApprovalDefaults {
    fn default() -> Self {
        Self {
            shell: true,
            fs_write: true,
            fs_delete: true,
            browser_click: true,
        }
    }
}

/// Decides whether a tool call runs unattended, pauses for approval, or is
/// denied. Owns the per-task ask-once grant set; grants live in process
/// memory for the duration of the task and are not persisted.
pub struct PolicyEngine {
    store: Arc<Store>,
    defaults: ApprovalDefaults,
    grants: Mutex<HashMap<String, HashSet<PolicyScope>>>,
}

impl PolicyEngine {
    pub fn new(store: Arc<Store>, defaults: ApprovalDefaults) -> Self {
        Self {
            store,
            defaults,
            grants: Mutex::new(HashMap::new()),
        }
    }

    fn tool_requires_approval(&self, tool_name: &str, tool_risky: Option<bool>) -> bool {
        match scope_for_tool(tool_name) {
            PolicyScope::Shell => self.defaults.shell,
            PolicyScope::FsWrite => self.defaults.fs_write,
            PolicyScope::FsDelete => self.defaults.fs_delete,
            PolicyScope::BrowserClick => self.defaults.browser_click,
            // Unknown tools are treated as risky.
            _ => tool_risky.unwrap_or(true),
        }
    }

    pub async fn decide(
        &self,
        workspace_id: &str,
        tool_name: &str,
        task_id: &str,
        step_requires_approval: bool,
        tool_risky: Option<bool>,
    ) -> Result<PolicyDecision, StoreError> {
        let scope = scope_for_tool(tool_name);
        let mut requires_approval =
            step_requires_approval || self.tool_requires_approval(tool_name, tool_risky);

        let configured = self.store.get_policy(workspace_id, scope).await?;

        // Network is allow-by-default; a configured policy opts it into gating.
        if !requires_approval
            && scope == PolicyScope::Network
            && configured.is_some_and(|p| p != WorkspacePolicy::AlwaysAllow)
        {
            requires_approval = true;
        }

        if configured == Some(WorkspacePolicy::AlwaysDeny)
            && (requires_approval || matches!(scope, PolicyScope::Network | PolicyScope::Mcp))
        {
            return Ok(PolicyDecision::deny("workspace_policy_always_deny"));
        }

        if !requires_approval {
            return Ok(PolicyDecision::auto("no_approval_required"));
        }

        match configured.unwrap_or_else(|| default_policy(scope)) {
            WorkspacePolicy::AlwaysAllow => Ok(PolicyDecision::auto("workspace_policy_always_allow")),
            WorkspacePolicy::AlwaysDeny => Ok(PolicyDecision::deny("workspace_policy_always_deny")),
            WorkspacePolicy::AskOnce => {
                if self.is_granted(task_id, scope).await {
                    Ok(PolicyDecision::auto("ask_once_scope_granted"))
                } else {
                    Ok(PolicyDecision::require_approval("ask_once_scope_not_granted"))
                }
            }
        }
    }

    pub async fn grant_scope(&self, task_id: &str, scope: PolicyScope) {
        self.grants
            .lock()
            .await
            .entry(task_id.to_string())
            .or_default()
            .insert(scope);
    }

    pub async fn is_granted(&self, task_id: &str, scope: PolicyScope) -> bool {
        self.grants
            .lock()
            .await
            .get(task_id)
            .is_some_and(|scopes| scopes.contains(&scope))
    }

    pub async fn clear_task_grants(&self, task_id: &str) {
        self.grants.lock().await.remove(task_id);
    }
}
