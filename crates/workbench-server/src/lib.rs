use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use workbench_core::config::Settings;
use workbench_core::runner::Runner;
use workbench_providers::ChatProvider;
use workbench_runtime::{McpClient, McpToolInfo};
use workbench_store::{EventBus, Store};
use workbench_tools::{Tool, ToolContext, ToolRegistry, ToolSpec};

mod http;

pub use http::{app_router, serve};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub event_bus: EventBus,
    pub settings: Arc<Settings>,
    pub tools: ToolRegistry,
    pub runner: Arc<Runner>,
    pub provider: Arc<dyn ChatProvider>,
    pub admin_token: String,
}

/// Resolve the shared admin token: configuration wins; otherwise a one-shot
/// token is generated and written to `data_dir/ui_admin_token.txt` so the
/// operator can find it.
pub fn resolve_admin_token(settings: &Settings) -> anyhow::Result<String> {
    if let Some(token) = &settings.ui_admin_token {
        return Ok(token.clone());
    }
    let path = settings.data_dir.join("ui_admin_token.txt");
    if let Ok(existing) = std::fs::read_to_string(&path) {
        let trimmed = existing.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    let token = workbench_types::new_id();
    std::fs::create_dir_all(&settings.data_dir)?;
    std::fs::write(&path, &token)?;
    tracing::info!("generated admin token at {}", path.display());
    Ok(token)
}

/// Bridges one MCP-advertised tool into the registry under
/// `mcp/<server>/<tool>`.
pub struct McpBridgeTool {
    client: Arc<McpClient>,
    server_name: String,
    info: McpToolInfo,
}

#[async_trait]
impl Tool for McpBridgeTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: format!("mcp/{}/{}", self.server_name, self.info.name),
            description: self.info.description.clone(),
            input_schema: self.info.input_schema.clone(),
            risky: true,
        }
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> anyhow::Result<Value> {
        self.client.call_tool(&self.info.name, args).await
    }
}

/// Spawn each enabled MCP server, discover its tools, and register bridge
/// tools. A server that fails to come up is skipped with a warning; it never
/// blocks engine startup.
pub async fn adopt_mcp_servers(store: &Store, tools: &ToolRegistry) -> anyhow::Result<usize> {
    let mut adopted = 0usize;
    for entry in store.list_mcp_servers(true).await? {
        let client = match McpClient::connect(&entry).await {
            Ok(client) => Arc::new(client),
            Err(err) => {
                tracing::warn!(server = entry.name, "skipping mcp server: {err}");
                continue;
            }
        };
        let listed = match client.list_tools().await {
            Ok(listed) => listed,
            Err(err) => {
                tracing::warn!(server = entry.name, "mcp tools/list failed: {err}");
                continue;
            }
        };
        for info in listed {
            let bridge = McpBridgeTool {
                client: client.clone(),
                server_name: entry.name.clone(),
                info,
            };
            if let Err(err) = tools.register(Arc::new(bridge)).await {
                tracing::warn!(server = entry.name, "mcp tool registration failed: {err}");
                continue;
            }
            adopted += 1;
        }
    }
    Ok(adopted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(data_dir: std::path::PathBuf, token: Option<String>) -> Settings {
        Settings {
            db_path: data_dir.join("workbench.db"),
            workspaces_dir: data_dir.join("workspaces"),
            artifacts_dir: data_dir.join("artifacts"),
            logs_dir: data_dir.join("logs"),
            data_dir,
            llm_base_url: String::new(),
            llm_api_key: String::new(),
            model_fast: "fast".into(),
            model_pro: "pro".into(),
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
            browser_timeout_ms: 1,
            ui_admin_token: token,
            log_retention_days: 14,
        }
    }

    #[test]
    fn configured_token_wins() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path().to_path_buf(), Some("secret".into()));
        assert_eq!(resolve_admin_token(&settings).unwrap(), "secret");
        assert!(!dir.path().join("ui_admin_token.txt").exists());
    }

    #[test]
    fn generated_token_is_stable_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings(dir.path().to_path_buf(), None);
        let first = resolve_admin_token(&settings).unwrap();
        let second = resolve_admin_token(&settings).unwrap();
        assert_eq!(first, second);
        let on_disk = std::fs::read_to_string(dir.path().join("ui_admin_token.txt")).unwrap();
        assert_eq!(on_disk.trim(), first);
    }
}
