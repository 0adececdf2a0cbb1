// Workbench Tools
// Tool trait, one-shot registry, and the built-in filesystem/shell/web tools.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

mod builtin;

pub use builtin::{register_builtin_tools, ShellOptions};

/// Execution context handed to every tool call. File tools are confined to
/// `workspace_root`; artifacts land under `artifacts_dir`.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub workspace_root: PathBuf,
    pub artifacts_dir: PathBuf,
    pub task_id: String,
    pub step_id: String,
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub risky: bool,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<Value>;
}

/// Registration is one-shot at startup; a name collision is a hard error.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) -> anyhow::Result<()> {
        let name = tool.spec().name;
        let mut tools = self.tools.write().await;
        if tools.contains_key(&name) {
            anyhow::bail!("tool already registered: {name}");
        }
        tools.insert(name, tool);
        Ok(())
    }

    pub async fn get_spec(&self, name: &str) -> Option<ToolSpec> {
        self.tools.read().await.get(name).map(|t| t.spec())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    /// All specs, name-sorted. An empty `allowed` filter means every tool.
    pub async fn list_specs(&self, allowed: &[String]) -> Vec<ToolSpec> {
        let tools = self.tools.read().await;
        let mut specs: Vec<ToolSpec> = if allowed.is_empty() {
            tools.values().map(|t| t.spec()).collect()
        } else {
            allowed
                .iter()
                .filter_map(|name| tools.get(name).map(|t| t.spec()))
                .collect()
        };
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Dispatch one call. Unknown tools and handler failures surface as
    /// errors; the engines turn those into failed steps.
    pub async fn run_tool(
        &self,
        ctx: &ToolContext,
        name: &str,
        args: Value,
    ) -> anyhow::Result<Value> {
        let tool = {
            let tools = self.tools.read().await;
            tools.get(name).cloned()
        };
        let Some(tool) = tool else {
            anyhow::bail!("unknown tool: {name}");
        };
        tool.execute(ctx, args).await
    }
}

/// OpenAI function-calling schema for a tool spec.
pub fn openai_tool_schema(spec: &ToolSpec) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": spec.name,
            "description": spec.description,
            "parameters": spec.input_schema,
        }
    })
}

pub(crate) const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".to_string(),
                description: "echo args".to_string(),
                input_schema: json!({"type": "object"}),
                risky: false,
            }
        }

        async fn execute(&self, _ctx: &ToolContext, args: Value) -> anyhow::Result<Value> {
            Ok(json!({"ok": true, "args": args}))
        }
    }

    fn ctx(dir: &std::path::Path) -> ToolContext {
        ToolContext {
            workspace_root: dir.to_path_buf(),
            artifacts_dir: dir.join("artifacts"),
            task_id: "t1".to_string(),
            step_id: "s1".to_string(),
        }
    }

    #[tokio::test]
    async fn duplicate_registration_is_an_error() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await.unwrap();
        assert!(registry.register(Arc::new(EchoTool)).await.is_err());
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let registry = ToolRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let err = registry
            .run_tool(&ctx(dir.path()), "missing.tool", json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown tool"));
    }

    #[tokio::test]
    async fn allowed_filter_limits_specs() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).await.unwrap();
        let all = registry.list_specs(&[]).await;
        assert_eq!(all.len(), 1);
        let none = registry.list_specs(&["other".to_string()]).await;
        assert!(none.is_empty());
    }
}
