use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use workbench_types::McpServerEntry;

use crate::spawn::{run_captured, spawn_child};

const HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(5);
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct McpHealthReport {
    pub ok: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run the server command with its healthcheck args (default `--version`) and
/// report what happened. Never errors; failures land in the report.
pub async fn healthcheck(entry: &McpServerEntry) -> McpHealthReport {
    let args = if entry.healthcheck_args.is_empty() {
        vec!["--version".to_string()]
    } else {
        entry.healthcheck_args.clone()
    };
    let cmd = spawn_child(&entry.command, &args, &entry.env);
    match run_captured(cmd, HEALTHCHECK_TIMEOUT).await {
        Ok(out) if out.timed_out => McpHealthReport {
            ok: false,
            exit_code: None,
            stdout: out.stdout,
            stderr: out.stderr,
            error: Some("healthcheck timed out".to_string()),
        },
        Ok(out) => McpHealthReport {
            ok: true,
            exit_code: out.exit_code,
            stdout: out.stdout,
            stderr: out.stderr,
            error: None,
        },
        Err(err) => McpHealthReport {
            ok: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: Some(err.to_string()),
        },
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct McpToolInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

struct McpIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// JSON-RPC client over a spawned MCP server's stdio, newline-delimited.
pub struct McpClient {
    server_name: String,
    _child: Child,
    io: Arc<Mutex<McpIo>>,
    next_id: AtomicU64,
}

impl McpClient {
    /// Spawn the server process and run the `initialize` handshake.
    pub async fn connect(entry: &McpServerEntry) -> anyhow::Result<Self> {
        let mut cmd = spawn_child(&entry.command, &entry.args, &entry.env);
        cmd.kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn mcp server `{}`", entry.name))?;
        let stdin = child.stdin.take().context("mcp server stdin unavailable")?;
        let stdout = child
            .stdout
            .take()
            .context("mcp server stdout unavailable")?;

        let client = Self {
            server_name: entry.name.clone(),
            _child: child,
            io: Arc::new(Mutex::new(McpIo {
                stdin,
                stdout: BufReader::new(stdout),
            })),
            next_id: AtomicU64::new(1),
        };

        client
            .request(
                "initialize",
                json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {"name": "workbench", "version": env!("CARGO_PKG_VERSION")}
                }),
            )
            .await
            .context("mcp initialize failed")?;
        client.notify("notifications/initialized", json!({})).await?;
        Ok(client)
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub async fn list_tools(&self) -> anyhow::Result<Vec<McpToolInfo>> {
        let result = self.request("tools/list", json!({})).await?;
        let tools = result
            .get("tools")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(tools
            .into_iter()
            .filter_map(|t| serde_json::from_value(t).ok())
            .collect())
    }

    pub async fn call_tool(&self, tool: &str, args: Value) -> anyhow::Result<Value> {
        let result = self
            .request("tools/call", json!({"name": tool, "arguments": args}))
            .await?;
        if result
            .get("isError")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            anyhow::bail!(
                "mcp tool `{tool}` failed: {}",
                content_text(&result).unwrap_or_else(|| result.to_string())
            );
        }
        Ok(result)
    }

    async fn request(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        let mut io = self.io.lock().await;
        let line = serde_json::to_string(&frame)?;
        io.stdin.write_all(line.as_bytes()).await?;
        io.stdin.write_all(b"\n").await?;
        io.stdin.flush().await?;

        // Skip notifications and unrelated responses until our id answers.
        let deadline = tokio::time::Instant::now() + RPC_TIMEOUT;
        loop {
            let mut line = String::new();
            let read = tokio::time::timeout_at(deadline, io.stdout.read_line(&mut line))
                .await
                .with_context(|| format!("mcp `{method}` timed out"))??;
            if read == 0 {
                anyhow::bail!("mcp server `{}` closed its stdout", self.server_name);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
                continue;
            };
            if value.get("id").and_then(|v| v.as_u64()) != Some(id) {
                continue;
            }
            if let Some(err) = value.get("error") {
                anyhow::bail!(
                    "mcp `{method}` error: {}",
                    err.get("message").and_then(|v| v.as_str()).unwrap_or("unknown")
                );
            }
            return Ok(value.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    async fn notify(&self, method: &str, params: Value) -> anyhow::Result<()> {
        let frame = json!({"jsonrpc": "2.0", "method": method, "params": params});
        let mut io = self.io.lock().await;
        let line = serde_json::to_string(&frame)?;
        io.stdin.write_all(line.as_bytes()).await?;
        io.stdin.write_all(b"\n").await?;
        io.stdin.flush().await?;
        Ok(())
    }
}

fn content_text(result: &Value) -> Option<String> {
    let content = result.get("content")?.as_array()?;
    let texts: Vec<&str> = content
        .iter()
        .filter_map(|c| c.get("text").and_then(|t| t.as_str()))
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use workbench_types::now_iso;

    fn entry(command: &str, healthcheck_args: Vec<String>) -> McpServerEntry {
        McpServerEntry {
            id: "m1".to_string(),
            name: "test".to_string(),
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            healthcheck_args,
            enabled: true,
            created_at: now_iso(),
            updated_at: now_iso(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn healthcheck_reports_exit_code_and_output() {
        let report = healthcheck(&entry("sh", vec!["-c".into(), "echo v1.2.3".into()])).await;
        assert!(report.ok);
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(report.stdout.trim(), "v1.2.3");
    }

    #[tokio::test]
    async fn healthcheck_surfaces_spawn_failures() {
        let report = healthcheck(&entry("definitely-not-a-real-binary-xyz", Vec::new())).await;
        assert!(!report.ok);
        assert!(report.error.is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn client_round_trips_tools_list_and_call() {
        // A minimal line-oriented MCP echo server written in shell + python.
        let script = r#"
import json, sys
for line in sys.stdin:
    req = json.loads(line)
    if req.get("method") == "notifications/initialized":
        continue
    rid = req.get("id")
    method = req.get("method")
    if method == "initialize":
        result = {"serverInfo": {"name": "fake"}}
    elif method == "tools/list":
        result = {"tools": [{"name": "echo", "description": "echo args", "inputSchema": {"type": "object"}}]}
    elif method == "tools/call":
        result = {"content": [{"type": "text", "text": json.dumps(req["params"]["arguments"])}]}
    else:
        result = {}
    sys.stdout.write(json.dumps({"jsonrpc": "2.0", "id": rid, "result": result}) + "\n")
    sys.stdout.flush()
"#;
        let mut entry = entry("python3", Vec::new());
        entry.args = vec!["-c".to_string(), script.to_string()];

        let client = match McpClient::connect(&entry).await {
            Ok(client) => client,
            // Environments without python3 skip the round trip.
            Err(_) => return,
        };
        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let result = client
            .call_tool("echo", json!({"message": "hi"}))
            .await
            .unwrap();
        let text = content_text(&result).unwrap();
        assert!(text.contains("\"message\""));
    }
}
