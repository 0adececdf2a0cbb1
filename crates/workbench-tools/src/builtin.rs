use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::fs;

use workbench_runtime::{run_captured, spawn_child};

use crate::{Tool, ToolContext, ToolRegistry, ToolSpec, DEFAULT_TOOL_TIMEOUT};

#[derive(Debug, Clone)]
pub struct ShellOptions {
    pub enabled: bool,
    pub container_image: Option<String>,
    pub timeout: Duration,
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            container_image: None,
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }
}

/// Register the built-in tool set. Called once at startup.
pub async fn register_builtin_tools(
    registry: &ToolRegistry,
    shell: ShellOptions,
) -> anyhow::Result<()> {
    registry.register(Arc::new(FsListTool)).await?;
    registry.register(Arc::new(FsReadTextTool)).await?;
    registry.register(Arc::new(FsWriteTextTool)).await?;
    registry.register(Arc::new(FsMkdirTool)).await?;
    registry.register(Arc::new(FsMoveTool)).await?;
    registry.register(Arc::new(FsDeleteTool)).await?;
    registry.register(Arc::new(FsStatTool)).await?;
    if shell.enabled {
        registry.register(Arc::new(ShellExecTool { options: shell })).await?;
    }
    registry.register(Arc::new(WebFetchTool)).await?;
    Ok(())
}

/// Interpret a model-supplied path relative to the workspace root. A leading
/// `workspace/` refers to the root itself; absolute paths and `..` escapes are
/// rejected.
fn resolve(ctx: &ToolContext, raw: &str) -> anyhow::Result<PathBuf> {
    let mut s = raw.trim().replace('\\', "/");
    while let Some(stripped) = s.strip_prefix("./") {
        s = stripped.to_string();
    }
    if let Some(stripped) = s.strip_prefix("workspace/") {
        s = stripped.to_string();
    }
    if s.is_empty() || s == "." || s == "workspace" {
        return Ok(ctx.workspace_root.clone());
    }
    let rel = Path::new(&s);
    if rel.is_absolute() {
        anyhow::bail!("path escapes workspace: {raw}");
    }
    if rel
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        anyhow::bail!("path escapes workspace: {raw}");
    }
    Ok(ctx.workspace_root.join(rel))
}

fn arg_str<'a>(args: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("missing required argument: {key}"))
}

fn arg_bool(args: &Value, key: &str, default: bool) -> bool {
    args.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

fn rel_display(ctx: &ToolContext, path: &Path) -> String {
    path.strip_prefix(&ctx.workspace_root)
        .unwrap_or(path)
        .display()
        .to_string()
}

// ----------------------------------------------------------------------------
// Filesystem tools
// ----------------------------------------------------------------------------

struct FsListTool;

#[async_trait]
impl Tool for FsListTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "filesystem.list".to_string(),
            description: "List files/folders under the workspace.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "relative path under workspace"},
                    "recursive": {"type": "boolean", "default": false},
                    "include_hidden": {"type": "boolean", "default": false}
                },
                "required": []
            }),
            risky: false,
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<Value> {
        let rel = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let recursive = arg_bool(&args, "recursive", false);
        let include_hidden = arg_bool(&args, "include_hidden", false);
        let root = resolve(ctx, rel)?;
        if !root.exists() {
            anyhow::bail!("no such path: {rel}");
        }

        let mut items = Vec::new();
        if root.is_dir() {
            let mut pending = vec![root.clone()];
            while let Some(dir) = pending.pop() {
                let mut entries = fs::read_dir(&dir).await?;
                while let Some(entry) = entries.next_entry().await? {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if !include_hidden && name.starts_with('.') {
                        continue;
                    }
                    let path = entry.path();
                    let meta = entry.metadata().await?;
                    if meta.is_dir() {
                        items.push(json!({"path": rel_display(ctx, &path), "type": "dir"}));
                        if recursive {
                            pending.push(path);
                        }
                    } else {
                        items.push(json!({
                            "path": rel_display(ctx, &path),
                            "type": "file",
                            "size": meta.len()
                        }));
                    }
                }
            }
        } else {
            let meta = fs::metadata(&root).await?;
            items.push(json!({
                "path": rel_display(ctx, &root),
                "type": "file",
                "size": meta.len()
            }));
        }
        Ok(json!({"ok": true, "items": items}))
    }
}

struct FsReadTextTool;

#[async_trait]
impl Tool for FsReadTextTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "filesystem.read_text".to_string(),
            description: "Read a UTF-8 text file (truncates large files).".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "max_bytes": {"type": "integer", "default": 200000}
                },
                "required": ["path"]
            }),
            risky: false,
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<Value> {
        let rel = arg_str(&args, "path")?;
        let max_bytes = args
            .get("max_bytes")
            .and_then(|v| v.as_u64())
            .unwrap_or(200_000) as usize;
        let path = resolve(ctx, rel)?;
        let mut data = fs::read(&path).await?;
        let truncated = data.len() > max_bytes;
        if truncated {
            data.truncate(max_bytes);
        }
        let content = String::from_utf8_lossy(&data).to_string();
        Ok(json!({"ok": true, "path": rel, "truncated": truncated, "content": content}))
    }
}

struct FsWriteTextTool;

#[async_trait]
impl Tool for FsWriteTextTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "filesystem.write_text".to_string(),
            description: "Write (or append) a UTF-8 text file under workspace.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"},
                    "append": {"type": "boolean", "default": false}
                },
                "required": ["path", "content"]
            }),
            risky: true,
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<Value> {
        let rel = arg_str(&args, "path")?;
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let append = arg_bool(&args, "append", false);
        let path = resolve(ctx, rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        if append {
            let mut existing = fs::read_to_string(&path).await.unwrap_or_default();
            existing.push_str(content);
            fs::write(&path, existing).await?;
        } else {
            fs::write(&path, content).await?;
        }
        Ok(json!({"ok": true, "path": rel, "bytes": content.len()}))
    }
}

struct FsMkdirTool;

#[async_trait]
impl Tool for FsMkdirTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "filesystem.mkdir".to_string(),
            description: "Create a directory under workspace.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "exist_ok": {"type": "boolean", "default": true}
                },
                "required": ["path"]
            }),
            risky: true,
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<Value> {
        let rel = arg_str(&args, "path")?;
        let exist_ok = arg_bool(&args, "exist_ok", true);
        let path = resolve(ctx, rel)?;
        if path.exists() && !exist_ok {
            anyhow::bail!("directory already exists: {rel}");
        }
        fs::create_dir_all(&path).await?;
        Ok(json!({"ok": true, "path": rel}))
    }
}

struct FsMoveTool;

#[async_trait]
impl Tool for FsMoveTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "filesystem.move".to_string(),
            description: "Move/rename a file or folder within workspace.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "src": {"type": "string"},
                    "dst": {"type": "string"},
                    "overwrite": {"type": "boolean", "default": false}
                },
                "required": ["src", "dst"]
            }),
            risky: true,
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<Value> {
        let src_rel = arg_str(&args, "src")?;
        let dst_rel = arg_str(&args, "dst")?;
        let overwrite = arg_bool(&args, "overwrite", false);
        let src = resolve(ctx, src_rel)?;
        let dst = resolve(ctx, dst_rel)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await?;
        }
        if dst.exists() {
            if !overwrite {
                anyhow::bail!("destination already exists: {dst_rel}");
            }
            if dst.is_dir() {
                fs::remove_dir_all(&dst).await?;
            } else {
                fs::remove_file(&dst).await?;
            }
        }
        fs::rename(&src, &dst).await?;
        Ok(json!({"ok": true, "src": src_rel, "dst": dst_rel}))
    }
}

struct FsDeleteTool;

#[async_trait]
impl Tool for FsDeleteTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "filesystem.delete".to_string(),
            description: "Delete a file or folder under workspace.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "recursive": {"type": "boolean", "default": false}
                },
                "required": ["path"]
            }),
            risky: true,
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<Value> {
        let rel = arg_str(&args, "path")?;
        let recursive = arg_bool(&args, "recursive", false);
        let path = resolve(ctx, rel)?;
        if !path.exists() {
            return Ok(json!({"ok": true, "deleted": false, "path": rel}));
        }
        if path.is_dir() {
            if recursive {
                fs::remove_dir_all(&path).await?;
            } else {
                fs::remove_dir(&path).await?;
            }
        } else {
            fs::remove_file(&path).await?;
        }
        Ok(json!({"ok": true, "deleted": true, "path": rel}))
    }
}

struct FsStatTool;

#[async_trait]
impl Tool for FsStatTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "filesystem.stat".to_string(),
            description: "Get file/folder metadata.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
            risky: false,
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<Value> {
        let rel = arg_str(&args, "path")?;
        let path = resolve(ctx, rel)?;
        let meta = fs::metadata(&path).await?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Ok(json!({
            "ok": true,
            "path": rel,
            "is_dir": meta.is_dir(),
            "size": meta.len(),
            "mtime": mtime
        }))
    }
}

// ----------------------------------------------------------------------------
// Shell
// ----------------------------------------------------------------------------

struct ShellExecTool {
    options: ShellOptions,
}

#[async_trait]
impl Tool for ShellExecTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "shell.exec".to_string(),
            description: "Run a shell command in the workspace.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "timeout_s": {"type": "integer"}
                },
                "required": ["command"]
            }),
            risky: true,
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> anyhow::Result<Value> {
        let command_text = arg_str(&args, "command")?;
        let timeout = args
            .get("timeout_s")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs)
            .unwrap_or(self.options.timeout);

        let env = HashMap::new();
        let mut cmd = if let Some(image) = &self.options.container_image {
            let mount = format!("{}:/workspace", ctx.workspace_root.display());
            spawn_child(
                "docker",
                &[
                    "run".to_string(),
                    "--rm".to_string(),
                    "-v".to_string(),
                    mount,
                    "-w".to_string(),
                    "/workspace".to_string(),
                    image.clone(),
                    "sh".to_string(),
                    "-c".to_string(),
                    command_text.to_string(),
                ],
                &env,
            )
        } else {
            #[cfg(windows)]
            let cmd = spawn_child(
                "powershell",
                &[
                    "-NoProfile".to_string(),
                    "-Command".to_string(),
                    command_text.to_string(),
                ],
                &env,
            );
            #[cfg(not(windows))]
            let cmd = spawn_child(
                "sh",
                &["-c".to_string(), command_text.to_string()],
                &env,
            );
            cmd
        };
        if self.options.container_image.is_none() {
            cmd.current_dir(&ctx.workspace_root);
        }

        let out = run_captured(cmd, timeout).await?;
        if out.timed_out {
            anyhow::bail!("command timed out after {}s", timeout.as_secs());
        }
        Ok(json!({
            "ok": out.exit_code == Some(0),
            "exit_code": out.exit_code,
            "stdout": out.stdout,
            "stderr": out.stderr
        }))
    }
}

// ----------------------------------------------------------------------------
// Web
// ----------------------------------------------------------------------------

struct WebFetchTool;

#[async_trait]
impl Tool for WebFetchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "web.fetch".to_string(),
            description: "Fetch a URL and return its text body.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string"},
                    "max_bytes": {"type": "integer", "default": 200000}
                },
                "required": ["url"]
            }),
            risky: false,
        }
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> anyhow::Result<Value> {
        let url = arg_str(&args, "url")?;
        let max_bytes = args
            .get("max_bytes")
            .and_then(|v| v.as_u64())
            .unwrap_or(200_000) as usize;
        let response = reqwest::Client::new()
            .get(url)
            .timeout(DEFAULT_TOOL_TIMEOUT)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        let truncated = body.len() > max_bytes;
        let content: String = if truncated {
            body.chars().take(max_bytes).collect()
        } else {
            body
        };
        Ok(json!({
            "ok": status < 400,
            "url": url,
            "status": status,
            "truncated": truncated,
            "content": content
        }))
    }
}
