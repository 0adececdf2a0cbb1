use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Build a child-process command with piped stdio. The one place the codebase
/// branches on OS: windowed hosts must not flash a console for every tool call.
pub fn spawn_child(program: &str, args: &[String], env: &HashMap<String, String>) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in env {
        cmd.env(key, value);
    }
    #[cfg(windows)]
    {
        // CREATE_NO_WINDOW
        cmd.creation_flags(0x0800_0000);
    }
    cmd
}

#[derive(Debug, Clone, Serialize)]
pub struct CapturedOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// Run a command to completion, capturing output. On timeout the child is
/// killed and `timed_out` is set.
pub async fn run_captured(mut cmd: Command, timeout: Duration) -> anyhow::Result<CapturedOutput> {
    cmd.stdin(Stdio::null());
    cmd.kill_on_drop(true);
    let child = cmd.spawn()?;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            Ok(CapturedOutput {
                exit_code: output.status.code(),
                stdout: truncate_output(&String::from_utf8_lossy(&output.stdout)),
                stderr: truncate_output(&String::from_utf8_lossy(&output.stderr)),
                timed_out: false,
            })
        }
        Err(_) => Ok(CapturedOutput {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: true,
        }),
    }
}

fn truncate_output(text: &str) -> String {
    const MAX: usize = 4000;
    if text.len() <= MAX {
        return text.to_string();
    }
    let mut end = MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
