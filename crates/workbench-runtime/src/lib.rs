pub mod mcp;
pub mod spawn;

pub use mcp::{healthcheck, McpClient, McpHealthReport, McpToolInfo};
pub use spawn::{run_captured, spawn_child, CapturedOutput};
