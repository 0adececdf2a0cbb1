use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

mod sse;

pub use sse::SseAccumulator;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// A completed tool call reassembled from streamed deltas.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Option<Vec<Value>>,
    pub temperature: f64,
    pub json_object: bool,
    pub timeout: Option<Duration>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: None,
            temperature: 0.2,
            json_object: false,
            timeout: None,
        }
    }

    pub fn json(mut self) -> Self {
        self.json_object = true;
        self
    }

    pub fn with_tools(mut self, tools: Vec<Value>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub raw: Value,
}

impl ChatResponse {
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.tool_calls.is_empty()
    }
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse>;
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const EMPTY_STREAM_ATTEMPTS: usize = 3;

/// OpenAI-compatible chat client hardened against gateway quirks: multi-line
/// `data:` frames, JSON bodies returned despite `stream=true`, tokens arriving
/// only as `reasoning_content`, and transiently empty streams.
pub struct OpenAiCompatProvider {
    base_url: String,
    api_key: String,
    client: Client,
}

impl OpenAiCompatProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base(&base_url.into()),
            api_key: api_key.into(),
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn payload(req: &ChatRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": req.model,
            "messages": req.messages,
            "temperature": req.temperature,
            "stream": stream,
        });
        if req.json_object {
            body["response_format"] = json!({"type": "json_object"});
        }
        if let Some(tools) = &req.tools {
            if !tools.is_empty() {
                body["tools"] = Value::Array(tools.clone());
                body["tool_choice"] = json!("auto");
            }
        }
        body
    }

    async fn chat_streaming_once(&self, req: &ChatRequest) -> anyhow::Result<ChatResponse> {
        let timeout = req.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let response = self
            .client
            .post(self.url("chat/completions"))
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .timeout(timeout)
            .json(&Self::payload(req, true))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "chat/completions failed: {} {}",
                status,
                truncate(&body, 800)
            );
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();
        if !content_type.contains("text/event-stream") {
            // Gateway ignored stream=true; parse the whole body as one response.
            let body: Value = response.json().await?;
            return Ok(parse_non_streaming(&body));
        }

        let mut acc = SseAccumulator::new();
        let mut bytes = response.bytes_stream();
        let mut line_buf = String::new();
        'outer: while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            line_buf.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = line_buf.find('\n') {
                let line = line_buf[..pos].trim_end_matches('\r').to_string();
                line_buf = line_buf[pos + 1..].to_string();
                if acc.push_line(&line) {
                    break 'outer;
                }
            }
        }
        if !line_buf.trim().is_empty() {
            acc.push_line(line_buf.trim_end());
            acc.push_line("");
        }

        if let Some(detail) = acc.stream_error() {
            anyhow::bail!("gateway stream error: {detail}");
        }
        Ok(acc.finish())
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    async fn chat(&self, req: ChatRequest) -> anyhow::Result<ChatResponse> {
        let mut last = ChatResponse::default();
        for attempt in 1..=EMPTY_STREAM_ATTEMPTS {
            let response = self.chat_streaming_once(&req).await?;
            if !response.is_empty() {
                return Ok(response);
            }
            tracing::warn!(attempt, model = %req.model, "provider returned an empty stream");
            last = response;
        }
        Ok(last)
    }
}

fn normalize_base(input: &str) -> String {
    let trimmed = input.trim_end_matches('/');
    if trimmed.ends_with("/v1") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/v1")
    }
}

fn truncate(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        let mut end = max_len;
        while !input.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &input[..end])
    }
}

/// Pull text out of structured content blocks (`{"text": ...}`, arrays of them).
pub(crate) fn coerce_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(coerce_text).collect::<Vec<_>>().join(""),
        Value::Object(map) => {
            for key in ["text", "content", "value"] {
                if let Some(v) = map.get(key) {
                    if let Some(s) = v.as_str() {
                        if !s.is_empty() {
                            return s.to_string();
                        }
                    }
                    let nested = coerce_text(v);
                    if !nested.is_empty() {
                        return nested;
                    }
                }
            }
            String::new()
        }
        _ => String::new(),
    }
}

pub(crate) fn parse_message_tool_calls(msg: &Value) -> Vec<ToolCall> {
    let mut out = Vec::new();
    let Some(calls) = msg.get("tool_calls").and_then(|v| v.as_array()) else {
        return out;
    };
    for call in calls {
        let function = call.get("function").cloned().unwrap_or_default();
        let name = function
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if name.is_empty() {
            continue;
        }
        out.push(ToolCall {
            id: call
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            name,
            arguments: function
                .get("arguments")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        });
    }
    out
}

pub(crate) fn parse_non_streaming(body: &Value) -> ChatResponse {
    let msg = body
        .get("choices")
        .and_then(|v| v.get(0))
        .and_then(|v| v.get("message"))
        .cloned()
        .unwrap_or_default();
    let mut content = coerce_text(&msg.get("content").cloned().unwrap_or(Value::Null));
    let tool_calls = parse_message_tool_calls(&msg);
    if content.is_empty() && tool_calls.is_empty() {
        content = coerce_text(&msg.get("reasoning_content").cloned().unwrap_or(Value::Null));
        if content.is_empty() {
            content = coerce_text(&msg.get("reasoning").cloned().unwrap_or(Value::Null));
        }
    }
    ChatResponse {
        content,
        tool_calls,
        raw: body.clone(),
    }
}

pub(crate) type ToolCallAcc = BTreeMap<u64, ToolCall>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn base_url_gains_v1_exactly_once() {
        assert_eq!(normalize_base("https://api.example.com"), "https://api.example.com/v1");
        assert_eq!(normalize_base("https://api.example.com/v1/"), "https://api.example.com/v1");
    }

    #[test]
    fn non_streaming_body_parses_content_and_tool_calls() {
        let body = json!({
            "choices": [{"message": {
                "content": "hello",
                "tool_calls": [{"id": "c1", "function": {"name": "filesystem.list", "arguments": "{}"}}]
            }}]
        });
        let resp = parse_non_streaming(&body);
        assert_eq!(resp.content, "hello");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].name, "filesystem.list");
    }

    #[test]
    fn non_streaming_falls_back_to_reasoning_content() {
        let body = json!({
            "choices": [{"message": {"content": "", "reasoning_content": "thought output"}}]
        });
        let resp = parse_non_streaming(&body);
        assert_eq!(resp.content, "thought output");
    }

    #[test]
    fn coerce_text_handles_block_lists() {
        let value = json!([{"type": "text", "text": "a"}, {"type": "text", "text": {"value": "b"}}]);
        assert_eq!(coerce_text(&value), "ab");
    }
}
