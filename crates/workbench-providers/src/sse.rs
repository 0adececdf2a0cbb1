use serde_json::Value;

use crate::{coerce_text, ChatResponse, ToolCall, ToolCallAcc};

/// Incremental parser for an OpenAI-compatible SSE chat stream.
///
/// Feed it decoded lines (without trailing newlines); it reassembles events
/// across multi-line `data:` frames, accumulates text / reasoning / tool-call
/// deltas, and accepts full `message` objects in place of deltas.
#[derive(Default)]
pub struct SseAccumulator {
    data_buf: Vec<String>,
    content: String,
    reasoning: String,
    tool_calls: ToolCallAcc,
    usage: Option<Value>,
    error: Option<String>,
    done: bool,
}

impl SseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one stream line. Returns `true` once the stream has terminated.
    pub fn push_line(&mut self, line: &str) -> bool {
        if self.done {
            return true;
        }

        // Blank line ends the current SSE event; parse whatever accumulated.
        if line.trim().is_empty() {
            if !self.data_buf.is_empty() {
                let data = self.data_buf.join("");
                self.data_buf.clear();
                self.consume_data(data.trim());
            }
            return self.done;
        }

        let stripped = line.trim_start();
        let Some(part) = stripped.strip_prefix("data:") else {
            return false;
        };
        let part = part.trim_start();
        if part.is_empty() {
            return false;
        }
        if part == "[DONE]" {
            self.done = true;
            return true;
        }
        self.data_buf.push(part.to_string());

        // Some gateways omit the blank-line delimiter; parse eagerly when the
        // accumulated payload is already valid JSON.
        let candidate = self.data_buf.join("");
        let candidate = candidate.trim();
        if candidate.starts_with('{') || candidate.starts_with('[') {
            if let Ok(value) = serde_json::from_str::<Value>(candidate) {
                self.data_buf.clear();
                self.apply_event(&value);
            }
        }
        self.done
    }

    pub fn stream_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn finish(self) -> ChatResponse {
        let mut content = self.content;
        let tool_calls: Vec<ToolCall> = self
            .tool_calls
            .into_values()
            .filter(|c| !c.name.is_empty())
            .collect();
        let mut raw = serde_json::json!({});
        if let Some(usage) = self.usage {
            raw["usage"] = usage;
        }
        if content.is_empty() && tool_calls.is_empty() && !self.reasoning.is_empty() {
            // Tokens that only ever arrived as reasoning deltas become the content.
            content = self.reasoning.clone();
        }
        if !self.reasoning.is_empty() {
            raw["reasoning_content"] = Value::String(self.reasoning);
        }
        ChatResponse {
            content,
            tool_calls,
            raw,
        }
    }

    fn consume_data(&mut self, data: &str) {
        if data.is_empty() {
            return;
        }
        if data == "[DONE]" {
            self.done = true;
            return;
        }
        if let Ok(value) = serde_json::from_str::<Value>(data) {
            self.apply_event(&value);
        }
    }

    fn apply_event(&mut self, event: &Value) {
        if self.error.is_some() {
            return;
        }
        if let Some(err) = event.get("error") {
            let message = err
                .get("message")
                .or_else(|| err.get("error"))
                .or_else(|| err.get("type"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown_error");
            self.error = Some(message.to_string());
            return;
        }
        if let Some(usage) = event.get("usage").filter(|v| v.is_object()) {
            self.usage = Some(usage.clone());
        }
        let Some(choices) = event.get("choices").and_then(|v| v.as_array()) else {
            return;
        };
        for choice in choices {
            if let Some(delta) = choice.get("delta").filter(|v| v.is_object()) {
                self.apply_delta(delta);
                continue;
            }
            // Full message objects instead of deltas.
            if let Some(msg) = choice.get("message").filter(|v| v.is_object()) {
                let text = coerce_text(&msg.get("content").cloned().unwrap_or(Value::Null));
                if !text.is_empty() {
                    self.content.push_str(&text);
                }
                let reasoning = reasoning_text(msg);
                if !reasoning.is_empty() {
                    self.reasoning.push_str(&reasoning);
                }
                for (i, call) in crate::parse_message_tool_calls(msg).into_iter().enumerate() {
                    self.tool_calls.insert(i as u64, call);
                }
            }
        }
    }

    fn apply_delta(&mut self, delta: &Value) {
        let text = coerce_text(&delta.get("content").cloned().unwrap_or(Value::Null));
        if !text.is_empty() {
            self.content.push_str(&text);
        }
        let reasoning = reasoning_text(delta);
        if !reasoning.is_empty() {
            self.reasoning.push_str(&reasoning);
        }

        if let Some(calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
            for call in calls {
                let index = call.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
                let entry = self.tool_calls.entry(index).or_default();
                if let Some(id) = call.get("id").and_then(|v| v.as_str()) {
                    if !id.is_empty() {
                        entry.id = id.to_string();
                    }
                }
                if let Some(function) = call.get("function").filter(|v| v.is_object()) {
                    if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                        if !name.is_empty() {
                            entry.name = name.to_string();
                        }
                    }
                    if let Some(args) = function.get("arguments").and_then(|v| v.as_str()) {
                        entry.arguments.push_str(args);
                    }
                }
            }
        }

        // Legacy single function_call deltas map onto slot 0.
        if let Some(fn_call) = delta.get("function_call").filter(|v| v.is_object()) {
            let entry = self.tool_calls.entry(0).or_default();
            if let Some(name) = fn_call.get("name").and_then(|v| v.as_str()) {
                if !name.is_empty() {
                    entry.name = name.to_string();
                }
            }
            if let Some(args) = fn_call.get("arguments").and_then(|v| v.as_str()) {
                entry.arguments.push_str(args);
            }
        }
    }
}

fn reasoning_text(obj: &Value) -> String {
    let primary = coerce_text(&obj.get("reasoning_content").cloned().unwrap_or(Value::Null));
    if !primary.is_empty() {
        return primary;
    }
    coerce_text(&obj.get("reasoning").cloned().unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(lines: &[&str]) -> SseAccumulator {
        let mut acc = SseAccumulator::new();
        for line in lines {
            acc.push_line(line);
        }
        acc
    }

    #[test]
    fn accumulates_text_deltas() {
        let acc = feed(&[
            r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#,
            "",
            r#"data: {"choices":[{"delta":{"content":"lo"}}]}"#,
            "",
            "data: [DONE]",
        ]);
        assert_eq!(acc.finish().content, "Hello");
    }

    #[test]
    fn concatenates_multi_line_data_frames() {
        let acc = feed(&[
            r#"data: {"choices":[{"delta":"#,
            r#"data: {"content":"split"}}]}"#,
            "",
            "data: [DONE]",
        ]);
        assert_eq!(acc.finish().content, "split");
    }

    #[test]
    fn reasoning_only_stream_falls_back_to_reasoning() {
        let acc = feed(&[
            r#"data: {"choices":[{"delta":{"reasoning_content":"internal "}}]}"#,
            "",
            r#"data: {"choices":[{"delta":{"reasoning_content":"answer"}}]}"#,
            "",
            "data: [DONE]",
        ]);
        assert_eq!(acc.finish().content, "internal answer");
    }

    #[test]
    fn content_wins_over_reasoning() {
        let acc = feed(&[
            r#"data: {"choices":[{"delta":{"reasoning_content":"thinking"}}]}"#,
            "",
            r#"data: {"choices":[{"delta":{"content":"final"}}]}"#,
            "",
            "data: [DONE]",
        ]);
        assert_eq!(acc.finish().content, "final");
    }

    #[test]
    fn reassembles_tool_call_deltas_by_index() {
        let acc = feed(&[
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"filesystem.write_text","arguments":"{\"pa"}}]}}]}"#,
            "",
            r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"th\":\"a.txt\"}"}}]}}]}"#,
            "",
            "data: [DONE]",
        ]);
        let resp = acc.finish();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].id, "c1");
        assert_eq!(resp.tool_calls[0].name, "filesystem.write_text");
        assert_eq!(resp.tool_calls[0].arguments, r#"{"path":"a.txt"}"#);
    }

    #[test]
    fn accepts_full_message_objects() {
        let acc = feed(&[
            r#"data: {"choices":[{"message":{"content":"whole message"}}]}"#,
            "",
            "data: [DONE]",
        ]);
        assert_eq!(acc.finish().content, "whole message");
    }

    #[test]
    fn surfaces_gateway_errors() {
        let acc = feed(&[r#"data: {"error":{"message":"quota exceeded"}}"#, ""]);
        assert_eq!(acc.stream_error(), Some("quota exceeded"));
    }

    #[test]
    fn ignores_non_data_lines() {
        let acc = feed(&[
            ": keep-alive",
            "event: message",
            r#"data: {"choices":[{"delta":{"content":"ok"}}]}"#,
            "",
            "data: [DONE]",
        ]);
        assert_eq!(acc.finish().content, "ok");
    }
}
