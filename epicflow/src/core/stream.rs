//! Parser for newline-delimited JSON agent streams.
//!
//! The stream interleaves `assistant` messages carrying `tool_use` blocks with
//! `user` messages carrying the matching `tool_result` blocks, and ends with a
//! single `result` record holding usage and cost. A [`ToolCallEvent`] is
//! emitted once the result for a pending tool use arrives.

use std::collections::HashMap;

use serde_json::Value;

use crate::core::types::{TokenUsage, ToolCallEvent, ToolResult};

const ERROR_MESSAGE_LIMIT: usize = 500;

/// Totals taken from the final `result` record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSummary {
    pub usage: Option<TokenUsage>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub is_error: Option<bool>,
}

#[derive(Debug, Default)]
pub struct StreamParser {
    pending: HashMap<String, (String, Value)>,
    summary: StreamSummary,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one line; returns the tool calls it completed.
    ///
    /// Lines that are not JSON objects are ignored.
    pub fn feed_line(&mut self, line: &str) -> Vec<ToolCallEvent> {
        let Ok(value) = serde_json::from_str::<Value>(line.trim()) else {
            return Vec::new();
        };
        match value.get("type").and_then(Value::as_str) {
            Some("assistant") => {
                self.record_tool_uses(&value);
                Vec::new()
            }
            Some("user") => self.complete_tool_results(&value),
            Some("result") => {
                self.record_result(&value);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    pub fn into_summary(self) -> StreamSummary {
        self.summary
    }

    fn record_tool_uses(&mut self, value: &Value) {
        for block in content_blocks(value) {
            if block.get("type").and_then(Value::as_str) != Some("tool_use") {
                continue;
            }
            let Some(id) = block.get("id").and_then(Value::as_str) else {
                continue;
            };
            let name = block
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            let input = block.get("input").cloned().unwrap_or(Value::Null);
            self.pending.insert(id.to_string(), (name, input));
        }
    }

    fn complete_tool_results(&mut self, value: &Value) -> Vec<ToolCallEvent> {
        let mut events = Vec::new();
        for block in content_blocks(value) {
            if block.get("type").and_then(Value::as_str) != Some("tool_result") {
                continue;
            }
            let Some(id) = block.get("tool_use_id").and_then(Value::as_str) else {
                continue;
            };
            let Some((name, input)) = self.pending.remove(id) else {
                continue;
            };
            let is_error = block
                .get("is_error")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let result = if is_error {
                ToolResult::error(result_text(block.get("content")))
            } else {
                ToolResult::ok()
            };
            events.push(ToolCallEvent::new(name, input, result));
        }
        events
    }

    fn record_result(&mut self, value: &Value) {
        let usage = value.get("usage").map(|usage| TokenUsage {
            input_tokens: u64_field(usage, "input_tokens"),
            output_tokens: u64_field(usage, "output_tokens"),
            cache_read_tokens: u64_field(usage, "cache_read_input_tokens"),
            cache_creation_tokens: u64_field(usage, "cache_creation_input_tokens"),
        });
        self.summary = StreamSummary {
            usage,
            cost_usd: value.get("total_cost_usd").and_then(Value::as_f64),
            duration_ms: value.get("duration_ms").and_then(Value::as_u64),
            is_error: value.get("is_error").and_then(Value::as_bool),
        };
    }
}

fn content_blocks(value: &Value) -> impl Iterator<Item = &Value> {
    value
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn u64_field(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

/// Flatten a tool result's `content` (string or text blocks) into one message.
fn result_text(content: Option<&Value>) -> String {
    let text = match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    };
    let text = text.trim();
    if text.is_empty() {
        return "tool returned an error".to_string();
    }
    text.chars().take(ERROR_MESSAGE_LIMIT).collect()
}
