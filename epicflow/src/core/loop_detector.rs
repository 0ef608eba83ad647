//! Sliding-window detection of an agent repeating itself.
//!
//! Two bounded windows are kept: one with a content hash of every tool call,
//! one with the error text of failing calls. A successful call clears the
//! error window but not the call window, since repeating the exact same call
//! is suspicious even when it trivially succeeds.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::core::types::ToolCallEvent;

/// Loop detector tuning (`[loop_detection]` in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopDetectionConfig {
    pub enabled: bool,
    /// Capacity of each sliding window.
    pub window: usize,
    /// Number of identical trailing entries that trigger an abort.
    pub threshold: usize,
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: 10,
            threshold: 3,
        }
    }
}

/// Why the detector asked for an abort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopReason {
    RepeatedCall { tool_name: String, count: usize },
    RepeatedError { message: String, count: usize },
}

impl std::fmt::Display for LoopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopReason::RepeatedCall { tool_name, count } => {
                write!(f, "{count} identical consecutive '{tool_name}' calls")
            }
            LoopReason::RepeatedError { message, count } => {
                write!(f, "{count} identical consecutive errors: {message}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopVerdict {
    pub should_abort: bool,
    pub reason: Option<LoopReason>,
}

impl LoopVerdict {
    fn proceed() -> Self {
        Self {
            should_abort: false,
            reason: None,
        }
    }

    fn abort(reason: LoopReason) -> Self {
        Self {
            should_abort: true,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone)]
struct ToolCallRecord {
    hash: String,
    tool_name: String,
}

/// Per-run detector state. Create a fresh one for every adapter run.
#[derive(Debug, Clone)]
pub struct LoopDetector {
    config: LoopDetectionConfig,
    calls: VecDeque<ToolCallRecord>,
    errors: VecDeque<String>,
}

impl LoopDetector {
    pub fn new(config: LoopDetectionConfig) -> Self {
        Self {
            calls: VecDeque::with_capacity(config.window),
            errors: VecDeque::with_capacity(config.window),
            config,
        }
    }

    /// Record one tool call and decide whether the run should be aborted.
    pub fn observe(&mut self, event: &ToolCallEvent) -> LoopVerdict {
        if !self.config.enabled {
            return LoopVerdict::proceed();
        }

        push_bounded(
            &mut self.calls,
            ToolCallRecord {
                hash: call_hash(&event.tool_name, &event.args),
                tool_name: event.tool_name.clone(),
            },
            self.config.window,
        );

        if event.result.is_error {
            let message = event
                .result
                .error_message
                .clone()
                .unwrap_or_else(|| format!("{} failed", event.tool_name));
            push_bounded(&mut self.errors, message, self.config.window);
        } else {
            self.errors.clear();
        }

        let threshold = self.config.threshold;
        if tail_identical(self.calls.iter().map(|c| c.hash.as_str()), threshold) {
            let tool_name = self
                .calls
                .back()
                .map(|c| c.tool_name.clone())
                .unwrap_or_default();
            return LoopVerdict::abort(LoopReason::RepeatedCall {
                tool_name,
                count: threshold,
            });
        }
        if tail_identical(self.errors.iter().map(String::as_str), threshold) {
            let message = self.errors.back().cloned().unwrap_or_default();
            return LoopVerdict::abort(LoopReason::RepeatedError {
                message,
                count: threshold,
            });
        }
        LoopVerdict::proceed()
    }
}

fn push_bounded<T>(window: &mut VecDeque<T>, item: T, capacity: usize) {
    if window.len() == capacity {
        window.pop_front();
    }
    window.push_back(item);
}

/// True if the last `threshold` items exist and are all equal.
fn tail_identical<'a>(items: impl DoubleEndedIterator<Item = &'a str>, threshold: usize) -> bool {
    let tail: Vec<&str> = items.rev().take(threshold).collect();
    tail.len() == threshold && tail.windows(2).all(|pair| pair[0] == pair[1])
}

/// SHA-256 over the tool name and canonical (key-sorted) JSON arguments.
pub fn call_hash(tool_name: &str, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(args).as_bytes());
    hex::encode(hasher.finalize())
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    format!(
                        "{}:{}",
                        Value::String(key.clone()),
                        canonical_json(&map[key])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}
