//! Shared deterministic types for pipeline core logic.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stage of the pipeline owned by this engine.
///
/// Numbering starts at 3; phases 1 and 2 belong to the upstream planning steps
/// that create the epic and its requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    CreateFeatures = 3,
    CreateTasks = 4,
    CreateTaskPrompts = 5,
    Implement = 6,
    Finalize = 7,
}

impl PipelinePhase {
    pub const ALL: [PipelinePhase; 5] = [
        PipelinePhase::CreateFeatures,
        PipelinePhase::CreateTasks,
        PipelinePhase::CreateTaskPrompts,
        PipelinePhase::Implement,
        PipelinePhase::Finalize,
    ];

    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelinePhase::CreateFeatures => "create-features",
            PipelinePhase::CreateTasks => "create-tasks",
            PipelinePhase::CreateTaskPrompts => "create-task-prompts",
            PipelinePhase::Implement => "implement",
            PipelinePhase::Finalize => "finalize",
        }
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "phase {} ({})", self.number(), self.as_str())
    }
}

/// Where the next invocation continues.
///
/// Derived from disk on every call and never persisted. `Complete` is the
/// terminal form of [`PipelinePhase::Finalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResumePoint {
    CreateFeatures,
    CreateTasks {
        feature_index: usize,
    },
    CreateTaskPrompts {
        feature_index: usize,
    },
    Implement {
        feature_index: usize,
        task_group_index: usize,
    },
    Finalize,
    Complete,
}

impl ResumePoint {
    pub fn phase(&self) -> PipelinePhase {
        match self {
            ResumePoint::CreateFeatures => PipelinePhase::CreateFeatures,
            ResumePoint::CreateTasks { .. } => PipelinePhase::CreateTasks,
            ResumePoint::CreateTaskPrompts { .. } => PipelinePhase::CreateTaskPrompts,
            ResumePoint::Implement { .. } => PipelinePhase::Implement,
            ResumePoint::Finalize | ResumePoint::Complete => PipelinePhase::Finalize,
        }
    }

    pub fn feature_index(&self) -> Option<usize> {
        match *self {
            ResumePoint::CreateTasks { feature_index }
            | ResumePoint::CreateTaskPrompts { feature_index }
            | ResumePoint::Implement { feature_index, .. } => Some(feature_index),
            _ => None,
        }
    }

    pub fn task_group_index(&self) -> Option<usize> {
        match *self {
            ResumePoint::Implement {
                task_group_index, ..
            } => Some(task_group_index),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, ResumePoint::Complete)
    }
}

impl fmt::Display for ResumePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumePoint::CreateFeatures | ResumePoint::Finalize => write!(f, "{}", self.phase()),
            ResumePoint::CreateTasks { feature_index }
            | ResumePoint::CreateTaskPrompts { feature_index } => {
                write!(f, "{}, feature #{}", self.phase(), feature_index + 1)
            }
            ResumePoint::Implement {
                feature_index,
                task_group_index,
            } => write!(
                f,
                "{}, feature #{}, task group #{}",
                self.phase(),
                feature_index + 1,
                task_group_index + 1
            ),
            ResumePoint::Complete => write!(f, "{} (all complete)", self.phase()),
        }
    }
}

/// Token counts reported by one adapter run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
}

/// Outcome of a tool invocation as seen in the agent's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub is_error: bool,
    /// Error text extracted from the result when `is_error` is set.
    pub error_message: Option<String>,
}

impl ToolResult {
    pub fn ok() -> Self {
        Self {
            is_error: false,
            error_message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            error_message: Some(message.into()),
        }
    }
}

/// A completed tool call observed while the agent runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallEvent {
    pub tool_name: String,
    pub args: serde_json::Value,
    pub result: ToolResult,
}

impl ToolCallEvent {
    pub fn new(tool_name: impl Into<String>, args: serde_json::Value, result: ToolResult) -> Self {
        Self {
            tool_name: tool_name.into(),
            args,
            result,
        }
    }
}
