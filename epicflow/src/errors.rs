//! Typed failures the CLI distinguishes when reporting remediation.
//!
//! These travel inside `anyhow::Error` and are recovered with `downcast_ref`.

use thiserror::Error;

use crate::core::loop_detector::LoopReason;
use crate::core::types::{PipelinePhase, ResumePoint};

/// Manifest/directory mismatch or a missing artifact the current phase needs.
#[derive(Debug, Error)]
#[error("structural validation failed:\n- {}", .errors.join("\n- "))]
pub struct StructuralValidationError {
    pub errors: Vec<String>,
}

/// The agent process exited non-zero (or timed out) without a loop abort.
#[derive(Debug, Error)]
#[error("agent failed during {step}: {}", describe_exit(.exit_code, .timed_out))]
pub struct AdapterExecutionError {
    pub step: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// The agent was killed by the loop detector; the working tree was reset to
/// `checkpoint` before this error was raised.
#[derive(Debug, Error)]
#[error("loop detected during {step} ({reason}); rolled back to {checkpoint}")]
pub struct LoopDetectedError {
    pub step: String,
    pub checkpoint: String,
    pub reason: String,
    pub reset_ok: bool,
    pub clean_ok: bool,
}

/// A phase finished without moving the resume point past it.
#[derive(Debug, Error)]
#[error("{phase} did not advance the pipeline; next resume point is {next}")]
pub struct PhaseStalledError {
    pub phase: PipelinePhase,
    pub next: ResumePoint,
}

/// A step reported success but the expected on-disk marker did not change.
///
/// Not an error: logged and counted, and the pipeline continues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDriftWarning {
    pub step: String,
    pub detail: String,
}

impl LoopDetectedError {
    pub fn new(
        step: &str,
        checkpoint: &str,
        reason: Option<&LoopReason>,
        reset_ok: bool,
        clean_ok: bool,
    ) -> Self {
        Self {
            step: step.to_string(),
            checkpoint: checkpoint.to_string(),
            reason: reason.map_or_else(|| "agent stopped for looping".to_string(), ToString::to_string),
            reset_ok,
            clean_ok,
        }
    }
}

fn describe_exit(exit_code: &Option<i32>, timed_out: &bool) -> String {
    if *timed_out {
        return "timed out".to_string();
    }
    match exit_code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}
