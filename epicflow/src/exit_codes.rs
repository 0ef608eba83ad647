//! Stable exit codes for epicflow CLI commands.

/// Command succeeded; for `run`, the epic is complete.
pub const OK: i32 = 0;
/// Invalid epic layout, manifest mismatch, bad config, or other errors.
pub const INVALID: i32 = 1;
/// The agent exited non-zero or timed out.
pub const ADAPTER_FAILED: i32 = 2;
/// The agent was stopped for looping and the step was rolled back.
pub const LOOP_DETECTED: i32 = 3;
/// A phase ran but the on-disk state did not move past it.
pub const STALLED: i32 = 4;
