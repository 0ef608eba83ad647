//! Resumable orchestration engine for planning-artifact pipelines.
//!
//! Given an epic directory that a previous run may have left half finished,
//! the engine works out where to resume, drives an external coding agent
//! through the remaining phases, stops the agent when it starts repeating
//! itself, and commits or rolls back each step through git.
//!
//! - **[`core`]**: Pure, deterministic logic (resume-point decision tree,
//!   index validation, loop detection, agent stream parsing). No I/O.
//! - **[`io`]**: Side-effecting operations (git, manifests, process
//!   execution, the agent adapter, config).
//!
//! Orchestration modules ([`detect`], [`pipeline`]) combine the two to
//! implement the CLI commands.

pub mod core;
pub mod detect;
pub mod errors;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod manifest;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
