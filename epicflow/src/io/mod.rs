//! I/O helpers for the pipeline: git, manifests, processes, and the agent.

pub mod adapter;
pub mod checkpoint;
pub mod config;
pub mod git;
pub mod instructions;
pub mod layout;
pub mod manifest_store;
pub mod process;
