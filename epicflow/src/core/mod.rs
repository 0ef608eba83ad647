//! Deterministic, pure logic shared by the pipeline.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod detector;
pub mod loop_detector;
pub mod snapshot;
pub mod stream;
pub mod types;
pub mod usage;
pub mod validation;
