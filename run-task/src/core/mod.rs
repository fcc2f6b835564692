//! Deterministic, pure logic shared by the run-task stages.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod invariants;
pub mod marker;
pub mod privilege;
pub mod state;
pub mod types;
