//! Stable exit codes read by the CI scheduler.
//!
//! A child that ran to completion propagates its own code instead; these
//! values only surface when run-task aborts before or around the child.

/// Task command exited successfully.
pub const OK: i32 = 0;
/// Unexpected internal failure (I/O errors the task cannot influence).
pub const INTERNAL: i32 = 1;
/// Cache integrity violation; the scheduler purges caches and retries.
pub const PURGE_CACHE: i32 = 72;
/// Transient infrastructure failure (network, secrets service); retryable as-is.
pub const TRANSIENT: i32 = 75;
/// Privilege de-escalation impossible on this host.
pub const PRIVILEGE: i32 = 77;
/// Environment or task configuration defect; needs human action.
pub const CONFIGURATION: i32 = 78;
