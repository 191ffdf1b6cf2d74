//! Stable exit codes for `contract-loop` commands.

/// The run succeeded (or `status` found a successful result).
pub const OK: i32 = 0;
/// Invalid input, configuration, or a run-level failure.
pub const FAILED: i32 = 1;
/// The run escalated after exhausting its attempts.
pub const ESCALATED: i32 = 2;
/// Spawn mode: a checkpoint for the next attempt was written.
pub const RETRY_PENDING: i32 = 3;
