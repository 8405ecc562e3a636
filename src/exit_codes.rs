//! Stable exit codes for the supervisor CLI.

/// Command succeeded.
pub const OK: i32 = 0;
/// Runtime error (store corruption, lock contention, I/O failure).
pub const RUNTIME_ERROR: i32 = 1;
/// Usage error (invalid flags); also what clap exits with on its own.
pub const USAGE_ERROR: i32 = 2;
/// A blocked task was encountered; human intervention required.
pub const BLOCKED: i32 = 3;
