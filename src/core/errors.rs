//! Crate-wide error kinds for the supervisor core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("illegal transition for task '{task_id}': {detail}")]
    IllegalTransition { task_id: String, detail: String },

    #[error("run id mismatch for task '{task_id}': claim holds '{expected}', event carries '{actual}'")]
    RunIdMismatch {
        task_id: String,
        expected: String,
        actual: String,
    },

    #[error("verify failed for task '{task_id}': exit_code={exit_code}")]
    VerifyFailed { task_id: String, exit_code: i32 },

    #[error("worker timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("worker for run '{run_id}' produced no result document")]
    MalformedResult { run_id: String },

    #[error("task file parse error at {path}: {detail}")]
    ParseError { path: String, detail: String },

    #[error("could not acquire lock {path} within {waited_ms}ms")]
    LockContended { path: String, waited_ms: u64 },

    #[error("task file invariant violations:\n- {}", violations.join("\n- "))]
    InvariantViolation { violations: Vec<String> },

    #[error("intake validation failed for {doc}:\n- {}", errors.join("\n- "))]
    IntakeValidation { doc: String, errors: Vec<String> },

    #[error("refusing to delete archive of in-progress run '{run_id}'")]
    RetentionPolicyViolation { run_id: String },
}
