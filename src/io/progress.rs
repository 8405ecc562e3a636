//! Append-only progress log for human audit.
//!
//! Every state transition and supervisor-level event appends a timestamped
//! multi-line block. The file is never rewritten or truncated. This is
//! product output, independent of `RUST_LOG` diagnostics.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::core::task::Config;

const RULE: &str = "============================================================";

/// Append-only writer over `progress.txt`.
#[derive(Debug, Clone)]
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn stamp(&self, now: DateTime<Utc>) -> String {
        now.format("%Y-%m-%d %H:%M:%S UTC").to_string()
    }

    fn append(&self, block: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open progress log {}", self.path.display()))?;
        file.write_all(block.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .with_context(|| format!("append progress log {}", self.path.display()))
    }

    pub fn log_startup(
        &self,
        now: DateTime<Utc>,
        supervisor_id: &str,
        config: &Config,
        worker_timeout_secs: u64,
    ) -> Result<()> {
        self.append(&format!(
            "\n{RULE}\n[{}] STARTUP\nsupervisor: {supervisor_id}\nconfig:\n  - lease_ttl_seconds: {}\n  - max_attempts: {}\n  - verify_required: {}\n  - worker_timeout: {}s\n{RULE}",
            self.stamp(now),
            config.lease_ttl_seconds,
            config.max_attempts,
            config.verify_required,
            worker_timeout_secs,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_claim(
        &self,
        now: DateTime<Utc>,
        task_id: &str,
        run_id: &str,
        description: &str,
        attempt: u32,
        max_attempts: u32,
    ) -> Result<()> {
        self.append(&format!(
            "\n{RULE}\n[{}] CLAIM: {task_id}\nrun id: {run_id}\nattempt: {attempt}/{max_attempts}\nstatus: pending -> in_progress\ndescription: {description}\naction: supervisor claimed task, spawning worker",
            self.stamp(now),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_complete(
        &self,
        now: DateTime<Utc>,
        task_id: &str,
        run_id: &str,
        summary: &str,
        verify_command: &str,
        verify_exit_code: i32,
        verify_evidence: &str,
        git_commit: Option<&str>,
        duration_seconds: f64,
    ) -> Result<()> {
        let git_line = match git_commit {
            Some(commit) => format!("git commit: {commit}"),
            None => "git commit: none".to_string(),
        };
        self.append(&format!(
            "[{}] COMPLETE: {task_id}\nrun id: {run_id}\nstatus: in_progress -> completed\nverify command: {verify_command}\nverify result: exit_code={verify_exit_code}\nverify evidence: {verify_evidence}\n{git_line}\nsummary: {summary}\nduration: {duration_seconds:.1}s\noutcome: success\nneeds human: no",
            self.stamp(now),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_fail(
        &self,
        now: DateTime<Utc>,
        task_id: &str,
        run_id: &str,
        error: &str,
        attempt: u32,
        max_attempts: u32,
        duration_seconds: f64,
        can_retry: bool,
    ) -> Result<()> {
        let next_step = if can_retry {
            "automatic retry"
        } else {
            "human intervention required"
        };
        self.append(&format!(
            "[{}] FAIL: {task_id}\nrun id: {run_id}\nattempt: {attempt}/{max_attempts}\nstatus: in_progress -> failed\nerror: {error}\nduration: {duration_seconds:.1}s\noutcome: failure\nnext step: {next_step}\nneeds human: {}",
            self.stamp(now),
            if can_retry { "no" } else { "yes" },
        ))
    }

    /// Blocked transitions carry a Human Help Packet for the operator.
    pub fn log_block(
        &self,
        now: DateTime<Utc>,
        task_id: &str,
        run_id: &str,
        reason: &str,
        duration_seconds: f64,
    ) -> Result<()> {
        self.append(&format!(
            "[{}] BLOCK: {task_id}\nrun id: {run_id}\nstatus: in_progress -> blocked\nreason: {reason}\nduration: {duration_seconds:.1}s\noutcome: blocked\nnext step: awaiting human intervention\nneeds human: yes\n\n--- Human Help Packet ---\ntask id: {task_id}\nrun id: {run_id}\nblock reason: {reason}\nsee progress.txt and Task.json for details\nsuggested actions:\n1. resolve the blocking problem\n2. set the task status to pending to retry\n3. or set the task status to canceled to skip\n--- End Packet ---",
            self.stamp(now),
        ))
    }

    pub fn log_abandon(
        &self,
        now: DateTime<Utc>,
        task_id: &str,
        run_id: &str,
        reason: &str,
    ) -> Result<()> {
        self.append(&format!(
            "[{}] ABANDON: {task_id}\nrun id: {run_id}\nstatus: in_progress -> abandoned\nreason: {reason}\naction: supervisor reclaimed expired lease\nnext step: automatic retry if attempts remain",
            self.stamp(now),
        ))
    }

    pub fn log_reclaim(
        &self,
        now: DateTime<Utc>,
        task_id: &str,
        old_run_id: &str,
        new_status: &str,
    ) -> Result<()> {
        self.append(&format!(
            "[{}] RECLAIM: {task_id}\nprevious run id: {old_run_id}\naction: reclaimed expired lease\nnew status: {new_status}",
            self.stamp(now),
        ))
    }

    /// Run-id mismatches are hard rejections and carry their own packet.
    pub fn log_run_id_mismatch(
        &self,
        now: DateTime<Utc>,
        task_id: &str,
        expected_run_id: &str,
        actual_run_id: &str,
    ) -> Result<()> {
        self.append(&format!(
            "[{}] RUN_ID_MISMATCH: {task_id}\nexpected run id: {expected_run_id}\nactual run id: {actual_run_id}\naction: rejected worker result, task state unchanged\nreason: stale worker or replayed result\n\n--- Human Help Packet ---\ntask id: {task_id}\nexpected run id: {expected_run_id}\nrogue run id: {actual_run_id}\nthe rogue worker's output is archived under runs/\nsuggested actions:\n1. inspect the archived output for the rogue run\n2. wait for the live lease to expire or reclaim it\n--- End Packet ---",
            self.stamp(now),
        ))
    }

    pub fn log_verify_fail(
        &self,
        now: DateTime<Utc>,
        task_id: &str,
        run_id: &str,
        verify_command: &str,
        exit_code: i32,
        evidence: &str,
    ) -> Result<()> {
        self.append(&format!(
            "[{}] VERIFY_FAIL: {task_id}\nrun id: {run_id}\nverify command: {verify_command}\nexit code: {exit_code}\nevidence: {evidence}\naction: refused completed, downgraded to failed",
            self.stamp(now),
        ))
    }

    pub fn log_stop(&self, now: DateTime<Utc>, reason: &str) -> Result<()> {
        self.append(&format!(
            "\n{RULE}\n[{}] STOP\nreason: {reason}\n{RULE}",
            self.stamp(now),
        ))
    }

    pub fn log_pause(&self, now: DateTime<Utc>, reason: &str) -> Result<()> {
        self.append(&format!(
            "[{}] PAUSE\nreason: {reason}\naction: sleeping until the PAUSE file is removed",
            self.stamp(now),
        ))
    }

    pub fn log_resume(&self, now: DateTime<Utc>) -> Result<()> {
        self.append(&format!(
            "[{}] RESUME\naction: PAUSE file removed, resuming",
            self.stamp(now),
        ))
    }

    pub fn log_intake_start(
        &self,
        now: DateTime<Utc>,
        run_id: &str,
        req_id: &str,
        path: &str,
    ) -> Result<()> {
        self.append(&format!(
            "[{}] INTAKE_START: {req_id}\nrun id: {run_id}\ndocument: {path}",
            self.stamp(now),
        ))
    }

    pub fn log_intake_complete(
        &self,
        now: DateTime<Utc>,
        run_id: &str,
        req_id: &str,
        tasks_added: &[String],
        config_keys: &[String],
        git_commit: &str,
    ) -> Result<()> {
        self.append(&format!(
            "[{}] INTAKE_COMPLETE: {req_id}\nrun id: {run_id}\ntasks added: {}\nconfig overrides: {}\ngit commit: {git_commit}\noutcome: success",
            self.stamp(now),
            if tasks_added.is_empty() {
                "none".to_string()
            } else {
                tasks_added.join(", ")
            },
            if config_keys.is_empty() {
                "none".to_string()
            } else {
                config_keys.join(", ")
            },
        ))
    }

    pub fn log_intake_fail(
        &self,
        now: DateTime<Utc>,
        run_id: &str,
        req_id: &str,
        error: &str,
    ) -> Result<()> {
        self.append(&format!(
            "[{}] INTAKE_FAIL: {req_id}\nrun id: {run_id}\nerror: {error}\naction: task file untouched, document left in inbox\nneeds human: yes",
            self.stamp(now),
        ))
    }

    pub fn log_note(&self, now: DateTime<Utc>, note: &str) -> Result<()> {
        self.append(&format!("[{}] NOTE\n{note}", self.stamp(now)))
    }
}
