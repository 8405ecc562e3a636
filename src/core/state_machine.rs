//! Task state machine.
//!
//! Every transition is a guarded mutation of a single `TaskRecord`. Guards
//! enforce the invariants the rest of the system relies on:
//! - `completed` requires verify evidence with exit code zero (when required)
//! - a live lease cannot be claimed over
//! - terminal events must carry the claim's run id
//! - attempts are capped; the cap forces `blocked`, never silent retry
//!
//! The caller supplies `now` so transitions stay deterministic under test.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::core::errors::SupervisorError;
use crate::core::task::{
    Claim, Config, GitResult, HistoryEntry, HistoryStatus, TaskRecord, TaskResult, TaskStatus,
    VerifyResult,
};

fn iso(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Guarded transition rules, parameterized by the durable config.
#[derive(Debug, Clone)]
pub struct StateMachine {
    pub lease_ttl_seconds: u64,
    pub max_attempts: u32,
    pub verify_required: bool,
}

impl StateMachine {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lease_ttl_seconds: config.lease_ttl_seconds,
            max_attempts: config.max_attempts,
            verify_required: config.verify_required,
        }
    }

    fn illegal(&self, task: &TaskRecord, detail: impl Into<String>) -> SupervisorError {
        SupervisorError::IllegalTransition {
            task_id: task.id.clone(),
            detail: detail.into(),
        }
    }

    fn check_run_id(&self, task: &TaskRecord, run_id: &str) -> Result<Claim, SupervisorError> {
        let claim = task
            .claim
            .clone()
            .ok_or_else(|| self.illegal(task, "no claim on record"))?;
        if claim.run_id != run_id {
            return Err(SupervisorError::RunIdMismatch {
                task_id: task.id.clone(),
                expected: claim.run_id,
                actual: run_id.to_string(),
            });
        }
        Ok(claim)
    }

    /// `pending -> in_progress`. Writes the claim with a fresh lease.
    pub fn claim(
        &self,
        task: &mut TaskRecord,
        claimed_by: &str,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SupervisorError> {
        if task.status != TaskStatus::Pending {
            return Err(self.illegal(
                task,
                format!("claim requires pending, task is {}", task.status),
            ));
        }
        if task.has_live_claim(now) {
            let holder = task.claim.as_ref().map(|c| c.run_id.clone()).unwrap_or_default();
            return Err(self.illegal(task, format!("live lease held by run '{holder}'")));
        }
        if task.attempts_used() >= self.max_attempts {
            return Err(self.illegal(
                task,
                format!("attempts exhausted ({}/{})", task.attempts_used(), self.max_attempts),
            ));
        }

        let expires = now + chrono::Duration::seconds(self.lease_ttl_seconds as i64);
        task.claim = Some(Claim {
            claimed_by: claimed_by.to_string(),
            run_id: run_id.to_string(),
            claimed_at: iso(now),
            lease_expires_at: iso(expires),
            attempt: task.attempts_used() + 1,
        });
        task.status = TaskStatus::InProgress;
        task.last_update = iso(now);
        Ok(())
    }

    /// `in_progress -> completed`. Requires a matching run id and, when
    /// verification is required, a zero verify exit code.
    pub fn complete(
        &self,
        task: &mut TaskRecord,
        run_id: &str,
        verify: VerifyResult,
        git: Option<GitResult>,
        summary: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SupervisorError> {
        if task.status != TaskStatus::InProgress {
            return Err(self.illegal(
                task,
                format!("complete requires in_progress, task is {}", task.status),
            ));
        }
        let claim = self.check_run_id(task, run_id)?;
        if self.verify_required && verify.exit_code != 0 {
            return Err(SupervisorError::VerifyFailed {
                task_id: task.id.clone(),
                exit_code: verify.exit_code,
            });
        }

        task.history.push(HistoryEntry {
            attempt: claim.attempt,
            run_id: run_id.to_string(),
            status: HistoryStatus::Completed,
            error: String::new(),
            ended_at: iso(now),
        });
        task.result = Some(TaskResult {
            verify: Some(verify),
            git,
            summary: summary.to_string(),
        });
        task.status = TaskStatus::Completed;
        task.claim = None;
        task.last_update = iso(now);
        Ok(())
    }

    /// `in_progress -> failed`. Verify evidence, when present, is written
    /// through to `result` so downgrade reasons stay auditable.
    pub fn fail(
        &self,
        task: &mut TaskRecord,
        run_id: &str,
        error: &str,
        verify: Option<VerifyResult>,
        now: DateTime<Utc>,
    ) -> Result<(), SupervisorError> {
        if task.status != TaskStatus::InProgress {
            return Err(self.illegal(
                task,
                format!("fail requires in_progress, task is {}", task.status),
            ));
        }
        let claim = self.check_run_id(task, run_id)?;

        task.history.push(HistoryEntry {
            attempt: claim.attempt,
            run_id: run_id.to_string(),
            status: HistoryStatus::Failed,
            error: error.to_string(),
            ended_at: iso(now),
        });
        if let Some(verify) = verify {
            task.result = Some(TaskResult {
                verify: Some(verify),
                git: None,
                summary: error.to_string(),
            });
        }
        task.status = TaskStatus::Failed;
        task.notes = error.to_string();
        task.claim = None;
        task.last_update = iso(now);
        Ok(())
    }

    /// `in_progress -> blocked`.
    pub fn block(
        &self,
        task: &mut TaskRecord,
        run_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SupervisorError> {
        if task.status != TaskStatus::InProgress {
            return Err(self.illegal(
                task,
                format!("block requires in_progress, task is {}", task.status),
            ));
        }
        let claim = self.check_run_id(task, run_id)?;

        task.history.push(HistoryEntry {
            attempt: claim.attempt,
            run_id: run_id.to_string(),
            status: HistoryStatus::Blocked,
            error: reason.to_string(),
            ended_at: iso(now),
        });
        task.status = TaskStatus::Blocked;
        task.notes = reason.to_string();
        task.claim = None;
        task.last_update = iso(now);
        Ok(())
    }

    /// `in_progress -> abandoned` for lease expiry. The caller guards on
    /// `claim.is_expired(now)`; the abandoned attempt is consumed.
    pub fn abandon(
        &self,
        task: &mut TaskRecord,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SupervisorError> {
        if task.status != TaskStatus::InProgress {
            return Err(self.illegal(
                task,
                format!("abandon requires in_progress, task is {}", task.status),
            ));
        }
        if let Some(claim) = &task.claim {
            task.history.push(HistoryEntry {
                attempt: claim.attempt,
                run_id: claim.run_id.clone(),
                status: HistoryStatus::Abandoned,
                error: reason.to_string(),
                ended_at: iso(now),
            });
        }
        task.status = TaskStatus::Abandoned;
        task.notes = reason.to_string();
        task.claim = None;
        task.last_update = iso(now);
        Ok(())
    }

    /// `failed | abandoned -> pending` while attempts remain.
    pub fn retry(&self, task: &mut TaskRecord, now: DateTime<Utc>) -> Result<(), SupervisorError> {
        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Abandoned) {
            return Err(self.illegal(
                task,
                format!("retry requires failed or abandoned, task is {}", task.status),
            ));
        }
        if task.attempts_used() >= self.max_attempts {
            return Err(self.illegal(
                task,
                format!("attempts exhausted ({}/{})", task.attempts_used(), self.max_attempts),
            ));
        }
        task.status = TaskStatus::Pending;
        task.last_update = iso(now);
        Ok(())
    }

    /// `failed | abandoned -> blocked` once the attempt cap is reached.
    pub fn exhaust(
        &self,
        task: &mut TaskRecord,
        now: DateTime<Utc>,
    ) -> Result<(), SupervisorError> {
        if !matches!(task.status, TaskStatus::Failed | TaskStatus::Abandoned) {
            return Err(self.illegal(
                task,
                format!("exhaust requires failed or abandoned, task is {}", task.status),
            ));
        }
        if task.attempts_used() < self.max_attempts {
            return Err(self.illegal(
                task,
                format!(
                    "attempts remain ({}/{}), use retry",
                    task.attempts_used(),
                    self.max_attempts
                ),
            ));
        }
        task.status = TaskStatus::Blocked;
        task.notes = format!("max attempts reached ({})", self.max_attempts);
        task.last_update = iso(now);
        Ok(())
    }

    /// `blocked -> pending`, operator-initiated.
    pub fn resume(&self, task: &mut TaskRecord, now: DateTime<Utc>) -> Result<(), SupervisorError> {
        if task.status != TaskStatus::Blocked {
            return Err(self.illegal(
                task,
                format!("resume requires blocked, task is {}", task.status),
            ));
        }
        task.status = TaskStatus::Pending;
        task.last_update = iso(now);
        Ok(())
    }

    /// `pending | blocked -> canceled`, operator-initiated.
    pub fn cancel(&self, task: &mut TaskRecord, now: DateTime<Utc>) -> Result<(), SupervisorError> {
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Blocked) {
            return Err(self.illegal(
                task,
                format!("cancel requires pending or blocked, task is {}", task.status),
            ));
        }
        task.status = TaskStatus::Canceled;
        task.claim = None;
        task.last_update = iso(now);
        Ok(())
    }

    /// Hard rejection of a terminal event whose run id does not match the
    /// claim. Records the discrepancy in history; the task's state, claim,
    /// and attempt budget are untouched.
    pub fn reject_mismatch(
        &self,
        task: &mut TaskRecord,
        actual_run_id: &str,
        now: DateTime<Utc>,
    ) {
        let (attempt, expected) = task
            .claim
            .as_ref()
            .map(|c| (c.attempt, c.run_id.clone()))
            .unwrap_or((0, "<none>".to_string()));
        task.history.push(HistoryEntry {
            attempt,
            run_id: actual_run_id.to_string(),
            status: HistoryStatus::Rejected,
            error: format!("run id mismatch: claim holds '{expected}'"),
            ended_at: iso(now),
        });
        task.last_update = iso(now);
    }
}
