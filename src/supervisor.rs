//! Orchestration: the scheduling loop that drives workers against the task
//! file.
//!
//! One iteration: reclaim expired leases, check signals, select and claim a
//! task, spawn the worker, apply the gated terminal transition, log. The
//! supervisor blocks on each worker; workers never touch the task file.

use std::collections::HashSet;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::errors::SupervisorError;
use crate::core::selector::{expired_lease_ids, select_next};
use crate::core::state_machine::StateMachine;
use crate::core::task::{Config, TaskRecord, TaskStatus, VerifyResult};
use crate::io::clock;
use crate::io::config::SupervisorConfig;
use crate::io::intake::IntakeProcessor;
use crate::io::paths::WorkspacePaths;
use crate::io::progress::ProgressLog;
use crate::io::prompt::{PromptInputs, render_worker_prompt};
use crate::io::signals::{PAUSE_POLL_SECS, Signals};
use crate::io::store::TaskStore;
use crate::io::verify::{Verifier, VerifyRequest};
use crate::io::worker::{Worker, WorkerReport, WorkerRequest, archive_run, parse_report};

/// Result of executing (or attempting to execute) one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed {
        task_id: String,
        run_id: String,
    },
    Failed {
        task_id: String,
        run_id: String,
        error: String,
    },
    Blocked {
        task_id: String,
        run_id: String,
        reason: String,
    },
    /// Nothing eligible right now.
    NoEligible {
        blocked: usize,
        pending: usize,
    },
    /// A STOP request (file or interrupt) was observed before claiming.
    Stopped,
    /// A PAUSE file was observed before claiming.
    Paused,
}

/// Why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    AllTasksDone,
    StopRequested,
    BlockedTasks,
    MaxFailures { failures: u32 },
    CountReached,
    NoEligibleTasks,
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub executed: u32,
    pub stop: LoopStop,
}

#[derive(Debug, Clone, Default)]
pub struct LoopOptions {
    /// Stop after this many completed tasks.
    pub max_count: Option<u32>,
    /// Poll the inbox for new requirement documents each iteration.
    pub watch_inbox: bool,
}

/// Snapshot returned by the claim phase.
#[derive(Debug, Clone)]
struct ClaimedTask {
    task: TaskRecord,
    attempt: u32,
    max_attempts: u32,
}

/// Terminal transition applied for one worker run, used for logging.
#[derive(Debug, Clone)]
enum Applied {
    Completed {
        summary: String,
        verify: VerifyResult,
        git_commit: Option<String>,
    },
    Failed {
        error: String,
        verify: Option<VerifyResult>,
        can_retry: bool,
        exhausted: bool,
    },
    Blocked {
        reason: String,
    },
    RejectedMismatch {
        expected: String,
        actual: String,
    },
}

/// One supervisor process bound to a workspace.
pub struct Supervisor {
    pub paths: WorkspacePaths,
    pub store: TaskStore,
    pub progress: ProgressLog,
    pub signals: Signals,
    pub config: SupervisorConfig,
    pub supervisor_id: String,
    /// Per-run lease TTL override (`--lease-ttl`); not persisted.
    pub lease_ttl_override: Option<u64>,
}

impl Supervisor {
    pub fn new(paths: WorkspacePaths, config: SupervisorConfig) -> Self {
        let store = TaskStore::new(&paths.task_file);
        let progress = ProgressLog::new(&paths.progress_log);
        let signals = Signals::new(
            paths.stop_file.clone(),
            paths.pause_file.clone(),
            paths.alert_file.clone(),
        );
        Self {
            paths,
            store,
            progress,
            signals,
            config,
            supervisor_id: clock::supervisor_id(clock::now_utc()),
            lease_ttl_override: None,
        }
    }

    /// Durable config as currently committed.
    pub fn durable_config(&self) -> Result<Config> {
        Ok(self.store.read_or_default()?.config)
    }

    /// Reclaim sweep: convert every expired lease to `abandoned`, then retry
    /// or exhaust. Idempotent; running it twice is the same as once.
    pub fn reclaim_expired(&self) -> Result<u32> {
        let now = clock::now_utc();
        let reclaimed = self.store.mutate(|file| {
            let machine = StateMachine::from_config(&file.config);
            let mut events = Vec::new();
            for task_id in expired_lease_ids(file, now) {
                let Some(task) = file.task_mut(&task_id) else {
                    continue;
                };
                let old_run_id = task
                    .claim
                    .as_ref()
                    .map(|c| c.run_id.clone())
                    .unwrap_or_default();
                machine
                    .abandon(task, "lease expired", now)
                    .map_err(anyhow::Error::from)?;
                let new_status = if task.attempts_used() < machine.max_attempts {
                    machine.retry(task, now).map_err(anyhow::Error::from)?;
                    "pending (retry)"
                } else {
                    machine.exhaust(task, now).map_err(anyhow::Error::from)?;
                    "blocked (max attempts)"
                };
                events.push((task_id, old_run_id, new_status));
            }
            Ok(events)
        })?;

        for (task_id, old_run_id, new_status) in &reclaimed {
            self.progress
                .log_abandon(now, task_id, old_run_id, "lease expired")?;
            self.progress
                .log_reclaim(now, task_id, old_run_id, new_status)?;
            if new_status.starts_with("blocked") {
                self.signals.write_alert(
                    now,
                    "blocked",
                    task_id,
                    "lease expired with no attempts remaining",
                )?;
            }
        }
        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "reclaimed expired leases");
        }
        Ok(reclaimed.len() as u32)
    }

    /// The task the scheduler would claim next, without claiming it.
    pub fn next_eligible(&self) -> Result<Option<TaskRecord>> {
        let file = self.store.read_or_default()?;
        Ok(select_next(&file, clock::now_utc()).cloned())
    }

    /// Atomically select and claim the next eligible task. Under contention
    /// the lock linearizes claims: the loser re-reads and sees `in_progress`.
    fn claim_next(&self, run_id: &str) -> Result<Option<ClaimedTask>> {
        let now = clock::now_utc();
        let supervisor_id = self.supervisor_id.clone();
        let lease_ttl_override = self.lease_ttl_override;
        self.store.mutate(|file| {
            let mut machine = StateMachine::from_config(&file.config);
            if let Some(ttl) = lease_ttl_override {
                machine.lease_ttl_seconds = ttl;
            }
            let Some(task_id) = select_next(file, now).map(|t| t.id.clone()) else {
                return Ok(None);
            };
            let task = file
                .task_mut(&task_id)
                .context("selected task disappeared")?;
            machine
                .claim(task, &supervisor_id, run_id, now)
                .map_err(anyhow::Error::from)?;
            Ok(Some(ClaimedTask {
                task: task.clone(),
                attempt: task.claim.as_ref().map(|c| c.attempt).unwrap_or(1),
                max_attempts: machine.max_attempts,
            }))
        })
    }

    /// Execute one task end to end. Worker misbehavior is absorbed into the
    /// state machine; only infrastructure failures propagate as errors.
    #[instrument(skip_all, fields(supervisor = %self.supervisor_id))]
    pub fn execute_one<W: Worker, V: Verifier>(
        &self,
        worker: &W,
        verifier: &V,
    ) -> Result<StepOutcome> {
        if self.signals.stop_requested() {
            return Ok(StepOutcome::Stopped);
        }
        if self.signals.pause_requested() {
            return Ok(StepOutcome::Paused);
        }

        self.reclaim_expired()?;

        let durable = self.durable_config()?;
        if durable.lease_ttl_seconds < self.config.worker_timeout_secs {
            warn!(
                lease_ttl = durable.lease_ttl_seconds,
                worker_timeout = self.config.worker_timeout_secs,
                "lease_ttl_seconds is shorter than the worker timeout"
            );
        }

        let now = clock::now_utc();
        let run_id = clock::new_run_id(now);
        let Some(claimed) = self.claim_next(&run_id)? else {
            let file = self.store.read_or_default()?;
            return Ok(StepOutcome::NoEligible {
                blocked: count_status(&file.tasks, TaskStatus::Blocked),
                pending: count_status(&file.tasks, TaskStatus::Pending),
            });
        };

        let task_id = claimed.task.id.clone();
        self.progress.log_claim(
            now,
            &task_id,
            &run_id,
            &claimed.task.description,
            claimed.attempt,
            claimed.max_attempts,
        )?;
        info!(task_id = %task_id, run_id = %run_id, attempt = claimed.attempt, "task claimed");

        let started = Instant::now();
        let report = self.drive_worker(worker, &claimed, &run_id)?;
        let duration = started.elapsed().as_secs_f64();

        let applied = self.apply_report(verifier, &task_id, &run_id, report)?;
        self.log_applied(&task_id, &run_id, &claimed, duration, &applied)?;

        Ok(match applied {
            Applied::Completed { .. } => StepOutcome::Completed { task_id, run_id },
            Applied::Failed { error, .. } => StepOutcome::Failed {
                task_id,
                run_id,
                error,
            },
            Applied::Blocked { reason } => StepOutcome::Blocked {
                task_id,
                run_id,
                reason,
            },
            Applied::RejectedMismatch { .. } => StepOutcome::Failed {
                task_id,
                run_id,
                error: "run_id mismatch".to_string(),
            },
        })
    }

    /// Spawn the worker, archive its transcript, and parse the terminal
    /// report. A run with no usable report (timeout, spawn failure,
    /// malformed output) yields the failure reason instead.
    fn drive_worker<W: Worker>(
        &self,
        worker: &W,
        claimed: &ClaimedTask,
        run_id: &str,
    ) -> Result<Result<WorkerReport, String>> {
        let prompt = render_worker_prompt(
            &PromptInputs {
                task: &claimed.task,
                run_id,
                attempt: claimed.attempt,
                max_attempts: claimed.max_attempts,
                verify_command: &self.config.verify_command,
            },
            self.config.prompt_template.as_deref().map(std::path::Path::new),
        )?;

        let request = WorkerRequest {
            task_id: claimed.task.id.clone(),
            run_id: run_id.to_string(),
            prompt,
            workdir: self.paths.root.clone(),
            timeout: Duration::from_secs(self.config.worker_timeout_secs),
            output_limit_bytes: self.config.worker_output_limit_bytes,
        };

        let output = match worker.run(&request) {
            Ok(output) => output,
            Err(err) => {
                warn!(?err, "worker invocation failed");
                return Ok(Err(format!("worker error: {err:#}")));
            }
        };

        let parsed = parse_report(&output.stdout_lossy());
        archive_run(
            &self.paths.runs_dir,
            run_id,
            &claimed.task.id,
            &clock::now_iso(),
            &output,
            parsed.as_ref(),
        )?;

        if output.timed_out {
            let err = SupervisorError::Timeout {
                timeout_secs: self.config.worker_timeout_secs,
            };
            return Ok(Err(err.to_string()));
        }
        match parsed {
            Some(report) => Ok(Ok(report)),
            None => {
                debug!("no result document in worker output");
                Ok(Err("no result document".to_string()))
            }
        }
    }

    /// Apply the gated terminal transition for one worker run. The task
    /// record is re-read under the lock and the claim's run id re-checked
    /// before any transition; a mismatch is a hard rejection.
    fn apply_report<V: Verifier>(
        &self,
        verifier: &V,
        task_id: &str,
        run_id: &str,
        report: Result<WorkerReport, String>,
    ) -> Result<Applied> {
        // Resolve the worker-facing outcome before taking the lock: the
        // external verify gate runs outside any store mutation.
        let verify_required = self.durable_config()?.verify_required;
        let resolved = match report {
            Err(error) => Resolved::Failed { error },
            Ok(report) if report.run_id() != run_id => Resolved::Rogue {
                actual: report.run_id().to_string(),
            },
            Ok(WorkerReport::Failed { error, .. }) => Resolved::Failed {
                error: if error.is_empty() {
                    "worker reported failure".to_string()
                } else {
                    error
                },
            },
            Ok(WorkerReport::Blocked { error, .. }) => Resolved::Blocked {
                reason: if error.is_empty() {
                    "worker reported blocked".to_string()
                } else {
                    error
                },
            },
            Ok(WorkerReport::Completed {
                verify,
                git,
                summary,
                ..
            }) => {
                // A worker claiming success with failing evidence is
                // downgraded before the external gate even runs. With
                // verification not required, exit codes are recorded but
                // never veto.
                match verify {
                    Some(worker_verify) if verify_required && worker_verify.exit_code != 0 => {
                        Resolved::VerifyFailed {
                            verify: worker_verify,
                        }
                    }
                    _ => {
                        let gate = verifier.run(&VerifyRequest {
                            workdir: self.paths.root.clone(),
                            command: self.config.verify_command.clone(),
                            timeout: Duration::from_secs(self.config.verify_timeout_secs),
                            output_limit_bytes: self.config.verify_output_limit_bytes,
                            log_path: self.paths.verify_log(run_id),
                        })?;
                        if gate.exit_code == 0 || !verify_required {
                            Resolved::Completed {
                                verify: gate,
                                git_commit: git.map(|g| g.commit),
                                summary,
                            }
                        } else {
                            Resolved::VerifyFailed { verify: gate }
                        }
                    }
                }
            }
        };

        let now = clock::now_utc();
        self.store.mutate(|file| {
            let machine = StateMachine::from_config(&file.config);
            let task = file.task_mut(task_id).context("claimed task disappeared")?;

            // Run-id confirmation: the claim must still be ours.
            let claim_run = task.claim.as_ref().map(|c| c.run_id.clone());
            if claim_run.as_deref() != Some(run_id) {
                let expected = claim_run.unwrap_or_else(|| "<none>".to_string());
                machine.reject_mismatch(task, run_id, now);
                return Ok(Applied::RejectedMismatch {
                    expected,
                    actual: run_id.to_string(),
                });
            }

            match resolved {
                Resolved::Rogue { actual } => {
                    machine.reject_mismatch(task, &actual, now);
                    Ok(Applied::RejectedMismatch {
                        expected: run_id.to_string(),
                        actual,
                    })
                }
                Resolved::Completed {
                    verify,
                    git_commit,
                    summary,
                } => {
                    let git = git_commit.clone().map(|commit| crate::core::task::GitResult {
                        commit,
                        branch: "main".to_string(),
                    });
                    machine
                        .complete(task, run_id, verify.clone(), git, &summary, now)
                        .map_err(anyhow::Error::from)?;
                    Ok(Applied::Completed {
                        summary,
                        verify,
                        git_commit,
                    })
                }
                Resolved::VerifyFailed { verify } => {
                    machine
                        .fail(task, run_id, "verify_failed", Some(verify.clone()), now)
                        .map_err(anyhow::Error::from)?;
                    let exhausted = settle_failed(&machine, task, now)?;
                    Ok(Applied::Failed {
                        error: "verify_failed".to_string(),
                        verify: Some(verify),
                        can_retry: !exhausted,
                        exhausted,
                    })
                }
                Resolved::Failed { error } => {
                    machine
                        .fail(task, run_id, &error, None, now)
                        .map_err(anyhow::Error::from)?;
                    let exhausted = settle_failed(&machine, task, now)?;
                    Ok(Applied::Failed {
                        error,
                        verify: None,
                        can_retry: !exhausted,
                        exhausted,
                    })
                }
                Resolved::Blocked { reason } => {
                    machine
                        .block(task, run_id, &reason, now)
                        .map_err(anyhow::Error::from)?;
                    Ok(Applied::Blocked { reason })
                }
            }
        })
    }

    fn log_applied(
        &self,
        task_id: &str,
        run_id: &str,
        claimed: &ClaimedTask,
        duration: f64,
        applied: &Applied,
    ) -> Result<()> {
        let now = clock::now_utc();
        match applied {
            Applied::Completed {
                summary,
                verify,
                git_commit,
            } => {
                self.progress.log_complete(
                    now,
                    task_id,
                    run_id,
                    summary,
                    &verify.command,
                    verify.exit_code,
                    &verify.evidence,
                    git_commit.as_deref(),
                    duration,
                )?;
                info!(task_id, run_id, "task completed");
            }
            Applied::Failed {
                error,
                verify,
                can_retry,
                exhausted,
            } => {
                if let Some(verify) = verify {
                    self.progress.log_verify_fail(
                        now,
                        task_id,
                        run_id,
                        &verify.command,
                        verify.exit_code,
                        &verify.evidence,
                    )?;
                }
                self.progress.log_fail(
                    now,
                    task_id,
                    run_id,
                    error,
                    claimed.attempt,
                    claimed.max_attempts,
                    duration,
                    *can_retry,
                )?;
                if *exhausted {
                    self.signals.write_alert(
                        now,
                        "blocked",
                        task_id,
                        &format!("max attempts reached after: {error}"),
                    )?;
                }
                warn!(task_id, run_id, error = %error, "task failed");
            }
            Applied::Blocked { reason } => {
                self.progress
                    .log_block(now, task_id, run_id, reason, duration)?;
                self.signals.write_alert(now, "blocked", task_id, reason)?;
                warn!(task_id, run_id, reason = %reason, "task blocked");
            }
            Applied::RejectedMismatch { expected, actual } => {
                self.progress
                    .log_run_id_mismatch(now, task_id, expected, actual)?;
                self.signals.write_alert(
                    now,
                    "run_id_mismatch",
                    task_id,
                    &format!("expected run '{expected}', observed '{actual}'"),
                )?;
                warn!(task_id, expected = %expected, actual = %actual, "run id mismatch rejected");
            }
        }
        Ok(())
    }

    /// Execute tasks until none are eligible, STOP is requested, a task
    /// blocks, or the failure budget is spent.
    pub fn run_loop<W: Worker, V: Verifier>(
        &self,
        worker: &W,
        verifier: &V,
        opts: &LoopOptions,
    ) -> Result<LoopOutcome> {
        let durable = self.durable_config()?;
        self.progress.log_startup(
            clock::now_utc(),
            &self.supervisor_id,
            &durable,
            self.config.worker_timeout_secs,
        )?;
        if durable.lease_ttl_seconds < self.config.worker_timeout_secs {
            self.progress.log_note(
                clock::now_utc(),
                &format!(
                    "warning: lease_ttl_seconds ({}) < worker timeout ({}); recommend lease_ttl >= 1.5 x timeout",
                    durable.lease_ttl_seconds, self.config.worker_timeout_secs
                ),
            )?;
        }

        let mut executed = 0u32;
        let mut failures = 0u32;

        loop {
            if self.signals.stop_requested() {
                let reason = if self.signals.interrupted() {
                    "interrupt received"
                } else {
                    "STOP file detected"
                };
                self.progress.log_stop(clock::now_utc(), reason)?;
                return Ok(LoopOutcome {
                    executed,
                    stop: LoopStop::StopRequested,
                });
            }

            if self.signals.pause_requested() {
                self.progress
                    .log_pause(clock::now_utc(), "PAUSE file detected")?;
                while self.signals.pause_requested() && !self.signals.stop_requested() {
                    thread::sleep(Duration::from_secs(PAUSE_POLL_SECS));
                }
                self.progress.log_resume(clock::now_utc())?;
                continue;
            }

            if opts.watch_inbox {
                self.poll_inbox(verifier)?;
            }

            if let Some(max) = opts.max_count {
                if executed >= max {
                    return Ok(LoopOutcome {
                        executed,
                        stop: LoopStop::CountReached,
                    });
                }
            }

            match self.execute_one(worker, verifier)? {
                StepOutcome::Completed { .. } => {
                    executed += 1;
                    failures = 0;
                    self.housekeeping();
                }
                StepOutcome::Failed { .. } | StepOutcome::Blocked { .. } => {
                    failures += 1;
                    let max_failures = self.durable_config()?.max_failures;
                    if failures >= max_failures {
                        self.signals.write_alert(
                            clock::now_utc(),
                            "max_failures",
                            "-",
                            &format!("{failures} consecutive failures"),
                        )?;
                        self.progress.log_stop(
                            clock::now_utc(),
                            &format!("max failures reached: {failures}"),
                        )?;
                        return Ok(LoopOutcome {
                            executed,
                            stop: LoopStop::MaxFailures { failures },
                        });
                    }
                }
                StepOutcome::NoEligible { blocked, pending } => {
                    if blocked > 0 {
                        self.progress
                            .log_stop(clock::now_utc(), "blocked tasks need human intervention")?;
                        return Ok(LoopOutcome {
                            executed,
                            stop: LoopStop::BlockedTasks,
                        });
                    }
                    let stop = if pending == 0 {
                        LoopStop::AllTasksDone
                    } else {
                        LoopStop::NoEligibleTasks
                    };
                    return Ok(LoopOutcome { executed, stop });
                }
                StepOutcome::Stopped => {
                    self.progress.log_stop(clock::now_utc(), "STOP requested")?;
                    return Ok(LoopOutcome {
                        executed,
                        stop: LoopStop::StopRequested,
                    });
                }
                StepOutcome::Paused => continue,
            }

            if self.next_eligible()?.is_some() && self.config.loop_delay_secs > 0 {
                thread::sleep(Duration::from_secs(self.config.loop_delay_secs));
            }
        }
    }

    /// Archive rotation plus status refresh between tasks. Best effort; a
    /// failure here must not stop the scheduling loop.
    fn housekeeping(&self) {
        let outcome = self.durable_config().and_then(|durable| {
            crate::io::retention::cleanup_runs(
                &self.paths.runs_dir,
                durable.retention_days,
                durable.max_runs_mb,
                &self.live_run_ids()?,
                std::time::SystemTime::now(),
            )
        });
        if let Err(err) = outcome {
            warn!(?err, "retention pass failed");
        }
        let report = self.store.read_or_default().and_then(|file| {
            crate::io::report::write_status_report(
                &self.paths.status_file,
                &file,
                &self.paths.runs_dir,
                clock::now_utc(),
            )
        });
        if let Err(err) = report {
            warn!(?err, "status report failed");
        }
    }

    /// Process any pending inbox documents. Intake failures are logged and
    /// annotated; they do not stop the loop.
    pub fn poll_inbox<V: Verifier>(&self, verifier: &V) -> Result<()> {
        let intake = self.intake_processor();
        for doc in intake.scan_inbox()? {
            let run_id = clock::new_run_id(clock::now_utc());
            if let Err(err) = intake.process(&doc, &run_id, verifier) {
                warn!(doc = %doc.display(), error = %format!("{err:#}"), "intake rejected");
            }
        }
        Ok(())
    }

    pub fn intake_processor(&self) -> IntakeProcessor<'_> {
        IntakeProcessor {
            store: &self.store,
            paths: &self.paths,
            progress: &self.progress,
            verify_command: self.config.verify_command.clone(),
            verify_timeout: Duration::from_secs(self.config.verify_timeout_secs),
            verify_output_limit_bytes: self.config.verify_output_limit_bytes,
        }
    }

    /// Run ids of live claims, used to protect archives from retention.
    pub fn live_run_ids(&self) -> Result<HashSet<String>> {
        let file = self.store.read_or_default()?;
        Ok(file
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .filter_map(|t| t.claim.as_ref().map(|c| c.run_id.clone()))
            .collect())
    }
}

/// Outcome resolved from the worker report before taking the store lock.
enum Resolved {
    Completed {
        verify: VerifyResult,
        git_commit: Option<String>,
        summary: String,
    },
    VerifyFailed {
        verify: VerifyResult,
    },
    Failed {
        error: String,
    },
    Blocked {
        reason: String,
    },
    Rogue {
        actual: String,
    },
}

/// After a `failed` terminal: retry while attempts remain, otherwise the next
/// transition is to `blocked`.
fn settle_failed(
    machine: &StateMachine,
    task: &mut TaskRecord,
    now: DateTime<Utc>,
) -> Result<bool> {
    if task.attempts_used() < machine.max_attempts {
        machine.retry(task, now).map_err(anyhow::Error::from)?;
        Ok(false)
    } else {
        machine.exhaust(task, now).map_err(anyhow::Error::from)?;
        Ok(true)
    }
}

fn count_status(tasks: &[TaskRecord], status: TaskStatus) -> usize {
    tasks.iter().filter(|t| t.status == status).count()
}
