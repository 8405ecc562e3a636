//! Test-only helpers: scripted workers and verifiers, workspace fixtures.
//!
//! Scripted doubles return predetermined transcripts without spawning
//! processes, so state-machine behavior can be driven deterministically.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Result, anyhow};

use crate::core::task::{TaskFile, TaskRecord, VerifyResult};
use crate::io::config::SupervisorConfig;
use crate::io::paths::WorkspacePaths;
use crate::io::process::CommandOutput;
use crate::io::verify::{Verifier, VerifyRequest};
use crate::io::worker::{Worker, WorkerRequest};
use crate::supervisor::Supervisor;

fn exit_status(code: i32) -> std::process::ExitStatus {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(code << 8)
    }
    #[cfg(not(unix))]
    {
        use std::os::windows::process::ExitStatusExt;
        std::process::ExitStatus::from_raw(code as u32)
    }
}

/// One scripted worker invocation. `stdout` may contain `{task_id}` and
/// `{run_id}` placeholders, substituted from the actual request so scripted
/// reports echo the run id the supervisor generated.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    pub stdout: String,
    pub timed_out: bool,
}

impl ScriptedRun {
    pub fn reporting(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            timed_out: false,
        }
    }

    pub fn timing_out() -> Self {
        Self {
            stdout: String::new(),
            timed_out: true,
        }
    }
}

/// Worker double that replays a queue of scripted transcripts.
pub struct ScriptedWorker {
    runs: Mutex<VecDeque<ScriptedRun>>,
}

impl ScriptedWorker {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            runs: Mutex::new(runs.into()),
        }
    }
}

impl Worker for ScriptedWorker {
    fn run(&self, request: &WorkerRequest) -> Result<CommandOutput> {
        let scripted = self
            .runs
            .lock()
            .expect("scripted worker lock")
            .pop_front()
            .ok_or_else(|| anyhow!("scripted worker exhausted"))?;
        let stdout = scripted
            .stdout
            .replace("{task_id}", &request.task_id)
            .replace("{run_id}", &request.run_id);
        Ok(CommandOutput {
            status: exit_status(0),
            stdout: stdout.into_bytes(),
            stderr: Vec::new(),
            stdout_truncated: 0,
            stderr_truncated: 0,
            timed_out: scripted.timed_out,
        })
    }
}

/// Verifier double. Either replays a queue of results or always returns the
/// same exit code.
pub enum ScriptedVerifier {
    Queue(Mutex<VecDeque<VerifyResult>>),
    Always(i32),
}

impl ScriptedVerifier {
    pub fn new(results: Vec<VerifyResult>) -> Self {
        ScriptedVerifier::Queue(Mutex::new(results.into()))
    }

    pub fn always(exit_code: i32) -> Self {
        ScriptedVerifier::Always(exit_code)
    }
}

impl Verifier for ScriptedVerifier {
    fn run(&self, request: &VerifyRequest) -> Result<VerifyResult> {
        if let Some(parent) = request.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&request.log_path, "scripted verify output")?;
        match self {
            ScriptedVerifier::Queue(queue) => queue
                .lock()
                .expect("scripted verifier lock")
                .pop_front()
                .ok_or_else(|| anyhow!("scripted verifier exhausted")),
            ScriptedVerifier::Always(exit_code) => Ok(VerifyResult {
                command: request.command.clone(),
                exit_code: *exit_code,
                evidence: "scripted".to_string(),
            }),
        }
    }
}

/// Scripted worker report bodies.
pub fn completed_report(verify_exit_code: i32) -> String {
    format!(
        r#"{{"task_id":"{{task_id}}","run_id":"{{run_id}}","status":"completed","verify":{{"command":"scripts/verify.sh","exit_code":{verify_exit_code},"evidence":"scripted"}},"git":{{"commit":"abc1234"}},"summary":"scripted run"}}"#
    )
}

pub fn failed_report(error: &str) -> String {
    format!(
        r#"{{"task_id":"{{task_id}}","run_id":"{{run_id}}","status":"failed","error":"{error}","needs_human":false}}"#
    )
}

pub fn blocked_report(error: &str) -> String {
    format!(
        r#"{{"task_id":"{{task_id}}","run_id":"{{run_id}}","status":"blocked","error":"{error}","needs_human":true}}"#
    )
}

/// Workspace fixture over a caller-owned directory (tests hand in a
/// tempdir), with a seeded task file.
pub struct TestWorkspace {
    pub paths: WorkspacePaths,
}

impl TestWorkspace {
    pub fn seed(root: &Path, tasks: Vec<TaskRecord>) -> Result<Self> {
        let paths = WorkspacePaths::new(root);
        let workspace = Self { paths };
        workspace.write_file(&TaskFile {
            tasks,
            ..TaskFile::default()
        })?;
        Ok(workspace)
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    /// Supervisor over this workspace, tuned for fast tests.
    pub fn supervisor(&self) -> Supervisor {
        let config = SupervisorConfig {
            loop_delay_secs: 0,
            worker_timeout_secs: 30,
            verify_timeout_secs: 30,
            ..SupervisorConfig::default()
        };
        Supervisor::new(WorkspacePaths::new(self.root()), config)
    }

    pub fn read_file(&self) -> Result<TaskFile> {
        let contents = fs::read_to_string(&self.paths.task_file)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn write_file(&self, file: &TaskFile) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(file)?;
        buf.push('\n');
        fs::write(&self.paths.task_file, buf)?;
        Ok(())
    }

    pub fn progress(&self) -> String {
        fs::read_to_string(&self.paths.progress_log).unwrap_or_default()
    }
}

/// A pending task with defaults.
pub fn pending(id: &str, description: &str) -> TaskRecord {
    TaskRecord::new(id, description)
}
