//! Worker driver: spawn an opaque worker subprocess, parse its terminal
//! result document, archive the transcript.
//!
//! The [`Worker`] trait decouples the supervisor from the actual agent
//! backend. Tests use scripted workers that return canned transcripts without
//! spawning processes. The driver never crashes on worker misbehavior: a
//! missing or unparseable result document becomes a synthesized failure.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::task::{GitResult, VerifyResult};
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Archive caps, matching what a human can reasonably audit.
const ARCHIVE_STDOUT_CAP: usize = 50_000;
const ARCHIVE_STDERR_CAP: usize = 10_000;

/// Terminal result document a worker prints as its last JSON object on
/// stdout. Unknown extra fields are tolerated; the tag is strict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReport {
    Completed {
        task_id: String,
        run_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        verify: Option<VerifyResult>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        git: Option<GitResult>,
        #[serde(default)]
        summary: String,
    },
    Failed {
        task_id: String,
        run_id: String,
        #[serde(default)]
        error: String,
        #[serde(default)]
        needs_human: bool,
    },
    Blocked {
        task_id: String,
        run_id: String,
        #[serde(default)]
        error: String,
        #[serde(default)]
        needs_human: bool,
    },
}

impl WorkerReport {
    pub fn run_id(&self) -> &str {
        match self {
            WorkerReport::Completed { run_id, .. }
            | WorkerReport::Failed { run_id, .. }
            | WorkerReport::Blocked { run_id, .. } => run_id,
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            WorkerReport::Completed { task_id, .. }
            | WorkerReport::Failed { task_id, .. }
            | WorkerReport::Blocked { task_id, .. } => task_id,
        }
    }
}

/// Parameters for one worker invocation.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub task_id: String,
    pub run_id: String,
    /// Rendered instruction payload fed to the worker on stdin. Opaque to the
    /// supervisor.
    pub prompt: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Abstraction over worker backends.
pub trait Worker {
    /// Run the worker to completion (or timeout) and return its transcript.
    fn run(&self, request: &WorkerRequest) -> Result<CommandOutput>;
}

/// Production worker that spawns the configured command with `--task-id` and
/// `--run-id` arguments, working directory at the project root.
pub struct CommandWorker {
    pub command: Vec<String>,
    /// Turn budget appended as `--max-turns N` when nonzero.
    pub max_turns: u32,
}

impl Worker for CommandWorker {
    #[instrument(skip_all, fields(task_id = %request.task_id, run_id = %request.run_id))]
    fn run(&self, request: &WorkerRequest) -> Result<CommandOutput> {
        info!(workdir = %request.workdir.display(), "starting worker");
        let (program, args) = self
            .command
            .split_first()
            .context("worker command is empty")?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        if self.max_turns > 0 {
            cmd.arg("--max-turns").arg(self.max_turns.to_string());
        }
        cmd.arg("--task-id")
            .arg(&request.task_id)
            .arg("--run-id")
            .arg(&request.run_id)
            .current_dir(&request.workdir);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .context("run worker command")?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "worker timed out");
        } else {
            debug!(exit_code = ?output.status.code(), "worker exited");
        }
        Ok(output)
    }
}

static JSON_FENCE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?s)```json\s*\n(\{.*?\})\s*\n```").expect("fence regex")
});

/// Scan worker stdout for the last well-formed result document.
///
/// Plain JSON lines are scanned last-to-first, then fenced `json` code
/// blocks. When a worker prints two terminal documents, only the last is
/// honored.
pub fn parse_report(stdout: &str) -> Option<WorkerReport> {
    for line in stdout.lines().rev() {
        let line = line.trim();
        if line.starts_with('{') && line.ends_with('}') {
            if let Some(report) = report_from_json(line) {
                return Some(report);
            }
        }
    }

    let blocks: Vec<&str> = JSON_FENCE_RE
        .captures_iter(stdout)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    for block in blocks.iter().rev() {
        if let Some(report) = report_from_json(block) {
            return Some(report);
        }
    }
    None
}

fn report_from_json(text: &str) -> Option<WorkerReport> {
    let value: Value = serde_json::from_str(text).ok()?;
    // Require the identifying fields before attempting the tagged parse so
    // that unrelated JSON lines in a chatty transcript are skipped.
    if value.get("task_id").is_none() || value.get("status").is_none() {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// Everything persisted for one run, independent of task outcome.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunArchive {
    pub run_id: String,
    pub task_id: String,
    pub timestamp: String,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub parsed_result: Option<WorkerReport>,
}

/// Archive a run transcript to `runs/<run_id>.json`. Stdout and stderr are
/// capped so a runaway worker cannot flood the archive.
pub fn archive_run(
    runs_dir: &Path,
    run_id: &str,
    task_id: &str,
    timestamp: &str,
    output: &CommandOutput,
    parsed: Option<&WorkerReport>,
) -> Result<PathBuf> {
    fs::create_dir_all(runs_dir)
        .with_context(|| format!("create runs dir {}", runs_dir.display()))?;
    let archive = RunArchive {
        run_id: run_id.to_string(),
        task_id: task_id.to_string(),
        timestamp: timestamp.to_string(),
        stdout: cap(&output.stdout_lossy(), ARCHIVE_STDOUT_CAP),
        stderr: cap(&output.stderr_lossy(), ARCHIVE_STDERR_CAP),
        timed_out: output.timed_out,
        exit_code: output.status.code(),
        parsed_result: parsed.cloned(),
    };
    let path = runs_dir.join(format!("{run_id}.json"));
    let mut buf = serde_json::to_string_pretty(&archive).context("serialize run archive")?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write run archive {}", path.display()))?;
    debug!(path = %path.display(), "run archived");
    Ok(path)
}

fn cap(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n[truncated {} bytes]", &text[..end], text.len() - end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_last_json_line() {
        let stdout = concat!(
            "working on it...\n",
            r#"{"task_id":"t1","run_id":"r1","status":"failed","error":"first"}"#,
            "\n",
            r#"{"task_id":"t1","run_id":"r1","status":"completed","verify":{"command":"v","exit_code":0,"evidence":"ok"},"summary":"done"}"#,
            "\n"
        );
        let report = parse_report(stdout).expect("report");
        assert!(matches!(report, WorkerReport::Completed { .. }));
    }

    #[test]
    fn parses_fenced_json_block() {
        let stdout = "prose\n```json\n{\"task_id\":\"t1\",\"run_id\":\"r1\",\"status\":\"blocked\",\"error\":\"stuck\",\"needs_human\":true}\n```\nmore prose\n";
        let report = parse_report(stdout).expect("report");
        assert_eq!(
            report,
            WorkerReport::Blocked {
                task_id: "t1".to_string(),
                run_id: "r1".to_string(),
                error: "stuck".to_string(),
                needs_human: true,
            }
        );
    }

    #[test]
    fn ignores_json_without_identifying_fields() {
        let stdout = "{\"hello\":\"world\"}\n";
        assert!(parse_report(stdout).is_none());
    }

    #[test]
    fn tolerates_unknown_fields() {
        let stdout = r#"{"task_id":"t1","run_id":"r1","status":"failed","error":"x","extra_field":42}"#;
        let report = parse_report(stdout).expect("report");
        assert!(matches!(report, WorkerReport::Failed { .. }));
    }

    #[test]
    fn missing_document_yields_none() {
        assert!(parse_report("no json here at all\n").is_none());
    }

    #[test]
    fn cap_marks_truncation() {
        let capped = cap("abcdefgh", 4);
        assert!(capped.starts_with("abcd"));
        assert!(capped.contains("truncated 4 bytes"));
    }
}
