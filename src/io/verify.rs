//! Verification gate: run the external verify script and capture evidence.
//!
//! Only a zero exit code permits the `completed` transition. The first
//! kilobyte of stdout becomes the recorded evidence; the full transcript is
//! written next to the run archive.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::core::task::VerifyResult;
use crate::io::process::run_command_with_timeout;

/// Evidence shown in summaries; full output goes to the archive.
const EVIDENCE_CAP: usize = 1024;

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub workdir: PathBuf,
    /// Opaque shell command, run via `sh -c`.
    pub command: String,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Where the full transcript is written.
    pub log_path: PathBuf,
}

pub trait Verifier {
    fn run(&self, request: &VerifyRequest) -> Result<VerifyResult>;
}

/// Production verifier invoking the configured shell command.
pub struct ShellVerifier;

impl Verifier for ShellVerifier {
    #[instrument(skip_all, fields(command = %request.command))]
    fn run(&self, request: &VerifyRequest) -> Result<VerifyResult> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&request.command).current_dir(&request.workdir);

        let output =
            run_command_with_timeout(cmd, None, request.timeout, request.output_limit_bytes)
                .context("run verify command")?;

        write_verify_log(request, &output.stdout_lossy(), &output.stderr_lossy())?;

        // A timed-out verify cannot vouch for anything.
        let exit_code = if output.timed_out {
            warn!("verify command timed out");
            -1
        } else {
            output.status.code().unwrap_or(-1)
        };
        debug!(exit_code, "verify finished");

        Ok(VerifyResult {
            command: request.command.clone(),
            exit_code,
            evidence: evidence_from(&output.stdout_lossy()),
        })
    }
}

fn evidence_from(stdout: &str) -> String {
    if stdout.len() <= EVIDENCE_CAP {
        return stdout.trim_end().to_string();
    }
    let mut end = EVIDENCE_CAP;
    while !stdout.is_char_boundary(end) {
        end -= 1;
    }
    stdout[..end].to_string()
}

fn write_verify_log(request: &VerifyRequest, stdout: &str, stderr: &str) -> Result<()> {
    if let Some(parent) = request.log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create verify log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(stdout);
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(stderr);
    fs::write(&request.log_path, buf)
        .with_context(|| format!("write verify log {}", request.log_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(temp: &tempfile::TempDir, command: &str) -> VerifyRequest {
        VerifyRequest {
            workdir: temp.path().to_path_buf(),
            command: command.to_string(),
            timeout: Duration::from_secs(5),
            output_limit_bytes: 10_000,
            log_path: temp.path().join("verify.log"),
        }
    }

    #[test]
    fn passing_command_reports_zero() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = ShellVerifier
            .run(&request(&temp, "echo all green"))
            .expect("verify");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.evidence, "all green");
        assert!(temp.path().join("verify.log").exists());
    }

    #[test]
    fn failing_command_reports_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = ShellVerifier
            .run(&request(&temp, "echo broken; exit 3"))
            .expect("verify");
        assert_eq!(result.exit_code, 3);
        assert_eq!(result.evidence, "broken");
    }

    #[test]
    fn evidence_is_capped_to_first_kilobyte() {
        let temp = tempfile::tempdir().expect("tempdir");
        let result = ShellVerifier
            .run(&request(&temp, "head -c 4096 /dev/zero | tr '\\0' 'x'"))
            .expect("verify");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.evidence.len(), 1024);
    }
}
