//! Minimal git adapter for the intake commit step.
//!
//! Intake commits `Task.json` and `REQUIREMENTS.md` deterministically, so we
//! keep a small, explicit wrapper around `git` subprocess calls.

use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Return the current branch name, or "main" when it cannot be resolved
    /// (fresh repository, detached HEAD).
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        if !out.status.success() {
            return Ok("main".to_string());
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    pub fn head_short_sha(&self) -> Result<String> {
        let out = self.run_checked(&["rev-parse", "--short", "HEAD"])?;
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    pub fn add_paths(&self, paths: &[&str]) -> Result<()> {
        let mut args = vec!["add", "--"];
        args.extend_from_slice(paths);
        self.run_checked(&args)?;
        Ok(())
    }

    /// Commit staged changes. Returns `Ok(None)` when there was nothing to
    /// commit, `Ok(Some(short_sha))` otherwise.
    #[instrument(skip_all)]
    pub fn commit(&self, message: &str) -> Result<Option<String>> {
        let out = self.run(&["commit", "-m", message])?;
        if !out.status.success() {
            let stdout = String::from_utf8_lossy(&out.stdout);
            if stdout.contains("nothing to commit") {
                debug!("nothing to commit");
                return Ok(None);
            }
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(anyhow!("git commit failed: {}", stderr.trim()));
        }
        Ok(Some(self.head_short_sha()?))
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn init_repo(root: &Path) {
        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "test"],
        ] {
            let status = Command::new("git")
                .args(&args)
                .current_dir(root)
                .status()
                .expect("git");
            assert!(status.success());
        }
    }

    #[test]
    fn commit_returns_sha_then_none_when_clean() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_repo(temp.path());
        let git = Git::new(temp.path());

        fs::write(temp.path().join("Task.json"), "{}\n").expect("write");
        git.add_paths(&["Task.json"]).expect("add");
        let sha = git.commit("feat(intake): seed").expect("commit");
        assert!(sha.is_some());

        let again = git.commit("feat(intake): empty").expect("commit");
        assert!(again.is_none());
    }
}
