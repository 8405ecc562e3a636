//! Canonical filesystem layout for a supervised project root.

use std::path::PathBuf;

/// All well-known paths the supervisor touches, derived from the project root.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub task_file: PathBuf,
    pub progress_log: PathBuf,
    pub runs_dir: PathBuf,
    pub inbox_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub stop_file: PathBuf,
    pub pause_file: PathBuf,
    pub alert_file: PathBuf,
    pub status_file: PathBuf,
    pub requirements_file: PathBuf,
    pub config_file: PathBuf,
}

impl WorkspacePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let inbox_dir = root.join("inbox");
        Self {
            task_file: root.join("Task.json"),
            progress_log: root.join("progress.txt"),
            runs_dir: root.join("runs"),
            processed_dir: inbox_dir.join("processed"),
            inbox_dir,
            stop_file: root.join("STOP"),
            pause_file: root.join("PAUSE"),
            alert_file: root.join("ALERT.txt"),
            status_file: root.join("status.md"),
            requirements_file: root.join("REQUIREMENTS.md"),
            config_file: root.join("shepherd.toml"),
            root,
        }
    }

    /// Resolve the project root: `PROJECT_ROOT` if set, else the current
    /// directory.
    pub fn resolve_root() -> PathBuf {
        match std::env::var_os("PROJECT_ROOT") {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => PathBuf::from("."),
        }
    }

    /// Archive path for one run.
    pub fn run_archive(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{run_id}.json"))
    }

    /// Full verify transcript for one run.
    pub fn verify_log(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(format!("{run_id}.verify.log"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_stable() {
        let paths = WorkspacePaths::new("/work/project");
        assert!(paths.task_file.ends_with("Task.json"));
        assert!(paths.processed_dir.ends_with("inbox/processed"));
        assert!(paths.run_archive("run-1").ends_with("runs/run-1.json"));
        assert!(paths.verify_log("run-1").ends_with("runs/run-1.verify.log"));
    }
}
