//! Sentinel files and interrupt handling.
//!
//! `STOP` requests a graceful exit after the current task; `PAUSE` holds the
//! loop at an iteration boundary until removed. SIGINT is translated into a
//! STOP equivalent. `ALERT.txt` surfaces situations that need an operator;
//! removing it is the operator's responsibility.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::warn;

/// Polling interval while paused.
pub const PAUSE_POLL_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct Signals {
    stop_file: PathBuf,
    pause_file: PathBuf,
    alert_file: PathBuf,
    interrupted: Arc<AtomicBool>,
}

impl Signals {
    pub fn new(stop_file: PathBuf, pause_file: PathBuf, alert_file: PathBuf) -> Self {
        Self {
            stop_file,
            pause_file,
            alert_file,
            interrupted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Install the SIGINT handler. Failure is non-fatal: the sentinel files
    /// still work.
    pub fn install_interrupt_handler(&self) {
        let interrupted = Arc::clone(&self.interrupted);
        if let Err(err) = ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
        }) {
            warn!(?err, "failed to install interrupt handler");
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst) || self.stop_file.exists()
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_file.exists()
    }

    /// Write (or overwrite) the alert file with cause and remediation.
    pub fn write_alert(
        &self,
        now: DateTime<Utc>,
        kind: &str,
        task_id: &str,
        message: &str,
    ) -> Result<PathBuf> {
        let contents = format!(
            "ALERT: {kind}\ntime: {}\ntask: {task_id}\nmessage: {message}\n\nsuggested actions:\n1. check progress.txt for details\n2. check the task state in Task.json\n3. delete this file once resolved\n",
            now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        );
        fs::write(&self.alert_file, contents)
            .with_context(|| format!("write alert {}", self.alert_file.display()))?;
        Ok(self.alert_file.clone())
    }

    pub fn clear_alert(&self) -> Result<()> {
        if self.alert_file.exists() {
            fs::remove_file(&self.alert_file)
                .with_context(|| format!("remove alert {}", self.alert_file.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signals_in(temp: &tempfile::TempDir) -> Signals {
        Signals::new(
            temp.path().join("STOP"),
            temp.path().join("PAUSE"),
            temp.path().join("ALERT.txt"),
        )
    }

    #[test]
    fn stop_and_pause_follow_sentinel_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let signals = signals_in(&temp);
        assert!(!signals.stop_requested());
        assert!(!signals.pause_requested());

        fs::write(temp.path().join("STOP"), "").expect("touch STOP");
        fs::write(temp.path().join("PAUSE"), "").expect("touch PAUSE");
        assert!(signals.stop_requested());
        assert!(signals.pause_requested());
    }

    #[test]
    fn alert_is_written_and_cleared() {
        let temp = tempfile::tempdir().expect("tempdir");
        let signals = signals_in(&temp);

        let path = signals
            .write_alert(Utc::now(), "blocked", "t1", "needs credentials")
            .expect("write alert");
        let contents = fs::read_to_string(&path).expect("read alert");
        assert!(contents.contains("ALERT: blocked"));
        assert!(contents.contains("t1"));

        signals.clear_alert().expect("clear");
        assert!(!path.exists());
    }
}
