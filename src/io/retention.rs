//! Archive rotation for `runs/`.
//!
//! Two passes: delete archives older than the retention window, then delete
//! oldest-first while the directory exceeds the size cap. Archives belonging
//! to a task currently `in_progress` are never deleted.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct CleanupOutcome {
    pub deleted_count: usize,
    pub freed_bytes: u64,
    pub deleted_files: Vec<String>,
    /// Files protected by the in-progress rule during this pass.
    pub protected: Vec<String>,
}

struct ArchiveFile {
    path: PathBuf,
    name: String,
    size: u64,
    modified: SystemTime,
}

/// Rotate the runs directory. `live_run_ids` holds the run ids of every
/// `in_progress` claim; any file whose name starts with one of them is
/// protected.
pub fn cleanup_runs(
    runs_dir: &Path,
    retention_days: u64,
    max_runs_mb: u64,
    live_run_ids: &HashSet<String>,
    now: SystemTime,
) -> Result<CleanupOutcome> {
    let mut outcome = CleanupOutcome::default();
    if !runs_dir.exists() {
        return Ok(outcome);
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(runs_dir)
        .with_context(|| format!("read runs dir {}", runs_dir.display()))?
    {
        let entry = entry.context("read runs dir entry")?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        files.push(ArchiveFile {
            name: entry.file_name().to_string_lossy().into_owned(),
            size: meta.len(),
            modified: meta.modified().unwrap_or(now),
            path,
        });
    }
    files.sort_by_key(|f| f.modified);

    let is_protected = |file: &ArchiveFile| {
        live_run_ids
            .iter()
            .any(|run_id| file.name.starts_with(run_id.as_str()))
    };

    let retention = std::time::Duration::from_secs(retention_days * 24 * 60 * 60);
    let mut remaining = Vec::new();
    for file in files {
        let expired = now
            .duration_since(file.modified)
            .map(|age| age > retention)
            .unwrap_or(false);
        if !expired {
            remaining.push(file);
            continue;
        }
        if is_protected(&file) {
            warn!(file = %file.name, "retention skipped in-progress archive");
            outcome.protected.push(file.name.clone());
            remaining.push(file);
            continue;
        }
        delete(&file, &mut outcome);
    }

    let max_bytes = max_runs_mb * 1024 * 1024;
    let mut total: u64 = remaining.iter().map(|f| f.size).sum();
    let mut index = 0;
    while total > max_bytes && index < remaining.len() {
        let file = &remaining[index];
        index += 1;
        if is_protected(file) {
            warn!(file = %file.name, "retention skipped in-progress archive");
            outcome.protected.push(file.name.clone());
            continue;
        }
        total -= file.size;
        delete(file, &mut outcome);
    }

    debug!(
        deleted = outcome.deleted_count,
        freed = outcome.freed_bytes,
        "retention pass finished"
    );
    Ok(outcome)
}

fn delete(file: &ArchiveFile, outcome: &mut CleanupOutcome) {
    match fs::remove_file(&file.path) {
        Ok(()) => {
            outcome.deleted_count += 1;
            outcome.freed_bytes += file.size;
            outcome.deleted_files.push(file.name.clone());
        }
        Err(err) => warn!(file = %file.name, ?err, "failed to delete archive"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn touch(dir: &std::path::Path, name: &str, bytes: usize, age: Duration, now: SystemTime) {
        let path = dir.join(name);
        fs::write(&path, vec![b'x'; bytes]).expect("write");
        let mtime = now.checked_sub(age).expect("mtime");
        let file = fs::File::open(&path).expect("open");
        file.set_modified(mtime).expect("set mtime");
    }

    #[test]
    fn deletes_archives_older_than_retention() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runs = temp.path().to_path_buf();
        let now = SystemTime::now();
        touch(&runs, "run-old.json", 10, Duration::from_secs(8 * 86_400), now);
        touch(&runs, "run-new.json", 10, Duration::from_secs(3_600), now);

        let outcome =
            cleanup_runs(&runs, 7, 100, &HashSet::new(), now).expect("cleanup");
        assert_eq!(outcome.deleted_files, vec!["run-old.json".to_string()]);
        assert!(runs.join("run-new.json").exists());
    }

    #[test]
    fn size_cap_deletes_oldest_first() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runs = temp.path().to_path_buf();
        let now = SystemTime::now();
        // Cap of 0 MB forces everything out, oldest first.
        touch(&runs, "run-a.json", 100, Duration::from_secs(300), now);
        touch(&runs, "run-b.json", 100, Duration::from_secs(100), now);

        let outcome =
            cleanup_runs(&runs, 7, 0, &HashSet::new(), now).expect("cleanup");
        assert_eq!(
            outcome.deleted_files,
            vec!["run-a.json".to_string(), "run-b.json".to_string()]
        );
    }

    #[test]
    fn never_deletes_in_progress_archives() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runs = temp.path().to_path_buf();
        let now = SystemTime::now();
        touch(&runs, "run-live.json", 10, Duration::from_secs(30 * 86_400), now);
        touch(&runs, "run-live.verify.log", 10, Duration::from_secs(30 * 86_400), now);

        let live: HashSet<String> = ["run-live".to_string()].into_iter().collect();
        let outcome = cleanup_runs(&runs, 7, 100, &live, now).expect("cleanup");
        assert_eq!(outcome.deleted_count, 0);
        assert_eq!(outcome.protected.len(), 2);
        assert!(runs.join("run-live.json").exists());
    }
}
