//! Status board rendering.
//!
//! The markdown report (`status.md`) is written atomically and is safe to
//! regenerate concurrently with a running supervisor; it only reads.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::core::selector::select_next;
use crate::core::task::{TaskFile, TaskStatus};
use crate::io::worker::RunArchive;

const STATUS_ORDER: [TaskStatus; 7] = [
    TaskStatus::Pending,
    TaskStatus::InProgress,
    TaskStatus::Completed,
    TaskStatus::Failed,
    TaskStatus::Blocked,
    TaskStatus::Abandoned,
    TaskStatus::Canceled,
];

const RECENT_RUNS: usize = 10;

fn count(file: &TaskFile, status: TaskStatus) -> usize {
    file.tasks.iter().filter(|t| t.status == status).count()
}

/// Render the markdown status document.
pub fn render_status_markdown(
    file: &TaskFile,
    runs_dir: &Path,
    now: DateTime<Utc>,
) -> String {
    let mut out = String::new();
    out.push_str("# Status Board\n\n");
    out.push_str(&format!(
        "generated: {}\n\n",
        now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    ));

    out.push_str("## Task counts\n\n| status | count |\n|---|---|\n");
    for status in STATUS_ORDER {
        out.push_str(&format!("| {status} | {} |\n", count(file, status)));
    }
    out.push_str(&format!("| **total** | **{}** |\n", file.tasks.len()));

    let blocked: Vec<_> = file
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Blocked)
        .collect();
    if !blocked.is_empty() {
        out.push_str("\n## Blocked tasks\n\n");
        for task in blocked {
            let description: String = task.description.chars().take(50).collect();
            out.push_str(&format!("- **{}**: {description}\n", task.id));
            if !task.notes.is_empty() {
                out.push_str(&format!("  - notes: {}\n", task.notes));
            }
            out.push_str("  - see progress.txt for the Human Help Packet\n");
        }
    }

    let recent = recent_runs(runs_dir);
    if !recent.is_empty() {
        out.push_str("\n## Recent runs\n\n| run id | time | task | status |\n|---|---|---|---|\n");
        for run in recent {
            let status = run
                .parsed_result
                .as_ref()
                .map(|r| match r {
                    crate::io::worker::WorkerReport::Completed { .. } => "completed",
                    crate::io::worker::WorkerReport::Failed { .. } => "failed",
                    crate::io::worker::WorkerReport::Blocked { .. } => "blocked",
                })
                .unwrap_or("unknown");
            out.push_str(&format!(
                "| {} | {} | {} | {status} |\n",
                run.run_id,
                run.timestamp.chars().take(19).collect::<String>(),
                run.task_id,
            ));
        }
    }

    let (archive_count, archive_bytes) = archive_usage(runs_dir);
    out.push_str("\n## Archive usage\n\n");
    out.push_str(&format!("- files: {archive_count}\n"));
    out.push_str(&format!("- total size: {:.2} KB\n", archive_bytes as f64 / 1024.0));
    out.push_str(&format!("- retention days: {}\n", file.config.retention_days));
    out.push_str(&format!("- size cap: {} MB\n", file.config.max_runs_mb));

    out
}

/// Atomically write the status document.
pub fn write_status_report(
    path: &Path,
    file: &TaskFile,
    runs_dir: &Path,
    now: DateTime<Utc>,
) -> Result<()> {
    let contents = render_status_markdown(file, runs_dir, now);
    let tmp_path = path.with_extension("md.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp status {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace status {}", path.display()))?;
    Ok(())
}

/// Plain-text board for `--status`.
pub fn render_status_board(
    file: &TaskFile,
    now: DateTime<Utc>,
    stop_present: bool,
    pause_present: bool,
) -> String {
    let mut out = String::new();
    out.push_str("Task status\n");
    out.push_str("----------------------------------------\n");
    for status in STATUS_ORDER {
        let n = count(file, status);
        if n > 0 {
            out.push_str(&format!("  {status}: {n}\n"));
        }
    }
    out.push_str(&format!("  total: {}\n\n", file.tasks.len()));

    match select_next(file, now) {
        Some(task) => {
            out.push_str("Next task\n");
            out.push_str(&format!("  id: {}\n", task.id));
            out.push_str(&format!("  priority: {}\n", task.priority));
            out.push_str(&format!("  description: {}\n", task.description));
            if !task.depends_on.is_empty() {
                out.push_str(&format!("  depends on: {}\n", task.depends_on.join(", ")));
            }
        }
        None => out.push_str("No eligible task\n"),
    }

    if stop_present {
        out.push_str("\nnote: STOP file present\n");
    }
    if pause_present {
        out.push_str("note: PAUSE file present\n");
    }
    if file.tasks.iter().any(|t| t.status == TaskStatus::Blocked) {
        out.push_str("warning: blocked tasks need human intervention\n");
    }
    out
}

fn recent_runs(runs_dir: &Path) -> Vec<RunArchive> {
    let Ok(entries) = fs::read_dir(runs_dir) else {
        return Vec::new();
    };
    let mut files: Vec<_> = entries
        .flatten()
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().ok()?;
            Some((modified, e.path()))
        })
        .collect();
    files.sort_by(|a, b| b.0.cmp(&a.0));

    files
        .into_iter()
        .take(RECENT_RUNS)
        .filter_map(|(_, path)| {
            let contents = fs::read_to_string(path).ok()?;
            serde_json::from_str(&contents).ok()
        })
        .collect()
}

fn archive_usage(runs_dir: &Path) -> (usize, u64) {
    let Ok(entries) = fs::read_dir(runs_dir) else {
        return (0, 0);
    };
    let mut count = 0;
    let mut bytes = 0;
    for entry in entries.flatten() {
        if let Ok(meta) = entry.metadata() {
            if meta.is_file() {
                count += 1;
                bytes += meta.len();
            }
        }
    }
    (count, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskRecord;

    #[test]
    fn report_counts_and_blocked_list() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut file = TaskFile::default();
        file.tasks.push(TaskRecord::new("t1", "first"));
        let mut blocked = TaskRecord::new("t2", "second");
        blocked.status = TaskStatus::Blocked;
        blocked.notes = "needs credentials".to_string();
        file.tasks.push(blocked);

        let md = render_status_markdown(&file, temp.path(), Utc::now());
        assert!(md.contains("| pending | 1 |"));
        assert!(md.contains("| blocked | 1 |"));
        assert!(md.contains("**t2**"));
        assert!(md.contains("needs credentials"));
    }

    #[test]
    fn write_is_atomic_and_parseable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("status.md");
        let file = TaskFile::default();

        write_status_report(&path, &file, temp.path(), Utc::now()).expect("write");
        let contents = fs::read_to_string(&path).expect("read");
        assert!(contents.starts_with("# Status Board"));
        assert!(!temp.path().join("status.md.tmp").exists());
    }

    #[test]
    fn board_shows_next_task() {
        let mut file = TaskFile::default();
        file.tasks.push(TaskRecord::new("t1", "first"));
        let board = render_status_board(&file, Utc::now(), false, false);
        assert!(board.contains("id: t1"));
    }
}
