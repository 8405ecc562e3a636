//! Semantic invariants not expressible via JSON Schema.
//!
//! Checked on every load and before every committed write. A violation
//! rejects the write and leaves the prior state intact.

use std::collections::{HashMap, HashSet};

use crate::core::task::{TaskFile, TaskStatus, TASK_FILE_VERSION};

/// Check the task file against the §3 invariants. Returns one message per
/// violation; empty means the file is well-formed.
pub fn validate_invariants(file: &TaskFile) -> Vec<String> {
    let mut errors = Vec::new();

    if file.version != TASK_FILE_VERSION {
        errors.push(format!(
            "unsupported version '{}' (expected '{}')",
            file.version, TASK_FILE_VERSION
        ));
    }

    let mut seen = HashSet::new();
    for task in &file.tasks {
        if !seen.insert(task.id.as_str()) {
            errors.push(format!("duplicate task id '{}'", task.id));
        }
    }

    for task in &file.tasks {
        let id = task.id.as_str();

        if task.status == TaskStatus::Completed && file.config.verify_required {
            let exit_code = task
                .result
                .as_ref()
                .and_then(|r| r.verify.as_ref())
                .map(|v| v.exit_code);
            if exit_code != Some(0) {
                errors.push(format!(
                    "{id}: completed without verify exit_code 0 (found {exit_code:?})"
                ));
            }
        }

        match (&task.claim, task.status) {
            (Some(_), TaskStatus::InProgress) => {}
            (Some(_), status) => {
                errors.push(format!("{id}: claim present but status is {status}"));
            }
            (None, TaskStatus::InProgress) => {
                errors.push(format!("{id}: in_progress without a claim"));
            }
            (None, _) => {}
        }

        if let Some(claim) = &task.claim {
            let expected = task.attempts_used() + 1;
            if claim.attempt != expected {
                errors.push(format!(
                    "{id}: claim attempt {} but history implies {}",
                    claim.attempt, expected
                ));
            }
        }

        if task.attempts_used() > file.config.max_attempts {
            errors.push(format!(
                "{id}: history records {} attempts, cap is {}",
                task.attempts_used(),
                file.config.max_attempts
            ));
        }

        let mut prev_attempt = 0;
        for entry in &task.history {
            if entry.attempt < prev_attempt {
                errors.push(format!(
                    "{id}: history attempts not monotone ({} after {})",
                    entry.attempt, prev_attempt
                ));
                break;
            }
            prev_attempt = entry.attempt;
        }

        for dep in &task.depends_on {
            if !file.tasks.iter().any(|t| &t.id == dep) {
                errors.push(format!("{id}: depends_on unknown task '{dep}'"));
            }
        }
    }

    if let Some(cycle) = find_cycle(file) {
        errors.push(format!("dependency cycle: {}", cycle.join(" -> ")));
    }

    errors
}

/// Depth-first three-color cycle detection over `depends_on` edges.
fn find_cycle(file: &TaskFile) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InStack,
        Done,
    }

    let ids: HashMap<&str, usize> = file
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();
    let mut marks = vec![Mark::Unvisited; file.tasks.len()];
    let mut stack = Vec::new();

    fn visit(
        index: usize,
        file: &TaskFile,
        ids: &HashMap<&str, usize>,
        marks: &mut Vec<Mark>,
        stack: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        marks[index] = Mark::InStack;
        stack.push(index);
        for dep in &file.tasks[index].depends_on {
            let Some(&dep_index) = ids.get(dep.as_str()) else {
                continue;
            };
            match marks[dep_index] {
                Mark::InStack => {
                    let start = stack.iter().position(|&i| i == dep_index).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[start..]
                        .iter()
                        .map(|&i| file.tasks[i].id.clone())
                        .collect();
                    cycle.push(file.tasks[dep_index].id.clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(dep_index, file, ids, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[index] = Mark::Done;
        None
    }

    for index in 0..file.tasks.len() {
        if marks[index] == Mark::Unvisited {
            if let Some(cycle) = visit(index, file, &ids, &mut marks, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{
        HistoryEntry, HistoryStatus, TaskRecord, TaskResult, VerifyResult,
    };

    fn file_with(tasks: Vec<TaskRecord>) -> TaskFile {
        TaskFile {
            tasks,
            ..TaskFile::default()
        }
    }

    #[test]
    fn default_file_is_valid() {
        assert!(validate_invariants(&TaskFile::default()).is_empty());
    }

    #[test]
    fn completed_without_verify_evidence_is_rejected() {
        let mut task = TaskRecord::new("t1", "d");
        task.status = TaskStatus::Completed;
        let errors = validate_invariants(&file_with(vec![task]));
        assert!(errors.iter().any(|e| e.contains("verify exit_code 0")));
    }

    #[test]
    fn completed_with_zero_exit_passes() {
        let mut task = TaskRecord::new("t1", "d");
        task.status = TaskStatus::Completed;
        task.result = Some(TaskResult {
            verify: Some(VerifyResult {
                command: "scripts/verify.sh".to_string(),
                exit_code: 0,
                evidence: String::new(),
            }),
            git: None,
            summary: String::new(),
        });
        task.history.push(HistoryEntry {
            attempt: 1,
            run_id: "r".to_string(),
            status: HistoryStatus::Completed,
            error: String::new(),
            ended_at: String::new(),
        });
        assert!(validate_invariants(&file_with(vec![task])).is_empty());
    }

    #[test]
    fn duplicate_ids_and_unknown_deps_are_reported() {
        let a = TaskRecord::new("dup", "a");
        let mut b = TaskRecord::new("dup", "b");
        b.depends_on = vec!["ghost".to_string()];
        let errors = validate_invariants(&file_with(vec![a, b]));
        assert!(errors.iter().any(|e| e.contains("duplicate task id")));
        assert!(errors.iter().any(|e| e.contains("unknown task 'ghost'")));
    }

    #[test]
    fn dependency_cycles_are_rejected() {
        let mut a = TaskRecord::new("a", "a");
        a.depends_on = vec!["b".to_string()];
        let mut b = TaskRecord::new("b", "b");
        b.depends_on = vec!["a".to_string()];
        let errors = validate_invariants(&file_with(vec![a, b]));
        assert!(errors.iter().any(|e| e.contains("dependency cycle")));
    }

    #[test]
    fn in_progress_without_claim_is_rejected() {
        let mut task = TaskRecord::new("t1", "d");
        task.status = TaskStatus::InProgress;
        let errors = validate_invariants(&file_with(vec![task]));
        assert!(errors.iter().any(|e| e.contains("without a claim")));
    }

    #[test]
    fn history_beyond_attempt_cap_is_rejected() {
        let mut task = TaskRecord::new("t1", "d");
        for i in 0..4u32 {
            task.history.push(HistoryEntry {
                attempt: i + 1,
                run_id: format!("r{i}"),
                status: HistoryStatus::Failed,
                error: String::new(),
                ended_at: String::new(),
            });
        }
        task.status = TaskStatus::Blocked;
        let errors = validate_invariants(&file_with(vec![task]));
        assert!(errors.iter().any(|e| e.contains("cap is 3")));
    }
}
