//! Deterministic task selection and reclaim planning.

use chrono::{DateTime, Utc};

use crate::core::task::{TaskFile, TaskRecord, TaskStatus};

/// True when `task` can be claimed right now: pending, every dependency
/// completed, no live lease, attempts below the cap.
pub fn is_eligible(
    task: &TaskRecord,
    file: &TaskFile,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> bool {
    if task.status != TaskStatus::Pending {
        return false;
    }
    if task.attempts_used() >= max_attempts {
        return false;
    }
    if task.has_live_claim(now) {
        return false;
    }
    let completed = file.completed_ids();
    task.depends_on.iter().all(|d| completed.contains(d.as_str()))
}

/// Pick the next eligible task: lowest priority value wins (P0 before P1
/// before P2), ties broken by declaration order in the file.
pub fn select_next<'a>(file: &'a TaskFile, now: DateTime<Utc>) -> Option<&'a TaskRecord> {
    file.tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| is_eligible(t, file, file.config.max_attempts, now))
        .min_by_key(|(index, t)| (t.priority, *index))
        .map(|(_, t)| t)
}

/// Ids of `in_progress` tasks whose lease has expired at `now`. The boundary
/// (`lease_expires_at == now`) counts as expired.
pub fn expired_lease_ids(file: &TaskFile, now: DateTime<Utc>) -> Vec<String> {
    file.tasks
        .iter()
        .filter(|t| t.status == TaskStatus::InProgress)
        .filter(|t| t.claim.as_ref().is_some_and(|c| c.is_expired(now)))
        .map(|t| t.id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state_machine::StateMachine;
    use crate::core::task::Priority;

    fn file_with(tasks: Vec<TaskRecord>) -> TaskFile {
        TaskFile {
            tasks,
            ..TaskFile::default()
        }
    }

    #[test]
    fn select_skips_tasks_with_incomplete_deps() {
        let mut t1 = TaskRecord::new("t1", "first");
        t1.status = TaskStatus::Pending;
        let mut t2 = TaskRecord::new("t2", "second");
        t2.depends_on = vec!["t1".to_string()];
        let file = file_with(vec![t2, t1]);

        let selected = select_next(&file, Utc::now()).expect("eligible task");
        assert_eq!(selected.id, "t1");
    }

    #[test]
    fn select_honors_priority_then_declaration_order() {
        let mut a = TaskRecord::new("a", "p1 first");
        a.priority = Priority::P1;
        let mut b = TaskRecord::new("b", "p0 later");
        b.priority = Priority::P0;
        let mut c = TaskRecord::new("c", "p0 last");
        c.priority = Priority::P0;
        let file = file_with(vec![a, b, c]);

        let selected = select_next(&file, Utc::now()).expect("eligible task");
        assert_eq!(selected.id, "b");
    }

    #[test]
    fn select_becomes_eligible_once_dep_completes() {
        let mut t1 = TaskRecord::new("t1", "first");
        t1.status = TaskStatus::Completed;
        let mut t2 = TaskRecord::new("t2", "second");
        t2.depends_on = vec!["t1".to_string()];
        let file = file_with(vec![t1, t2]);

        let selected = select_next(&file, Utc::now()).expect("eligible task");
        assert_eq!(selected.id, "t2");
    }

    #[test]
    fn expired_leases_found_at_boundary() {
        let sm = StateMachine {
            lease_ttl_seconds: 900,
            max_attempts: 3,
            verify_required: true,
        };
        let mut task = TaskRecord::new("t1", "first");
        let claimed_at = Utc::now();
        sm.claim(&mut task, "sup-1", "run-a", claimed_at).expect("claim");
        let file = file_with(vec![task]);

        assert!(expired_lease_ids(&file, claimed_at).is_empty());
        let at_boundary = claimed_at + chrono::Duration::seconds(900);
        assert_eq!(expired_lease_ids(&file, at_boundary), vec!["t1".to_string()]);
    }

    #[test]
    fn exhausted_tasks_are_not_eligible() {
        let mut task = TaskRecord::new("t1", "first");
        for i in 0..3 {
            task.history.push(crate::core::task::HistoryEntry {
                attempt: i + 1,
                run_id: format!("run-{i}"),
                status: crate::core::task::HistoryStatus::Failed,
                error: String::new(),
                ended_at: String::new(),
            });
        }
        let file = file_with(vec![task]);
        assert!(select_next(&file, Utc::now()).is_none());
    }
}
