//! Persistent task file data model.
//!
//! `Task.json` is the only durable shared state. Everything here serializes
//! with serde and must survive a parse(serialize(x)) round trip unchanged.

use serde::{Deserialize, Serialize};

/// Current task file format version.
pub const TASK_FILE_VERSION: &str = "2.0";

/// Lifecycle state of a task record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
    Abandoned,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Abandoned => "abandoned",
            TaskStatus::Canceled => "canceled",
        }
    }

    /// Terminal states never transition out.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Canceled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority. Lower value wins; ties break by declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::P1
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::P0 => f.write_str("P0"),
            Priority::P1 => f.write_str("P1"),
            Priority::P2 => f.write_str("P2"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "P0" | "p0" => Ok(Priority::P0),
            "P1" | "p1" => Ok(Priority::P1),
            "P2" | "p2" => Ok(Priority::P2),
            other => Err(format!("unknown priority '{other}' (expected P0|P1|P2)")),
        }
    }
}

/// A time-bounded assertion that one supervisor is executing a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    /// Supervisor identifier that holds the lease.
    pub claimed_by: String,
    /// Run identifier for this worker invocation.
    pub run_id: String,
    /// ISO-8601 UTC timestamp when the claim was taken.
    pub claimed_at: String,
    /// ISO-8601 UTC timestamp after which the lease is reclaimable.
    pub lease_expires_at: String,
    /// Attempt number, equals `history.len() + 1` while claimed.
    pub attempt: u32,
}

impl Claim {
    /// A lease is expired when `now >= lease_expires_at`. The boundary counts
    /// as expired. Unparseable expiry timestamps also count as expired so a
    /// corrupted claim cannot pin a task forever.
    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        match chrono::DateTime::parse_from_rfc3339(&self.lease_expires_at) {
            Ok(expires) => now >= expires.with_timezone(&chrono::Utc),
            Err(_) => true,
        }
    }
}

/// Captured verification evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyResult {
    #[serde(default)]
    pub command: String,
    pub exit_code: i32,
    #[serde(default)]
    pub evidence: String,
}

/// Version-control result reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitResult {
    #[serde(default)]
    pub commit: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

/// Outcome recorded on a completed task (written through on failures that
/// carry verify evidence).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify: Option<VerifyResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git: Option<GitResult>,
    #[serde(default)]
    pub summary: String,
}

/// Status recorded in a history entry. `Rejected` marks a terminal event that
/// was refused (run id mismatch) without changing the task's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    Completed,
    Failed,
    Blocked,
    Abandoned,
    Rejected,
}

impl std::fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HistoryStatus::Completed => "completed",
            HistoryStatus::Failed => "failed",
            HistoryStatus::Blocked => "blocked",
            HistoryStatus::Abandoned => "abandoned",
            HistoryStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// One entry appended on every terminal transition out of `in_progress`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub attempt: u32,
    pub run_id: String,
    pub status: HistoryStatus,
    #[serde(default)]
    pub error: String,
    pub ended_at: String,
}

/// A unit of work with a declarative description and deterministic terminal
/// outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<Claim>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub last_update: String,
}

impl TaskRecord {
    /// A new pending task with no history.
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            priority: Priority::default(),
            depends_on: Vec::new(),
            claim: None,
            result: None,
            history: Vec::new(),
            notes: String::new(),
            last_update: String::new(),
        }
    }

    /// True when a claim exists and its lease has not expired.
    pub fn has_live_claim(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        self.claim.as_ref().is_some_and(|c| !c.is_expired(now))
    }

    /// Attempts consumed so far (rejected entries do not consume an attempt).
    pub fn attempts_used(&self) -> u32 {
        self.history
            .iter()
            .filter(|h| h.status != HistoryStatus::Rejected)
            .count() as u32
    }
}

/// Durable scheduler configuration carried inside the task file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum claim lifetime in seconds.
    pub lease_ttl_seconds: u64,
    /// Attempts allowed per task before it must become blocked.
    pub max_attempts: u32,
    /// When true, `completed` requires a verify exit code of zero.
    pub verify_required: bool,
    /// Archive age cap in days.
    pub retention_days: u64,
    /// Archive size cap in megabytes.
    pub max_runs_mb: u64,
    /// Consecutive supervisor-level failures before raising an alert.
    pub max_failures: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lease_ttl_seconds: 900,
            max_attempts: 3,
            verify_required: true,
            retention_days: 7,
            max_runs_mb: 100,
            max_failures: 3,
        }
    }
}

/// The single persistent document the supervisor schedules from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFile {
    pub version: String,
    #[serde(default)]
    pub last_modified: String,
    #[serde(default)]
    pub config: Config,
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
}

impl Default for TaskFile {
    fn default() -> Self {
        Self {
            version: TASK_FILE_VERSION.to_string(),
            last_modified: String::new(),
            config: Config::default(),
            tasks: Vec::new(),
        }
    }
}

impl TaskFile {
    pub fn task(&self, id: &str) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut TaskRecord> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Ids of all completed tasks, for dependency checks.
    pub fn completed_ids(&self) -> std::collections::HashSet<&str> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn task_file_round_trips_through_json() {
        let mut file = TaskFile::default();
        let mut task = TaskRecord::new("t1", "do the thing");
        task.priority = Priority::P0;
        task.depends_on = vec!["t0".to_string()];
        task.history.push(HistoryEntry {
            attempt: 1,
            run_id: "run-20260101-000000-abc123".to_string(),
            status: HistoryStatus::Failed,
            error: "boom".to_string(),
            ended_at: "2026-01-01T00:05:00Z".to_string(),
        });
        file.tasks.push(task);

        let encoded = serde_json::to_string_pretty(&file).expect("serialize");
        let decoded: TaskFile = serde_json::from_str(&encoded).expect("parse");
        assert_eq!(decoded, file);
    }

    #[test]
    fn lease_boundary_counts_as_expired() {
        let now = Utc::now();
        let claim = Claim {
            claimed_by: "sup-1".to_string(),
            run_id: "run-x".to_string(),
            claimed_at: now.to_rfc3339(),
            lease_expires_at: now.to_rfc3339(),
            attempt: 1,
        };
        assert!(claim.is_expired(now));
        assert!(!claim.is_expired(now - Duration::seconds(1)));
    }

    #[test]
    fn unparseable_lease_expiry_counts_as_expired() {
        let claim = Claim {
            claimed_by: "sup-1".to_string(),
            run_id: "run-x".to_string(),
            claimed_at: String::new(),
            lease_expires_at: "not-a-timestamp".to_string(),
            attempt: 1,
        };
        assert!(claim.is_expired(Utc::now()));
    }

    #[test]
    fn rejected_entries_do_not_consume_attempts() {
        let mut task = TaskRecord::new("t1", "d");
        task.history.push(HistoryEntry {
            attempt: 1,
            run_id: "r1".to_string(),
            status: HistoryStatus::Rejected,
            error: "run id mismatch".to_string(),
            ended_at: String::new(),
        });
        task.history.push(HistoryEntry {
            attempt: 1,
            run_id: "r1".to_string(),
            status: HistoryStatus::Failed,
            error: String::new(),
            ended_at: String::new(),
        });
        assert_eq!(task.attempts_used(), 1);
    }

    #[test]
    fn priority_parses_and_orders() {
        assert!(Priority::P0 < Priority::P1);
        assert!(Priority::P1 < Priority::P2);
        assert_eq!("P0".parse::<Priority>().unwrap(), Priority::P0);
        assert!("P9".parse::<Priority>().is_err());
    }
}
