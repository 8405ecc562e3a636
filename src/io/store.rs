//! Locked atomic access to `Task.json`.
//!
//! All reads and writes go through an exclusive advisory lock on a sibling
//! `.lock` file. Writes land on a temporary sibling and are renamed over the
//! target, so readers observe either the pre- or post-state, never a torn
//! file. Every load is validated against the embedded JSON Schema and the
//! semantic invariants before it is trusted.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use fs2::FileExt;
use jsonschema::{Draft, Validator};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::errors::SupervisorError;
use crate::core::invariants::validate_invariants;
use crate::core::task::TaskFile;
use crate::io::clock;

const TASK_FILE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/task_file.schema.json"
));

static SCHEMA_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(TASK_FILE_SCHEMA).expect("embedded task file schema should parse");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("embedded task file schema should compile")
});

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Exclusive-lock handle; releases on drop.
struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Best effort; the OS releases the lock when the fd closes anyway.
        let _ = FileExt::unlock(&self.file);
    }
}

/// Locked store over a single task file.
#[derive(Debug, Clone)]
pub struct TaskStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        Self {
            path,
            lock_path,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and validate the task file under the lock. Errors if the file is
    /// missing or malformed.
    pub fn read(&self) -> Result<TaskFile> {
        let _guard = self.acquire_lock()?;
        load_task_file(&self.path)
    }

    /// Like [`read`], but a missing file yields an empty v2.0 document.
    pub fn read_or_default(&self) -> Result<TaskFile> {
        let _guard = self.acquire_lock()?;
        if !self.path.exists() {
            return Ok(TaskFile::default());
        }
        load_task_file(&self.path)
    }

    /// Read-modify-write under the lock. `f` mutates the document in place
    /// and returns a caller-defined intent value. Invariants are re-checked
    /// after the mutation; a violation rejects the write and leaves the prior
    /// committed state intact. `last_modified` is stamped at commit time.
    pub fn mutate<T>(&self, f: impl FnOnce(&mut TaskFile) -> Result<T>) -> Result<T> {
        let _guard = self.acquire_lock()?;
        let mut file = if self.path.exists() {
            load_task_file(&self.path)?
        } else {
            TaskFile::default()
        };

        let out = f(&mut file)?;

        let violations = validate_invariants(&file);
        if !violations.is_empty() {
            return Err(SupervisorError::InvariantViolation { violations }.into());
        }

        file.last_modified = clock::now_iso();
        write_atomic(&self.path, &file)?;
        debug!(path = %self.path.display(), "task file committed");
        Ok(out)
    }

    fn acquire_lock(&self) -> Result<LockGuard> {
        let start = Instant::now();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .with_context(|| format!("open lock file {}", self.lock_path.display()))?;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(LockGuard { file }),
                Err(err) => {
                    let waited = start.elapsed();
                    if waited >= self.lock_timeout {
                        warn!(path = %self.lock_path.display(), ?err, "lock contended");
                        return Err(SupervisorError::LockContended {
                            path: self.lock_path.display().to_string(),
                            waited_ms: waited.as_millis() as u64,
                        }
                        .into());
                    }
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
            }
        }
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "Task.json".to_string());
    name.push_str(".lock");
    path.with_file_name(name)
}

/// Parse + schema-validate + invariant-check a task file on disk.
fn load_task_file(path: &Path) -> Result<TaskFile> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents).map_err(|err| {
        anyhow!(SupervisorError::ParseError {
            path: path.display().to_string(),
            detail: err.to_string(),
        })
    })?;

    let messages: Vec<String> = SCHEMA_VALIDATOR
        .iter_errors(&value)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!(SupervisorError::ParseError {
            path: path.display().to_string(),
            detail: format!("schema validation failed: {}", messages.join("; ")),
        }));
    }

    let file: TaskFile = serde_json::from_value(value).map_err(|err| {
        anyhow!(SupervisorError::ParseError {
            path: path.display().to_string(),
            detail: err.to_string(),
        })
    })?;

    let violations = validate_invariants(&file);
    if !violations.is_empty() {
        return Err(SupervisorError::InvariantViolation { violations }.into());
    }
    Ok(file)
}

/// Serialize to a temporary sibling, then atomically rename over the target.
fn write_atomic(path: &Path, file: &TaskFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(file).context("serialize task file")?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp task file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace task file {}", path.display()))?;
    Ok(())
}
