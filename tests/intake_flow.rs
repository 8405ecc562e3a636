//! Intake pipeline scenarios: documents in, seeded tasks out, all-or-nothing.

use std::fs;
use std::path::Path;
use std::process::Command;

use shepherd::core::task::TaskStatus;
use shepherd::test_support::{ScriptedVerifier, TestWorkspace, pending};

const REQ: &str = r#"# REQ_001: widget milestone
## Status
new
## 项目要求
Widgets must be blue and tested.
## 运行参数
```yaml
max_attempts: 5
```
## Task Seeds
### WIDGET-001: build the widget
- goal: implement the widget
- acceptance: widget tests pass
- verification: scripts/verify.sh
- priority: P0
- depends_on: []
### WIDGET-002: document the widget
- goal: write widget docs
- acceptance: docs build cleanly
- priority: P1
- depends_on: [WIDGET-001]
"#;

fn init_git_repo(root: &Path) {
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

fn drop_req(workspace: &TestWorkspace, name: &str, contents: &str) -> std::path::PathBuf {
    fs::create_dir_all(&workspace.paths.inbox_dir).expect("inbox");
    let path = workspace.paths.inbox_dir.join(name);
    fs::write(&path, contents).expect("write req");
    path
}

/// Scenario: a document with two seeded tasks, the second depending on the
/// first. Both land in the task file, the dependency resolves, the document
/// moves to processed/, and the progress log records a single commit.
#[test]
fn intake_seeds_tasks_and_moves_document() {
    let temp = tempfile::tempdir().expect("tempdir");
    let workspace = TestWorkspace::seed(temp.path(), Vec::new()).expect("workspace");
    init_git_repo(workspace.root());
    let doc = drop_req(&workspace, "REQ_001.md", REQ);

    let supervisor = workspace.supervisor();
    let intake = supervisor.intake_processor();
    let outcome = intake
        .process(&doc, "run-intake-1", &ScriptedVerifier::always(0))
        .expect("intake");

    assert_eq!(outcome.req_id, "REQ_001");
    assert_eq!(
        outcome.tasks_added,
        vec!["WIDGET-001".to_string(), "WIDGET-002".to_string()]
    );
    assert!(outcome.git_commit.is_some());
    assert!(!doc.exists());
    assert!(outcome.processed_to.exists());

    // The committed file passes schema + invariant validation on read.
    let file = supervisor.store.read().expect("read");
    assert_eq!(file.config.max_attempts, 5);
    assert_eq!(file.tasks.len(), 2);
    assert_eq!(
        file.task("WIDGET-002").unwrap().depends_on,
        vec!["WIDGET-001".to_string()]
    );
    assert_eq!(file.task("WIDGET-001").unwrap().status, TaskStatus::Pending);

    // Requirements prose was appended to the external document.
    let requirements =
        fs::read_to_string(&workspace.paths.requirements_file).expect("requirements");
    assert!(requirements.contains("Widgets must be blue and tested."));

    let progress = workspace.progress();
    assert_eq!(progress.matches("INTAKE_COMPLETE: REQ_001").count(), 1);
}

/// A dependency cycle inside the document is rejected at validation; the
/// task file is untouched and the document stays in the inbox, annotated.
#[test]
fn circular_dependency_is_rejected() {
    let req = r#"# REQ_002: tangled
## Status
new
## Task Seeds
### LOOP-A: first
- goal: a
- acceptance: a done
- depends_on: [LOOP-B]
### LOOP-B: second
- goal: b
- acceptance: b done
- depends_on: [LOOP-A]
"#;
    let temp = tempfile::tempdir().expect("tempdir");
    let workspace = TestWorkspace::seed(temp.path(), Vec::new()).expect("workspace");
    let doc = drop_req(&workspace, "REQ_002.md", req);

    let supervisor = workspace.supervisor();
    let intake = supervisor.intake_processor();
    let err = intake
        .process(&doc, "run-intake-2", &ScriptedVerifier::always(0))
        .unwrap_err();
    assert!(format!("{err:#}").contains("cycle"));

    let file = supervisor.store.read_or_default().expect("read");
    assert!(file.tasks.is_empty());
    assert!(doc.exists());
    let annotated = fs::read_to_string(&doc).expect("read doc");
    assert!(annotated.contains("intake rejected"));
    assert!(workspace.progress().contains("INTAKE_FAIL: REQ_002"));
}

/// A failing verify gate aborts the whole document.
#[test]
fn failing_verify_gate_leaves_task_file_untouched() {
    let temp = tempfile::tempdir().expect("tempdir");
    let workspace = TestWorkspace::seed(temp.path(), Vec::new()).expect("workspace");
    let doc = drop_req(&workspace, "REQ_003.md", REQ);

    let supervisor = workspace.supervisor();
    let intake = supervisor.intake_processor();
    let err = intake
        .process(&doc, "run-intake-3", &ScriptedVerifier::always(2))
        .unwrap_err();
    assert!(format!("{err:#}").contains("verify gate failed"));

    let file = supervisor.store.read_or_default().expect("read");
    assert!(file.tasks.is_empty());
    assert_eq!(file.config.max_attempts, 3);
    assert!(doc.exists());
}

/// Documents containing obvious secrets never reach the task file.
#[test]
fn secret_bearing_document_is_rejected() {
    let req = format!(
        "{REQ}\n## Notes\napi_key: ghp_{}\n",
        "a".repeat(36)
    );
    let temp = tempfile::tempdir().expect("tempdir");
    let workspace = TestWorkspace::seed(temp.path(), Vec::new()).expect("workspace");
    let doc = drop_req(&workspace, "REQ_004.md", &req);

    let supervisor = workspace.supervisor();
    let intake = supervisor.intake_processor();
    let err = intake
        .process(&doc, "run-intake-4", &ScriptedVerifier::always(0))
        .unwrap_err();
    assert!(format!("{err:#}").contains("secret detected"));

    let file = supervisor.store.read_or_default().expect("read");
    assert!(file.tasks.is_empty());
}

/// Id collisions against the existing file get numeric suffixes, and the
/// document's internal dependencies follow the rename.
#[test]
fn colliding_ids_are_suffixed_against_existing_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let workspace = TestWorkspace::seed(temp.path(), vec![pending("WIDGET-001", "already here")])
        .expect("workspace");
    let doc = drop_req(&workspace, "REQ_005.md", REQ);

    let supervisor = workspace.supervisor();
    let intake = supervisor.intake_processor();
    let outcome = intake
        .process(&doc, "run-intake-5", &ScriptedVerifier::always(0))
        .expect("intake");

    assert_eq!(
        outcome.tasks_added,
        vec!["WIDGET-001-1".to_string(), "WIDGET-002".to_string()]
    );
    let file = supervisor.store.read().expect("read");
    assert_eq!(
        file.task("WIDGET-002").unwrap().depends_on,
        vec!["WIDGET-001-1".to_string()]
    );
    assert!(
        file.task("WIDGET-001-1")
            .unwrap()
            .notes
            .contains("renamed from 'WIDGET-001'")
    );
}

/// Inbox scanning skips processed documents and sorts by name.
#[test]
fn scan_inbox_skips_processed_documents() {
    let temp = tempfile::tempdir().expect("tempdir");
    let workspace = TestWorkspace::seed(temp.path(), Vec::new()).expect("workspace");
    drop_req(&workspace, "REQ_011.md", REQ);
    drop_req(
        &workspace,
        "REQ_010.md",
        "# REQ_010: done\n## Status\nprocessed\n",
    );
    drop_req(&workspace, "notes.md", "not a requirement");

    let supervisor = workspace.supervisor();
    let intake = supervisor.intake_processor();
    let pending_docs = intake.scan_inbox().expect("scan");
    let names: Vec<String> = pending_docs
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["REQ_011.md".to_string()]);
}
