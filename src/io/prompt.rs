//! Worker instruction rendering.
//!
//! The instruction prose lives in an external template asset; the supervisor
//! treats the rendered result as opaque payload for the worker's stdin.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::core::task::TaskRecord;

const WORKER_TEMPLATE: &str = include_str!("prompts/worker.md");

/// Inputs for one worker invocation.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub task: &'a TaskRecord,
    pub run_id: &'a str,
    pub attempt: u32,
    pub max_attempts: u32,
    pub verify_command: &'a str,
}

/// Render the worker prompt from the embedded template, or from an override
/// file when the supervisor config names one.
pub fn render_worker_prompt(
    inputs: &PromptInputs<'_>,
    template_override: Option<&Path>,
) -> Result<String> {
    let source = match template_override {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("read prompt template {}", path.display()))?,
        None => WORKER_TEMPLATE.to_string(),
    };

    let mut env = Environment::new();
    env.add_template("worker", &source)
        .context("worker prompt template should be valid")?;
    let template = env.get_template("worker")?;
    let rendered = template.render(context! {
        task_id => inputs.task.id,
        run_id => inputs.run_id,
        attempt => inputs.attempt,
        max_attempts => inputs.max_attempts,
        description => inputs.task.description.trim(),
        depends_on => inputs.task.depends_on,
        notes => (!inputs.task.notes.trim().is_empty()).then(|| inputs.task.notes.trim()),
        verify_command => inputs.verify_command,
    })?;
    Ok(rendered)
}
