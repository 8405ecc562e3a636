//! Supervisor CLI.
//!
//! Exit codes: 0 success, 1 runtime error, 2 usage error, 3 blocked task
//! encountered.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use shepherd::exit_codes;
use shepherd::io::clock;
use shepherd::io::config::load_config;
use shepherd::io::paths::WorkspacePaths;
use shepherd::io::report::{render_status_board, write_status_report};
use shepherd::io::retention::cleanup_runs;
use shepherd::io::verify::ShellVerifier;
use shepherd::io::worker::CommandWorker;
use shepherd::logging;
use shepherd::supervisor::{LoopOptions, LoopStop, StepOutcome, Supervisor};

#[derive(Parser)]
#[command(
    name = "shepherd",
    version,
    about = "Durable task supervisor driving agent workers against a leased task file"
)]
struct Cli {
    /// Print the status board; no state change.
    #[arg(long)]
    status: bool,

    /// Print the next eligible task without claiming it.
    #[arg(long)]
    dry_run: bool,

    /// Perform the reclaim sweep only.
    #[arg(long)]
    reclaim: bool,

    /// Execute tasks until none are eligible or STOP is requested.
    #[arg(long = "loop")]
    run_loop: bool,

    /// Execute up to N tasks.
    #[arg(long, value_name = "N")]
    count: Option<u32>,

    /// Override the worker turn budget for this run.
    #[arg(long, value_name = "N")]
    max_turns: Option<u32>,

    /// Override the worker timeout (seconds) for this run.
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Override the lease TTL (seconds) for this run; not persisted.
    #[arg(long, value_name = "SECS")]
    lease_ttl: Option<u64>,

    /// Process one requirement document.
    #[arg(long, value_name = "FILE")]
    intake: Option<PathBuf>,

    /// Poll this inbox directory for new documents (compose with --loop).
    #[arg(long, value_name = "DIR")]
    watch_inbox: Option<PathBuf>,

    /// Regenerate the status document (status.md).
    #[arg(long)]
    report: bool,

    /// Rotate archived worker output by age and total size.
    #[arg(long)]
    cleanup: bool,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::RUNTIME_ERROR);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    let root = WorkspacePaths::resolve_root();
    let mut paths = WorkspacePaths::new(&root);
    if let Some(inbox) = &cli.watch_inbox {
        paths.inbox_dir = inbox.clone();
        paths.processed_dir = inbox.join("processed");
    }

    let mut config = load_config(&paths.config_file)?;
    if let Some(max_turns) = cli.max_turns {
        config.max_turns = max_turns;
    }
    if let Some(timeout) = cli.timeout {
        config.worker_timeout_secs = timeout;
    }

    let mut supervisor = Supervisor::new(paths, config);
    supervisor.lease_ttl_override = cli.lease_ttl;

    if cli.status {
        let file = supervisor.store.read_or_default()?;
        print!(
            "{}",
            render_status_board(
                &file,
                clock::now_utc(),
                supervisor.paths.stop_file.exists(),
                supervisor.paths.pause_file.exists(),
            )
        );
        return Ok(exit_codes::OK);
    }

    if cli.dry_run {
        match supervisor.next_eligible()? {
            Some(task) => {
                println!("next task: {} [{}]", task.id, task.priority);
                println!("{}", task.description);
            }
            None => println!("no eligible task"),
        }
        return Ok(exit_codes::OK);
    }

    if cli.reclaim {
        let reclaimed = supervisor.reclaim_expired()?;
        println!("reclaimed {reclaimed} expired leases");
        return Ok(exit_codes::OK);
    }

    if cli.report {
        let file = supervisor.store.read_or_default()?;
        write_status_report(
            &supervisor.paths.status_file,
            &file,
            &supervisor.paths.runs_dir,
            clock::now_utc(),
        )?;
        println!("wrote {}", supervisor.paths.status_file.display());
        return Ok(exit_codes::OK);
    }

    if cli.cleanup {
        let durable = supervisor.durable_config()?;
        let outcome = cleanup_runs(
            &supervisor.paths.runs_dir,
            durable.retention_days,
            durable.max_runs_mb,
            &supervisor.live_run_ids()?,
            std::time::SystemTime::now(),
        )?;
        println!(
            "deleted {} archives, freed {:.2} MB",
            outcome.deleted_count,
            outcome.freed_bytes as f64 / (1024.0 * 1024.0)
        );
        return Ok(exit_codes::OK);
    }

    if let Some(doc) = &cli.intake {
        let intake = supervisor.intake_processor();
        let run_id = clock::new_run_id(clock::now_utc());
        let outcome = intake
            .process(doc, &run_id, &ShellVerifier)
            .with_context(|| format!("intake {}", doc.display()))?;
        println!(
            "processed {}: added {} tasks",
            outcome.req_id,
            outcome.tasks_added.len()
        );
        return Ok(exit_codes::OK);
    }

    // Execution modes spawn real workers from here on.
    supervisor.signals.install_interrupt_handler();
    let worker = CommandWorker {
        command: supervisor.config.worker_command.clone(),
        max_turns: supervisor.config.max_turns,
    };
    let verifier = ShellVerifier;

    if cli.run_loop || cli.count.is_some() || cli.watch_inbox.is_some() {
        let opts = LoopOptions {
            max_count: cli.count,
            watch_inbox: cli.watch_inbox.is_some(),
        };
        let outcome = supervisor.run_loop(&worker, &verifier, &opts)?;
        println!("executed {} tasks ({:?})", outcome.executed, outcome.stop);
        return Ok(match outcome.stop {
            LoopStop::BlockedTasks => exit_codes::BLOCKED,
            _ => exit_codes::OK,
        });
    }

    match supervisor.execute_one(&worker, &verifier)? {
        StepOutcome::Completed { task_id, .. } => {
            println!("completed {task_id}");
            Ok(exit_codes::OK)
        }
        StepOutcome::Failed { task_id, error, .. } => {
            println!("failed {task_id}: {error}");
            Ok(exit_codes::RUNTIME_ERROR)
        }
        StepOutcome::Blocked { task_id, reason, .. } => {
            println!("blocked {task_id}: {reason}");
            Ok(exit_codes::BLOCKED)
        }
        StepOutcome::NoEligible { blocked, pending } => {
            if blocked > 0 {
                println!("no eligible task; {blocked} blocked tasks need human intervention");
                Ok(exit_codes::BLOCKED)
            } else if pending == 0 {
                println!("all tasks done");
                Ok(exit_codes::OK)
            } else {
                println!("no eligible task ({pending} pending with unmet dependencies)");
                Ok(exit_codes::OK)
            }
        }
        StepOutcome::Stopped => {
            println!("stop requested");
            Ok(exit_codes::OK)
        }
        StepOutcome::Paused => {
            println!("paused (remove PAUSE to resume)");
            Ok(exit_codes::OK)
        }
    }
}
