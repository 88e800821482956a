//! `drover run`: the orchestration loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use drover_core::orchestrator::{Orchestrator, RunLimits, StopReason};

use crate::config::ConfigFile;
use crate::setup;

/// Translate the command-line flags. `--single` is `--max 1`.
pub fn limits(max: Option<usize>, single: bool, stop_on_empty: bool) -> RunLimits {
    RunLimits {
        max_tasks: if single { Some(1) } else { max },
        stop_on_empty,
    }
}

pub async fn run(pool: &SqlitePool, config: &ConfigFile, limits: RunLimits) -> Result<()> {
    let components = setup::components(pool, config).await?;
    let mut orchestrator =
        Orchestrator::load(pool.clone(), config.orchestrator.clone(), components).await?;

    let runner_count = orchestrator.scheduler().runners().await.len();
    println!("Starting drover");
    println!("  Runners: {runner_count}");
    println!("  Max in progress: {}", config.orchestrator.max_in_progress);
    println!("  Poll interval: {}s", config.orchestrator.poll_interval_secs);
    if let Some(max) = limits.max_tasks {
        println!("  Stop after: {max} task(s)");
    }
    if runner_count == 0 {
        println!("  (no runner fits this machine; check [pool] and [resources])");
    }

    // Set up graceful shutdown: first signal cancels, second force-exits.
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    let got_first_signal = Arc::new(AtomicBool::new(false));
    let got_first_clone = Arc::clone(&got_first_signal);

    tokio::spawn(async move {
        loop {
            tokio::signal::ctrl_c().await.ok();
            if got_first_clone.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit.");
                std::process::exit(130);
            }
            eprintln!("\nShutting down gracefully (Ctrl+C again to force)...");
            cancel_clone.cancel();
        }
    });

    let summary = orchestrator.run(limits, cancel).await?;

    println!();
    println!(
        "Processed {} task(s) in {} cycle(s): {} completed, {} failed, {} requeued.",
        summary.processed, summary.cycles, summary.completed, summary.failed, summary.requeued
    );
    match summary.stopped {
        StopReason::MaxTasks => println!("Stopped: task limit reached."),
        StopReason::Empty => println!("Stopped: nothing left to do."),
        StopReason::Cancelled => {
            println!("Interrupted by signal. In-flight tasks were cancelled.");
            std::process::exit(130);
        }
    }

    Ok(())
}
