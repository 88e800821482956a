//! `drover discover`: one discovery and classification pass, no execution.
//!
//! The runner registry is left alone so a concurrent `drover run` keeps its
//! assignments.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::warn;

use drover_core::classifier::StageContext;
use drover_core::discovery::SourceOutcome;
use drover_core::orchestrator::{classify_pending, ingest};

use crate::config::ConfigFile;
use crate::setup;

pub async fn run_discover(pool: &SqlitePool, config: &ConfigFile) -> Result<()> {
    let discovery = setup::discovery(config)?;
    if discovery.source_count() == 0 {
        println!("No sources configured. Add [[sources]] to the config file.");
        return Ok(());
    }

    let report = ingest(pool, &discovery, config.orchestrator.max_attempts).await?;

    for source in &report.batch.reports {
        match &source.outcome {
            SourceOutcome::Listed { taken, truncated } if *truncated > 0 => println!(
                "  {:<20} {:<14} {taken} item(s), {truncated} over the limit",
                source.source, source.kind.as_str()
            ),
            SourceOutcome::Listed { taken, .. } => {
                println!("  {:<20} {:<14} {taken} item(s)", source.source, source.kind.as_str())
            }
            SourceOutcome::Failed(error) => {
                println!("  {:<20} {:<14} FAILED: {error}", source.source, source.kind.as_str())
            }
        }
    }
    println!();
    println!(
        "Discovered {} task(s), {} new.",
        report.batch.tasks.len(),
        report.inserted.len()
    );
    for task in &report.inserted {
        println!("  [{}] {} ({})", task.priority, task.title, task.id);
    }

    let backend = setup::inference(config)?;
    let inference_healthy = match &backend {
        Some(backend) => match backend.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "inference service unreachable; pattern stage only");
                false
            }
        },
        None => false,
    };
    let ctx = StageContext {
        catalog: setup::registry(config).names(),
        inference_healthy,
    };
    let classifier = setup::classifier(config, backend);
    let classified = classify_pending(pool, &classifier, &ctx).await?;
    println!("Classified {classified} pending task(s).");

    Ok(())
}
