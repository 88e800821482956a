//! Build the orchestrator's collaborators from a [`ConfigFile`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::{info, warn};

use drover_core::agent::{AgentRegistry, CommandAgent};
use drover_core::classifier::Classifier;
use drover_core::discovery::DiscoveryAggregator;
use drover_core::engine::ExecutionEngine;
use drover_core::health::{
    AdaptationEngine, HealthMonitor, INFERENCE_COMPONENT, InferenceHealthCheck, StoreHealthCheck,
};
use drover_core::inference::{InferenceBackend, OllamaBackend};
use drover_core::orchestrator::Components;
use drover_core::scheduler::resources::SystemResources;
use drover_core::scheduler::{GpuPresenceCheck, Scheduler};

use crate::config::ConfigFile;

pub fn registry(config: &ConfigFile) -> AgentRegistry {
    let mut agents = AgentRegistry::new();
    for agent in &config.agents {
        if agents.register(CommandAgent::new(agent.clone())).is_some() {
            warn!(agent = %agent.name, "agent defined twice; the last one wins");
        }
    }
    agents
}

pub fn discovery(config: &ConfigFile) -> Result<DiscoveryAggregator> {
    let sources = config
        .sources
        .iter()
        .map(|s| s.build())
        .collect::<Result<Vec<_>>>()?;
    Ok(DiscoveryAggregator::new(sources)
        .with_per_source_limit(config.orchestrator.per_source_limit)
        .with_source_timeout(Duration::from_secs(config.orchestrator.source_timeout_secs)))
}

pub fn inference(config: &ConfigFile) -> Result<Option<Arc<dyn InferenceBackend>>> {
    let Some(settings) = &config.classifier.inference else {
        return Ok(None);
    };
    let backend: Arc<dyn InferenceBackend> = Arc::new(
        OllamaBackend::new(settings).context("failed to build inference client")?,
    );
    Ok(Some(backend))
}

pub fn classifier(config: &ConfigFile, backend: Option<Arc<dyn InferenceBackend>>) -> Classifier {
    Classifier::standard(backend, config.classifier.default_agent.clone())
}

/// Health monitor: the store, the inference service unless a configured
/// service takes its name, then every `[[health.services]]` entry.
pub fn health(
    pool: &SqlitePool,
    config: &ConfigFile,
    backend: Option<Arc<dyn InferenceBackend>>,
) -> Result<HealthMonitor> {
    let mut monitor = HealthMonitor::new(pool.clone(), &config.health);
    monitor.add(Arc::new(StoreHealthCheck::new(pool.clone())), None);

    let overridden = config
        .health
        .services
        .iter()
        .any(|s| s.name == INFERENCE_COMPONENT);
    if let Some(backend) = backend.filter(|_| !overridden) {
        monitor.add(Arc::new(InferenceHealthCheck::new(backend, false)), None);
    }

    for service in &config.health.services {
        let (check, recovery) = service.build()?;
        monitor.add(check, recovery);
    }
    Ok(monitor)
}

/// Everything `run` needs. Probes the machine and replaces the stored
/// runner registry.
pub async fn components(pool: &SqlitePool, config: &ConfigFile) -> Result<Components> {
    let backend = inference(config)?;
    let resources = SystemResources::probe().await.with_overrides(&config.resources);
    info!(
        cpu_cores = resources.cpu_cores,
        free_ram_mb = resources.free_ram_mb,
        gpus = resources.gpus.len(),
        "system resources"
    );

    let scheduler = Scheduler::start(
        pool.clone(),
        &resources,
        &config.pool,
        config.orchestrator.max_runners,
        config.orchestrator.max_in_progress,
    )
    .await?;

    let engine = ExecutionEngine::new(
        pool.clone(),
        registry(config),
        &config.orchestrator.engine_config(),
    );

    Ok(Components {
        discovery: discovery(config)?,
        classifier: classifier(config, backend.clone()),
        engine,
        scheduler,
        health: health(pool, config, backend)?,
        adaptation: AdaptationEngine::new(config.adaptation.clone()),
        runner_check: Box::new(GpuPresenceCheck),
    })
}
