//! End-to-end cycle tests: fake sources and agents driving a real store.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use drover_db::models::{FailureKind, ProfileKind, Runner, RunnerStatus, SourceKind, TaskStatus};
use drover_db::queries::{execution_log, runners as runner_db, tasks as task_db};
use drover_test_utils::{TestDb, create_test_db};

use drover_core::agent::{
    Agent, AgentOutput, AgentRegistry, AgentRequest, Capability, Mutation,
};
use drover_core::classifier::{ClassificationMethod, Classifier, DEFAULT_AGENT};
use drover_core::discovery::{DiscoveryAggregator, SourceAdapter, SourceItem};
use drover_core::engine::ExecutionEngine;
use drover_core::error::AgentError;
use drover_core::health::{AdaptationEngine, HealthConfig, HealthMonitor};
use drover_core::orchestrator::{
    Components, Orchestrator, OrchestratorConfig, RunLimits, StopReason, TaskResult,
};
use drover_core::scheduler::{PoolConfig, RunnerCheck, Scheduler, SystemResources};

// ===========================================================================
// Fakes
// ===========================================================================

struct StaticSource {
    name: String,
    items: Vec<SourceItem>,
}

impl StaticSource {
    fn new(name: &str, items: Vec<SourceItem>) -> Arc<dyn SourceAdapter> {
        Arc::new(Self {
            name: name.to_string(),
            items,
        })
    }
}

#[async_trait]
impl SourceAdapter for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Manual
    }

    async fn list(&self) -> Result<Vec<SourceItem>> {
        Ok(self.items.clone())
    }
}

#[derive(Clone)]
enum Behavior {
    Succeed,
    Fail,
    Fault,
    Panic,
    Mutate { path: PathBuf, content: String },
}

/// Records every execution and checks that no runner is used twice at
/// the same time.
struct FakeAgent {
    name: String,
    profile: ProfileKind,
    behavior: Behavior,
    calls: Arc<Mutex<Vec<String>>>,
    active_runners: Arc<Mutex<HashSet<String>>>,
    shared_runner: Arc<AtomicBool>,
}

impl FakeAgent {
    fn new(name: &str, behavior: Behavior, probe: &Probe) -> Self {
        Self {
            name: name.to_string(),
            profile: ProfileKind::Light,
            behavior,
            calls: Arc::clone(&probe.calls),
            active_runners: Arc::clone(&probe.active_runners),
            shared_runner: Arc::clone(&probe.shared_runner),
        }
    }
}

#[derive(Default)]
struct Probe {
    calls: Arc<Mutex<Vec<String>>>,
    active_runners: Arc<Mutex<HashSet<String>>>,
    shared_runner: Arc<AtomicBool>,
}

impl Probe {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Agent for FakeAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        Capability::CodeGeneration
    }

    fn profile(&self) -> ProfileKind {
        self.profile
    }

    async fn execute(
        &self,
        request: &AgentRequest,
        _cancel: CancellationToken,
    ) -> Result<AgentOutput, AgentError> {
        self.calls.lock().unwrap().push(request.title.clone());
        if !self
            .active_runners
            .lock()
            .unwrap()
            .insert(request.runner_id.clone())
        {
            self.shared_runner.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.active_runners.lock().unwrap().remove(&request.runner_id);

        match &self.behavior {
            Behavior::Succeed => Ok(AgentOutput::succeeded("done", Duration::from_millis(20))),
            Behavior::Fail => Ok(AgentOutput::failed("agent gave up", Duration::from_millis(20))),
            Behavior::Fault => Err(AgentError::RunnerFault("sandbox died".to_string())),
            Behavior::Panic => panic!("agent exploded"),
            Behavior::Mutate { path, content } => Ok(AgentOutput::succeeded(
                "patched",
                Duration::from_millis(20),
            )
            .with_mutation(Mutation {
                path: path.clone(),
                content: content.clone(),
            })),
        }
    }
}

struct AlwaysReady(AtomicUsize);

#[async_trait]
impl RunnerCheck for AlwaysReady {
    async fn ready(&self, _runner: &Runner) -> bool {
        self.0.fetch_add(1, Ordering::SeqCst);
        true
    }
}

// ===========================================================================
// Harness
// ===========================================================================

struct TestHarness {
    db: TestDb,
    workspace: tempfile::TempDir,
}

impl TestHarness {
    async fn new() -> Self {
        Self {
            db: create_test_db().await,
            workspace: tempfile::TempDir::new().expect("failed to create workspace"),
        }
    }

    fn config(&self, max_in_progress: usize) -> OrchestratorConfig {
        OrchestratorConfig {
            poll_interval_secs: 0,
            max_in_progress,
            max_attempts: 2,
            workspace_root: self.workspace.path().to_path_buf(),
            ..OrchestratorConfig::default()
        }
    }

    async fn orchestrator(
        &self,
        config: OrchestratorConfig,
        sources: Vec<Arc<dyn SourceAdapter>>,
        agents: AgentRegistry,
    ) -> Orchestrator {
        let pool = self.db.pool.clone();
        let resources = SystemResources {
            gpus: vec![],
            cpu_cores: 16,
            free_ram_mb: 64 * 1024,
        };
        let pool_config = PoolConfig {
            light: 4,
            standard: 0,
            gpu_light: 0,
            gpu_heavy: 0,
            gpu_max: 0,
        };
        let scheduler = Scheduler::start(
            pool.clone(),
            &resources,
            &pool_config,
            config.max_runners,
            config.max_in_progress,
        )
        .await
        .expect("scheduler should start");

        let components = Components {
            discovery: DiscoveryAggregator::new(sources)
                .with_per_source_limit(config.per_source_limit),
            classifier: Classifier::standard(None, DEFAULT_AGENT),
            engine: ExecutionEngine::new(pool.clone(), agents, &config.engine_config()),
            scheduler,
            health: HealthMonitor::new(pool.clone(), &HealthConfig::default()),
            adaptation: AdaptationEngine::default(),
            runner_check: Box::new(AlwaysReady(AtomicUsize::new(0))),
        };
        Orchestrator::load(pool, config, components)
            .await
            .expect("orchestrator should load")
    }
}

fn registry(agents: Vec<FakeAgent>) -> AgentRegistry {
    let mut registry = AgentRegistry::new();
    for agent in agents {
        registry.register(agent);
    }
    registry
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn processes_by_priority_and_routes_by_pattern() {
    let h = TestHarness::new().await;
    let probe = Probe::default();
    let agents = registry(vec![
        FakeAgent::new("bug-fixer", Behavior::Succeed, &probe),
        FakeAgent::new("test-writer", Behavior::Succeed, &probe),
        FakeAgent::new("diagnostician", Behavior::Succeed, &probe),
        FakeAgent::new(DEFAULT_AGENT, Behavior::Succeed, &probe),
    ]);
    let source = StaticSource::new(
        "inbox",
        vec![
            SourceItem::new("Fix dashboard crash").with_priority("high"),
            SourceItem::new("Add unit tests for scheduler").with_priority("low"),
            SourceItem::new("Investigate GPU overheating").with_priority("critical"),
        ],
    );

    let mut orch = h.orchestrator(h.config(1), vec![source], agents).await;
    let report = orch
        .run_cycle(&CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(report.inserted, 3);
    assert_eq!(report.classified, 3);
    assert_eq!(report.completed(), 3);
    assert_eq!(
        probe.calls(),
        vec![
            "Investigate GPU overheating",
            "Fix dashboard crash",
            "Add unit tests for scheduler",
        ]
    );

    let expected = [
        ("Investigate GPU overheating", "diagnostician"),
        ("Fix dashboard crash", "bug-fixer"),
        ("Add unit tests for scheduler", "test-writer"),
    ];
    for (title, agent) in expected {
        let outcome = report.outcomes.iter().find(|o| o.title == title).unwrap();
        assert_eq!(outcome.agent, agent);
        assert_eq!(outcome.result, TaskResult::Completed);

        let task = task_db::get_task(&h.db.pool, outcome.task_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(
            task.classification_method.as_deref(),
            Some(ClassificationMethod::Pattern.as_str())
        );
        assert!(task.classification_confidence.unwrap() >= 0.8);
        assert!(task.completed_at.is_some());
    }

    let runners = runner_db::list_runners(&h.db.pool).await.unwrap();
    assert!(runners.iter().all(|r| r.status == RunnerStatus::Idle));
    assert_eq!(runners.iter().map(|r| r.tasks_completed).sum::<i64>(), 3);
}

#[tokio::test]
async fn rediscovery_does_not_duplicate_tasks() {
    let h = TestHarness::new().await;
    let probe = Probe::default();
    let agents = registry(vec![FakeAgent::new(DEFAULT_AGENT, Behavior::Succeed, &probe)]);
    let source = StaticSource::new(
        "inbox",
        vec![
            SourceItem::new("Write release notes"),
            SourceItem::new("  write   RELEASE notes "),
        ],
    );

    let mut orch = h.orchestrator(h.config(2), vec![source], agents).await;
    let cancel = CancellationToken::new();
    let first = orch.run_cycle(&cancel, None).await.unwrap();
    let second = orch.run_cycle(&cancel, None).await.unwrap();

    assert_eq!(first.inserted, 1);
    assert_eq!(second.discovered, 1);
    assert_eq!(second.inserted, 0);
    assert!(second.is_idle());
    assert_eq!(task_db::list_tasks(&h.db.pool).await.unwrap().len(), 1);
}

#[tokio::test]
async fn deny_listed_mutation_fails_task_and_preserves_file() {
    let h = TestHarness::new().await;
    let target = h.workspace.path().join("deploy.sh");
    let original = b"#!/bin/sh\necho deploying\n".to_vec();
    std::fs::write(&target, &original).unwrap();

    let probe = Probe::default();
    let agents = registry(vec![FakeAgent::new(
        "bug-fixer",
        Behavior::Mutate {
            path: PathBuf::from("deploy.sh"),
            content: "#!/bin/sh\nrm -rf /\n".to_string(),
        },
        &probe,
    )]);
    let source = StaticSource::new("inbox", vec![SourceItem::new("Fix deploy script")]);

    let mut orch = h.orchestrator(h.config(1), vec![source], agents).await;
    let report = orch
        .run_cycle(&CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(
        report.outcomes[0].result,
        TaskResult::Failed(FailureKind::ValidationFailure)
    );
    assert_eq!(std::fs::read(&target).unwrap(), original);

    let task = task_db::get_task(&h.db.pool, report.outcomes[0].task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.failure_kind, Some(FailureKind::ValidationFailure));
    assert!(task.error.unwrap().contains("rm -rf"));
}

#[tokio::test]
async fn allowed_mutation_is_written_with_backup() {
    let h = TestHarness::new().await;
    let target = h.workspace.path().join("config.json");
    std::fs::write(&target, "{\"debug\": true}").unwrap();

    let probe = Probe::default();
    let agents = registry(vec![FakeAgent::new(
        "bug-fixer",
        Behavior::Mutate {
            path: PathBuf::from("config.json"),
            content: "{\"debug\": false}".to_string(),
        },
        &probe,
    )]);
    let source = StaticSource::new("inbox", vec![SourceItem::new("Fix debug flag")]);

    let mut orch = h.orchestrator(h.config(1), vec![source], agents).await;
    let report = orch
        .run_cycle(&CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(report.outcomes[0].result, TaskResult::Completed);
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "{\"debug\": false}");

    let backups: Vec<_> = std::fs::read_dir(h.workspace.path().join(".drover/backups"))
        .unwrap()
        .collect();
    assert_eq!(backups.len(), 1);
}

#[tokio::test]
async fn failed_task_is_retried_until_budget_is_spent() {
    let h = TestHarness::new().await;
    let probe = Probe::default();
    let agents = registry(vec![FakeAgent::new("bug-fixer", Behavior::Fail, &probe)]);
    let source = StaticSource::new("inbox", vec![SourceItem::new("Fix flaky login")]);

    let mut orch = h.orchestrator(h.config(1), vec![source], agents).await;
    let cancel = CancellationToken::new();

    let first = orch.run_cycle(&cancel, None).await.unwrap();
    assert_eq!(
        first.outcomes[0].result,
        TaskResult::Failed(FailureKind::ExecutionError)
    );
    let task_id = first.outcomes[0].task_id;

    // max_attempts = 2: attempts counts returns to pending, so two retries.
    for _ in 0..2 {
        let retry = orch.run_cycle(&cancel, None).await.unwrap();
        assert_eq!(retry.retried, vec![task_id]);
        assert_eq!(retry.outcomes.len(), 1);
    }

    let last = orch.run_cycle(&cancel, None).await.unwrap();
    assert!(last.retried.is_empty());
    assert!(last.is_idle());

    let task = task_db::get_task(&h.db.pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 2);
    assert!(task.is_terminal());
    assert_eq!(probe.calls().len(), 3);

    let log = execution_log::list_for_task(&h.db.pool, task_id).await.unwrap();
    assert_eq!(log.len(), 3);
}

#[tokio::test]
async fn runner_fault_requeues_task_and_recovers_runner_once() {
    let h = TestHarness::new().await;
    let probe = Probe::default();
    let agents = registry(vec![FakeAgent::new("bug-fixer", Behavior::Fault, &probe)]);
    let source = StaticSource::new("inbox", vec![SourceItem::new("Fix GPU driver")]);

    let mut orch = h.orchestrator(h.config(1), vec![source], agents).await;
    let cancel = CancellationToken::new();

    let first = orch.run_cycle(&cancel, Some(1)).await.unwrap();
    assert_eq!(
        first.outcomes[0].result,
        TaskResult::Requeued(FailureKind::RunnerFault)
    );
    let faulted = first.outcomes[0].runner_id.clone();

    let task = task_db::get_task(&h.db.pool, first.outcomes[0].task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempts, 1);
    assert_eq!(task.failure_kind, Some(FailureKind::RunnerFault));

    let runners = orch.scheduler().runners().await;
    let runner = runners.iter().find(|r| r.id == faulted).unwrap();
    assert_eq!(runner.status, RunnerStatus::Error);

    let second = orch.run_cycle(&cancel, Some(0)).await.unwrap();
    assert_eq!(second.runner_recoveries.len(), 1);
    assert_eq!(second.runner_recoveries[0].runner_id, faulted);
    assert!(second.runner_recoveries[0].recovered);

    let third = orch.run_cycle(&cancel, Some(0)).await.unwrap();
    assert!(third.runner_recoveries.is_empty());
}

#[tokio::test]
async fn repeated_runner_faults_fail_task_once_attempts_are_spent() {
    let h = TestHarness::new().await;
    let probe = Probe::default();
    let agents = registry(vec![FakeAgent::new("bug-fixer", Behavior::Fault, &probe)]);
    let source = StaticSource::new("inbox", vec![SourceItem::new("Fix GPU driver")]);

    let mut orch = h.orchestrator(h.config(1), vec![source], agents).await;
    let cancel = CancellationToken::new();

    let mut results = Vec::new();
    for _ in 0..8 {
        let report = orch.run_cycle(&cancel, None).await.unwrap();
        results.extend(report.outcomes.into_iter().map(|o| (o.task_id, o.result)));
    }

    // max_attempts = 2: two requeues, then the third fault is terminal.
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].1, TaskResult::Requeued(FailureKind::RunnerFault));
    assert_eq!(results[1].1, TaskResult::Requeued(FailureKind::RunnerFault));
    assert_eq!(results[2].1, TaskResult::Failed(FailureKind::RunnerFault));

    let task_id = results[0].0;
    let task = task_db::get_task(&h.db.pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 2);
    assert_eq!(task.failure_kind, Some(FailureKind::RunnerFault));
    assert_eq!(probe.calls().len(), 3);

    let log = execution_log::list_for_task(&h.db.pool, task_id).await.unwrap();
    assert_eq!(log.len(), 3);
}

#[tokio::test]
async fn panicking_agent_is_a_runner_fault() {
    let h = TestHarness::new().await;
    let probe = Probe::default();
    let agents = registry(vec![FakeAgent::new("bug-fixer", Behavior::Panic, &probe)]);
    let source = StaticSource::new("inbox", vec![SourceItem::new("Fix the parser")]);

    let mut orch = h.orchestrator(h.config(1), vec![source], agents).await;
    let report = orch
        .run_cycle(&CancellationToken::new(), Some(1))
        .await
        .unwrap();

    assert_eq!(
        report.outcomes[0].result,
        TaskResult::Requeued(FailureKind::RunnerFault)
    );
    assert!(report.outcomes[0].error.as_deref().unwrap().contains("agent exploded"));
}

#[tokio::test]
async fn concurrent_tasks_never_share_a_runner() {
    let h = TestHarness::new().await;
    let probe = Probe::default();
    let agents = registry(vec![FakeAgent::new(DEFAULT_AGENT, Behavior::Succeed, &probe)]);
    let items = (0..10)
        .map(|i| SourceItem::new(format!("Chore number {i}")))
        .collect();
    let source = StaticSource::new("inbox", items);

    let mut config = h.config(5);
    config.per_source_limit = 10;
    let mut orch = h.orchestrator(config, vec![source], agents).await;
    let report = orch
        .run_cycle(&CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(report.completed(), 10);
    assert!(!probe.shared_runner.load(Ordering::SeqCst));
}

#[tokio::test]
async fn run_stops_after_max_tasks() {
    let h = TestHarness::new().await;
    let probe = Probe::default();
    let agents = registry(vec![FakeAgent::new(DEFAULT_AGENT, Behavior::Succeed, &probe)]);
    let source = StaticSource::new(
        "inbox",
        vec![
            SourceItem::new("Chore one"),
            SourceItem::new("Chore two"),
            SourceItem::new("Chore three"),
        ],
    );

    let mut orch = h.orchestrator(h.config(3), vec![source], agents).await;
    let summary = orch
        .run(
            RunLimits {
                max_tasks: Some(1),
                stop_on_empty: false,
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.stopped, StopReason::MaxTasks);
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.completed, 1);

    let counts = task_db::task_counts(&h.db.pool).await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.pending, 2);
}

#[tokio::test]
async fn run_stops_on_empty() {
    let h = TestHarness::new().await;
    let probe = Probe::default();
    let agents = registry(vec![FakeAgent::new(DEFAULT_AGENT, Behavior::Succeed, &probe)]);
    let source = StaticSource::new(
        "inbox",
        vec![SourceItem::new("Chore one"), SourceItem::new("Chore two")],
    );

    let mut orch = h.orchestrator(h.config(5), vec![source], agents).await;
    let summary = orch
        .run(
            RunLimits {
                max_tasks: None,
                stop_on_empty: true,
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.stopped, StopReason::Empty);
    assert_eq!(summary.cycles, 2);
    assert_eq!(summary.completed, 2);
}

#[tokio::test]
async fn cancelled_run_returns_immediately() {
    let h = TestHarness::new().await;
    let agents = registry(vec![]);
    let mut orch = h.orchestrator(h.config(5), vec![], agents).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = orch.run(RunLimits::default(), cancel).await.unwrap();
    assert_eq!(summary.stopped, StopReason::Cancelled);
    assert_eq!(summary.cycles, 0);
}
