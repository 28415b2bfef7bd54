//! Workflow orchestrator for the contract-analysis pipeline.
//!
//! The orchestrator walks the dependency stages in order. Each stage is split
//! into parallel groups; each group waits for resources, is allocated as a
//! whole, runs its members concurrently through the [`UnitExecutor`] and
//! releases its grants. Outputs accumulate per unit and feed the inputs of
//! later stages.
//!
//! `run` never returns an error. Unit failures are absorbed by fallback;
//! orchestration failures (run timeout, panic, inconsistent state) trigger
//! graceful degradation; if that fails too the caller gets a structured
//! failure result.

use crate::agent::{AgentRegistry, SharedAgent, UnitInput, UnitKind};
use crate::orchestrator::aggregate::{WorkflowResult, compile_results, overall_status};
use crate::orchestrator::cache::{CacheStats, ResultCache};
use crate::orchestrator::config::{ExecutionMode, OrchestratorConfig, RunConfig};
use crate::orchestrator::error::OrchestratorError;
use crate::orchestrator::executor::{ExecutionOptions, UnitExecutor};
use crate::orchestrator::fallback::FallbackEngine;
use crate::orchestrator::health::{HealthRegistry, HealthStatus, UnitHealthSnapshot};
use crate::orchestrator::journal::{RecoveryAction, RecoveryKind};
use crate::orchestrator::parallel::{
    DependencyGraph, ExecutionStrategy, GrantKey, ResourceLedger, ResourceRequirements,
    ResourceUtilization, RunStatus, UnitOutcome, UnitSpec, UnitStatus, WorkflowRun,
    default_unit_specs,
};
use crate::orchestrator::progress::{NoopProgressSink, ProgressEvent, ProgressKind, ProgressSink};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Aggregate counters reported by `get_performance_statistics`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStatistics {
    pub total_runs: u64,
    pub completed_runs: u64,
    pub degraded_runs: u64,
    pub failed_runs: u64,
    pub cancelled_runs: u64,
    pub active_runs: usize,
    pub unit_executions: u64,
    pub fallbacks_used: u64,
    pub resource_wait_timeouts: u64,
    pub average_run_duration_ms: f64,
    pub cache: CacheStats,
    pub resource_utilization: ResourceUtilization,
    pub health: BTreeMap<UnitKind, UnitHealthSnapshot>,
}

#[derive(Debug, Default)]
struct RunCounters {
    total_runs: AtomicU64,
    completed_runs: AtomicU64,
    degraded_runs: AtomicU64,
    failed_runs: AtomicU64,
    cancelled_runs: AtomicU64,
    unit_executions: AtomicU64,
    fallbacks_used: AtomicU64,
    resource_wait_timeouts: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl RunCounters {
    fn record_finished(&self, status: RunStatus, duration_ms: u64) {
        let counter = match status {
            RunStatus::Completed => &self.completed_runs,
            RunStatus::Degraded => &self.degraded_runs,
            RunStatus::Cancelled => &self.cancelled_runs,
            _ => &self.failed_runs,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_duration_ms.fetch_add(duration_ms, Ordering::Relaxed);
    }

    fn finished_runs(&self) -> u64 {
        self.completed_runs.load(Ordering::Relaxed)
            + self.degraded_runs.load(Ordering::Relaxed)
            + self.failed_runs.load(Ordering::Relaxed)
            + self.cancelled_runs.load(Ordering::Relaxed)
    }
}

/// Releases a group's grants when dropped, including when the run is abandoned mid-group.
struct GrantGuard {
    ledger: Arc<ResourceLedger>,
    keys: Vec<GrantKey>,
}

impl Drop for GrantGuard {
    fn drop(&mut self) {
        for key in self.keys.drain(..) {
            self.ledger.release(key);
        }
    }
}

/// Aborts unit tasks still running when dropped and counts them as failed.
///
/// Dropped when a group finishes, and also when the run future is abandoned
/// by the run budget or a panic, so no unit outlives its run.
struct InFlight {
    health: Arc<HealthRegistry>,
    tasks: Vec<(UnitKind, AbortHandle)>,
}

impl InFlight {
    fn settle(&mut self, unit: UnitKind) {
        self.tasks.retain(|(task_unit, _)| *task_unit != unit);
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        for (unit, task) in self.tasks.drain(..) {
            if task.is_finished() {
                continue;
            }
            task.abort();
            warn!(unit = %unit, "Unit task aborted, its run ended first");
            self.health.record_failure(unit, "aborted when the run ended");
        }
    }
}

/// How the stage loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineEnd {
    Finished,
    Cancelled,
}

/// Per-run state shared by the stage loop and the degradation path.
struct RunContext {
    run_id: Uuid,
    run: Arc<Mutex<WorkflowRun>>,
    config: RunConfig,
    token: CancellationToken,
    document_text: Arc<str>,
    filename: Arc<str>,
    outcomes: Mutex<BTreeMap<UnitKind, UnitOutcome>>,
    total_units: usize,
    deadline: Instant,
}

impl RunContext {
    /// Time left before the run budget runs out.
    fn remaining_budget(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn percentage(&self) -> f64 {
        if self.total_units == 0 {
            return 100.0;
        }
        self.outcomes.lock().len() as f64 / self.total_units as f64 * 100.0
    }

    fn record_recovery(&self, action: RecoveryAction) {
        self.run.lock().record_recovery(action);
    }
}

struct OrchestratorInner {
    config: OrchestratorConfig,
    graph: DependencyGraph,
    agents: Arc<AgentRegistry>,
    health: Arc<HealthRegistry>,
    ledger: Arc<ResourceLedger>,
    executor: UnitExecutor,
    fallback: FallbackEngine,
    cache: ResultCache,
    runs: moka::sync::Cache<Uuid, Arc<Mutex<WorkflowRun>>>,
    active: Mutex<HashMap<Uuid, CancellationToken>>,
    progress: Arc<dyn ProgressSink>,
    counters: RunCounters,
}

struct MaintenanceHandle {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Builds a [`WorkflowOrchestrator`], validating configuration and probing agents.
///
/// # Examples
///
/// ```ignore
/// use contract_orchestrator::agent::impls::default_registry;
/// use contract_orchestrator::orchestrator::OrchestratorBuilder;
///
/// let orchestrator = OrchestratorBuilder::new()
///     .with_agents(default_registry(backend))
///     .build()
///     .await?;
/// orchestrator.start();
/// ```
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    specs: Vec<UnitSpec>,
    agents: AgentRegistry,
    progress: Arc<dyn ProgressSink>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    /// Starts from the default five-unit pipeline and default configuration.
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            specs: default_unit_specs(),
            agents: AgentRegistry::new(),
            progress: Arc::new(NoopProgressSink),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the unit declarations.
    pub fn with_unit_specs(mut self, specs: Vec<UnitSpec>) -> Self {
        self.specs = specs;
        self
    }

    /// Registers one agent under its unit, replacing any earlier one.
    pub fn with_agent(mut self, agent: SharedAgent) -> Self {
        self.agents.register(agent);
        self
    }

    /// Registers every agent of `registry`.
    pub fn with_agents(mut self, registry: AgentRegistry) -> Self {
        for (_, agent) in registry.iter() {
            self.agents.register(Arc::clone(agent));
        }
        self
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Validates the dependency graph, probes every agent and builds the orchestrator.
    ///
    /// Units without an agent, or whose probe fails, start offline. Fails if
    /// the graph is invalid or no unit is usable.
    pub async fn build(self) -> Result<WorkflowOrchestrator, OrchestratorError> {
        let graph = DependencyGraph::new(self.specs)?;
        info!(
            units = graph.node_count(),
            stages = graph.get_execution_order().len(),
            "Dependency graph validated"
        );

        let health = Arc::new(HealthRegistry::new(
            graph.units(),
            self.config.circuit_breaker.clone(),
        ));

        for (unit, _) in self.agents.iter() {
            if graph.spec(unit).is_none() {
                warn!(unit = %unit, "Agent registered for a unit that is not declared; ignoring");
            }
        }

        for unit in graph.units() {
            match self.agents.get(unit) {
                None => health.mark_offline(unit, "no agent registered"),
                Some(agent) => {
                    if let Err(e) = agent.health_probe().await {
                        health.mark_offline(unit, format!("startup health probe failed: {e}"));
                    }
                }
            }
        }

        if health.usable_units().is_empty() {
            return Err(OrchestratorError::NoHealthyUnits(
                "every unit is offline after startup probes".to_string(),
            ));
        }

        let agents = Arc::new(self.agents);
        let ledger = Arc::new(ResourceLedger::new(self.config.resource_limits));
        let fallback = FallbackEngine::new();
        let executor = UnitExecutor::new(Arc::clone(&agents), Arc::clone(&health), fallback);
        let cache = ResultCache::new(self.config.cache_capacity, self.config.cache_ttl);
        let runs = moka::sync::Cache::builder()
            .max_capacity(self.config.run_store_capacity)
            .time_to_live(self.config.run_retention)
            .build();

        Ok(WorkflowOrchestrator {
            inner: Arc::new(OrchestratorInner {
                config: self.config,
                graph,
                agents,
                health,
                ledger,
                executor,
                fallback,
                cache,
                runs,
                active: Mutex::new(HashMap::new()),
                progress: self.progress,
                counters: RunCounters::default(),
            }),
            maintenance: Mutex::new(None),
        })
    }
}

/// Drives contract-analysis runs through the unit pipeline.
///
/// Construct one per process with [`OrchestratorBuilder`] and share it by
/// reference or `Arc`. [`start`](Self::start) and [`stop`](Self::stop)
/// control the background maintenance loop; `run` works without it.
pub struct WorkflowOrchestrator {
    inner: Arc<OrchestratorInner>,
    maintenance: Mutex<Option<MaintenanceHandle>>,
}

impl WorkflowOrchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Runs the pipeline on a document with a caller-supplied config map.
    ///
    /// A malformed config falls back to defaults and is noted in the run's
    /// recovery actions.
    pub async fn run(
        &self,
        document_text: &str,
        filename: &str,
        config: &Map<String, JsonValue>,
    ) -> Arc<WorkflowResult> {
        match RunConfig::from_map(config) {
            Ok(run_config) => self.inner.execute(document_text, filename, run_config, None).await,
            Err(e) => {
                warn!(error = %e, "Invalid run config, using defaults");
                self.inner
                    .execute(document_text, filename, RunConfig::default(), Some(e.to_string()))
                    .await
            }
        }
    }

    /// Runs the pipeline with a typed config.
    pub async fn run_with_config(
        &self,
        document_text: &str,
        filename: &str,
        config: RunConfig,
    ) -> Arc<WorkflowResult> {
        self.inner.execute(document_text, filename, config, None).await
    }

    /// Snapshot of a run, while it is retained.
    pub fn get_run_status(&self, run_id: Uuid) -> Option<WorkflowRun> {
        self.inner.runs.get(&run_id).map(|run| run.lock().clone())
    }

    /// Requests cooperative cancellation of an active run.
    ///
    /// Units already in flight finish; no further group is started. Returns
    /// false if the run is unknown or already finished.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        let token = self.inner.active.lock().get(&run_id).cloned();
        match token {
            Some(token) => {
                info!(run_id = %run_id, "Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Ids of runs currently executing.
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.inner.active.lock().keys().copied().collect()
    }

    /// Per-unit health: status, success rate, latency and breaker state.
    pub fn get_health_status(&self) -> BTreeMap<UnitKind, UnitHealthSnapshot> {
        self.inner.health.snapshot()
    }

    pub fn get_performance_statistics(&self) -> PerformanceStatistics {
        let counters = &self.inner.counters;
        let finished = counters.finished_runs();
        let average_run_duration_ms = if finished > 0 {
            counters.total_duration_ms.load(Ordering::Relaxed) as f64 / finished as f64
        } else {
            0.0
        };

        PerformanceStatistics {
            total_runs: counters.total_runs.load(Ordering::Relaxed),
            completed_runs: counters.completed_runs.load(Ordering::Relaxed),
            degraded_runs: counters.degraded_runs.load(Ordering::Relaxed),
            failed_runs: counters.failed_runs.load(Ordering::Relaxed),
            cancelled_runs: counters.cancelled_runs.load(Ordering::Relaxed),
            active_runs: self.inner.active.lock().len(),
            unit_executions: counters.unit_executions.load(Ordering::Relaxed),
            fallbacks_used: counters.fallbacks_used.load(Ordering::Relaxed),
            resource_wait_timeouts: counters.resource_wait_timeouts.load(Ordering::Relaxed),
            average_run_duration_ms,
            cache: self.inner.cache.stats(),
            resource_utilization: self.inner.ledger.utilization(),
            health: self.inner.health.snapshot(),
        }
    }

    /// Administrative reset of a unit's breaker and status.
    pub fn force_recover(&self, unit: UnitKind) -> bool {
        self.inner.health.force_recover(unit)
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.inner.graph
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.inner.health
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.inner.ledger
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Starts the background maintenance loop. Returns false if already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> bool {
        let mut maintenance = self.maintenance.lock();
        if maintenance.is_some() {
            return false;
        }

        let token = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let loop_token = token.clone();
        let period = inner.config.maintenance_interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = loop_token.cancelled() => break,
                        _ = interval.tick() => inner.run_maintenance().await,
                    }
                }
                debug!("Maintenance loop stopped");
            }
            .instrument(info_span!("orchestrator_maintenance")),
        );

        info!(interval = ?period, "Maintenance loop started");
        *maintenance = Some(MaintenanceHandle { token, handle });
        true
    }

    /// Stops the maintenance loop and waits for it to exit. Returns false if it was not running.
    pub async fn stop(&self) -> bool {
        let running = self.maintenance.lock().take();
        match running {
            Some(MaintenanceHandle { token, handle }) => {
                token.cancel();
                if let Err(e) = handle.await {
                    warn!(error = %e, "Maintenance loop ended abnormally");
                }
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.maintenance.lock().is_some()
    }

    /// Runs one maintenance pass immediately.
    pub async fn run_maintenance(&self) {
        self.inner.run_maintenance().await;
    }
}

impl Drop for WorkflowOrchestrator {
    fn drop(&mut self) {
        if let Some(MaintenanceHandle { token, handle }) = self.maintenance.get_mut().take() {
            token.cancel();
            handle.abort();
        }
    }
}

impl OrchestratorInner {
    async fn execute(
        &self,
        document_text: &str,
        filename: &str,
        config: RunConfig,
        config_error: Option<String>,
    ) -> Arc<WorkflowResult> {
        let cache_key = config
            .use_cache
            .then(|| ResultCache::key(document_text, &config));
        if let Some(key) = &cache_key
            && let Some(cached) = self.cache.get(key)
        {
            info!(run_id = %cached.run_id, "Returning cached workflow result");
            return cached;
        }

        let run_id = Uuid::new_v4();
        self.counters.total_runs.fetch_add(1, Ordering::Relaxed);

        let mut run = WorkflowRun::new(run_id, filename, config.execution_mode);
        if let Some(e) = config_error {
            run.record_recovery(RecoveryAction::new(
                RecoveryKind::ConfigDefaults,
                None,
                format!("invalid run config, defaults used: {e}"),
            ));
        }
        let run = Arc::new(Mutex::new(run));
        self.runs.insert(run_id, Arc::clone(&run));

        let token = CancellationToken::new();
        self.active.lock().insert(run_id, token.clone());

        let deadline = Instant::now() + config.max_execution_time();
        let ctx = RunContext {
            run_id,
            run,
            config,
            token,
            document_text: Arc::from(document_text),
            filename: Arc::from(filename),
            outcomes: Mutex::new(BTreeMap::new()),
            total_units: self.graph.node_count(),
            deadline,
        };

        let span = info_span!("workflow_run", run_id = %run_id, filename = %filename);
        let result = self.execute_run(&ctx).instrument(span).await;

        self.active.lock().remove(&run_id);
        // Grants of members abandoned by a run timeout.
        for unit in self.graph.units() {
            self.ledger.release(GrantKey::new(run_id, unit));
        }
        self.counters
            .record_finished(result.status, result.execution_time_ms);

        if let Some(key) = cache_key
            && result.status == RunStatus::Completed
        {
            self.cache.insert(key, Arc::clone(&result));
        }

        self.emit(
            &ctx,
            ProgressEvent::new(
                run_id,
                ProgressKind::WorkflowFinished,
                100.0,
                format!("workflow {}", result.status),
            ),
        );
        result
    }

    async fn execute_run(&self, ctx: &RunContext) -> Arc<WorkflowResult> {
        self.health
            .update_breaker_config(ctx.config.breaker_config(&self.config.circuit_breaker));

        let budget = ctx.config.max_execution_time();
        let pipeline = AssertUnwindSafe(self.execute_pipeline(ctx)).catch_unwind();

        let failure = match tokio::time::timeout(budget, pipeline).await {
            Ok(Ok(Ok(end))) => {
                let result = {
                    let mut run = ctx.run.lock();
                    let status = match end {
                        PipelineEnd::Cancelled => RunStatus::Cancelled,
                        PipelineEnd::Finished => {
                            let units: Vec<UnitKind> =
                                run.execution_stages.iter().flatten().copied().collect();
                            overall_status(&units, &ctx.outcomes.lock())
                        }
                    };
                    run.set_resource_utilization(self.ledger.utilization());
                    run.finish(status);
                    compile_results(&run, &ctx.outcomes.lock())
                };
                info!(
                    status = %result.status,
                    quality_score = result.quality_score,
                    fallback_used = result.fallback_used,
                    "Workflow finished"
                );
                return Arc::new(result);
            }
            Ok(Ok(Err(e))) => e,
            Ok(Err(panic)) => OrchestratorError::ExecutionFailed(format!(
                "pipeline panicked: {}",
                panic_message(&panic)
            )),
            Err(_) => OrchestratorError::RunTimeout(budget),
        };

        error!(error = %failure, "Workflow failed, attempting graceful degradation");
        Arc::new(self.degrade(ctx, &failure))
    }

    async fn execute_pipeline(&self, ctx: &RunContext) -> Result<PipelineEnd, OrchestratorError> {
        let stages = self.graph.get_execution_order().to_vec();
        let strategy = self.select_strategy(ctx.config.execution_mode);
        ctx.run.lock().start(strategy, stages.clone());

        info!(strategy = ?strategy, stages = stages.len(), "Workflow started");
        self.emit(
            ctx,
            ProgressEvent::new(
                ctx.run_id,
                ProgressKind::WorkflowStarted,
                0.0,
                format!("{strategy:?}"),
            ),
        );

        for (stage_index, stage) in stages.iter().enumerate() {
            let stage_span = info_span!("stage", stage = stage_index, units = stage.len());
            let end = self
                .execute_stage(ctx, stage_index, stage, strategy)
                .instrument(stage_span)
                .await?;

            if end == PipelineEnd::Cancelled {
                self.fill_cancelled(ctx, &stages[stage_index..])?;
                return Ok(PipelineEnd::Cancelled);
            }
        }

        Ok(PipelineEnd::Finished)
    }

    async fn execute_stage(
        &self,
        ctx: &RunContext,
        stage_index: usize,
        stage: &[UnitKind],
        strategy: ExecutionStrategy,
    ) -> Result<PipelineEnd, OrchestratorError> {
        self.emit(
            ctx,
            ProgressEvent::new(
                ctx.run_id,
                ProgressKind::StageStarted,
                ctx.percentage(),
                format!("stage {stage_index}"),
            )
            .with_stage(stage_index),
        );

        let groups = self.plan_stage(stage, strategy);
        debug!(groups = ?groups, "Stage planned");

        for group in groups {
            if ctx.token.is_cancelled() {
                return Ok(PipelineEnd::Cancelled);
            }

            // Open or offline units fall back directly; the rest are invoked
            // whatever their status, so a recovered breaker gets its trial call.
            let (to_execute, skipped): (Vec<UnitKind>, Vec<UnitKind>) =
                if strategy == ExecutionStrategy::FallbackFirst {
                    group
                        .iter()
                        .copied()
                        .partition(|unit| self.health.is_available(*unit))
                } else {
                    (group.clone(), Vec::new())
                };

            for unit in skipped {
                let input = self.prepare_input(ctx, unit)?;
                let outcome = self.executor.fallback_outcome(
                    unit,
                    &input,
                    UnitStatus::Degraded,
                    "unit not available, fallback used first",
                );
                self.record_outcome(ctx, stage_index, outcome);
            }

            if !to_execute.is_empty() {
                self.execute_group(ctx, stage_index, &to_execute).await?;
            }
        }

        if ctx.token.is_cancelled() {
            let outcomes = ctx.outcomes.lock();
            if stage.iter().any(|unit| !outcomes.contains_key(unit)) {
                return Ok(PipelineEnd::Cancelled);
            }
        }
        Ok(PipelineEnd::Finished)
    }

    fn select_strategy(&self, mode: ExecutionMode) -> ExecutionStrategy {
        match mode {
            ExecutionMode::Sequential => ExecutionStrategy::Sequential,
            ExecutionMode::Parallel => ExecutionStrategy::FullParallel,
            ExecutionMode::Adaptive => {
                let healthy = self.health.healthy_units().len();
                let strategy = match healthy {
                    h if h >= 4 => ExecutionStrategy::FullParallel,
                    2 | 3 => ExecutionStrategy::Selective,
                    _ => ExecutionStrategy::FallbackFirst,
                };
                debug!(healthy, strategy = ?strategy, "Adaptive strategy selected");
                strategy
            }
        }
    }

    fn requirements(&self, unit: UnitKind) -> ResourceRequirements {
        self.graph
            .spec(unit)
            .map(|spec| spec.requirements)
            .unwrap_or_default()
    }

    fn parallel_groups(&self, units: &[UnitKind]) -> Vec<Vec<UnitKind>> {
        let max_parallel = self.config.resource_limits.max_concurrent_agents;
        self.graph
            .get_parallel_groups_with(units, max_parallel, |group, candidate| {
                let requirements: Vec<ResourceRequirements> = group
                    .iter()
                    .chain(std::iter::once(&candidate))
                    .map(|unit| self.requirements(*unit))
                    .collect();
                self.ledger.fits_within_limits(&requirements)
            })
    }

    fn plan_stage(&self, stage: &[UnitKind], strategy: ExecutionStrategy) -> Vec<Vec<UnitKind>> {
        match strategy {
            ExecutionStrategy::FullParallel => self.parallel_groups(stage),
            ExecutionStrategy::Selective => {
                let (healthy, rest): (Vec<UnitKind>, Vec<UnitKind>) = stage
                    .iter()
                    .copied()
                    .partition(|unit| self.health.status(*unit) == Some(HealthStatus::Healthy));
                let mut groups = self.parallel_groups(&healthy);
                groups.extend(rest.into_iter().map(|unit| vec![unit]));
                groups
            }
            ExecutionStrategy::Sequential | ExecutionStrategy::FallbackFirst => {
                stage.iter().map(|unit| vec![*unit]).collect()
            }
        }
    }

    /// Builds a unit's input from the outputs of the units it depends on.
    fn prepare_input(
        &self,
        ctx: &RunContext,
        unit: UnitKind,
    ) -> Result<UnitInput, OrchestratorError> {
        let dependencies = self.graph.get_dependencies(unit);
        let mut input = if dependencies.is_empty() || unit == UnitKind::Analyzer {
            UnitInput::document(ctx.document_text.as_ref(), ctx.filename.as_ref())
        } else {
            UnitInput::new()
        };

        let outcomes = ctx.outcomes.lock();
        for dependency in dependencies {
            let outcome = outcomes.get(&dependency).ok_or_else(|| {
                OrchestratorError::ExecutionFailed(format!(
                    "output of {dependency} missing before {unit} started"
                ))
            })?;
            input = input.with(dependency.output_key(), outcome.output.to_value());
        }
        Ok(input)
    }

    /// Waits until the whole group fits the budget, up to the configured bound.
    ///
    /// The bound is capped so the group deadline still fits in the remaining
    /// run budget. Returns false when the wait ran out or the run was
    /// cancelled; the caller then proceeds best effort.
    async fn wait_for_resources(
        &self,
        ctx: &RunContext,
        requirements: &[ResourceRequirements],
    ) -> bool {
        if !self.ledger.fits_within_limits(requirements) {
            warn!("Group exceeds the resource limits even when idle, proceeding best effort");
            ctx.record_recovery(RecoveryAction::new(
                RecoveryKind::ResourceWaitTimeout,
                None,
                "group exceeds resource limits, proceeding best effort",
            ));
            return false;
        }

        let started = Instant::now();
        let group_deadline = ctx.config.unit_timeout() * 2;
        let max_wait = self
            .config
            .max_resource_wait
            .min(ctx.remaining_budget().saturating_sub(group_deadline));
        loop {
            let expired = self.ledger.cleanup_expired(self.config.max_grant_age);
            if !expired.is_empty() {
                warn!(count = expired.len(), "Released expired resource grants");
            }
            if self.ledger.can_allocate_all(requirements) {
                return true;
            }

            let waited = started.elapsed();
            if waited >= max_wait {
                warn!(waited = ?waited, "Resource wait timed out, proceeding best effort");
                self.counters
                    .resource_wait_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                ctx.record_recovery(RecoveryAction::new(
                    RecoveryKind::ResourceWaitTimeout,
                    None,
                    format!("resources unavailable after {waited:?}, proceeding best effort"),
                ));
                return false;
            }

            let pause = self.config.resource_poll_interval.min(max_wait - waited);
            tokio::select! {
                _ = ctx.token.cancelled() => return false,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn execute_group(
        &self,
        ctx: &RunContext,
        stage_index: usize,
        group: &[UnitKind],
    ) -> Result<(), OrchestratorError> {
        let inputs: Vec<(UnitKind, UnitInput)> = group
            .iter()
            .map(|unit| self.prepare_input(ctx, *unit).map(|input| (*unit, input)))
            .collect::<Result<_, _>>()?;

        let requirements: Vec<ResourceRequirements> =
            group.iter().map(|unit| self.requirements(*unit)).collect();
        self.wait_for_resources(ctx, &requirements).await;
        if ctx.token.is_cancelled() {
            return Ok(());
        }

        let mut grants = GrantGuard {
            ledger: Arc::clone(&self.ledger),
            keys: Vec::with_capacity(group.len()),
        };
        for (unit, requirement) in group.iter().zip(&requirements) {
            let key = GrantKey::new(ctx.run_id, *unit);
            if self.ledger.allocate(key, *requirement) {
                grants.keys.push(key);
            } else {
                debug!(unit = %unit, "Running without a resource grant");
            }
        }
        ctx.run.lock().set_resource_utilization(self.ledger.utilization());

        let options = ExecutionOptions {
            timeout: ctx.config.unit_timeout(),
            max_retries: ctx.config.effective_retries(),
        };
        let deadline = tokio::time::Instant::now() + options.timeout * 2;

        let mut in_flight = InFlight {
            health: Arc::clone(&self.health),
            tasks: Vec::with_capacity(inputs.len()),
        };
        let mut tasks = Vec::with_capacity(inputs.len());
        for (unit, input) in inputs {
            ctx.run.lock().unit_started(unit);
            self.emit(
                ctx,
                ProgressEvent::new(
                    ctx.run_id,
                    ProgressKind::UnitStarted,
                    ctx.percentage(),
                    format!("{unit} started"),
                )
                .with_unit(unit)
                .with_stage(stage_index),
            );
            self.counters.unit_executions.fetch_add(1, Ordering::Relaxed);

            let executor = self.executor.clone();
            let task_input = input.clone();
            let unit_span = info_span!("unit", unit = %unit);
            let handle = tokio::spawn(
                async move { executor.execute(unit, task_input, options).await }
                    .instrument(unit_span),
            );
            in_flight.tasks.push((unit, handle.abort_handle()));
            tasks.push((unit, input, handle));
        }

        for (unit, input, mut handle) in tasks {
            let outcome = match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(join_error)) => {
                    let reason = format!("unit task failed: {join_error}");
                    self.health.record_failure(unit, &reason);
                    self.executor
                        .fallback_outcome(unit, &input, UnitStatus::Failed, reason)
                }
                Err(_) => {
                    handle.abort();
                    warn!(
                        unit = %unit,
                        "Unit still running at the group deadline, counted as failed"
                    );
                    let reason = format!("group deadline of {:?} exceeded", options.timeout * 2);
                    self.health.record_failure(unit, &reason);
                    ctx.record_recovery(RecoveryAction::new(
                        RecoveryKind::GroupTimeout,
                        Some(unit),
                        reason.clone(),
                    ));
                    self.executor
                        .fallback_outcome(unit, &input, UnitStatus::Failed, reason)
                }
            };
            in_flight.settle(unit);
            self.record_outcome(ctx, stage_index, outcome);
        }

        drop(in_flight);
        drop(grants);
        Ok(())
    }

    fn record_outcome(&self, ctx: &RunContext, stage_index: usize, outcome: UnitOutcome) {
        let unit = outcome.unit;
        let status = outcome.status;

        {
            let mut run = ctx.run.lock();
            run.unit_finished(unit, status);
            if outcome.used_fallback() {
                let reason = outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "fallback output used".to_string());
                run.record_recovery(RecoveryAction::unit_fallback(unit, reason));
            }
        }
        if outcome.used_fallback() {
            self.counters.fallbacks_used.fetch_add(1, Ordering::Relaxed);
        }

        let (kind, verb) = match status {
            UnitStatus::Completed => (ProgressKind::UnitCompleted, "completed"),
            UnitStatus::Degraded => (ProgressKind::UnitDegraded, "degraded"),
            UnitStatus::Failed => (ProgressKind::UnitFailed, "failed"),
        };
        info!(
            unit = %unit,
            status = verb,
            fallback_used = outcome.used_fallback(),
            "Unit finished"
        );

        ctx.outcomes.lock().insert(unit, outcome);
        self.emit(
            ctx,
            ProgressEvent::new(ctx.run_id, kind, ctx.percentage(), format!("{unit} {verb}"))
                .with_unit(unit)
                .with_stage(stage_index),
        );
    }

    /// Fills every unit that has not run with fallback output after cancellation.
    fn fill_cancelled(
        &self,
        ctx: &RunContext,
        remaining: &[Vec<UnitKind>],
    ) -> Result<(), OrchestratorError> {
        let stage_offset = ctx.run.lock().execution_stages.len() - remaining.len();
        let mut filled = Vec::new();

        for (offset, stage) in remaining.iter().enumerate() {
            for unit in stage {
                if ctx.outcomes.lock().contains_key(unit) {
                    continue;
                }
                let input = self.prepare_input(ctx, *unit)?;
                let outcome = self.executor.fallback_outcome(
                    *unit,
                    &input,
                    UnitStatus::Degraded,
                    "run cancelled before unit started",
                );
                self.record_outcome(ctx, stage_offset + offset, outcome);
                filled.push(unit.as_str());
            }
        }

        info!(filled = ?filled, "Run cancelled");
        ctx.record_recovery(RecoveryAction::new(
            RecoveryKind::Cancellation,
            None,
            format!("cancelled; fallback output for: {}", filled.join(", ")),
        ));
        Ok(())
    }

    /// Minimal two-step fallback pipeline (analysis, then risk) after an
    /// orchestration-level failure.
    fn degrade(&self, ctx: &RunContext, failure: &OrchestratorError) -> WorkflowResult {
        let reason = failure.to_string();
        let attempt = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let document = UnitInput::document(ctx.document_text.as_ref(), ctx.filename.as_ref());
            let analysis = self.fallback.fallback(UnitKind::Analyzer, &document);
            let risk_input =
                UnitInput::new().with(UnitKind::Analyzer.output_key(), analysis.to_value());
            let risk = self.fallback.fallback(UnitKind::RiskAssessor, &risk_input);
            (analysis, risk)
        }));

        let mut run = ctx.run.lock();
        match attempt {
            Ok((analysis, risk)) => {
                let mut outcomes = ctx.outcomes.lock();
                let minimal = [(UnitKind::Analyzer, analysis), (UnitKind::RiskAssessor, risk)];
                for (unit, output) in minimal {
                    if outcomes.get(&unit).is_none_or(|o| !o.output.success) {
                        outcomes.insert(
                            unit,
                            UnitOutcome::new(unit, UnitStatus::Degraded, output)
                                .with_error("graceful degradation"),
                        );
                        run.unit_finished(unit, UnitStatus::Degraded);
                    }
                }
                for unit in run.running_units.clone() {
                    run.unit_finished(unit, UnitStatus::Failed);
                }
                run.record_recovery(RecoveryAction::new(
                    RecoveryKind::GracefulDegradation,
                    None,
                    format!("minimal fallback pipeline after: {reason}"),
                ));
                run.set_resource_utilization(self.ledger.utilization());
                run.finish(RunStatus::Degraded);

                let mut result = compile_results(&run, &outcomes);
                result.error = Some(reason);
                warn!(quality_score = result.quality_score, "Workflow degraded");
                result
            }
            Err(panic) => {
                let message = format!(
                    "{reason}; graceful degradation failed: {}",
                    panic_message(&panic)
                );
                error!(error = %message, "Workflow failed");
                run.finish(RunStatus::Failed);
                WorkflowResult::failure(&run, message)
            }
        }
    }

    async fn run_maintenance(&self) {
        for unit in self.health.recovering_units() {
            let Some(agent) = self.agents.get(unit).cloned() else {
                continue;
            };
            let probe = AssertUnwindSafe(agent.health_probe()).catch_unwind();
            let result = match tokio::time::timeout(Duration::from_secs(10), probe).await {
                Ok(Ok(Ok(()))) => Ok(()),
                Ok(Ok(Err(e))) => Err(e.to_string()),
                Ok(Err(_)) => Err("health probe panicked".to_string()),
                Err(_) => Err("health probe timed out".to_string()),
            };
            self.health.record_probe(unit, result);
        }

        let expired = self.ledger.cleanup_expired(self.config.max_grant_age);
        if !expired.is_empty() {
            warn!(count = expired.len(), "Maintenance released expired resource grants");
        }
        self.cache.run_pending_tasks();
        self.runs.run_pending_tasks();
        debug!(retained_runs = self.runs.entry_count(), "Maintenance pass finished");
    }

    fn emit(&self, ctx: &RunContext, event: ProgressEvent) {
        self.progress.notify(ctx.run_id, event);
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentError, UnitOutput};
    use async_trait::async_trait;

    struct EchoAgent(UnitKind);

    #[async_trait]
    impl Agent for EchoAgent {
        fn unit(&self) -> UnitKind {
            self.0
        }

        fn expertise(&self) -> &str {
            "echo"
        }

        async fn execute(&self, _input: UnitInput) -> Result<UnitOutput, AgentError> {
            Ok(UnitOutput::success())
        }
    }

    fn registry() -> AgentRegistry {
        UnitKind::ALL
            .into_iter()
            .fold(AgentRegistry::new(), |registry, unit| {
                registry.with(Arc::new(EchoAgent(unit)))
            })
    }

    #[tokio::test]
    async fn test_build_rejects_empty_registry() {
        let result = OrchestratorBuilder::new().build().await;
        assert!(matches!(result, Err(OrchestratorError::NoHealthyUnits(_))));
    }

    #[tokio::test]
    async fn test_build_marks_missing_agents_offline() {
        let orchestrator = OrchestratorBuilder::new()
            .with_agent(Arc::new(EchoAgent(UnitKind::Analyzer)))
            .build()
            .await
            .unwrap();

        let health = orchestrator.get_health_status();
        assert_eq!(health[&UnitKind::Analyzer].status, HealthStatus::Healthy);
        assert_eq!(health[&UnitKind::Negotiator].status, HealthStatus::Offline);
    }

    #[tokio::test]
    async fn test_adaptive_strategy_thresholds() {
        let orchestrator = OrchestratorBuilder::new()
            .with_agents(registry())
            .build()
            .await
            .unwrap();
        let inner = &orchestrator.inner;
        assert_eq!(
            inner.select_strategy(ExecutionMode::Adaptive),
            ExecutionStrategy::FullParallel
        );

        for unit in [UnitKind::Analyzer, UnitKind::RiskAssessor] {
            inner.health.record_failure(unit, "x");
        }
        assert_eq!(
            inner.select_strategy(ExecutionMode::Adaptive),
            ExecutionStrategy::Selective
        );

        for unit in [UnitKind::PrecedentResearcher, UnitKind::Negotiator] {
            inner.health.record_failure(unit, "x");
        }
        assert_eq!(
            inner.select_strategy(ExecutionMode::Adaptive),
            ExecutionStrategy::FallbackFirst
        );
        assert_eq!(
            inner.select_strategy(ExecutionMode::Parallel),
            ExecutionStrategy::FullParallel
        );
    }

    #[tokio::test]
    async fn test_selective_plan_runs_unhealthy_units_alone() {
        let orchestrator = OrchestratorBuilder::new()
            .with_agents(registry())
            .build()
            .await
            .unwrap();
        let inner = &orchestrator.inner;
        inner.health.record_failure(UnitKind::PrecedentResearcher, "x");

        let plan = inner.plan_stage(
            &[UnitKind::RiskAssessor, UnitKind::PrecedentResearcher],
            ExecutionStrategy::Selective,
        );
        assert_eq!(
            plan,
            vec![vec![UnitKind::RiskAssessor], vec![UnitKind::PrecedentResearcher]]
        );

        let plan = inner.plan_stage(
            &[UnitKind::RiskAssessor, UnitKind::PrecedentResearcher],
            ExecutionStrategy::FullParallel,
        );
        assert_eq!(
            plan,
            vec![vec![UnitKind::RiskAssessor, UnitKind::PrecedentResearcher]]
        );
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let orchestrator = OrchestratorBuilder::new()
            .with_config(
                OrchestratorConfig::new().with_maintenance_interval(Duration::from_millis(10)),
            )
            .with_agents(registry())
            .build()
            .await
            .unwrap();

        assert!(orchestrator.start());
        assert!(!orchestrator.start());
        assert!(orchestrator.is_running());
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(orchestrator.stop().await);
        assert!(!orchestrator.stop().await);
        assert!(!orchestrator.is_running());
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&payload), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&payload), "unknown panic");
    }
}
