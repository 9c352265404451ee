//! Level-by-level dispatch of a chain plan.
//!
//! At level k every chain contributes one unit per service introduced at
//! that level. Units are deduplicated by `dataId`, then each goes through
//! cache check, claim, `put_data`, submit and poll with at most `fan_out`
//! in flight. The level is drained completely before level k+1 starts.
//!
//! A failed unit stops new submissions; units already submitted run until
//! they finish or hit their own poll timeout. Cancelling the request also
//! cancels handles that are still running.

use crate::backend::{BackendError, ExecutionBackend, ExecutionHandle, ExecutionState};
use crate::config::DispatchConfig;
use crate::monitor::DispatchMetrics;
use ensemble_core::{Chain, CoreError, CoreResult, DataDescription, RunId};
use ensemble_plan::{ChainPlan, ServiceGraph};
use ensemble_storage::{
    build_data_description_at, ClaimOutcome, LocatorConfig, RecordState, Registry, RegistryError, RegistryResult,
};
use futures::stream::{self, StreamExt};
use indexmap::{IndexMap, IndexSet};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Dispatch errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// A unit ended `Failed`; nothing past its level was submitted
    #[error("{service} failed at level {level} ({data_id}): {reason}")]
    ChainFailed {
        /// Failed `dataId`
        data_id: String,
        /// Service of the failed unit
        service: String,
        /// Level the unit belongs to
        level: usize,
        /// Backend or registry failure
        reason: String,
    },

    /// The caller cancelled the request
    #[error("Request cancelled at level {level}")]
    Cancelled {
        /// Level in progress when cancellation was observed
        level: usize,
    },

    /// The request failed validation
    #[error("Invalid request: {}", join_errors(.0))]
    InvalidRequest(Vec<CoreError>),

    /// Graph or planning error
    #[error(transparent)]
    Planning(#[from] CoreError),

    /// Registry error outside a unit's dispatch
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

fn join_errors(errors: &[CoreError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Per-level counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LevelReport {
    /// Level index
    pub level: usize,
    /// Services introduced at this level
    pub services: Vec<String>,
    /// Chains through this level
    pub chains: usize,
    /// Distinct units dispatched
    pub units: usize,
    /// Units resolved from the registry
    pub cached: usize,
    /// Units submitted to the backend
    pub submitted: usize,
    /// Units dropped because another chain shares their `dataId`
    pub deduplicated: usize,
    /// Units whose claim was held elsewhere and which waited on it
    pub waited: usize,
}

/// Result of a successful dispatch
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    /// Identifier of this dispatch, used in logs
    pub run_id: RunId,
    /// Target service
    pub target: String,
    /// Per-level counts, in level order
    pub levels: Vec<LevelReport>,
    /// Chains ending at the target
    pub final_chains: Vec<Chain>,
    /// Descriptions of the target's outputs
    pub outputs: Vec<DataDescription>,
}

impl DispatchReport {
    /// Units submitted across all levels
    #[must_use]
    pub fn total_submitted(&self) -> usize {
        self.levels.iter().map(|l| l.submitted).sum()
    }

    /// Units resolved from cache across all levels
    #[must_use]
    pub fn total_cached(&self) -> usize {
        self.levels.iter().map(|l| l.cached).sum()
    }
}

/// Distinct data descriptions for one level
#[derive(Debug, Clone)]
pub struct LevelUnits {
    /// One description per `dataId`, first occurrence order
    pub descriptions: Vec<DataDescription>,
    /// Units dropped as duplicates
    pub duplicates: usize,
}

/// Describe every unit introduced at `level`
///
/// # Errors
///
/// Returns error if a service at the level is not in `graph`
pub fn level_units(
    graph: &ServiceGraph,
    plan: &ChainPlan,
    level: usize,
    locator: &LocatorConfig,
) -> CoreResult<LevelUnits> {
    let mut upstream: HashMap<&str, IndexSet<String>> = HashMap::new();
    for service in plan.levels().services_at(level) {
        let mut ancestors = graph.ancestors_inclusive(service)?;
        ancestors.shift_remove(service);
        upstream.insert(service.as_str(), ancestors);
    }

    let mut unique: IndexMap<String, DataDescription> = IndexMap::new();
    let mut total = 0;
    for chain in plan.chains_at(level) {
        for (position, unit) in chain.units().iter().enumerate() {
            let Some(ancestors) = upstream.get(unit.service.as_str()) else {
                continue;
            };
            total += 1;
            let description = build_data_description_at(chain, position, locator, |s| ancestors.contains(s))?;
            unique.entry(description.data_id.clone()).or_insert(description);
        }
    }

    Ok(LevelUnits {
        duplicates: total - unique.len(),
        descriptions: unique.into_values().collect(),
    })
}

enum UnitOutcome {
    Cached,
    Submitted,
    Waited,
    Skipped,
    Cancelled,
}

struct UnitFailure {
    data_id: String,
    service: String,
    reason: String,
}

enum Terminal {
    Completed,
    Failed(String),
    Cancelled,
}

/// Walks a chain plan level by level against a registry and a backend
pub struct DispatchCoordinator {
    registry: Arc<dyn Registry>,
    backend: Arc<dyn ExecutionBackend>,
    config: DispatchConfig,
    locator: LocatorConfig,
    metrics: Arc<DispatchMetrics>,
}

impl DispatchCoordinator {
    /// Create a coordinator
    #[must_use]
    pub fn new(registry: Arc<dyn Registry>, backend: Arc<dyn ExecutionBackend>, config: DispatchConfig) -> Self {
        let locator = config.locator();
        Self {
            registry,
            backend,
            config,
            locator,
            metrics: Arc::new(DispatchMetrics::new()),
        }
    }

    /// Share an existing metrics sink
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<DispatchMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Metrics sink
    #[must_use]
    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    /// Dispatch every level of `plan`
    ///
    /// # Errors
    ///
    /// - `ChainFailed` for the first unit that failed
    /// - `Cancelled` if `cancel` fired
    /// - `Planning` if the plan does not match `graph`
    pub async fn dispatch(
        &self,
        graph: &ServiceGraph,
        plan: &ChainPlan,
        force_rerun: bool,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, DispatchError> {
        let run_id = RunId::new();
        self.metrics.record_request();
        tracing::info!(%run_id, target = plan.target(), levels = plan.level_count(), force_rerun, "dispatch started");

        let mut levels = Vec::with_capacity(plan.level_count());
        let mut outputs = Vec::new();

        for level in 0..plan.level_count() {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled { level });
            }

            let units = level_units(graph, plan, level, &self.locator)?;
            let services = plan.levels().services_at(level).to_vec();
            tracing::info!(%run_id, level, ?services, units = units.descriptions.len(), "level started");
            self.metrics.record_deduplicated(units.duplicates as u64);

            let mut report = LevelReport {
                level,
                services,
                chains: plan.chains_at(level).len(),
                units: units.descriptions.len(),
                deduplicated: units.duplicates,
                ..LevelReport::default()
            };

            // Stops new submissions on failure; cancelling the request fires it too
            let halt = cancel.child_token();
            let mut failure: Option<UnitFailure> = None;
            let mut in_flight = stream::iter(&units.descriptions)
                .map(|d| self.dispatch_unit(d, level, force_rerun, cancel, &halt))
                .buffer_unordered(self.config.fan_out.max(1));

            while let Some(outcome) = in_flight.next().await {
                match outcome {
                    Ok(UnitOutcome::Cached) => report.cached += 1,
                    Ok(UnitOutcome::Submitted) => report.submitted += 1,
                    Ok(UnitOutcome::Waited) => report.waited += 1,
                    Ok(UnitOutcome::Skipped | UnitOutcome::Cancelled) => {}
                    Err(f) => {
                        tracing::error!(%run_id, data_id = %f.data_id, service = %f.service, level, reason = %f.reason, "unit failed");
                        if failure.is_none() {
                            halt.cancel();
                            failure = Some(f);
                        }
                    }
                }
            }
            drop(in_flight);

            if let Some(f) = failure {
                return Err(DispatchError::ChainFailed {
                    data_id: f.data_id,
                    service: f.service,
                    level,
                    reason: f.reason,
                });
            }
            if cancel.is_cancelled() {
                tracing::warn!(%run_id, level, "dispatch cancelled");
                return Err(DispatchError::Cancelled { level });
            }

            tracing::info!(
                %run_id,
                level,
                cached = report.cached,
                submitted = report.submitted,
                waited = report.waited,
                "level complete"
            );
            levels.push(report);
            outputs = units.descriptions;
        }

        Ok(DispatchReport {
            run_id,
            target: plan.target().to_string(),
            levels,
            final_chains: plan.final_chains().to_vec(),
            outputs,
        })
    }

    async fn dispatch_unit(
        &self,
        description: &DataDescription,
        level: usize,
        force_rerun: bool,
        cancel: &CancellationToken,
        halt: &CancellationToken,
    ) -> Result<UnitOutcome, UnitFailure> {
        if halt.is_cancelled() {
            return Ok(UnitOutcome::Skipped);
        }

        let data_id = description.data_id.as_str();
        let fail = |reason: String| {
            self.metrics.record_failed();
            UnitFailure {
                data_id: description.data_id.clone(),
                service: description.service.clone(),
                reason,
            }
        };

        if !force_rerun {
            let record = self
                .registry_call("get_data", || self.registry.get_data(data_id))
                .await
                .map_err(|e| fail(e.to_string()))?;
            if record.is_some_and(|r| r.is_completed()) {
                tracing::debug!(data_id, service = %description.service, level, "cache hit");
                self.metrics.record_cached();
                return Ok(UnitOutcome::Cached);
            }
        }

        let claim = self
            .registry_call("claim", || self.registry.claim(data_id))
            .await
            .map_err(|e| fail(e.to_string()))?;
        if claim == ClaimOutcome::Lost {
            tracing::debug!(data_id, level, "claim held elsewhere, waiting");
            self.metrics.record_waited();
            return self.wait_for_claim(description, cancel).await.map_err(fail);
        }

        // A previous claimant may have completed and released since the cache check
        if !force_rerun {
            match self.registry_call("get_data", || self.registry.get_data(data_id)).await {
                Ok(Some(record)) if record.is_completed() => {
                    self.release_claim(data_id).await;
                    tracing::debug!(data_id, service = %description.service, level, "completed while claiming");
                    self.metrics.record_cached();
                    return Ok(UnitOutcome::Cached);
                }
                Ok(_) => {}
                Err(e) => {
                    self.release_claim(data_id).await;
                    return Err(fail(e.to_string()));
                }
            }
        }

        let result = self.run_claimed(description, level, cancel, halt).await;
        self.release_claim(data_id).await;
        result.map_err(fail)
    }

    async fn release_claim(&self, data_id: &str) {
        if let Err(e) = self.registry_call("release", || self.registry.release(data_id)).await {
            tracing::warn!(data_id, error = %e, "claim not released");
        }
    }

    async fn run_claimed(
        &self,
        description: &DataDescription,
        level: usize,
        cancel: &CancellationToken,
        halt: &CancellationToken,
    ) -> Result<UnitOutcome, String> {
        let data_id = description.data_id.as_str();

        self.registry_call("put_data", || self.registry.put_data(description))
            .await
            .map_err(|e| e.to_string())?;
        self.registry_call("set_state", || self.registry.set_state(data_id, RecordState::Pending))
            .await
            .map_err(|e| e.to_string())?;

        if halt.is_cancelled() {
            return Ok(UnitOutcome::Skipped);
        }

        let mut attempts = 0;
        let submitted = self
            .config
            .submit_retry
            .run_if(
                "submit",
                || {
                    attempts += 1;
                    self.backend.submit(description)
                },
                BackendError::is_retryable,
            )
            .await;
        self.record_retries(attempts);

        let handle = match submitted {
            Ok(handle) => handle,
            Err(e) => {
                self.mark(data_id, RecordState::Failed).await;
                return Err(e.to_string());
            }
        };
        self.metrics.record_submitted();
        tracing::debug!(data_id, service = %description.service, level, %handle, "submitted");

        match self.await_handle(&handle, cancel).await {
            Terminal::Completed => {
                self.registry_call("set_state", || self.registry.set_state(data_id, RecordState::Completed))
                    .await
                    .map_err(|e| e.to_string())?;
                self.metrics.record_completed();
                tracing::debug!(data_id, level, "completed");
                Ok(UnitOutcome::Submitted)
            }
            Terminal::Failed(reason) => {
                self.mark(data_id, RecordState::Failed).await;
                Err(reason)
            }
            Terminal::Cancelled => Ok(UnitOutcome::Cancelled),
        }
    }

    async fn await_handle(&self, handle: &ExecutionHandle, cancel: &CancellationToken) -> Terminal {
        let deadline = Instant::now() + self.config.poll.timeout();
        let mut intervals = self.config.poll.intervals();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.cancel_handle(handle).await;
                return Terminal::Failed(format!("timed out after {}ms", self.config.poll.timeout_ms));
            }

            let pause = intervals.next().unwrap_or_default().min(remaining);
            tokio::select! {
                () = cancel.cancelled() => {
                    self.cancel_handle(handle).await;
                    return Terminal::Cancelled;
                }
                () = tokio::time::sleep(pause) => {}
            }

            match self.backend.poll(handle).await {
                Ok(ExecutionState::Completed) => return Terminal::Completed,
                Ok(ExecutionState::Failed(reason)) => return Terminal::Failed(reason),
                Ok(state) => tracing::trace!(%handle, ?state, "polled"),
                Err(BackendError::UnknownHandle(h)) => {
                    return Terminal::Failed(format!("backend lost handle {}", h));
                }
                Err(e) => tracing::warn!(%handle, error = %e, "poll failed"),
            }
        }
    }

    /// Wait for whoever holds the claim on `description`
    ///
    /// A completed record is accepted at once. A failed or missing record
    /// only counts once the claim is released, since a new claimant may be
    /// rerunning the unit.
    async fn wait_for_claim(
        &self,
        description: &DataDescription,
        cancel: &CancellationToken,
    ) -> Result<UnitOutcome, String> {
        let data_id = description.data_id.as_str();
        let deadline = Instant::now() + self.config.poll.timeout();
        let mut intervals = self.config.poll.intervals();

        loop {
            // Claim first: the winner records its state before releasing
            let claimed = self
                .registry_call("is_claimed", || self.registry.is_claimed(data_id))
                .await
                .map_err(|e| e.to_string())?;
            let record = self
                .registry_call("get_data", || self.registry.get_data(data_id))
                .await
                .map_err(|e| e.to_string())?;
            if record.as_ref().is_some_and(|r| r.is_completed()) {
                return Ok(UnitOutcome::Waited);
            }
            if !claimed {
                return Err(match record.map(|r| r.state) {
                    Some(RecordState::Failed) => "claimant failed".to_string(),
                    _ => "claim released without completion".to_string(),
                });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(format!("timed out after {}ms waiting on claim", self.config.poll.timeout_ms));
            }

            let pause = intervals.next().unwrap_or_default().min(remaining);
            tokio::select! {
                () = cancel.cancelled() => return Ok(UnitOutcome::Cancelled),
                () = tokio::time::sleep(pause) => {}
            }
        }
    }

    async fn registry_call<T, F, Fut>(&self, what: &str, mut op: F) -> RegistryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RegistryResult<T>>,
    {
        let mut attempts = 0;
        let result = self
            .config
            .registry_retry
            .run(what, || {
                attempts += 1;
                op()
            })
            .await;
        self.record_retries(attempts);
        result
    }

    fn record_retries(&self, attempts: u32) {
        for _ in 1..attempts {
            self.metrics.record_retry();
        }
    }

    async fn mark(&self, data_id: &str, state: RecordState) {
        if let Err(e) = self.registry_call("set_state", || self.registry.set_state(data_id, state)).await {
            tracing::warn!(data_id, ?state, error = %e, "could not record state");
        }
    }

    async fn cancel_handle(&self, handle: &ExecutionHandle) {
        self.metrics.record_cancelled();
        if let Err(e) = self.backend.cancel(handle).await {
            tracing::warn!(%handle, error = %e, "cancel failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackBackend;
    use crate::retry::{PollPolicy, RetryPolicy};
    use ensemble_core::{ExecutionRequest, RequestAxes, Service};
    use ensemble_plan::ChainBuilder;
    use ensemble_storage::MemoryRegistry;
    use serde_json::json;
    use std::time::Duration;

    fn pipeline() -> ServiceGraph {
        let mut graph = ServiceGraph::new();
        graph
            .register(Service::new("SelectLocation").with_parameters(["base_model", "models", "locations"]))
            .unwrap();
        graph
            .register(
                Service::new("BiasCorrection")
                    .with_parameters(["methods", "thresholds"])
                    .with_inputs(["SelectLocation"]),
            )
            .unwrap();
        graph
            .register(
                Service::new("CalculateCost")
                    .with_parameters(["time_windows"])
                    .with_inputs(["BiasCorrection"]),
            )
            .unwrap();
        graph
    }

    fn axes() -> RequestAxes {
        ExecutionRequest::new("CalculateCost")
            .with_axis("SelectLocation", "base_model", vec![json!("EC-Earth3")])
            .with_axis("SelectLocation", "models", vec![json!("m1"), json!("m2")])
            .with_axis("SelectLocation", "locations", vec![json!("Dhaka"), json!("Lagos")])
            .with_axis("BiasCorrection", "methods", vec![json!("bc1"), json!("bc2")])
            .with_axis("BiasCorrection", "thresholds", vec![json!("1"), json!("2")])
            .with_axis("CalculateCost", "time_windows", vec![json!("today"), json!([1980, 2020])])
            .parameters
    }

    fn fast_config() -> DispatchConfig {
        DispatchConfig::default()
            .with_poll(PollPolicy::fixed(1, 2_000))
            .with_submit_retry(RetryPolicy::new(3, 1))
            .with_registry_retry(RetryPolicy::new(3, 1))
    }

    struct Fixture {
        graph: ServiceGraph,
        plan: ChainPlan,
        registry: Arc<MemoryRegistry>,
        backend: Arc<LoopbackBackend>,
    }

    impl Fixture {
        fn new(backend: LoopbackBackend) -> Self {
            let graph = pipeline();
            let plan = ChainBuilder::new(&graph).build("CalculateCost", &axes()).unwrap();
            Self {
                graph,
                plan,
                registry: Arc::new(MemoryRegistry::new()),
                backend: Arc::new(backend),
            }
        }

        fn coordinator(&self, config: DispatchConfig) -> DispatchCoordinator {
            DispatchCoordinator::new(self.registry.clone(), self.backend.clone(), config)
        }
    }

    #[test]
    fn test_level_units_linear_pipeline() {
        let fixture = Fixture::new(LoopbackBackend::new());
        let locator = LocatorConfig::default();

        let level0 = level_units(&fixture.graph, &fixture.plan, 0, &locator).unwrap();
        assert_eq!(level0.descriptions.len(), 4);
        assert_eq!(level0.duplicates, 0);

        let level2 = level_units(&fixture.graph, &fixture.plan, 2, &locator).unwrap();
        assert_eq!(level2.descriptions.len(), 32);
        assert!(level2.descriptions.iter().all(|d| d.service == "CalculateCost"));
        assert!(level2.descriptions.iter().all(|d| d.inputs.len() == 2));
    }

    #[test]
    fn test_level_units_deduplicates_shared_prefixes() {
        let mut graph = ServiceGraph::new();
        graph.register(Service::new("a").with_parameters(["p"])).unwrap();
        graph.register(Service::new("b").with_parameters(["p"])).unwrap();
        graph.register(Service::new("c").with_inputs(["a", "b"])).unwrap();
        let request = ExecutionRequest::new("c")
            .with_axis("a", "p", vec![json!(1), json!(2)])
            .with_axis("b", "p", vec![json!(1), json!(2), json!(3)]);
        let plan = ChainBuilder::new(&graph).build("c", &request.parameters).unwrap();

        // Six chains at level 0, each holding one `a` and one `b` unit
        let units = level_units(&graph, &plan, 0, &LocatorConfig::default()).unwrap();
        assert_eq!(units.descriptions.len() + units.duplicates, 12);
        assert_eq!(units.duplicates, 4);
    }

    #[tokio::test]
    async fn test_dispatch_all_levels() {
        let fixture = Fixture::new(LoopbackBackend::new().with_polls_to_complete(1));
        let coordinator = fixture.coordinator(fast_config());

        let report = coordinator
            .dispatch(&fixture.graph, &fixture.plan, false, &CancellationToken::new())
            .await
            .unwrap();

        let submitted: Vec<_> = report.levels.iter().map(|l| l.submitted).collect();
        assert_eq!(submitted, vec![4, 16, 32]);
        assert_eq!(report.final_chains.len(), 32);
        assert_eq!(report.outputs.len(), 32);
        assert_eq!(fixture.backend.submission_count().await, 52);
        assert_eq!(coordinator.metrics().snapshot().completed, 52);
    }

    #[tokio::test]
    async fn test_level_barrier_order() {
        let fixture = Fixture::new(LoopbackBackend::new().with_polls_to_complete(2));
        let coordinator = fixture.coordinator(fast_config().with_fan_out(3));
        coordinator
            .dispatch(&fixture.graph, &fixture.plan, false, &CancellationToken::new())
            .await
            .unwrap();

        let order: Vec<String> = fixture
            .backend
            .submitted()
            .await
            .iter()
            .filter_map(|id| id.split(':').next().map(str::to_string))
            .collect();
        let last_select = order.iter().rposition(|s| s == "SelectLocation").unwrap();
        let first_bias = order.iter().position(|s| s == "BiasCorrection").unwrap();
        let last_bias = order.iter().rposition(|s| s == "BiasCorrection").unwrap();
        let first_cost = order.iter().position(|s| s == "CalculateCost").unwrap();
        assert!(last_select < first_bias);
        assert!(last_bias < first_cost);
    }

    #[tokio::test]
    async fn test_second_dispatch_is_fully_cached() {
        let fixture = Fixture::new(LoopbackBackend::new());
        let coordinator = fixture.coordinator(fast_config());
        let cancel = CancellationToken::new();

        coordinator.dispatch(&fixture.graph, &fixture.plan, false, &cancel).await.unwrap();
        let before = fixture.backend.submission_count().await;

        let report = coordinator.dispatch(&fixture.graph, &fixture.plan, false, &cancel).await.unwrap();
        assert_eq!(fixture.backend.submission_count().await, before);
        assert_eq!(report.total_submitted(), 0);
        assert_eq!(report.total_cached(), 52);
    }

    #[tokio::test]
    async fn test_force_rerun_resubmits() {
        let fixture = Fixture::new(LoopbackBackend::new());
        let coordinator = fixture.coordinator(fast_config());
        let cancel = CancellationToken::new();

        coordinator.dispatch(&fixture.graph, &fixture.plan, false, &cancel).await.unwrap();
        let report = coordinator.dispatch(&fixture.graph, &fixture.plan, true, &cancel).await.unwrap();

        assert_eq!(report.total_cached(), 0);
        assert_eq!(fixture.backend.submission_count().await, 104);
    }

    #[tokio::test]
    async fn test_failure_stops_next_level() {
        let fixture = Fixture::new(LoopbackBackend::new().with_failing_service("BiasCorrection"));
        let coordinator = fixture.coordinator(fast_config());

        let err = coordinator
            .dispatch(&fixture.graph, &fixture.plan, false, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            DispatchError::ChainFailed { service, level, data_id, .. } => {
                assert_eq!(service, "BiasCorrection");
                assert_eq!(level, 1);
                assert!(data_id.starts_with("BiasCorrection:"));
                let record = fixture.registry.get_data(&data_id).await.unwrap().unwrap();
                assert_eq!(record.state, RecordState::Failed);
            }
            other => panic!("unexpected error: {}", other),
        }

        let submitted = fixture.backend.submitted().await;
        assert!(submitted.iter().all(|id| !id.starts_with("CalculateCost:")));
    }

    #[tokio::test]
    async fn test_failed_unit_is_retried_on_next_request() {
        let fixture = Fixture::new(LoopbackBackend::new().with_failing_service("CalculateCost"));
        let coordinator = fixture.coordinator(fast_config().with_fan_out(1));
        let cancel = CancellationToken::new();

        assert!(coordinator.dispatch(&fixture.graph, &fixture.plan, false, &cancel).await.is_err());
        let stats = fixture.registry.stats().await;
        assert_eq!(stats.active_claims, 0);

        // Upstream levels come from cache; the failed unit is claimable again
        let err = coordinator.dispatch(&fixture.graph, &fixture.plan, false, &cancel).await.unwrap_err();
        assert!(matches!(err, DispatchError::ChainFailed { level: 2, .. }));
    }

    #[tokio::test]
    async fn test_submission_retries_then_succeeds() {
        let fixture = Fixture::new(LoopbackBackend::new().with_rejected_submissions(2));
        let coordinator = fixture.coordinator(fast_config().with_fan_out(1));

        let report = coordinator
            .dispatch(&fixture.graph, &fixture.plan, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.total_submitted(), 52);
        assert_eq!(coordinator.metrics().snapshot().retries, 2);
    }

    #[tokio::test]
    async fn test_submission_budget_exhausted() {
        let fixture = Fixture::new(LoopbackBackend::new().with_rejected_submissions(10));
        let coordinator = fixture.coordinator(fast_config().with_fan_out(1));

        let err = coordinator
            .dispatch(&fixture.graph, &fixture.plan, false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ChainFailed { level: 0, .. }));
    }

    #[tokio::test]
    async fn test_poll_timeout_fails_unit() {
        let fixture = Fixture::new(LoopbackBackend::new().with_stalled_service("SelectLocation"));
        let config = fast_config().with_poll(PollPolicy::fixed(1, 20));
        let coordinator = fixture.coordinator(config);

        let err = coordinator
            .dispatch(&fixture.graph, &fixture.plan, false, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            DispatchError::ChainFailed { level, reason, .. } => {
                assert_eq!(level, 0);
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(fixture.backend.cancelled().await.len(), 4);
    }

    #[tokio::test]
    async fn test_cancellation_stops_submissions() {
        let fixture = Fixture::new(LoopbackBackend::new().with_stalled_service("SelectLocation"));
        let coordinator = fixture.coordinator(fast_config().with_fan_out(2));
        let cancel = CancellationToken::new();

        let canceller = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(
            coordinator.dispatch(&fixture.graph, &fixture.plan, false, &cancel),
            canceller
        );

        assert_eq!(result.unwrap_err(), DispatchError::Cancelled { level: 0 });
        assert_eq!(fixture.backend.submission_count().await, 2);
        assert_eq!(fixture.backend.cancelled().await.len(), 2);
        assert_eq!(fixture.registry.stats().await.active_claims, 0);
    }

    #[tokio::test]
    async fn test_lost_claim_waits_for_winner() {
        let fixture = Fixture::new(LoopbackBackend::new());
        let coordinator = fixture.coordinator(fast_config().with_poll(PollPolicy::fixed(1, 500)));
        let units = level_units(&fixture.graph, &fixture.plan, 0, &LocatorConfig::default()).unwrap();
        let first = units.descriptions[0].clone();

        // Another dispatcher holds the claim and finishes shortly
        fixture.registry.claim(&first.data_id).await.unwrap();
        let registry = fixture.registry.clone();
        let winner = async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            registry.put_data(&first).await.unwrap();
            registry.set_state(&first.data_id, RecordState::Completed).await.unwrap();
            registry.release(&first.data_id).await.unwrap();
        };

        let cancel = CancellationToken::new();
        let (result, ()) = tokio::join!(
            coordinator.dispatch(&fixture.graph, &fixture.plan, false, &cancel),
            winner
        );
        let report = result.unwrap();
        assert_eq!(report.levels[0].waited, 1);
        assert_eq!(report.levels[0].submitted, 3);
        assert!(!fixture.backend.submitted().await.contains(&first.data_id));
    }

    #[tokio::test]
    async fn test_lost_claim_released_without_completion_fails() {
        let fixture = Fixture::new(LoopbackBackend::new());
        let coordinator = fixture.coordinator(fast_config().with_poll(PollPolicy::fixed(1, 500)));
        let units = level_units(&fixture.graph, &fixture.plan, 0, &LocatorConfig::default()).unwrap();
        let first = units.descriptions[0].clone();

        fixture.registry.claim(&first.data_id).await.unwrap();
        let registry = fixture.registry.clone();
        let quitter = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            registry.release(&first.data_id).await.unwrap();
        };

        let cancel = CancellationToken::new();
        let (result, ()) = tokio::join!(
            coordinator.dispatch(&fixture.graph, &fixture.plan, false, &cancel),
            quitter
        );
        assert!(matches!(result, Err(DispatchError::ChainFailed { level: 0, .. })));
    }

    /// Hides the first `get_data` result, as if the record was written
    /// right after the read
    struct LateRecordRegistry {
        inner: MemoryRegistry,
        hidden: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl Registry for LateRecordRegistry {
        async fn put_service(&self, service: &Service) -> RegistryResult<()> {
            self.inner.put_service(service).await
        }

        async fn get_service(&self, name: &str) -> RegistryResult<Option<Service>> {
            self.inner.get_service(name).await
        }

        async fn list_services(&self) -> RegistryResult<Vec<Service>> {
            self.inner.list_services().await
        }

        async fn put_data(&self, description: &DataDescription) -> RegistryResult<()> {
            self.inner.put_data(description).await
        }

        async fn get_data(&self, data_id: &str) -> RegistryResult<Option<ensemble_storage::DataRecord>> {
            if !self.hidden.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.get_data(data_id).await
        }

        async fn set_state(&self, data_id: &str, state: RecordState) -> RegistryResult<()> {
            self.inner.set_state(data_id, state).await
        }

        async fn claim(&self, data_id: &str) -> RegistryResult<ClaimOutcome> {
            self.inner.claim(data_id).await
        }

        async fn is_claimed(&self, data_id: &str) -> RegistryResult<bool> {
            self.inner.is_claimed(data_id).await
        }

        async fn release(&self, data_id: &str) -> RegistryResult<()> {
            self.inner.release(data_id).await
        }
    }

    #[tokio::test]
    async fn test_won_claim_rechecks_completed_record() {
        let mut graph = ServiceGraph::new();
        graph.register(Service::new("A").with_parameters(["p"])).unwrap();
        let request = ExecutionRequest::new("A").with_axis("A", "p", vec![json!(1)]);
        let plan = ChainBuilder::new(&graph).build("A", &request.parameters).unwrap();
        let unit = level_units(&graph, &plan, 0, &LocatorConfig::default())
            .unwrap()
            .descriptions
            .remove(0);

        // Another dispatcher finished the unit between our cache check and claim
        let registry = Arc::new(LateRecordRegistry {
            inner: MemoryRegistry::new(),
            hidden: std::sync::atomic::AtomicBool::new(false),
        });
        registry.inner.put_data(&unit).await.unwrap();
        registry.inner.set_state(&unit.data_id, RecordState::Completed).await.unwrap();

        let backend = Arc::new(LoopbackBackend::new());
        let coordinator = DispatchCoordinator::new(registry.clone(), backend.clone(), fast_config());
        let report = coordinator
            .dispatch(&graph, &plan, false, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.levels[0].cached, 1);
        assert_eq!(report.levels[0].submitted, 0);
        assert_eq!(backend.submission_count().await, 0);
        assert_eq!(registry.inner.stats().await.active_claims, 0);
    }

    #[tokio::test]
    async fn test_concurrent_dispatches_submit_once() {
        let fixture = Fixture::new(LoopbackBackend::new().with_polls_to_complete(2));
        let first = fixture.coordinator(fast_config().with_fan_out(3));
        let second = fixture.coordinator(fast_config().with_fan_out(5));
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(
            first.dispatch(&fixture.graph, &fixture.plan, false, &cancel),
            second.dispatch(&fixture.graph, &fixture.plan, false, &cancel)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(fixture.backend.submission_count().await, 52);
        assert_eq!(a.total_submitted() + b.total_submitted(), 52);
        for report in [&a, &b] {
            let resolved: usize = report.levels.iter().map(|l| l.cached + l.submitted + l.waited).sum();
            assert_eq!(resolved, 52);
        }
        assert_eq!(fixture.registry.stats().await.active_claims, 0);
    }

    #[tokio::test]
    async fn test_invalid_template_is_not_retried() {
        let fixture = Fixture::new(LoopbackBackend::new());
        let backend = Arc::new(crate::process::ProcessBackend::new());
        let coordinator = DispatchCoordinator::new(fixture.registry.clone(), backend, fast_config().with_fan_out(1));

        let err = coordinator
            .dispatch(&fixture.graph, &fixture.plan, false, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            DispatchError::ChainFailed { level, reason, .. } => {
                assert_eq!(level, 0);
                assert!(reason.contains("Invalid execution template"));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(coordinator.metrics().snapshot().retries, 0);
    }
}
