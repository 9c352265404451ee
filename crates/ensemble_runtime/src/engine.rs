//! Engine façade.
//!
//! Ties the service graph, the registry and an execution backend together.
//! Reads take a snapshot of the graph without locking; registrations are
//! serialized behind a single writer and publish a new graph only after the
//! registry accepted the service.

use crate::backend::ExecutionBackend;
use crate::config::EngineConfig;
use crate::coordinator::{level_units, DispatchCoordinator, DispatchError, DispatchReport};
use crate::monitor::{DispatchMetrics, MetricsSnapshot};
use arc_swap::ArcSwap;
use ensemble_core::{ExecutionRequest, Service};
use ensemble_plan::{ChainBuilder, ChainPlan, RequestValidator, ServiceGraph};
use ensemble_storage::Registry;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// One level of a [`PlanPreview`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LevelPreview {
    /// Level index
    pub level: usize,
    /// Services introduced at this level
    pub services: Vec<String>,
    /// Chains through this level
    pub chains: usize,
    /// Distinct `dataId`s the level would dispatch
    pub data_ids: Vec<String>,
    /// Units sharing a `dataId` with another unit
    pub duplicates: usize,
}

/// What a request would dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanPreview {
    /// Target service
    pub target: String,
    /// Levels in dispatch order
    pub levels: Vec<LevelPreview>,
    /// Validation warnings
    pub warnings: Vec<String>,
}

impl PlanPreview {
    /// Chains ending at the target
    #[must_use]
    pub fn final_chain_count(&self) -> usize {
        self.levels.last().map_or(0, |l| l.chains)
    }
}

/// Service registration, planning and dispatch
pub struct Engine {
    graph: ArcSwap<ServiceGraph>,
    writer: Mutex<()>,
    registry: Arc<dyn Registry>,
    coordinator: DispatchCoordinator,
    config: EngineConfig,
}

impl Engine {
    /// Create an engine with an empty graph
    #[must_use]
    pub fn new(registry: Arc<dyn Registry>, backend: Arc<dyn ExecutionBackend>, config: EngineConfig) -> Self {
        let coordinator = DispatchCoordinator::new(Arc::clone(&registry), backend, config.dispatch.clone())
            .with_metrics(Arc::new(DispatchMetrics::new()));
        Self {
            graph: ArcSwap::from_pointee(ServiceGraph::new()),
            writer: Mutex::new(()),
            registry,
            coordinator,
            config,
        }
    }

    /// Current graph snapshot
    #[must_use]
    pub fn graph(&self) -> Arc<ServiceGraph> {
        self.graph.load_full()
    }

    /// Registered services, in registration order
    #[must_use]
    pub fn services(&self) -> Vec<Service> {
        self.graph.load().services().cloned().collect()
    }

    /// Aggregated dispatch counters
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.coordinator.metrics().snapshot()
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register or replace a service
    ///
    /// The graph is left untouched unless the service is valid and the
    /// registry stored it.
    ///
    /// # Errors
    ///
    /// - `Planning` with `UnknownDependency` or `CycleDetected`
    /// - `Registry` if the registry write failed after retries
    pub async fn register(&self, service: Service) -> Result<(), DispatchError> {
        let _writer = self.writer.lock().await;

        let next = self.graph.load().with_registered(service.clone())?;
        self.config
            .dispatch
            .registry_retry
            .run("put_service", || self.registry.put_service(&service))
            .await?;
        self.graph.store(Arc::new(next));

        tracing::info!(service = %service.name, inputs = ?service.inputs, "service registered");
        Ok(())
    }

    /// Rebuild the graph from every service in the registry
    ///
    /// Services are added once all their inputs are present, repeating until
    /// nothing more can be added.
    ///
    /// # Errors
    ///
    /// - `Registry` if the services cannot be listed
    /// - `Planning` for the first service whose inputs never appear
    pub async fn restore(&self) -> Result<usize, DispatchError> {
        let _writer = self.writer.lock().await;

        let mut pending = self
            .config
            .dispatch
            .registry_retry
            .run("list_services", || self.registry.list_services())
            .await?;
        let mut graph = ServiceGraph::new();

        loop {
            let before = pending.len();
            let (ready, blocked): (Vec<_>, Vec<_>) = pending
                .into_iter()
                .partition(|s: &Service| s.inputs.iter().all(|i| graph.contains(i)));
            for service in ready {
                graph.register(service)?;
            }
            pending = blocked;
            if pending.is_empty() || pending.len() == before {
                break;
            }
        }

        // Whatever is left can never be satisfied; surface the graph's own error
        for service in pending {
            graph.register(service)?;
        }

        let restored = graph.node_count();
        self.graph.store(Arc::new(graph));
        tracing::info!(services = restored, "graph restored");
        Ok(restored)
    }

    /// Preview what `request` would dispatch
    ///
    /// # Errors
    ///
    /// - `InvalidRequest` if validation fails
    /// - `Planning` if chain building fails
    pub fn plan(&self, request: &ExecutionRequest) -> Result<PlanPreview, DispatchError> {
        let graph = self.graph.load_full();
        let warnings = validate(&graph, request)?;
        let plan = self.build(&graph, request)?;
        let locator = self.config.dispatch.locator();

        let mut levels = Vec::with_capacity(plan.level_count());
        for level in 0..plan.level_count() {
            let units = level_units(&graph, &plan, level, &locator)?;
            levels.push(LevelPreview {
                level,
                services: plan.levels().services_at(level).to_vec(),
                chains: plan.chains_at(level).len(),
                data_ids: units.descriptions.into_iter().map(|d| d.data_id).collect(),
                duplicates: units.duplicates,
            });
        }

        Ok(PlanPreview {
            target: request.target_service.clone(),
            levels,
            warnings,
        })
    }

    /// Dispatch `request` to completion
    ///
    /// # Errors
    ///
    /// See [`DispatchCoordinator::dispatch`]
    pub async fn execute(&self, request: &ExecutionRequest) -> Result<DispatchReport, DispatchError> {
        self.execute_with_cancel(request, &CancellationToken::new()).await
    }

    /// Dispatch `request`, stopping when `cancel` fires
    ///
    /// # Errors
    ///
    /// See [`DispatchCoordinator::dispatch`]
    pub async fn execute_with_cancel(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, DispatchError> {
        let graph = self.graph.load_full();
        validate(&graph, request)?;
        let plan = self.build(&graph, request)?;
        self.coordinator
            .dispatch(&graph, &plan, request.force_rerun, cancel)
            .await
    }

    fn build(&self, graph: &ServiceGraph, request: &ExecutionRequest) -> Result<ChainPlan, DispatchError> {
        Ok(ChainBuilder::new(graph)
            .with_max_chains(self.config.dispatch.max_chains)
            .build(&request.target_service, &request.parameters)?)
    }
}

fn validate(graph: &ServiceGraph, request: &ExecutionRequest) -> Result<Vec<String>, DispatchError> {
    match RequestValidator::new(graph).validate(request) {
        Ok(warnings) => {
            for warning in &warnings {
                tracing::warn!(target_service = %request.target_service, "{}", warning);
            }
            Ok(warnings.iter().map(ToString::to_string).collect())
        }
        Err(errors) => Err(DispatchError::InvalidRequest(errors)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::loopback::LoopbackBackend;
    use crate::retry::{PollPolicy, RetryPolicy};
    use ensemble_core::CoreError;
    use ensemble_storage::MemoryRegistry;
    use serde_json::json;

    fn config() -> EngineConfig {
        EngineConfig::new(
            DispatchConfig::default()
                .with_poll(PollPolicy::fixed(1, 2_000))
                .with_registry_retry(RetryPolicy::new(2, 1))
                .with_submit_retry(RetryPolicy::new(2, 1)),
        )
    }

    fn services() -> Vec<Service> {
        vec![
            Service::new("SelectLocation").with_parameters(["base_model", "models", "locations"]),
            Service::new("BiasCorrection")
                .with_parameters(["methods", "thresholds"])
                .with_inputs(["SelectLocation"]),
            Service::new("CalculateCost")
                .with_parameters(["time_windows"])
                .with_inputs(["BiasCorrection"]),
        ]
    }

    fn request() -> ExecutionRequest {
        ExecutionRequest::new("CalculateCost")
            .with_axis("SelectLocation", "base_model", vec![json!("EC-Earth3")])
            .with_axis("SelectLocation", "models", vec![json!("m1"), json!("m2")])
            .with_axis("SelectLocation", "locations", vec![json!("Dhaka"), json!("Lagos")])
            .with_axis("BiasCorrection", "methods", vec![json!("bc1"), json!("bc2")])
            .with_axis("BiasCorrection", "thresholds", vec![json!("1"), json!("2")])
            .with_axis(
                "CalculateCost",
                "time_windows",
                vec![json!(["today", "tomorrow"]), json!([1980, 2020])],
            )
    }

    async fn engine() -> (Engine, Arc<MemoryRegistry>, Arc<LoopbackBackend>) {
        let registry = Arc::new(MemoryRegistry::new());
        let backend = Arc::new(LoopbackBackend::new());
        let engine = Engine::new(registry.clone(), backend.clone(), config());
        for service in services() {
            engine.register(service).await.unwrap();
        }
        (engine, registry, backend)
    }

    #[tokio::test]
    async fn test_register_persists_and_publishes() {
        let (engine, registry, _) = engine().await;
        assert_eq!(engine.graph().node_count(), 3);
        assert_eq!(registry.list_services().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_register_rejection_leaves_state_untouched() {
        let (engine, registry, _) = engine().await;
        let before = engine.graph();

        let err = engine
            .register(Service::new("Orphan").with_inputs(["Missing"]))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            DispatchError::Planning(CoreError::UnknownDependency {
                service: "Orphan".to_string(),
                dependency: "Missing".to_string(),
            })
        );

        let err = engine
            .register(Service::new("SelectLocation").with_inputs(["CalculateCost"]))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Planning(CoreError::CycleDetected { .. })));

        assert_eq!(*engine.graph(), *before);
        assert!(registry.get_service("Orphan").await.unwrap().is_none());
        assert!(registry.get_service("SelectLocation").await.unwrap().unwrap().inputs.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_registrations() {
        let registry = Arc::new(MemoryRegistry::new());
        let engine = Engine::new(registry, Arc::new(LoopbackBackend::new()), config());
        engine.register(Service::new("root")).await.unwrap();

        let registrations = (0..16).map(|i| engine.register(Service::new(format!("leaf{}", i)).with_inputs(["root"])));
        for result in futures::future::join_all(registrations).await {
            result.unwrap();
        }

        let graph = engine.graph();
        assert_eq!(graph.node_count(), 17);
        assert_eq!(graph.dependents("root").len(), 16);
    }

    #[tokio::test]
    async fn test_restore_in_dependency_order() {
        let registry = Arc::new(MemoryRegistry::new());
        for service in services().into_iter().rev() {
            registry.put_service(&service).await.unwrap();
        }

        let engine = Engine::new(registry, Arc::new(LoopbackBackend::new()), config());
        assert_eq!(engine.restore().await.unwrap(), 3);
        assert_eq!(engine.graph().dependencies("CalculateCost"), vec!["BiasCorrection"]);
    }

    #[tokio::test]
    async fn test_restore_unsatisfiable() {
        let registry = Arc::new(MemoryRegistry::new());
        registry.put_service(&Service::new("A")).await.unwrap();
        registry.put_service(&Service::new("B").with_inputs(["Gone"])).await.unwrap();

        let engine = Engine::new(registry, Arc::new(LoopbackBackend::new()), config());
        let err = engine.restore().await.unwrap_err();
        assert!(matches!(err, DispatchError::Planning(CoreError::UnknownDependency { .. })));
        assert!(engine.graph().is_empty());
    }

    #[tokio::test]
    async fn test_plan_preview() {
        let (engine, _, backend) = engine().await;
        let preview = engine.plan(&request()).unwrap();

        let chains: Vec<_> = preview.levels.iter().map(|l| l.chains).collect();
        assert_eq!(chains, vec![4, 16, 32]);
        assert_eq!(preview.final_chain_count(), 32);
        assert_eq!(preview.levels[2].data_ids.len(), 32);
        assert!(preview.warnings.is_empty());
        assert_eq!(backend.submission_count().await, 0);
    }

    #[tokio::test]
    async fn test_plan_invalid_request() {
        let (engine, _, _) = engine().await;
        let mut request = request();
        request.parameters.remove("BiasCorrection");

        let err = engine.plan(&request).unwrap_err();
        match err {
            DispatchError::InvalidRequest(errors) => assert_eq!(errors.len(), 1),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_execute_twice_hits_cache() {
        let (engine, _, backend) = engine().await;

        let first = engine.execute(&request()).await.unwrap();
        assert_eq!(first.final_chains.len(), 32);
        assert_eq!(backend.submission_count().await, 52);

        let second = engine.execute(&request()).await.unwrap();
        assert_eq!(second.total_submitted(), 0);
        assert_eq!(backend.submission_count().await, 52);
        assert_eq!(second.outputs, first.outputs);

        let metrics = engine.metrics();
        assert_eq!(metrics.requests, 2);
        assert_eq!(metrics.cached, 52);
    }

    #[tokio::test]
    async fn test_execute_intermediate_target_then_full() {
        let (engine, _, backend) = engine().await;
        let mut partial = request();
        partial.target_service = "BiasCorrection".to_string();

        let report = engine.execute(&partial).await.unwrap();
        assert_eq!(report.total_submitted(), 20);

        let report = engine.execute(&request()).await.unwrap();
        assert_eq!(report.total_cached(), 20);
        assert_eq!(report.total_submitted(), 32);
        assert_eq!(backend.submission_count().await, 52);
    }

    #[tokio::test]
    async fn test_execute_cancelled_before_start() {
        let (engine, _, backend) = engine().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine.execute_with_cancel(&request(), &cancel).await.unwrap_err();
        assert_eq!(err, DispatchError::Cancelled { level: 0 });
        assert_eq!(backend.submission_count().await, 0);
    }

    #[tokio::test]
    async fn test_dry_run_over_service_copy_keeps_durable_cache_clean() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.redb");
        let request = ExecutionRequest::new("A").with_axis("A", "p", vec![json!(1), json!(2)]);

        let durable = Arc::new(ensemble_storage::RedbRegistry::open(&path).unwrap());
        let setup = Engine::new(durable.clone(), Arc::new(LoopbackBackend::new()), config());
        setup.register(Service::new("A").with_parameters(["p"])).await.unwrap();

        // Dry run: loopback execution against a copy of the registered services
        let scratch = Arc::new(MemoryRegistry::with_services_from(&*durable).await.unwrap());
        let dry = Engine::new(scratch, Arc::new(LoopbackBackend::new()), config());
        dry.restore().await.unwrap();
        assert_eq!(dry.execute(&request).await.unwrap().total_submitted(), 2);

        let backend = Arc::new(LoopbackBackend::new());
        let real = Engine::new(durable, backend.clone(), config());
        real.restore().await.unwrap();
        let report = real.execute(&request).await.unwrap();
        assert_eq!(report.total_cached(), 0);
        assert_eq!(report.total_submitted(), 2);
        assert_eq!(backend.submission_count().await, 2);
    }
}
