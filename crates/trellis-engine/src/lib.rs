//! # Trellis Engine
//!
//! Dependency-graph computation engine.
//!
//! This crate provides:
//! - [`value`]: Requirements, specifications and properties of computed values
//! - [`FunctionRepository`]: Calculation functions indexed by what they produce
//! - [`DependencyGraphBuilder`]: Resolves requirements into a [`DependencyGraph`]
//! - [`ResolutionFailureTracker`]: Structured "why didn't this resolve" diagnostics
//! - [`ComputationCache`]: Computed values keyed by specification
//! - [`JobScheduler`]: Executes graphs on a [`WorkerPool`]
//! - [`CycleCoordinator`]: Incremental recomputation of a view as market data moves
//! - [`ComputeEngine`]: Main engine wiring all components
//!
//! ## Architecture
//!
//! ```text
//! ViewDefinition ─> DependencyGraphBuilder ─┬─> DependencyGraph
//!                    (FunctionRepository)    └─> ResolutionFailureTracker
//!
//! Market Data ─> CycleCoordinator ─> JobScheduler ─┬─> WorkerPool ─> CalculationWorker
//!                       │                          └─> ComputationCache
//!                       └─> ViewResultModel ─> ResultListener / broadcast
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let engine = ComputeEngineBuilder::new()
//!     .with_repository(repository)
//!     .with_catalogue(catalogue)
//!     .with_target_resolver(targets)
//!     .with_market_data(feed)
//!     .with_availability(availability)
//!     .with_local_workers(4)
//!     .build()?;
//!
//! let view = engine.create_view(ViewDefinition::new("risk").with_requirement(pv))?;
//! let result = view.run_cycle().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod cache;
pub mod config;
pub mod cycle;
pub mod error;
pub mod failure;
pub mod function;
pub mod graph;
pub mod graph_builder;
pub mod job;
pub mod market_data;
pub mod repository;
pub mod result;
pub mod scheduler;
pub mod target;
pub mod value;
pub mod worker;

// Re-exports
pub use builder::ComputeEngineBuilder;
pub use cache::{CacheStats, CachedValue, ComputationCache};
pub use config::{FunctionEntry, FunctionRepositoryConfig, TrellisConfig};
pub use cycle::{CompiledView, CycleCoordinator, ViewDefinition};
pub use error::{EngineError, EngineResult};
pub use failure::{
    AttemptOutcome, FailureReason, FailureTreeFormatter, FunctionAttempt, ResolutionFailure,
    ResolutionFailureTracker, ResolutionFailureVisitor,
};
pub use function::{
    ClosureFunction, FunctionBuilder, FunctionCatalogue, FunctionDefinition, FunctionError, FunctionInputs,
    FunctionResult,
};
pub use graph::{DependencyGraph, DependencyNode, GraphStats, NodeId, NodeKind};
pub use graph_builder::{BuildOutput, DependencyGraphBuilder};
pub use job::{CalculationJob, CalculationJobItem, CalculationJobResult, CycleId, JobItemOutcome, JobItemResult};
pub use market_data::{
    ConventionMarketDataAvailability, FixedMarketDataAvailability, InMemoryMarketDataProvider,
    MarketDataAvailabilityProvider, MarketDataFanout,
};
pub use repository::{FunctionRepository, InMemoryFunctionRepository, RegisteredFunction};
pub use result::{CycleStats, ResultEntry, ResultListener, ResultOutcome, ViewResultModel};
pub use scheduler::{ExecutionFailure, ExecutionOutcome, ExecutionRequest, JobScheduler, NodeStatus};
pub use target::{ComputationTargetResolver, InMemoryTargetResolver};
pub use value::{
    ComputationTarget, ComputationTargetSpecification, ComputationTargetType, ComputedValue, ValueProperties,
    ValueRequirement, ValueSpecification,
};
pub use worker::{CalculationWorker, LocalWorker, RemoteWorker, WorkerEndpoint, WorkerPool};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use trellis_traits::config::EngineConfig;

/// The main compute engine.
///
/// Views share the engine's repository, cache, scheduler and worker pool.
pub struct ComputeEngine {
    /// Engine configuration
    config: EngineConfig,

    /// Function repository
    repository: Arc<dyn FunctionRepository>,

    /// Target resolver
    targets: Arc<dyn ComputationTargetResolver>,

    /// Market data availability
    availability: Arc<dyn MarketDataAvailabilityProvider>,

    /// Market data feed, one subscription per view
    market_data: Arc<MarketDataFanout>,

    /// Scheduler (owns the worker pool and cache)
    scheduler: Arc<JobScheduler>,

    /// Views by name
    views: DashMap<String, Arc<CycleCoordinator>>,

    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
}

impl ComputeEngine {
    /// Create a new compute engine.
    pub fn new(
        config: EngineConfig,
        repository: Arc<dyn FunctionRepository>,
        targets: Arc<dyn ComputationTargetResolver>,
        availability: Arc<dyn MarketDataAvailabilityProvider>,
        market_data: Arc<MarketDataFanout>,
        scheduler: Arc<JobScheduler>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            repository,
            targets,
            availability,
            market_data,
            scheduler,
            views: DashMap::new(),
            shutdown_tx,
        }
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Function repository.
    pub fn repository(&self) -> &Arc<dyn FunctionRepository> {
        &self.repository
    }

    /// Shared cache.
    pub fn cache(&self) -> &Arc<ComputationCache> {
        self.scheduler.cache()
    }

    /// Shared scheduler.
    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    /// A graph builder over the engine's repository, targets and market data.
    pub fn graph_builder(&self) -> DependencyGraphBuilder {
        DependencyGraphBuilder::new(Arc::clone(&self.repository), Arc::clone(&self.targets))
            .with_market_data(Arc::clone(&self.availability))
            .with_config(self.config.resolution.clone())
    }

    /// Resolves requirements without executing them.
    pub fn build_graph(&self, requirements: &[ValueRequirement]) -> BuildOutput {
        self.graph_builder().build(requirements)
    }

    /// Registers a view. Names are unique.
    pub fn create_view(&self, view: ViewDefinition) -> EngineResult<Arc<CycleCoordinator>> {
        if self.views.contains_key(&view.name) {
            return Err(EngineError::ConfigError(format!("view {} already exists", view.name)));
        }
        let name = view.name.clone();
        let coordinator = Arc::new(CycleCoordinator::new(
            view,
            self.graph_builder(),
            Arc::clone(&self.scheduler),
            Arc::new(self.market_data.subscribe()),
            self.config.cycle.clone(),
        ));
        self.views.insert(name.clone(), Arc::clone(&coordinator));
        info!(view = %name, "view created");
        Ok(coordinator)
    }

    /// A view by name.
    pub fn view(&self, name: &str) -> Option<Arc<CycleCoordinator>> {
        self.views.get(name).map(|v| Arc::clone(v.value()))
    }

    /// Removes a view.
    pub fn remove_view(&self, name: &str) -> Option<Arc<CycleCoordinator>> {
        self.views.remove(name).map(|(_, v)| v)
    }

    /// Names of all views, sorted.
    pub fn view_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.views.iter().map(|v| v.key().clone()).collect();
        names.sort();
        names
    }

    /// Starts the cycle loop of a view.
    pub fn start_view(&self, name: &str) -> EngineResult<JoinHandle<()>> {
        let view = self
            .view(name)
            .ok_or_else(|| EngineError::ConfigError(format!("unknown view {}", name)))?;
        let shutdown_rx = self.shutdown_tx.subscribe();
        Ok(tokio::spawn(view.run(shutdown_rx)))
    }

    /// Stops every cycle loop and closes the worker pool.
    pub fn shutdown(&self) {
        info!("Shutting down compute engine: {}", self.config.name);
        let _ = self.shutdown_tx.send(());
        for view in self.views.iter() {
            view.cancel_current();
        }
        self.scheduler.pool().close();
    }
}
