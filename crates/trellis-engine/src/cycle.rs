//! Cycle coordinator: repeated, incremental execution of one view.
//!
//! The coordinator compiles a view's requirements into a dependency graph once
//! and then runs cycles against a changing market data feed. Each cycle
//! recomputes only the nodes downstream of changed market data (plus nodes
//! that failed last time, or whose outputs are no longer cached) and reuses
//! every other cached value. The graph is rebuilt only when the view is
//! replaced or the function repository changes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use trellis_traits::config::CycleConfig;
use trellis_traits::ids::MarketDataKey;
use trellis_traits::market_data::MarketDataProvider;

use crate::error::EngineResult;
use crate::failure::{FailureReason, ResolutionFailure, ResolutionFailureTracker};
use crate::graph::{DependencyGraph, NodeId};
use crate::graph_builder::DependencyGraphBuilder;
use crate::job::CycleId;
use crate::result::{CycleStats, ResultEntry, ResultListener, ResultOutcome, ViewResultModel};
use crate::scheduler::{Canceller, ExecutionFailure, ExecutionOutcome, ExecutionRequest, JobScheduler, NodeStatus};
use crate::value::ValueRequirement;

// =============================================================================
// VIEW DEFINITION
// =============================================================================

/// A named set of top-level requirements.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ViewDefinition {
    /// View name.
    pub name: String,
    /// Requested values, in result order.
    pub requirements: Vec<ValueRequirement>,
}

impl ViewDefinition {
    /// Creates an empty view.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requirements: Vec::new(),
        }
    }

    /// Adds a requirement.
    pub fn with_requirement(mut self, requirement: ValueRequirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    /// Adds requirements.
    pub fn with_requirements(mut self, requirements: impl IntoIterator<Item = ValueRequirement>) -> Self {
        self.requirements.extend(requirements);
        self
    }
}

/// A view compiled against one repository version.
#[derive(Debug)]
pub struct CompiledView {
    /// The definition it was compiled from.
    pub definition: ViewDefinition,
    /// The graph.
    pub graph: Arc<DependencyGraph>,
    /// Requirements that did not resolve.
    pub failures: ResolutionFailureTracker,
    /// Repository version at compile time.
    pub repository_version: u64,
}

// =============================================================================
// COORDINATOR
// =============================================================================

#[derive(Default)]
struct CycleState {
    /// Nodes that failed in the last cycle that touched them.
    failed: HashMap<NodeId, ExecutionFailure>,
    /// Changes drained from the feed but not yet applied by a completed cycle.
    pending_changes: HashSet<MarketDataKey>,
}

/// Drives cycles of a single view.
pub struct CycleCoordinator {
    view: RwLock<ViewDefinition>,
    builder: DependencyGraphBuilder,
    scheduler: Arc<JobScheduler>,
    market_data: Arc<dyn MarketDataProvider>,
    config: CycleConfig,

    compiled: RwLock<Option<Arc<CompiledView>>>,
    state: tokio::sync::Mutex<CycleState>,
    current: Mutex<Option<Canceller>>,
    rebuild_requested: AtomicBool,

    listeners: RwLock<Vec<Arc<dyn ResultListener>>>,
    results_tx: broadcast::Sender<Arc<ViewResultModel>>,
    last_result: RwLock<Option<Arc<ViewResultModel>>>,
    cycles_completed: AtomicU64,
}

impl CycleCoordinator {
    /// Creates a coordinator. Nothing is compiled until the first cycle.
    pub fn new(
        view: ViewDefinition,
        builder: DependencyGraphBuilder,
        scheduler: Arc<JobScheduler>,
        market_data: Arc<dyn MarketDataProvider>,
        config: CycleConfig,
    ) -> Self {
        let (results_tx, _) = broadcast::channel(config.result_channel_capacity.max(1));
        Self {
            view: RwLock::new(view),
            builder,
            scheduler,
            market_data,
            config,
            compiled: RwLock::new(None),
            state: tokio::sync::Mutex::new(CycleState::default()),
            current: Mutex::new(None),
            rebuild_requested: AtomicBool::new(false),
            listeners: RwLock::new(Vec::new()),
            results_tx,
            last_result: RwLock::new(None),
            cycles_completed: AtomicU64::new(0),
        }
    }

    // ----- view management -----

    /// Current view definition.
    pub fn view(&self) -> ViewDefinition {
        self.view.read().clone()
    }

    /// Replaces the view; the next cycle rebuilds the graph.
    pub fn set_view(&self, view: ViewDefinition) {
        info!(view = %view.name, requirements = view.requirements.len(), "view definition replaced");
        *self.view.write() = view;
        self.request_rebuild();
    }

    /// Forces a graph rebuild on the next cycle.
    pub fn request_rebuild(&self) {
        self.rebuild_requested.store(true, Ordering::SeqCst);
    }

    /// The compiled view, once the first cycle has run.
    pub fn compiled(&self) -> Option<Arc<CompiledView>> {
        self.compiled.read().clone()
    }

    /// The current graph.
    pub fn graph(&self) -> Option<Arc<DependencyGraph>> {
        self.compiled().map(|c| Arc::clone(&c.graph))
    }

    /// Resolution failures of the current graph, for diagnostics.
    pub fn resolution_failures(&self) -> Option<ResolutionFailureTracker> {
        self.compiled().map(|c| c.failures.clone())
    }

    fn needs_rebuild(&self) -> bool {
        match self.compiled.read().as_ref() {
            None => true,
            Some(compiled) => {
                self.rebuild_requested.load(Ordering::SeqCst)
                    || compiled.repository_version != self.builder.repository().version()
            }
        }
    }

    fn compile(&self) -> Arc<CompiledView> {
        self.rebuild_requested.store(false, Ordering::SeqCst);
        let definition = self.view();
        let output = self.builder.build(&definition.requirements);
        if !output.is_complete() {
            warn!(
                view = %definition.name,
                unresolved = output.failures.len(),
                "view compiled with unresolved requirements"
            );
        }
        let compiled = Arc::new(CompiledView {
            definition,
            graph: Arc::new(output.graph),
            failures: output.failures,
            repository_version: output.repository_version,
        });
        *self.compiled.write() = Some(Arc::clone(&compiled));
        compiled
    }

    // ----- results -----

    /// Registers a push listener.
    pub fn add_listener(&self, listener: Arc<dyn ResultListener>) {
        self.listeners.write().push(listener);
    }

    /// Subscribes to results.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ViewResultModel>> {
        self.results_tx.subscribe()
    }

    /// Most recent published result.
    pub fn last_result(&self) -> Option<Arc<ViewResultModel>> {
        self.last_result.read().clone()
    }

    /// Completed (published) cycles.
    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Relaxed)
    }

    /// Cancels the running cycle, if any.
    pub fn cancel_current(&self) -> bool {
        match self.current.lock().as_ref() {
            Some(canceller) => {
                canceller.cancel();
                true
            }
            None => false,
        }
    }

    // ----- cycles -----

    /// Runs one cycle and publishes its result.
    ///
    /// Returns `None` when the cycle was cancelled; nothing is published then.
    pub async fn run_cycle(&self) -> EngineResult<Option<Arc<ViewResultModel>>> {
        let Some(model) = self.execute_cycle().await? else {
            return Ok(None);
        };
        let model = Arc::new(model);

        *self.last_result.write() = Some(Arc::clone(&model));
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        let listeners: Vec<Arc<dyn ResultListener>> = self.listeners.read().clone();
        for listener in listeners {
            listener.on_result(&model).await;
        }
        // No subscribers is fine.
        let _ = self.results_tx.send(Arc::clone(&model));
        Ok(Some(model))
    }

    async fn execute_cycle(&self) -> EngineResult<Option<ViewResultModel>> {
        let mut state = self.state.lock().await;
        let started_at = Utc::now();
        let cycle_id = CycleId::new();

        let rebuilt = self.needs_rebuild();
        let compiled = if rebuilt {
            state.failed.clear();
            self.compile()
        } else {
            match self.compiled() {
                Some(compiled) => compiled,
                None => self.compile(),
            }
        };
        let graph = Arc::clone(&compiled.graph);

        let mut changed = std::mem::take(&mut state.pending_changes);
        changed.extend(self.market_data.changed_keys());
        let snapshot = self.market_data.snapshot();

        let (scope, pre_failed) = if rebuilt {
            (graph.node_ids().collect::<HashSet<_>>(), HashMap::new())
        } else {
            self.plan_incremental(&graph, &changed, &state.failed)
        };

        // Scoped outputs stay cached until overwritten; other views may be reading them.
        debug!(
            view = %compiled.definition.name,
            cycle = %cycle_id,
            rebuilt,
            changed = changed.len(),
            scope = scope.len(),
            "cycle starting"
        );

        let request = ExecutionRequest::full(cycle_id, Arc::clone(&graph), snapshot)
            .with_nodes(scope)
            .with_pre_failed(pre_failed);
        let handle = self.scheduler.submit(request);
        *self.current.lock() = Some(handle.canceller());
        let outcome = handle.wait().await;
        *self.current.lock() = None;
        let outcome = outcome?;

        if outcome.cancelled {
            // Reapply these changes next time.
            state.pending_changes = changed;
            info!(view = %compiled.definition.name, cycle = %cycle_id, "cycle cancelled");
            return Ok(None);
        }

        for (node, status) in &outcome.statuses {
            if *status == NodeStatus::Done {
                state.failed.remove(node);
            }
        }
        for (node, failure) in &outcome.failures {
            state.failed.insert(*node, failure.clone());
        }

        let reused = graph
            .nodes()
            .filter(|n| !n.is_market_data() && !outcome.statuses.contains_key(&n.id()))
            .count();
        let stats = CycleStats {
            executed: outcome.executed(),
            reused,
            market_data_changes: changed.len(),
            graph_rebuilt: rebuilt,
            jobs: outcome.jobs,
        };
        let entries = self.assemble(&compiled, &outcome, &state.failed);

        info!(
            view = %compiled.definition.name,
            cycle = %cycle_id,
            executed = stats.executed,
            reused = stats.reused,
            failed = outcome.failures.len(),
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "cycle complete"
        );

        Ok(Some(ViewResultModel {
            view: compiled.definition.name.clone(),
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            entries,
            stats,
        }))
    }

    /// Nodes to recompute after market data changes, and nodes to hold failed.
    fn plan_incremental(
        &self,
        graph: &DependencyGraph,
        changed: &HashSet<MarketDataKey>,
        failed: &HashMap<NodeId, ExecutionFailure>,
    ) -> (HashSet<NodeId>, HashMap<NodeId, ExecutionFailure>) {
        let changed_leaves: Vec<NodeId> = changed.iter().filter_map(|k| graph.market_data_node(k)).collect();
        let mut scope = graph.downstream_of(changed_leaves);

        let mut pre_failed = HashMap::new();
        if self.config.retry_failed_nodes {
            scope.extend(graph.downstream_of(failed.keys().copied()));
        } else {
            for (node, failure) in failed {
                if !scope.contains(node) {
                    pre_failed.insert(*node, failure.clone());
                }
            }
        }

        // Terminal values evicted from the cache.
        let cache = self.scheduler.cache();
        for (_, spec) in graph.terminal_outputs() {
            if let Some(producer) = graph.producer_of(spec) {
                if !cache.contains(spec) && !pre_failed.contains_key(&producer) {
                    scope.insert(producer);
                }
            }
        }
        (scope, pre_failed)
    }

    fn assemble(
        &self,
        compiled: &CompiledView,
        outcome: &ExecutionOutcome,
        failed: &HashMap<NodeId, ExecutionFailure>,
    ) -> Vec<ResultEntry> {
        let cache = self.scheduler.cache();
        compiled
            .definition
            .requirements
            .iter()
            .map(|requirement| {
                let result = match (compiled.failures.find(requirement), compiled.graph.terminal_output(requirement)) {
                    (Some(failure), _) => ResultOutcome::Unresolved {
                        failure: failure.clone(),
                    },
                    (None, None) => ResultOutcome::Unresolved {
                        failure: ResolutionFailure::new(requirement.clone(), FailureReason::NoProvider),
                    },
                    (None, Some(spec)) => {
                        let failure = compiled
                            .graph
                            .producer_of(spec)
                            .and_then(|p| outcome.failure(p).or_else(|| failed.get(&p)))
                            .cloned();
                        match (failure, cache.get(spec)) {
                            (Some(failure), _) => ResultOutcome::Failed {
                                specification: spec.clone(),
                                failure,
                            },
                            (None, Some(value)) => ResultOutcome::Value {
                                specification: spec.clone(),
                                value,
                            },
                            (None, None) => ResultOutcome::Failed {
                                specification: spec.clone(),
                                failure: ExecutionFailure::MissingOutput {
                                    specification: spec.clone(),
                                },
                            },
                        }
                    }
                };
                ResultEntry {
                    requirement: requirement.clone(),
                    outcome: result,
                }
            })
            .collect()
    }

    /// Whether a cycle should run now.
    async fn is_due(&self) -> bool {
        let mut state = self.state.lock().await;
        state.pending_changes.extend(self.market_data.changed_keys());
        !state.pending_changes.is_empty() || self.needs_rebuild() || self.last_result().is_none()
    }

    /// Runs cycles on the configured interval until shutdown.
    ///
    /// A tick runs a cycle when market data changed, a rebuild is due, or no
    /// cycle has completed yet.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.min_cycle_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(view = %self.view.read().name, interval = ?self.config.min_cycle_interval(), "cycle loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.is_due().await {
                        if let Err(e) = self.run_cycle().await {
                            warn!(error = %e, "cycle failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!(view = %self.view.read().name, "cycle loop stopping");
                    break;
                }
            }
        }
    }
}
