//! Job scheduler: executes a dependency graph on a worker pool.
//!
//! One control task per execution owns every node status and the inputs each
//! pending node still awaits. Dispatch tasks acquire a worker, run the job
//! under a deadline and hand the outcome back over a channel; they never touch
//! scheduler state.
//! Completed values are written to the shared [`ComputationCache`] by the
//! control task before any dependent is released, so a node never reads an
//! input that is not yet visible. Entries are only ever overwritten; an input
//! that has vanished from the cache by dispatch time (another execution or a
//! caller removed it) is recomputed once before its consumer gives up.
//!
//! Node lifecycle: `Pending → Ready → Dispatched → Done | Failed`. Market data
//! leaves go straight from `Ready` to `Done` by reading the snapshot.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use trellis_traits::config::SchedulerConfig;
use trellis_traits::ids::{JobId, MarketDataKey, WorkerId};
use trellis_traits::market_data::MarketDataSnapshot;

use crate::cache::ComputationCache;
use crate::error::{EngineError, EngineResult};
use crate::graph::{DependencyGraph, NodeId};
use crate::job::{CalculationJob, CalculationJobItem, CalculationJobResult, CycleId, JobItemOutcome};
use crate::value::{ComputedValue, ValueSpecification};
use crate::worker::WorkerPool;

// =============================================================================
// STATUS AND FAILURES
// =============================================================================

/// Execution state of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Waiting on at least one input.
    Pending,
    /// All inputs available; eligible for a job.
    Ready,
    /// Sent to a worker.
    Dispatched,
    /// Outputs cached.
    Done,
    /// Will not produce outputs this cycle.
    Failed,
}

impl NodeStatus {
    /// Whether the status is final for the execution.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Why a node failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionFailure {
    /// The function raised an error.
    FunctionFailed {
        /// Error message.
        message: String,
    },
    /// An input node failed.
    UpstreamFailed {
        /// The node that failed first.
        node: NodeId,
    },
    /// The worker or its transport failed.
    WorkerFailed {
        /// Error message.
        message: String,
    },
    /// The job missed its deadline.
    Timeout,
    /// An input value was not available.
    MissingInput {
        /// The missing input.
        specification: ValueSpecification,
    },
    /// The function did not return a promised output.
    MissingOutput {
        /// The missing output.
        specification: ValueSpecification,
    },
    /// The snapshot has no value for a market data leaf.
    MissingMarketData {
        /// The absent key.
        key: MarketDataKey,
    },
    /// The execution was cancelled.
    Cancelled,
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FunctionFailed { message } => write!(f, "function failed: {}", message),
            Self::UpstreamFailed { node } => write!(f, "upstream {} failed", node),
            Self::WorkerFailed { message } => write!(f, "worker failed: {}", message),
            Self::Timeout => write!(f, "job timed out"),
            Self::MissingInput { specification } => write!(f, "missing input {}", specification),
            Self::MissingOutput { specification } => write!(f, "missing output {}", specification),
            Self::MissingMarketData { key } => write!(f, "no market data for {}", key),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

// =============================================================================
// REQUEST / OUTCOME
// =============================================================================

/// One execution of (part of) a graph.
#[derive(Clone)]
pub struct ExecutionRequest {
    /// Cycle the execution belongs to.
    pub cycle_id: CycleId,
    /// Graph to execute.
    pub graph: Arc<DependencyGraph>,
    /// Nodes to (re)compute. Producers of uncached inputs are added automatically.
    pub nodes: HashSet<NodeId>,
    /// Nodes treated as failed without running.
    pub pre_failed: HashMap<NodeId, ExecutionFailure>,
    /// Market data read by market data leaves.
    pub snapshot: Arc<dyn MarketDataSnapshot>,
}

impl ExecutionRequest {
    /// Request to compute every node of the graph.
    pub fn full(cycle_id: CycleId, graph: Arc<DependencyGraph>, snapshot: Arc<dyn MarketDataSnapshot>) -> Self {
        let nodes = graph.node_ids().collect();
        Self {
            cycle_id,
            graph,
            nodes,
            pre_failed: HashMap::new(),
            snapshot,
        }
    }

    /// Restricts the request to the given nodes.
    pub fn with_nodes(mut self, nodes: impl IntoIterator<Item = NodeId>) -> Self {
        self.nodes = nodes.into_iter().collect();
        self
    }

    /// Marks nodes as failed up front.
    pub fn with_pre_failed(mut self, pre_failed: HashMap<NodeId, ExecutionFailure>) -> Self {
        self.pre_failed = pre_failed;
        self
    }
}

/// A node computed by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    /// Node computed.
    pub node: NodeId,
    /// Job that carried it.
    pub job_id: JobId,
    /// Worker that ran it.
    pub worker_id: WorkerId,
    /// Dispatch attempt that succeeded.
    pub attempt: u32,
    /// Worker-side duration of the whole job.
    pub duration: Duration,
    /// When the result was applied.
    pub completed_at: DateTime<Utc>,
}

/// Outcome of an execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// Final status of every node in scope.
    pub statuses: HashMap<NodeId, NodeStatus>,
    /// Failures by node.
    pub failures: HashMap<NodeId, ExecutionFailure>,
    /// Nodes sent to a worker at least once.
    pub dispatched: BTreeSet<NodeId>,
    /// Market data leaves read from the snapshot.
    pub market_data_sourced: usize,
    /// Jobs dispatched, retries included.
    pub jobs: usize,
    /// Successfully computed nodes in completion order.
    pub log: Vec<ExecutionLogEntry>,
    /// Whether the execution was cancelled.
    pub cancelled: bool,
    /// Wall time.
    pub elapsed: Duration,
}

impl ExecutionOutcome {
    /// Status of a node; `None` for nodes outside the scope.
    pub fn status(&self, node: NodeId) -> Option<NodeStatus> {
        self.statuses.get(&node).copied()
    }

    /// Failure of a node.
    pub fn failure(&self, node: NodeId) -> Option<&ExecutionFailure> {
        self.failures.get(&node)
    }

    /// Whether no node failed.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    /// Number of nodes computed by workers.
    pub fn executed(&self) -> usize {
        self.log.len()
    }
}

/// Handle on a running execution.
pub struct ExecutionHandle {
    cycle_id: CycleId,
    cancel: Arc<watch::Sender<bool>>,
    done: oneshot::Receiver<ExecutionOutcome>,
}

impl ExecutionHandle {
    /// Cycle of the execution.
    pub fn cycle_id(&self) -> CycleId {
        self.cycle_id
    }

    /// A cancel switch usable after the handle is consumed by [`wait`](Self::wait).
    pub fn canceller(&self) -> Canceller {
        Canceller(Arc::clone(&self.cancel))
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Waits for the outcome.
    pub async fn wait(self) -> EngineResult<ExecutionOutcome> {
        self.done
            .await
            .map_err(|_| EngineError::Internal("scheduler task ended without an outcome".into()))
    }
}

/// Cancels an execution.
#[derive(Clone)]
pub struct Canceller(Arc<watch::Sender<bool>>);

impl Canceller {
    /// Requests cancellation.
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

// =============================================================================
// SCHEDULER
// =============================================================================

/// Executes graphs on a shared worker pool and cache.
pub struct JobScheduler {
    pool: Arc<WorkerPool>,
    cache: Arc<ComputationCache>,
    config: SchedulerConfig,
    next_job: Arc<AtomicU64>,
}

impl JobScheduler {
    /// Creates a scheduler.
    pub fn new(pool: Arc<WorkerPool>, cache: Arc<ComputationCache>, config: SchedulerConfig) -> Self {
        Self {
            pool,
            cache,
            config,
            next_job: Arc::new(AtomicU64::new(1)),
        }
    }

    /// The worker pool.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// The cache results are written to.
    pub fn cache(&self) -> &Arc<ComputationCache> {
        &self.cache
    }

    /// Configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Starts an execution on its own control task.
    pub fn submit(&self, request: ExecutionRequest) -> ExecutionHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();
        let cycle_id = request.cycle_id;

        let execution = Execution::plan(
            request,
            Arc::clone(&self.pool),
            Arc::clone(&self.cache),
            self.config.clone(),
            Arc::clone(&self.next_job),
        );
        tokio::spawn(async move {
            let outcome = execution.run(cancel_rx).await;
            let _ = done_tx.send(outcome);
        });

        ExecutionHandle {
            cycle_id,
            cancel: Arc::new(cancel_tx),
            done: done_rx,
        }
    }

    /// Runs an execution to completion.
    pub async fn execute(&self, request: ExecutionRequest) -> EngineResult<ExecutionOutcome> {
        self.submit(request).wait().await
    }
}

// =============================================================================
// CONTROL LOOP
// =============================================================================

enum DispatchOutcome {
    Completed(CalculationJobResult),
    WorkerFailed { worker_id: WorkerId, message: String },
    TimedOut { worker_id: WorkerId },
    NoWorker(String),
}

struct DispatchMessage {
    job_id: JobId,
    outcome: DispatchOutcome,
}

struct InFlightJob {
    nodes: Vec<NodeId>,
    attempt: u32,
}

struct Execution {
    cycle_id: CycleId,
    graph: Arc<DependencyGraph>,
    snapshot: Arc<dyn MarketDataSnapshot>,
    cache: Arc<ComputationCache>,
    pool: Arc<WorkerPool>,
    config: SchedulerConfig,
    next_job: Arc<AtomicU64>,
    results_tx: mpsc::UnboundedSender<DispatchMessage>,
    results_rx: mpsc::UnboundedReceiver<DispatchMessage>,

    statuses: HashMap<NodeId, NodeStatus>,
    /// In-scope producers each pending node still waits on.
    pending: HashMap<NodeId, HashSet<NodeId>>,
    ready: BTreeSet<NodeId>,
    in_flight: HashMap<JobId, InFlightJob>,
    /// Producers re-enlisted because their output went missing.
    recomputed: HashSet<NodeId>,
    outcome: ExecutionOutcome,
}

impl Execution {
    /// Computes the scope and initial readiness.
    fn plan(
        request: ExecutionRequest,
        pool: Arc<WorkerPool>,
        cache: Arc<ComputationCache>,
        config: SchedulerConfig,
        next_job: Arc<AtomicU64>,
    ) -> Self {
        let ExecutionRequest {
            cycle_id,
            graph,
            nodes,
            pre_failed,
            snapshot,
        } = request;

        // Scope: requested nodes plus producers of inputs missing from the cache
        // or held failed, so a stale value of a failed node is never read.
        let mut scope: BTreeSet<NodeId> = nodes.into_iter().filter(|id| graph.node(*id).is_some()).collect();
        let mut stack: Vec<NodeId> = scope.iter().copied().collect();
        while let Some(id) = stack.pop() {
            if pre_failed.contains_key(&id) {
                continue;
            }
            let Some(node) = graph.node(id) else { continue };
            for input in node.inputs() {
                if let Some(producer) = graph.producer_of(input) {
                    let held_failed = pre_failed.contains_key(&producer);
                    if !scope.contains(&producer) && (held_failed || !cache.contains(input)) {
                        scope.insert(producer);
                        stack.push(producer);
                    }
                }
            }
        }

        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let mut execution = Self {
            cycle_id,
            graph: Arc::clone(&graph),
            snapshot,
            cache,
            pool,
            config,
            next_job,
            results_tx,
            results_rx,
            statuses: scope.iter().map(|id| (*id, NodeStatus::Pending)).collect(),
            pending: HashMap::new(),
            ready: BTreeSet::new(),
            in_flight: HashMap::new(),
            recomputed: HashSet::new(),
            outcome: ExecutionOutcome::default(),
        };

        let mut pre_failed: Vec<(NodeId, ExecutionFailure)> = pre_failed.into_iter().collect();
        pre_failed.sort_by_key(|(id, _)| *id);
        for (id, failure) in pre_failed {
            if scope.contains(&id) {
                execution.fail(id, failure);
            }
        }

        for &id in &scope {
            if execution.statuses.get(&id) != Some(&NodeStatus::Pending) {
                continue;
            }
            let waiting: HashSet<NodeId> = graph.inputs_of(id).into_iter().filter(|p| scope.contains(p)).collect();
            if waiting.is_empty() {
                execution.statuses.insert(id, NodeStatus::Ready);
                execution.ready.insert(id);
            } else {
                execution.pending.insert(id, waiting);
            }
        }

        debug!(
            cycle = %cycle_id,
            scope = scope.len(),
            ready = execution.ready.len(),
            "execution planned"
        );
        execution
    }

    async fn run(mut self, mut cancel: watch::Receiver<bool>) -> ExecutionOutcome {
        let start = Instant::now();
        let mut cancel_open = true;

        loop {
            if *cancel.borrow() {
                self.outcome.cancelled = true;
                break;
            }
            self.dispatch_ready();
            if self.in_flight.is_empty() {
                break;
            }

            tokio::select! {
                changed = cancel.changed(), if cancel_open => {
                    if changed.is_err() {
                        cancel_open = false;
                    }
                }
                Some(message) = self.results_rx.recv() => self.on_message(message),
            }
        }

        if self.outcome.cancelled {
            info!(cycle = %self.cycle_id, in_flight = self.in_flight.len(), "execution cancelled");
            self.fail_remaining(|_| ExecutionFailure::Cancelled);
        } else {
            let graph = Arc::clone(&self.graph);
            self.fail_remaining(|id| match graph.node(id).and_then(|n| n.inputs().first().cloned()) {
                Some(specification) => ExecutionFailure::MissingInput { specification },
                None => ExecutionFailure::Cancelled,
            });
        }

        self.outcome.statuses = std::mem::take(&mut self.statuses);
        self.outcome.elapsed = start.elapsed();
        debug!(
            cycle = %self.cycle_id,
            executed = self.outcome.executed(),
            failed = self.outcome.failures.len(),
            jobs = self.outcome.jobs,
            "execution finished"
        );
        self.outcome
    }

    fn fail_remaining(&mut self, failure: impl Fn(NodeId) -> ExecutionFailure) {
        let mut open: Vec<NodeId> = self
            .statuses
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        open.sort();
        for id in open {
            self.statuses.insert(id, NodeStatus::Failed);
            self.outcome.failures.insert(id, failure(id));
        }
        self.ready.clear();
    }

    // ----- dispatch -----

    fn dispatch_ready(&mut self) {
        let graph = Arc::clone(&self.graph);
        while !self.ready.is_empty() {
            let ready = std::mem::take(&mut self.ready);
            let mut batch = Vec::new();
            for id in ready {
                let Some(node) = graph.node(id) else { continue };
                match (node.market_data_key(), node.outputs().first()) {
                    (Some(key), Some(output)) => self.source_market_data(id, key, output),
                    _ => batch.push(id),
                }
            }
            let size = self.config.max_job_items.max(1);
            for chunk in batch.chunks(size) {
                self.dispatch(chunk.to_vec(), 1, None);
            }
        }
    }

    fn source_market_data(&mut self, id: NodeId, key: &MarketDataKey, output: &ValueSpecification) {
        match self.snapshot.current_value(key) {
            Some(value) => {
                self.cache.put_for_cycle(output.clone(), value, Some(self.cycle_id));
                self.outcome.market_data_sourced += 1;
                self.complete(id);
            }
            None => self.fail(id, ExecutionFailure::MissingMarketData { key: key.clone() }),
        }
    }

    fn dispatch(&mut self, nodes: Vec<NodeId>, attempt: u32, avoid: Option<WorkerId>) {
        let graph = Arc::clone(&self.graph);
        let mut items = Vec::with_capacity(nodes.len());
        let mut inputs: Vec<ComputedValue> = Vec::new();
        let mut shipped: HashSet<ValueSpecification> = HashSet::new();

        for id in nodes {
            let Some(node) = graph.node(id) else { continue };
            let mut missing = None;
            let mut values = Vec::new();
            for spec in node.inputs() {
                if shipped.contains(spec) {
                    continue;
                }
                match self.cache.get(spec) {
                    Some(value) => values.push(ComputedValue::new(spec.clone(), value)),
                    None => {
                        missing = Some(spec.clone());
                        break;
                    }
                }
            }
            if let Some(specification) = missing {
                if !self.recompute_input(id, &specification) {
                    self.fail(id, ExecutionFailure::MissingInput { specification });
                }
                continue;
            }
            for value in values {
                shipped.insert(value.specification.clone());
                inputs.push(value);
            }
            items.push(CalculationJobItem {
                node: id,
                function_id: node.function_id(),
                target: node.target().clone(),
                inputs: node.inputs().to_vec(),
                outputs: node.outputs().to_vec(),
            });
            self.statuses.insert(id, NodeStatus::Dispatched);
            self.outcome.dispatched.insert(id);
        }

        if items.is_empty() {
            return;
        }

        let job = CalculationJob {
            id: JobId::new(self.next_job.fetch_add(1, Ordering::Relaxed)),
            cycle_id: self.cycle_id,
            attempt,
            items,
            inputs,
        };
        let job_id = job.id;
        debug!(cycle = %self.cycle_id, job = %job_id, items = job.len(), attempt, "dispatching job");

        self.in_flight.insert(
            job_id,
            InFlightJob {
                nodes: job.nodes(),
                attempt,
            },
        );
        self.outcome.jobs += 1;

        let pool = Arc::clone(&self.pool);
        let deadline = self.config.job_timeout();
        let tx = self.results_tx.clone();
        tokio::spawn(async move {
            let outcome = match pool.acquire(avoid.as_ref()).await {
                Ok(lease) => {
                    let worker = Arc::clone(lease.worker());
                    let worker_id = lease.worker_id().clone();
                    match tokio::time::timeout(deadline, worker.execute_leased(job, lease)).await {
                        Ok(Ok(result)) => DispatchOutcome::Completed(result),
                        Ok(Err(e)) => DispatchOutcome::WorkerFailed {
                            worker_id,
                            message: e.to_string(),
                        },
                        Err(_) => DispatchOutcome::TimedOut { worker_id },
                    }
                }
                Err(e) => DispatchOutcome::NoWorker(e.to_string()),
            };
            // The control task may be gone after cancellation.
            let _ = tx.send(DispatchMessage { job_id, outcome });
        });
    }

    // ----- results -----

    fn on_message(&mut self, message: DispatchMessage) {
        let Some(flight) = self.in_flight.remove(&message.job_id) else {
            debug!(job = %message.job_id, "ignoring result for unknown job");
            return;
        };
        match message.outcome {
            DispatchOutcome::Completed(result) => self.apply_result(flight, result),
            DispatchOutcome::WorkerFailed { worker_id, message: error } => {
                warn!(job = %message.job_id, worker = %worker_id, error = %error, "job failed on worker");
                self.retry_or_fail(flight, worker_id, ExecutionFailure::WorkerFailed { message: error });
            }
            DispatchOutcome::TimedOut { worker_id } => {
                warn!(job = %message.job_id, worker = %worker_id, "job timed out");
                self.retry_or_fail(flight, worker_id, ExecutionFailure::Timeout);
            }
            DispatchOutcome::NoWorker(error) => {
                for node in flight.nodes {
                    self.fail(node, ExecutionFailure::WorkerFailed { message: error.clone() });
                }
            }
        }
    }

    fn retry_or_fail(&mut self, flight: InFlightJob, worker_id: WorkerId, failure: ExecutionFailure) {
        if flight.attempt < self.config.max_dispatch_attempts {
            debug!(nodes = flight.nodes.len(), attempt = flight.attempt + 1, avoid = %worker_id, "retrying job");
            self.dispatch(flight.nodes, flight.attempt + 1, Some(worker_id));
        } else {
            for node in flight.nodes {
                self.fail(node, failure.clone());
            }
        }
    }

    fn apply_result(&mut self, flight: InFlightJob, result: CalculationJobResult) {
        let graph = Arc::clone(&self.graph);
        let expected: HashSet<NodeId> = flight.nodes.iter().copied().collect();
        let mut seen = HashSet::new();

        for item in result.items {
            if !expected.contains(&item.node) || !seen.insert(item.node) {
                debug!(job = %result.job_id, node = %item.node, "ignoring unexpected item result");
                continue;
            }
            match item.outcome {
                JobItemOutcome::Success { values } => {
                    let Some(node) = graph.node(item.node) else { continue };
                    let returned: HashMap<&ValueSpecification, &ComputedValue> =
                        values.iter().map(|v| (&v.specification, v)).collect();
                    if let Some(missing) = node.outputs().iter().find(|o| !returned.contains_key(o)) {
                        self.fail(
                            item.node,
                            ExecutionFailure::MissingOutput {
                                specification: missing.clone(),
                            },
                        );
                        continue;
                    }
                    for output in node.outputs() {
                        if let Some(value) = returned.get(output) {
                            self.cache
                                .put_for_cycle(output.clone(), value.value.clone(), Some(self.cycle_id));
                        }
                    }
                    self.outcome.log.push(ExecutionLogEntry {
                        node: item.node,
                        job_id: result.job_id,
                        worker_id: result.worker_id.clone(),
                        attempt: flight.attempt,
                        duration: result.duration,
                        completed_at: Utc::now(),
                    });
                    self.complete(item.node);
                }
                JobItemOutcome::FunctionFailed { message } => {
                    self.fail(item.node, ExecutionFailure::FunctionFailed { message });
                }
                JobItemOutcome::MissingInput { specification } => {
                    self.fail(item.node, ExecutionFailure::MissingInput { specification });
                }
                JobItemOutcome::UnknownFunction { function_id } => {
                    self.fail(
                        item.node,
                        ExecutionFailure::FunctionFailed {
                            message: format!("unknown function {}", function_id),
                        },
                    );
                }
            }
        }

        for node in flight.nodes {
            if !seen.contains(&node) {
                self.fail(
                    node,
                    ExecutionFailure::WorkerFailed {
                        message: format!("no result for {}", node),
                    },
                );
            }
        }
    }

    // ----- state transitions -----

    /// Puts `id` back to waiting on the producer of a missing input.
    ///
    /// Returns false when the input has no producer in the graph or was already
    /// recomputed once in this execution.
    fn recompute_input(&mut self, id: NodeId, specification: &ValueSpecification) -> bool {
        let Some(producer) = self.graph.producer_of(specification) else {
            return false;
        };
        if self.statuses.get(&producer) == Some(&NodeStatus::Failed) || !self.recomputed.insert(producer) {
            return false;
        }
        debug!(node = %id, input = %specification, producer = %producer, "input missing from cache, recomputing");
        self.statuses.insert(id, NodeStatus::Pending);
        self.pending.insert(id, HashSet::from([producer]));
        self.enlist(producer);
        true
    }

    /// Adds a node to the execution, together with producers of its uncached inputs.
    fn enlist(&mut self, id: NodeId) {
        let graph = Arc::clone(&self.graph);
        let Some(node) = graph.node(id) else { return };
        self.statuses.insert(id, NodeStatus::Pending);

        let mut waiting = HashSet::new();
        let mut failed_input = None;
        for input in node.inputs() {
            let Some(producer) = graph.producer_of(input) else { continue };
            match self.statuses.get(&producer) {
                Some(NodeStatus::Failed) => failed_input = Some(producer),
                Some(NodeStatus::Done) => {}
                Some(_) => {
                    waiting.insert(producer);
                }
                None if self.cache.contains(input) => {}
                None => {
                    self.enlist(producer);
                    match self.statuses.get(&producer) {
                        Some(NodeStatus::Failed) => failed_input = Some(producer),
                        Some(NodeStatus::Done) => {}
                        _ => {
                            waiting.insert(producer);
                        }
                    }
                }
            }
        }

        if let Some(producer) = failed_input {
            self.fail(id, ExecutionFailure::UpstreamFailed { node: producer });
        } else if waiting.is_empty() {
            self.statuses.insert(id, NodeStatus::Ready);
            self.ready.insert(id);
        } else {
            self.pending.insert(id, waiting);
        }
    }

    fn complete(&mut self, id: NodeId) {
        self.statuses.insert(id, NodeStatus::Done);
        for dependent in self.graph.dependents_of(id) {
            if self.statuses.get(&dependent) != Some(&NodeStatus::Pending) {
                continue;
            }
            let released = match self.pending.get_mut(&dependent) {
                Some(waiting) => {
                    waiting.remove(&id);
                    waiting.is_empty()
                }
                None => true,
            };
            if released {
                self.pending.remove(&dependent);
                self.statuses.insert(dependent, NodeStatus::Ready);
                self.ready.insert(dependent);
            }
        }
    }

    /// Fails a node and every dependent in scope that has not finished.
    fn fail(&mut self, id: NodeId, failure: ExecutionFailure) {
        debug!(node = %id, failure = %failure, "node failed");
        self.statuses.insert(id, NodeStatus::Failed);
        self.ready.remove(&id);
        self.pending.remove(&id);
        self.outcome.failures.insert(id, failure);

        let mut downstream: Vec<NodeId> = self.graph.downstream_of([id]).into_iter().filter(|d| *d != id).collect();
        downstream.sort();
        for dependent in downstream {
            match self.statuses.get(&dependent) {
                Some(NodeStatus::Pending) | Some(NodeStatus::Ready) => {
                    self.statuses.insert(dependent, NodeStatus::Failed);
                    self.ready.remove(&dependent);
                    self.pending.remove(&dependent);
                    self.outcome
                        .failures
                        .insert(dependent, ExecutionFailure::UpstreamFailed { node: id });
                }
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{FunctionBuilder, FunctionCatalogue, FunctionError};
    use crate::graph_builder::DependencyGraphBuilder;
    use crate::market_data::{FixedMarketDataAvailability, MapSnapshot};
    use crate::repository::{InMemoryFunctionRepository, RegisteredFunction};
    use crate::target::InMemoryTargetResolver;
    use crate::value::{ComputationTarget, ComputationTargetSpecification, ComputationTargetType, ValueRequirement};
    use crate::worker::{CalculationWorker, LocalWorker};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use trellis_traits::value::DataValue;
    use trellis_traits::TraitError;

    fn t() -> ComputationTargetSpecification {
        ComputationTargetSpecification::security("T")
    }

    fn req(name: &str) -> ValueRequirement {
        ValueRequirement::new(name, t())
    }

    /// Sums its named inputs plus a constant.
    fn adder(id: &str, output: &str, inputs: &[&str], constant: f64) -> Arc<dyn crate::function::FunctionDefinition> {
        let names: Vec<String> = inputs.iter().map(|s| s.to_string()).collect();
        FunctionBuilder::new(id, ComputationTargetType::Security)
            .output(output)
            .requires_fixed(inputs.iter().map(|n| req(n)).collect())
            .computes(move |_, values| {
                let mut total = constant;
                for name in &names {
                    total += values.f64_named(name)?;
                }
                Ok(DataValue::Double(total))
            })
            .build_arc()
    }

    fn failing(id: &str, output: &str) -> Arc<dyn crate::function::FunctionDefinition> {
        FunctionBuilder::new(id, ComputationTargetType::Security)
            .output(output)
            .computes(|_, _| Err(FunctionError::Calculation("model blew up".into())))
            .build_arc()
    }

    struct Fixture {
        graph: Arc<DependencyGraph>,
        catalogue: Arc<FunctionCatalogue>,
    }

    fn fixture(functions: Vec<Arc<dyn crate::function::FunctionDefinition>>, roots: &[&str]) -> Fixture {
        let repo = InMemoryFunctionRepository::new();
        for f in &functions {
            repo.register(RegisteredFunction::new(Arc::clone(f))).unwrap();
        }
        let targets = InMemoryTargetResolver::new().with_target(ComputationTarget::new(t()));
        let availability = FixedMarketDataAvailability::new().with("Spot", t(), "T.SPOT");
        let output = DependencyGraphBuilder::new(Arc::new(repo), Arc::new(targets))
            .with_market_data(Arc::new(availability))
            .build(&roots.iter().map(|r| req(r)).collect::<Vec<_>>());
        Fixture {
            graph: Arc::new(output.graph),
            catalogue: Arc::new(FunctionCatalogue::new().with_functions(functions)),
        }
    }

    fn snapshot(spot: Option<f64>) -> Arc<dyn MarketDataSnapshot> {
        let mut values = HashMap::new();
        if let Some(spot) = spot {
            values.insert(MarketDataKey::new("T.SPOT"), DataValue::Double(spot));
        }
        Arc::new(MapSnapshot::new(1, values))
    }

    fn scheduler(workers: Vec<Arc<dyn CalculationWorker>>, cache: Arc<ComputationCache>) -> JobScheduler {
        let mut pool = WorkerPool::new(2);
        for w in workers {
            pool = pool.with_worker(w);
        }
        let config = SchedulerConfig {
            job_timeout_ms: 200,
            ..SchedulerConfig::default()
        };
        JobScheduler::new(Arc::new(pool), cache, config)
    }

    fn node_for(graph: &DependencyGraph, name: &str) -> NodeId {
        let spec = graph.terminal_output(&req(name)).unwrap();
        graph.producer_of(spec).unwrap()
    }

    #[tokio::test]
    async fn test_chain_executes_in_dependency_order() {
        let f = fixture(
            vec![adder("F1", "R1", &["R2"], 1.0), adder("F2", "R2", &["Spot"], 10.0)],
            &["R1"],
        );
        let cache = Arc::new(ComputationCache::new());
        let s = scheduler(vec![Arc::new(LocalWorker::new("w1", Arc::clone(&f.catalogue)))], Arc::clone(&cache));

        let outcome = s
            .execute(ExecutionRequest::full(CycleId::new(), Arc::clone(&f.graph), snapshot(Some(100.0))))
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.executed(), 2);
        assert_eq!(outcome.market_data_sourced, 1);
        let order: Vec<String> = outcome
            .log
            .iter()
            .map(|e| f.graph.node(e.node).unwrap().function_id().to_string())
            .collect();
        assert_eq!(order, vec!["F2", "F1"]);

        let r1 = f.graph.terminal_output(&req("R1")).unwrap();
        assert_eq!(cache.get(r1), Some(DataValue::Double(111.0)));
    }

    #[tokio::test]
    async fn test_failure_propagates_only_downstream() {
        let f = fixture(
            vec![
                adder("Top", "Top", &["Bad"], 0.0),
                failing("Bad", "Bad"),
                adder("Fine", "Fine", &["Spot"], 1.0),
            ],
            &["Top", "Fine"],
        );
        let cache = Arc::new(ComputationCache::new());
        let s = scheduler(vec![Arc::new(LocalWorker::new("w1", Arc::clone(&f.catalogue)))], cache);

        let outcome = s
            .execute(ExecutionRequest::full(CycleId::new(), Arc::clone(&f.graph), snapshot(Some(5.0))))
            .await
            .unwrap();

        let top = node_for(&f.graph, "Top");
        let fine = node_for(&f.graph, "Fine");
        let bad = f.graph.inputs_of(top)[0];

        assert_eq!(outcome.status(fine), Some(NodeStatus::Done));
        assert!(matches!(outcome.failure(bad), Some(ExecutionFailure::FunctionFailed { .. })));
        assert_eq!(outcome.failure(top), Some(&ExecutionFailure::UpstreamFailed { node: bad }));
        // Never dispatched with a missing input.
        assert!(!outcome.dispatched.contains(&top));
    }

    #[tokio::test]
    async fn test_missing_market_data_fails_dependents() {
        let f = fixture(vec![adder("F", "R", &["Spot"], 0.0)], &["R"]);
        let s = scheduler(
            vec![Arc::new(LocalWorker::new("w1", Arc::clone(&f.catalogue)))],
            Arc::new(ComputationCache::new()),
        );
        let outcome = s
            .execute(ExecutionRequest::full(CycleId::new(), Arc::clone(&f.graph), snapshot(None)))
            .await
            .unwrap();

        let r = node_for(&f.graph, "R");
        let spot = f.graph.inputs_of(r)[0];
        assert!(matches!(outcome.failure(spot), Some(ExecutionFailure::MissingMarketData { .. })));
        assert_eq!(outcome.failure(r), Some(&ExecutionFailure::UpstreamFailed { node: spot }));
        assert!(outcome.dispatched.is_empty());
    }

    #[tokio::test]
    async fn test_scope_extends_to_uncached_producers() {
        let f = fixture(
            vec![adder("F1", "R1", &["R2"], 1.0), adder("F2", "R2", &[], 2.0)],
            &["R1"],
        );
        let cache = Arc::new(ComputationCache::new());
        let s = scheduler(vec![Arc::new(LocalWorker::new("w1", Arc::clone(&f.catalogue)))], Arc::clone(&cache));
        let r1 = node_for(&f.graph, "R1");

        // Only R1 requested, R2 not cached: F2 runs too.
        let request = ExecutionRequest::full(CycleId::new(), Arc::clone(&f.graph), snapshot(None)).with_nodes([r1]);
        let outcome = s.execute(request.clone()).await.unwrap();
        assert_eq!(outcome.executed(), 2);

        // Now R2 is cached: only F1 runs.
        let outcome = s.execute(request).await.unwrap();
        assert_eq!(outcome.executed(), 1);
        assert_eq!(outcome.log[0].node, r1);
    }

    #[tokio::test]
    async fn test_pre_failed_nodes_are_not_run() {
        let f = fixture(
            vec![adder("F1", "R1", &["R2"], 1.0), adder("F2", "R2", &[], 2.0)],
            &["R1"],
        );
        let s = scheduler(
            vec![Arc::new(LocalWorker::new("w1", Arc::clone(&f.catalogue)))],
            Arc::new(ComputationCache::new()),
        );
        let r1 = node_for(&f.graph, "R1");
        let r2 = f.graph.inputs_of(r1)[0];
        let pre_failed: HashMap<NodeId, ExecutionFailure> = [(r2, ExecutionFailure::Timeout)].into_iter().collect();

        let outcome = s
            .execute(ExecutionRequest::full(CycleId::new(), Arc::clone(&f.graph), snapshot(None)).with_pre_failed(pre_failed))
            .await
            .unwrap();

        assert_eq!(outcome.failure(r2), Some(&ExecutionFailure::Timeout));
        assert_eq!(outcome.failure(r1), Some(&ExecutionFailure::UpstreamFailed { node: r2 }));
        assert_eq!(outcome.jobs, 0);
    }

    /// Fails every job it sees.
    struct BrokenWorker {
        id: WorkerId,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CalculationWorker for BrokenWorker {
        fn worker_id(&self) -> &WorkerId {
            &self.id
        }

        async fn execute(&self, _job: CalculationJob) -> Result<CalculationJobResult, TraitError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(TraitError::ConnectionFailed("connection reset".into()))
        }
    }

    /// Never answers.
    struct StuckWorker {
        id: WorkerId,
    }

    #[async_trait]
    impl CalculationWorker for StuckWorker {
        fn worker_id(&self) -> &WorkerId {
            &self.id
        }

        async fn execute(&self, _job: CalculationJob) -> Result<CalculationJobResult, TraitError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(TraitError::Timeout)
        }
    }

    #[tokio::test]
    async fn test_worker_failure_retried_on_other_worker() {
        let f = fixture(vec![adder("F", "R", &[], 3.0)], &["R"]);
        let broken = Arc::new(BrokenWorker {
            id: WorkerId::new("broken"),
            calls: AtomicUsize::new(0),
        });
        let s = scheduler(
            vec![
                broken.clone() as Arc<dyn CalculationWorker>,
                Arc::new(LocalWorker::new("good", Arc::clone(&f.catalogue))),
            ],
            Arc::new(ComputationCache::new()),
        );

        // Repeat so the broken worker is hit at least once regardless of selection order.
        for _ in 0..3 {
            s.cache().clear();
            let outcome = s
                .execute(ExecutionRequest::full(CycleId::new(), Arc::clone(&f.graph), snapshot(None)))
                .await
                .unwrap();
            assert!(outcome.is_success());
            assert_eq!(outcome.log[0].worker_id.as_str(), "good");
        }
    }

    #[tokio::test]
    async fn test_repeated_worker_failure_is_terminal() {
        let f = fixture(vec![adder("F", "R", &[], 3.0)], &["R"]);
        let broken = Arc::new(BrokenWorker {
            id: WorkerId::new("broken"),
            calls: AtomicUsize::new(0),
        });
        let s = scheduler(vec![broken.clone() as Arc<dyn CalculationWorker>], Arc::new(ComputationCache::new()));

        let outcome = s
            .execute(ExecutionRequest::full(CycleId::new(), Arc::clone(&f.graph), snapshot(None)))
            .await
            .unwrap();

        let r = node_for(&f.graph, "R");
        assert!(matches!(outcome.failure(r), Some(ExecutionFailure::WorkerFailed { .. })));
        assert_eq!(broken.calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.jobs, 2);
    }

    #[tokio::test]
    async fn test_timeout_then_retry() {
        let f = fixture(vec![adder("F", "R", &[], 3.0)], &["R"]);
        let s = scheduler(
            vec![Arc::new(StuckWorker {
                id: WorkerId::new("stuck"),
            })],
            Arc::new(ComputationCache::new()),
        );

        let outcome = s
            .execute(ExecutionRequest::full(CycleId::new(), Arc::clone(&f.graph), snapshot(None)))
            .await
            .unwrap();
        assert_eq!(outcome.failure(node_for(&f.graph, "R")), Some(&ExecutionFailure::Timeout));
        assert_eq!(outcome.jobs, 2);
    }

    #[tokio::test]
    async fn test_cancel_discards_in_flight_results() {
        let f = fixture(vec![adder("F", "R", &[], 3.0)], &["R"]);
        let cache = Arc::new(ComputationCache::new());
        let s = scheduler(
            vec![Arc::new(StuckWorker {
                id: WorkerId::new("stuck"),
            })],
            Arc::clone(&cache),
        );

        let handle = s.submit(ExecutionRequest::full(CycleId::new(), Arc::clone(&f.graph), snapshot(None)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        let outcome = handle.wait().await.unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.failure(node_for(&f.graph, "R")), Some(&ExecutionFailure::Cancelled));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_held_failed_producer_is_not_read_from_cache() {
        let f = fixture(
            vec![adder("F1", "R1", &["R2"], 1.0), adder("F2", "R2", &[], 2.0)],
            &["R1"],
        );
        let s = scheduler(
            vec![Arc::new(LocalWorker::new("w1", Arc::clone(&f.catalogue)))],
            Arc::new(ComputationCache::new()),
        );
        let full = ExecutionRequest::full(CycleId::new(), Arc::clone(&f.graph), snapshot(None));
        assert!(s.execute(full.clone()).await.unwrap().is_success());

        // R2 still has a cached value, but its node is held failed.
        let r1 = node_for(&f.graph, "R1");
        let r2 = f.graph.inputs_of(r1)[0];
        let request = full
            .with_nodes([r1])
            .with_pre_failed([(r2, ExecutionFailure::Timeout)].into_iter().collect());
        let outcome = s.execute(request).await.unwrap();

        assert_eq!(outcome.failure(r1), Some(&ExecutionFailure::UpstreamFailed { node: r2 }));
        assert_eq!(outcome.jobs, 0);
    }

    #[tokio::test]
    async fn test_input_evicted_before_dispatch_is_recomputed() {
        let cache = Arc::new(ComputationCache::new());
        let evicting = Arc::clone(&cache);
        // Gate drops Base from the cache while Top is waiting on it.
        let gate = FunctionBuilder::new("Gate", ComputationTargetType::Security)
            .output("Gate")
            .computes(move |_, _| {
                evicting.invalidate(|spec, _| spec.value_name == "Base");
                Ok(DataValue::Double(1.0))
            })
            .build_arc();
        let f = fixture(
            vec![adder("Top", "Top", &["Base", "Gate"], 0.0), adder("Base", "Base", &[], 5.0), gate],
            &["Top"],
        );
        let s = scheduler(vec![Arc::new(LocalWorker::new("w1", Arc::clone(&f.catalogue)))], Arc::clone(&cache));
        let full = ExecutionRequest::full(CycleId::new(), Arc::clone(&f.graph), snapshot(None));
        assert!(s.execute(full.clone()).await.unwrap().is_success());

        let top = node_for(&f.graph, "Top");
        let gate = f
            .graph
            .inputs_of(top)
            .into_iter()
            .find(|n| f.graph.node(*n).unwrap().function_id().as_str() == "Gate")
            .unwrap();
        let outcome = s.execute(full.with_nodes([gate, top])).await.unwrap();

        assert!(outcome.is_success(), "{:?}", outcome.failures);
        let ran: Vec<String> = outcome
            .log
            .iter()
            .map(|e| f.graph.node(e.node).unwrap().function_id().to_string())
            .collect();
        assert_eq!(ran, vec!["Gate", "Base", "Top"]);
        let top_spec = f.graph.terminal_output(&req("Top")).unwrap();
        assert_eq!(cache.get(top_spec), Some(DataValue::Double(6.0)));
    }

    #[tokio::test]
    async fn test_timed_out_blocking_work_keeps_its_slot() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let slow = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            FunctionBuilder::new("Slow", ComputationTargetType::Security)
                .output("R")
                .computes(move |_, _| {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(250));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(DataValue::Double(1.0))
                })
                .build_arc()
        };
        let f = fixture(vec![slow], &["R"]);
        let pool = Arc::new(WorkerPool::new(1).with_worker(Arc::new(LocalWorker::new("w1", Arc::clone(&f.catalogue)))));
        let config = SchedulerConfig {
            job_timeout_ms: 50,
            max_dispatch_attempts: 3,
            ..SchedulerConfig::default()
        };
        let s = JobScheduler::new(Arc::clone(&pool), Arc::new(ComputationCache::new()), config);

        let outcome = s
            .execute(ExecutionRequest::full(CycleId::new(), Arc::clone(&f.graph), snapshot(None)))
            .await
            .unwrap();
        assert_eq!(outcome.failure(node_for(&f.graph, "R")), Some(&ExecutionFailure::Timeout));
        assert_eq!(outcome.jobs, 3);

        // The last attempt still runs and still holds the only slot.
        assert_eq!(pool.available(), 0);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(pool.available(), 1);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_independent_nodes_are_batched() {
        let f = fixture(
            vec![
                adder("A", "A", &[], 1.0),
                adder("B", "B", &[], 2.0),
                adder("C", "C", &[], 3.0),
            ],
            &["A", "B", "C"],
        );
        let s = scheduler(
            vec![Arc::new(LocalWorker::new("w1", Arc::clone(&f.catalogue)))],
            Arc::new(ComputationCache::new()),
        );
        let outcome = s
            .execute(ExecutionRequest::full(CycleId::new(), Arc::clone(&f.graph), snapshot(None)))
            .await
            .unwrap();

        assert_eq!(outcome.executed(), 3);
        assert_eq!(outcome.jobs, 1);
    }
}
