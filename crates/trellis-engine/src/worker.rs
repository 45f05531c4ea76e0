//! Calculation workers and the worker pool.
//!
//! - [`CalculationWorker`]: executes jobs; local or behind a transport
//! - [`LocalWorker`]: runs jobs on the blocking thread pool of this process
//! - [`RemoteWorker`]: ships jobs over a [`WorkerConnection`] using a [`Codec`]
//! - [`WorkerEndpoint`]: the receiving side of a remote worker
//! - [`WorkerPool`]: bounded set of workers with least-loaded selection

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use trellis_traits::ids::WorkerId;
use trellis_traits::transport::{Codec, WorkerConnection};
use trellis_traits::TraitError;

use crate::error::{EngineError, EngineResult};
use crate::function::FunctionCatalogue;
use crate::job::{CalculationJob, CalculationJobResult, JobItemOutcome, JobItemResult};

// =============================================================================
// WORKER TRAIT
// =============================================================================

/// Executes calculation jobs.
///
/// Per-item failures are reported inside the result. An `Err` means the job
/// as a whole was lost (transport failure, worker crash).
#[async_trait]
pub trait CalculationWorker: Send + Sync {
    /// Worker identity.
    fn worker_id(&self) -> &WorkerId;

    /// Executes a job.
    async fn execute(&self, job: CalculationJob) -> Result<CalculationJobResult, TraitError>;

    /// Executes a job while holding `lease`.
    ///
    /// The slot must stay claimed for as long as the work runs. By default the
    /// lease is released when the returned future completes or is dropped,
    /// which suits workers whose work stops with the future.
    async fn execute_leased(&self, job: CalculationJob, lease: WorkerLease) -> Result<CalculationJobResult, TraitError> {
        let result = self.execute(job).await;
        drop(lease);
        result
    }
}

/// Executes a job synchronously against a catalogue.
///
/// A panic in a function body fails that item only.
pub fn execute_job(catalogue: &FunctionCatalogue, job: &CalculationJob, worker_id: &WorkerId) -> CalculationJobResult {
    let start = Instant::now();
    let inputs = job.item_inputs();
    let items = job
        .items
        .iter()
        .zip(inputs)
        .map(|(item, inputs)| {
            let outcome = match (catalogue.get(&item.function_id), inputs) {
                (None, _) => JobItemOutcome::UnknownFunction {
                    function_id: item.function_id.clone(),
                },
                (Some(_), Err(specification)) => JobItemOutcome::MissingInput { specification },
                (Some(function), Ok(inputs)) => {
                    let run = catch_unwind(AssertUnwindSafe(|| {
                        function.execute(&item.target, &inputs, &item.outputs)
                    }));
                    match run {
                        Ok(Ok(values)) => JobItemOutcome::Success { values },
                        Ok(Err(e)) => JobItemOutcome::FunctionFailed {
                            message: e.to_string(),
                        },
                        Err(panic) => JobItemOutcome::FunctionFailed {
                            message: format!("function panicked: {}", panic_message(&*panic)),
                        },
                    }
                }
            };
            JobItemResult {
                node: item.node,
                outcome,
            }
        })
        .collect();

    CalculationJobResult {
        job_id: job.id,
        worker_id: worker_id.clone(),
        items,
        duration: start.elapsed(),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// LOCAL WORKER
// =============================================================================

/// In-process worker running jobs on the blocking thread pool.
pub struct LocalWorker {
    id: WorkerId,
    catalogue: Arc<FunctionCatalogue>,
}

impl LocalWorker {
    /// Creates a local worker.
    pub fn new(id: impl Into<WorkerId>, catalogue: Arc<FunctionCatalogue>) -> Self {
        Self {
            id: id.into(),
            catalogue,
        }
    }
}

#[async_trait]
impl CalculationWorker for LocalWorker {
    fn worker_id(&self) -> &WorkerId {
        &self.id
    }

    async fn execute(&self, job: CalculationJob) -> Result<CalculationJobResult, TraitError> {
        let catalogue = Arc::clone(&self.catalogue);
        let id = self.id.clone();
        tokio::task::spawn_blocking(move || execute_job(&catalogue, &job, &id))
            .await
            .map_err(|e| TraitError::WorkerUnavailable(e.to_string()))
    }

    /// Blocking work outlives a dropped future, so the lease moves into it.
    async fn execute_leased(&self, job: CalculationJob, lease: WorkerLease) -> Result<CalculationJobResult, TraitError> {
        let catalogue = Arc::clone(&self.catalogue);
        let id = self.id.clone();
        tokio::task::spawn_blocking(move || {
            let result = execute_job(&catalogue, &job, &id);
            drop(lease);
            result
        })
        .await
        .map_err(|e| TraitError::WorkerUnavailable(e.to_string()))
    }
}

// =============================================================================
// REMOTE WORKER
// =============================================================================

/// Request sent to a remote worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Execute a job.
    Execute {
        /// The job.
        job: CalculationJob,
    },
}

/// Response from a remote worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// The job ran; per-item outcomes inside.
    Completed {
        /// The result.
        result: CalculationJobResult,
    },
    /// The worker could not process the request.
    Rejected {
        /// Reason.
        message: String,
    },
}

/// Worker reached over a request/response connection.
pub struct RemoteWorker<C: Codec> {
    connection: Arc<dyn WorkerConnection>,
    codec: C,
}

impl<C: Codec> RemoteWorker<C> {
    /// Creates a remote worker over a connection.
    pub fn new(connection: Arc<dyn WorkerConnection>, codec: C) -> Self {
        Self { connection, codec }
    }
}

#[async_trait]
impl<C: Codec + 'static> CalculationWorker for RemoteWorker<C> {
    fn worker_id(&self) -> &WorkerId {
        self.connection.worker_id()
    }

    async fn execute(&self, job: CalculationJob) -> Result<CalculationJobResult, TraitError> {
        let job_id = job.id;
        let request = self.codec.encode(&WorkerRequest::Execute { job })?;
        let bytes = self.connection.round_trip(request).await?;
        match self.codec.decode::<WorkerResponse>(&bytes)? {
            WorkerResponse::Completed { result } if result.job_id == job_id => Ok(result),
            WorkerResponse::Completed { result } => Err(TraitError::InvalidInput(format!(
                "response for {} while waiting for {}",
                result.job_id, job_id
            ))),
            WorkerResponse::Rejected { message } => Err(TraitError::WorkerUnavailable(message)),
        }
    }
}

/// Receiving side of a remote worker: decodes requests and runs them.
pub struct WorkerEndpoint<C: Codec> {
    worker: LocalWorker,
    codec: C,
}

impl<C: Codec> WorkerEndpoint<C> {
    /// Creates an endpoint executing against a catalogue.
    pub fn new(id: impl Into<WorkerId>, catalogue: Arc<FunctionCatalogue>, codec: C) -> Self {
        Self {
            worker: LocalWorker::new(id, catalogue),
            codec,
        }
    }

    /// Worker identity.
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker.id
    }

    /// Handles one encoded request, returning the encoded response.
    pub async fn handle(&self, request: &[u8]) -> Result<Bytes, TraitError> {
        let response = match self.codec.decode::<WorkerRequest>(request) {
            Ok(WorkerRequest::Execute { job }) => {
                debug!(worker = %self.worker.id, job = %job.id, items = job.len(), "executing remote job");
                match self.worker.execute(job).await {
                    Ok(result) => WorkerResponse::Completed { result },
                    Err(e) => WorkerResponse::Rejected {
                        message: e.to_string(),
                    },
                }
            }
            Err(e) => {
                warn!(worker = %self.worker.id, error = %e, "undecodable worker request");
                WorkerResponse::Rejected {
                    message: e.to_string(),
                }
            }
        };
        self.codec.encode(&response)
    }
}

/// In-process connection to a [`WorkerEndpoint`].
pub struct LoopbackConnection<C: Codec> {
    endpoint: Arc<WorkerEndpoint<C>>,
}

impl<C: Codec> LoopbackConnection<C> {
    /// Connects to an endpoint.
    pub fn new(endpoint: Arc<WorkerEndpoint<C>>) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl<C: Codec + 'static> WorkerConnection for LoopbackConnection<C> {
    fn worker_id(&self) -> &WorkerId {
        self.endpoint.worker_id()
    }

    async fn round_trip(&self, request: Bytes) -> Result<Bytes, TraitError> {
        self.endpoint.handle(&request).await
    }
}

// =============================================================================
// WORKER POOL
// =============================================================================

struct PooledWorker {
    worker: Arc<dyn CalculationWorker>,
    capacity: usize,
    in_flight: AtomicUsize,
    dispatched: AtomicU64,
}

impl PooledWorker {
    fn try_claim(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                if n < self.capacity {
                    Some(n + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }
}

/// A claimed slot on one worker. Releases the slot on drop.
pub struct WorkerLease {
    slot: Arc<PooledWorker>,
    _permit: OwnedSemaphorePermit,
}

impl WorkerLease {
    /// The leased worker.
    pub fn worker(&self) -> &Arc<dyn CalculationWorker> {
        &self.slot.worker
    }

    /// Its id.
    pub fn worker_id(&self) -> &WorkerId {
        self.slot.worker.worker_id()
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.slot.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Per-worker load snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLoad {
    /// Worker id.
    pub worker_id: WorkerId,
    /// Jobs currently running.
    pub in_flight: usize,
    /// Slot count.
    pub capacity: usize,
    /// Jobs dispatched in total.
    pub dispatched: u64,
}

/// Fixed set of workers with bounded concurrency.
///
/// Acquiring a lease waits while every slot is taken; this is the only place
/// dispatch applies backpressure.
pub struct WorkerPool {
    workers: Vec<Arc<PooledWorker>>,
    permits: Arc<Semaphore>,
    default_capacity: usize,
}

impl WorkerPool {
    /// Creates an empty pool; workers added later get `capacity` slots each.
    pub fn new(capacity: usize) -> Self {
        Self {
            workers: Vec::new(),
            permits: Arc::new(Semaphore::new(0)),
            default_capacity: capacity.max(1),
        }
    }

    /// Adds a worker with the default capacity.
    pub fn with_worker(self, worker: Arc<dyn CalculationWorker>) -> Self {
        let capacity = self.default_capacity;
        self.with_worker_capacity(worker, capacity)
    }

    /// Adds a worker with its own capacity.
    pub fn with_worker_capacity(mut self, worker: Arc<dyn CalculationWorker>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        self.permits.add_permits(capacity);
        self.workers.push(Arc::new(PooledWorker {
            worker,
            capacity,
            in_flight: AtomicUsize::new(0),
            dispatched: AtomicU64::new(0),
        }));
        self
    }

    /// Number of workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the pool has no workers.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Total slots.
    pub fn total_capacity(&self) -> usize {
        self.workers.iter().map(|w| w.capacity).sum()
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Waits for a free slot on the least-loaded worker, avoiding `avoid`
    /// when any other worker has room.
    pub async fn acquire(&self, avoid: Option<&WorkerId>) -> EngineResult<WorkerLease> {
        if self.workers.is_empty() {
            return Err(EngineError::NoWorkerAvailable);
        }
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Shutdown)?;

        loop {
            let mut order: Vec<&Arc<PooledWorker>> = self.workers.iter().collect();
            order.sort_by_key(|w| {
                let avoided = avoid.is_some_and(|id| w.worker.worker_id() == id);
                let load = w.in_flight.load(Ordering::Acquire) * 1000 / w.capacity;
                (avoided, load)
            });
            for slot in order {
                if slot.try_claim() {
                    slot.dispatched.fetch_add(1, Ordering::Relaxed);
                    return Ok(WorkerLease {
                        slot: Arc::clone(slot),
                        _permit: permit,
                    });
                }
            }
            // Holding a permit guarantees a free slot; another acquirer raced us to it.
            tokio::task::yield_now().await;
        }
    }

    /// Closes the pool; pending and future acquires fail.
    pub fn close(&self) {
        self.permits.close();
    }

    /// Per-worker load.
    pub fn loads(&self) -> Vec<WorkerLoad> {
        self.workers
            .iter()
            .map(|w| WorkerLoad {
                worker_id: w.worker.worker_id().clone(),
                in_flight: w.in_flight.load(Ordering::Acquire),
                capacity: w.capacity,
                dispatched: w.dispatched.load(Ordering::Relaxed),
            })
            .collect()
    }
}
