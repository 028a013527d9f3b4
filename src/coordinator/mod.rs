//! Spreads simulation trials across a pool of OS-thread execution units.
//!
//! Each unit owns its inbox and shares nothing with its siblings. Replies from
//! every unit arrive on one channel and are routed to per-batch resolvers, so
//! a failing batch only fails its own [`BatchHandle`].

mod worker;

use std::collections::{HashMap, HashSet};
use std::io;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::simulation::MarketAssumptions;
use crate::core::types::{AssetAllocation, Scenario, SimulationTrial};
use worker::{BatchRequest, WorkerMessage, spawn_worker};

pub const MAX_WORKERS: usize = 8;
pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub max_concurrency: usize,
    pub batch_size: usize,
    pub handshake_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: hardware_concurrency(),
            batch_size: DEFAULT_BATCH_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("batch {batch_id} (trials from {batch_start}) failed: {message}")]
pub struct BatchError {
    pub batch_id: u64,
    pub batch_start: usize,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("worker coordinator is not initialized")]
    NotInitialized,
    #[error("worker {worker_id} did not report ready within {timeout:?}")]
    HandshakeTimeout { worker_id: usize, timeout: Duration },
    #[error("worker {worker_id} failed to start: {source}")]
    WorkerStartup {
        worker_id: usize,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error("invalid simulation request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub batch_id: u64,
    pub batch_start: usize,
    pub progress: u8,
}

/// What a unit reports back about a batch before it resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEvent {
    Progress(BatchProgress),
    Failed(BatchError),
}

pub type BatchEventCallback = Arc<dyn Fn(BatchEvent) + Send + Sync>;

type WorkerSpawner = fn(
    usize,
    mpsc::UnboundedReceiver<BatchRequest>,
    mpsc::UnboundedSender<WorkerMessage>,
) -> io::Result<JoinHandle<()>>;

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome {
    pub batch_id: u64,
    pub batch_start: usize,
    pub trials: Vec<SimulationTrial>,
    pub elapsed: Duration,
}

/// A dispatched batch. Resolves once its unit reports completion or failure.
#[derive(Debug)]
pub struct BatchHandle {
    pub batch_id: u64,
    pub batch_start: usize,
    receiver: oneshot::Receiver<Result<BatchOutcome, BatchError>>,
}

impl BatchHandle {
    pub async fn outcome(self) -> Result<BatchOutcome, BatchError> {
        let (batch_id, batch_start) = (self.batch_id, self.batch_start);
        self.receiver.await.unwrap_or_else(|_| {
            Err(BatchError {
                batch_id,
                batch_start,
                message: "worker exited before reporting a result".to_string(),
            })
        })
    }
}

/// Everything a run needs besides the progress callback.
#[derive(Debug, Clone)]
pub struct SimulationJob {
    pub scenario: Arc<Scenario>,
    pub assumptions: MarketAssumptions,
    pub portfolio: AssetAllocation,
    pub total_trials: usize,
    pub batch_size: Option<usize>,
    pub seed: Option<u64>,
}

impl SimulationJob {
    /// Job using the scenario's own market assumptions and effective allocation.
    pub fn for_scenario(scenario: Scenario, total_trials: usize) -> Self {
        Self {
            assumptions: MarketAssumptions::for_scenario(&scenario),
            portfolio: scenario.effective_allocation(),
            scenario: Arc::new(scenario),
            total_trials,
            batch_size: None,
            seed: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

type BatchResolver = oneshot::Sender<Result<BatchOutcome, BatchError>>;

struct Pending {
    batch_start: usize,
    resolver: BatchResolver,
    on_event: Option<BatchEventCallback>,
}

impl Pending {
    /// Resolves the batch as failed and tells the caller's callback.
    fn fail(self, batch_id: u64, message: String) {
        let error = BatchError {
            batch_id,
            batch_start: self.batch_start,
            message,
        };
        if let Some(callback) = &self.on_event {
            callback(BatchEvent::Failed(error.clone()));
        }
        let _ = self.resolver.send(Err(error));
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, Pending>>>;

struct Worker {
    id: usize,
    inbox: mpsc::UnboundedSender<BatchRequest>,
    _thread: JoinHandle<()>,
}

pub struct WorkerCoordinator {
    config: CoordinatorConfig,
    workers: Vec<Worker>,
    pending: PendingMap,
    next_batch_id: AtomicU64,
    next_worker: AtomicUsize,
    spawner: WorkerSpawner,
}

impl WorkerCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            workers: Vec::new(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_batch_id: AtomicU64::new(0),
            next_worker: AtomicUsize::new(0),
            spawner: spawn_worker,
        }
    }

    #[cfg(test)]
    fn with_spawner(config: CoordinatorConfig, spawner: WorkerSpawner) -> Self {
        let mut coordinator = Self::new(config);
        coordinator.spawner = spawner;
        coordinator
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_initialized(&self) -> bool {
        !self.workers.is_empty()
    }

    /// [`initialize`](Self::initialize) with the configured `max_concurrency`.
    pub async fn start(&mut self) -> Result<usize, CoordinatorError> {
        self.initialize(self.config.max_concurrency).await
    }

    /// Spawns `min(max_concurrency, available cores, 8)` units and waits for
    /// each to acknowledge. Calling it again on a live pool is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn initialize(&mut self, max_concurrency: usize) -> Result<usize, CoordinatorError> {
        if self.is_initialized() {
            return Ok(self.worker_count());
        }
        if max_concurrency == 0 {
            return Err(CoordinatorError::InvalidRequest(
                "max concurrency must be >= 1".to_string(),
            ));
        }

        let count = unit_count(max_concurrency);
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel();
        let mut workers = Vec::with_capacity(count);
        for id in 0..count {
            let (inbox, requests) = mpsc::unbounded_channel();
            let thread = (self.spawner)(id, requests, reply_tx.clone())
                .map_err(|source| CoordinatorError::WorkerStartup { worker_id: id, source })?;
            workers.push(Worker {
                id,
                inbox,
                _thread: thread,
            });
        }
        drop(reply_tx);

        let timeout = self.config.handshake_timeout;
        let deadline = Instant::now() + timeout;
        let mut ready = HashSet::with_capacity(count);
        while ready.len() < count {
            match tokio::time::timeout_at(deadline, reply_rx.recv()).await {
                Ok(Some(WorkerMessage::Ready { worker_id })) => {
                    debug!(worker_id, "worker ready");
                    ready.insert(worker_id);
                }
                Ok(Some(other)) => debug!(?other, "unexpected message during handshake"),
                Ok(None) => {
                    return Err(CoordinatorError::WorkerStartup {
                        worker_id: first_missing(&workers, &ready),
                        source: io::Error::other("worker exited during startup"),
                    });
                }
                Err(_) => {
                    let worker_id = first_missing(&workers, &ready);
                    warn!(worker_id, ?timeout, "worker handshake timed out");
                    return Err(CoordinatorError::HandshakeTimeout { worker_id, timeout });
                }
            }
        }

        tokio::spawn(route_replies(reply_rx, Arc::clone(&self.pending)));
        self.workers = workers;
        info!(workers = count, "worker coordinator initialized");
        Ok(count)
    }

    /// Partitions the job into batches and hands them to units round-robin.
    /// Handles come back in batch-start order.
    pub fn dispatch(
        &self,
        job: &SimulationJob,
        on_event: Option<BatchEventCallback>,
    ) -> Result<Vec<BatchHandle>, CoordinatorError> {
        if !self.is_initialized() {
            return Err(CoordinatorError::NotInitialized);
        }
        let batch_size = job.batch_size.unwrap_or(self.config.batch_size);
        if batch_size == 0 {
            return Err(CoordinatorError::InvalidRequest(
                "batch size must be >= 1".to_string(),
            ));
        }

        let mut handles = Vec::with_capacity(job.total_trials.div_ceil(batch_size));
        for batch_start in (0..job.total_trials).step_by(batch_size) {
            let size = batch_size.min(job.total_trials - batch_start);
            let batch_id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
            let slot = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
            let worker = &self.workers[slot];

            let (resolver, receiver) = oneshot::channel();
            lock(&self.pending).insert(
                batch_id,
                Pending {
                    batch_start,
                    resolver,
                    on_event: on_event.clone(),
                },
            );

            let request = BatchRequest {
                batch_id,
                batch_start,
                batch_size: size,
                scenario: Arc::clone(&job.scenario),
                assumptions: job.assumptions,
                portfolio: job.portfolio,
                seed: job.seed,
            };
            debug!(batch_id, batch_start, size, worker_id = worker.id, "dispatching batch");
            if worker.inbox.send(request).is_err() {
                let orphaned = lock(&self.pending).remove(&batch_id);
                if let Some(pending) = orphaned {
                    pending.fail(batch_id, format!("worker {} is no longer running", worker.id));
                }
            }

            handles.push(BatchHandle {
                batch_id,
                batch_start,
                receiver,
            });
        }

        Ok(handles)
    }

    /// Runs every batch of the job and concatenates their trials in
    /// batch-start order. All batches are awaited; the first failure by
    /// batch order is returned.
    pub async fn run_simulation(
        &self,
        job: &SimulationJob,
        on_event: Option<BatchEventCallback>,
    ) -> Result<Vec<SimulationTrial>, CoordinatorError> {
        let handles = self.dispatch(job, on_event)?;
        info!(
            batches = handles.len(),
            trials = job.total_trials,
            "simulation dispatched"
        );

        let mut trials = Vec::with_capacity(job.total_trials);
        let mut first_error = None;
        for handle in handles {
            match handle.outcome().await {
                Ok(outcome) => trials.extend(outcome.trials),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(trials),
        }
    }

    /// Stops accepting work. Units finish whatever they are running and exit;
    /// batches already dispatched still resolve. Safe to call repeatedly.
    pub fn destroy(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        let count = self.workers.len();
        self.workers.clear();
        self.next_worker.store(0, Ordering::Relaxed);
        info!(workers = count, "worker coordinator destroyed");
    }
}

impl Drop for WorkerCoordinator {
    fn drop(&mut self) {
        self.destroy();
    }
}

async fn route_replies(mut replies: mpsc::UnboundedReceiver<WorkerMessage>, pending: PendingMap) {
    while let Some(message) = replies.recv().await {
        match message {
            WorkerMessage::Ready { .. } => {}
            WorkerMessage::BatchProgress { batch_id, progress } => {
                let target = lock(&pending)
                    .get(&batch_id)
                    .and_then(|p| p.on_event.clone().map(|cb| (p.batch_start, cb)));
                if let Some((batch_start, callback)) = target {
                    callback(BatchEvent::Progress(BatchProgress {
                        batch_id,
                        batch_start,
                        progress,
                    }));
                }
            }
            WorkerMessage::BatchComplete {
                batch_id,
                trials,
                elapsed,
            } => {
                let completed = lock(&pending).remove(&batch_id);
                if let Some(p) = completed {
                    debug!(batch_id, trials = trials.len(), ?elapsed, "batch complete");
                    let _ = p.resolver.send(Ok(BatchOutcome {
                        batch_id,
                        batch_start: p.batch_start,
                        trials,
                        elapsed,
                    }));
                }
            }
            WorkerMessage::BatchError { batch_id, message } => {
                let failed = lock(&pending).remove(&batch_id);
                if let Some(p) = failed {
                    warn!(batch_id, batch_start = p.batch_start, %message, "batch failed");
                    p.fail(batch_id, message);
                }
            }
        }
    }

    // Every unit has exited; anything still pending will never be answered.
    lock(&pending).clear();
    debug!("reply router stopped");
}

fn lock(pending: &Mutex<HashMap<u64, Pending>>) -> MutexGuard<'_, HashMap<u64, Pending>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn first_missing(workers: &[Worker], ready: &HashSet<usize>) -> usize {
    workers
        .iter()
        .map(|w| w.id)
        .find(|id| !ready.contains(id))
        .unwrap_or_default()
}

fn hardware_concurrency() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

fn unit_count(requested: usize) -> usize {
    requested.min(hardware_concurrency()).min(MAX_WORKERS).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::simulation::aggregate_trials;
    use crate::core::types::fixtures::retiree_scenario;

    async fn coordinator(workers: usize) -> WorkerCoordinator {
        let mut coordinator = WorkerCoordinator::new(CoordinatorConfig::default());
        coordinator.initialize(workers).await.expect("initialize");
        coordinator
    }

    fn final_wealths(trials: &[SimulationTrial]) -> Vec<f64> {
        trials.iter().map(|t| t.final_wealth).collect()
    }

    fn event_sink() -> (BatchEventCallback, Arc<Mutex<Vec<BatchEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: BatchEventCallback = Arc::new(move |event: BatchEvent| {
            sink.lock().expect("event sink").push(event);
        });
        (callback, seen)
    }

    // Unit 0 never acknowledges; every other unit is a real worker.
    fn silent_first_worker(
        worker_id: usize,
        inbox: mpsc::UnboundedReceiver<BatchRequest>,
        outbox: mpsc::UnboundedSender<WorkerMessage>,
    ) -> io::Result<JoinHandle<()>> {
        if worker_id != 0 {
            return spawn_worker(worker_id, inbox, outbox);
        }
        thread::Builder::new().spawn(move || {
            let _held = (inbox, outbox);
            thread::sleep(Duration::from_millis(300));
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn initialize_fails_when_a_unit_misses_the_handshake() {
        let config = CoordinatorConfig {
            handshake_timeout: Duration::from_millis(50),
            ..CoordinatorConfig::default()
        };
        let mut coordinator = WorkerCoordinator::with_spawner(config, silent_first_worker);

        let err = coordinator.initialize(2).await.expect_err("unit 0 stays silent");
        match err {
            CoordinatorError::HandshakeTimeout { worker_id, timeout } => {
                assert_eq!(worker_id, 0);
                assert_eq!(timeout, Duration::from_millis(50));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!coordinator.is_initialized());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_uses_configured_concurrency() {
        let config = CoordinatorConfig {
            max_concurrency: 1,
            ..CoordinatorConfig::default()
        };
        let mut coordinator = WorkerCoordinator::new(config);
        assert_eq!(coordinator.start().await.expect("start"), 1);
        assert_eq!(coordinator.worker_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn initialize_caps_unit_count() {
        let coordinator = coordinator(64).await;
        assert_eq!(coordinator.worker_count(), hardware_concurrency().min(MAX_WORKERS));
        assert!(coordinator.worker_count() <= MAX_WORKERS);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn initialize_rejects_zero_concurrency() {
        let mut coordinator = WorkerCoordinator::new(CoordinatorConfig::default());
        let err = coordinator.initialize(0).await.expect_err("zero units");
        assert!(matches!(err, CoordinatorError::InvalidRequest(_)));
        assert!(!coordinator.is_initialized());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_returns_every_trial() {
        let coordinator = coordinator(3).await;
        let job = SimulationJob::for_scenario(retiree_scenario(), 2_500).with_batch_size(1_000);

        let trials = coordinator.run_simulation(&job, None).await.expect("run");
        assert_eq!(trials.len(), 2_500);
        let result = aggregate_trials(&trials, Duration::ZERO);
        assert!((result.success_probability + result.shortfall_risk - 100.0).abs() < 1e-9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dispatch_orders_handles_by_batch_start() {
        let coordinator = coordinator(2).await;
        let job = SimulationJob::for_scenario(retiree_scenario(), 250).with_batch_size(100);

        let handles = coordinator.dispatch(&job, None).expect("dispatch");
        let starts = handles.iter().map(|h| h.batch_start).collect::<Vec<_>>();
        assert_eq!(starts, vec![0, 100, 200]);

        let mut sizes = Vec::new();
        for handle in handles {
            sizes.push(handle.outcome().await.expect("batch").trials.len());
        }
        assert_eq!(sizes, vec![100, 100, 50]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn seeded_runs_are_reproducible_across_pool_sizes() {
        let job = SimulationJob::for_scenario(retiree_scenario(), 600)
            .with_batch_size(150)
            .with_seed(99);

        let single = coordinator(1).await.run_simulation(&job, None).await.expect("run");
        let pooled = coordinator(4).await.run_simulation(&job, None).await.expect("run");
        assert_eq!(final_wealths(&single), final_wealths(&pooled));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn progress_is_relayed_per_batch() {
        let coordinator = coordinator(2).await;
        let job = SimulationJob::for_scenario(retiree_scenario(), 250).with_batch_size(100);
        let (callback, seen) = event_sink();

        coordinator
            .run_simulation(&job, Some(callback))
            .await
            .expect("run");

        let mut events = seen
            .lock()
            .expect("event sink")
            .iter()
            .filter_map(|event| match event {
                BatchEvent::Progress(p) => Some(*p),
                BatchEvent::Failed(_) => None,
            })
            .collect::<Vec<_>>();
        events.sort_by_key(|p| p.batch_start);
        let summary = events
            .iter()
            .map(|p| (p.batch_start, p.progress))
            .collect::<Vec<_>>();
        assert_eq!(summary, vec![(0, 100), (100, 100), (200, 100)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failing_batch_does_not_affect_siblings() {
        let coordinator = coordinator(2).await;
        let mut broken = retiree_scenario();
        broken.time.projection_years = 0;
        let good = SimulationJob::for_scenario(retiree_scenario(), 200).with_batch_size(100);
        let bad = SimulationJob::for_scenario(broken, 100);

        let good_handles = coordinator.dispatch(&good, None).expect("dispatch");
        let bad_handles = coordinator.dispatch(&bad, None).expect("dispatch");

        for handle in bad_handles {
            let err = handle.outcome().await.expect_err("invalid scenario");
            assert!(err.message.contains("projectionYears"));
        }
        for handle in good_handles {
            assert_eq!(handle.outcome().await.expect("batch").trials.len(), 100);
        }

        let (callback, seen) = event_sink();
        let err = coordinator
            .run_simulation(&bad, Some(callback))
            .await
            .expect_err("batch error surfaces");
        assert!(matches!(err, CoordinatorError::Batch(ref e) if e.batch_start == 0));

        let events = seen.lock().expect("event sink").clone();
        let failures = events
            .iter()
            .filter_map(|event| match event {
                BatchEvent::Failed(e) => Some(e.clone()),
                BatchEvent::Progress(_) => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].batch_start, 0);
        assert!(failures[0].message.contains("projectionYears"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn destroy_is_idempotent_and_blocks_new_work() {
        let mut coordinator = coordinator(2).await;
        let job = SimulationJob::for_scenario(retiree_scenario(), 300).with_batch_size(100);
        let in_flight = coordinator.dispatch(&job, None).expect("dispatch");

        coordinator.destroy();
        coordinator.destroy();
        assert_eq!(coordinator.worker_count(), 0);

        for handle in in_flight {
            assert_eq!(handle.outcome().await.expect("batch").trials.len(), 100);
        }
        let err = coordinator.run_simulation(&job, None).await.expect_err("destroyed");
        assert!(matches!(err, CoordinatorError::NotInitialized));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_job_yields_no_trials() {
        let coordinator = coordinator(1).await;
        let job = SimulationJob::for_scenario(retiree_scenario(), 0);
        let trials = coordinator.run_simulation(&job, None).await.expect("run");
        assert!(trials.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn zero_batch_size_is_rejected() {
        let coordinator = coordinator(1).await;
        let job = SimulationJob::for_scenario(retiree_scenario(), 10).with_batch_size(0);
        let err = coordinator.dispatch(&job, None).expect_err("zero batch");
        assert!(matches!(err, CoordinatorError::InvalidRequest(_)));
    }
}
