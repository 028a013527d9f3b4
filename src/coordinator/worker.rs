use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

use crate::core::simulation::{MarketAssumptions, TrialPlan, run_trials};
use crate::core::types::{AssetAllocation, Scenario, SimulationTrial};

/// One slice of a simulation run, owned entirely by the unit that receives it.
#[derive(Debug, Clone)]
pub(crate) struct BatchRequest {
    pub batch_id: u64,
    pub batch_start: usize,
    pub batch_size: usize,
    pub scenario: Arc<Scenario>,
    pub assumptions: MarketAssumptions,
    pub portfolio: AssetAllocation,
    pub seed: Option<u64>,
}

#[derive(Debug)]
pub(crate) enum WorkerMessage {
    Ready {
        worker_id: usize,
    },
    BatchProgress {
        batch_id: u64,
        progress: u8,
    },
    BatchComplete {
        batch_id: u64,
        trials: Vec<SimulationTrial>,
        elapsed: Duration,
    },
    BatchError {
        batch_id: u64,
        message: String,
    },
}

pub(crate) fn spawn_worker(
    worker_id: usize,
    inbox: UnboundedReceiver<BatchRequest>,
    outbox: UnboundedSender<WorkerMessage>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("wealthcast-worker-{worker_id}"))
        .spawn(move || run_worker(worker_id, inbox, outbox))
}

fn run_worker(
    worker_id: usize,
    mut inbox: UnboundedReceiver<BatchRequest>,
    outbox: UnboundedSender<WorkerMessage>,
) {
    if outbox.send(WorkerMessage::Ready { worker_id }).is_err() {
        return;
    }

    while let Some(request) = inbox.blocking_recv() {
        trace!(worker_id, batch_id = request.batch_id, "batch received");
        let batch_id = request.batch_id;
        let message = panic::catch_unwind(AssertUnwindSafe(|| run_batch(&request, &outbox)))
            .unwrap_or_else(|_| WorkerMessage::BatchError {
                batch_id,
                message: "worker panicked while running batch".to_string(),
            });
        if outbox.send(message).is_err() {
            break;
        }
    }

    debug!(worker_id, "worker stopped");
}

fn run_batch(request: &BatchRequest, outbox: &UnboundedSender<WorkerMessage>) -> WorkerMessage {
    if let Err(err) = request.scenario.validate() {
        return WorkerMessage::BatchError {
            batch_id: request.batch_id,
            message: err.to_string(),
        };
    }

    let started = Instant::now();
    let plan = TrialPlan::new(&request.scenario, &request.assumptions, request.portfolio);
    let mut rng = match request.seed {
        Some(seed) => StdRng::seed_from_u64(seed ^ request.batch_start as u64),
        None => StdRng::from_rng(&mut rand::rng()),
    };

    let trials = run_trials(&plan, request.batch_size, &mut rng, |progress| {
        let _ = outbox.send(WorkerMessage::BatchProgress {
            batch_id: request.batch_id,
            progress,
        });
    });

    WorkerMessage::BatchComplete {
        batch_id: request.batch_id,
        trials,
        elapsed: started.elapsed(),
    }
}
