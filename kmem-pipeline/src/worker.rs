use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::cancel::{CancelHandle, CancelSignal};
use crate::orchestrator::Orchestrator;

/// Background tasks pulling messages off the pipeline queue.
///
/// Each worker processes one message at a time and sleeps for the poll
/// interval when the queue is empty. Shutting the pool down also cancels
/// in-flight steps; their messages go back to the queue.
pub struct WorkerPool {
    shutdown: CancelHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(orchestrator: Arc<Orchestrator>, workers: usize, poll_interval: Duration) -> Self {
        let shutdown = CancelHandle::new();
        let tasks = (0..workers.max(1))
            .map(|id| {
                let orchestrator = Arc::clone(&orchestrator);
                let signal = shutdown.signal();
                tokio::spawn(worker_loop(id, orchestrator, signal, poll_interval))
            })
            .collect::<Vec<_>>();
        info!("pipeline worker pool started (workers={}, poll_interval={poll_interval:?})", tasks.len());
        Self { shutdown, tasks }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Signal every worker and wait for them to stop.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                error!("pipeline worker panicked: {err}");
            }
        }
        info!("pipeline worker pool stopped");
    }
}

async fn worker_loop(
    id: usize,
    orchestrator: Arc<Orchestrator>,
    cancel: CancelSignal,
    poll_interval: Duration,
) {
    debug!(worker = id, "worker started");
    while !cancel.is_cancelled() {
        match orchestrator.run_once(&cancel).await {
            Ok(Some(disposition)) => {
                debug!(worker = id, ?disposition, "message processed");
                continue;
            }
            Ok(None) => {}
            Err(err) => error!(worker = id, error = %err, "failed to process message"),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
    debug!(worker = id, "worker stopped");
}
