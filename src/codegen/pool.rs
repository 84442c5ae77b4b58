//! Bounded worker pool.
//!
//! A fixed set of long-lived workers drain one FIFO queue. `submit` waits for
//! queue space instead of rejecting work. Each job runs in its own task so a
//! panic is contained to that job and the worker moves on.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::PoolError;

type PoolJob = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<PoolJob>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    worker_count: usize,
}

impl WorkerPool {
    /// Start `workers` workers over a queue of `capacity` slots. Must be
    /// called inside a tokio runtime.
    pub fn new(workers: usize, capacity: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<PoolJob>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let cancel = CancellationToken::new();

        let handles = (0..workers)
            .map(|worker_id| tokio::spawn(worker_loop(worker_id, rx.clone(), cancel.clone())))
            .collect();
        info!(workers, capacity, "Worker pool started");

        Self {
            sender: Mutex::new(Some(tx)),
            workers: tokio::sync::Mutex::new(handles),
            cancel,
            worker_count: workers,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Queue a job, waiting while the queue is full. Returns the number of
    /// jobs waiting in the queue right after this one was added.
    pub async fn submit<F>(&self, job: F) -> Result<usize, PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self
            .sender
            .lock()
            .map_err(|_| PoolError::ShutDown)?
            .clone()
            .ok_or(PoolError::ShutDown)?;
        sender
            .send(Box::pin(job))
            .await
            .map_err(|_| PoolError::ShutDown)?;
        Ok(sender.max_capacity() - sender.capacity())
    }

    /// Stop accepting work and wait for every worker to finish its current
    /// job. Jobs still queued are dropped without running.
    pub async fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        self.cancel.cancel();

        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::Receiver<PoolJob>>>,
    cancel: CancellationToken,
) {
    loop {
        let job = {
            let mut rx = queue.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else {
            break;
        };

        debug!(worker_id, "Worker picked up job");
        if let Err(e) = tokio::spawn(job).await
            && e.is_panic()
        {
            error!(worker_id, "Job panicked; worker continues");
        }
    }
    debug!(worker_id, "Worker exiting");
}
