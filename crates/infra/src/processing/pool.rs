//! Fixed-size worker pool over one shared job queue.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Job = BoxFuture<'static, ()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("worker pool is shut down")]
pub struct PoolClosed;

/// Long-lived tokio workers pulling jobs from one queue.
///
/// Workers run jobs one at a time, so at most `size` jobs execute concurrently.
pub struct WorkerPool {
    sender: StdMutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one). Must be called inside a tokio runtime.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|worker| {
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { receiver.lock().await.recv().await };
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                    debug!(worker, "worker stopped");
                })
            })
            .collect();

        info!(workers = size, "worker pool started");
        Self {
            sender: StdMutex::new(Some(sender)),
            workers: StdMutex::new(workers),
        }
    }

    /// Queue a job for the next free worker.
    pub fn submit<F>(&self, job: F) -> Result<(), PoolClosed>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = self.sender.lock().unwrap_or_else(|p| p.into_inner());
        match sender.as_ref() {
            Some(sender) => sender.send(Box::pin(job)).map_err(|_| PoolClosed),
            None => Err(PoolClosed),
        }
    }

    /// Stop accepting jobs, let queued jobs finish and join every worker.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().unwrap_or_else(|p| p.into_inner()).take());
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();

        for worker in workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "worker terminated abnormally");
            }
        }
        info!("worker pool stopped");
    }
}
