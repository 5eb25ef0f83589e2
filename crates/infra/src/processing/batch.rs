//! Batch dispatch: claim, fan out over the worker pool, fan in and count.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskproc_core::{BatchRequest, BatchSummary};

use super::pool::WorkerPool;
use super::single::TaskProcessor;
use crate::store::{DeadLetterStore, StoreError, TaskStore, TransactionManager};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to acquire tasks: {0}")]
    Claim(#[source] StoreError),
}

/// Backend-agnostic entry point used by the HTTP layer.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process_batch(
        &self,
        request: &BatchRequest,
        cancel: CancellationToken,
    ) -> Result<BatchSummary, DispatchError>;
}

pub struct BatchDispatcher<S, D, M> {
    processor: TaskProcessor<S, D, M>,
    pool: Arc<WorkerPool>,
}

impl<S, D, M> BatchDispatcher<S, D, M>
where
    M: TransactionManager + 'static,
    S: TaskStore<Tx = M::Tx> + 'static,
    D: DeadLetterStore<Tx = M::Tx> + 'static,
{
    pub fn new(processor: TaskProcessor<S, D, M>, pool: Arc<WorkerPool>) -> Self {
        Self { processor, pool }
    }
}

#[async_trait]
impl<S, D, M> BatchProcessor for BatchDispatcher<S, D, M>
where
    M: TransactionManager + 'static,
    S: TaskStore<Tx = M::Tx> + 'static,
    D: DeadLetterStore<Tx = M::Tx> + 'static,
{
    async fn process_batch(
        &self,
        request: &BatchRequest,
        cancel: CancellationToken,
    ) -> Result<BatchSummary, DispatchError> {
        debug!(limit = request.limit, "acquiring tasks");
        let tasks = self
            .processor
            .tasks()
            .claim(None, request.limit)
            .await
            .map_err(DispatchError::Claim)?;

        if tasks.is_empty() {
            return Ok(BatchSummary::empty());
        }
        info!(count = tasks.len(), "processing tasks");

        let success = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));
        let mut pending = Vec::with_capacity(tasks.len());

        for task in tasks {
            let task_id = task.id;
            let processor = self.processor.clone();
            let request = request.clone();
            let cancel = cancel.clone();
            let job_success = success.clone();
            let job_failed = failed.clone();
            let (done, wait) = oneshot::channel::<()>();

            let submitted = self.pool.submit(async move {
                match processor.process(task, &request, &cancel).await {
                    Ok(true) => {
                        job_success.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => {
                        job_failed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        warn!(
                            task_id = %task_id,
                            error = %err,
                            breaker_rejected = err.is_breaker_rejection(),
                            "task processing failed"
                        );
                        job_failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                let _ = done.send(());
            });

            match submitted {
                Ok(()) => pending.push(wait),
                Err(err) => {
                    warn!(task_id = %task_id, error = %err, "task submission failed");
                    failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        for wait in pending {
            // A dropped sender means the job never reported.
            if wait.await.is_err() {
                failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        let summary = BatchSummary::from_counts(
            success.load(Ordering::Relaxed),
            failed.load(Ordering::Relaxed),
        );
        info!(
            processed = summary.processed_count,
            success = summary.success_count,
            failed = summary.failed_count,
            "tasks processing completed"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;
    use taskproc_core::{RandomProvider, Task, TaskId, TaskStatus};

    use crate::breaker::{BreakerSettings, BreakerTaskStore};
    use crate::memory::{InMemoryStore, MemoryTx};
    use crate::processing::single::tests::ScriptedRandom;
    use crate::processing::single::ProcessError;
    use crate::store::{CreateError, StoreResult};
    use crate::testing::FaultyTaskStore;

    fn dispatcher(
        store: &InMemoryStore,
        random: Arc<dyn RandomProvider>,
        workers: usize,
    ) -> BatchDispatcher<InMemoryStore, InMemoryStore, InMemoryStore> {
        let shared = Arc::new(store.clone());
        let processor = TaskProcessor::new(shared.clone(), shared.clone(), shared, random);
        BatchDispatcher::new(processor, Arc::new(WorkerPool::new(workers)))
    }

    fn request(limit: u32, success_rate: f64) -> BatchRequest {
        BatchRequest {
            limit,
            min_delay_ms: 0,
            max_delay_ms: 0,
            success_rate,
        }
    }

    #[tokio::test]
    async fn processes_all_then_nothing_left() {
        let store = InMemoryStore::new();
        TaskStore::create(&store, 5).await.unwrap();
        let d = dispatcher(&store, ScriptedRandom::constant(0.5), 3);

        let summary = d
            .process_batch(&request(5, 1.0), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary, BatchSummary::from_counts(5, 0));

        assert!(TaskStore::claim(&store, None, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_rate_fails_every_task() {
        let store = InMemoryStore::new();
        TaskStore::create(&store, 4).await.unwrap();
        let d = dispatcher(&store, ScriptedRandom::constant(0.5), 2);

        let summary = d
            .process_batch(&request(10, 0.0), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.processed_count, 4);
        assert_eq!(summary.success_count, 0);
        assert_eq!(summary.failed_count, 4);
    }

    #[tokio::test]
    async fn empty_store_yields_zero_summary() {
        let store = InMemoryStore::new();
        let d = dispatcher(&store, ScriptedRandom::constant(0.0), 2);
        let summary = d
            .process_batch(&request(10, 1.0), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary, BatchSummary::empty());
    }

    #[tokio::test]
    async fn respects_limit() {
        let store = InMemoryStore::new();
        TaskStore::create(&store, 7).await.unwrap();
        let d = dispatcher(&store, ScriptedRandom::constant(0.0), 4);
        let summary = d
            .process_batch(&request(3, 1.0), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.processed_count, 3);
        assert_eq!(TaskStore::claim(&store, None, 10).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn exhausted_tasks_count_as_failures() {
        let store = InMemoryStore::new();
        let last_try = Task {
            attempts: 2,
            status: TaskStatus::Failed,
            ..Task::new(TaskId::new(), Utc::now())
        };
        store.insert(last_try.clone()).await;
        TaskStore::create(&store, 1).await.unwrap();

        let d = dispatcher(&store, ScriptedRandom::constant(0.0), 2);
        let summary = d
            .process_batch(&request(10, 1.0), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary, BatchSummary::from_counts(1, 1));
        assert_eq!(store.dead_letters().await[0].id, last_try.id);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_counts_pending_tasks_as_failed() {
        let store = InMemoryStore::new();
        TaskStore::create(&store, 3).await.unwrap();
        let d = dispatcher(&store, ScriptedRandom::constant(0.0), 3);
        let req = BatchRequest {
            min_delay_ms: 5_000,
            max_delay_ms: 5_000,
            ..request(3, 1.0)
        };

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let summary = d.process_batch(&req, cancel).await.unwrap();
        assert_eq!(summary, BatchSummary::from_counts(0, 3));
    }

    #[tokio::test]
    async fn closed_pool_counts_every_claimed_task_as_failed() {
        let store = InMemoryStore::new();
        TaskStore::create(&store, 3).await.unwrap();
        let shared = Arc::new(store.clone());
        let processor = TaskProcessor::new(
            shared.clone(),
            shared.clone(),
            shared,
            ScriptedRandom::constant(0.0),
        );
        let pool = Arc::new(WorkerPool::new(2));
        pool.shutdown().await;
        let d = BatchDispatcher::new(processor, pool);

        let summary = d
            .process_batch(&request(10, 1.0), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary, BatchSummary::from_counts(0, 3));
        assert_eq!(summary.processed_count, 3);
    }

    /// Four tasks with distinct creation times, oldest first.
    async fn seed_in_order(store: &InMemoryStore) -> Vec<TaskId> {
        let base = Utc::now() - chrono::Duration::minutes(1);
        let mut ids = Vec::new();
        for offset in 0..4 {
            let task = Task::new(TaskId::new(), base + chrono::Duration::seconds(offset));
            ids.push(task.id);
            store.insert(task).await;
        }
        ids
    }

    #[tokio::test]
    async fn one_store_failure_does_not_sink_siblings() {
        let memory = InMemoryStore::new();
        let ids = seed_in_order(&memory).await;
        let shared = Arc::new(memory.clone());
        let processor = TaskProcessor::new(
            Arc::new(FaultyTaskStore::poisoned(memory.clone(), ids[1])),
            shared.clone(),
            shared,
            ScriptedRandom::constant(0.0),
        );
        let d = BatchDispatcher::new(processor, Arc::new(WorkerPool::new(2)));

        let summary = d
            .process_batch(&request(10, 1.0), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary, BatchSummary::from_counts(3, 1));
        assert_eq!(memory.get(ids[1]).await.unwrap().status, TaskStatus::Processing);
        for id in [ids[0], ids[2], ids[3]] {
            assert_eq!(memory.get(id).await.unwrap().status, TaskStatus::Processed);
        }
    }

    #[tokio::test]
    async fn breaker_rejection_fails_only_its_task() {
        let memory = InMemoryStore::new();
        let ids = seed_in_order(&memory).await;
        let settings = BreakerSettings {
            consecutive_failures: 0,
            timeout: Duration::from_secs(60),
            ..BreakerSettings::default()
        };
        let tasks = Arc::new(BreakerTaskStore::new(
            FaultyTaskStore::poisoned(memory.clone(), ids[0]),
            &settings,
        ));
        let shared = Arc::new(memory.clone());
        // One worker keeps draws in claim order: the first two tasks fail, the rest succeed.
        let processor = TaskProcessor::new(
            tasks.clone(),
            shared.clone(),
            shared,
            ScriptedRandom::sequence(&[0.9, 0.9, 0.0, 0.0]),
        );
        let d = BatchDispatcher::new(processor.clone(), Arc::new(WorkerPool::new(1)));

        let summary = d
            .process_batch(&request(10, 0.5), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary, BatchSummary::from_counts(2, 2));

        // The poisoned task opened the MarkFailed breaker, so the second task
        // was rejected before reaching the store.
        assert_eq!(memory.get(ids[1]).await.unwrap().status, TaskStatus::Processing);
        assert_eq!(memory.get(ids[2]).await.unwrap().status, TaskStatus::Processed);
        assert_eq!(memory.get(ids[3]).await.unwrap().status, TaskStatus::Processed);

        let second = memory.get(ids[1]).await.unwrap();
        let err = processor
            .process(second, &request(10, 0.0), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_breaker_rejection());
        assert_eq!(
            err,
            ProcessError::Store {
                context: "failed to mark task as failed",
                source: StoreError::BreakerOpen {
                    operation: "postgres-task-store-MarkFailed".into(),
                },
            }
        );
    }

    /// Task store whose every call fails.
    struct Unreachable;

    fn down() -> StoreError {
        StoreError::storage("claim_tasks", "connection refused")
    }

    #[async_trait]
    impl TaskStore for Unreachable {
        type Tx = MemoryTx;

        async fn create(&self, count: usize) -> Result<Vec<TaskId>, CreateError> {
            Err(CreateError::nothing_inserted(count, down()))
        }

        async fn claim(&self, _tx: Option<&mut MemoryTx>, _limit: u32) -> StoreResult<Vec<Task>> {
            Err(down())
        }

        async fn mark_processed(&self, _tx: Option<&mut MemoryTx>, _id: TaskId) -> StoreResult<()> {
            Err(down())
        }

        async fn mark_failed(
            &self,
            _tx: Option<&mut MemoryTx>,
            _id: TaskId,
            _message: &str,
        ) -> StoreResult<()> {
            Err(down())
        }

        async fn delete(&self, _tx: Option<&mut MemoryTx>, _id: TaskId) -> StoreResult<()> {
            Err(down())
        }

        async fn requeue_stale(&self, _lease: Duration) -> StoreResult<u64> {
            Err(down())
        }
    }

    #[tokio::test]
    async fn claim_failure_aborts_batch() {
        let memory = Arc::new(InMemoryStore::new());
        let processor = TaskProcessor::new(
            Arc::new(Unreachable),
            memory.clone(),
            memory,
            ScriptedRandom::constant(0.0),
        );
        let d = BatchDispatcher::new(processor, Arc::new(WorkerPool::new(1)));

        let err = d
            .process_batch(&request(5, 1.0), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::Claim(down()));
        assert!(err.to_string().starts_with("failed to acquire tasks: "));
    }
}
