//! In-memory store for tests/dev (`TASK_STORE=memory`).
//!
//! One mutex guards both tables. A claim runs entirely under the lock, which
//! gives the same no-double-claim guarantee as `FOR UPDATE SKIP LOCKED`.
//! A transaction keeps the lock for its whole lifetime and restores a snapshot
//! unless it commits, including when its future is dropped mid-flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use taskproc_core::{DeadLetterRecord, Task, TaskId, TaskStatus};

use crate::store::{
    CreateError, DeadLetterStore, StoreError, StoreResult, TaskStore, TransactionManager,
};

const LEASE_EXPIRED_MESSAGE: &str = "processing lease expired";

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tasks: HashMap<TaskId, Task>,
    dead_letters: HashMap<TaskId, DeadLetterRecord>,
}

/// Task table, dead-letter archive and transaction manager in one process-local value.
///
/// Clones share the same underlying tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

/// Open in-memory transaction.
pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    snapshot: MemoryState,
    committed: bool,
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        if !self.committed {
            *self.guard = std::mem::take(&mut self.snapshot);
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully-formed task (tests use this to seed specific attempt counts).
    pub async fn insert(&self, task: Task) {
        self.state.lock().await.tasks.insert(task.id, task);
    }

    pub async fn get(&self, id: TaskId) -> Option<Task> {
        self.state.lock().await.tasks.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        let state = self.state.lock().await;
        let mut records: Vec<_> = state.dead_letters.values().cloned().collect();
        records.sort_by_key(|r| (r.created_at, r.id));
        records
    }

    async fn with_state<R>(
        &self,
        tx: Option<&mut MemoryTx>,
        f: impl FnOnce(&mut MemoryState) -> R,
    ) -> R {
        match tx {
            Some(tx) => f(&mut tx.guard),
            None => {
                let mut guard = self.state.lock().await;
                f(&mut guard)
            }
        }
    }
}

/// Only the current owner of a claim may settle it.
fn processing_mut(state: &mut MemoryState, id: TaskId) -> StoreResult<&mut Task> {
    state
        .tasks
        .get_mut(&id)
        .filter(|t| t.status == TaskStatus::Processing)
        .ok_or(StoreError::NotFound(id))
}

#[async_trait]
impl TaskStore for InMemoryStore {
    type Tx = MemoryTx;

    async fn create(&self, count: usize) -> Result<Vec<TaskId>, CreateError> {
        let mut state = self.state.lock().await;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let task = Task::new(TaskId::new(), Utc::now());
            ids.push(task.id);
            state.tasks.insert(task.id, task);
        }
        Ok(ids)
    }

    async fn claim(&self, tx: Option<&mut MemoryTx>, limit: u32) -> StoreResult<Vec<Task>> {
        self.with_state(tx, |state| {
            let mut eligible: Vec<&Task> = state.tasks.values().filter(|t| t.is_eligible()).collect();
            eligible.sort_by_key(|t| (t.created_at, t.id));
            let picked: Vec<TaskId> = eligible
                .into_iter()
                .take(limit as usize)
                .map(|t| t.id)
                .collect();

            let now = Utc::now();
            let mut claimed = Vec::with_capacity(picked.len());
            for id in picked {
                if let Some(task) = state.tasks.get_mut(&id) {
                    task.status = TaskStatus::Processing;
                    task.attempts += 1;
                    task.updated_at = now;
                    claimed.push(task.clone());
                }
            }
            Ok(claimed)
        })
        .await
    }

    async fn mark_processed(&self, tx: Option<&mut MemoryTx>, id: TaskId) -> StoreResult<()> {
        self.with_state(tx, |state| {
            let task = processing_mut(state, id)?;
            task.status = TaskStatus::Processed;
            task.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn mark_failed(
        &self,
        tx: Option<&mut MemoryTx>,
        id: TaskId,
        message: &str,
    ) -> StoreResult<()> {
        self.with_state(tx, |state| {
            let task = processing_mut(state, id)?;
            task.status = TaskStatus::Failed;
            task.error_message = Some(message.to_string());
            task.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn delete(&self, tx: Option<&mut MemoryTx>, id: TaskId) -> StoreResult<()> {
        self.with_state(tx, |state| {
            state
                .tasks
                .remove(&id)
                .map(|_| ())
                .ok_or(StoreError::NotFound(id))
        })
        .await
    }

    async fn requeue_stale(&self, lease: Duration) -> StoreResult<u64> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| StoreError::storage("requeue_stale", e.to_string()))?;
        let cutoff = Utc::now() - lease;
        let mut state = self.state.lock().await;
        let mut requeued = 0;
        for task in state.tasks.values_mut() {
            if task.status == TaskStatus::Processing && task.updated_at < cutoff {
                task.status = TaskStatus::Failed;
                task.error_message = Some(LEASE_EXPIRED_MESSAGE.to_string());
                task.updated_at = Utc::now();
                requeued += 1;
            }
        }
        Ok(requeued)
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryStore {
    type Tx = MemoryTx;

    async fn create(&self, tx: Option<&mut MemoryTx>, record: &DeadLetterRecord) -> StoreResult<()> {
        self.with_state(tx, |state| {
            if state.dead_letters.contains_key(&record.id) {
                return Err(StoreError::storage(
                    "create_dead_letter",
                    format!("dead letter {} already exists", record.id),
                ));
            }
            state.dead_letters.insert(record.id, record.clone());
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl TransactionManager for InMemoryStore {
    type Tx = MemoryTx;

    async fn with_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        T: Send,
        E: From<StoreError> + Send,
        F: for<'t> FnOnce(&'t mut MemoryTx) -> BoxFuture<'t, Result<T, E>> + Send,
    {
        let guard = self.state.clone().lock_owned().await;
        let snapshot = guard.clone();
        let mut tx = MemoryTx {
            guard,
            snapshot,
            committed: false,
        };

        let result = f(&mut tx).await;
        match &result {
            Ok(_) => tx.committed = true,
            Err(_) => warn!("rolling back in-memory transaction"),
        }
        result
    }
}
