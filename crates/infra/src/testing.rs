//! Test doubles shared by the unit tests.

use std::time::Duration;

use async_trait::async_trait;

use taskproc_core::{Task, TaskId};

use crate::memory::{InMemoryStore, MemoryTx};
use crate::store::{CreateError, StoreError, StoreResult, TaskStore};

/// In-memory task store with injected failures.
#[derive(Clone, Default)]
pub(crate) struct FaultyTaskStore {
    pub(crate) memory: InMemoryStore,
    /// `create` stops with an error after this many inserts.
    pub(crate) create_budget: Option<usize>,
    /// Settling this task fails with a storage error.
    pub(crate) poisoned: Option<TaskId>,
}

impl FaultyTaskStore {
    pub(crate) fn failing_create_after(inserts: usize) -> Self {
        Self {
            create_budget: Some(inserts),
            ..Self::default()
        }
    }

    pub(crate) fn poisoned(memory: InMemoryStore, id: TaskId) -> Self {
        Self {
            memory,
            poisoned: Some(id),
            ..Self::default()
        }
    }

    fn check(&self, operation: &'static str, id: TaskId) -> StoreResult<()> {
        if self.poisoned == Some(id) {
            return Err(StoreError::storage(operation, "connection reset"));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for FaultyTaskStore {
    type Tx = MemoryTx;

    async fn create(&self, count: usize) -> Result<Vec<TaskId>, CreateError> {
        let budget = self.create_budget.unwrap_or(count);
        let inserted = TaskStore::create(&self.memory, count.min(budget)).await?;
        if budget >= count {
            return Ok(inserted);
        }
        Err(CreateError {
            inserted,
            requested: count,
            source: StoreError::storage("create_tasks", "connection reset"),
        })
    }

    async fn claim(&self, tx: Option<&mut MemoryTx>, limit: u32) -> StoreResult<Vec<Task>> {
        self.memory.claim(tx, limit).await
    }

    async fn mark_processed(&self, tx: Option<&mut MemoryTx>, id: TaskId) -> StoreResult<()> {
        self.check("mark_processed", id)?;
        self.memory.mark_processed(tx, id).await
    }

    async fn mark_failed(&self, tx: Option<&mut MemoryTx>, id: TaskId, message: &str) -> StoreResult<()> {
        self.check("mark_failed", id)?;
        self.memory.mark_failed(tx, id, message).await
    }

    async fn delete(&self, tx: Option<&mut MemoryTx>, id: TaskId) -> StoreResult<()> {
        TaskStore::delete(&self.memory, tx, id).await
    }

    async fn requeue_stale(&self, lease: Duration) -> StoreResult<u64> {
        self.memory.requeue_stale(lease).await
    }
}
