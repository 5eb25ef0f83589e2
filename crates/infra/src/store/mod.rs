//! Store ports: the task table, the dead-letter archive and the transaction scope.
//!
//! ## Transaction scope
//!
//! All three traits share one associated `Tx` type. Every mutating call takes
//! `Option<&mut Tx>`: `Some` joins the active transaction, `None` runs the
//! statement on its own (auto-committed). `TransactionManager::with_transaction`
//! opens the scope and hands the handle to a closure, so multi-step mutations
//! (delete + archive) commit or roll back as one unit.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use taskproc_core::{DeadLetterRecord, Task, TaskId};

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by store adapters and their breaker decorators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The target row is absent (stale claim or raced with a delete).
    #[error("task not found: {0}")]
    NotFound(TaskId),

    /// Rejected by an open circuit breaker; the store was not called.
    #[error("circuit breaker is open for {operation}")]
    BreakerOpen { operation: String },

    /// Rejected by a half-open circuit breaker that is already at its trial limit.
    #[error("circuit breaker is half-open and at its trial limit for {operation}")]
    BreakerTooManyRequests { operation: String },

    /// Connectivity, driver or constraint failure.
    #[error("storage error in {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }

    /// True when a breaker failed fast instead of running the operation.
    pub fn is_breaker_rejection(&self) -> bool {
        matches!(
            self,
            StoreError::BreakerOpen { .. } | StoreError::BreakerTooManyRequests { .. }
        )
    }
}

/// Batch creation that stopped short. `inserted` holds the ids that did land.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to create tasks batch: inserted {} of {requested}: {source}", .inserted.len())]
pub struct CreateError {
    pub inserted: Vec<TaskId>,
    pub requested: usize,
    #[source]
    pub source: StoreError,
}

impl CreateError {
    /// Nothing was inserted.
    pub fn nothing_inserted(requested: usize, source: StoreError) -> Self {
        Self {
            inserted: Vec::new(),
            requested,
            source,
        }
    }
}

/// The active task table.
#[async_trait]
pub trait TaskStore: Send + Sync {
    type Tx: Send;

    /// Insert `count` tasks with status `NEW` and return their ids.
    async fn create(&self, count: usize) -> Result<Vec<TaskId>, CreateError>;

    /// Atomically claim up to `limit` eligible tasks, oldest first.
    ///
    /// Claimed tasks come back as `PROCESSING` with `attempts` already
    /// incremented. Concurrent claims never return the same task.
    async fn claim(&self, tx: Option<&mut Self::Tx>, limit: u32) -> StoreResult<Vec<Task>>;

    async fn mark_processed(&self, tx: Option<&mut Self::Tx>, id: TaskId) -> StoreResult<()>;

    async fn mark_failed(
        &self,
        tx: Option<&mut Self::Tx>,
        id: TaskId,
        message: &str,
    ) -> StoreResult<()>;

    async fn delete(&self, tx: Option<&mut Self::Tx>, id: TaskId) -> StoreResult<()>;

    /// Move `PROCESSING` tasks untouched for longer than `lease` back to `FAILED`.
    /// Returns how many were requeued.
    async fn requeue_stale(&self, lease: Duration) -> StoreResult<u64>;
}

/// Append-only archive for tasks that exhausted their attempts.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    type Tx: Send;

    async fn create(&self, tx: Option<&mut Self::Tx>, record: &DeadLetterRecord) -> StoreResult<()>;
}

/// Opens transaction scopes.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    type Tx: Send;

    /// Run `f` inside one transaction: commit on `Ok`, roll back on `Err` and
    /// return the error unchanged.
    async fn with_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        T: Send,
        E: From<StoreError> + Send,
        F: for<'t> FnOnce(&'t mut Self::Tx) -> BoxFuture<'t, Result<T, E>> + Send;
}

#[async_trait]
impl<S: TaskStore + ?Sized> TaskStore for std::sync::Arc<S> {
    type Tx = S::Tx;

    async fn create(&self, count: usize) -> Result<Vec<TaskId>, CreateError> {
        (**self).create(count).await
    }

    async fn claim(&self, tx: Option<&mut Self::Tx>, limit: u32) -> StoreResult<Vec<Task>> {
        (**self).claim(tx, limit).await
    }

    async fn mark_processed(&self, tx: Option<&mut Self::Tx>, id: TaskId) -> StoreResult<()> {
        (**self).mark_processed(tx, id).await
    }

    async fn mark_failed(
        &self,
        tx: Option<&mut Self::Tx>,
        id: TaskId,
        message: &str,
    ) -> StoreResult<()> {
        (**self).mark_failed(tx, id, message).await
    }

    async fn delete(&self, tx: Option<&mut Self::Tx>, id: TaskId) -> StoreResult<()> {
        (**self).delete(tx, id).await
    }

    async fn requeue_stale(&self, lease: Duration) -> StoreResult<u64> {
        (**self).requeue_stale(lease).await
    }
}

#[async_trait]
impl<D: DeadLetterStore + ?Sized> DeadLetterStore for std::sync::Arc<D> {
    type Tx = D::Tx;

    async fn create(&self, tx: Option<&mut Self::Tx>, record: &DeadLetterRecord) -> StoreResult<()> {
        (**self).create(tx, record).await
    }
}
