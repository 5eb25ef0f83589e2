//! Store decorators that route every call through a [`BreakerGroup`].
//!
//! Every inner error counts as a breaker failure, `NotFound` included.
//! Rejections surface as `StoreError::BreakerOpen` or
//! `StoreError::BreakerTooManyRequests` carrying the breaker name.

use std::time::Duration;

use async_trait::async_trait;

use taskproc_core::{DeadLetterRecord, Task, TaskId};

use super::{BreakerError, BreakerGroup, BreakerSettings};
use crate::store::{CreateError, DeadLetterStore, StoreError, StoreResult, TaskStore};

pub const TASK_STORE_COMPONENT: &str = "postgres-task-store";
pub const DEAD_LETTER_STORE_COMPONENT: &str = "postgres-dead-letter-store";

const TASK_OPERATIONS: &[&str] = &[
    "BatchCreate",
    "Claim",
    "MarkProcessed",
    "MarkFailed",
    "Delete",
    "RequeueStale",
];
const DEAD_LETTER_OPERATIONS: &[&str] = &["Create"];

fn rejection(group: &BreakerGroup, operation: &str, open: bool) -> StoreError {
    let operation = group.name_of(operation);
    if open {
        StoreError::BreakerOpen { operation }
    } else {
        StoreError::BreakerTooManyRequests { operation }
    }
}

fn into_store_error(group: &BreakerGroup, operation: &str, err: BreakerError<StoreError>) -> StoreError {
    match err {
        BreakerError::Open => rejection(group, operation, true),
        BreakerError::TooManyRequests => rejection(group, operation, false),
        BreakerError::Inner(err) => err,
    }
}

/// [`TaskStore`] wrapper with one breaker per operation. Disabled settings
/// make it a plain pass-through.
pub struct BreakerTaskStore<S> {
    inner: S,
    breakers: Option<BreakerGroup>,
}

impl<S> BreakerTaskStore<S> {
    pub fn new(inner: S, settings: &BreakerSettings) -> Self {
        let breakers = settings
            .enabled
            .then(|| BreakerGroup::new(TASK_STORE_COMPONENT, TASK_OPERATIONS, settings));
        Self { inner, breakers }
    }

    pub fn breakers(&self) -> Option<&BreakerGroup> {
        self.breakers.as_ref()
    }
}

impl<S: TaskStore> BreakerTaskStore<S> {
    async fn guarded<T, F, Fut>(&self, operation: &'static str, f: F) -> StoreResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = StoreResult<T>>,
    {
        match &self.breakers {
            None => f().await,
            Some(group) => group
                .call(operation, f)
                .await
                .map_err(|err| into_store_error(group, operation, err)),
        }
    }
}

#[async_trait]
impl<S: TaskStore> TaskStore for BreakerTaskStore<S> {
    type Tx = S::Tx;

    async fn create(&self, count: usize) -> Result<Vec<TaskId>, CreateError> {
        let Some(group) = &self.breakers else {
            return self.inner.create(count).await;
        };
        group
            .call("BatchCreate", || self.inner.create(count))
            .await
            .map_err(|err| match err {
                BreakerError::Open => {
                    CreateError::nothing_inserted(count, rejection(group, "BatchCreate", true))
                }
                BreakerError::TooManyRequests => {
                    CreateError::nothing_inserted(count, rejection(group, "BatchCreate", false))
                }
                BreakerError::Inner(err) => err,
            })
    }

    async fn claim(&self, tx: Option<&mut Self::Tx>, limit: u32) -> StoreResult<Vec<Task>> {
        self.guarded("Claim", || self.inner.claim(tx, limit)).await
    }

    async fn mark_processed(&self, tx: Option<&mut Self::Tx>, id: TaskId) -> StoreResult<()> {
        self.guarded("MarkProcessed", || self.inner.mark_processed(tx, id))
            .await
    }

    async fn mark_failed(
        &self,
        tx: Option<&mut Self::Tx>,
        id: TaskId,
        message: &str,
    ) -> StoreResult<()> {
        self.guarded("MarkFailed", || self.inner.mark_failed(tx, id, message))
            .await
    }

    async fn delete(&self, tx: Option<&mut Self::Tx>, id: TaskId) -> StoreResult<()> {
        self.guarded("Delete", || self.inner.delete(tx, id)).await
    }

    async fn requeue_stale(&self, lease: Duration) -> StoreResult<u64> {
        self.guarded("RequeueStale", || self.inner.requeue_stale(lease))
            .await
    }
}

/// [`DeadLetterStore`] wrapper guarded by a single `Create` breaker.
pub struct BreakerDeadLetterStore<D> {
    inner: D,
    breakers: Option<BreakerGroup>,
}

impl<D> BreakerDeadLetterStore<D> {
    pub fn new(inner: D, settings: &BreakerSettings) -> Self {
        let breakers = settings.enabled.then(|| {
            BreakerGroup::new(DEAD_LETTER_STORE_COMPONENT, DEAD_LETTER_OPERATIONS, settings)
        });
        Self { inner, breakers }
    }
}

#[async_trait]
impl<D: DeadLetterStore> DeadLetterStore for BreakerDeadLetterStore<D> {
    type Tx = D::Tx;

    async fn create(&self, tx: Option<&mut Self::Tx>, record: &DeadLetterRecord) -> StoreResult<()> {
        match &self.breakers {
            None => self.inner.create(tx, record).await,
            Some(group) => group
                .call("Create", || self.inner.create(tx, record))
                .await
                .map_err(|err| into_store_error(group, "Create", err)),
        }
    }
}
