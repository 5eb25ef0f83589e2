//! Batch task creation behind an object-safe trait.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use taskproc_core::TaskId;

use crate::store::{CreateError, TaskStore};

#[async_trait]
pub trait TaskCreator: Send + Sync {
    async fn create_tasks(&self, count: usize) -> Result<Vec<TaskId>, CreateError>;
}

pub struct StoreTaskCreator<S> {
    store: Arc<S>,
}

impl<S: TaskStore> StoreTaskCreator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: TaskStore + 'static> TaskCreator for StoreTaskCreator<S> {
    async fn create_tasks(&self, count: usize) -> Result<Vec<TaskId>, CreateError> {
        match self.store.create(count).await {
            Ok(ids) => {
                info!(count = ids.len(), "tasks created");
                Ok(ids)
            }
            Err(err) => {
                warn!(
                    requested = count,
                    inserted = err.inserted.len(),
                    error = %err.source,
                    "task creation incomplete"
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::testing::FaultyTaskStore;

    #[tokio::test]
    async fn creates_requested_number_of_tasks() {
        let store = InMemoryStore::new();
        let creator = StoreTaskCreator::new(Arc::new(store.clone()));

        let ids = creator.create_tasks(4).await.unwrap();
        assert_eq!(ids.len(), 4);
        assert_eq!(store.len().await, 4);
        for id in ids {
            assert!(store.get(id).await.is_some());
        }
    }

    #[tokio::test]
    async fn partial_create_reports_inserted_ids() {
        let store = FaultyTaskStore::failing_create_after(3);
        let creator = StoreTaskCreator::new(Arc::new(store.clone()));

        let err = creator.create_tasks(5).await.unwrap_err();
        assert_eq!(err.requested, 5);
        assert_eq!(err.inserted.len(), 3);
        for id in &err.inserted {
            assert!(store.memory.get(*id).await.is_some());
        }
        assert!(err.to_string().starts_with("failed to create tasks batch: inserted 3 of 5"));
    }
}
