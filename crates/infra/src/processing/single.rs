//! Processing of one claimed task.
//!
//! 1. Exhausted tasks (`attempts >= max_attempts`) are deleted and archived in
//!    one transaction. The outcome is a failure.
//! 2. Otherwise an optional simulated delay runs, aborted by cancellation.
//! 3. A uniform draw `r` decides the outcome: success iff `r <= success_rate`.
//! 4. The task is marked processed or failed accordingly.
//!
//! Cancellation aborts the delay and every store step. An aborted step is
//! dropped, which rolls back its transaction, and the task stays in
//! `PROCESSING`.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use taskproc_core::{failure_message, BatchRequest, DeadLetterRecord, RandomProvider, Task};

use crate::store::{DeadLetterStore, StoreError, TaskStore, TransactionManager};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("{context}: {source}")]
    Store {
        context: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("processing cancelled")]
    Cancelled,
}

impl ProcessError {
    /// True when a breaker failed fast and the store was never called.
    pub fn is_breaker_rejection(&self) -> bool {
        matches!(self, ProcessError::Store { source, .. } if source.is_breaker_rejection())
    }

    fn store(context: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| ProcessError::Store { context, source }
    }
}

impl From<StoreError> for ProcessError {
    fn from(source: StoreError) -> Self {
        ProcessError::Store {
            context: "transaction failed",
            source,
        }
    }
}

pub struct TaskProcessor<S, D, M> {
    tasks: Arc<S>,
    dead_letters: Arc<D>,
    transactions: Arc<M>,
    random: Arc<dyn RandomProvider>,
}

impl<S, D, M> Clone for TaskProcessor<S, D, M> {
    fn clone(&self) -> Self {
        Self {
            tasks: self.tasks.clone(),
            dead_letters: self.dead_letters.clone(),
            transactions: self.transactions.clone(),
            random: self.random.clone(),
        }
    }
}

impl<S, D, M> TaskProcessor<S, D, M>
where
    M: TransactionManager + 'static,
    S: TaskStore<Tx = M::Tx> + 'static,
    D: DeadLetterStore<Tx = M::Tx> + 'static,
{
    pub fn new(
        tasks: Arc<S>,
        dead_letters: Arc<D>,
        transactions: Arc<M>,
        random: Arc<dyn RandomProvider>,
    ) -> Self {
        Self {
            tasks,
            dead_letters,
            transactions,
            random,
        }
    }

    pub fn tasks(&self) -> &Arc<S> {
        &self.tasks
    }

    /// Run one task. `Ok(true)` means processed, `Ok(false)` means the task
    /// failed this attempt or was dead-lettered.
    pub async fn process(
        &self,
        task: Task,
        request: &BatchRequest,
        cancel: &CancellationToken,
    ) -> Result<bool, ProcessError> {
        if task.is_exhausted() {
            return self.dead_letter(task, cancel).await;
        }

        let delay = request.delay_range();
        if delay.is_active() {
            let wait = delay.sample(self.random.as_ref());
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProcessError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        if self.random.float64() <= request.success_rate {
            unless_cancelled(cancel, async {
                self.tasks
                    .mark_processed(None, task.id)
                    .await
                    .map_err(ProcessError::store("failed to mark task as processed"))
            })
            .await?;
            debug!(task_id = %task.id, attempts = task.attempts, "task processed");
            Ok(true)
        } else {
            let message = failure_message(request.success_rate, task.attempts, task.max_attempts);
            unless_cancelled(cancel, async {
                self.tasks
                    .mark_failed(None, task.id, &message)
                    .await
                    .map_err(ProcessError::store("failed to mark task as failed"))
            })
            .await?;
            debug!(task_id = %task.id, attempts = task.attempts, "task failed");
            Ok(false)
        }
    }

    async fn dead_letter(&self, task: Task, cancel: &CancellationToken) -> Result<bool, ProcessError> {
        let tasks = self.tasks.clone();
        let dead_letters = self.dead_letters.clone();
        let record = DeadLetterRecord::from(&task);

        let archive = self.transactions.with_transaction(move |tx| {
            Box::pin(async move {
                tasks
                    .delete(Some(&mut *tx), record.id)
                    .await
                    .map_err(ProcessError::store("failed to delete task"))?;
                dead_letters
                    .create(Some(&mut *tx), &record)
                    .await
                    .map_err(ProcessError::store("failed to create failed task record"))?;
                Ok::<_, ProcessError>(())
            })
        });
        unless_cancelled(cancel, archive).await?;

        info!(
            task_id = %task.id,
            attempts = task.attempts,
            max_attempts = task.max_attempts,
            "task exceeded max attempts, moved to dead letter"
        );
        Ok(false)
    }
}

/// Run `step` unless `cancel` fires first; a cancelled step is dropped unfinished.
async fn unless_cancelled<T, F>(cancel: &CancellationToken, step: F) -> Result<T, ProcessError>
where
    F: Future<Output = Result<T, ProcessError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProcessError::Cancelled),
        result = step => result,
    }
}
