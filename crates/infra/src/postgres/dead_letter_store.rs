//! Postgres-backed dead-letter archive (`failed_tasks`). Append-only.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;

use taskproc_core::DeadLetterRecord;

use super::{PgTx, execute_scoped, map_sqlx_error};
use crate::store::{DeadLetterStore, StoreResult};

#[derive(Debug, Clone)]
pub struct PgDeadLetterStore {
    pool: Arc<PgPool>,
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    type Tx = PgTx;

    #[instrument(skip(self, tx, record), fields(task_id = %record.id), err)]
    async fn create(&self, tx: Option<&mut PgTx>, record: &DeadLetterRecord) -> StoreResult<()> {
        let query = sqlx::query(
            r#"
            INSERT INTO failed_tasks (
                id, status, created_at, updated_at,
                attempts, max_attempts, error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.attempts)
        .bind(record.max_attempts)
        .bind(record.error_message.as_deref());

        execute_scoped(&self.pool, tx, query)
            .await
            .map_err(|e| map_sqlx_error("create_dead_letter", e))?;
        Ok(())
    }
}
