//! Postgres-backed task table.
//!
//! ## Claim protocol
//!
//! One statement selects eligible rows oldest-first with
//! `FOR UPDATE SKIP LOCKED`, flips them to `PROCESSING` and bumps `attempts`.
//! Concurrent claimers skip each other's locked rows instead of blocking, so
//! no task is ever handed out twice and no claimer waits on another.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument, warn};
use uuid::Uuid;

use taskproc_core::{Task, TaskId, TaskStatus};

use super::{PgTx, execute_scoped, fetch_all_scoped, map_sqlx_error};
use crate::store::{CreateError, StoreError, StoreResult, TaskStore};

const LEASE_EXPIRED_MESSAGE: &str = "processing lease expired";

/// Rows inserted per `create` statement. A failed chunk does not undo earlier ones.
const CREATE_CHUNK: usize = 500;

#[derive(Debug, Clone)]
pub struct PgTaskStore {
    pool: Arc<PgPool>,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    type Tx = PgTx;

    #[instrument(skip(self), fields(inserted = tracing::field::Empty), err)]
    async fn create(&self, count: usize) -> Result<Vec<TaskId>, CreateError> {
        let mut ids = Vec::with_capacity(count);
        let mut failures = Vec::new();

        let mut offset = 0;
        while offset < count {
            let chunk = CREATE_CHUNK.min(count - offset);
            let inserted = sqlx::query_scalar::<_, Uuid>(
                r#"
                INSERT INTO tasks (status)
                SELECT $1 FROM generate_series(1, $2)
                RETURNING id
                "#,
            )
            .bind(TaskStatus::New.as_str())
            .bind(chunk as i64)
            .fetch_all(&*self.pool)
            .await;

            match inserted {
                Ok(chunk_ids) => ids.extend(chunk_ids.into_iter().map(TaskId::from_uuid)),
                Err(e) => {
                    warn!(offset, chunk, error = %e, "task insert failed");
                    failures.push(format!("tasks {offset}..{}: {e}", offset + chunk));
                }
            }
            offset += chunk;
        }

        Span::current().record("inserted", ids.len());

        if failures.is_empty() {
            return Ok(ids);
        }
        let source = StoreError::storage("create_tasks", failures.join("; "));
        Err(CreateError {
            inserted: ids,
            requested: count,
            source,
        })
    }

    #[instrument(skip(self, tx), fields(claimed = tracing::field::Empty), err)]
    async fn claim(&self, tx: Option<&mut PgTx>, limit: u32) -> StoreResult<Vec<Task>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let query = sqlx::query(
            r#"
            UPDATE tasks
            SET
                status = $1,
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id IN (
                SELECT id FROM tasks
                WHERE status IN ($2, $3)
                  AND attempts < max_attempts
                ORDER BY created_at ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING
                id, status, created_at, updated_at,
                attempts, max_attempts, error_message
            "#,
        )
        .bind(TaskStatus::Processing.as_str())
        .bind(TaskStatus::New.as_str())
        .bind(TaskStatus::Failed.as_str())
        .bind(i64::from(limit));

        let rows = fetch_all_scoped(&self.pool, tx, query)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let task_row = TaskRow::from_row(&row).map_err(|e| map_sqlx_error("claim", e))?;
            tasks.push(Task::try_from(task_row)?);
        }
        // RETURNING order is unspecified.
        tasks.sort_by_key(|t| (t.created_at, t.id));

        Span::current().record("claimed", tasks.len());
        Ok(tasks)
    }

    #[instrument(skip(self, tx), fields(task_id = %id), err)]
    async fn mark_processed(&self, tx: Option<&mut PgTx>, id: TaskId) -> StoreResult<()> {
        let query = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $1, updated_at = NOW()
            WHERE id = $2 AND status = $3
            "#,
        )
        .bind(TaskStatus::Processed.as_str())
        .bind(id.as_uuid())
        .bind(TaskStatus::Processing.as_str());

        let result = execute_scoped(&self.pool, tx, query)
            .await
            .map_err(|e| map_sqlx_error("mark_processed", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, tx, message), fields(task_id = %id), err)]
    async fn mark_failed(&self, tx: Option<&mut PgTx>, id: TaskId, message: &str) -> StoreResult<()> {
        let query = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $1, error_message = $2, updated_at = NOW()
            WHERE id = $3 AND status = $4
            "#,
        )
        .bind(TaskStatus::Failed.as_str())
        .bind(message)
        .bind(id.as_uuid())
        .bind(TaskStatus::Processing.as_str());

        let result = execute_scoped(&self.pool, tx, query)
            .await
            .map_err(|e| map_sqlx_error("mark_failed", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self, tx), fields(task_id = %id), err)]
    async fn delete(&self, tx: Option<&mut PgTx>, id: TaskId) -> StoreResult<()> {
        let query = sqlx::query("DELETE FROM tasks WHERE id = $1").bind(id.as_uuid());

        let result = execute_scoped(&self.pool, tx, query)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(lease_secs = lease.as_secs()), err)]
    async fn requeue_stale(&self, lease: Duration) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $1, error_message = $2, updated_at = NOW()
            WHERE status = $3
              AND updated_at < NOW() - make_interval(secs => $4)
            "#,
        )
        .bind(TaskStatus::Failed.as_str())
        .bind(LEASE_EXPIRED_MESSAGE)
        .bind(TaskStatus::Processing.as_str())
        .bind(lease.as_secs_f64())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_stale", e))?;

        Ok(result.rows_affected())
    }
}

// SQLx row types

#[derive(Debug)]
struct TaskRow {
    id: Uuid,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    attempts: i32,
    max_attempts: i32,
    error_message: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskRow {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            error_message: row.try_get("error_message")?,
        })
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<TaskStatus>()
            .map_err(|e| StoreError::storage("decode_task", e.to_string()))?;
        Ok(Task {
            id: TaskId::from_uuid(row.id),
            status,
            created_at: row.created_at,
            updated_at: row.updated_at,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            error_message: row.error_message,
        })
    }
}
