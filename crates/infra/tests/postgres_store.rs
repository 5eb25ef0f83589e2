//! Postgres adapter tests. They run only when `TEST_DATABASE_URL` points at a
//! scratch database; the tables are truncated between scenarios.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use sqlx::PgPool;

use taskproc_core::{DeadLetterRecord, TaskId, TaskStatus};
use taskproc_infra::postgres::{self, PgDeadLetterStore, PgTaskStore, PgTransactionManager, PgTx};
use taskproc_infra::{DeadLetterStore, StoreError, TaskStore, TransactionManager};

async fn pool() -> Option<PgPool> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&url).await.expect("connect to TEST_DATABASE_URL");
    postgres::run_migrations(&pool).await.expect("migrations");
    Some(pool)
}

async fn reset(pool: &PgPool) {
    sqlx::query("TRUNCATE tasks, failed_tasks")
        .execute(pool)
        .await
        .unwrap();
}

async fn status_of(pool: &PgPool, id: TaskId) -> Option<String> {
    sqlx::query_scalar("SELECT status FROM tasks WHERE id = $1")
        .bind(id.as_uuid())
        .fetch_optional(pool)
        .await
        .unwrap()
}

async fn count(pool: &PgPool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn postgres_store_contract() {
    let Some(pool) = pool().await else {
        return;
    };

    create_then_claim_oldest_first(&pool).await;
    concurrent_claims_never_overlap(&pool).await;
    mutations_on_missing_rows_report_not_found(&pool).await;
    settling_requires_an_open_claim(&pool).await;
    large_create_spans_several_statements(&pool).await;
    failed_archive_rolls_back_delete(&pool).await;
    committed_archive_moves_row(&pool).await;
    stale_processing_rows_are_requeued(&pool).await;
}

async fn create_then_claim_oldest_first(pool: &PgPool) {
    reset(pool).await;
    let store = PgTaskStore::new(pool.clone());

    let ids = store.create(5).await.unwrap();
    assert_eq!(ids.len(), 5);

    let claimed = store.claim(None, 3).await.unwrap();
    assert_eq!(claimed.len(), 3);
    assert!(claimed.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    for task in &claimed {
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.attempts, 1);
    }

    store.mark_processed(None, claimed[0].id).await.unwrap();
    store.mark_failed(None, claimed[1].id, "boom").await.unwrap();
    assert_eq!(status_of(pool, claimed[0].id).await.as_deref(), Some("PROCESSED"));
    assert_eq!(status_of(pool, claimed[1].id).await.as_deref(), Some("FAILED"));

    // Two NEW plus the FAILED one are claimable again.
    assert_eq!(store.claim(None, 10).await.unwrap().len(), 3);
    assert!(store.claim(None, 0).await.unwrap().is_empty());
}

async fn concurrent_claims_never_overlap(pool: &PgPool) {
    reset(pool).await;
    let store = Arc::new(PgTaskStore::new(pool.clone()));
    store.create(60).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.claim(None, 10).await.unwrap() }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for task in handle.await.unwrap() {
            total += 1;
            assert!(seen.insert(task.id), "task {} claimed twice", task.id);
        }
    }
    assert!(total <= 60);
    assert_eq!(seen.len(), total);
}

async fn mutations_on_missing_rows_report_not_found(pool: &PgPool) {
    reset(pool).await;
    let store = PgTaskStore::new(pool.clone());
    let ghost = TaskId::new();

    assert_eq!(store.mark_processed(None, ghost).await, Err(StoreError::NotFound(ghost)));
    assert_eq!(store.mark_failed(None, ghost, "x").await, Err(StoreError::NotFound(ghost)));
    assert_eq!(store.delete(None, ghost).await, Err(StoreError::NotFound(ghost)));
}

async fn settling_requires_an_open_claim(pool: &PgPool) {
    reset(pool).await;
    let store = PgTaskStore::new(pool.clone());
    let id = store.create(1).await.unwrap()[0];

    assert_eq!(store.mark_processed(None, id).await, Err(StoreError::NotFound(id)));

    store.claim(None, 1).await.unwrap();
    store.mark_failed(None, id, "first owner").await.unwrap();
    assert_eq!(store.mark_processed(None, id).await, Err(StoreError::NotFound(id)));
    assert_eq!(status_of(pool, id).await.as_deref(), Some("FAILED"));
}

async fn large_create_spans_several_statements(pool: &PgPool) {
    reset(pool).await;
    let store = PgTaskStore::new(pool.clone());

    let ids = store.create(1_201).await.unwrap();
    assert_eq!(ids.len(), 1_201);
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 1_201);
    assert_eq!(count(pool, "tasks").await, 1_201);
}

fn archive(
    tasks: Arc<PgTaskStore>,
    dead_letters: Arc<PgDeadLetterStore>,
    record: DeadLetterRecord,
) -> impl for<'t> FnOnce(&'t mut PgTx) -> BoxFuture<'t, Result<(), StoreError>> + Send {
    move |tx| {
        Box::pin(async move {
            tasks.delete(Some(&mut *tx), record.id).await?;
            dead_letters.create(Some(&mut *tx), &record).await
        })
    }
}

async fn failed_archive_rolls_back_delete(pool: &PgPool) {
    reset(pool).await;
    let tasks = Arc::new(PgTaskStore::new(pool.clone()));
    let dead_letters = Arc::new(PgDeadLetterStore::new(pool.clone()));
    let tx = PgTransactionManager::new(pool.clone());

    tasks.create(1).await.unwrap();
    let task = tasks.claim(None, 1).await.unwrap().remove(0);
    let record = DeadLetterRecord::from(&task);

    // An archive row with the same id forces the insert inside the transaction to fail.
    dead_letters.create(None, &record).await.unwrap();

    let result = tx
        .with_transaction(archive(tasks.clone(), dead_letters.clone(), record))
        .await;
    assert!(matches!(result, Err(StoreError::Storage { .. })));
    assert_eq!(count(pool, "tasks").await, 1);
    assert_eq!(count(pool, "failed_tasks").await, 1);
}

async fn committed_archive_moves_row(pool: &PgPool) {
    reset(pool).await;
    let tasks = Arc::new(PgTaskStore::new(pool.clone()));
    let dead_letters = Arc::new(PgDeadLetterStore::new(pool.clone()));
    let tx = PgTransactionManager::new(pool.clone());

    tasks.create(1).await.unwrap();
    let task = tasks.claim(None, 1).await.unwrap().remove(0);

    tx.with_transaction(archive(tasks.clone(), dead_letters, DeadLetterRecord::from(&task)))
        .await
        .unwrap();
    assert_eq!(count(pool, "tasks").await, 0);
    assert_eq!(count(pool, "failed_tasks").await, 1);
}

async fn stale_processing_rows_are_requeued(pool: &PgPool) {
    reset(pool).await;
    let store = PgTaskStore::new(pool.clone());
    store.create(2).await.unwrap();
    let claimed = store.claim(None, 2).await.unwrap();

    sqlx::query("UPDATE tasks SET updated_at = NOW() - INTERVAL '1 hour' WHERE id = $1")
        .bind(claimed[0].id.as_uuid())
        .execute(pool)
        .await
        .unwrap();

    assert_eq!(store.requeue_stale(Duration::from_secs(300)).await.unwrap(), 1);
    assert_eq!(status_of(pool, claimed[0].id).await.as_deref(), Some("FAILED"));
    assert_eq!(status_of(pool, claimed[1].id).await.as_deref(), Some("PROCESSING"));
}
