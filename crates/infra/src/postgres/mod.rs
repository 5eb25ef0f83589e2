//! Postgres adapters for the store ports.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Storage` | Dead-letter record already archived |
//! | Database (check violation) | `23514` | `Storage` | Invalid status / attempt values |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed / PoolTimedOut | N/A | `Storage` | Pool closed or exhausted |
//! | RowNotFound | N/A | `Storage` | Unexpected (all lookups use `rows_affected`) |
//! | Other | N/A | `Storage` | Network errors, connection failures, etc. |
//!
//! `NotFound` is never produced from a driver error: mutations check
//! `rows_affected() == 0` themselves.
//!
//! ## Transaction scope
//!
//! Every adapter takes `Option<&mut PgTx>`. With a transaction the statement
//! runs on that connection, otherwise it goes straight to the pool.

use sqlx::postgres::{PgArguments, PgPoolOptions, PgQueryResult, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;

use crate::config::PostgresConfig;
use crate::store::StoreError;

pub mod dead_letter_store;
pub mod task_store;
pub mod transaction;

pub use dead_letter_store::PgDeadLetterStore;
pub use task_store::PgTaskStore;
pub use transaction::PgTransactionManager;

/// Transaction handle shared by all Postgres adapters.
pub type PgTx = Transaction<'static, Postgres>;

/// Build the connection pool from configuration.
pub async fn connect(config: &PostgresConfig) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_pool_size)
        .min_connections(config.min_pool_size)
        .max_lifetime(config.max_conn_lifetime)
        .idle_timeout(config.max_conn_idle_time)
        .acquire_timeout(config.connect_timeout)
        .connect(&config.url)
        .await
        .map_err(|e| map_sqlx_error("connect", e))?;

    info!(
        max_connections = config.max_pool_size,
        min_connections = config.min_pool_size,
        "postgres pool connected"
    );
    Ok(pool)
}

/// Apply the embedded schema migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::storage("migrate", e.to_string()))?;
    info!("database migrations applied");
    Ok(())
}

/// Round-trip a trivial statement; used by readiness checks.
pub async fn ping(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map(|_| ())
        .map_err(|e| map_sqlx_error("ping", e))
}

pub(crate) async fn execute_scoped(
    pool: &PgPool,
    tx: Option<&mut PgTx>,
    query: Query<'_, Postgres, PgArguments>,
) -> Result<PgQueryResult, sqlx::Error> {
    match tx {
        Some(tx) => query.execute(&mut **tx).await,
        None => query.execute(pool).await,
    }
}

pub(crate) async fn fetch_all_scoped(
    pool: &PgPool,
    tx: Option<&mut PgTx>,
    query: Query<'_, Postgres, PgArguments>,
) -> Result<Vec<PgRow>, sqlx::Error> {
    match tx {
        Some(tx) => query.fetch_all(&mut **tx).await,
        None => query.fetch_all(pool).await,
    }
}

/// Map SQLx errors to StoreError.
pub(crate) fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string());
            let message = match code.as_deref() {
                Some("23505") => format!("unique violation: {}", db_err.message()),
                Some("23514") => format!("check violation: {}", db_err.message()),
                Some(code) => format!("database error {}: {}", code, db_err.message()),
                None => format!("database error: {}", db_err.message()),
            };
            StoreError::storage(operation, message)
        }
        sqlx::Error::PoolClosed => StoreError::storage(operation, "connection pool closed"),
        sqlx::Error::PoolTimedOut => {
            StoreError::storage(operation, "timed out acquiring a connection")
        }
        sqlx::Error::RowNotFound => StoreError::storage(operation, "unexpected row not found"),
        other => StoreError::storage(operation, other.to_string()),
    }
}
