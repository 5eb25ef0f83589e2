//! Transaction manager over the shared pool.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use sqlx::PgPool;
use tracing::{debug, error};

use super::{PgTx, map_sqlx_error};
use crate::store::{StoreError, TransactionManager};

#[derive(Debug, Clone)]
pub struct PgTransactionManager {
    pool: Arc<PgPool>,
}

impl PgTransactionManager {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl TransactionManager for PgTransactionManager {
    type Tx = PgTx;

    async fn with_transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        T: Send,
        E: From<StoreError> + Send,
        F: for<'t> FnOnce(&'t mut PgTx) -> BoxFuture<'t, Result<T, E>> + Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| E::from(map_sqlx_error("begin_transaction", e)))?;

        match f(&mut tx).await {
            Ok(value) => {
                tx.commit()
                    .await
                    .map_err(|e| E::from(map_sqlx_error("commit_transaction", e)))?;
                Ok(value)
            }
            Err(err) => {
                // The caller's error wins; a failed rollback only gets logged.
                match tx.rollback().await {
                    Ok(()) => debug!("transaction rolled back"),
                    Err(e) => error!(error = %e, "transaction rollback failed"),
                }
                Err(err)
            }
        }
    }
}
