//! Infrastructure wiring: stores, breakers, worker pool, processor, limiter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use taskproc_core::RandomProvider;
use taskproc_infra::postgres::{self, PgDeadLetterStore, PgTaskStore, PgTransactionManager};
use taskproc_infra::{
    AppConfig, BatchDispatcher, BatchProcessor, BreakerDeadLetterStore, BreakerTaskStore,
    DeadLetterStore, InMemoryStore, RedisRateLimiter, StaleTaskReaper, StorageBackend,
    StoreTaskCreator, TaskCreator, TaskProcessor, TaskStore, ThreadRngProvider,
    TransactionManager, WorkerPool,
};

/// Shutdown state shared by the health probes, handlers and `main`.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    shutting_down: Arc<AtomicBool>,
    token: CancellationToken,
}

impl Lifecycle {
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Flip the probes to 503. In-flight work keeps running.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Token handed to each processing request.
    pub fn request_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Abort pending delays in every request.
    pub fn cancel_requests(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Readiness dependencies, each pinged with a bounded timeout.
pub struct HealthChecks {
    postgres: Option<PgPool>,
    redis: Option<Arc<RedisRateLimiter>>,
    timeout: Duration,
}

impl HealthChecks {
    pub fn new(postgres: Option<PgPool>, redis: Option<Arc<RedisRateLimiter>>, timeout: Duration) -> Self {
        Self {
            postgres,
            redis,
            timeout,
        }
    }

    pub async fn ready(&self) -> bool {
        if let Some(pool) = &self.postgres {
            match tokio::time::timeout(self.timeout, postgres::ping(pool)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(error = %err, "postgres health check failed");
                    return false;
                }
                Err(_) => {
                    warn!(timeout_ms = self.timeout.as_millis() as u64, "postgres health check timed out");
                    return false;
                }
            }
        }
        if let Some(redis) = &self.redis {
            match tokio::time::timeout(self.timeout, redis.ping()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(error = %err, "redis health check failed");
                    return false;
                }
                Err(_) => {
                    warn!(timeout_ms = self.timeout.as_millis() as u64, "redis health check timed out");
                    return false;
                }
            }
        }
        true
    }
}

/// Everything the HTTP layer needs, behind trait objects.
pub struct AppServices {
    pub processor: Arc<dyn BatchProcessor>,
    pub creator: Arc<dyn TaskCreator>,
    pub health: HealthChecks,
    pub rate_limiter: Option<Arc<RedisRateLimiter>>,
    pub lifecycle: Lifecycle,
    pub request_timeout: Duration,
}

/// Services plus the background pieces `main` must stop.
pub struct ServiceHandles {
    pub services: Arc<AppServices>,
    pub pool: Arc<WorkerPool>,
    pub postgres: Option<PgPool>,
    pub reaper: Option<JoinHandle<()>>,
}

impl ServiceHandles {
    /// Stop background work and release connections.
    pub async fn shutdown(self) {
        self.services.lifecycle.cancel_requests();
        if let Some(reaper) = self.reaper {
            if let Err(err) = reaper.await {
                error!(error = %err, "stale task reaper did not stop cleanly");
            }
        }
        self.pool.shutdown().await;
        if let Some(pool) = self.postgres {
            pool.close().await;
            info!("postgres pool closed");
        }
    }
}

struct Wired {
    processor: Arc<dyn BatchProcessor>,
    creator: Arc<dyn TaskCreator>,
    reaper: Option<JoinHandle<()>>,
}

fn wire<S, D, M>(
    tasks: S,
    dead_letters: D,
    transactions: M,
    config: &AppConfig,
    pool: Arc<WorkerPool>,
    lifecycle: &Lifecycle,
) -> Wired
where
    M: TransactionManager + 'static,
    S: TaskStore<Tx = M::Tx> + 'static,
    D: DeadLetterStore<Tx = M::Tx> + 'static,
{
    let breaker = &config.circuit_breaker;
    let tasks = Arc::new(BreakerTaskStore::new(tasks, breaker));
    let dead_letters = Arc::new(BreakerDeadLetterStore::new(dead_letters, breaker));
    let random: Arc<dyn RandomProvider> = Arc::new(ThreadRngProvider);

    let processor = TaskProcessor::new(tasks.clone(), dead_letters, Arc::new(transactions), random);
    let reaper = config.reaper.enabled.then(|| {
        StaleTaskReaper::new(tasks.clone(), config.reaper.interval, config.reaper.lease_timeout)
            .spawn(lifecycle.token().clone())
    });

    Wired {
        processor: Arc::new(BatchDispatcher::new(processor, pool)),
        creator: Arc::new(StoreTaskCreator::new(tasks)),
        reaper,
    }
}

/// Build services from configuration. Must run inside the tokio runtime.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<ServiceHandles> {
    let lifecycle = Lifecycle::default();
    let pool = Arc::new(WorkerPool::new(config.worker_pool.max_workers));

    let (wired, pg) = match config.storage {
        StorageBackend::Memory => {
            info!("using in-memory task store");
            let store = InMemoryStore::new();
            let wired = wire(store.clone(), store.clone(), store, config, pool.clone(), &lifecycle);
            (wired, None)
        }
        StorageBackend::Postgres => {
            let pg_config = config
                .postgres
                .as_ref()
                .context("postgres backend selected without postgres settings")?;
            let pg = postgres::connect(pg_config)
                .await
                .context("failed to connect to postgres")?;
            if pg_config.run_migrations {
                postgres::run_migrations(&pg)
                    .await
                    .context("failed to apply migrations")?;
            }
            let wired = wire(
                PgTaskStore::new(pg.clone()),
                PgDeadLetterStore::new(pg.clone()),
                PgTransactionManager::new(pg.clone()),
                config,
                pool.clone(),
                &lifecycle,
            );
            (wired, Some(pg))
        }
    };

    let rate_limiter = match &config.redis {
        Some(redis) => {
            let limiter = RedisRateLimiter::new(&redis.url, config.rate_limit.rps)
                .context("invalid REDIS_URL")?;
            info!(rps = config.rate_limit.rps, "redis rate limiter enabled");
            Some(Arc::new(limiter))
        }
        None => {
            info!("REDIS_URL not set, rate limiting disabled");
            None
        }
    };

    let services = AppServices {
        processor: wired.processor,
        creator: wired.creator,
        health: HealthChecks::new(pg.clone(), rate_limiter.clone(), config.health.timeout),
        rate_limiter,
        lifecycle,
        request_timeout: config.http.request_timeout,
    };

    Ok(ServiceHandles {
        services: Arc::new(services),
        pool,
        postgres: pg,
        reaper: wired.reaper,
    })
}
