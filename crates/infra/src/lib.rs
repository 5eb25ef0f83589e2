//! Infrastructure layer: storage adapters, resilience, batch processing and config.

pub mod breaker;
pub mod config;
pub mod memory;
pub mod postgres;
pub mod processing;
pub mod random;
#[cfg(feature = "redis")]
pub mod rate_limit;
pub mod store;
#[cfg(test)]
pub(crate) mod testing;

pub use breaker::{BreakerDeadLetterStore, BreakerSettings, BreakerTaskStore, CircuitBreaker};
pub use config::{AppConfig, ConfigError, StorageBackend};
pub use memory::InMemoryStore;
pub use processing::{
    BatchDispatcher, BatchProcessor, DispatchError, ProcessError, StaleTaskReaper,
    StoreTaskCreator, TaskCreator, TaskProcessor, WorkerPool,
};
pub use random::ThreadRngProvider;
#[cfg(feature = "redis")]
pub use rate_limit::{RateDecision, RateLimitError, RedisRateLimiter};
pub use store::{
    CreateError, DeadLetterStore, StoreError, StoreResult, TaskStore, TransactionManager,
};
