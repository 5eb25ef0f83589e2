//! Batch processing: per-task state machine, bounded worker pool, dispatcher,
//! task creation and the optional stale-task reaper.

pub mod batch;
pub mod creator;
pub mod pool;
pub mod reaper;
pub mod single;

pub use batch::{BatchDispatcher, BatchProcessor, DispatchError};
pub use creator::{StoreTaskCreator, TaskCreator};
pub use pool::{PoolClosed, WorkerPool};
pub use reaper::StaleTaskReaper;
pub use single::{ProcessError, TaskProcessor};
