//! `taskproc-core`: domain building blocks for the task queue.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! tasks and their lifecycle, dead-letter records, batch parameters and the
//! randomness port the processor draws outcomes from.

pub mod batch;
pub mod error;
pub mod id;
pub mod random;
pub mod task;

pub use batch::{BatchRequest, BatchSummary, DelayRange, failure_message};
pub use error::{DomainError, DomainResult};
pub use id::TaskId;
pub use random::RandomProvider;
pub use task::{DEFAULT_MAX_ATTEMPTS, DeadLetterRecord, Task, TaskStatus};
