//! Task lifecycle model.
//!
//! A task moves `NEW -> PROCESSING -> PROCESSED | FAILED`, with `FAILED` tasks
//! claimable again until their attempt budget runs out. Exhausted tasks leave
//! the active table and survive only as a [`DeadLetterRecord`].

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::TaskId;

/// Attempt budget given to tasks created without an explicit one.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    New,
    Processing,
    Processed,
    Failed,
}

impl TaskStatus {
    /// Persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::New => "NEW",
            TaskStatus::Processing => "PROCESSING",
            TaskStatus::Processed => "PROCESSED",
            TaskStatus::Failed => "FAILED",
        }
    }

    /// Statuses a claim may pick up.
    pub fn is_claimable(&self) -> bool {
        matches!(self, TaskStatus::New | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(TaskStatus::New),
            "PROCESSING" => Ok(TaskStatus::Processing),
            "PROCESSED" => Ok(TaskStatus::Processed),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(DomainError::invalid_status(other)),
        }
    }
}

/// A unit of work in the active table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented exactly once per claim.
    pub attempts: i32,
    /// Fixed at creation.
    pub max_attempts: i32,
    pub error_message: Option<String>,
}

impl Task {
    /// A fresh `NEW` task with the default attempt budget.
    pub fn new(id: TaskId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            status: TaskStatus::New,
            created_at: now,
            updated_at: now,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            error_message: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Whether a claim may select this task.
    pub fn is_eligible(&self) -> bool {
        self.status.is_claimable() && self.attempts < self.max_attempts
    }

    /// Whether the attempt budget is used up (the task must be dead-lettered).
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Immutable archive copy of a task that ran out of attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: TaskId,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub error_message: Option<String>,
}

impl From<&Task> for DeadLetterRecord {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            status: task.status,
            created_at: task.created_at,
            updated_at: task.updated_at,
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            error_message: task.error_message.clone(),
        }
    }
}
