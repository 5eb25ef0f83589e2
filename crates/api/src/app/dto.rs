use serde::{Deserialize, Serialize};
use uuid::Uuid;

use taskproc_core::{BatchRequest, BatchSummary, TaskId};

use super::validation::{FieldErrors, Validate};

// -------------------------
// Request DTOs
// -------------------------

/// Body of `POST /api/v1/tasks/process`. Missing numbers default to zero and
/// are then rejected by validation where zero is out of range.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProcessTasksRequest {
    pub limit: i64,
    pub min_delay_ms: i64,
    pub max_delay_ms: i64,
    pub success_rate: f64,
}

pub const MAX_PROCESS_LIMIT: i64 = 1000;

impl Validate for ProcessTasksRequest {
    fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = FieldErrors::default();
        errors.range("limit", self.limit, 1, MAX_PROCESS_LIMIT);
        errors.min("min_delay_ms", self.min_delay_ms, 0);
        errors.min("max_delay_ms", self.max_delay_ms, 0);
        if self.max_delay_ms < self.min_delay_ms {
            errors.push("max_delay_ms", "must be greater than or equal to min_delay_ms");
        }
        if !self.success_rate.is_finite() || !(0.0..=1.0).contains(&self.success_rate) {
            errors.push("success_rate", "must be between 0 and 1");
        }
        errors.finish()
    }
}

impl ProcessTasksRequest {
    /// Only valid once `validate` passed.
    pub fn to_domain(&self) -> BatchRequest {
        BatchRequest {
            limit: self.limit.clamp(0, MAX_PROCESS_LIMIT) as u32,
            min_delay_ms: self.min_delay_ms,
            max_delay_ms: self.max_delay_ms,
            success_rate: self.success_rate,
        }
    }
}

/// Body of `POST /api/v1/tasks/batch-create`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BatchCreateTasksRequest {
    pub count: i64,
}

pub const MAX_BATCH_CREATE: i64 = 10_000;

impl Validate for BatchCreateTasksRequest {
    fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = FieldErrors::default();
        errors.range("count", self.count, 1, MAX_BATCH_CREATE);
        errors.finish()
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct ProcessTasksResponse {
    pub processed_count: u64,
    pub success_count: u64,
    pub failed_count: u64,
}

impl From<BatchSummary> for ProcessTasksResponse {
    fn from(summary: BatchSummary) -> Self {
        Self {
            processed_count: summary.processed_count,
            success_count: summary.success_count,
            failed_count: summary.failed_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchCreateTasksResponse {
    pub ids: Vec<Uuid>,
}

impl From<Vec<TaskId>> for BatchCreateTasksResponse {
    fn from(ids: Vec<TaskId>) -> Self {
        Self {
            ids: ids.into_iter().map(|id| *id.as_uuid()).collect(),
        }
    }
}
