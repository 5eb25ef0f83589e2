//! Batch parameters and results.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::random::RandomProvider;

/// Parameters of one batch-processing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Maximum number of tasks to claim.
    pub limit: u32,
    pub min_delay_ms: i64,
    pub max_delay_ms: i64,
    /// Probability in `[0, 1]` that a processed task succeeds.
    pub success_rate: f64,
}

impl BatchRequest {
    pub fn delay_range(&self) -> DelayRange {
        DelayRange::from_bounds(self.min_delay_ms, self.max_delay_ms)
    }
}

/// Aggregated outcome of a batch. `processed_count = success_count + failed_count`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub processed_count: u64,
    pub success_count: u64,
    pub failed_count: u64,
}

impl BatchSummary {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_counts(success_count: u64, failed_count: u64) -> Self {
        Self {
            processed_count: success_count + failed_count,
            success_count,
            failed_count,
        }
    }
}

/// Inclusive bounds of the simulated per-task delay, in milliseconds.
///
/// Negative bounds clamp to zero and an upper bound below the lower bound
/// collapses onto it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DelayRange {
    min_ms: u64,
    max_ms: u64,
    active: bool,
}

impl DelayRange {
    pub fn from_bounds(min_ms: i64, max_ms: i64) -> Self {
        let min = min_ms.max(0);
        let max = max_ms.max(min);
        Self {
            min_ms: min as u64,
            max_ms: max as u64,
            active: min_ms > 0 || max_ms > 0,
        }
    }

    /// Whether any delay should be applied at all.
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn min_ms(&self) -> u64 {
        self.min_ms
    }

    pub fn max_ms(&self) -> u64 {
        self.max_ms
    }

    /// Draw a delay uniformly from `[min, max]`.
    pub fn sample(&self, random: &dyn RandomProvider) -> Duration {
        let span = self.max_ms - self.min_ms + 1;
        Duration::from_millis(self.min_ms + random.intn(span))
    }
}

/// Error message recorded on a task whose simulated outcome was a failure.
pub fn failure_message(success_rate: f64, attempts: i32, max_attempts: i32) -> String {
    format!(
        "processing failed according to success rate {:.2} (attempt {}/{})",
        success_rate, attempts, max_attempts
    )
}
