//! Request validation producing one message per failing field.

pub trait Validate {
    fn validate(&self) -> Result<(), Vec<String>>;
}

#[derive(Debug, Default)]
pub struct FieldErrors {
    errors: Vec<String>,
}

impl FieldErrors {
    pub fn push(&mut self, field: &str, message: &str) {
        self.errors.push(format!("{field}: {message}"));
    }

    pub fn min(&mut self, field: &str, value: i64, min: i64) {
        if value < min {
            self.push(field, &format!("must be at least {min}"));
        }
    }

    pub fn range(&mut self, field: &str, value: i64, min: i64, max: i64) {
        if value < min || value > max {
            self.push(field, &format!("must be between {min} and {max}"));
        }
    }

    pub fn finish(self) -> Result<(), Vec<String>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::dto::{BatchCreateTasksRequest, ProcessTasksRequest};

    fn process(limit: i64, min: i64, max: i64, rate: f64) -> ProcessTasksRequest {
        ProcessTasksRequest {
            limit,
            min_delay_ms: min,
            max_delay_ms: max,
            success_rate: rate,
        }
    }

    #[test]
    fn accepts_boundaries() {
        assert!(process(1, 0, 0, 0.0).validate().is_ok());
        assert!(process(1000, 100, 100, 1.0).validate().is_ok());
        assert!(BatchCreateTasksRequest { count: 10_000 }.validate().is_ok());
    }

    #[test]
    fn reports_each_failing_field() {
        let errors = process(0, -1, -5, 1.5).validate().unwrap_err();
        assert_eq!(errors.len(), 5);
        assert!(errors[0].starts_with("limit: "));
        assert!(errors.iter().any(|e| e.starts_with("min_delay_ms: ")));
        assert!(errors.iter().any(|e| e.starts_with("success_rate: ")));
    }

    #[test]
    fn rejects_inverted_delay_range() {
        let errors = process(5, 200, 100, 0.5).validate().unwrap_err();
        assert_eq!(
            errors,
            vec!["max_delay_ms: must be greater than or equal to min_delay_ms".to_string()]
        );
    }

    #[test]
    fn rejects_non_finite_rate() {
        assert!(process(5, 0, 0, f64::NAN).validate().is_err());
    }

    #[test]
    fn count_must_be_positive_and_bounded() {
        assert!(BatchCreateTasksRequest { count: 0 }.validate().is_err());
        assert!(BatchCreateTasksRequest { count: 10_001 }.validate().is_err());
    }
}
