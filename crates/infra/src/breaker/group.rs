//! Named breakers for one component, one breaker per operation.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::time::Instant;

use tracing::{debug, error, warn};

use super::{BreakerError, BreakerSettings, CircuitBreaker};

#[derive(Debug)]
pub struct BreakerGroup {
    component: &'static str,
    breakers: HashMap<&'static str, CircuitBreaker>,
}

impl BreakerGroup {
    /// Breakers are named `{component}-{operation}`.
    pub fn new(
        component: &'static str,
        operations: &[&'static str],
        settings: &BreakerSettings,
    ) -> Self {
        let breakers = operations
            .iter()
            .map(|op| {
                let name = format!("{component}-{op}");
                (*op, CircuitBreaker::new(name, settings.clone()))
            })
            .collect();
        Self {
            component,
            breakers,
        }
    }

    pub fn breaker(&self, operation: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(operation)
    }

    /// Breaker name for `operation`, used in rejection errors.
    pub fn name_of(&self, operation: &str) -> String {
        format!("{}-{operation}", self.component)
    }

    /// Run `f` under the breaker registered for `operation`.
    ///
    /// Operations without a breaker run unprotected.
    pub async fn call<T, E, F, Fut>(
        &self,
        operation: &'static str,
        f: F,
    ) -> Result<T, BreakerError<E>>
    where
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(breaker) = self.breakers.get(operation) else {
            warn!(
                component = self.component,
                operation, "no circuit breaker registered for operation"
            );
            return f().await.map_err(BreakerError::Inner);
        };

        debug!(
            name = breaker.name(),
            operation,
            state = %breaker.state(),
            "executing through circuit breaker"
        );

        let started = Instant::now();
        let result = breaker.execute(f).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => debug!(
                name = breaker.name(),
                operation,
                state = %breaker.state(),
                duration_ms,
                "circuit breaker operation succeeded"
            ),
            Err(BreakerError::Open) => warn!(
                name = breaker.name(),
                operation, "circuit breaker open, request rejected"
            ),
            Err(BreakerError::TooManyRequests) => warn!(
                name = breaker.name(),
                operation, "circuit breaker half-open, too many requests"
            ),
            Err(BreakerError::Inner(err)) => error!(
                name = breaker.name(),
                operation,
                state = %breaker.state(),
                duration_ms,
                error = %err,
                "circuit breaker operation failed"
            ),
        }

        result
    }
}
