//! Per-operation circuit breakers.
//!
//! ## States
//!
//! - **Closed**: calls pass through; consecutive failures are counted. When
//!   `interval > 0` the counts are cleared every `interval`.
//! - **Open**: entered once consecutive failures exceed the threshold. Calls
//!   fail fast with [`BreakerError::Open`] until `timeout` elapses.
//! - **Half-open**: up to `max_requests` trial calls go through. Enough
//!   consecutive successes close the breaker; any failure reopens it.
//!
//! Each state change starts a new generation. Results of calls that started in
//! an older generation are ignored.
//!
//! Breaker state is shared by every caller of an operation and lives behind a
//! `std::sync::Mutex`, which is never held across an `.await`.

use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

pub mod decorator;
pub mod group;

pub use decorator::{BreakerDeadLetterStore, BreakerTaskStore};
pub use group::BreakerGroup;

/// Breaker tuning shared by every operation of a decorator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSettings {
    pub enabled: bool,
    /// Trial calls allowed while half-open.
    pub max_requests: u32,
    /// Cyclic period for clearing counts while closed. Zero never clears.
    pub interval: Duration,
    /// Time spent open before probing.
    pub timeout: Duration,
    /// Trip once consecutive failures exceed this.
    pub consecutive_failures: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 1,
            interval: Duration::ZERO,
            timeout: Duration::from_secs(30),
            consecutive_failures: 5,
        }
    }
}

impl BreakerSettings {
    /// Zero `max_requests` means one, zero `timeout` means sixty seconds.
    pub fn normalized(mut self) -> Self {
        if self.max_requests == 0 {
            self.max_requests = 1;
        }
        if self.timeout.is_zero() {
            self.timeout = Duration::from_secs(60);
        }
        self
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    HalfOpen,
    Open,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "closed",
            BreakerState::HalfOpen => "half-open",
            BreakerState::Open => "open",
        })
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_abandon(&mut self) {
        self.requests = self.requests.saturating_sub(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker is open")]
    Open,

    #[error("too many requests while circuit breaker is half-open")]
    TooManyRequests,

    #[error(transparent)]
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        let settings = settings.normalized();
        let mut inner = Inner {
            state: BreakerState::Closed,
            generation: 0,
            counts: Counts::default(),
            expiry: None,
        };
        new_generation(&mut inner, &settings, Instant::now());
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.current_state(&mut inner, Instant::now())
    }

    pub fn counts(&self) -> Counts {
        self.lock().counts
    }

    /// Run `f` under the breaker.
    ///
    /// A call whose future is dropped before completing (a cancelled caller)
    /// records no outcome and gives back its half-open trial slot.
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let generation = self.before_request()?;
        let mut pending = Pending {
            breaker: self,
            generation,
            settled: false,
        };

        let result = f().await;
        pending.settle(Some(result.is_ok()));
        result.map_err(BreakerError::Inner)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the counters inconsistent
        // in a way that matters; keep serving.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn before_request<E>(&self) -> Result<u64, BreakerError<E>> {
        let mut inner = self.lock();
        let now = Instant::now();
        match self.current_state(&mut inner, now) {
            BreakerState::Open => Err(BreakerError::Open),
            BreakerState::HalfOpen if inner.counts.requests >= self.settings.max_requests => {
                Err(BreakerError::TooManyRequests)
            }
            _ => {
                inner.counts.on_request();
                Ok(inner.generation)
            }
        }
    }

    fn after_request(&self, before: u64, success: bool) {
        let mut inner = self.lock();
        let now = Instant::now();
        let state = self.current_state(&mut inner, now);
        if inner.generation != before {
            return;
        }

        if success {
            inner.counts.on_success();
            if state == BreakerState::HalfOpen
                && inner.counts.consecutive_successes >= self.settings.max_requests
            {
                self.set_state(&mut inner, BreakerState::Closed, now);
            }
        } else {
            match state {
                BreakerState::Closed => {
                    inner.counts.on_failure();
                    if inner.counts.consecutive_failures > self.settings.consecutive_failures {
                        self.set_state(&mut inner, BreakerState::Open, now);
                    }
                }
                BreakerState::HalfOpen => self.set_state(&mut inner, BreakerState::Open, now),
                BreakerState::Open => {}
            }
        }
    }

    fn abandon_request(&self, before: u64) {
        let mut inner = self.lock();
        self.current_state(&mut inner, Instant::now());
        if inner.generation == before {
            inner.counts.on_abandon();
        }
    }

    fn current_state(&self, inner: &mut Inner, now: Instant) -> BreakerState {
        match inner.state {
            BreakerState::Closed => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    new_generation(inner, &self.settings, now);
                }
            }
            BreakerState::Open => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    self.set_state(inner, BreakerState::HalfOpen, now);
                }
            }
            BreakerState::HalfOpen => {}
        }
        inner.state
    }

    fn set_state(&self, inner: &mut Inner, state: BreakerState, now: Instant) {
        if inner.state == state {
            return;
        }
        let from = inner.state;
        inner.state = state;
        new_generation(inner, &self.settings, now);

        info!(
            component = %self.name,
            from = %from,
            to = %state,
            "circuit breaker state transition"
        );
    }
}

fn new_generation(inner: &mut Inner, settings: &BreakerSettings, now: Instant) {
    inner.generation += 1;
    inner.counts = Counts::default();
    inner.expiry = match inner.state {
        BreakerState::Closed if settings.interval.is_zero() => None,
        BreakerState::Closed => Some(now + settings.interval),
        BreakerState::Open => Some(now + settings.timeout),
        BreakerState::HalfOpen => None,
    };
}

/// Settles an admitted call exactly once, even if its future is dropped.
struct Pending<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    settled: bool,
}

impl Pending<'_> {
    /// `None` means the call never finished.
    fn settle(&mut self, outcome: Option<bool>) {
        if self.settled {
            return;
        }
        self.settled = true;
        match outcome {
            Some(success) => self.breaker.after_request(self.generation, success),
            None => self.breaker.abandon_request(self.generation),
        }
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        self.settle(None);
    }
}
