//! Circuit breaker for the ingest endpoint.
//!
//! Wraps one fallible remote call. After `failure_threshold` consecutive
//! failures the circuit opens and calls fail fast without touching the
//! network; once the cooldown elapses a single trial call is admitted and
//! its outcome decides the next state. Retry policy lives in callers, never
//! here.

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use verdant_core::BreakerConfig;

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests flow normally
    Closed,
    /// Requests fail fast until the cooldown elapses
    Open,
    /// One trial call is in flight
    HalfOpen,
}

/// Breaker call error.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the wrapped operation was never invoked.
    #[error("Circuit breaker {name} is open")]
    Open { name: String },

    /// The wrapped operation failed; propagated as-is.
    #[error(transparent)]
    Inner(E),
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Failure-isolation wrapper around one remote operation.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    open_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker from config.
    pub fn new(name: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold,
            open_timeout: Duration::from_secs(config.open_timeout_secs),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Execute `op` through the breaker.
    ///
    /// When the circuit is open and inside its cooldown the future is never
    /// constructed; `BreakerError::Open` is returned with zero network
    /// activity. While a half-open trial call is in flight, concurrent
    /// callers are rejected the same way.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                BreakerState::Closed => {}
                BreakerState::Open => {
                    let elapsed = inner
                        .opened_at
                        .map(|at| at.elapsed())
                        .unwrap_or(Duration::MAX);
                    if elapsed < self.open_timeout {
                        return Err(BreakerError::Open {
                            name: self.name.clone(),
                        });
                    }
                    debug!(breaker = %self.name, "cooldown elapsed, admitting trial call");
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                }
                BreakerState::HalfOpen => {
                    if inner.trial_in_flight {
                        return Err(BreakerError::Open {
                            name: self.name.clone(),
                        });
                    }
                    inner.trial_in_flight = true;
                }
            }
        }

        // Lock released across the await; only the outcome mutates state.
        let result = op().await;

        let mut inner = self.inner.lock();
        match result {
            Ok(value) => {
                if inner.state != BreakerState::Closed {
                    debug!(breaker = %self.name, "circuit closed");
                }
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                Ok(value)
            }
            Err(e) => {
                inner.consecutive_failures += 1;
                inner.trial_in_flight = false;
                let should_open = inner.state == BreakerState::HalfOpen
                    || inner.consecutive_failures >= self.failure_threshold;
                if should_open {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "circuit opened"
                    );
                }
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Current state.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Consecutive failure count.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Manually close the circuit and clear counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }
}
