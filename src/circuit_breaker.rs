//! Circuit breaker guarding `execute` against a failing backend

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Successes needed in half-open state before the breaker closes again.
const HALF_OPEN_SUCCESSES: usize = 3;

/// Circuit breaker state
///
/// # Examples
///
/// ```
/// use esox_resourcepool::{CircuitBreaker, CircuitBreakerState};
/// use std::time::Duration;
///
/// let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
/// assert_eq!(breaker.state(), CircuitBreakerState::Closed);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    /// Circuit is closed - normal operation
    Closed,

    /// Circuit is open - failing fast
    Open,

    /// Circuit is half-open - testing recovery
    HalfOpen,
}

struct BreakerInner {
    state: CircuitBreakerState,
    consecutive_failures: usize,
    half_open_successes: usize,
    opened_at: Option<Instant>,
}

/// Circuit breaker counting consecutive terminal failures
///
/// # Examples
///
/// ```
/// use esox_resourcepool::CircuitBreaker;
/// use std::time::Duration;
///
/// let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
///
/// breaker.record_failure();
/// breaker.record_failure();
/// breaker.record_failure();
///
/// // Circuit should be open after threshold
/// assert!(!breaker.allow_request());
/// ```
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: usize,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(failure_threshold: usize, reset_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitBreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
            }),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
        }
    }

    /// Get the current state
    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state
    }

    /// Check if the circuit breaker allows the operation
    ///
    /// An open breaker whose reset timeout has elapsed moves to half-open and
    /// lets the request through.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => true,
            CircuitBreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.reset_timeout);
                if elapsed {
                    inner.state = CircuitBreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    tracing::info!("circuit breaker half-open");
                }
                elapsed
            }
        }
    }

    /// Record a successful operation
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state == CircuitBreakerState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= HALF_OPEN_SUCCESSES {
                Self::close(&mut inner);
                tracing::info!("circuit breaker closed");
            }
        }
    }

    /// Record a failed operation
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        let trip = match inner.state {
            CircuitBreakerState::Closed => inner.consecutive_failures >= self.failure_threshold,
            // Any failure in half-open immediately opens the circuit
            CircuitBreakerState::HalfOpen => true,
            CircuitBreakerState::Open => false,
        };
        if trip {
            inner.state = CircuitBreakerState::Open;
            inner.opened_at = Some(Instant::now());
            tracing::warn!(
                failures = inner.consecutive_failures,
                "circuit breaker opened"
            );
        }
    }

    /// Reset the circuit breaker
    pub fn reset(&self) {
        Self::close(&mut self.inner.lock());
    }

    fn close(inner: &mut BreakerInner) {
        inner.state = CircuitBreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.half_open_successes = 0;
        inner.opened_at = None;
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(60))
    }
}
