//! Retry policy and the per-call state machine driven by `execute`

use std::time::Duration;

use async_trait::async_trait;

use crate::config::PoolConfiguration;

/// Exponential backoff policy
///
/// # Examples
///
/// ```
/// use esox_resourcepool::{RetryPolicy, RetryState};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(2, Duration::from_millis(100), Duration::from_secs(1));
///
/// let state = policy.after_failure(0);
/// assert_eq!(
///     state,
///     RetryState::Backoff { next_attempt: 1, delay: Duration::from_millis(100) }
/// );
/// assert_eq!(policy.after_failure(2), RetryState::Exhausted { attempts: 3 });
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub(crate) fn from_config(config: &PoolConfiguration, max_retries: u32) -> Self {
        Self::new(max_retries, config.retry_base_delay, config.retry_max_delay)
    }

    /// Backoff after the failed attempt `attempt` (0-based): `base * 2^attempt`, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// State for the first attempt of a call
    pub fn start(&self) -> RetryState {
        RetryState::Attempt { attempt: 0 }
    }

    /// State after attempt `attempt` (0-based) failed
    pub fn after_failure(&self, attempt: u32) -> RetryState {
        if attempt < self.max_retries {
            RetryState::Backoff {
                next_attempt: attempt + 1,
                delay: self.delay_for(attempt),
            }
        } else {
            RetryState::Exhausted {
                attempts: attempt + 1,
            }
        }
    }
}

/// Phase of one `execute` call.
///
/// `Attempt -> (failure) -> Backoff -> Attempt -> ... -> Exhausted`. Success
/// ends the machine from any `Attempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Attempt { attempt: u32 },
    Backoff { next_attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
}

impl RetryState {
    /// Leave the backoff phase; other phases are returned unchanged
    pub fn after_backoff(self) -> Self {
        match self {
            Self::Backoff { next_attempt, .. } => Self::Attempt {
                attempt: next_attempt,
            },
            other => other,
        }
    }
}

/// Suspends the caller between retry attempts.
///
/// Swapping the sleeper lets tests observe backoff delays without waiting.
#[async_trait]
pub trait Sleeper: Send + Sync + 'static {
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(4, Duration::from_millis(100), Duration::from_millis(500))
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(2), Duration::from_millis(400));
        assert_eq!(p.delay_for(3), Duration::from_millis(500));
        assert_eq!(p.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_state_machine_walk() {
        let p = RetryPolicy::new(1, Duration::from_millis(10), Duration::from_secs(1));
        let mut state = p.start();
        assert_eq!(state, RetryState::Attempt { attempt: 0 });

        state = p.after_failure(0);
        assert!(matches!(state, RetryState::Backoff { next_attempt: 1, .. }));

        state = state.after_backoff();
        assert_eq!(state, RetryState::Attempt { attempt: 1 });

        assert_eq!(p.after_failure(1), RetryState::Exhausted { attempts: 2 });
    }

    #[test]
    fn test_zero_retries_exhausts_immediately() {
        let p = RetryPolicy::new(0, Duration::from_millis(10), Duration::from_secs(1));
        assert_eq!(p.after_failure(0), RetryState::Exhausted { attempts: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_sleeper_uses_timer() {
        let start = tokio::time::Instant::now();
        TokioSleeper.sleep(Duration::from_secs(3)).await;
        assert!(start.elapsed() >= Duration::from_secs(3));
    }
}
