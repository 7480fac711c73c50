//! Pool configuration options

use std::time::Duration;

use crate::errors::{PoolError, PoolResult};

/// Configuration for resource pool behavior
///
/// Supplied once when the pool is constructed and validated by
/// [`ResourcePool::new`](crate::ResourcePool::new).
///
/// # Examples
///
/// ```
/// use esox_resourcepool::PoolConfiguration;
/// use std::time::Duration;
///
/// let config = PoolConfiguration::new()
///     .with_min_capacity(2)
///     .with_max_capacity(8)
///     .with_acquire_timeout(Duration::from_secs(2))
///     .with_idle_timeout(Duration::from_secs(600));
///
/// assert_eq!(config.max_capacity, 8);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfiguration {
    /// Number of handles the pool keeps alive once warmed up
    pub min_capacity: usize,

    /// Hard ceiling on live handles (including ones being created)
    pub max_capacity: usize,

    /// Default bound for `acquire_default` and for each `execute` attempt
    pub acquire_timeout: Duration,

    /// Idle handles unused for longer than this are evicted above the floor
    pub idle_timeout: Duration,

    /// Default retry ceiling for `execute_default`
    pub max_retries: u32,

    /// Base of the exponential backoff between retries
    pub retry_base_delay: Duration,

    /// Upper bound for a single backoff delay
    pub retry_max_delay: Duration,

    /// Period of the background maintenance loop
    pub maintenance_interval: Duration,

    /// Upper bound for a single health probe
    pub probe_timeout: Duration,

    /// Maximum number of queued waiters; `None` leaves the queue unbounded
    pub max_queue_length: Option<usize>,

    /// Number of recent wait durations kept for the rolling average
    pub metrics_window: usize,

    /// Enable circuit breaker protection around `execute`
    pub enable_circuit_breaker: bool,

    /// Consecutive terminal failures before the breaker opens
    pub circuit_breaker_threshold: usize,

    /// Time the breaker stays open before letting a trial request through
    pub circuit_breaker_timeout: Duration,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            min_capacity: 1,
            max_capacity: 10,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            maintenance_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            max_queue_length: None,
            metrics_window: 100,
            enable_circuit_breaker: false,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
        }
    }
}

impl PoolConfiguration {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the floor of handles kept alive
    pub fn with_min_capacity(mut self, min: usize) -> Self {
        self.min_capacity = min;
        self
    }

    /// Set the ceiling of live handles
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_resourcepool::PoolConfiguration;
    ///
    /// let config = PoolConfiguration::new().with_max_capacity(50);
    /// assert_eq!(config.max_capacity, 50);
    /// ```
    pub fn with_max_capacity(mut self, max: usize) -> Self {
        self.max_capacity = max;
        self
    }

    /// Set the default acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the idle eviction threshold
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the default retry ceiling and backoff base
    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay = base_delay;
        self
    }

    /// Cap a single backoff delay
    pub fn with_retry_max_delay(mut self, delay: Duration) -> Self {
        self.retry_max_delay = delay;
        self
    }

    /// Set the maintenance period
    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Set the probe timeout
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Bound the wait queue; further acquirers are rejected with
    /// [`PoolError::CapacityExhausted`]
    pub fn with_max_queue_length(mut self, len: usize) -> Self {
        self.max_queue_length = Some(len);
        self
    }

    /// Set the size of the rolling wait-time window
    pub fn with_metrics_window(mut self, size: usize) -> Self {
        self.metrics_window = size;
        self
    }

    /// Enable circuit breaker
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_resourcepool::PoolConfiguration;
    /// use std::time::Duration;
    ///
    /// let config = PoolConfiguration::new()
    ///     .with_circuit_breaker(5, Duration::from_secs(60));
    ///
    /// assert!(config.enable_circuit_breaker);
    /// assert_eq!(config.circuit_breaker_threshold, 5);
    /// ```
    pub fn with_circuit_breaker(mut self, threshold: usize, timeout: Duration) -> Self {
        self.enable_circuit_breaker = true;
        self.circuit_breaker_threshold = threshold;
        self.circuit_breaker_timeout = timeout;
        self
    }

    /// Check the configuration for contradictory values
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_capacity == 0 {
            return Err(invalid("max_capacity must be greater than 0"));
        }
        if self.min_capacity > self.max_capacity {
            return Err(invalid(format!(
                "min_capacity ({}) exceeds max_capacity ({})",
                self.min_capacity, self.max_capacity
            )));
        }
        if self.metrics_window == 0 {
            return Err(invalid("metrics_window must be greater than 0"));
        }
        if self.retry_base_delay > self.retry_max_delay {
            return Err(invalid("retry_base_delay exceeds retry_max_delay"));
        }
        if self.max_queue_length == Some(0) {
            return Err(invalid("max_queue_length must be greater than 0 when set"));
        }
        if self.maintenance_interval.is_zero() {
            return Err(invalid("maintenance_interval must be non-zero"));
        }
        if self.enable_circuit_breaker && self.circuit_breaker_threshold == 0 {
            return Err(invalid("circuit_breaker_threshold must be greater than 0"));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> PoolError {
    PoolError::InvalidConfiguration(msg.into())
}
