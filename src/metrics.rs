//! Metrics collection and export for resource pools

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Metrics data for a pool
///
/// # Examples
///
/// ```
/// use esox_resourcepool::{AlwaysHealthy, BoxError, PoolConfiguration, ResourcePool};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let pool = ResourcePool::new(
///     || async { Ok::<_, BoxError>(0u8) },
///     AlwaysHealthy,
///     PoolConfiguration::new().with_min_capacity(0),
/// )
/// .unwrap();
///
/// let lease = pool.acquire_default().await.unwrap();
/// let metrics = pool.metrics();
/// assert_eq!(metrics.total_created, 1);
/// assert_eq!(metrics.active_handles, 1);
/// drop(lease);
/// assert_eq!(pool.metrics().idle_handles, 1);
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PoolMetrics {
    /// Handles currently held by callers
    pub active_handles: usize,

    /// Handles not held by callers (including ones being probed)
    pub idle_handles: usize,

    /// Callers queued for a handle
    pub waiting: usize,

    /// Handles created since the pool was built
    pub total_created: u64,

    /// Handles destroyed since the pool was built
    pub total_destroyed: u64,

    /// Rolling average of recent acquire wait times
    pub avg_wait_ms: f64,

    /// `execute` calls that reached a terminal outcome
    pub total_ops: u64,

    /// `execute` calls whose terminal outcome was a failure
    pub failed_ops: u64,

    /// `(total_ops - failed_ops) / total_ops`, 1.0 before any operation
    pub success_rate: f64,

    /// Intermediate attempts that failed and were retried
    pub retried_attempts: u64,

    /// `acquire` calls that gave up waiting
    pub acquire_timeouts: u64,

    pub min_capacity: usize,
    pub max_capacity: usize,

    /// Active handles over maximum capacity (0.0 to 1.0)
    pub utilization: f64,
}

impl PoolMetrics {
    /// Export metrics as a HashMap
    pub fn export(&self) -> HashMap<String, String> {
        let mut metrics = HashMap::new();
        metrics.insert("active".to_string(), self.active_handles.to_string());
        metrics.insert("idle".to_string(), self.idle_handles.to_string());
        metrics.insert("waiting".to_string(), self.waiting.to_string());
        metrics.insert("total_created".to_string(), self.total_created.to_string());
        metrics.insert("total_destroyed".to_string(), self.total_destroyed.to_string());
        metrics.insert("avg_wait_ms".to_string(), format!("{:.2}", self.avg_wait_ms));
        metrics.insert("total_ops".to_string(), self.total_ops.to_string());
        metrics.insert("failed_ops".to_string(), self.failed_ops.to_string());
        metrics.insert("success_rate".to_string(), format!("{:.4}", self.success_rate));
        metrics.insert("retried_attempts".to_string(), self.retried_attempts.to_string());
        metrics.insert("acquire_timeouts".to_string(), self.acquire_timeouts.to_string());
        metrics.insert("utilization".to_string(), format!("{:.2}", self.utilization));
        metrics.insert("max_capacity".to_string(), self.max_capacity.to_string());
        metrics
    }
}

/// Point-in-time registry counts fed into a snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Occupancy {
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
    pub min_capacity: usize,
    pub max_capacity: usize,
}

/// Rolling wait-time window plus monotonic counters. Lives inside the pool
/// state and is guarded by the same lock as the registry.
pub(crate) struct MetricsWindow {
    waits: VecDeque<Duration>,
    window: usize,
    wait_sum: Duration,
    pub handles_created: u64,
    pub handles_destroyed: u64,
    pub total_ops: u64,
    pub failed_ops: u64,
    pub retried_attempts: u64,
    pub acquire_timeouts: u64,
}

impl MetricsWindow {
    pub fn new(window: usize) -> Self {
        Self {
            waits: VecDeque::with_capacity(window.min(1024)),
            window: window.max(1),
            wait_sum: Duration::ZERO,
            handles_created: 0,
            handles_destroyed: 0,
            total_ops: 0,
            failed_ops: 0,
            retried_attempts: 0,
            acquire_timeouts: 0,
        }
    }

    pub fn record_wait(&mut self, waited: Duration) {
        if self.waits.len() == self.window
            && let Some(oldest) = self.waits.pop_front()
        {
            self.wait_sum -= oldest;
        }
        self.waits.push_back(waited);
        self.wait_sum += waited;
    }

    pub fn record_outcome(&mut self, success: bool) {
        self.total_ops += 1;
        if !success {
            self.failed_ops += 1;
        }
    }

    pub fn avg_wait_ms(&self) -> f64 {
        if self.waits.is_empty() {
            return 0.0;
        }
        self.wait_sum.as_secs_f64() * 1000.0 / self.waits.len() as f64
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_ops == 0 {
            return 1.0;
        }
        (self.total_ops - self.failed_ops) as f64 / self.total_ops as f64
    }

    pub fn snapshot(&self, occupancy: Occupancy) -> PoolMetrics {
        let utilization = if occupancy.max_capacity > 0 {
            occupancy.active as f64 / occupancy.max_capacity as f64
        } else {
            0.0
        };

        PoolMetrics {
            active_handles: occupancy.active,
            idle_handles: occupancy.idle,
            waiting: occupancy.waiting,
            total_created: self.handles_created,
            total_destroyed: self.handles_destroyed,
            avg_wait_ms: self.avg_wait_ms(),
            total_ops: self.total_ops,
            failed_ops: self.failed_ops,
            success_rate: self.success_rate(),
            retried_attempts: self.retried_attempts,
            acquire_timeouts: self.acquire_timeouts,
            min_capacity: occupancy.min_capacity,
            max_capacity: occupancy.max_capacity,
            utilization,
        }
    }
}

/// Metrics exporter for Prometheus format
#[cfg(feature = "prometheus")]
pub struct MetricsExporter;

#[cfg(feature = "prometheus")]
impl MetricsExporter {
    /// Export metrics in Prometheus exposition format
    ///
    /// Every series carries a `pool` label plus the optional `tags`.
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_resourcepool::{AlwaysHealthy, BoxError, PoolConfiguration, ResourcePool};
    /// use std::collections::HashMap;
    ///
    /// let pool = ResourcePool::new(
    ///     || async { Ok::<_, BoxError>(()) },
    ///     AlwaysHealthy,
    ///     PoolConfiguration::default(),
    /// )
    /// .unwrap();
    ///
    /// let mut tags = HashMap::new();
    /// tags.insert("service".to_string(), "api".to_string());
    ///
    /// let output = pool.export_metrics_prometheus("backend", Some(&tags)).unwrap();
    /// assert!(output.contains("resourcepool_handles_active"));
    /// assert!(output.contains("service=\"api\""));
    /// ```
    pub fn export_prometheus(
        metrics: &PoolMetrics,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> Result<String, prometheus::Error> {
        use prometheus::{Gauge, IntCounter, IntGauge, Registry, TextEncoder};

        let mut labels = tags.cloned().unwrap_or_default();
        labels.insert("pool".to_string(), pool_name.to_string());
        let registry = Registry::new_custom(Some("resourcepool".to_string()), Some(labels))?;

        let gauges = [
            ("handles_active", "Handles currently held by callers", metrics.active_handles),
            ("handles_idle", "Handles available for checkout", metrics.idle_handles),
            ("waiters", "Callers queued for a handle", metrics.waiting),
            ("capacity_max", "Maximum live handles", metrics.max_capacity),
        ];
        for (name, help, value) in gauges {
            let gauge = IntGauge::new(name, help)?;
            gauge.set(i64::try_from(value).unwrap_or(i64::MAX));
            registry.register(Box::new(gauge))?;
        }

        let ratios = [
            ("wait_ms_avg", "Rolling average acquire wait in milliseconds", metrics.avg_wait_ms),
            ("success_rate", "Share of operations that succeeded", metrics.success_rate),
            ("utilization", "Active handles over maximum capacity", metrics.utilization),
        ];
        for (name, help, value) in ratios {
            let gauge = Gauge::new(name, help)?;
            gauge.set(value);
            registry.register(Box::new(gauge))?;
        }

        let counters = [
            ("handles_created_total", "Handles created", metrics.total_created),
            ("handles_destroyed_total", "Handles destroyed", metrics.total_destroyed),
            ("operations_total", "Operations executed", metrics.total_ops),
            ("operations_failed_total", "Operations failed after retries", metrics.failed_ops),
            ("operation_retries_total", "Attempts retried", metrics.retried_attempts),
            ("acquire_timeouts_total", "Acquire calls that timed out", metrics.acquire_timeouts),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::new(name, help)?;
            counter.inc_by(value);
            registry.register(Box::new(counter))?;
        }

        TextEncoder::new().encode_to_string(&registry.gather())
    }
}
