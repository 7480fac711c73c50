//! Health reporting for resource pools

use crate::metrics::PoolMetrics;

/// Utilization above which the pool reports itself unhealthy.
const HIGH_UTILIZATION: f64 = 0.9;

/// Health status of a resource pool
///
/// # Examples
///
/// ```
/// use esox_resourcepool::{AlwaysHealthy, BoxError, PoolConfiguration, ResourcePool};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let pool = ResourcePool::new(
///     || async { Ok::<_, BoxError>(1u32) },
///     AlwaysHealthy,
///     PoolConfiguration::new().with_min_capacity(2),
/// )
/// .unwrap();
/// pool.warmup().await.unwrap();
///
/// let health = pool.health_status();
/// assert!(health.is_healthy());
/// assert_eq!(health.idle_handles, 2);
/// # }
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct HealthStatus {
    /// Whether the pool is healthy
    pub is_healthy: bool,

    /// Number of warnings detected
    pub warning_count: usize,

    /// Current pool utilization (0.0 to 1.0)
    pub utilization: f64,

    pub idle_handles: usize,
    pub active_handles: usize,
    pub waiting: usize,
    pub min_capacity: usize,
    pub max_capacity: usize,

    /// Warning messages
    pub warnings: Vec<String>,
}

impl HealthStatus {
    /// Derive a health status from a metrics snapshot
    pub fn from_metrics(metrics: &PoolMetrics, shutting_down: bool) -> Self {
        let live = metrics.active_handles + metrics.idle_handles;
        let mut warnings = Vec::new();
        let mut is_healthy = true;

        if shutting_down {
            warnings.push("Pool is shutting down".to_string());
            is_healthy = false;
        }

        if metrics.utilization > HIGH_UTILIZATION {
            warnings.push(format!(
                "High utilization: {:.1}%",
                metrics.utilization * 100.0
            ));
            is_healthy = false;
        }

        if metrics.waiting > 0 {
            warnings.push(format!("{} caller(s) waiting for a handle", metrics.waiting));
        }

        if !shutting_down && live < metrics.min_capacity {
            warnings.push(format!(
                "Below minimum capacity: {live} of {}",
                metrics.min_capacity
            ));
        }

        Self {
            is_healthy,
            warning_count: warnings.len(),
            utilization: metrics.utilization,
            idle_handles: metrics.idle_handles,
            active_handles: metrics.active_handles,
            waiting: metrics.waiting,
            min_capacity: metrics.min_capacity,
            max_capacity: metrics.max_capacity,
            warnings,
        }
    }

    /// Check if the pool is healthy
    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(active: usize, idle: usize, waiting: usize) -> PoolMetrics {
        PoolMetrics {
            active_handles: active,
            idle_handles: idle,
            waiting,
            total_created: 0,
            total_destroyed: 0,
            avg_wait_ms: 0.0,
            total_ops: 0,
            failed_ops: 0,
            success_rate: 1.0,
            retried_attempts: 0,
            acquire_timeouts: 0,
            min_capacity: 2,
            max_capacity: 4,
            utilization: active as f64 / 4.0,
        }
    }

    #[test]
    fn test_saturated_pool_is_unhealthy() {
        let health = HealthStatus::from_metrics(&metrics(4, 0, 3), false);
        assert!(!health.is_healthy());
        assert_eq!(health.warning_count, 2);
    }

    #[test]
    fn test_below_floor_warns_but_stays_healthy() {
        let health = HealthStatus::from_metrics(&metrics(0, 1, 0), false);
        assert!(health.is_healthy());
        assert!(health.warnings[0].contains("Below minimum capacity"));
    }

    #[test]
    fn test_shutdown_is_unhealthy() {
        let health = HealthStatus::from_metrics(&metrics(0, 0, 0), true);
        assert!(!health.is_healthy());
        assert_eq!(health.warning_count, 1);
    }
}
