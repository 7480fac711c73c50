//! # Esox ResourcePool
//!
//! Bounded async pool of backend client handles with FIFO waiting,
//! retrying execution, idle eviction and health probes.
//!
//! ## Features
//!
//! - Capacity bounds: never more than `max_capacity` live handles
//! - Automatic return of handles via RAII (Drop trait)
//! - FIFO wait queue with per-call timeout and cancellation
//! - `execute` with exponential backoff retries
//! - Background maintenance: idle eviction, health probes, floor refill
//! - Rolling metrics, health status and Prometheus export
//! - Optional circuit breaker
//!
//! ## Quick Start
//!
//! ```rust
//! use esox_resourcepool::{AlwaysHealthy, BoxError, PoolConfiguration, ResourcePool};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let pool = ResourcePool::new(
//!     || async { Ok::<_, BoxError>(vec![1u8, 2, 3]) },
//!     AlwaysHealthy,
//!     PoolConfiguration::new().with_max_capacity(4),
//! )
//! .unwrap();
//! {
//!     let client = pool.acquire(Duration::from_secs(1)).await.unwrap();
//!     println!("Got: {:?}", *client);
//!     // Handle automatically returned when `client` goes out of scope
//! }
//! # }
//! ```

mod circuit_breaker;
mod config;
mod errors;
mod events;
mod eviction;
mod handle;
mod health;
mod maintenance;
mod metrics;
mod pool;
mod retry;
mod telemetry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerState};
pub use config::PoolConfiguration;
pub use errors::{BoxError, PoolError, PoolResult, SharedError};
pub use events::{DestroyReason, EventSink, InMemoryEventSink, PoolEvent, TracingEventSink};
pub use handle::{AlwaysHealthy, HandleFactory, HandleId, HandleInfo, HandleState, Probe};
pub use health::HealthStatus;
pub use maintenance::MaintenanceReport;
#[cfg(feature = "prometheus")]
pub use metrics::MetricsExporter;
pub use metrics::PoolMetrics;
pub use pool::{PooledHandle, ResourcePool, ResourcePoolBuilder};
pub use retry::{RetryPolicy, RetryState, Sleeper, TokioSleeper};
pub use telemetry::init_tracing;
