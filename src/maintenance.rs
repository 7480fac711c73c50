//! Periodic upkeep: idle eviction, health probes and floor refill

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::errors::PoolError;
use crate::events::{DestroyReason, PoolEvent};
use crate::eviction::{IdleCandidate, select_idle_evictions};
use crate::handle::HandleState;
use crate::pool::PoolInner;

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Idle handles destroyed for exceeding the idle timeout
    pub evicted: usize,
    pub probed: usize,
    pub probe_failures: usize,
    /// Handles created to bring the pool back to its floor
    pub replenished: usize,
}

pub(crate) async fn run_once<C: Send + Sync + 'static>(inner: &PoolInner<C>) -> MaintenanceReport {
    let mut report = MaintenanceReport::default();
    let mut events = Vec::new();

    let probing = {
        let mut state = inner.state.lock();
        if state.closing {
            return report;
        }
        let now = Instant::now();

        let candidates = state
            .handles
            .iter()
            .filter(|(_, h)| h.is_idle())
            .map(|(id, h)| IdleCandidate {
                id: *id,
                idle_for: h.idle_for(now),
            })
            .collect();
        let registered = state.handles.len();
        for id in select_idle_evictions(
            candidates,
            inner.config.idle_timeout,
            registered,
            inner.config.min_capacity,
        ) {
            if state.destroy(id, DestroyReason::IdleTimeout, &mut events) {
                report.evicted += 1;
            }
        }

        let mut probing = Vec::new();
        for (id, entry) in state.handles.iter_mut().filter(|(_, h)| h.is_idle()) {
            entry.state = HandleState::Probing;
            probing.push((*id, Arc::clone(&entry.client)));
        }
        probing
    };
    inner.finish(std::mem::take(&mut events), false);

    for (id, client) in probing {
        report.probed += 1;
        let failure = match tokio::time::timeout(inner.config.probe_timeout, inner.probe.probe(client)).await {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err.to_string()),
            Err(_) => Some(format!("probe timed out after {:?}", inner.config.probe_timeout)),
        };

        let drained = {
            let mut state = inner.state.lock();
            let now = Instant::now();
            match failure {
                _ if state.handles.get(&id).map(|h| h.state) != Some(HandleState::Probing) => {}
                Some(reason) => {
                    let error = PoolError::ProbeFailed(reason.clone());
                    tracing::warn!(%id, %error, "destroying unhealthy handle");
                    report.probe_failures += 1;
                    state.destroy(id, DestroyReason::ProbeFailed(reason), &mut events);
                    state.free_capacity(inner.config.max_capacity, now, &mut events);
                }
                None if state.closing => {
                    state.destroy(id, DestroyReason::Shutdown, &mut events);
                }
                None => state.return_to_service(id, now, &mut events),
            }
            state.is_drained()
        };
        inner.finish(std::mem::take(&mut events), drained);
    }

    let (replenished, error) = inner.fill_to_floor().await;
    report.replenished = replenished;
    if let Some(err) = error {
        tracing::warn!(error = %err, "failed to refill pool to minimum capacity");
    }

    inner.emit(PoolEvent::MetricsSnapshot(inner.metrics()));
    report
}

/// Spawn the periodic maintenance task. It holds only a weak reference, so
/// dropping the last pool clone ends it, as does shutdown.
pub(crate) fn spawn<C: Send + Sync + 'static>(inner: &Arc<PoolInner<C>>) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    let mut shutdown_rx = inner.shutdown_tx.subscribe();
    let period = inner.config.maintenance_interval;

    tokio::spawn(async move {
        if *shutdown_rx.borrow() {
            return;
        }
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.changed() => break,
            }
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let report = run_once(&inner).await;
            tracing::debug!(?report, "maintenance pass complete");
        }
        tracing::debug!("maintenance task stopped");
    })
}

#[cfg(test)]
mod tests {
    use crate::config::PoolConfiguration;
    use crate::errors::BoxError;
    use crate::events::{DestroyReason, InMemoryEventSink};
    use crate::handle::{AlwaysHealthy, HandleFactory};
    use crate::pool::ResourcePool;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct Numbered(AtomicU32);

    #[async_trait]
    impl HandleFactory<u32> for Numbered {
        async fn create(&self) -> Result<u32, BoxError> {
            Ok(self.0.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn numbered() -> Numbered {
        Numbered(AtomicU32::new(0))
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_expired_down_to_floor() {
        let config = PoolConfiguration::new()
            .with_min_capacity(1)
            .with_max_capacity(3)
            .with_idle_timeout(Duration::from_secs(60));
        let pool = ResourcePool::new(numbered(), AlwaysHealthy, config).unwrap();

        let leases = vec![
            pool.acquire_default().await.unwrap(),
            pool.acquire_default().await.unwrap(),
            pool.acquire_default().await.unwrap(),
        ];
        drop(leases);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(pool.run_maintenance().await.evicted, 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        let report = pool.run_maintenance().await;
        assert_eq!(report.evicted, 2);
        assert_eq!(report.replenished, 0);
        assert_eq!(pool.size(), 1);
    }

    /// Creations past the first two block until the gate opens.
    struct Gated {
        next: AtomicU32,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl HandleFactory<u32> for Gated {
        async fn create(&self) -> Result<u32, BoxError> {
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            if n >= 2 {
                self.gate.acquire().await?.forget();
            }
            Ok(n)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_creation_does_not_widen_eviction() {
        let gate = Arc::new(Semaphore::new(0));
        let factory = Gated {
            next: AtomicU32::new(0),
            gate: Arc::clone(&gate),
        };
        let config = PoolConfiguration::new()
            .with_min_capacity(1)
            .with_max_capacity(3)
            .with_idle_timeout(Duration::from_secs(10));
        let pool = ResourcePool::new(factory, AlwaysHealthy, config).unwrap();

        let a = pool.acquire_default().await.unwrap();
        let b = pool.acquire_default().await.unwrap();
        let pending = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire_default().await.map(|h| h.id()) })
        };
        while pool.size() < 3 {
            tokio::task::yield_now().await;
        }
        drop((a, b));

        tokio::time::advance(Duration::from_secs(11)).await;
        let report = pool.run_maintenance().await;
        assert_eq!(report.evicted, 1);
        assert_eq!(pool.handles().len(), 1);

        gate.add_permits(1);
        assert!(pending.await.unwrap().is_ok());
        assert_eq!(pool.handles().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_destroys_and_refills() {
        let sink = Arc::new(InMemoryEventSink::new(32));
        let probe = |client: Arc<u32>| async move {
            if *client == 0 {
                Err::<(), BoxError>("connection reset".into())
            } else {
                Ok(())
            }
        };
        let pool = ResourcePool::builder(numbered(), probe)
            .config(PoolConfiguration::new().with_min_capacity(1).with_max_capacity(2))
            .event_sink(sink.clone())
            .build()
            .unwrap();
        pool.warmup().await.unwrap();

        let report = pool.run_maintenance().await;
        assert_eq!(report.probed, 1);
        assert_eq!(report.probe_failures, 1);
        assert_eq!(report.replenished, 1);

        let handles = pool.handles();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].id.as_u64(), 1);
        assert!(matches!(
            sink.destroyed().as_slice(),
            [(_, DestroyReason::ProbeFailed(reason))] if reason == "connection reset"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_probe_keeps_last_used() {
        let pool = ResourcePool::new(
            numbered(),
            AlwaysHealthy,
            PoolConfiguration::new().with_min_capacity(1),
        )
        .unwrap();
        pool.warmup().await.unwrap();
        let before = pool.handles()[0].clone();

        tokio::time::advance(Duration::from_secs(5)).await;
        pool.run_maintenance().await;

        let after = pool.handles()[0].clone();
        assert_eq!(after.id, before.id);
        assert_eq!(after.last_used, before.last_used);
        assert!(!after.in_use());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_task_stops_on_shutdown() {
        let pool = ResourcePool::new(
            numbered(),
            AlwaysHealthy,
            PoolConfiguration::new()
                .with_min_capacity(1)
                .with_maintenance_interval(Duration::from_secs(1)),
        )
        .unwrap();
        let task = pool.spawn_maintenance();

        // first tick refills the floor
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(pool.size(), 1);

        pool.shutdown().await;
        task.await.unwrap();
        assert_eq!(pool.size(), 0);
    }
}
