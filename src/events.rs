//! Structured pool events and the sinks that receive them

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;

use crate::handle::HandleId;
use crate::metrics::PoolMetrics;

/// Why a handle left the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestroyReason {
    /// Idle longer than the configured idle timeout while above the floor
    IdleTimeout,
    /// The health probe failed or timed out
    ProbeFailed(String),
    /// The pool is shutting down
    Shutdown,
}

impl fmt::Display for DestroyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::ProbeFailed(reason) => write!(f, "probe failed: {reason}"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Something observable that happened inside the pool.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    HandleCreated { id: HandleId },
    HandleDestroyed { id: HandleId, reason: DestroyReason },
    HandleCreationFailed { error: String },
    /// A queued waiter received a handle or a creation slot
    WaiterGranted { waited: Duration },
    AcquireTimedOut { timeout: Duration },
    MetricsSnapshot(PoolMetrics),
}

/// Receiver of pool events.
///
/// Called after the pool's internal lock has been released; implementations
/// must not block for long.
pub trait EventSink: Send + Sync {
    fn record(&self, event: PoolEvent);
}

/// Default sink: forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: PoolEvent) {
        match event {
            PoolEvent::HandleCreated { id } => tracing::debug!(%id, "handle created"),
            PoolEvent::HandleDestroyed { id, reason } => {
                tracing::info!(%id, %reason, "handle destroyed");
            }
            PoolEvent::HandleCreationFailed { error } => {
                tracing::warn!(%error, "handle creation failed");
            }
            PoolEvent::WaiterGranted { waited } => {
                tracing::debug!(?waited, "waiter granted");
            }
            PoolEvent::AcquireTimedOut { timeout } => {
                tracing::warn!(?timeout, "acquire timed out");
            }
            PoolEvent::MetricsSnapshot(m) => tracing::info!(
                active = m.active_handles,
                idle = m.idle_handles,
                waiting = m.waiting,
                total_created = m.total_created,
                total_destroyed = m.total_destroyed,
                avg_wait_ms = m.avg_wait_ms,
                success_rate = m.success_rate,
                "pool metrics"
            ),
        }
    }
}

/// In-memory sink with a bounded buffer, for tests and diagnostics.
pub struct InMemoryEventSink {
    events: Mutex<VecDeque<PoolEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    /// Create a sink that keeps at most `max_events` events.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events.min(1024))),
            max_events,
        }
    }

    /// Snapshot of the stored events, oldest first.
    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Destroy events in arrival order.
    pub fn destroyed(&self) -> Vec<(HandleId, DestroyReason)> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                PoolEvent::HandleDestroyed { id, reason } => Some((*id, reason.clone())),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for InMemoryEventSink {
    fn record(&self, event: PoolEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_sink_overflow() {
        let sink = InMemoryEventSink::new(2);
        sink.record(PoolEvent::HandleCreated { id: HandleId(1) });
        sink.record(PoolEvent::HandleCreated { id: HandleId(2) });
        sink.record(PoolEvent::HandleDestroyed {
            id: HandleId(1),
            reason: DestroyReason::IdleTimeout,
        });

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], PoolEvent::HandleCreated { id: HandleId(2) }));
        assert_eq!(
            sink.destroyed(),
            vec![(HandleId(1), DestroyReason::IdleTimeout)]
        );
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_tracing_sink_keeps_sub_millisecond_durations() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            TracingEventSink.record(PoolEvent::WaiterGranted {
                waited: Duration::from_micros(750),
            });
            TracingEventSink.record(PoolEvent::AcquireTimedOut {
                timeout: Duration::from_micros(1500),
            });
        });

        let output = String::from_utf8(captured.0.lock().clone()).unwrap();
        assert!(output.contains("waited=750µs"), "{output}");
        assert!(output.contains("timeout=1.5ms"), "{output}");
    }

    #[test]
    fn test_reason_display() {
        let reason = DestroyReason::ProbeFailed("socket closed".into());
        assert_eq!(reason.to_string(), "probe failed: socket closed");
    }
}
