//! Core resource pool: registry, FIFO wait queue, acquire/release and execute

use crate::circuit_breaker::CircuitBreaker;
use crate::config::PoolConfiguration;
use crate::errors::{BoxError, PoolError, PoolResult};
use crate::events::{DestroyReason, EventSink, PoolEvent, TracingEventSink};
use crate::handle::{HandleEntry, HandleFactory, HandleId, HandleInfo, HandleState, Probe};
use crate::health::HealthStatus;
use crate::maintenance::{self, MaintenanceReport};
use crate::metrics::{MetricsWindow, Occupancy, PoolMetrics};
use crate::retry::{RetryPolicy, RetryState, Sleeper, TokioSleeper};

#[cfg(feature = "prometheus")]
use crate::metrics::MetricsExporter;

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// One check-out of a registered handle.
pub(crate) struct Checkout<C> {
    pub id: HandleId,
    pub generation: u64,
    pub client: Arc<C>,
}

impl<C> HandleEntry<C> {
    fn lease_out(&mut self, id: HandleId, now: Instant) -> Checkout<C> {
        let client = self.check_out(now);
        Checkout {
            id,
            generation: self.generation,
            client,
        }
    }
}

/// What a queued waiter is handed.
pub(crate) enum Grant<C> {
    /// A released handle, already marked in use for the waiter
    Handle(Checkout<C>),
    /// A reserved creation slot; the waiter runs the factory itself
    Slot,
}

struct Waiter<C> {
    id: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<Grant<C>>,
}

/// Everything guarded by the pool lock.
pub(crate) struct PoolState<C> {
    pub handles: HashMap<HandleId, HandleEntry<C>>,
    /// Slots reserved for handles whose factory call is in flight
    pub creating: usize,
    waiters: VecDeque<Waiter<C>>,
    pub metrics: MetricsWindow,
    next_handle_id: u64,
    next_waiter_id: u64,
    pub closing: bool,
}

impl<C> PoolState<C> {
    fn new(config: &PoolConfiguration) -> Self {
        Self {
            handles: HashMap::with_capacity(config.max_capacity),
            creating: 0,
            waiters: VecDeque::new(),
            metrics: MetricsWindow::new(config.metrics_window),
            next_handle_id: 0,
            next_waiter_id: 0,
            closing: false,
        }
    }

    /// Registered handles plus in-flight creations.
    pub fn live(&self) -> usize {
        self.handles.len() + self.creating
    }

    pub fn is_drained(&self) -> bool {
        self.closing && self.live() == 0
    }

    pub fn occupancy(&self, config: &PoolConfiguration) -> Occupancy {
        let active = self
            .handles
            .values()
            .filter(|h| h.state == HandleState::InUse)
            .count();
        Occupancy {
            active,
            idle: self.handles.len() - active,
            waiting: self.waiters.len(),
            min_capacity: config.min_capacity,
            max_capacity: config.max_capacity,
        }
    }

    /// Check out the most recently used idle handle.
    fn take_idle(&mut self, now: Instant) -> Option<Checkout<C>> {
        let id = self
            .handles
            .iter()
            .filter(|(_, h)| h.is_idle())
            .max_by_key(|(id, h)| (h.last_used, std::cmp::Reverse(**id)))
            .map(|(id, _)| *id)?;
        Some(self.handles.get_mut(&id)?.lease_out(id, now))
    }

    pub fn register_in_use(&mut self, client: C, now: Instant) -> Checkout<C> {
        let id = HandleId(self.next_handle_id);
        self.next_handle_id += 1;
        let entry = HandleEntry::new(client, HandleState::InUse, now);
        let checkout = Checkout {
            id,
            generation: entry.generation,
            client: Arc::clone(&entry.client),
        };
        self.handles.insert(id, entry);
        self.metrics.handles_created += 1;
        checkout
    }

    /// Hand `grant` to the oldest waiter still listening. Returns the grant if
    /// nobody took it.
    fn offer(
        &mut self,
        mut grant: Grant<C>,
        now: Instant,
        events: &mut Vec<PoolEvent>,
    ) -> Option<Grant<C>> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(grant) {
                Ok(()) => {
                    let waited = now.saturating_duration_since(waiter.enqueued_at);
                    self.metrics.record_wait(waited);
                    events.push(PoolEvent::WaiterGranted { waited });
                    return None;
                }
                Err(returned) => grant = returned,
            }
        }
        Some(grant)
    }

    /// Return a checked-out handle: transfer it to the oldest waiter, or mark
    /// it idle. Unknown or not-in-use ids are ignored, as is a release for
    /// an earlier check-out when `generation` is given.
    pub fn release_handle(
        &mut self,
        id: HandleId,
        generation: Option<u64>,
        now: Instant,
        events: &mut Vec<PoolEvent>,
    ) {
        match self.handles.get(&id) {
            Some(h) if h.state == HandleState::InUse => {
                if generation.is_some_and(|g| g != h.generation) {
                    tracing::debug!(%id, "release ignored: stale lease");
                    return;
                }
            }
            _ => {
                tracing::debug!(%id, "release ignored: handle unknown or not in use");
                return;
            }
        }

        if self.closing {
            self.destroy(id, DestroyReason::Shutdown, events);
            return;
        }

        self.return_to_service(id, now, events);
    }

    /// Give a handle that is leaving `InUse` or `Probing` to the next waiter,
    /// or park it as idle. `now` becomes its last-used time only on the
    /// release path.
    pub fn return_to_service(&mut self, id: HandleId, now: Instant, events: &mut Vec<PoolEvent>) {
        let Some(entry) = self.handles.get_mut(&id) else {
            return;
        };
        let previous = entry.state;
        let last_used = entry.last_used;

        if !self.waiters.is_empty() {
            let checkout = entry.lease_out(id, now);
            if self.offer(Grant::Handle(checkout), now, events).is_none() {
                tracing::debug!(%id, "handle transferred to waiter");
                return;
            }
            if let Some(entry) = self.handles.get_mut(&id) {
                entry.use_count -= 1;
                entry.last_used = last_used;
            }
        }

        if let Some(entry) = self.handles.get_mut(&id) {
            if previous == HandleState::InUse {
                entry.check_in(now);
            } else {
                entry.state = HandleState::Idle;
            }
        }
    }

    /// Remove a handle from the registry. Its client is dropped once the last
    /// lease referring to it is gone.
    pub fn destroy(&mut self, id: HandleId, reason: DestroyReason, events: &mut Vec<PoolEvent>) -> bool {
        if self.handles.remove(&id).is_none() {
            return false;
        }
        self.metrics.handles_destroyed += 1;
        events.push(PoolEvent::HandleDestroyed { id, reason });
        true
    }

    /// After capacity was freed by a destroy or a failed creation, let the
    /// oldest waiter create a handle of its own.
    pub fn free_capacity(&mut self, max_capacity: usize, now: Instant, events: &mut Vec<PoolEvent>) {
        if self.closing || self.waiters.is_empty() || self.live() >= max_capacity {
            return;
        }
        self.creating += 1;
        if self.offer(Grant::Slot, now, events).is_some() {
            self.creating -= 1;
        }
    }

    fn remove_waiter(&mut self, waiter_id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == waiter_id) {
            Some(pos) => {
                self.waiters.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Undo a grant that reached a waiter who is no longer interested.
    fn return_grant(
        &mut self,
        grant: Grant<C>,
        max_capacity: usize,
        now: Instant,
        events: &mut Vec<PoolEvent>,
    ) {
        match grant {
            Grant::Handle(checkout) => {
                self.release_handle(checkout.id, Some(checkout.generation), now, events)
            }
            Grant::Slot => {
                self.creating -= 1;
                self.free_capacity(max_capacity, now, events);
            }
        }
    }
}

/// Shared pool internals. Leases and the maintenance task point here.
pub(crate) struct PoolInner<C> {
    pub state: Mutex<PoolState<C>>,
    pub config: PoolConfiguration,
    pub factory: Box<dyn HandleFactory<C>>,
    pub probe: Box<dyn Probe<C>>,
    sleeper: Arc<dyn Sleeper>,
    events: Arc<dyn EventSink>,
    circuit_breaker: Option<CircuitBreaker>,
    drained: Notify,
    pub shutdown_tx: watch::Sender<bool>,
}

impl<C> PoolInner<C> {
    /// Deliver events and wake `shutdown` if the registry just emptied.
    /// Must be called without holding the state lock.
    pub fn finish(&self, events: Vec<PoolEvent>, drained: bool) {
        for event in events {
            self.events.record(event);
        }
        if drained {
            self.drained.notify_waiters();
        }
    }

    pub fn emit(&self, event: PoolEvent) {
        self.events.record(event);
    }

    pub fn release(&self, id: HandleId, generation: Option<u64>) {
        let mut events = Vec::new();
        let drained = {
            let mut state = self.state.lock();
            state.release_handle(id, generation, Instant::now(), &mut events);
            state.is_drained()
        };
        self.finish(events, drained);
    }

    fn record_outcome(&self, success: bool) {
        self.state.lock().metrics.record_outcome(success);
    }

    pub fn metrics(&self) -> PoolMetrics {
        let state = self.state.lock();
        state.metrics.snapshot(state.occupancy(&self.config))
    }
}

/// A creation slot reserved in `PoolState::creating`. Dropping it without
/// `commit` gives the slot back.
struct CreationSlot<'a, C> {
    pool: &'a PoolInner<C>,
    armed: bool,
}

impl<'a, C> CreationSlot<'a, C> {
    fn new(pool: &'a PoolInner<C>) -> Self {
        Self { pool, armed: true }
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl<C> Drop for CreationSlot<'_, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut events = Vec::new();
        let drained = {
            let mut state = self.pool.state.lock();
            state.creating -= 1;
            state.free_capacity(self.pool.config.max_capacity, Instant::now(), &mut events);
            state.is_drained()
        };
        self.pool.finish(events, drained);
    }
}

impl<C: Send + Sync + 'static> PoolInner<C> {
    /// Run the factory for an already reserved slot and register the result
    /// as in use. The lock is not held while the factory runs.
    pub async fn create_reserved(&self) -> PoolResult<Checkout<C>> {
        let slot = CreationSlot::new(self);
        let created = self.factory.create().await;
        slot.commit();

        let mut events = Vec::new();
        let (result, drained) = {
            let mut state = self.state.lock();
            state.creating -= 1;
            let now = Instant::now();
            let result = match created {
                Ok(_) if state.closing => {
                    state.free_capacity(self.config.max_capacity, now, &mut events);
                    Err(PoolError::ShutDown)
                }
                Ok(client) => {
                    let checkout = state.register_in_use(client, now);
                    events.push(PoolEvent::HandleCreated { id: checkout.id });
                    Ok(checkout)
                }
                Err(err) => {
                    events.push(PoolEvent::HandleCreationFailed {
                        error: err.to_string(),
                    });
                    state.free_capacity(self.config.max_capacity, now, &mut events);
                    Err(PoolError::creation_failed(err))
                }
            };
            (result, state.is_drained())
        };
        self.finish(events, drained);
        result
    }

    /// Create handles until the registry reaches the floor. Returns how many
    /// were created and the last creation error, if any.
    pub async fn fill_to_floor(&self) -> (usize, Option<PoolError>) {
        let mut created = 0;
        loop {
            {
                let mut state = self.state.lock();
                if state.closing || state.live() >= self.config.min_capacity {
                    return (created, None);
                }
                state.creating += 1;
            }
            match self.create_reserved().await {
                Ok(checkout) => {
                    created += 1;
                    self.release(checkout.id, Some(checkout.generation));
                }
                Err(err) => return (created, Some(err)),
            }
        }
    }
}

/// A lease on a pooled handle; returns the handle to the pool when dropped
///
/// A lease only ever returns its own check-out. Once the handle has been
/// returned by id through [`ResourcePool::release`], dropping the lease does
/// nothing, even if another caller holds the handle by then.
pub struct PooledHandle<C> {
    id: HandleId,
    generation: u64,
    client: Arc<C>,
    pool: Arc<PoolInner<C>>,
}

impl<C> PooledHandle<C> {
    fn new(checkout: Checkout<C>, pool: Arc<PoolInner<C>>) -> Self {
        Self {
            id: checkout.id,
            generation: checkout.generation,
            client: checkout.client,
            pool,
        }
    }

    /// Identifier of the leased handle
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// The underlying client
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Whether this lease still holds its check-out
    pub fn is_current(&self) -> bool {
        self.pool
            .state
            .lock()
            .handles
            .get(&self.id)
            .is_some_and(|h| h.state == HandleState::InUse && h.generation == self.generation)
    }

    /// Return the handle to the pool now
    pub fn release(self) {
        drop(self);
    }
}

impl<C> Deref for PooledHandle<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

impl<C> Drop for PooledHandle<C> {
    fn drop(&mut self) {
        self.pool.release(self.id, Some(self.generation));
    }
}

/// Waiting acquirer's end of the queue. Dropping it while still armed
/// withdraws the waiter, and returns any grant that raced with it.
struct WaitTicket<'a, C> {
    pool: &'a PoolInner<C>,
    waiter_id: u64,
    rx: oneshot::Receiver<Grant<C>>,
    armed: bool,
}

impl<C> WaitTicket<'_, C> {
    /// Withdraw after a timeout. A grant sent before the withdrawal wins.
    fn cancel(&mut self) -> Option<Grant<C>> {
        self.armed = false;
        let mut state = self.pool.state.lock();
        if state.remove_waiter(self.waiter_id) {
            return None;
        }
        drop(state);
        self.rx.try_recv().ok()
    }
}

impl<C> Drop for WaitTicket<'_, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut events = Vec::new();
        let drained = {
            let mut state = self.pool.state.lock();
            if !state.remove_waiter(self.waiter_id)
                && let Ok(grant) = self.rx.try_recv()
            {
                state.return_grant(grant, self.pool.config.max_capacity, Instant::now(), &mut events);
            }
            state.is_drained()
        };
        self.pool.finish(events, drained);
    }
}

enum AcquirePath<C> {
    Ready(Checkout<C>),
    Create,
    Wait(u64, oneshot::Receiver<Grant<C>>),
}

/// Builder for [`ResourcePool`] with optional collaborators
pub struct ResourcePoolBuilder<C> {
    factory: Box<dyn HandleFactory<C>>,
    probe: Box<dyn Probe<C>>,
    config: PoolConfiguration,
    sleeper: Arc<dyn Sleeper>,
    events: Arc<dyn EventSink>,
}

impl<C: Send + Sync + 'static> ResourcePoolBuilder<C> {
    pub fn config(mut self, config: PoolConfiguration) -> Self {
        self.config = config;
        self
    }

    /// Receive pool events (defaults to [`TracingEventSink`])
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Replace the backoff sleeper used by `execute` (defaults to [`TokioSleeper`])
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Validate the configuration and build the pool. No handles are created
    /// until [`ResourcePool::warmup`] or the first acquire.
    pub fn build(self) -> PoolResult<ResourcePool<C>> {
        self.config.validate()?;

        let circuit_breaker = self.config.enable_circuit_breaker.then(|| {
            CircuitBreaker::new(
                self.config.circuit_breaker_threshold,
                self.config.circuit_breaker_timeout,
            )
        });
        let (shutdown_tx, _) = watch::channel(false);

        Ok(ResourcePool {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState::new(&self.config)),
                config: self.config,
                factory: self.factory,
                probe: self.probe,
                sleeper: self.sleeper,
                events: self.events,
                circuit_breaker,
                drained: Notify::new(),
                shutdown_tx,
            }),
        })
    }
}

/// Bounded async pool of reusable client handles
///
/// Cloning is cheap; clones share the same registry.
///
/// # Examples
///
/// ```
/// use esox_resourcepool::{AlwaysHealthy, BoxError, PoolConfiguration, ResourcePool};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), esox_resourcepool::PoolError> {
/// let pool = ResourcePool::new(
///     || async { Ok::<_, BoxError>(String::from("backend-client")) },
///     AlwaysHealthy,
///     PoolConfiguration::new().with_max_capacity(2),
/// )?;
///
/// let len = pool
///     .execute(|client| async move { Ok::<_, BoxError>(client.len()) }, 2)
///     .await?;
/// assert_eq!(len, 14);
///
/// {
///     let handle = pool.acquire(Duration::from_millis(100)).await?;
///     assert_eq!(*handle, "backend-client");
/// } // returned to the pool here
///
/// pool.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct ResourcePool<C> {
    inner: Arc<PoolInner<C>>,
}

impl<C> Clone for ResourcePool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Send + Sync + 'static> ResourcePool<C> {
    /// Create a new pool from a factory, a probe and a configuration
    pub fn new<F, P>(factory: F, probe: P, config: PoolConfiguration) -> PoolResult<Self>
    where
        F: HandleFactory<C>,
        P: Probe<C>,
    {
        Self::builder(factory, probe).config(config).build()
    }

    /// Start building a pool with default configuration and collaborators
    pub fn builder<F, P>(factory: F, probe: P) -> ResourcePoolBuilder<C>
    where
        F: HandleFactory<C>,
        P: Probe<C>,
    {
        ResourcePoolBuilder {
            factory: Box::new(factory),
            probe: Box::new(probe),
            config: PoolConfiguration::default(),
            sleeper: Arc::new(TokioSleeper),
            events: Arc::new(TracingEventSink),
        }
    }

    /// Build, warm up to the floor and start background maintenance
    pub async fn launch<F, P>(factory: F, probe: P, config: PoolConfiguration) -> PoolResult<Self>
    where
        F: HandleFactory<C>,
        P: Probe<C>,
    {
        let pool = Self::new(factory, probe, config)?;
        pool.warmup().await?;
        pool.spawn_maintenance();
        Ok(pool)
    }

    /// Acquire a handle, waiting at most `timeout` when the pool is saturated
    pub async fn acquire(&self, timeout: Duration) -> PoolResult<PooledHandle<C>> {
        let path = {
            let mut state = self.inner.state.lock();
            if state.closing {
                return Err(PoolError::ShutDown);
            }
            let now = Instant::now();

            if let Some(checkout) = state.take_idle(now) {
                state.metrics.record_wait(Duration::ZERO);
                AcquirePath::Ready(checkout)
            } else if state.live() < self.inner.config.max_capacity {
                state.creating += 1;
                AcquirePath::Create
            } else {
                if let Some(max_queue) = self.inner.config.max_queue_length
                    && state.waiters.len() >= max_queue
                {
                    tracing::warn!(queued = state.waiters.len(), "wait queue full");
                    return Err(PoolError::CapacityExhausted {
                        queued: state.waiters.len(),
                    });
                }
                let (tx, rx) = oneshot::channel();
                let waiter_id = state.next_waiter_id;
                state.next_waiter_id += 1;
                state.waiters.push_back(Waiter {
                    id: waiter_id,
                    enqueued_at: now,
                    tx,
                });
                AcquirePath::Wait(waiter_id, rx)
            }
        };

        match path {
            AcquirePath::Ready(checkout) => Ok(self.lease(checkout)),
            AcquirePath::Create => {
                let checkout = self.inner.create_reserved().await?;
                self.inner.state.lock().metrics.record_wait(Duration::ZERO);
                Ok(self.lease(checkout))
            }
            AcquirePath::Wait(waiter_id, rx) => {
                let ticket = WaitTicket {
                    pool: self.inner.as_ref(),
                    waiter_id,
                    rx,
                    armed: true,
                };
                self.wait(ticket, timeout).await
            }
        }
    }

    /// Acquire with the configured default timeout
    pub async fn acquire_default(&self) -> PoolResult<PooledHandle<C>> {
        self.acquire(self.inner.config.acquire_timeout).await
    }

    async fn wait(&self, mut ticket: WaitTicket<'_, C>, timeout: Duration) -> PoolResult<PooledHandle<C>> {
        let received = tokio::time::timeout(timeout, &mut ticket.rx).await;
        let grant = match received {
            Ok(Ok(grant)) => {
                ticket.armed = false;
                grant
            }
            Ok(Err(_)) => {
                // Sender dropped without a grant: only shutdown does that
                ticket.armed = false;
                return Err(PoolError::ShutDown);
            }
            Err(_) => match ticket.cancel() {
                Some(grant) => grant,
                None if self.is_shut_down() => return Err(PoolError::ShutDown),
                None => {
                    self.inner.state.lock().metrics.acquire_timeouts += 1;
                    self.inner.emit(PoolEvent::AcquireTimedOut { timeout });
                    return Err(PoolError::AcquireTimeout(timeout));
                }
            },
        };
        drop(ticket);

        match grant {
            Grant::Handle(checkout) => Ok(self.lease(checkout)),
            Grant::Slot => {
                let checkout = self.inner.create_reserved().await?;
                Ok(self.lease(checkout))
            }
        }
    }

    fn lease(&self, checkout: Checkout<C>) -> PooledHandle<C> {
        PooledHandle::new(checkout, Arc::clone(&self.inner))
    }

    /// Return a handle by id. Unknown or already idle ids are ignored.
    ///
    /// The lease issued for that check-out becomes inert: dropping it later
    /// does not release the handle again. Prefer dropping the
    /// [`PooledHandle`]; this exists for callers that track handles by id.
    pub fn release(&self, id: HandleId) {
        self.inner.release(id, None);
    }

    /// Run `operation` against a pooled handle, retrying failures up to
    /// `max_retries` times with exponential backoff
    ///
    /// Each attempt hands the operation its own lease, which goes back to the
    /// pool when the operation's future completes or is dropped.
    pub async fn execute<T, E, F, Fut>(&self, mut operation: F, max_retries: u32) -> PoolResult<T>
    where
        F: FnMut(PooledHandle<C>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        if let Some(breaker) = &self.inner.circuit_breaker
            && !breaker.allow_request()
        {
            self.inner.record_outcome(false);
            return Err(PoolError::CircuitBreakerOpen);
        }

        let policy = RetryPolicy::from_config(&self.inner.config, max_retries);
        let mut state = policy.start();
        let mut last_error = None;

        loop {
            state = match state {
                RetryState::Attempt { attempt } => match self.attempt(&mut operation, attempt).await {
                    Ok(value) => {
                        self.conclude(true);
                        return Ok(value);
                    }
                    Err(err) if !err.is_retryable() => {
                        self.conclude(false);
                        return Err(err);
                    }
                    Err(err) => {
                        let next = policy.after_failure(attempt);
                        if let RetryState::Backoff { delay, .. } = next {
                            tracing::debug!(attempt, ?delay, error = %err, "retrying operation");
                            self.inner.state.lock().metrics.retried_attempts += 1;
                        }
                        last_error = Some(err);
                        next
                    }
                },
                RetryState::Backoff { delay, .. } => {
                    self.inner.sleeper.sleep(delay).await;
                    state.after_backoff()
                }
                RetryState::Exhausted { attempts } => {
                    self.conclude(false);
                    let err = last_error.unwrap_or_else(|| PoolError::OperationFailed {
                        attempts,
                        source: Arc::from(BoxError::from("retries exhausted")),
                    });
                    tracing::warn!(attempts, error = %err, "operation failed");
                    return Err(err);
                }
            };
        }
    }

    /// `execute` with the configured default retry ceiling
    pub async fn execute_default<T, E, F, Fut>(&self, operation: F) -> PoolResult<T>
    where
        F: FnMut(PooledHandle<C>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        self.execute(operation, self.inner.config.max_retries).await
    }

    async fn attempt<T, E, F, Fut>(&self, operation: &mut F, attempt: u32) -> PoolResult<T>
    where
        F: FnMut(PooledHandle<C>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<BoxError>,
    {
        let lease = self.acquire(self.inner.config.acquire_timeout).await?;
        operation(lease).await.map_err(|err| {
            let source: BoxError = err.into();
            PoolError::OperationFailed {
                attempts: attempt + 1,
                source: Arc::from(source),
            }
        })
    }

    fn conclude(&self, success: bool) {
        self.inner.record_outcome(success);
        if let Some(breaker) = &self.inner.circuit_breaker {
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
    }

    /// Create handles up to the configured floor; returns how many were created
    pub async fn warmup(&self) -> PoolResult<usize> {
        let (created, error) = self.inner.fill_to_floor().await;
        tracing::info!(created, "pool warmed up");
        match error {
            Some(err) => Err(err),
            None => Ok(created),
        }
    }

    /// Run one maintenance pass: idle eviction, health probes, floor refill
    /// and a metrics snapshot
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        maintenance::run_once(&self.inner).await
    }

    /// Spawn the periodic maintenance loop on the current tokio runtime
    ///
    /// The task stops on [`shutdown`](Self::shutdown) or when the last pool
    /// clone is dropped.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        maintenance::spawn(&self.inner)
    }

    /// Stop handing out handles and wait until every handle is destroyed
    ///
    /// Queued waiters fail with [`PoolError::ShutDown`]; outstanding leases
    /// are destroyed as they are released. Calling it again just waits.
    pub async fn shutdown(&self) {
        let mut events = Vec::new();
        let waiters = {
            let mut state = self.inner.state.lock();
            if state.closing {
                VecDeque::new()
            } else {
                state.closing = true;
                let idle: Vec<HandleId> = state
                    .handles
                    .iter()
                    .filter(|(_, h)| h.is_idle())
                    .map(|(id, _)| *id)
                    .collect();
                for id in idle {
                    state.destroy(id, DestroyReason::Shutdown, &mut events);
                }
                std::mem::take(&mut state.waiters)
            }
        };
        if !waiters.is_empty() {
            tracing::info!(waiters = waiters.len(), "failing queued waiters on shutdown");
        }
        drop(waiters);
        self.inner.finish(events, false);
        self.inner.shutdown_tx.send_replace(true);

        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.state.lock().live() == 0 {
                break;
            }
            notified.await;
        }
        tracing::info!("pool shut down");
    }

    /// Whether `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().closing
    }

    /// Get pool metrics
    pub fn metrics(&self) -> PoolMetrics {
        self.inner.metrics()
    }

    /// Get health status
    pub fn health_status(&self) -> HealthStatus {
        HealthStatus::from_metrics(&self.metrics(), self.is_shut_down())
    }

    /// Export metrics
    pub fn export_metrics(&self) -> HashMap<String, String> {
        self.metrics().export()
    }

    /// Export metrics in Prometheus format
    #[cfg(feature = "prometheus")]
    pub fn export_metrics_prometheus(
        &self,
        pool_name: &str,
        tags: Option<&HashMap<String, String>>,
    ) -> Result<String, prometheus::Error> {
        MetricsExporter::export_prometheus(&self.metrics(), pool_name, tags)
    }

    /// Snapshot of one handle's bookkeeping
    pub fn handle_info(&self, id: HandleId) -> Option<HandleInfo> {
        self.inner.state.lock().handles.get(&id).map(|h| h.info(id))
    }

    /// Snapshots of every registered handle, ordered by id
    pub fn handles(&self) -> Vec<HandleInfo> {
        let state = self.inner.state.lock();
        let mut infos: Vec<HandleInfo> =
            state.handles.iter().map(|(id, h)| h.info(*id)).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    /// Registered handles plus handles being created
    pub fn size(&self) -> usize {
        self.inner.state.lock().live()
    }

    pub fn config(&self) -> &PoolConfiguration {
        &self.inner.config
    }

    /// The circuit breaker guarding `execute`, when enabled
    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.inner.circuit_breaker.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InMemoryEventSink;
    use crate::handle::AlwaysHealthy;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting_pool(config: PoolConfiguration) -> (ResourcePool<u32>, Arc<AtomicU32>) {
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        let pool = ResourcePool::new(
            move || {
                let c = Arc::clone(&c);
                async move { Ok::<_, BoxError>(c.fetch_add(1, Ordering::SeqCst)) }
            },
            AlwaysHealthy,
            config,
        )
        .unwrap();
        (pool, counter)
    }

    fn small(max: usize) -> PoolConfiguration {
        PoolConfiguration::new()
            .with_min_capacity(0)
            .with_max_capacity(max)
    }

    #[tokio::test]
    async fn test_idle_handle_reused() {
        let (pool, created) = counting_pool(small(2));

        let first = pool.acquire(Duration::from_millis(10)).await.unwrap();
        let id = first.id();
        drop(first);

        let second = pool.acquire(Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.handle_info(id).unwrap().use_count, 2);
    }

    #[tokio::test]
    async fn test_release_hands_off_to_waiter() {
        let (pool, _) = counting_pool(small(1));
        let held = pool.acquire(Duration::from_millis(10)).await.unwrap();
        let id = held.id();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await.map(|h| h.id()) })
        };
        while pool.metrics().waiting == 0 {
            tokio::task::yield_now().await;
        }

        pool.release(id);
        assert_eq!(waiter.await.unwrap().unwrap(), id);
        drop(held);
        assert_eq!(pool.metrics().idle_handles, 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (pool, _) = counting_pool(small(2));
        let lease = pool.acquire(Duration::from_millis(10)).await.unwrap();
        let id = lease.id();

        pool.release(id);
        pool.release(id);
        pool.release(HandleId(999));
        drop(lease);

        let metrics = pool.metrics();
        assert_eq!(metrics.idle_handles, 1);
        assert_eq!(metrics.active_handles, 0);
        assert_eq!(metrics.total_destroyed, 0);
    }

    #[tokio::test]
    async fn test_lease_inert_after_release_by_id() {
        let (pool, _) = counting_pool(small(1));
        let first = pool.acquire(Duration::from_millis(10)).await.unwrap();
        let id = first.id();
        assert!(first.is_current());

        pool.release(id);
        assert!(!first.is_current());

        let second = pool.acquire(Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.id(), id);
        drop(first);

        assert!(second.is_current());
        assert!(pool.handle_info(id).unwrap().in_use());
        assert!(matches!(
            pool.acquire(Duration::from_millis(10)).await,
            Err(PoolError::AcquireTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_execute_lease_returned_after_operation() {
        let (pool, _) = counting_pool(small(1));
        let id = pool
            .execute(
                |lease| async move {
                    assert!(lease.is_current());
                    Ok::<_, BoxError>(lease.id())
                },
                0,
            )
            .await
            .unwrap();

        let info = pool.handle_info(id).unwrap();
        assert!(!info.in_use());
        assert_eq!(info.use_count, 1);
        assert_eq!(pool.metrics().active_handles, 0);
    }

    #[tokio::test]
    async fn test_factory_failure_propagates_and_frees_slot() {
        let pool: ResourcePool<u32> = ResourcePool::new(
            || async { Err::<u32, BoxError>("backend unreachable".into()) },
            AlwaysHealthy,
            small(1),
        )
        .unwrap();

        let err = pool.acquire(Duration::from_millis(10)).await.err().unwrap();
        assert!(matches!(err, PoolError::HandleCreationFailed(_)));
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.metrics().total_created, 0);
    }

    #[tokio::test]
    async fn test_bounded_queue_rejects() {
        let (pool, _) = counting_pool(small(1).with_max_queue_length(1));
        let _held = pool.acquire(Duration::from_millis(10)).await.unwrap();

        let queued = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await.map(|h| h.id()) })
        };
        while pool.metrics().waiting == 0 {
            tokio::task::yield_now().await;
        }

        let err = pool.acquire(Duration::from_millis(10)).await.err().unwrap();
        assert!(matches!(err, PoolError::CapacityExhausted { queued: 1 }));
        queued.abort();
    }

    #[tokio::test]
    async fn test_dropped_acquire_leaves_queue() {
        let (pool, _) = counting_pool(small(1));
        let held = pool.acquire(Duration::from_millis(10)).await.unwrap();

        let pending = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _ = pool.acquire(Duration::from_secs(60)).await;
            })
        };
        while pool.metrics().waiting == 0 {
            tokio::task::yield_now().await;
        }
        pending.abort();
        let _ = pending.await;

        assert_eq!(pool.metrics().waiting, 0);
        drop(held);
        assert_eq!(pool.metrics().idle_handles, 1);
    }

    #[tokio::test]
    async fn test_execute_releases_on_error() {
        let (pool, _) = counting_pool(small(1).with_retries(0, Duration::from_millis(1)));
        let result: PoolResult<()> = pool
            .execute(|_client| async { Err::<(), BoxError>("query failed".into()) }, 0)
            .await;

        match result {
            Err(PoolError::OperationFailed { attempts, source }) => {
                assert_eq!(attempts, 1);
                assert_eq!(source.to_string(), "query failed");
            }
            other => panic!("unexpected: {other:?}"),
        }
        let metrics = pool.metrics();
        assert_eq!(metrics.active_handles, 0);
        assert_eq!(metrics.failed_ops, 1);
        assert_eq!(metrics.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiters_and_destroys() {
        let sink = Arc::new(InMemoryEventSink::new(64));
        let pool: ResourcePool<u32> =
            ResourcePool::builder(|| async { Ok::<_, BoxError>(1u32) }, AlwaysHealthy)
                .config(small(1))
                .event_sink(sink.clone())
                .build()
                .unwrap();

        let held = pool.acquire(Duration::from_millis(10)).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(5)).await.map(|h| h.id()) })
        };
        while pool.metrics().waiting == 0 {
            tokio::task::yield_now().await;
        }

        let shutdown = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.shutdown().await })
        };
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::ShutDown)));
        assert!(!shutdown.is_finished());

        drop(held);
        shutdown.await.unwrap();
        assert_eq!(pool.size(), 0);
        assert_eq!(sink.destroyed().len(), 1);
        assert!(matches!(
            pool.acquire(Duration::from_millis(1)).await,
            Err(PoolError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_circuit_breaker_fails_fast() {
        let (pool, _) = counting_pool(
            small(1)
                .with_retries(0, Duration::from_millis(1))
                .with_circuit_breaker(2, Duration::from_secs(60)),
        );
        for _ in 0..2 {
            let _ = pool
                .execute(|_c| async { Err::<(), BoxError>("down".into()) }, 0)
                .await;
        }
        let result = pool
            .execute(|_c| async { Ok::<_, BoxError>(()) }, 0)
            .await;
        assert!(matches!(result, Err(PoolError::CircuitBreakerOpen)));
    }
}
