//! Handle bookkeeping and the factory/probe seams supplied by the application

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::errors::BoxError;

/// Identifier of a handle registered in a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HandleId(pub(crate) u64);

impl HandleId {
    /// Raw numeric value of the id
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle-{}", self.0)
    }
}

/// Lifecycle state of a registered handle.
///
/// A destroyed handle is simply absent from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HandleState {
    /// Not held by anyone, may be handed out
    Idle,
    /// Held by exactly one acquirer
    InUse,
    /// Temporarily withheld while the maintenance loop probes it
    Probing,
}

/// Registry entry for one client instance.
pub(crate) struct HandleEntry<C> {
    pub client: Arc<C>,
    pub state: HandleState,
    pub created_at: Instant,
    pub last_used: Instant,
    pub use_count: u64,
    /// Bumped on every check-out and release; a lease only releases the
    /// check-out it was issued for.
    pub generation: u64,
}

impl<C> HandleEntry<C> {
    pub fn new(client: C, state: HandleState, now: Instant) -> Self {
        Self {
            client: Arc::new(client),
            state,
            created_at: now,
            last_used: now,
            use_count: u64::from(state == HandleState::InUse),
            generation: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == HandleState::Idle
    }

    pub fn check_out(&mut self, now: Instant) -> Arc<C> {
        self.state = HandleState::InUse;
        self.last_used = now;
        self.use_count += 1;
        self.generation += 1;
        Arc::clone(&self.client)
    }

    pub fn check_in(&mut self, now: Instant) {
        self.state = HandleState::Idle;
        self.last_used = now;
        self.generation += 1;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }

    pub fn info(&self, id: HandleId) -> HandleInfo {
        HandleInfo {
            id,
            state: self.state,
            created_at: self.created_at,
            last_used: self.last_used,
            use_count: self.use_count,
        }
    }
}

/// Read-only snapshot of a handle's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleInfo {
    pub id: HandleId,
    pub state: HandleState,
    pub created_at: Instant,
    pub last_used: Instant,
    /// Number of times the handle has been checked out
    pub use_count: u64,
}

impl HandleInfo {
    pub fn in_use(&self) -> bool {
        self.state == HandleState::InUse
    }
}

/// Creates new client instances for the pool.
///
/// Any `Fn() -> impl Future<Output = Result<C, BoxError>>` closure implements
/// this trait.
///
/// # Examples
///
/// ```
/// use esox_resourcepool::{BoxError, HandleFactory};
///
/// # async fn demo() -> Result<(), BoxError> {
/// let factory = || async { Ok::<_, BoxError>(String::from("client")) };
/// let client = factory.create().await?;
/// assert_eq!(client, "client");
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait HandleFactory<C>: Send + Sync + 'static {
    /// Create one client instance
    async fn create(&self) -> Result<C, BoxError>;
}

#[async_trait]
impl<C, F, Fut> HandleFactory<C> for F
where
    C: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C, BoxError>> + Send + 'static,
{
    async fn create(&self) -> Result<C, BoxError> {
        (self)().await
    }
}

/// Cheap liveness check run against idle handles.
#[async_trait]
pub trait Probe<C>: Send + Sync + 'static {
    /// Return `Ok(())` when the client is still usable
    async fn probe(&self, client: Arc<C>) -> Result<(), BoxError>;
}

#[async_trait]
impl<C, F, Fut> Probe<C> for F
where
    C: Send + Sync + 'static,
    F: Fn(Arc<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn probe(&self, client: Arc<C>) -> Result<(), BoxError> {
        (self)(client).await
    }
}

/// Probe that reports every handle healthy.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysHealthy;

#[async_trait]
impl<C: Send + Sync + 'static> Probe<C> for AlwaysHealthy {
    async fn probe(&self, _client: Arc<C>) -> Result<(), BoxError> {
        Ok(())
    }
}
