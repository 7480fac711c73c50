//! Idle eviction selection

use std::time::Duration;

use crate::handle::HandleId;

/// Idle handle considered by the maintenance loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IdleCandidate {
    pub id: HandleId,
    pub idle_for: Duration,
}

/// Pick the idle handles to evict.
///
/// Only handles idle strictly longer than `idle_timeout` qualify, longest idle
/// first, and eviction stops once `registered` would drop to `min_capacity`.
/// Handles still being created do not count toward `registered`.
pub(crate) fn select_idle_evictions(
    mut candidates: Vec<IdleCandidate>,
    idle_timeout: Duration,
    registered: usize,
    min_capacity: usize,
) -> Vec<HandleId> {
    let budget = registered.saturating_sub(min_capacity);
    if budget == 0 {
        return Vec::new();
    }

    candidates.retain(|c| c.idle_for > idle_timeout);
    candidates.sort_by(|a, b| b.idle_for.cmp(&a.idle_for).then(a.id.cmp(&b.id)));
    candidates.into_iter().take(budget).map(|c| c.id).collect()
}
