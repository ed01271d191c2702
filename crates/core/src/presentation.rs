//! Seams to the presentation layer.
//!
//! The sync layer never draws anything. Each tick it pulls the local
//! participant's state from a [`LocalStateSource`] and pushes every known
//! remote participant to a [`RemotePresenter`].

use crate::{Endpoint, StateSnapshot};

/// Opaque handle the presenter uses to find what it draws for an entity.
///
/// Allocated by the entity registry on creation and never reused within one
/// registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PresentationHandle(pub u64);

/// Result of presenting one remote entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Update applied.
    Presented,
    /// The handle no longer refers to anything; the entity should be dropped.
    StaleHandle,
}

/// Source of the local participant's state, sampled once per tick.
pub trait LocalStateSource {
    /// Current state of the local participant.
    fn local_state(&self) -> StateSnapshot;
}

impl LocalStateSource for StateSnapshot {
    fn local_state(&self) -> StateSnapshot {
        *self
    }
}

/// Sink for remote participant state.
pub trait RemotePresenter {
    /// Called once per registry entry per tick.
    fn on_remote_update(
        &mut self,
        endpoint: Endpoint,
        handle: PresentationHandle,
        snapshot: &StateSnapshot,
    ) -> PresentOutcome;

    /// Called when an entity leaves the registry through eviction or a
    /// despawn notice.
    fn on_remote_removed(&mut self, _endpoint: Endpoint, _handle: PresentationHandle) {}
}
