//! Collaborator doubles.

use blobsync_core::{
    Endpoint, LocalStateSource, PresentOutcome, PresentationHandle, RemotePresenter,
    StateSnapshot,
};
use serde::Serialize;
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};

/// One call received by a [`RecordingPresenter`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PresentationEvent {
    /// `on_remote_update`.
    Updated {
        /// Entity endpoint.
        endpoint: Endpoint,
        /// Presentation handle.
        handle: u64,
        /// Snapshot presented.
        snapshot: StateSnapshot,
    },
    /// `on_remote_removed`.
    Removed {
        /// Entity endpoint.
        endpoint: Endpoint,
        /// Presentation handle.
        handle: u64,
    },
}

/// Presenter that records every call and can be told to reject handles.
#[derive(Debug, Default)]
pub struct RecordingPresenter {
    events: Vec<PresentationEvent>,
    latest: BTreeMap<Endpoint, StateSnapshot>,
    stale: BTreeSet<PresentationHandle>,
}

impl RecordingPresenter {
    /// Every call in order.
    pub fn events(&self) -> &[PresentationEvent] {
        &self.events
    }

    /// Latest snapshot presented for `endpoint`, cleared on removal.
    pub fn last_update(&self, endpoint: Endpoint) -> Option<StateSnapshot> {
        self.latest.get(&endpoint).copied()
    }

    /// Endpoints currently on screen.
    pub fn visible(&self) -> Vec<Endpoint> {
        self.latest.keys().copied().collect()
    }

    /// Number of `on_remote_update` calls.
    pub fn update_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, PresentationEvent::Updated { .. }))
            .count()
    }

    /// Endpoints reported removed, in order.
    pub fn removed(&self) -> Vec<Endpoint> {
        self.events
            .iter()
            .filter_map(|e| match e {
                PresentationEvent::Removed { endpoint, .. } => Some(*endpoint),
                _ => None,
            })
            .collect()
    }

    /// Answer [`PresentOutcome::StaleHandle`] for `handle` from now on.
    pub fn mark_stale(&mut self, handle: PresentationHandle) {
        self.stale.insert(handle);
    }
}

impl RemotePresenter for RecordingPresenter {
    fn on_remote_update(
        &mut self,
        endpoint: Endpoint,
        handle: PresentationHandle,
        snapshot: &StateSnapshot,
    ) -> PresentOutcome {
        self.events.push(PresentationEvent::Updated {
            endpoint,
            handle: handle.0,
            snapshot: *snapshot,
        });
        if self.stale.contains(&handle) {
            self.latest.remove(&endpoint);
            return PresentOutcome::StaleHandle;
        }
        self.latest.insert(endpoint, *snapshot);
        PresentOutcome::Presented
    }

    fn on_remote_removed(&mut self, endpoint: Endpoint, handle: PresentationHandle) {
        self.events.push(PresentationEvent::Removed {
            endpoint,
            handle: handle.0,
        });
        self.latest.remove(&endpoint);
    }
}

/// Local participant that replays a fixed path, holding the last point.
#[derive(Debug)]
pub struct ScriptedLocalState {
    path: Vec<StateSnapshot>,
    cursor: Cell<usize>,
}

impl ScriptedLocalState {
    /// Replay `path`; an empty path yields the default snapshot.
    pub fn new(path: Vec<StateSnapshot>) -> Self {
        Self {
            path,
            cursor: Cell::new(0),
        }
    }

    /// Always report `snapshot`.
    pub fn fixed(snapshot: StateSnapshot) -> Self {
        Self::new(vec![snapshot])
    }

    /// Snapshot the next sample will return, without consuming it.
    pub fn peek(&self) -> StateSnapshot {
        let index = self.cursor.get();
        match self.path.get(index).or_else(|| self.path.last()) {
            Some(snapshot) => *snapshot,
            None => StateSnapshot::default(),
        }
    }

    /// How many times the state was sampled.
    pub fn samples(&self) -> usize {
        self.cursor.get()
    }
}

impl LocalStateSource for ScriptedLocalState {
    fn local_state(&self) -> StateSnapshot {
        let snapshot = self.peek();
        self.cursor.set(self.cursor.get() + 1);
        snapshot
    }
}
