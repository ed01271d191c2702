#![warn(missing_docs)]
//! Core primitives shared across the workspace.

pub mod config;
pub mod endpoint;
pub mod presentation;
pub mod snapshot;

use serde::{Deserialize, Serialize};

// Re-export commonly used types
pub use config::SessionConfig;
pub use endpoint::Endpoint;
pub use presentation::{LocalStateSource, PresentOutcome, PresentationHandle, RemotePresenter};
pub use snapshot::{Position, StateSnapshot};

/// Fixed tick type (50 Hz by default => 20 ms per tick).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SimTick(pub u64);

impl SimTick {
    /// First tick of every session.
    pub const ZERO: Self = Self(0);

    /// Advance by `delta` ticks.
    pub fn advance(self, delta: u64) -> Self {
        Self(self.0 + delta)
    }

    /// Number of ticks elapsed since `earlier` (zero if `earlier` is in the future).
    pub fn since(self, earlier: SimTick) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}
