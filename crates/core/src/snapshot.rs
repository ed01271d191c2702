//! Replicated participant state.

use serde::{Deserialize, Serialize};

/// World-space position of a participant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate.
    pub x: f32,
    /// Y coordinate.
    pub y: f32,
    /// Z coordinate.
    pub z: f32,
}

impl Position {
    /// Construct a position from its components.
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Complete replicated state of one participant at one instant.
///
/// Snapshots are plain values: a newer snapshot replaces an older one
/// wholesale, there is no delta or sequence number.
///
/// Field names on the wire are `Position` and `Size`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Participant position.
    #[serde(rename = "Position")]
    pub position: Position,
    /// Participant size (blob radius).
    #[serde(rename = "Size")]
    pub size: f32,
}

impl StateSnapshot {
    /// Size every participant starts with.
    pub const DEFAULT_SIZE: f32 = 1.0;

    /// Construct a snapshot.
    pub const fn new(position: Position, size: f32) -> Self {
        Self { position, size }
    }

    /// Whether every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.position.x.is_finite()
            && self.position.y.is_finite()
            && self.position.z.is_finite()
            && self.size.is_finite()
    }
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            position: Position::default(),
            size: Self::DEFAULT_SIZE,
        }
    }
}
