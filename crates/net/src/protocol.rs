//! Protocol message definitions.
//!
//! State traffic is human-readable JSON, one payload per datagram. Control
//! traffic uses postcard inside length-delimited frames (see the codec).

use blobsync_core::{Endpoint, Position, StateSnapshot};
use serde::{Deserialize, Serialize};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u16 = 1;

/// Protocol magic bytes mixed into the schema hash.
pub const PROTOCOL_MAGIC: &[u8; 8] = b"BLOBSYNC";

/// Maximum size of one control frame body (tag + payload).
pub const MAX_CONTROL_FRAME_LEN: usize = 64 * 1024;

/// Largest UDP payload we will ever read.
pub const MAX_DATAGRAM_LEN: usize = 65_507;

/// Maximum entities carried by one world frame.
/// 16 entries stay well under a typical 1500 byte MTU.
pub const MAX_FRAME_ENTITIES: usize = 16;

/// Maximum length of a rejection reason.
pub const MAX_REASON_LEN: usize = 256;

/// Messages on the reliable control channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMessage {
    /// Client asks to join the session.
    ConnectionRequest {
        /// Protocol version.
        version: u16,
        /// Schema hash for compatibility.
        schema_hash: u64,
        /// UDP port the client's state channel is bound to.
        state_port: u16,
    },

    /// Host accepted the client.
    ConnectionAccepted {
        /// Endpoint the host will know the client by.
        peer: Endpoint,
        /// UDP port of the host's state channel.
        state_port: u16,
        /// Host's latest snapshot, if its local participant exists yet.
        bootstrap: Option<StateSnapshot>,
    },

    /// Host refused the client.
    ConnectionRejected {
        /// Human-readable reason.
        reason: String,
    },

    /// A participant joined; create its entity.
    Spawn(SpawnNotice),

    /// A participant left; drop its entity.
    Despawn {
        /// Endpoint of the departed participant.
        endpoint: Endpoint,
    },

    /// Client is leaving the session.
    Leave,
}

impl ControlMessage {
    /// Short label for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::ConnectionRequest { .. } => "ConnectionRequest",
            ControlMessage::ConnectionAccepted { .. } => "ConnectionAccepted",
            ControlMessage::ConnectionRejected { .. } => "ConnectionRejected",
            ControlMessage::Spawn(_) => "Spawn",
            ControlMessage::Despawn { .. } => "Despawn",
            ControlMessage::Leave => "Leave",
        }
    }

    /// Verify message limits.
    pub fn verify(&self) -> Result<(), &'static str> {
        match self {
            ControlMessage::ConnectionRejected { reason } if reason.len() > MAX_REASON_LEN => {
                Err("Rejection reason too long")
            }
            ControlMessage::ConnectionAccepted {
                bootstrap: Some(snapshot),
                ..
            } if !snapshot.is_finite() => Err("Bootstrap snapshot is not finite"),
            ControlMessage::Spawn(notice) if !notice.snapshot().is_finite() => {
                Err("Spawn notice is not finite")
            }
            _ => Ok(()),
        }
    }
}

/// Announcement of a new participant pushed by the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SpawnNotice {
    /// Endpoint identifying the participant.
    pub endpoint: Endpoint,
    /// Initial position.
    pub position: Position,
    /// Initial size.
    pub size: f32,
}

impl SpawnNotice {
    /// Build a notice from a participant's current snapshot.
    pub fn new(endpoint: Endpoint, snapshot: StateSnapshot) -> Self {
        Self {
            endpoint,
            position: snapshot.position,
            size: snapshot.size,
        }
    }

    /// Initial snapshot carried by the notice.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::new(self.position, self.size)
    }
}

/// One participant's entry in a world broadcast.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EntityFrame {
    /// Endpoint the participant's state originated from.
    pub endpoint: Endpoint,
    /// Participant position.
    #[serde(rename = "Position")]
    pub position: Position,
    /// Participant size.
    #[serde(rename = "Size")]
    pub size: f32,
}

impl EntityFrame {
    /// Build an entry from a registry snapshot.
    pub fn new(endpoint: Endpoint, snapshot: StateSnapshot) -> Self {
        Self {
            endpoint,
            position: snapshot.position,
            size: snapshot.size,
        }
    }

    /// Snapshot carried by the entry.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::new(self.position, self.size)
    }
}

/// Host to client broadcast of (part of) the world.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorldFrame {
    /// Participants in this frame.
    pub entities: Vec<EntityFrame>,
}

impl WorldFrame {
    /// Split a world copy into frames of at most [`MAX_FRAME_ENTITIES`].
    pub fn chunked(entities: &[(Endpoint, StateSnapshot)]) -> Vec<WorldFrame> {
        entities
            .chunks(MAX_FRAME_ENTITIES)
            .map(|chunk| WorldFrame {
                entities: chunk
                    .iter()
                    .map(|(endpoint, snapshot)| EntityFrame::new(*endpoint, *snapshot))
                    .collect(),
            })
            .collect()
    }
}

/// Any payload that may arrive on the state channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StatePayload {
    /// A single participant's snapshot, keyed by the datagram's sender.
    Snapshot(StateSnapshot),
    /// A host broadcast carrying its own keys.
    Frame(WorldFrame),
}
