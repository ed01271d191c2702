//! Message encoding and decoding.
//!
//! State payloads are bare JSON documents, one per datagram, relying on UDP
//! message boundaries. Control messages are length-prefixed for the TCP
//! stream.

use crate::error::DecodeError;
use crate::protocol::{
    ControlMessage, StatePayload, WorldFrame, MAX_CONTROL_FRAME_LEN, PROTOCOL_MAGIC,
    PROTOCOL_VERSION,
};
use anyhow::{Context, Result};
use blobsync_core::StateSnapshot;
use blake3::Hash;

/// Size of the control frame length prefix.
const LENGTH_PREFIX: usize = 4;

/// Compute schema hash from protocol definitions.
///
/// Exchanged during the handshake so that builds with incompatible message
/// layouts refuse each other instead of exchanging garbage.
pub fn compute_schema_hash() -> u64 {
    let mut hasher = blake3::Hasher::new();

    hasher.update(&PROTOCOL_VERSION.to_le_bytes());
    hasher.update(PROTOCOL_MAGIC);

    // Message type names (deterministic)
    hasher.update(b"StateSnapshot");
    hasher.update(b"WorldFrame");
    hasher.update(b"ControlMessage");
    hasher.update(b"SpawnNotice");

    let hash: Hash = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(bytes)
}

/// Encode a single participant snapshot for the state channel.
pub fn encode_snapshot(snapshot: &StateSnapshot) -> Result<Vec<u8>> {
    serde_json::to_vec(snapshot).context("Failed to serialize state snapshot")
}

/// Decode a single participant snapshot.
pub fn decode_snapshot(data: &[u8]) -> Result<StateSnapshot, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }
    let snapshot: StateSnapshot = serde_json::from_slice(data)?;
    if !snapshot.is_finite() {
        return Err(DecodeError::NonFinite);
    }
    Ok(snapshot)
}

/// Encode a world broadcast frame.
pub fn encode_frame(frame: &WorldFrame) -> Result<Vec<u8>> {
    serde_json::to_vec(frame).context("Failed to serialize world frame")
}

/// Decode a world broadcast frame.
pub fn decode_frame(data: &[u8]) -> Result<WorldFrame, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }
    let frame: WorldFrame = serde_json::from_slice(data)?;
    if frame.entities.iter().any(|e| !e.snapshot().is_finite()) {
        return Err(DecodeError::NonFinite);
    }
    Ok(frame)
}

/// Decode whatever arrived on the state channel.
pub fn decode_state_payload(data: &[u8]) -> Result<StatePayload, DecodeError> {
    match decode_snapshot(data) {
        Ok(snapshot) => Ok(StatePayload::Snapshot(snapshot)),
        Err(DecodeError::Empty) => Err(DecodeError::Empty),
        Err(_) => decode_frame(data).map(StatePayload::Frame),
    }
}

/// Encode a control message with length prefix.
///
/// Frame format: [length: u32][message_type: u8][payload: bytes]
pub fn encode_control(msg: &ControlMessage) -> Result<Vec<u8>> {
    let payload = postcard::to_allocvec(msg).context("Failed to serialize control message")?;

    let length = 1 + payload.len();
    anyhow::ensure!(
        length <= MAX_CONTROL_FRAME_LEN,
        "Control frame of {} bytes exceeds limit {}",
        length,
        MAX_CONTROL_FRAME_LEN
    );

    let mut frame = Vec::with_capacity(LENGTH_PREFIX + length);
    frame.extend_from_slice(&(length as u32).to_le_bytes());
    frame.push(control_type_tag(msg));
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Decode a control message from frame data.
///
/// Expects data to start with the length prefix.
pub fn decode_control(data: &[u8]) -> Result<ControlMessage, DecodeError> {
    if data.len() < LENGTH_PREFIX + 1 {
        return Err(DecodeError::TooShort {
            actual: data.len(),
            minimum: LENGTH_PREFIX + 1,
        });
    }

    let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if length > MAX_CONTROL_FRAME_LEN {
        return Err(DecodeError::Oversized {
            length,
            limit: MAX_CONTROL_FRAME_LEN,
        });
    }
    if data.len() < LENGTH_PREFIX + length {
        return Err(DecodeError::Incomplete {
            expected: LENGTH_PREFIX + length,
            actual: data.len(),
        });
    }

    decode_control_body(&data[LENGTH_PREFIX..LENGTH_PREFIX + length])
}

/// Decode the body of a control frame (tag + payload) whose length prefix
/// has already been consumed.
pub fn decode_control_body(body: &[u8]) -> Result<ControlMessage, DecodeError> {
    let Some((&tag, payload)) = body.split_first() else {
        return Err(DecodeError::TooShort {
            actual: 0,
            minimum: 1,
        });
    };

    let msg: ControlMessage = postcard::from_bytes(payload)?;
    if control_type_tag(&msg) != tag {
        return Err(DecodeError::TagMismatch { tag });
    }

    Ok(msg)
}

/// Get message type tag for control messages.
fn control_type_tag(msg: &ControlMessage) -> u8 {
    match msg {
        ControlMessage::ConnectionRequest { .. } => 0,
        ControlMessage::ConnectionAccepted { .. } => 1,
        ControlMessage::ConnectionRejected { .. } => 2,
        ControlMessage::Spawn(_) => 3,
        ControlMessage::Despawn { .. } => 4,
        ControlMessage::Leave => 5,
    }
}
