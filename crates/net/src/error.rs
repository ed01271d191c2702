//! Error types callers match on.

use thiserror::Error;

/// Failure to decode a payload received from the network.
///
/// Decoding never panics; every malformed, truncated or foreign payload maps
/// to one of these variants and is dropped by the loops.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Payload was empty.
    #[error("empty payload")]
    Empty,
    /// State payload was not a well-formed JSON document of the expected shape.
    #[error("invalid state payload: {0}")]
    InvalidFormat(#[from] serde_json::Error),
    /// A snapshot decoded but carried a non-finite number.
    #[error("snapshot contains a non-finite value")]
    NonFinite,
    /// Control frame shorter than its header.
    #[error("frame too short: {actual} bytes (minimum {minimum})")]
    TooShort {
        /// Bytes available.
        actual: usize,
        /// Bytes required.
        minimum: usize,
    },
    /// Control frame shorter than its declared length.
    #[error("incomplete frame: expected {expected} bytes, got {actual}")]
    Incomplete {
        /// Bytes the length prefix promised.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },
    /// Control frame length prefix over the limit.
    #[error("frame length {length} exceeds limit {limit}")]
    Oversized {
        /// Declared length.
        length: usize,
        /// Maximum accepted length.
        limit: usize,
    },
    /// Control frame tag does not match its payload.
    #[error("control tag {tag} does not match payload")]
    TagMismatch {
        /// Tag carried by the frame.
        tag: u8,
    },
    /// Control payload failed to deserialize.
    #[error("invalid control payload: {0}")]
    InvalidControl(#[from] postcard::Error),
}

/// Failure of the one-shot control handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Peers speak different protocol versions.
    #[error("protocol version mismatch: local v{local}, remote v{remote}")]
    VersionMismatch {
        /// Our version.
        local: u16,
        /// Their version.
        remote: u16,
    },
    /// Peers were built from different message schemas.
    #[error("schema hash mismatch: local {local:016x}, remote {remote:016x}")]
    SchemaMismatch {
        /// Our schema hash.
        local: u64,
        /// Their schema hash.
        remote: u64,
    },
    /// Host refused the connection.
    #[error("connection rejected: {0}")]
    Rejected(String),
    /// Peer sent a control message that does not belong in the handshake.
    #[error("expected {expected}, got {got}")]
    Unexpected {
        /// Message kind we waited for.
        expected: &'static str,
        /// Message kind we received.
        got: &'static str,
    },
    /// Another connected peer already owns the client's state endpoint.
    #[error("endpoint {0} is already connected")]
    EndpointInUse(blobsync_core::Endpoint),
    /// Control channel closed before the handshake completed.
    #[error("control channel closed during handshake")]
    Closed,
}
