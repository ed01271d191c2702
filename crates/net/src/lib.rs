#![warn(missing_docs)]
//! Networking layer shared by the host and the clients: wire codec, the
//! TCP/UDP transport pair, the one-shot handshake and the entity registry.

mod codec;
mod connection;
mod error;
mod protocol;
mod registry;
mod transport;

pub use codec::{
    compute_schema_hash, decode_control, decode_control_body, decode_frame, decode_snapshot,
    decode_state_payload, encode_control, encode_frame, encode_snapshot,
};
pub use connection::{accept_handshake, client_handshake, HandshakeOutcome};
pub use error::{DecodeError, HandshakeError};
pub use protocol::{
    ControlMessage, EntityFrame, SpawnNotice, StatePayload, WorldFrame, MAX_CONTROL_FRAME_LEN,
    MAX_DATAGRAM_LEN, MAX_FRAME_ENTITIES, PROTOCOL_MAGIC, PROTOCOL_VERSION,
};
pub use registry::{EntityRegistry, Observation, RemoteEntity};
pub use transport::{
    ClientTransport, ControlConnection, ControlListener, ControlReader, ControlWriter, Datagram,
    Drained, HostTransport, StateChannel, TransportPair,
};
