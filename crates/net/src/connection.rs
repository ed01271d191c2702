//! One-shot handshake over the control channel.
//!
//! The client announces its protocol version, schema hash and the UDP port of
//! its state channel; the host answers with the endpoint it will know the
//! client by, its own state port and a bootstrap snapshot.

use crate::codec::compute_schema_hash;
use crate::error::HandshakeError;
use crate::protocol::{ControlMessage, PROTOCOL_VERSION};
use crate::transport::ControlConnection;
use anyhow::Result;
use blobsync_core::{Endpoint, StateSnapshot};
use tracing::{debug, info, warn};

/// What a client learns from a successful handshake.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandshakeOutcome {
    /// Endpoint the host knows this client by.
    pub local: Endpoint,
    /// Host's state channel endpoint.
    pub host_state: Endpoint,
    /// Host's snapshot at the time of the handshake.
    pub bootstrap: Option<StateSnapshot>,
}

/// Perform the client side of the handshake.
pub async fn client_handshake(
    control: &mut ControlConnection,
    state_port: u16,
) -> Result<HandshakeOutcome> {
    info!("Starting handshake with {}", control.peer_addr());

    let request = ControlMessage::ConnectionRequest {
        version: PROTOCOL_VERSION,
        schema_hash: compute_schema_hash(),
        state_port,
    };
    control.send(&request).await?;

    let response = control.recv().await?.ok_or(HandshakeError::Closed)?;

    match response {
        ControlMessage::ConnectionAccepted {
            peer,
            state_port,
            bootstrap,
        } => {
            let host_state = Endpoint::new(control.peer_addr().ip(), state_port);
            info!(
                "Handshake successful: known to host as {}, host state channel {}",
                peer, host_state
            );
            Ok(HandshakeOutcome {
                local: peer,
                host_state,
                bootstrap,
            })
        }
        ControlMessage::ConnectionRejected { reason } => {
            warn!("Handshake rejected: {}", reason);
            Err(HandshakeError::Rejected(reason).into())
        }
        msg => Err(HandshakeError::Unexpected {
            expected: "ConnectionAccepted",
            got: msg.kind(),
        }
        .into()),
    }
}

/// Perform the host side of the handshake.
///
/// Returns the client's state endpoint on success. On a version or schema
/// mismatch the client is told why before the error is returned.
///
/// `claim` is called with the client's endpoint once both checks pass and
/// must return `false` if another peer already owns it; the client is then
/// rejected. A claimed endpoint stays claimed if sending the acceptance fails.
pub async fn accept_handshake<F>(
    control: &mut ControlConnection,
    state_port: u16,
    bootstrap: Option<StateSnapshot>,
    claim: F,
) -> Result<Endpoint>
where
    F: FnOnce(Endpoint) -> bool,
{
    let peer_addr = control.peer_addr();
    debug!("Waiting for handshake from {}", peer_addr);

    let request = control.recv().await?.ok_or(HandshakeError::Closed)?;

    let ControlMessage::ConnectionRequest {
        version,
        schema_hash,
        state_port: peer_state_port,
    } = request
    else {
        warn!("Expected ConnectionRequest, got {}", request.kind());
        reject(control, "Expected connection request").await?;
        return Err(HandshakeError::Unexpected {
            expected: "ConnectionRequest",
            got: request.kind(),
        }
        .into());
    };

    debug!(
        "Received handshake: version={}, schema_hash={:016x}, state_port={}",
        version, schema_hash, peer_state_port
    );

    if version != PROTOCOL_VERSION {
        warn!(
            "Protocol version mismatch: client={}, host={}",
            version, PROTOCOL_VERSION
        );
        reject(
            control,
            &format!("Protocol version mismatch: host uses v{PROTOCOL_VERSION}"),
        )
        .await?;
        return Err(HandshakeError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote: version,
        }
        .into());
    }

    let local_hash = compute_schema_hash();
    if schema_hash != local_hash {
        warn!(
            "Schema hash mismatch: client={:016x}, host={:016x}",
            schema_hash, local_hash
        );
        reject(control, "Schema mismatch: incompatible client version").await?;
        return Err(HandshakeError::SchemaMismatch {
            local: local_hash,
            remote: schema_hash,
        }
        .into());
    }

    let peer = Endpoint::new(peer_addr.ip(), peer_state_port);
    if !claim(peer) {
        warn!("Endpoint {} is already connected", peer);
        reject(control, "Endpoint already connected").await?;
        return Err(HandshakeError::EndpointInUse(peer).into());
    }

    control
        .send(&ControlMessage::ConnectionAccepted {
            peer,
            state_port,
            bootstrap,
        })
        .await?;

    info!("Accepted {} (state endpoint {})", peer_addr, peer);
    Ok(peer)
}

async fn reject(control: &mut ControlConnection, reason: &str) -> Result<()> {
    control
        .send(&ControlMessage::ConnectionRejected {
            reason: reason.to_string(),
        })
        .await
}
