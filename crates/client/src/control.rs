//! Client side of the control channel after the handshake.

use blobsync_net::{ControlMessage, ControlReader, EntityRegistry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Apply spawn and despawn notices until the host closes the channel or
/// `cancel` fires. Clears `connected` on exit.
pub(crate) async fn run_control_reader(
    mut reader: ControlReader,
    registry: EntityRegistry,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = reader.recv() => received,
        };

        match received {
            Ok(Some(ControlMessage::Spawn(notice))) => {
                debug!("Spawn notice for {}", notice.endpoint);
                registry.ensure_with(notice.endpoint, notice.snapshot());
            }
            Ok(Some(ControlMessage::Despawn { endpoint })) => {
                debug!("Despawn notice for {}", endpoint);
                registry.evict(endpoint);
            }
            Ok(Some(msg)) => debug!("Ignoring {} from host", msg.kind()),
            Ok(None) => {
                info!("Host {} closed the control channel", reader.peer_addr());
                break;
            }
            Err(e) => {
                warn!("Control channel to host failed: {:#}", e);
                break;
            }
        }
    }
    connected.store(false, Ordering::Release);
}
