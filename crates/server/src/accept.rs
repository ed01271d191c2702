//! Accept loop and per-peer control handling on the host.

use crate::peers::ConnectedPeers;
use blobsync_core::{Endpoint, StateSnapshot};
use blobsync_net::{
    accept_handshake, ControlConnection, ControlListener, ControlMessage, ControlReader,
    ControlWriter, EntityRegistry, SpawnNotice,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Everything a control task needs from the host.
#[derive(Clone)]
pub(crate) struct AcceptContext {
    pub registry: EntityRegistry,
    pub peers: ConnectedPeers,
    /// Host's latest local snapshot, refreshed every tick.
    pub host_snapshot: Arc<Mutex<Option<StateSnapshot>>>,
    /// Host's state channel endpoint.
    pub host_endpoint: Endpoint,
    pub include_self: bool,
    pub handshake_timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl AcceptContext {
    fn host_snapshot(&self) -> Option<StateSnapshot> {
        *self.host_snapshot.lock()
    }
}

/// Accept control connections until cancelled.
pub(crate) async fn run_accept_loop(listener: ControlListener, ctx: AcceptContext) {
    info!("Accepting peers on {}", listener.local_addr());
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => {
                    tokio::spawn(handle_peer(conn, ctx.clone()));
                }
                Err(e) => warn!("Failed to accept peer: {:#}", e),
            },
        }
    }
    debug!("Accept loop stopped");
}

/// Drive one peer from handshake to departure.
#[instrument(skip_all, fields(addr = %conn.peer_addr()))]
async fn handle_peer(mut conn: ControlConnection, ctx: AcceptContext) {
    let (outbound, queue) = unbounded_channel();
    let endpoint = match handshake(&mut conn, &ctx, &outbound).await {
        Some(endpoint) => endpoint,
        None => {
            ctx.peers.release(&outbound);
            return;
        }
    };
    drop(outbound);

    let (reader, writer) = conn.into_split();
    let writer_task = tokio::spawn(run_writer(writer, queue, ctx.cancel.clone()));

    // Existing world first, then announce the newcomer.
    for (existing, snapshot) in ctx.registry.snapshot_all() {
        if existing != endpoint {
            let notice = SpawnNotice::new(existing, snapshot);
            ctx.peers.send_to(endpoint, ControlMessage::Spawn(notice));
        }
    }
    if ctx.include_self {
        if let Some(snapshot) = ctx.host_snapshot() {
            let notice = SpawnNotice::new(ctx.host_endpoint, snapshot);
            ctx.peers.send_to(endpoint, ControlMessage::Spawn(notice));
        }
    }

    // Also lifts a departure mark left by an earlier session on this endpoint.
    if let Some(entity) = ctx.registry.ensure(endpoint) {
        let notice = SpawnNotice::new(endpoint, entity.latest);
        ctx.peers.notify_all(&ControlMessage::Spawn(notice), Some(endpoint));
    }
    info!("Peer {} joined ({} connected)", endpoint, ctx.peers.len());

    run_reader(reader, endpoint, &ctx.cancel).await;

    ctx.peers.remove(endpoint);
    ctx.registry.evict(endpoint);
    ctx.peers.notify_all(&ControlMessage::Despawn { endpoint }, None);
    info!("Peer {} left ({} connected)", endpoint, ctx.peers.len());

    if let Err(e) = writer_task.await {
        warn!("Control writer for {} panicked: {}", endpoint, e);
    }
}

/// Run the host side of the handshake, registering `outbound` under the
/// client's endpoint unless another peer already holds it.
async fn handshake(
    conn: &mut ControlConnection,
    ctx: &AcceptContext,
    outbound: &UnboundedSender<ControlMessage>,
) -> Option<Endpoint> {
    let state_port = ctx.host_endpoint.port();
    let bootstrap = ctx.host_snapshot();
    let claim = |endpoint: Endpoint| ctx.peers.insert(endpoint, outbound.clone());

    let result = tokio::select! {
        _ = ctx.cancel.cancelled() => return None,
        result = with_timeout(
            ctx.handshake_timeout,
            accept_handshake(conn, state_port, bootstrap, claim),
        ) => result,
    };

    match result {
        Some(Ok(endpoint)) => Some(endpoint),
        Some(Err(e)) => {
            warn!("Handshake with {} failed: {:#}", conn.peer_addr(), e);
            None
        }
        None => {
            warn!("Handshake with {} timed out", conn.peer_addr());
            None
        }
    }
}

async fn with_timeout<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

async fn run_reader(mut reader: ControlReader, endpoint: Endpoint, cancel: &CancellationToken) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            received = reader.recv() => received,
        };

        match received {
            Ok(Some(ControlMessage::Leave)) => {
                debug!("Peer {} sent Leave", endpoint);
                return;
            }
            Ok(Some(msg)) => debug!("Ignoring {} from peer {}", msg.kind(), endpoint),
            Ok(None) => return,
            Err(e) => {
                warn!("Control channel to {} failed: {:#}", endpoint, e);
                return;
            }
        }
    }
}

async fn run_writer(
    mut writer: ControlWriter,
    mut queue: UnboundedReceiver<ControlMessage>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = queue.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        if let Err(e) = writer.send(&msg).await {
            warn!("{:#}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}
