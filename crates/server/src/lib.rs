#![warn(missing_docs)]
//! Host role: accepts peers on the control channel and relays the world over
//! the state channel.

mod accept;
mod peers;
mod relay;

pub use peers::ConnectedPeers;
pub use relay::{RelayLoop, RelaySettings, TickReport};

use accept::{run_accept_loop, AcceptContext};
use anyhow::Result;
use blobsync_core::{Endpoint, LocalStateSource, RemotePresenter, SessionConfig, SimTick};
use blobsync_net::{EntityRegistry, HostTransport};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A bound host: accept loop running in the background, relay driven by
/// [`tick`](Self::tick).
pub struct RelayServer {
    relay: RelayLoop,
    registry: EntityRegistry,
    peers: ConnectedPeers,
    control_addr: SocketAddr,
    state_endpoint: Endpoint,
    cancel: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl RelayServer {
    /// Bind both host channels and start accepting peers.
    pub async fn bind(config: &SessionConfig) -> Result<Self> {
        Self::bind_with_cancel(config, CancellationToken::new()).await
    }

    /// Like [`bind`](Self::bind); cancelling `cancel` stops the accept loop
    /// and every peer task.
    pub async fn bind_with_cancel(config: &SessionConfig, cancel: CancellationToken) -> Result<Self> {
        let cancel = cancel.child_token();
        let transport = HostTransport::open(config.control_addr(), config.state_addr()).await?;
        let control_addr = transport.control.local_addr();
        let state_endpoint = transport.state.local_endpoint();

        let registry = EntityRegistry::with_local(state_endpoint);
        let peers = ConnectedPeers::new();
        let host_snapshot = Arc::new(Mutex::new(None));

        let ctx = AcceptContext {
            registry: registry.clone(),
            peers: peers.clone(),
            host_snapshot: host_snapshot.clone(),
            host_endpoint: state_endpoint,
            include_self: config.include_self_in_broadcast,
            handshake_timeout: config.handshake_timeout(),
            cancel: cancel.clone(),
        };
        let accept_task = tokio::spawn(run_accept_loop(transport.control, ctx));

        let settings = RelaySettings {
            include_self: config.include_self_in_broadcast,
            idle_timeout_ticks: config.idle_timeout_ticks,
            max_datagrams_per_tick: config.max_datagrams_per_tick,
        };
        let relay = RelayLoop::new(
            transport.state,
            registry.clone(),
            peers.clone(),
            host_snapshot,
            settings,
        );

        info!(
            "Hosting session: control {}, state {}",
            control_addr, state_endpoint
        );

        Ok(Self {
            relay,
            registry,
            peers,
            control_addr,
            state_endpoint,
            cancel,
            accept_task: Some(accept_task),
        })
    }

    /// Run one relay tick.
    pub async fn tick<L, P>(&mut self, local: &L, presenter: &mut P) -> TickReport
    where
        L: LocalStateSource + ?Sized,
        P: RemotePresenter + ?Sized,
    {
        self.relay.tick(local, presenter).await
    }

    /// Address of the control listener.
    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    /// Endpoint of the host's state channel.
    pub fn state_endpoint(&self) -> Endpoint {
        self.state_endpoint
    }

    /// The host's registry.
    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Peers connected over the control channel.
    pub fn peers(&self) -> &ConnectedPeers {
        &self.peers
    }

    /// Current tick.
    pub fn current_tick(&self) -> SimTick {
        self.relay.current_tick()
    }

    /// Stop accepting and close every peer's control channel.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                warn!("Accept loop panicked: {}", e);
            }
        }
        info!("Host on {} shut down", self.control_addr);
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
