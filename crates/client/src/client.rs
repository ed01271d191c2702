//! A client joined to a host.

use crate::control::run_control_reader;
use crate::sync::{SyncLoop, SyncSettings};
use anyhow::Result;
use blobsync_core::{Endpoint, LocalStateSource, RemotePresenter, SessionConfig, StateSnapshot};
use blobsync_net::{client_handshake, ClientTransport, ControlMessage, ControlWriter, EntityRegistry};
use blobsync_server::TickReport;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Connected client: control reader in the background, sync driven by
/// [`tick`](Self::tick).
pub struct SyncClient {
    sync: SyncLoop,
    writer: ControlWriter,
    registry: EntityRegistry,
    local: Endpoint,
    bootstrap: Option<StateSnapshot>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    reader_task: Option<JoinHandle<()>>,
}

impl SyncClient {
    /// Connect to the host's control listener and perform the handshake.
    ///
    /// On return the state channel is ready to send.
    pub async fn connect(host_control: SocketAddr, config: &SessionConfig) -> Result<Self> {
        let transport = ClientTransport::connect(host_control).await?;
        let mut control = transport.control;
        let state = transport.state;

        let outcome = client_handshake(&mut control, state.local_endpoint().port()).await?;

        let registry = EntityRegistry::with_local(outcome.local);
        let connected = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        let (reader, writer) = control.into_split();
        let reader_task = tokio::spawn(run_control_reader(
            reader,
            registry.clone(),
            connected.clone(),
            cancel.clone(),
        ));

        let settings = SyncSettings {
            idle_timeout_ticks: config.idle_timeout_ticks,
            max_datagrams_per_tick: config.max_datagrams_per_tick,
        };
        let mut sync = SyncLoop::new(state, outcome.host_state, registry.clone(), settings);
        sync.mark_ready();

        info!(
            "Joined {} as {} (host state {})",
            host_control, outcome.local, outcome.host_state
        );

        Ok(Self {
            sync,
            writer,
            registry,
            local: outcome.local,
            bootstrap: outcome.bootstrap,
            connected,
            cancel,
            reader_task: Some(reader_task),
        })
    }

    /// Run one sync tick.
    pub async fn tick<L, P>(&mut self, local: &L, presenter: &mut P) -> TickReport
    where
        L: LocalStateSource + ?Sized,
        P: RemotePresenter + ?Sized,
    {
        self.sync.tick(local, presenter).await
    }

    /// Endpoint the host knows this client by.
    pub fn local_endpoint(&self) -> Endpoint {
        self.local
    }

    /// Host's state endpoint.
    pub fn host_endpoint(&self) -> Endpoint {
        self.sync.host()
    }

    /// Host snapshot received with the handshake.
    pub fn bootstrap(&self) -> Option<StateSnapshot> {
        self.bootstrap
    }

    /// The client's mirror of the registry.
    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Whether the host's control channel is still open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Tell the host we are leaving and close both channels.
    pub async fn shutdown(mut self) {
        if self.is_connected() {
            if let Err(e) = self.writer.send(&ControlMessage::Leave).await {
                warn!("{:#}", e);
            }
        }
        if let Err(e) = self.writer.shutdown().await {
            warn!("{:#}", e);
        }

        self.cancel.cancel();
        if let Some(task) = self.reader_task.take() {
            if let Err(e) = task.await {
                warn!("Control reader panicked: {}", e);
            }
        }
        info!("Left session as {}", self.local);
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
