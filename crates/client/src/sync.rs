//! Client tick: send the local snapshot, apply the host's broadcasts.

use blobsync_core::{Endpoint, LocalStateSource, RemotePresenter, SimTick};
use blobsync_net::{
    decode_state_payload, encode_snapshot, EntityRegistry, Observation, StateChannel,
    StatePayload,
};
use blobsync_server::TickReport;
use tracing::{debug, instrument, trace, warn};

/// Tunables of the sync loop.
#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    /// Evict entities silent for longer than this many ticks.
    pub idle_timeout_ticks: Option<u64>,
    /// Upper bound on datagrams read per tick.
    pub max_datagrams_per_tick: usize,
}

/// Client-side per-tick sync.
pub struct SyncLoop {
    state: StateChannel,
    host: Endpoint,
    registry: EntityRegistry,
    settings: SyncSettings,
    ready: bool,
    tick: SimTick,
}

impl SyncLoop {
    /// Create a sync loop that sends to `host` once marked ready.
    pub fn new(
        state: StateChannel,
        host: Endpoint,
        registry: EntityRegistry,
        settings: SyncSettings,
    ) -> Self {
        Self {
            state,
            host,
            registry,
            settings,
            ready: false,
            tick: SimTick::ZERO,
        }
    }

    /// Allow sending; called once the handshake completed.
    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    /// Host's state endpoint.
    pub fn host(&self) -> Endpoint {
        self.host
    }

    /// Local endpoint of the state socket.
    pub fn local_endpoint(&self) -> Endpoint {
        self.state.local_endpoint()
    }

    /// Current tick.
    pub fn current_tick(&self) -> SimTick {
        self.tick
    }

    /// Run one sync tick.
    #[instrument(skip_all, fields(tick = self.tick.0, host = %self.host))]
    pub async fn tick<L, P>(&mut self, local: &L, presenter: &mut P) -> TickReport
    where
        L: LocalStateSource + ?Sized,
        P: RemotePresenter + ?Sized,
    {
        let mut report = TickReport::default();
        self.registry.begin_tick(self.tick);

        if self.ready {
            match encode_snapshot(&local.local_state()) {
                Ok(bytes) => match self.state.send(self.host, &bytes).await {
                    Ok(()) => report.sent += 1,
                    Err(e) => {
                        warn!("{:#}", e);
                        report.send_failures += 1;
                    }
                },
                Err(e) => warn!("{:#}", e),
            }
        } else {
            trace!("State channel not ready, skipping send");
        }

        let drained = self.state.drain(self.settings.max_datagrams_per_tick);
        report.received = drained.datagrams.len();

        for datagram in drained.datagrams {
            match decode_state_payload(&datagram.payload) {
                Ok(StatePayload::Frame(frame)) => {
                    for entry in &frame.entities {
                        if let Observation::Created(_) =
                            self.registry.observe(entry.endpoint, entry.snapshot())
                        {
                            report.created += 1;
                        }
                    }
                }
                Ok(StatePayload::Snapshot(snapshot)) => {
                    match self.registry.observe(datagram.from, snapshot) {
                        Observation::Created(_) => report.created += 1,
                        Observation::Departed => report.discarded += 1,
                        Observation::Updated(_) | Observation::Ignored => {}
                    }
                }
                Err(e) => {
                    debug!("Discarding datagram from {}: {}", datagram.from, e);
                    report.discarded += 1;
                }
            }
        }

        if let Some(max_idle) = self.settings.idle_timeout_ticks {
            self.registry.evict_idle(self.tick, max_idle);
        }

        report.evicted = self.registry.present(presenter);

        trace!(?report, "Sync tick complete");
        self.tick = self.tick.advance(1);
        report
    }
}
