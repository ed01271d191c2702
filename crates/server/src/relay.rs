//! Host tick: ingest peer datagrams, rebroadcast the world.

use crate::peers::ConnectedPeers;
use blobsync_core::{LocalStateSource, RemotePresenter, SimTick, StateSnapshot};
use blobsync_net::{
    decode_state_payload, encode_frame, EntityRegistry, Observation, StateChannel, StatePayload,
    WorldFrame,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

/// Counters for one tick of either loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Datagrams read from the state channel.
    pub received: usize,
    /// Datagrams dropped (undecodable, or from the local endpoint).
    pub discarded: usize,
    /// Entities created from datagrams this tick.
    pub created: usize,
    /// Datagrams sent successfully.
    pub sent: usize,
    /// Datagram sends that failed.
    pub send_failures: usize,
    /// Entities reported removed to the presenter.
    pub evicted: usize,
}

/// Tunables of the relay loop.
#[derive(Debug, Clone, Copy)]
pub struct RelaySettings {
    /// Echo the host's own snapshot to peers.
    pub include_self: bool,
    /// Evict entities silent for longer than this many ticks.
    pub idle_timeout_ticks: Option<u64>,
    /// Upper bound on datagrams read per tick.
    pub max_datagrams_per_tick: usize,
}

/// Server-side per-tick relay.
pub struct RelayLoop {
    state: StateChannel,
    registry: EntityRegistry,
    peers: ConnectedPeers,
    host_snapshot: Arc<Mutex<Option<StateSnapshot>>>,
    settings: RelaySettings,
    tick: SimTick,
}

impl RelayLoop {
    pub(crate) fn new(
        state: StateChannel,
        registry: EntityRegistry,
        peers: ConnectedPeers,
        host_snapshot: Arc<Mutex<Option<StateSnapshot>>>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            state,
            registry,
            peers,
            host_snapshot,
            settings,
            tick: SimTick::ZERO,
        }
    }

    /// Current tick.
    pub fn current_tick(&self) -> SimTick {
        self.tick
    }

    /// Run one relay tick.
    ///
    /// Never fails: transport and decode faults are logged and counted.
    #[instrument(skip_all, fields(tick = self.tick.0, peers = self.peers.len()))]
    pub async fn tick<L, P>(&mut self, local: &L, presenter: &mut P) -> TickReport
    where
        L: LocalStateSource + ?Sized,
        P: RemotePresenter + ?Sized,
    {
        let mut report = TickReport::default();
        let local_endpoint = self.state.local_endpoint();
        self.registry.begin_tick(self.tick);

        let own = local.local_state();
        *self.host_snapshot.lock() = Some(own);

        let drained = self.state.drain(self.settings.max_datagrams_per_tick);
        report.received = drained.datagrams.len();

        for datagram in drained.datagrams {
            if datagram.from == local_endpoint || datagram.from.is_loopback_of(local_endpoint) {
                trace!("Dropping datagram from own endpoint {}", datagram.from);
                report.discarded += 1;
                continue;
            }

            match decode_state_payload(&datagram.payload) {
                Ok(StatePayload::Snapshot(snapshot)) => {
                    match self.registry.observe(datagram.from, snapshot) {
                        Observation::Created(_) => {
                            debug!("Lazily created entity for {}", datagram.from);
                            report.created += 1;
                        }
                        Observation::Departed => report.discarded += 1,
                        Observation::Updated(_) | Observation::Ignored => {}
                    }
                }
                Ok(StatePayload::Frame(_)) => {
                    debug!("Discarding world frame sent by peer {}", datagram.from);
                    report.discarded += 1;
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

        let mut world = self.registry.snapshot_all();
        if self.settings.include_self {
            world.push((local_endpoint, own));
        }

        let mut frames = Vec::new();
        for frame in WorldFrame::chunked(&world) {
            match encode_frame(&frame) {
                Ok(bytes) => frames.push(bytes),
                Err(e) => warn!("{:#}", e),
            }
        }

        for peer in self.peers.endpoints() {
            for bytes in &frames {
                match self.state.send(peer, bytes).await {
                    Ok(()) => report.sent += 1,
                    Err(e) => {
                        warn!("{:#}", e);
                        report.send_failures += 1;
                    }
                }
            }
        }

        report.evicted = self.registry.present(presenter);

        trace!(?report, "Relay tick complete");
        self.tick = self.tick.advance(1);
        report
    }
}
