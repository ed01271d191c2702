//! Peers known through the control channel.

use blobsync_core::Endpoint;
use blobsync_net::ControlMessage;
use parking_lot::Mutex;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// Connected peers and the outbound queue of each one's control writer.
///
/// A peer is present from the end of its handshake until its control
/// channel closes, whether or not any of its datagrams arrived yet.
#[derive(Debug, Clone, Default)]
pub struct ConnectedPeers {
    // BTreeMap keeps broadcast order deterministic.
    inner: Arc<Mutex<BTreeMap<Endpoint, UnboundedSender<ControlMessage>>>>,
}

impl ConnectedPeers {
    /// Create an empty peer table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer. Returns `false` and keeps the existing queue if the
    /// endpoint is already connected.
    pub fn insert(&self, endpoint: Endpoint, outbound: UnboundedSender<ControlMessage>) -> bool {
        match self.inner.lock().entry(endpoint) {
            Entry::Vacant(slot) => {
                slot.insert(outbound);
                true
            }
            Entry::Occupied(_) => {
                warn!("Peer {} is already connected", endpoint);
                false
            }
        }
    }

    /// Drop a peer. Its writer drains and stops once the queue is released.
    pub fn remove(&self, endpoint: Endpoint) -> bool {
        self.inner.lock().remove(&endpoint).is_some()
    }

    /// Drop whichever peer was registered with `outbound`, if any.
    pub fn release(&self, outbound: &UnboundedSender<ControlMessage>) -> Option<Endpoint> {
        let mut inner = self.inner.lock();
        let endpoint = inner
            .iter()
            .find(|(_, queue)| queue.same_channel(outbound))
            .map(|(endpoint, _)| *endpoint)?;
        inner.remove(&endpoint);
        debug!("Released control queue of {}", endpoint);
        Some(endpoint)
    }

    /// Whether `endpoint` is connected.
    pub fn contains(&self, endpoint: Endpoint) -> bool {
        self.inner.lock().contains_key(&endpoint)
    }

    /// Point-in-time copy of every connected endpoint.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.inner.lock().keys().copied().collect()
    }

    /// Queue a control message for one peer.
    pub fn send_to(&self, endpoint: Endpoint, msg: ControlMessage) -> bool {
        let inner = self.inner.lock();
        match inner.get(&endpoint) {
            Some(outbound) => outbound.send(msg).is_ok(),
            None => false,
        }
    }

    /// Queue a control message for every peer except `except`.
    ///
    /// Returns how many queues accepted it.
    pub fn notify_all(&self, msg: &ControlMessage, except: Option<Endpoint>) -> usize {
        let inner = self.inner.lock();
        let mut delivered = 0;
        for (endpoint, outbound) in inner.iter() {
            if Some(*endpoint) == except {
                continue;
            }
            if outbound.send(msg.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!("Control queue for {} already closed", endpoint);
            }
        }
        delivered
    }

    /// Number of connected peers.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether no peer is connected.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
