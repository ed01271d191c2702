//! Registry of remote participants keyed by their state endpoint.
//!
//! Shared between the tick loop and the control tasks that apply spawn and
//! despawn notices, so every operation takes the lock once and leaves the map
//! consistent when it returns.

use blobsync_core::{
    Endpoint, PresentOutcome, PresentationHandle, RemotePresenter, SimTick, StateSnapshot,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// One remote participant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteEntity {
    /// Endpoint the participant's state arrives from.
    pub endpoint: Endpoint,
    /// Most recently applied snapshot.
    pub latest: StateSnapshot,
    /// Presentation handle allocated on creation.
    pub handle: PresentationHandle,
    /// Tick of the last update.
    pub last_seen: SimTick,
}

/// What [`EntityRegistry::observe`] did with a snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Observation {
    /// First sighting; a new entity was created.
    Created(RemoteEntity),
    /// Existing entity overwritten.
    Updated(RemoteEntity),
    /// Snapshot came from the local endpoint.
    Ignored,
    /// Snapshot came from an endpoint that left; dropped until it is
    /// admitted again.
    Departed,
}

#[derive(Debug, Default)]
struct Inner {
    // BTreeMap keeps iteration (and so broadcast order) deterministic.
    entities: BTreeMap<Endpoint, RemoteEntity>,
    local: Option<Endpoint>,
    next_handle: u64,
    tick: SimTick,
    evicted: Vec<RemoteEntity>,
    // Endpoints that left through the control channel.
    departed: BTreeSet<Endpoint>,
}

impl Inner {
    fn is_local(&self, endpoint: Endpoint) -> bool {
        self.local == Some(endpoint)
    }

    fn allocate(&mut self, endpoint: Endpoint, snapshot: StateSnapshot) -> RemoteEntity {
        let handle = PresentationHandle(self.next_handle);
        self.next_handle += 1;
        let entity = RemoteEntity {
            endpoint,
            latest: snapshot,
            handle,
            last_seen: self.tick,
        };
        self.entities.insert(endpoint, entity);
        debug!("Created remote entity {} with handle {:?}", endpoint, handle);
        entity
    }
}

/// Map from endpoint to remote entity.
///
/// Cloning yields another handle to the same registry.
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl EntityRegistry {
    /// Create an empty registry with no local endpoint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry that never stores `local`.
    pub fn with_local(local: Endpoint) -> Self {
        let registry = Self::new();
        registry.set_local(local);
        registry
    }

    /// Set the local endpoint and drop any entry already stored under it.
    pub fn set_local(&self, local: Endpoint) {
        let mut inner = self.inner.lock();
        inner.local = Some(local);
        if inner.entities.remove(&local).is_some() {
            debug!("Dropped registry entry for local endpoint {}", local);
        }
    }

    /// The local endpoint, if known.
    pub fn local(&self) -> Option<Endpoint> {
        self.inner.lock().local
    }

    /// Record the tick that subsequent updates belong to.
    pub fn begin_tick(&self, tick: SimTick) {
        self.inner.lock().tick = tick;
    }

    /// Ensure an entity exists for `endpoint`, creating it with the default
    /// snapshot if absent. Returns `None` for the local endpoint.
    pub fn ensure(&self, endpoint: Endpoint) -> Option<RemoteEntity> {
        self.ensure_with(endpoint, StateSnapshot::default())
    }

    /// Like [`ensure`](Self::ensure) but seeds a new entity with `snapshot`.
    ///
    /// An existing entity is returned untouched. Both admit an endpoint that
    /// previously departed through [`evict`](Self::evict).
    pub fn ensure_with(&self, endpoint: Endpoint, snapshot: StateSnapshot) -> Option<RemoteEntity> {
        let mut inner = self.inner.lock();
        if inner.is_local(endpoint) {
            return None;
        }
        if inner.departed.remove(&endpoint) {
            debug!("Readmitted departed endpoint {}", endpoint);
        }
        if let Some(existing) = inner.entities.get(&endpoint) {
            return Some(*existing);
        }
        Some(inner.allocate(endpoint, snapshot))
    }

    /// Overwrite the latest snapshot of an existing entity.
    ///
    /// Returns `false` if no entity exists for `endpoint`.
    pub fn update(&self, endpoint: Endpoint, snapshot: StateSnapshot) -> bool {
        let mut inner = self.inner.lock();
        let tick = inner.tick;
        match inner.entities.get_mut(&endpoint) {
            Some(entity) => {
                entity.latest = snapshot;
                entity.last_seen = tick;
                true
            }
            None => false,
        }
    }

    /// Apply a received snapshot, creating the entity on first sighting.
    ///
    /// Snapshots for a departed endpoint are dropped, so datagrams still in
    /// flight when it left cannot bring it back.
    pub fn observe(&self, endpoint: Endpoint, snapshot: StateSnapshot) -> Observation {
        let mut inner = self.inner.lock();
        if inner.is_local(endpoint) {
            trace!("Ignoring snapshot from local endpoint {}", endpoint);
            return Observation::Ignored;
        }
        if inner.departed.contains(&endpoint) {
            trace!("Ignoring snapshot from departed endpoint {}", endpoint);
            return Observation::Departed;
        }
        let tick = inner.tick;
        match inner.entities.get_mut(&endpoint) {
            Some(entity) => {
                entity.latest = snapshot;
                entity.last_seen = tick;
                Observation::Updated(*entity)
            }
            None => Observation::Created(inner.allocate(endpoint, snapshot)),
        }
    }

    /// Look up one entity.
    pub fn get(&self, endpoint: Endpoint) -> Option<RemoteEntity> {
        self.inner.lock().entities.get(&endpoint).copied()
    }

    /// Whether an entity exists for `endpoint`.
    pub fn contains(&self, endpoint: Endpoint) -> bool {
        self.inner.lock().entities.contains_key(&endpoint)
    }

    /// Whether `endpoint` departed and has not been admitted since.
    pub fn has_departed(&self, endpoint: Endpoint) -> bool {
        self.inner.lock().departed.contains(&endpoint)
    }

    /// Every `(endpoint, latest)` pair, in endpoint order.
    pub fn snapshot_all(&self) -> Vec<(Endpoint, StateSnapshot)> {
        self.inner
            .lock()
            .entities
            .values()
            .map(|e| (e.endpoint, e.latest))
            .collect()
    }

    /// Copy of every entity, in endpoint order.
    pub fn entities(&self) -> Vec<RemoteEntity> {
        self.inner.lock().entities.values().copied().collect()
    }

    /// Drop an entity without queueing a removal notification.
    ///
    /// Used when the presenter reported the handle stale; the entity is
    /// recreated on its next datagram.
    pub fn remove(&self, endpoint: Endpoint) -> Option<RemoteEntity> {
        let removed = self.inner.lock().entities.remove(&endpoint);
        if removed.is_some() {
            debug!("Removed remote entity {}", endpoint);
        }
        removed
    }

    /// Mark `endpoint` departed, drop its entity and queue it for
    /// [`take_evicted`](Self::take_evicted).
    ///
    /// Later snapshots from the endpoint are ignored until
    /// [`ensure`](Self::ensure) admits it again.
    pub fn evict(&self, endpoint: Endpoint) -> Option<RemoteEntity> {
        let mut inner = self.inner.lock();
        if inner.is_local(endpoint) {
            return None;
        }
        inner.departed.insert(endpoint);
        let removed = inner.entities.remove(&endpoint)?;
        inner.evicted.push(removed);
        debug!("Evicted remote entity {}", endpoint);
        Some(removed)
    }

    /// Evict every entity not updated within `max_idle` ticks of `now`.
    pub fn evict_idle(&self, now: SimTick, max_idle: u64) -> Vec<RemoteEntity> {
        let mut inner = self.inner.lock();
        let stale: Vec<Endpoint> = inner
            .entities
            .values()
            .filter(|e| now.since(e.last_seen) > max_idle)
            .map(|e| e.endpoint)
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for endpoint in stale {
            if let Some(entity) = inner.entities.remove(&endpoint) {
                debug!(
                    "Evicted idle entity {} (last seen {:?})",
                    endpoint, entity.last_seen
                );
                inner.evicted.push(entity);
                removed.push(entity);
            }
        }
        removed
    }

    /// Take the entities evicted since the last call.
    pub fn take_evicted(&self) -> Vec<RemoteEntity> {
        std::mem::take(&mut self.inner.lock().evicted)
    }

    /// Report queued evictions to `presenter`, then push every entity.
    ///
    /// Removals go first so an endpoint evicted and recreated since the last
    /// call ends up visible under its new handle. Entities whose handle the
    /// presenter reports stale are removed without a removal callback.
    /// Returns how many evictions were reported. The presenter is called
    /// without the registry lock held.
    pub fn present<P>(&self, presenter: &mut P) -> usize
    where
        P: RemotePresenter + ?Sized,
    {
        let evicted = self.take_evicted();
        for entity in &evicted {
            presenter.on_remote_removed(entity.endpoint, entity.handle);
        }

        for entity in self.entities() {
            let outcome = presenter.on_remote_update(entity.endpoint, entity.handle, &entity.latest);
            if outcome == PresentOutcome::StaleHandle {
                warn!(
                    "Presentation handle {:?} for {} is stale, dropping entity",
                    entity.handle, entity.endpoint
                );
                self.remove(entity.endpoint);
            }
        }
        evicted.len()
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.inner.lock().entities.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entities.is_empty()
    }
}
