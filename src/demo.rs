//! Headless stand-ins for the game: a wandering blob and a logging presenter.

use blobsync_core::{
    Endpoint, LocalStateSource, Position, PresentOutcome, PresentationHandle, RemotePresenter,
    StateSnapshot,
};
use rand::Rng;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Arena half-extent on x and y.
pub const ARENA_HALF_EXTENT: f32 = 10.0;

const BASE_SPEED: f32 = 3.0;
const TURN_CHANCE: f64 = 0.02;

/// A blob wandering the arena; bigger blobs move slower.
pub struct DemoBlob<R> {
    position: Position,
    direction: (f32, f32),
    size: f32,
    rng: R,
}

impl<R: Rng> DemoBlob<R> {
    /// Spawn at a random point of the arena.
    pub fn new(mut rng: R) -> Self {
        let x = rng.gen_range(-ARENA_HALF_EXTENT..=ARENA_HALF_EXTENT);
        let y = rng.gen_range(-ARENA_HALF_EXTENT..=ARENA_HALF_EXTENT);
        let direction = random_direction(&mut rng);
        Self {
            position: Position::new(x, y, 0.0),
            direction,
            size: StateSnapshot::DEFAULT_SIZE,
            rng,
        }
    }

    /// Advance by `dt` seconds.
    pub fn step(&mut self, dt: f32) {
        if self.rng.gen_bool(TURN_CHANCE) {
            self.direction = random_direction(&mut self.rng);
        }

        let speed = BASE_SPEED / self.size;
        self.position.x += self.direction.0 * speed * dt;
        self.position.y += self.direction.1 * speed * dt;

        // Bounce off the arena walls.
        if self.position.x.abs() >= ARENA_HALF_EXTENT {
            self.direction.0 = -self.direction.0;
        }
        if self.position.y.abs() >= ARENA_HALF_EXTENT {
            self.direction.1 = -self.direction.1;
        }
        self.position.x = self.position.x.clamp(-ARENA_HALF_EXTENT, ARENA_HALF_EXTENT);
        self.position.y = self.position.y.clamp(-ARENA_HALF_EXTENT, ARENA_HALF_EXTENT);
    }
}

impl<R> LocalStateSource for DemoBlob<R> {
    fn local_state(&self) -> StateSnapshot {
        StateSnapshot::new(self.position, self.size)
    }
}

fn random_direction<R: Rng>(rng: &mut R) -> (f32, f32) {
    let angle = rng.gen_range(0.0..std::f32::consts::TAU);
    (angle.cos(), angle.sin())
}

/// Presenter that logs what a renderer would draw.
#[derive(Default)]
pub struct LogPresenter {
    visible: BTreeSet<PresentationHandle>,
}

impl LogPresenter {
    /// Number of blobs currently shown.
    pub fn visible(&self) -> usize {
        self.visible.len()
    }
}

impl RemotePresenter for LogPresenter {
    fn on_remote_update(
        &mut self,
        endpoint: Endpoint,
        handle: PresentationHandle,
        snapshot: &StateSnapshot,
    ) -> PresentOutcome {
        if self.visible.insert(handle) {
            info!(
                "Blob {} appeared at ({:.2}, {:.2}) size {:.2}",
                endpoint, snapshot.position.x, snapshot.position.y, snapshot.size
            );
        } else {
            debug!(
                "Blob {} at ({:.2}, {:.2}) size {:.2}",
                endpoint, snapshot.position.x, snapshot.position.y, snapshot.size
            );
        }
        PresentOutcome::Presented
    }

    fn on_remote_removed(&mut self, endpoint: Endpoint, handle: PresentationHandle) {
        self.visible.remove(&handle);
        info!("Blob {} left", endpoint);
    }
}
