//! Session configuration shared by both roles.
//!
//! Ports are a deployment parameter: host and clients must agree on them out
//! of band, usually by shipping the same config file.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default TCP port of the control channel.
pub const DEFAULT_CONTROL_PORT: u16 = 44446;

/// Default UDP port of the state channel.
pub const DEFAULT_STATE_PORT: u16 = 50000;

/// Tunables for one session.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Address the host binds both channels to.
    pub bind_address: IpAddr,
    /// Control channel port (TCP).
    pub control_port: u16,
    /// State channel port (UDP) on the host. Clients bind an ephemeral port.
    pub state_port: u16,
    /// Fixed tick interval of the driving loop.
    pub tick_interval_ms: u64,
    /// Whether the host echoes its own snapshot in the world broadcast.
    pub include_self_in_broadcast: bool,
    /// Evict remote entities not heard from for this many ticks.
    pub idle_timeout_ticks: Option<u64>,
    /// Upper bound on datagrams processed per tick.
    pub max_datagrams_per_tick: usize,
    /// Bound on connect + handshake when joining. `None` waits forever.
    pub handshake_timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            control_port: DEFAULT_CONTROL_PORT,
            state_port: DEFAULT_STATE_PORT,
            tick_interval_ms: 20,
            include_self_in_broadcast: false,
            idle_timeout_ticks: Some(250),
            max_datagrams_per_tick: 1024,
            handshake_timeout_ms: Some(10_000),
        }
    }
}

impl SessionConfig {
    /// Loopback configuration on ephemeral ports, for tests and local demos.
    pub fn loopback() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            control_port: 0,
            state_port: 0,
            ..Self::default()
        }
    }

    /// Address of the host's control listener.
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.control_port)
    }

    /// Address of the host's state socket.
    pub fn state_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.state_port)
    }

    /// Tick interval as a duration.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    /// Handshake bound as a duration.
    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }
}
