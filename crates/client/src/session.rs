//! Role selection and the session lifecycle around the relay and sync loops.

use crate::client::SyncClient;
use blobsync_core::{Endpoint, LocalStateSource, RemotePresenter, SessionConfig};
use blobsync_net::EntityRegistry;
use blobsync_server::{RelayServer, TickReport};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Which loop this node runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRole {
    /// Own the registry and relay the world.
    Host,
    /// Join the host at `host` (hostname or address, optional `:port`).
    Join {
        /// Human-typed host address.
        host: String,
    },
}

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Host bound and accepting; presentation not ready yet.
    Accepting,
    /// Host relaying every tick.
    Relaying,
    /// Client resolving the host address.
    Resolving,
    /// Client connecting and handshaking.
    Connecting,
    /// Client syncing every tick.
    Syncing,
    /// Torn down.
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionPhase::Accepting => "accepting",
            SessionPhase::Relaying => "relaying",
            SessionPhase::Resolving => "resolving",
            SessionPhase::Connecting => "connecting",
            SessionPhase::Syncing => "syncing",
            SessionPhase::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Errors surfaced by [`Session`].
#[derive(Debug, Error)]
pub enum SessionError {
    /// The start was cancelled before the session was established.
    #[error("session start cancelled")]
    Cancelled,

    /// The host address could not be resolved.
    #[error("failed to resolve host '{host}': {reason}")]
    Resolve {
        /// Address as typed.
        host: String,
        /// Resolver message.
        reason: String,
    },

    /// Connect and handshake did not finish in time.
    #[error("handshake did not complete within {0:?}")]
    Timeout(Duration),

    /// Operation not allowed in the current phase.
    #[error("operation not allowed while {0}")]
    WrongPhase(SessionPhase),

    /// Transport or handshake failure.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

enum Driver {
    Host(RelayServer),
    Client(SyncClient),
    Closed,
}

/// One node's participation in a session.
pub struct Session {
    driver: Driver,
    phase: SessionPhase,
    presentation_ready: bool,
}

impl Session {
    /// Establish the session for `role`.
    pub async fn start(role: SessionRole, config: &SessionConfig) -> Result<Self, SessionError> {
        Self::start_with_cancel(role, config, CancellationToken::new()).await
    }

    /// Like [`start`](Self::start) but abandons a pending join when `cancel`
    /// fires, returning [`SessionError::Cancelled`].
    pub async fn start_with_cancel(
        role: SessionRole,
        config: &SessionConfig,
        cancel: CancellationToken,
    ) -> Result<Self, SessionError> {
        match role {
            SessionRole::Host => {
                let server = RelayServer::bind_with_cancel(config, cancel).await?;
                info!("Session phase: {}", SessionPhase::Accepting);
                Ok(Self {
                    driver: Driver::Host(server),
                    phase: SessionPhase::Accepting,
                    presentation_ready: false,
                })
            }
            SessionRole::Join { host } => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(SessionError::Cancelled),
                    joined = Self::join(&host, config) => joined,
                }
            }
        }
    }

    async fn join(host: &str, config: &SessionConfig) -> Result<Self, SessionError> {
        info!("Session phase: {}", SessionPhase::Resolving);
        let addr = resolve_host(host, config.control_port).await?;

        info!("Session phase: {}", SessionPhase::Connecting);
        let connect = SyncClient::connect(addr, config);
        let client = match config.handshake_timeout() {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| SessionError::Timeout(limit))??,
            None => connect.await?,
        };

        info!("Session phase: {}", SessionPhase::Syncing);
        Ok(Self {
            driver: Driver::Client(client),
            phase: SessionPhase::Syncing,
            presentation_ready: false,
        })
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Whether this node hosts the session.
    pub fn is_host(&self) -> bool {
        matches!(self.driver, Driver::Host(_))
    }

    /// Signal that the local presentation layer has loaded.
    ///
    /// Ticks are no-ops until this is called. Moves a host to `Relaying`.
    pub fn mark_presentation_ready(&mut self) {
        if self.presentation_ready {
            return;
        }
        self.presentation_ready = true;
        if self.phase == SessionPhase::Accepting {
            self.phase = SessionPhase::Relaying;
            info!("Session phase: {}", self.phase);
        }
    }

    /// Run one tick of whichever loop this node owns.
    pub async fn tick<L, P>(
        &mut self,
        local: &L,
        presenter: &mut P,
    ) -> Result<TickReport, SessionError>
    where
        L: LocalStateSource + ?Sized,
        P: RemotePresenter + ?Sized,
    {
        if matches!(self.driver, Driver::Closed) {
            return Err(SessionError::WrongPhase(self.phase));
        }
        if !self.presentation_ready {
            trace!("Presentation not ready, skipping tick");
            return Ok(TickReport::default());
        }
        match &mut self.driver {
            Driver::Host(server) => Ok(server.tick(local, presenter).await),
            Driver::Client(client) => Ok(client.tick(local, presenter).await),
            Driver::Closed => Err(SessionError::WrongPhase(self.phase)),
        }
    }

    /// Registry of remote participants.
    pub fn registry(&self) -> Option<&EntityRegistry> {
        match &self.driver {
            Driver::Host(server) => Some(server.registry()),
            Driver::Client(client) => Some(client.registry()),
            Driver::Closed => None,
        }
    }

    /// Endpoint identifying this node's state traffic.
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        match &self.driver {
            Driver::Host(server) => Some(server.state_endpoint()),
            Driver::Client(client) => Some(client.local_endpoint()),
            Driver::Closed => None,
        }
    }

    /// Host's control listener address, when hosting.
    pub fn control_addr(&self) -> Option<SocketAddr> {
        match &self.driver {
            Driver::Host(server) => Some(server.control_addr()),
            _ => None,
        }
    }

    /// Whether a joined client still has its control channel.
    pub fn is_connected(&self) -> bool {
        match &self.driver {
            Driver::Host(_) => true,
            Driver::Client(client) => client.is_connected(),
            Driver::Closed => false,
        }
    }

    /// Tear the session down. Idempotent.
    pub async fn shutdown(&mut self) {
        match std::mem::replace(&mut self.driver, Driver::Closed) {
            Driver::Host(server) => server.shutdown().await,
            Driver::Client(client) => client.shutdown().await,
            Driver::Closed => debug!("Session already closed"),
        }
        self.phase = SessionPhase::Closed;
    }
}

/// Resolve a human-typed host, defaulting the port to `default_port`.
///
/// The first resolved address wins.
pub async fn resolve_host(host: &str, default_port: u16) -> Result<SocketAddr, SessionError> {
    let host = host.trim();
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    let query = if host.contains(':') {
        host.to_string()
    } else {
        format!("{host}:{default_port}")
    };

    let resolve_error = |reason: String| SessionError::Resolve {
        host: host.to_string(),
        reason,
    };

    let mut addrs = tokio::net::lookup_host(query.as_str())
        .await
        .map_err(|e| resolve_error(e.to_string()))?;
    let addr = addrs
        .next()
        .ok_or_else(|| resolve_error("no addresses found".to_string()))?;
    debug!("Resolved '{}' to {}", host, addr);
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_literal_with_and_without_port() {
        assert_eq!(
            resolve_host("127.0.0.1:7000", 44446).await.unwrap(),
            "127.0.0.1:7000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve_host(" 127.0.0.1 ", 44446).await.unwrap(),
            "127.0.0.1:44446".parse::<SocketAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_resolve_bare_ipv6_gets_default_port() {
        assert_eq!(
            resolve_host("::1", 44446).await.unwrap(),
            "[::1]:44446".parse::<SocketAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addr = resolve_host("localhost", 44446).await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 44446);
    }

    #[tokio::test]
    async fn test_resolve_failure_is_reported() {
        let err = resolve_host("no such host.invalid", 44446).await.unwrap_err();
        assert!(matches!(err, SessionError::Resolve { .. }));
    }

    #[tokio::test]
    async fn test_host_moves_to_relaying_when_ready() {
        let mut session = Session::start(SessionRole::Host, &SessionConfig::loopback())
            .await
            .unwrap();
        assert_eq!(session.phase(), SessionPhase::Accepting);
        assert!(session.is_host());

        session.mark_presentation_ready();
        assert_eq!(session.phase(), SessionPhase::Relaying);

        session.shutdown().await;
        assert_eq!(session.phase(), SessionPhase::Closed);
        session.shutdown().await;
        assert!(session.registry().is_none());
    }
}
