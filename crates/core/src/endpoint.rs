//! Participant identity on the wire.
//!
//! A participant is identified by the transport address its state datagrams
//! originate from. There is no separate player id: the endpoint is the key of
//! every registry and peer table in the workspace.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Network address + port of one participant's state channel.
///
/// Serializes as the `"ip:port"` string in human-readable formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(pub SocketAddr);

impl Endpoint {
    /// Build an endpoint from an address and port.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self(SocketAddr::new(ip, port))
    }

    /// Underlying socket address.
    pub fn addr(&self) -> SocketAddr {
        self.0
    }

    /// IP part of the endpoint.
    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    /// Port part of the endpoint.
    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// Whether a datagram from `self` is really the local socket `local`
    /// talking to itself.
    ///
    /// A socket bound to the unspecified address sees its own traffic as
    /// coming from a loopback address, so both spellings are treated as self.
    pub fn is_loopback_of(&self, local: Endpoint) -> bool {
        if self.port() != local.port() {
            return false;
        }
        if local.ip().is_unspecified() {
            self.ip().is_loopback() || self.ip().is_unspecified()
        } else {
            self.ip() == local.ip()
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ep(s: &str) -> Endpoint {
        Endpoint(s.parse().unwrap())
    }

    #[test]
    fn serializes_as_address_string() {
        let json = serde_json::to_string(&ep("10.0.0.7:50000")).unwrap();
        assert_eq!(json, "\"10.0.0.7:50000\"");
        let back: Endpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ep("10.0.0.7:50000"));
    }

    #[test]
    fn loopback_detection_for_unspecified_bind() {
        let local = Endpoint::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 50000);
        assert!(ep("127.0.0.1:50000").is_loopback_of(local));
        assert!(!ep("127.0.0.1:50001").is_loopback_of(local));
        assert!(!ep("192.168.1.4:50000").is_loopback_of(local));
    }

    #[test]
    fn loopback_detection_for_specific_bind() {
        let local = ep("192.168.1.4:50000");
        assert!(ep("192.168.1.4:50000").is_loopback_of(local));
        assert!(!ep("127.0.0.1:50000").is_loopback_of(local));
    }
}
