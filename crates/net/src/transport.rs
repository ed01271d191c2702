//! TCP control channel and UDP state channel.
//!
//! Every session owns one of each: a reliable, ordered TCP stream for the
//! handshake and membership notices, and a connectionless UDP socket for the
//! per-tick state traffic.

use crate::codec::{decode_control_body, encode_control};
use crate::protocol::{ControlMessage, MAX_CONTROL_FRAME_LEN, MAX_DATAGRAM_LEN};
use anyhow::{Context, Result};
use blobsync_core::Endpoint;
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info, trace, warn};

/// Listening half of the host's control channel.
pub struct ControlListener {
    listener: TcpListener,
    addr: SocketAddr,
}

impl ControlListener {
    /// Bind the control listener.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind control listener on {addr}"))?;
        let addr = listener.local_addr()?;
        info!("Control listener bound to {}", addr);
        Ok(Self { listener, addr })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accept the next control connection.
    pub async fn accept(&self) -> Result<ControlConnection> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .context("Failed to accept control connection")?;
        debug!("Accepted control connection from {}", peer);
        ControlConnection::from_stream(stream)
    }
}

/// One established control connection.
pub struct ControlConnection {
    reader: ControlReader,
    writer: ControlWriter,
}

impl ControlConnection {
    /// Connect to a host's control listener.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        info!("Connecting control channel to {}", addr);
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect control channel to {addr}"))?;
        Self::from_stream(stream)
    }

    fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: ControlReader { half: read, peer },
            writer: ControlWriter {
                half: write,
                peer,
                local,
            },
        })
    }

    /// Remote address of the connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.reader.peer
    }

    /// Local address of the connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.writer.local
    }

    /// Send one control message.
    pub async fn send(&mut self, msg: &ControlMessage) -> Result<()> {
        self.writer.send(msg).await
    }

    /// Receive the next control message; `None` once the peer closed.
    pub async fn recv(&mut self) -> Result<Option<ControlMessage>> {
        self.reader.recv().await
    }

    /// Split into independently owned halves.
    pub fn into_split(self) -> (ControlReader, ControlWriter) {
        (self.reader, self.writer)
    }
}

/// Read half of a control connection.
pub struct ControlReader {
    half: OwnedReadHalf,
    peer: SocketAddr,
}

impl ControlReader {
    /// Remote address of the connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Receive the next control message.
    ///
    /// Returns `Ok(None)` when the peer closed the stream.
    pub async fn recv(&mut self) -> Result<Option<ControlMessage>> {
        let length = match self.half.read_u32_le().await {
            Ok(length) => length as usize,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!("Control channel to {} closed", self.peer);
                return Ok(None);
            }
            Err(e) => return Err(e).context("Failed to read length prefix"),
        };

        anyhow::ensure!(
            (1..=MAX_CONTROL_FRAME_LEN).contains(&length),
            "Invalid control frame length {} from {}",
            length,
            self.peer
        );

        let mut body = vec![0u8; length];
        self.half
            .read_exact(&mut body)
            .await
            .context("Failed to read control frame")?;

        let msg = decode_control_body(&body)
            .with_context(|| format!("Failed to decode control frame from {}", self.peer))?;
        if let Err(reason) = msg.verify() {
            anyhow::bail!("Control message from {} failed verification: {}", self.peer, reason);
        }

        trace!("Received {} ({} bytes) from {}", msg.kind(), length, self.peer);
        Ok(Some(msg))
    }
}

/// Write half of a control connection.
pub struct ControlWriter {
    half: OwnedWriteHalf,
    peer: SocketAddr,
    local: SocketAddr,
}

impl ControlWriter {
    /// Remote address of the connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Send one control message.
    pub async fn send(&mut self, msg: &ControlMessage) -> Result<()> {
        let frame = encode_control(msg)?;
        self.half
            .write_all(&frame)
            .await
            .with_context(|| format!("Failed to send {} to {}", msg.kind(), self.peer))?;
        trace!("Sent {} ({} bytes) to {}", msg.kind(), frame.len(), self.peer);
        Ok(())
    }

    /// Flush and close the write direction.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.half
            .shutdown()
            .await
            .context("Failed to shut down control channel")
    }
}

/// One datagram read from the state channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Sender of the datagram.
    pub from: Endpoint,
    /// Raw payload.
    pub payload: Vec<u8>,
}

/// Result of one bounded drain of the state channel.
#[derive(Debug, Default)]
pub struct Drained {
    /// Datagrams read, in arrival order.
    pub datagrams: Vec<Datagram>,
    /// Receive errors logged and skipped.
    pub faults: usize,
}

/// Connectionless state channel.
pub struct StateChannel {
    socket: UdpSocket,
    local: Endpoint,
}

impl StateChannel {
    /// Bind the state socket.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("Failed to bind state channel on {addr}"))?;
        let local = Endpoint::from(socket.local_addr()?);
        info!("State channel bound to {}", local);
        Ok(Self { socket, local })
    }

    /// Local endpoint of the socket.
    pub fn local_endpoint(&self) -> Endpoint {
        self.local
    }

    /// Send one datagram.
    pub async fn send(&self, to: Endpoint, data: &[u8]) -> Result<()> {
        let sent = self
            .socket
            .send_to(data, to.addr())
            .await
            .with_context(|| format!("Failed to send datagram to {to}"))?;
        anyhow::ensure!(
            sent == data.len(),
            "Short datagram send to {}: {} of {} bytes",
            to,
            sent,
            data.len()
        );
        trace!("Sent {} bytes to {}", data.len(), to);
        Ok(())
    }

    /// Receive one datagram if one is pending, without waiting.
    pub fn try_recv(&self, buf: &mut [u8]) -> Result<Option<(Endpoint, usize)>> {
        match self.socket.try_recv_from(buf) {
            Ok((len, from)) => {
                trace!("Received {} bytes from {}", len, from);
                Ok(Some((Endpoint::from(from), len)))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e).context("Failed to receive datagram"),
        }
    }

    /// Read every datagram available right now, up to `limit` attempts.
    ///
    /// Never waits. Receive errors (for example ICMP port-unreachable echoes
    /// surfacing on some platforms) are logged, counted and skipped.
    pub fn drain(&self, limit: usize) -> Drained {
        let mut drained = Drained::default();
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

        for _ in 0..limit {
            match self.try_recv(&mut buf) {
                Ok(Some((from, len))) => drained.datagrams.push(Datagram {
                    from,
                    payload: buf[..len].to_vec(),
                }),
                Ok(None) => break,
                Err(e) => {
                    warn!("State channel receive failed: {:#}", e);
                    drained.faults += 1;
                }
            }
        }

        drained
    }
}

/// A control link paired with a state channel.
pub struct TransportPair<C> {
    /// Reliable control side.
    pub control: C,
    /// Unreliable state side.
    pub state: StateChannel,
}

/// Host side: listening control channel plus the well-known state socket.
pub type HostTransport = TransportPair<ControlListener>;

/// Client side: connected control channel plus an ephemeral state socket.
pub type ClientTransport = TransportPair<ControlConnection>;

impl HostTransport {
    /// Open both host channels.
    pub async fn open(control_addr: SocketAddr, state_addr: SocketAddr) -> Result<Self> {
        let state = StateChannel::bind(state_addr).await?;
        let control = ControlListener::bind(control_addr).await?;
        Ok(Self { control, state })
    }
}

impl ClientTransport {
    /// Bind an ephemeral state socket and connect the control channel.
    ///
    /// The state socket binds the same address family and interface the
    /// control connection uses, so the host sees both from one IP.
    pub async fn connect(host_control: SocketAddr) -> Result<Self> {
        let control = ControlConnection::connect(host_control).await?;
        let state_bind = SocketAddr::new(control.local_addr().ip(), 0);
        let state = StateChannel::bind(state_bind).await?;
        Ok(Self { control, state })
    }
}
