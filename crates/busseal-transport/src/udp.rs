//! Emulated bus over UDP multicast.
//!
//! Every node joins the same multicast group; a datagram sent by one node
//! reaches every other node on the segment. Datagram layout:
//!
//! ```text
//! sender tag (8) | frame id (4, BE) | len (1) | data (len)
//! ```
//!
//! Multicast loopback delivers a node's own datagrams back to it, so each
//! port carries a random sender tag and drops datagrams bearing it.

use crate::transport::{
    BusFrame, BusTransport, MAX_FRAME_LEN, TransportError, TransportResult, TransportStats,
    check_frame_len,
};
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

const TAG_LEN: usize = 8;
const DATAGRAM_HEADER_LEN: usize = TAG_LEN + 4 + 1;
const MAX_DATAGRAM_LEN: usize = DATAGRAM_HEADER_LEN + MAX_FRAME_LEN;

/// UDP multicast bus configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Multicast group address
    pub group: Ipv4Addr,
    /// UDP port shared by all nodes
    pub port: u16,
    /// Local interface to join on
    pub interface: Ipv4Addr,
    /// Deliver datagrams to other sockets on this host
    pub loopback: bool,
    /// Multicast TTL
    pub ttl: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 255, 66, 83),
            port: 47_160,
            interface: Ipv4Addr::UNSPECIFIED,
            loopback: true,
            ttl: 1,
        }
    }
}

impl TransportConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidConfig` if the group is not a multicast
    /// address or the port is zero.
    pub fn validate(&self) -> TransportResult<()> {
        if !self.group.is_multicast() {
            return Err(TransportError::InvalidConfig(format!(
                "{} is not a multicast address",
                self.group
            )));
        }
        if self.port == 0 {
            return Err(TransportError::InvalidConfig("port must be non-zero".into()));
        }
        Ok(())
    }

    fn destination(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group, self.port))
    }
}

/// A node attached to the multicast bus.
#[derive(Debug)]
pub struct UdpBus {
    socket: UdpSocket,
    destination: SocketAddr,
    tag: [u8; TAG_LEN],
    closed: AtomicBool,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
    send_errors: AtomicU64,
}

impl UdpBus {
    /// Join the bus described by `config`.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidConfig` for an invalid configuration,
    /// `TransportError::BindFailed` if the socket cannot be set up, or
    /// `TransportError::Io` if the sender tag cannot be drawn.
    pub async fn join(config: &TransportConfig) -> TransportResult<Self> {
        config.validate()?;

        let socket2 = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket2
            .set_reuse_address(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port));
        socket2
            .bind(&bind_addr.into())
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket2
            .set_nonblocking(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        let std_socket: std::net::UdpSocket = socket2.into();
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .join_multicast_v4(config.group, config.interface)
            .map_err(|e| TransportError::BindFailed(format!("join {}: {e}", config.group)))?;
        socket
            .set_multicast_loop_v4(config.loopback)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .set_multicast_ttl_v4(config.ttl)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        let mut tag = [0u8; TAG_LEN];
        getrandom::getrandom(&mut tag)
            .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))?;

        debug!(group = %config.group, port = config.port, "joined multicast bus");
        Ok(Self {
            socket,
            destination: config.destination(),
            tag,
            closed: AtomicBool::new(false),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            send_errors: AtomicU64::new(0),
        })
    }

    fn encode(&self, id: u32, data: &[u8]) -> Vec<u8> {
        let mut datagram = Vec::with_capacity(DATAGRAM_HEADER_LEN + data.len());
        datagram.extend_from_slice(&self.tag);
        datagram.extend_from_slice(&id.to_be_bytes());
        #[allow(clippy::cast_possible_truncation)]
        datagram.push(data.len() as u8);
        datagram.extend_from_slice(data);
        datagram
    }

    /// Decode a datagram, returning `None` for our own or malformed ones.
    fn decode(&self, datagram: &[u8]) -> Option<BusFrame> {
        if datagram.len() < DATAGRAM_HEADER_LEN {
            return None;
        }
        let (tag, rest) = datagram.split_at(TAG_LEN);
        if tag == self.tag {
            return None;
        }
        let id = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let len = usize::from(rest[4]);
        let data = &rest[5..];
        if len > MAX_FRAME_LEN || data.len() != len {
            return None;
        }
        Some(BusFrame {
            id,
            data: data.to_vec(),
        })
    }
}

#[async_trait]
impl BusTransport for UdpBus {
    async fn send_frame(&self, id: u32, data: &[u8]) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        check_frame_len(data)?;

        let datagram = self.encode(id, data);
        match self.socket.send_to(&datagram, self.destination).await {
            Ok(_) => {
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
                trace!(id, len = data.len(), "frame sent");
                Ok(())
            }
            Err(e) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Io(e))
            }
        }
    }

    async fn recv_frame(&self) -> TransportResult<BusFrame> {
        let mut buf = [0u8; MAX_DATAGRAM_LEN + 1];
        loop {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            match self.decode(&buf[..len]) {
                Some(frame) => {
                    self.frames_received.fetch_add(1, Ordering::Relaxed);
                    return Ok(frame);
                }
                None => {
                    self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(%from, len, "datagram dropped");
                }
            }
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
        }
    }
}
