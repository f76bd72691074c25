//! Transport trait abstraction for bus backends.
//!
//! A bus carries small frames, each tagged with an identifier, to every
//! attached node. The protocol core never touches a transport; callers move
//! the packed frames between the two.

use async_trait::async_trait;
use std::io;

/// Largest frame a bus carries (CAN FD data field).
pub const MAX_FRAME_LEN: usize = 64;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding or multicast join failed
    #[error("Failed to bind: {0}")]
    BindFailed(String),

    /// Frame exceeds the bus frame size
    #[error("Frame too large: {len} bytes, at most {max}")]
    FrameTooLarge {
        /// Frame length
        len: usize,
        /// Bus frame size
        max: usize,
    },

    /// Receiver fell behind and frames were dropped
    #[error("Receiver lagged, {0} frames dropped")]
    Lagged(u64),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// One frame as seen on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusFrame {
    /// Frame identifier (CAN arbitration id)
    pub id: u32,
    /// Frame data, at most [`MAX_FRAME_LEN`] bytes
    pub data: Vec<u8>,
}

/// Async broadcast bus.
///
/// Every frame sent by one attached port is delivered to all other ports.
/// A port never receives its own frames.
///
/// # Examples
///
/// ```
/// use busseal_transport::{BusTransport, MemoryBus};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = MemoryBus::new(16);
/// let a = bus.port();
/// let b = bus.port();
///
/// a.send_frame(0x100, b"hello").await?;
/// let frame = b.recv_frame().await?;
/// assert_eq!(frame.data, b"hello");
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Broadcast a frame.
    ///
    /// # Errors
    /// Returns `TransportError::FrameTooLarge` for frames longer than
    /// [`MAX_FRAME_LEN`], `TransportError::Closed` after `close`, or the
    /// backend's I/O error.
    async fn send_frame(&self, id: u32, data: &[u8]) -> TransportResult<()>;

    /// Wait for the next frame from another port.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` once the transport is closed, or the
    /// backend's error.
    async fn recv_frame(&self) -> TransportResult<BusFrame>;

    /// Close the transport. Pending and later operations fail with
    /// `TransportError::Closed`.
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn close(&self) -> TransportResult<()>;

    /// Check if the transport is closed.
    fn is_closed(&self) -> bool;

    /// Get transport statistics.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Reject frames the bus cannot carry.
pub(crate) fn check_frame_len(data: &[u8]) -> TransportResult<()> {
    if data.len() > MAX_FRAME_LEN {
        return Err(TransportError::FrameTooLarge {
            len: data.len(),
            max: MAX_FRAME_LEN,
        });
    }
    Ok(())
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Frames sent
    pub frames_sent: u64,
    /// Frames received
    pub frames_received: u64,
    /// Foreign or undecodable datagrams dropped
    pub frames_dropped: u64,
    /// Send errors
    pub send_errors: u64,
}
