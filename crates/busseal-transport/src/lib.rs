//! # BusSeal Transport
//!
//! Bus transports for the BusSeal protocol.
//!
//! This crate provides:
//! - The `BusTransport` trait over broadcast buses with 64-byte frames
//! - An in-process bus for tests and demos
//! - A UDP multicast bus emulating a shared segment between processes

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod transport;
pub mod udp;

pub use memory::{MemoryBus, MemoryPort};
pub use transport::{
    BusFrame, BusTransport, MAX_FRAME_LEN, TransportError, TransportResult, TransportStats,
};
pub use udp::{TransportConfig, UdpBus};
