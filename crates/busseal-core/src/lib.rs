//! # BusSeal Core
//!
//! Core protocol implementation for BusSeal: secure group sessions over a
//! broadcast bus whose frames carry at most 64 bytes.
//!
//! This crate provides:
//! - Group provisioning records and the read-only key store
//! - Frame encoding and decoding with bounds-checked header fields
//! - Strictly monotonic replay protection
//! - The per-group handshake state machine and secured-data framing
//! - Error types and handling
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       SessionManager                             │
//! │   (routes frames by group, one ClientContext per group)         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                       ClientContext                              │
//! │   (handshake state, session keys, per-sender replay guards)     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │          FrameCodec            │          AeadCodec             │
//! │   (header | body | tag)        │   (XChaCha20-Poly1305)         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The core never blocks and performs no I/O. Frames come in and go out as
//! byte slices; moving them over a bus is the caller's job.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod frame;
pub mod keystore;
pub mod replay;
pub mod session_manager;

pub use clock::{Clock, SystemClock};
pub use config::SessionConfig;
pub use context::{ClientContext, HandshakeState, Role};
pub use error::{Error, Result};
pub use frame::{FrameCodec, Header, HeaderType, MessageType, Payload, Pdu, SessionId};
pub use keystore::{Group, GroupConfig, GroupId, KeyStore, NodeId};
pub use replay::ReplayGuard;
pub use session_manager::{Received, RxMessage, SessionManager};

/// Frame capacity of the bus (CAN FD data field).
pub const FRAME_CAPACITY: usize = 64;

/// Wire size of the secured-data counter.
pub const COUNTER_SIZE: usize = 4;

/// AEAD authentication tag size
pub const AUTH_TAG_SIZE: usize = busseal_crypto::TAG_SIZE;

/// Size of each handshake random contribution
pub const HANDSHAKE_RANDOM_SIZE: usize = busseal_crypto::HANDSHAKE_RANDOM_SIZE;
