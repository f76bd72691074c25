//! # BusSeal Crypto
//!
//! Cryptographic primitives for the BusSeal protocol.
//!
//! This crate provides:
//! - An `XChaCha20-Poly1305` codec with detached tags for small bus frames
//! - A BLAKE3-based HKDF and the session key schedule
//! - Pluggable randomness sources (OS CSPRNG or any `rand_core` RNG)
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | Tag | Poly1305 | 128-bit |
//! | KDF | HKDF-BLAKE3 | 128-bit |
//!
//! One primitive is used for every message of every session. Handshake
//! messages are authenticated under the group's long-term key, secured data
//! under the derived session key; both go through the same [`AeadCodec`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod error;
pub mod kdf;
pub mod random;

pub use aead::{AeadCodec, AeadKey, KEY_SIZE, NONCE_SIZE, Nonce, TAG_SIZE, Tag};
pub use error::CryptoError;
pub use kdf::{SALT_SIZE, SessionMaterial};
pub use random::{OsRandom, RandomSource, RngSource};

/// Size of each party's random contribution to a handshake.
pub const HANDSHAKE_RANDOM_SIZE: usize = 16;
