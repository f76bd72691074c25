//! Error types for the BusSeal core protocol.
//!
//! Every failure is a distinct variant returned to the caller of exactly
//! one operation. Nothing is swallowed or only logged.

use crate::context::HandshakeState;
use crate::frame::SessionId;
use crate::keystore::GroupId;
use busseal_crypto::CryptoError;
use thiserror::Error;

/// Result type for core protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core protocol errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Secured data requested or received before the handshake completed
    #[error("session not established")]
    SessionNotEstablished,

    /// Received frame is empty
    #[error("empty frame")]
    NullPdu,

    /// Plaintext to secure is empty
    #[error("empty payload")]
    NullPayload,

    /// Plaintext exceeds what one frame can carry after overhead
    #[error("payload too long: {len} bytes, at most {max}")]
    PayloadTooLong {
        /// Plaintext length
        len: usize,
        /// Maximum plaintext length for the configured header
        max: usize,
    },

    /// Serialized PDU exceeds the frame capacity
    #[error("payload too large: {len} bytes, frame capacity {capacity}")]
    PayloadTooLarge {
        /// Serialized length
        len: usize,
        /// Frame capacity
        capacity: usize,
    },

    /// Group identifier does not fit the configured header layout
    #[error("group {0} does not fit the configured header type")]
    GroupIdTooLargeForHeader(GroupId),

    /// Node holds no context for the group
    #[error("unknown group {0}")]
    UnknownGroup(GroupId),

    /// Random source failed
    #[error("cannot generate random")]
    CannotGenerateRandom,

    /// Random source produced only zeros where a non-zero value is required
    #[error("cannot generate non-zero random")]
    CannotGenerateNonZeroRandom,

    /// Clock could not be read
    #[error("cannot get current time")]
    CannotGetCurrentTime,

    /// Authentication tag did not verify
    #[error("invalid authentication tag")]
    InvalidTag,

    /// Counter not newer than the last accepted one
    #[error("replayed or stale counter {counter} (last accepted {last_accepted})")]
    ReplayedOrStale {
        /// Received counter
        counter: u32,
        /// Highest counter accepted so far
        last_accepted: u32,
    },

    /// Frame could not be decoded
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// Provisioning record rejected
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Key or nonce length mismatch at the codec
    #[error("invalid key or nonce length")]
    InvalidKeyOrNonce,

    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// Operation or handshake message not valid in the current state
    #[error("operation not valid in state {0:?}")]
    InvalidState(HandshakeState),

    /// Frame belongs to a different session of the group
    #[error("session mismatch: expected {expected}, got {actual}")]
    SessionMismatch {
        /// Current session identifier
        expected: SessionId,
        /// Session identifier in the frame
        actual: SessionId,
    },

    /// Response arrived after the configured handshake timeout
    #[error("handshake response expired")]
    HandshakeExpired,

    /// Send counter reached its limit; a new handshake is required
    #[error("send counter exhausted, new handshake required")]
    CounterExhausted,

    /// Our own pending request came back over the bus
    #[error("own handshake request received back")]
    EchoedRequest,
}

impl Error {
    /// Integrity failures: the frame was dropped with no effect on state.
    #[must_use]
    pub fn is_security_warning(&self) -> bool {
        matches!(
            self,
            Self::InvalidTag
                | Self::ReplayedOrStale { .. }
                | Self::SessionMismatch { .. }
                | Self::HandshakeExpired
        )
    }

    /// Failures the caller may retry with the same inputs.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CannotGenerateRandom | Self::CannotGenerateNonZeroRandom | Self::CannotGetCurrentTime
        )
    }

    /// Failures that end the group's session; retrying the same inputs
    /// cannot succeed.
    #[must_use]
    pub fn is_fatal_for_group(&self) -> bool {
        matches!(
            self,
            Self::UnknownGroup(_) | Self::InvalidConfig(_) | Self::GroupIdTooLargeForHeader(_)
        )
    }
}

impl From<CryptoError> for Error {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidKeyOrNonce { .. } => Self::InvalidKeyOrNonce,
            CryptoError::EncryptionFailed => Self::EncryptionFailed,
            CryptoError::InvalidTag => Self::InvalidTag,
            CryptoError::RandomFailed => Self::CannotGenerateRandom,
            CryptoError::NonZeroRandomFailed { .. } => Self::CannotGenerateNonZeroRandom,
        }
    }
}
