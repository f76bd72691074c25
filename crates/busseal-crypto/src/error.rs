//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Key or nonce handed to the codec has the wrong length
    #[error("invalid key or nonce length: key {key_len} bytes, nonce {nonce_len} bytes")]
    InvalidKeyOrNonce {
        /// Length of the supplied key
        key_len: usize,
        /// Length of the supplied nonce
        nonce_len: usize,
    },

    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// Authentication tag did not verify
    #[error("invalid authentication tag")]
    InvalidTag,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Random source kept producing zero where a non-zero value is required
    #[error("no non-zero random value after {attempts} attempts")]
    NonZeroRandomFailed {
        /// Number of draws made
        attempts: usize,
    },
}
