//! `XChaCha20-Poly1305` codec with detached tags.
//!
//! Bus frames carry the ciphertext and the tag as separate fields, so the
//! codec never appends the tag to the ciphertext the way the combined AEAD
//! API does. Features:
//! - 256-bit keys
//! - 192-bit nonces, built by the caller from counter, group and session
//! - 128-bit authentication tags
//! - Associated data authentication (the packed frame header)
//!
//! ## Security Properties
//!
//! - Ciphertext length equals plaintext length (stream construction)
//! - The tag is verified in constant time before the keystream is applied;
//!   a failed verification never yields plaintext
//! - Every codec owns its cipher state; nothing is shared between sessions
//!
//! ## Usage
//!
//! ```ignore
//! use busseal_crypto::aead::{AeadCodec, AeadKey, Nonce};
//!
//! let codec = AeadCodec::new(&key, &nonce);
//! let (ciphertext, tag) = codec.encrypt(b"header", b"LOCK")?;
//! let plaintext = codec.decrypt(b"header", &ciphertext, &tag)?;
//! ```

use crate::CryptoError;
use crate::random::{RandomSource, random_array};
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{AeadInPlace, KeyInit},
};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Authentication tag size (16 bytes / 128 bits).
pub const TAG_SIZE: usize = 16;

/// XChaCha20-Poly1305 nonce size (24 bytes / 192 bits).
pub const NONCE_SIZE: usize = 24;

/// AEAD key size (32 bytes / 256 bits).
pub const KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce (24 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a nonce from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create a nonce from a slice.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; NONCE_SIZE] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    fn as_generic(&self) -> &XNonce {
        XNonce::from_slice(&self.0)
    }
}

/// Authentication tag (16 bytes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tag([u8; TAG_SIZE]);

impl Tag {
    /// Create a tag from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; TAG_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from slice.
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; TAG_SIZE] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Get raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; TAG_SIZE] {
        &self.0
    }
}

/// AEAD key (32 bytes), used for long-term and session keys alike.
///
/// Key is zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyOrNonce` if slice length is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_SIZE] =
            slice
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyOrNonce {
                    key_len: slice.len(),
                    nonce_len: NONCE_SIZE,
                })?;
        Ok(Self(bytes))
    }

    /// Generate a random key.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::RandomFailed` if the source cannot produce bytes.
    pub fn generate<S: RandomSource + ?Sized>(source: &S) -> Result<Self, CryptoError> {
        random_array(source).map(Self)
    }

    /// Get raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with extreme care - this exposes the raw key material.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AeadKey([REDACTED])")
    }
}

/// Cipher state bound to one key and one nonce.
///
/// A codec is built per message; the owner (a session) keeps the key and
/// derives a fresh nonce for every codec it creates.
pub struct AeadCodec {
    cipher: XChaCha20Poly1305,
    nonce: Nonce,
}

impl AeadCodec {
    /// Bind raw key and nonce bytes to a codec.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyOrNonce` if the key is not 32 bytes or
    /// the nonce is not 24 bytes.
    pub fn init(key: &[u8], nonce: &[u8]) -> Result<Self, CryptoError> {
        let invalid = || CryptoError::InvalidKeyOrNonce {
            key_len: key.len(),
            nonce_len: nonce.len(),
        };
        let key = AeadKey::from_slice(key).map_err(|_| invalid())?;
        let nonce = Nonce::from_slice(nonce).ok_or_else(invalid)?;
        Ok(Self::new(&key, &nonce))
    }

    /// Bind an already validated key and nonce.
    #[must_use]
    pub fn new(key: &AeadKey, nonce: &Nonce) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.as_bytes().into()),
            nonce: *nonce,
        }
    }

    /// The nonce this codec is bound to.
    #[must_use]
    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    /// Encrypt plaintext, returning ciphertext of equal length and the tag.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if the cipher rejects the input.
    pub fn encrypt(&self, aad: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, Tag), CryptoError> {
        let mut buffer = plaintext.to_vec();
        let tag = self
            .cipher
            .encrypt_in_place_detached(self.nonce.as_generic(), aad, &mut buffer)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut tag_bytes = [0u8; TAG_SIZE];
        tag_bytes.copy_from_slice(&tag);
        Ok((buffer, Tag(tag_bytes)))
    }

    /// Verify the tag, then decrypt.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidTag` if the tag does not authenticate the
    /// ciphertext and associated data. No plaintext is returned in that case.
    pub fn decrypt(&self, aad: &[u8], ciphertext: &[u8], tag: &Tag) -> Result<Vec<u8>, CryptoError> {
        let mut buffer = ciphertext.to_vec();
        match self.cipher.decrypt_in_place_detached(
            self.nonce.as_generic(),
            aad,
            &mut buffer,
            chacha20poly1305::Tag::from_slice(&tag.0),
        ) {
            Ok(()) => Ok(buffer),
            Err(_) => {
                buffer.zeroize();
                Err(CryptoError::InvalidTag)
            }
        }
    }

    /// Compute a tag over associated data only (empty plaintext).
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if the cipher rejects the input.
    pub fn authenticate(&self, aad: &[u8]) -> Result<Tag, CryptoError> {
        self.encrypt(aad, &[]).map(|(_, tag)| tag)
    }

    /// Verify a tag produced by [`AeadCodec::authenticate`].
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidTag` on mismatch.
    pub fn verify(&self, aad: &[u8], tag: &Tag) -> Result<(), CryptoError> {
        self.decrypt(aad, &[], tag).map(|_| ())
    }
}
