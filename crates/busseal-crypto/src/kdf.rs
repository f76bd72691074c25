//! BLAKE3 key derivation and the session key schedule.
//!
//! HKDF-style extract/expand built on keyed BLAKE3. The session schedule
//! turns a group's long-term key and both handshake random contributions
//! into a session key plus the nonce salt used for secured data.
//!
//! ```text
//! prk = Extract(salt = R_init || R_resp, ikm = LTK)
//! okm = Expand(prk, "busseal-session-v1" || context, 44)
//! session_key = okm[0..32]
//! nonce_salt  = okm[32..44]
//! ```

use crate::HANDSHAKE_RANDOM_SIZE;
use crate::aead::{AeadKey, KEY_SIZE};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the per-session nonce salt.
pub const SALT_SIZE: usize = 12;

const SESSION_LABEL: &[u8] = b"busseal-session-v1";

/// HKDF-Extract over keyed BLAKE3.
///
/// The salt is hashed into a BLAKE3 key; an empty salt degrades to a plain
/// hash of the input key material.
#[must_use]
pub fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> [u8; 32] {
    if salt.is_empty() {
        return *blake3::hash(ikm).as_bytes();
    }
    let salt_key = blake3::hash(salt);
    let mut hasher = blake3::Hasher::new_keyed(salt_key.as_bytes());
    hasher.update(ikm);
    *hasher.finalize().as_bytes()
}

/// HKDF-Expand: fill `output` from the BLAKE3 XOF keyed with `prk`.
pub fn hkdf_expand(prk: &[u8; 32], info: &[u8], output: &mut [u8]) {
    let mut hasher = blake3::Hasher::new_keyed(prk);
    hasher.update(info);
    hasher.finalize_xof().fill(output);
}

/// Output of the session key schedule.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionMaterial {
    key: AeadKey,
    nonce_salt: [u8; SALT_SIZE],
}

impl SessionMaterial {
    /// Derive session material from the long-term key and handshake randoms.
    ///
    /// `context` binds the derivation to the wire identity of the session
    /// (group and session identifiers). Swapping the two random values
    /// yields unrelated material, so both sides must agree on roles.
    #[must_use]
    pub fn derive(
        long_term_key: &AeadKey,
        initiator_random: &[u8; HANDSHAKE_RANDOM_SIZE],
        responder_random: &[u8; HANDSHAKE_RANDOM_SIZE],
        context: &[u8],
    ) -> Self {
        let mut salt = [0u8; 2 * HANDSHAKE_RANDOM_SIZE];
        salt[..HANDSHAKE_RANDOM_SIZE].copy_from_slice(initiator_random);
        salt[HANDSHAKE_RANDOM_SIZE..].copy_from_slice(responder_random);

        let mut prk = hkdf_extract(&salt, long_term_key.as_bytes());

        let mut info = Vec::with_capacity(SESSION_LABEL.len() + context.len());
        info.extend_from_slice(SESSION_LABEL);
        info.extend_from_slice(context);

        let mut okm = [0u8; KEY_SIZE + SALT_SIZE];
        hkdf_expand(&prk, &info, &mut okm);

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&okm[..KEY_SIZE]);
        let mut nonce_salt = [0u8; SALT_SIZE];
        nonce_salt.copy_from_slice(&okm[KEY_SIZE..]);

        prk.zeroize();
        okm.zeroize();

        Self {
            key: AeadKey::new(key),
            nonce_salt,
        }
    }

    /// Session key for secured data.
    #[must_use]
    pub fn key(&self) -> &AeadKey {
        &self.key
    }

    /// Salt filling the tail of every secured-data nonce.
    #[must_use]
    pub fn nonce_salt(&self) -> &[u8; SALT_SIZE] {
        &self.nonce_salt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_deterministic() {
        assert_eq!(hkdf_extract(b"salt", b"ikm"), hkdf_extract(b"salt", b"ikm"));
        assert_ne!(hkdf_extract(b"salt", b"ikm"), hkdf_extract(b"salz", b"ikm"));
        assert_eq!(hkdf_extract(b"", b"ikm"), *blake3::hash(b"ikm").as_bytes());
    }

    #[test]
    fn test_expand_prefix_stable() {
        let prk = [9u8; 32];
        let mut short = [0u8; 16];
        let mut long = [0u8; 48];
        hkdf_expand(&prk, b"info", &mut short);
        hkdf_expand(&prk, b"info", &mut long);
        assert_eq!(short, long[..16]);
    }

    #[test]
    fn test_session_material_agrees() {
        let ltk = AeadKey::new([1; KEY_SIZE]);
        let a = SessionMaterial::derive(&ltk, &[2; 16], &[3; 16], b"\x00\x01\x07");
        let b = SessionMaterial::derive(&ltk, &[2; 16], &[3; 16], b"\x00\x01\x07");
        assert_eq!(a.key().as_bytes(), b.key().as_bytes());
        assert_eq!(a.nonce_salt(), b.nonce_salt());
        assert_ne!(a.key().as_bytes(), ltk.as_bytes());
    }

    #[test]
    fn test_session_material_binds_inputs() {
        let ltk = AeadKey::new([1; KEY_SIZE]);
        let base = SessionMaterial::derive(&ltk, &[2; 16], &[3; 16], b"ctx");

        let swapped = SessionMaterial::derive(&ltk, &[3; 16], &[2; 16], b"ctx");
        assert_ne!(base.key().as_bytes(), swapped.key().as_bytes());

        let other_ctx = SessionMaterial::derive(&ltk, &[2; 16], &[3; 16], b"ctx2");
        assert_ne!(base.key().as_bytes(), other_ctx.key().as_bytes());

        let other_ltk = SessionMaterial::derive(&AeadKey::new([9; KEY_SIZE]), &[2; 16], &[3; 16], b"ctx");
        assert_ne!(base.key().as_bytes(), other_ltk.key().as_bytes());
    }
}
