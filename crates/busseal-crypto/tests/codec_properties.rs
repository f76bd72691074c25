//! Property tests for the AEAD codec.
//!
//! Every bit of ciphertext and tag is covered by the authenticator, and
//! every plaintext that fits a bus frame survives the round trip.

use busseal_crypto::aead::{AeadCodec, AeadKey, KEY_SIZE, NONCE_SIZE, Nonce, TAG_SIZE, Tag};
use busseal_crypto::{CryptoError, SessionMaterial};
use proptest::prelude::*;

fn codec(key: [u8; KEY_SIZE], nonce: [u8; NONCE_SIZE]) -> AeadCodec {
    AeadCodec::new(&AeadKey::new(key), &Nonce::from_bytes(nonce))
}

proptest! {
    #[test]
    fn roundtrip(
        key in any::<[u8; KEY_SIZE]>(),
        nonce in any::<[u8; NONCE_SIZE]>(),
        aad in prop::collection::vec(any::<u8>(), 0..8),
        plaintext in prop::collection::vec(any::<u8>(), 1..40),
    ) {
        let codec = codec(key, nonce);
        let (ciphertext, tag) = codec.encrypt(&aad, &plaintext).unwrap();
        prop_assert_eq!(ciphertext.len(), plaintext.len());
        prop_assert_eq!(codec.decrypt(&aad, &ciphertext, &tag).unwrap(), plaintext);
    }

    #[test]
    fn any_ciphertext_bit_flip_is_detected(
        plaintext in prop::collection::vec(any::<u8>(), 1..40),
        bit in any::<prop::sample::Index>(),
    ) {
        let codec = codec([0x11; KEY_SIZE], [0x22; NONCE_SIZE]);
        let (mut ciphertext, tag) = codec.encrypt(b"hdr", &plaintext).unwrap();
        let bit = bit.index(ciphertext.len() * 8);
        ciphertext[bit / 8] ^= 1 << (bit % 8);
        prop_assert_eq!(codec.decrypt(b"hdr", &ciphertext, &tag), Err(CryptoError::InvalidTag));
    }

    #[test]
    fn any_tag_bit_flip_is_detected(
        plaintext in prop::collection::vec(any::<u8>(), 1..40),
        bit in 0usize..TAG_SIZE * 8,
    ) {
        let codec = codec([0x33; KEY_SIZE], [0x44; NONCE_SIZE]);
        let (ciphertext, tag) = codec.encrypt(b"hdr", &plaintext).unwrap();
        let mut bytes = *tag.as_bytes();
        bytes[bit / 8] ^= 1 << (bit % 8);
        prop_assert_eq!(
            codec.decrypt(b"hdr", &ciphertext, &Tag::from_bytes(bytes)),
            Err(CryptoError::InvalidTag)
        );
    }
}

#[test]
fn test_session_keys_match_for_both_roles() {
    let ltk = AeadKey::new([5; KEY_SIZE]);
    let initiator = SessionMaterial::derive(&ltk, &[1; 16], &[2; 16], b"g1s9");
    let responder = SessionMaterial::derive(&ltk, &[1; 16], &[2; 16], b"g1s9");

    let nonce = Nonce::from_bytes([0; NONCE_SIZE]);
    let (ciphertext, tag) = AeadCodec::new(initiator.key(), &nonce)
        .encrypt(b"", b"LOCK")
        .unwrap();
    let plaintext = AeadCodec::new(responder.key(), &nonce)
        .decrypt(b"", &ciphertext, &tag)
        .unwrap();
    assert_eq!(plaintext, b"LOCK");
}
