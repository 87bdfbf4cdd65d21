//! Cryptographic primitives shared by the handshake and record layer.
//!
//! Ed25519 signing, X25519 key agreement, HKDF-SHA256, AES-256-GCM AEAD,
//! CSPRNG fill, and constant-time comparison. No cipher context here is
//! reused across sessions and nonces are always supplied by the caller.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("AEAD authentication failed")]
    AeadAuthentication,
    #[error("signature verification failed")]
    SignatureVerification,
    #[error("HKDF expand failed")]
    HkdfExpand,
}

pub fn generate_signing_keypair() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn sign(key: &SigningKey, msg: &[u8]) -> Signature {
    key.sign(msg)
}

pub fn verify(key: &VerifyingKey, msg: &[u8], sig: &Signature) -> Result<(), CryptoError> {
    key.verify(msg, sig)
        .map_err(|_| CryptoError::SignatureVerification)
}

pub fn generate_x25519_keypair() -> (x25519_dalek::StaticSecret, x25519_dalek::PublicKey) {
    let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
    let public = x25519_dalek::PublicKey::from(&secret);
    (secret, public)
}

pub fn diffie_hellman(
    secret: &x25519_dalek::StaticSecret,
    public: &x25519_dalek::PublicKey,
) -> [u8; 32] {
    secret.diffie_hellman(public).to_bytes()
}

/// HKDF-Extract(salt, ikm) -> pseudorandom key.
pub fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> [u8; 32] {
    let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), ikm);
    prk.into()
}

/// HKDF-Expand(prk, info) filling `out`.
pub fn hkdf_expand(prk: &[u8], info: &[u8], out: &mut [u8]) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::from_prk(prk).map_err(|_| CryptoError::HkdfExpand)?;
    hk.expand(info, out).map_err(|_| CryptoError::HkdfExpand)
}

/// AES-256-GCM seal. `nonce` and `aad` are supplied entirely by the caller.
pub fn aead_seal(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut buf = plaintext.to_vec();
    cipher
        .encrypt_in_place(Nonce::from_slice(nonce), aad, &mut buf)
        .map_err(|_| CryptoError::AeadAuthentication)?;
    Ok(buf)
}

/// AES-256-GCM open. Returns `AeadAuthentication` on any tag mismatch.
pub fn aead_open(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut buf = ciphertext.to_vec();
    cipher
        .decrypt_in_place(Nonce::from_slice(nonce), aad, &mut buf)
        .map_err(|_| CryptoError::AeadAuthentication)?;
    Ok(buf)
}

/// Nonce = 4 zero bytes || 64-bit big-endian counter (§6).
pub fn counter_nonce(counter: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

pub fn fill_random(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aead_round_trip() {
        let key = [7u8; 32];
        let nonce = [0u8; NONCE_LEN];
        let aad = b"frame-length";
        let plaintext = b"hello peer";
        let ct = aead_seal(&key, &nonce, aad, plaintext).unwrap();
        let pt = aead_open(&key, &nonce, aad, &ct).unwrap();
        assert_eq!(pt, plaintext);
    }

    #[test]
    fn aead_rejects_tampered_ciphertext() {
        let key = [7u8; 32];
        let nonce = [0u8; NONCE_LEN];
        let mut ct = aead_seal(&key, &nonce, b"aad", b"hello").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(aead_open(&key, &nonce, b"aad", &ct).is_err());
    }

    #[test]
    fn dh_is_symmetric() {
        let (a_secret, a_public) = generate_x25519_keypair();
        let (b_secret, b_public) = generate_x25519_keypair();
        assert_eq!(
            diffie_hellman(&a_secret, &b_public),
            diffie_hellman(&b_secret, &a_public)
        );
    }

    #[test]
    fn constant_time_eq_matches_slice_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
    }
}
