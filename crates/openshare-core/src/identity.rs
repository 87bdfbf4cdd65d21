//! Long-term peer identity: an Ed25519 signing keypair plus a static X25519
//! keypair derived from it for use in the Noise-XX handshake (see
//! `handshake.rs` and DESIGN.md for why the two live together).

use crate::crypto;
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret as X25519Secret};
use zeroize::Zeroize;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid identity file length: expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// Exclusively-owned long-term identity for this process.
pub struct LocalIdentity {
    signing_key: SigningKey,
    static_dh_secret: X25519Secret,
    static_dh_public: X25519Public,
}

impl Drop for LocalIdentity {
    fn drop(&mut self) {
        // SigningKey zeroizes its internal bytes on drop itself (the
        // "zeroize" feature of ed25519-dalek); this extra pass covers the
        // transient copy `to_bytes()` hands back.
        let mut bytes = self.signing_key.to_bytes();
        bytes.zeroize();
        // static_dh_secret zeroizes itself on drop (x25519-dalek StaticSecret).
    }
}

impl LocalIdentity {
    pub fn generate() -> Self {
        Self::from_signing_key(crypto::generate_signing_keypair())
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let static_dh_secret = derive_static_dh_secret(&signing_key);
        let static_dh_public = X25519Public::from(&static_dh_secret);
        Self {
            signing_key,
            static_dh_secret,
            static_dh_public,
        }
    }

    pub fn generate_and_store(path: &Path) -> Result<Self, IdentityError> {
        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, identity.signing_key.to_bytes())?;
        tracing::info!(path = %path.display(), "generated new identity");
        Ok(identity)
    }

    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let data = fs::read(path)?;
        if data.len() != 32 {
            return Err(IdentityError::InvalidLength(data.len()));
        }
        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&data);
        let signing_key = SigningKey::from_bytes(&key_bytes);
        key_bytes.zeroize();
        tracing::info!(path = %path.display(), "loaded identity");
        Ok(Self::from_signing_key(signing_key))
    }

    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            Self::load(path)
        } else {
            Self::generate_and_store(path)
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn static_dh_secret(&self) -> &X25519Secret {
        &self.static_dh_secret
    }

    pub fn static_dh_public(&self) -> X25519Public {
        self.static_dh_public
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        crypto::sign(&self.signing_key, msg)
    }

    pub fn peer_id(&self) -> String {
        peer_id_from_public_key(&self.verifying_key())
    }

    /// First 8 hex chars of the peer_id, for human-readable display.
    pub fn fingerprint(&self) -> String {
        self.peer_id()[..8].to_string()
    }
}

/// Derive a long-term X25519 static keypair from the Ed25519 signing seed so
/// only one secret needs to be persisted on disk. The Noise-XX static key
/// exchange (`s`, `es`, `se`) contributes only to transport-key derivation;
/// the actual peer authentication comes from the handshake payload signature
/// made with the Ed25519 key (see `handshake.rs`).
fn derive_static_dh_secret(signing_key: &SigningKey) -> X25519Secret {
    let mut seed = signing_key.to_bytes();
    let prk = crypto::hkdf_extract(b"openshare-identity-dh-v1", &seed);
    seed.zeroize();
    let mut okm = [0u8; 32];
    crypto::hkdf_expand(&prk, b"static-dh", &mut okm)
        .expect("32-byte HKDF expand never fails");
    let secret = X25519Secret::from(okm);
    okm.zeroize();
    secret
}

/// Authenticated identity of a remote peer, established by the handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteIdentity {
    pub public_key: [u8; 32],
    pub peer_id: String,
}

impl RemoteIdentity {
    pub fn from_public_key(public_key: VerifyingKey) -> Self {
        let peer_id = peer_id_from_public_key(&public_key);
        Self {
            public_key: public_key.to_bytes(),
            peer_id,
        }
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, IdentityError> {
        VerifyingKey::from_bytes(&self.public_key)
            .map_err(|_| IdentityError::InvalidLength(self.public_key.len()))
    }
}

/// peer_id = lowercase hex of the first 16 bytes of SHA-256 over the public
/// signing key.
pub fn peer_id_from_public_key(key: &VerifyingKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.to_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn peer_id_is_stable_for_same_key() {
        let identity = LocalIdentity::generate();
        assert_eq!(identity.peer_id(), identity.peer_id());
        assert_eq!(identity.peer_id().len(), 32);
    }

    #[test]
    fn remote_identity_matches_local_peer_id() {
        let identity = LocalIdentity::generate();
        let remote = RemoteIdentity::from_public_key(identity.verifying_key());
        assert_eq!(remote.peer_id, identity.peer_id());
    }

    #[test]
    fn generate_and_store_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identity.key");
        let a = LocalIdentity::generate_and_store(&path).unwrap();
        let b = LocalIdentity::load(&path).unwrap();
        assert_eq!(a.peer_id(), b.peer_id());
        assert_eq!(a.static_dh_public().as_bytes(), b.static_dh_public().as_bytes());
    }

    #[test]
    fn load_rejects_wrong_length_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.key");
        fs::write(&path, b"too short").unwrap();
        assert!(matches!(
            LocalIdentity::load(&path),
            Err(IdentityError::InvalidLength(_))
        ));
    }
}
