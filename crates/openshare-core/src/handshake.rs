//! Noise-XX handshake state machine (§4.C): mutual authentication over
//! X25519/AES-256-GCM/SHA256, producing a pair of forward-secret transport
//! keys and an authenticated [`RemoteIdentity`].
//!
//! Pattern: `-> e`, `<- e, ee, s, es, payload1`, `-> s, se, payload2`,
//! `<- (empty) HandshakeComplete`. `SymmetricState` tracks the running
//! transcript hash and chaining key the way the reference Noise
//! implementations in this codebase's pack do it, generalized from a
//! single shared cipher to the directional keys this protocol uses.

use crate::crypto::{self, CryptoError};
use crate::identity::{LocalIdentity, RemoteIdentity};
use crate::message::TypedMessage;
use crate::session::Session;
use ed25519_dalek::{Signature, VerifyingKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::PublicKey as X25519Public;
use zeroize::Zeroize;

const PROTOCOL_NAME: &[u8] = b"Noise_XX_25519_AESGCM_SHA256";
const MAX_HANDSHAKE_FRAME: usize = 4096;
const STALE_WINDOW_MS: i64 = 5 * 60 * 1000;
const STATIC_KEY_CIPHERTEXT_LEN: usize = 32 + crypto::TAG_LEN;

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("unexpected handshake message")]
    UnexpectedMessage,
    #[error("handshake timestamp outside the +/-5 minute window")]
    StaleTimestamp,
    #[error("peer identity verification failed")]
    Authentication,
    #[error("handshake stream closed prematurely")]
    PrematureClose,
    #[error("malformed handshake message")]
    Malformed,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ephemeral bookkeeping for one handshake attempt. Destroyed (and its
/// secrets zeroized) as soon as the handshake completes or fails.
struct SymmetricState {
    h: [u8; 32],
    ck: [u8; 32],
    cipher: Option<([u8; 32], u64)>,
}

impl SymmetricState {
    fn new() -> Self {
        let mut h = [0u8; 32];
        h[..PROTOCOL_NAME.len()].copy_from_slice(PROTOCOL_NAME);
        Self {
            h,
            ck: h,
            cipher: None,
        }
    }

    fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h = hasher.finalize().into();
    }

    fn mix_key(&mut self, ikm: &[u8]) -> Result<(), HandshakeError> {
        let (ck, k) = hkdf2(&self.ck, ikm)?;
        self.ck = ck;
        self.cipher = Some((k, 0));
        Ok(())
    }

    /// Encrypts (if a key is installed) then mixes the ciphertext into `h`.
    fn encrypt_and_hash(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let ciphertext = match self.cipher.as_mut() {
            Some((key, counter)) => {
                let nonce = crypto::counter_nonce(*counter);
                let ct = crypto::aead_seal(key, &nonce, &self.h, plaintext)?;
                *counter += 1;
                ct
            }
            None => plaintext.to_vec(),
        };
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    /// Decrypts (if a key is installed) then mixes the ciphertext into `h`.
    fn decrypt_and_hash(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let plaintext = match self.cipher.as_mut() {
            Some((key, counter)) => {
                let nonce = crypto::counter_nonce(*counter);
                let pt = crypto::aead_open(key, &nonce, &self.h, ciphertext)?;
                *counter += 1;
                pt
            }
            None => ciphertext.to_vec(),
        };
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    fn split(&self) -> Result<([u8; 32], [u8; 32]), HandshakeError> {
        hkdf2(&self.ck, b"")
    }
}

impl Drop for SymmetricState {
    fn drop(&mut self) {
        self.h.zeroize();
        self.ck.zeroize();
        if let Some((key, _)) = self.cipher.as_mut() {
            key.zeroize();
        }
    }
}

fn hkdf2(ck: &[u8; 32], ikm: &[u8]) -> Result<([u8; 32], [u8; 32]), HandshakeError> {
    let prk = crypto::hkdf_extract(ck, ikm);
    let mut okm = [0u8; 64];
    crypto::hkdf_expand(&prk, b"", &mut okm)?;
    let mut a = [0u8; 32];
    let mut b = [0u8; 32];
    a.copy_from_slice(&okm[..32]);
    b.copy_from_slice(&okm[32..]);
    okm.zeroize();
    Ok((a, b))
}

fn x25519_public_from_slice(bytes: &[u8]) -> Result<X25519Public, HandshakeError> {
    let arr: [u8; 32] = bytes.try_into().map_err(|_| HandshakeError::Malformed)?;
    Ok(X25519Public::from(arr))
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before 1970")
        .as_millis() as i64
}

/// Builds the handshake payload: long-term signing public key, timestamp,
/// and a signature over `h || timestamp` where `h` is the transcript hash
/// as of immediately before this payload is encrypted (it doubles as the
/// AAD used to seal this payload). The payload carries the signing key
/// itself because the Noise `s` field here is the derived X25519 DH key,
/// not the identity key — see `identity.rs`.
fn build_payload(identity: &LocalIdentity, h: &[u8; 32]) -> Vec<u8> {
    let timestamp_ms = now_ms();
    let mut to_sign = Vec::with_capacity(32 + 8);
    to_sign.extend_from_slice(h);
    to_sign.extend_from_slice(&timestamp_ms.to_be_bytes());
    let signature = identity.sign(&to_sign);

    let pubkey = identity.verifying_key().to_bytes();
    let sig_bytes = signature.to_bytes();

    let mut payload = Vec::with_capacity(32 + 8 + 2 + sig_bytes.len());
    payload.extend_from_slice(&pubkey);
    payload.extend_from_slice(&timestamp_ms.to_be_bytes());
    payload.extend_from_slice(&(sig_bytes.len() as u16).to_be_bytes());
    payload.extend_from_slice(&sig_bytes);
    payload
}

fn verify_payload(payload: &[u8], h: &[u8; 32]) -> Result<RemoteIdentity, HandshakeError> {
    if payload.len() < 32 + 8 + 2 {
        return Err(HandshakeError::Malformed);
    }
    let pubkey_bytes: [u8; 32] = payload[0..32].try_into().unwrap();
    let timestamp_ms = i64::from_be_bytes(payload[32..40].try_into().unwrap());
    let sig_len = u16::from_be_bytes(payload[40..42].try_into().unwrap()) as usize;
    if payload.len() != 42 + sig_len {
        return Err(HandshakeError::Malformed);
    }
    let sig_bytes = &payload[42..42 + sig_len];

    let verifying_key =
        VerifyingKey::from_bytes(&pubkey_bytes).map_err(|_| HandshakeError::Malformed)?;
    let signature = Signature::from_slice(sig_bytes).map_err(|_| HandshakeError::Malformed)?;

    let mut to_verify = Vec::with_capacity(32 + 8);
    to_verify.extend_from_slice(h);
    to_verify.extend_from_slice(&timestamp_ms.to_be_bytes());
    crypto::verify(&verifying_key, &to_verify, &signature)
        .map_err(|_| HandshakeError::Authentication)?;

    let now = now_ms();
    if (now - timestamp_ms).abs() > STALE_WINDOW_MS {
        return Err(HandshakeError::StaleTimestamp);
    }

    Ok(RemoteIdentity::from_public_key(verifying_key))
}

async fn write_handshake_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), HandshakeError> {
    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_handshake_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>, HandshakeError> {
    let mut length_bytes = [0u8; 4];
    read_or_premature_close(reader, &mut length_bytes).await?;
    let length = u32::from_be_bytes(length_bytes) as usize;
    if length == 0 || length > MAX_HANDSHAKE_FRAME {
        return Err(HandshakeError::Malformed);
    }
    let mut buf = vec![0u8; length];
    read_or_premature_close(reader, &mut buf).await?;
    Ok(buf)
}

async fn read_or_premature_close<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), HandshakeError> {
    reader.read_exact(buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            HandshakeError::PrematureClose
        } else {
            HandshakeError::Io(e)
        }
    })
}

/// Runs the initiator side of the handshake over `stream`, returning the
/// established [`Session`] on success. Any failure destroys all handshake
/// state; the caller is responsible for closing the stream afterward.
pub async fn initiate<S>(
    identity: &LocalIdentity,
    stream: &mut S,
) -> Result<Session, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut sym = SymmetricState::new();

    // -> e
    let (i_eph_secret, i_eph_public) = crypto::generate_x25519_keypair();
    sym.mix_hash(i_eph_public.as_bytes());
    write_handshake_frame(stream, i_eph_public.as_bytes()).await?;

    // <- e, ee, s, es, payload1
    let msg2 = read_handshake_frame(stream).await?;
    if msg2.len() <= 32 + STATIC_KEY_CIPHERTEXT_LEN {
        return Err(HandshakeError::Malformed);
    }
    let r_eph_public = x25519_public_from_slice(&msg2[0..32])?;
    sym.mix_hash(r_eph_public.as_bytes());
    let ee = crypto::diffie_hellman(&i_eph_secret, &r_eph_public);
    sym.mix_key(&ee)?;

    let s_ct = &msg2[32..32 + STATIC_KEY_CIPHERTEXT_LEN];
    let r_static_bytes = sym.decrypt_and_hash(s_ct)?;
    let r_static_public = x25519_public_from_slice(&r_static_bytes)?;
    let es = crypto::diffie_hellman(&i_eph_secret, &r_static_public);
    sym.mix_key(&es)?;

    let payload1_ct = &msg2[32 + STATIC_KEY_CIPHERTEXT_LEN..];
    let h_for_payload1 = sym.h;
    let payload1_pt = sym.decrypt_and_hash(payload1_ct)?;
    let remote = verify_payload(&payload1_pt, &h_for_payload1)?;
    tracing::debug!(peer_id = %remote.peer_id, "initiator verified responder");

    // -> s, se, payload2
    let i_static_public = identity.static_dh_public().to_bytes();
    let s_ct2 = sym.encrypt_and_hash(&i_static_public)?;
    let se = crypto::diffie_hellman(identity.static_dh_secret(), &r_eph_public);
    sym.mix_key(&se)?;

    let h_for_payload2 = sym.h;
    let payload2_pt = build_payload(identity, &h_for_payload2);
    let payload2_ct = sym.encrypt_and_hash(&payload2_pt)?;

    let mut msg3 = Vec::with_capacity(s_ct2.len() + payload2_ct.len());
    msg3.extend_from_slice(&s_ct2);
    msg3.extend_from_slice(&payload2_ct);
    write_handshake_frame(stream, &msg3).await?;

    let (outbound, inbound) = sym.split()?;
    let peer_id_for_log = remote.peer_id.clone();
    let session = Session::new(remote, outbound, inbound);
    drop(sym);

    // <- (empty) HandshakeComplete, carried over the now-established session.
    match session.recv(stream).await {
        Ok(TypedMessage::HandshakeComplete) => {}
        Ok(_) => return Err(HandshakeError::UnexpectedMessage),
        Err(_) => return Err(HandshakeError::PrematureClose),
    }
    tracing::info!(peer_id = %peer_id_for_log, "initiator handshake complete");

    Ok(session)
}

/// Runs the responder side of the handshake over `stream`.
pub async fn respond<S>(
    identity: &LocalIdentity,
    stream: &mut S,
) -> Result<Session, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut sym = SymmetricState::new();

    // -> e
    let msg1 = read_handshake_frame(stream).await?;
    if msg1.len() != 32 {
        return Err(HandshakeError::Malformed);
    }
    let i_eph_public = x25519_public_from_slice(&msg1)?;
    sym.mix_hash(i_eph_public.as_bytes());

    // <- e, ee, s, es, payload1
    let (r_eph_secret, r_eph_public) = crypto::generate_x25519_keypair();
    sym.mix_hash(r_eph_public.as_bytes());
    let ee = crypto::diffie_hellman(&r_eph_secret, &i_eph_public);
    sym.mix_key(&ee)?;

    let r_static_bytes = identity.static_dh_public().to_bytes();
    let s_ct = sym.encrypt_and_hash(&r_static_bytes)?;
    let es = crypto::diffie_hellman(identity.static_dh_secret(), &i_eph_public);
    sym.mix_key(&es)?;

    let h_for_payload1 = sym.h;
    let payload1_pt = build_payload(identity, &h_for_payload1);
    let payload1_ct = sym.encrypt_and_hash(&payload1_pt)?;

    let mut msg2 = Vec::with_capacity(32 + s_ct.len() + payload1_ct.len());
    msg2.extend_from_slice(r_eph_public.as_bytes());
    msg2.extend_from_slice(&s_ct);
    msg2.extend_from_slice(&payload1_ct);
    write_handshake_frame(stream, &msg2).await?;

    // -> s, se, payload2
    let msg3 = read_handshake_frame(stream).await?;
    if msg3.len() <= STATIC_KEY_CIPHERTEXT_LEN {
        return Err(HandshakeError::Malformed);
    }
    let s_ct2 = &msg3[..STATIC_KEY_CIPHERTEXT_LEN];
    let i_static_bytes = sym.decrypt_and_hash(s_ct2)?;
    let i_static_public = x25519_public_from_slice(&i_static_bytes)?;
    let se = crypto::diffie_hellman(&r_eph_secret, &i_static_public);
    sym.mix_key(&se)?;

    let payload2_ct = &msg3[STATIC_KEY_CIPHERTEXT_LEN..];
    let h_for_payload2 = sym.h;
    let payload2_pt = sym.decrypt_and_hash(payload2_ct)?;
    let remote = verify_payload(&payload2_pt, &h_for_payload2)?;
    tracing::debug!(peer_id = %remote.peer_id, "responder verified initiator");

    let (k1, k2) = sym.split()?;
    // Swapped relative to the initiator: see §4.C "Split()".
    let peer_id_for_log = remote.peer_id.clone();
    let session = Session::new(remote, k2, k1);
    drop(sym);

    session
        .send(stream, &TypedMessage::HandshakeComplete)
        .await
        .map_err(|_| HandshakeError::PrematureClose)?;
    tracing::info!(peer_id = %peer_id_for_log, "responder handshake complete");

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn mutual_handshake_establishes_matching_sessions() {
        let initiator_identity = LocalIdentity::generate();
        let responder_identity = LocalIdentity::generate();
        let (mut i_stream, mut r_stream) = duplex(8192);

        let (initiator_result, responder_result) = tokio::join!(
            async { initiate(&initiator_identity, &mut i_stream).await },
            async { respond(&responder_identity, &mut r_stream).await },
        );

        let initiator_session = initiator_result.expect("initiator handshake failed");
        let responder_session = responder_result.expect("responder handshake failed");

        assert_eq!(
            initiator_session.remote.peer_id,
            responder_identity.peer_id()
        );
        assert_eq!(
            responder_session.remote.peer_id,
            initiator_identity.peer_id()
        );
    }

    #[test]
    fn mismatched_transcript_hash_fails_authentication() {
        let identity = LocalIdentity::generate();
        let h = [5u8; 32];
        let payload = build_payload(&identity, &h);

        let wrong_h = [6u8; 32];
        assert!(matches!(
            verify_payload(&payload, &wrong_h),
            Err(HandshakeError::Authentication)
        ));

        let remote = verify_payload(&payload, &h).unwrap();
        assert_eq!(remote.peer_id, identity.peer_id());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let identity = LocalIdentity::generate();
        let h = [1u8; 32];
        let ancient_timestamp: i64 = 0;
        let mut to_sign = Vec::new();
        to_sign.extend_from_slice(&h);
        to_sign.extend_from_slice(&ancient_timestamp.to_be_bytes());
        let signature = identity.sign(&to_sign);
        let sig_bytes = signature.to_bytes();

        let mut payload = Vec::new();
        payload.extend_from_slice(&identity.verifying_key().to_bytes());
        payload.extend_from_slice(&ancient_timestamp.to_be_bytes());
        payload.extend_from_slice(&(sig_bytes.len() as u16).to_be_bytes());
        payload.extend_from_slice(&sig_bytes);

        assert!(matches!(
            verify_payload(&payload, &h),
            Err(HandshakeError::StaleTimestamp)
        ));
    }
}
