//! Record layer (§4.D): length-framed, AEAD-sealed transport over a reliable
//! duplex byte stream. Each direction of a session owns one
//! [`DirectionalCipher`] with a strictly-increasing 64-bit counter that
//! becomes the low 8 bytes of the AES-GCM nonce.

use crate::crypto;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroize;

/// Matches §4.E/§6: the inner message payload never exceeds 16 MiB.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;
const MAX_FRAME_LEN: usize = MAX_PAYLOAD + crypto::TAG_LEN;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("frame length out of range")]
    LengthOutOfRange,
    #[error("premature end of stream")]
    PrematureEof,
    #[error("AEAD authentication failed")]
    Aead,
    #[error("per-direction counter exhausted")]
    CounterExhausted,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One direction's AEAD context: a 32-byte key and a monotonically
/// increasing counter. Never reused across sessions; zeroized on drop.
pub struct DirectionalCipher {
    key: [u8; 32],
    counter: u64,
}

impl DirectionalCipher {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key, counter: 0 }
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl Drop for DirectionalCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Seal `plaintext` and write `[u32 BE length][ciphertext || tag]`. AAD is
/// the 4-byte length prefix, binding the frame boundary into the tag.
pub async fn write_record<W: AsyncWrite + Unpin>(
    writer: &mut W,
    cipher: &mut DirectionalCipher,
    plaintext: &[u8],
) -> Result<(), TransportError> {
    if plaintext.len() > MAX_PAYLOAD {
        return Err(TransportError::LengthOutOfRange);
    }
    let length = (plaintext.len() + crypto::TAG_LEN) as u32;
    let aad = length.to_be_bytes();
    let nonce = crypto::counter_nonce(cipher.counter);
    let ciphertext = crypto::aead_seal(&cipher.key, &nonce, &aad, plaintext)
        .map_err(|_| TransportError::Aead)?;
    cipher.counter = cipher
        .counter
        .checked_add(1)
        .ok_or(TransportError::CounterExhausted)?;

    writer.write_all(&aad).await?;
    writer.write_all(&ciphertext).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and open it. Any length violation or AEAD failure is
/// fatal to the session.
pub async fn read_record<R: AsyncRead + Unpin>(
    reader: &mut R,
    cipher: &mut DirectionalCipher,
) -> Result<Vec<u8>, TransportError> {
    let mut length_bytes = [0u8; 4];
    read_exact_or_eof(reader, &mut length_bytes).await?;
    let length = u32::from_be_bytes(length_bytes) as usize;
    if length == 0 || length < crypto::TAG_LEN || length > MAX_FRAME_LEN {
        return Err(TransportError::LengthOutOfRange);
    }

    let mut ciphertext = vec![0u8; length];
    read_exact_or_eof(reader, &mut ciphertext).await?;

    let nonce = crypto::counter_nonce(cipher.counter);
    let plaintext = crypto::aead_open(&cipher.key, &nonce, &length_bytes, &ciphertext)
        .map_err(|_| TransportError::Aead)?;
    cipher.counter = cipher
        .counter
        .checked_add(1)
        .ok_or(TransportError::CounterExhausted)?;
    Ok(plaintext)
}

async fn read_exact_or_eof<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), TransportError> {
    reader.read_exact(buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TransportError::PrematureEof
        } else {
            TransportError::Io(e)
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> ([u8; 32], [u8; 32]) {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        crypto::fill_random(&mut a);
        crypto::fill_random(&mut b);
        (a, b)
    }

    #[tokio::test]
    async fn round_trip_preserves_payload_and_advances_counters() {
        let (key, _unused) = keypair();
        let mut send_cipher = DirectionalCipher::new(key);
        let mut recv_cipher = DirectionalCipher::new(key);

        let mut wire = Vec::new();
        write_record(&mut wire, &mut send_cipher, b"hello world")
            .await
            .unwrap();
        assert_eq!(send_cipher.counter(), 1);

        let mut cursor = std::io::Cursor::new(wire);
        let plaintext = read_record(&mut cursor, &mut recv_cipher).await.unwrap();
        assert_eq!(plaintext, b"hello world");
        assert_eq!(recv_cipher.counter(), 1);
    }

    #[tokio::test]
    async fn replaying_a_ciphertext_at_the_next_counter_is_rejected() {
        let (key, _) = keypair();
        let mut send_cipher = DirectionalCipher::new(key);
        let mut recv_cipher = DirectionalCipher::new(key);

        let mut first_wire = Vec::new();
        write_record(&mut first_wire, &mut send_cipher, b"first")
            .await
            .unwrap();

        // Consume the legitimate first frame.
        let mut cursor = std::io::Cursor::new(first_wire.clone());
        read_record(&mut cursor, &mut recv_cipher).await.unwrap();

        // Replay the same bytes; receiver's counter has already advanced to 1,
        // so the nonce used to decrypt no longer matches what sealed it.
        let mut replay_cursor = std::io::Cursor::new(first_wire);
        assert!(read_record(&mut replay_cursor, &mut recv_cipher)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (key, _) = keypair();
        let mut recv_cipher = DirectionalCipher::new(key);
        let mut wire = Vec::new();
        wire.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(wire);
        assert!(matches!(
            read_record(&mut cursor, &mut recv_cipher).await,
            Err(TransportError::LengthOutOfRange)
        ));
    }

    #[tokio::test]
    async fn truncated_stream_is_premature_eof() {
        let (key, _) = keypair();
        let mut send_cipher = DirectionalCipher::new(key);
        let mut recv_cipher = DirectionalCipher::new(key);
        let mut wire = Vec::new();
        write_record(&mut wire, &mut send_cipher, b"payload")
            .await
            .unwrap();
        wire.truncate(wire.len() - 2);
        let mut cursor = std::io::Cursor::new(wire);
        assert!(matches!(
            read_record(&mut cursor, &mut recv_cipher).await,
            Err(TransportError::PrematureEof)
        ));
    }
}
