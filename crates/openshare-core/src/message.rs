//! Typed message envelope carried inside a decrypted record (§4.E).
//!
//! Framing: `[u32 BE payload-length][u8 kind][payload bytes]`. Handshake
//! kinds carry opaque bytes produced by `handshake.rs`; everything else is
//! a `bincode`-encoded struct.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown message kind: {0:#x}")]
    UnknownKind(u8),
    #[error("malformed envelope")]
    Malformed,
    #[error("payload exceeds {MAX_PAYLOAD} bytes")]
    PayloadTooLarge,
    #[error("codec error: {0}")]
    Encoding(#[from] bincode::Error),
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    HandshakeInit = 0x01,
    HandshakeResponse = 0x02,
    HandshakeFinal = 0x03,
    HandshakeComplete = 0x04,
    Ping = 0x10,
    Pong = 0x11,
    Disconnect = 0x12,
    FileAnnounce = 0x20,
    FileRequest = 0x21,
    FileChunk = 0x22,
    FileChunkAck = 0x23,
    FileComplete = 0x24,
    FileCancel = 0x25,
    FileResume = 0x26,
    ClipboardData = 0x30,
    ClipboardAck = 0x31,
}

impl TryFrom<u8> for Kind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => Kind::HandshakeInit,
            0x02 => Kind::HandshakeResponse,
            0x03 => Kind::HandshakeFinal,
            0x04 => Kind::HandshakeComplete,
            0x10 => Kind::Ping,
            0x11 => Kind::Pong,
            0x12 => Kind::Disconnect,
            0x20 => Kind::FileAnnounce,
            0x21 => Kind::FileRequest,
            0x22 => Kind::FileChunk,
            0x23 => Kind::FileChunkAck,
            0x24 => Kind::FileComplete,
            0x25 => Kind::FileCancel,
            0x26 => Kind::FileResume,
            0x30 => Kind::ClipboardData,
            0x31 => Kind::ClipboardAck,
            other => return Err(ProtocolError::UnknownKind(other)),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAnnounce {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: i64,
    pub file_hash: [u8; 32],
    pub chunk_size: i32,
    pub total_chunks: i64,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRequest {
    pub transfer_id: String,
    pub first_chunk_index: i64,
    pub chunk_count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunk {
    pub transfer_id: String,
    pub chunk_index: i64,
    pub data: Vec<u8>,
    pub chunk_hash: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunkAck {
    pub transfer_id: String,
    pub chunk_index: i64,
    pub success: bool,
}

/// Shared shape of `FileComplete` and `FileCancel` (identical fields).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileOutcome {
    pub transfer_id: String,
    pub success: bool,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResume {
    pub transfer_id: String,
    pub last_received_chunk: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    pub timestamp_ms: i64,
    pub sequence: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
    pub ping_timestamp_ms: i64,
    pub sequence: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disconnect {
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[repr(u8)]
pub enum ClipboardContentType {
    Text = 0,
    Image = 1,
    Rtf = 2,
    Html = 3,
    Files = 4,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipboardData {
    pub clipboard_id: String,
    pub content_type: ClipboardContentType,
    pub data: Vec<u8>,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipboardAck {
    pub clipboard_id: String,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub enum TypedMessage {
    HandshakeInit(Vec<u8>),
    HandshakeResponse(Vec<u8>),
    HandshakeFinal(Vec<u8>),
    HandshakeComplete,
    Ping(Ping),
    Pong(Pong),
    Disconnect(Disconnect),
    FileAnnounce(FileAnnounce),
    FileRequest(FileRequest),
    FileChunk(FileChunk),
    FileChunkAck(FileChunkAck),
    FileComplete(FileOutcome),
    FileCancel(FileOutcome),
    FileResume(FileResume),
    ClipboardData(ClipboardData),
    ClipboardAck(ClipboardAck),
}

impl TypedMessage {
    pub fn kind(&self) -> Kind {
        match self {
            Self::HandshakeInit(_) => Kind::HandshakeInit,
            Self::HandshakeResponse(_) => Kind::HandshakeResponse,
            Self::HandshakeFinal(_) => Kind::HandshakeFinal,
            Self::HandshakeComplete => Kind::HandshakeComplete,
            Self::Ping(_) => Kind::Ping,
            Self::Pong(_) => Kind::Pong,
            Self::Disconnect(_) => Kind::Disconnect,
            Self::FileAnnounce(_) => Kind::FileAnnounce,
            Self::FileRequest(_) => Kind::FileRequest,
            Self::FileChunk(_) => Kind::FileChunk,
            Self::FileChunkAck(_) => Kind::FileChunkAck,
            Self::FileComplete(_) => Kind::FileComplete,
            Self::FileCancel(_) => Kind::FileCancel,
            Self::FileResume(_) => Kind::FileResume,
            Self::ClipboardData(_) => Kind::ClipboardData,
            Self::ClipboardAck(_) => Kind::ClipboardAck,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = match self {
            Self::HandshakeInit(b) | Self::HandshakeResponse(b) | Self::HandshakeFinal(b) => {
                b.clone()
            }
            Self::HandshakeComplete => Vec::new(),
            Self::Ping(m) => bincode::serialize(m)?,
            Self::Pong(m) => bincode::serialize(m)?,
            Self::Disconnect(m) => bincode::serialize(m)?,
            Self::FileAnnounce(m) => bincode::serialize(m)?,
            Self::FileRequest(m) => bincode::serialize(m)?,
            Self::FileChunk(m) => bincode::serialize(m)?,
            Self::FileChunkAck(m) => bincode::serialize(m)?,
            Self::FileComplete(m) | Self::FileCancel(m) => bincode::serialize(m)?,
            Self::FileResume(m) => bincode::serialize(m)?,
            Self::ClipboardData(m) => bincode::serialize(m)?,
            Self::ClipboardAck(m) => bincode::serialize(m)?,
        };
        if payload.len() > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge);
        }
        Ok(encode_envelope(self.kind() as u8, &payload))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (kind_byte, payload) = decode_envelope(bytes)?;
        let kind = Kind::try_from(kind_byte)?;
        Ok(match kind {
            Kind::HandshakeInit => Self::HandshakeInit(payload.to_vec()),
            Kind::HandshakeResponse => Self::HandshakeResponse(payload.to_vec()),
            Kind::HandshakeFinal => Self::HandshakeFinal(payload.to_vec()),
            Kind::HandshakeComplete => Self::HandshakeComplete,
            Kind::Ping => Self::Ping(bincode::deserialize(payload)?),
            Kind::Pong => Self::Pong(bincode::deserialize(payload)?),
            Kind::Disconnect => Self::Disconnect(bincode::deserialize(payload)?),
            Kind::FileAnnounce => Self::FileAnnounce(bincode::deserialize(payload)?),
            Kind::FileRequest => Self::FileRequest(bincode::deserialize(payload)?),
            Kind::FileChunk => Self::FileChunk(bincode::deserialize(payload)?),
            Kind::FileChunkAck => Self::FileChunkAck(bincode::deserialize(payload)?),
            Kind::FileComplete => Self::FileComplete(bincode::deserialize(payload)?),
            Kind::FileCancel => Self::FileCancel(bincode::deserialize(payload)?),
            Kind::FileResume => Self::FileResume(bincode::deserialize(payload)?),
            Kind::ClipboardData => Self::ClipboardData(bincode::deserialize(payload)?),
            Kind::ClipboardAck => Self::ClipboardAck(bincode::deserialize(payload)?),
        })
    }
}

fn encode_envelope(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.push(kind);
    buf.extend_from_slice(payload);
    buf
}

fn decode_envelope(bytes: &[u8]) -> Result<(u8, &[u8]), ProtocolError> {
    if bytes.len() < 5 {
        return Err(ProtocolError::Malformed);
    }
    let len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
    if len > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge);
    }
    if bytes.len() != 5 + len {
        return Err(ProtocolError::Malformed);
    }
    Ok((bytes[4], &bytes[5..5 + len]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_round_trips() {
        let msg = TypedMessage::Ping(Ping {
            timestamp_ms: 1_700_000_000_000,
            sequence: 42,
        });
        let encoded = msg.encode().unwrap();
        let decoded = TypedMessage::decode(&encoded).unwrap();
        match decoded {
            TypedMessage::Ping(p) => {
                assert_eq!(p.timestamp_ms, 1_700_000_000_000);
                assert_eq!(p.sequence, 42);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn file_announce_round_trips_with_optional_mime() {
        let msg = TypedMessage::FileAnnounce(FileAnnounce {
            transfer_id: "a".repeat(32),
            file_name: "photo.png".into(),
            file_size: 12345,
            file_hash: [9u8; 32],
            chunk_size: 65536,
            total_chunks: 1,
            mime_type: None,
        });
        let encoded = msg.encode().unwrap();
        let decoded = TypedMessage::decode(&encoded).unwrap();
        match decoded {
            TypedMessage::FileAnnounce(a) => {
                assert_eq!(a.file_name, "photo.png");
                assert_eq!(a.mime_type, None);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let bytes = encode_envelope(0xFF, b"");
        assert!(matches!(
            TypedMessage::decode(&bytes),
            Err(ProtocolError::UnknownKind(0xFF))
        ));
    }

    #[test]
    fn truncated_envelope_is_malformed() {
        assert!(matches!(
            TypedMessage::decode(&[0, 0, 0, 5, 0x10]),
            Err(ProtocolError::Malformed)
        ));
    }

    #[test]
    fn clipboard_data_round_trips_content_type() {
        let msg = TypedMessage::ClipboardData(ClipboardData {
            clipboard_id: "clip-1".into(),
            content_type: ClipboardContentType::Html,
            data: b"<b>hi</b>".to_vec(),
            timestamp_ms: 1_700_000_000_000,
        });
        let encoded = msg.encode().unwrap();
        let decoded = TypedMessage::decode(&encoded).unwrap();
        match decoded {
            TypedMessage::ClipboardData(c) => {
                assert_eq!(c.clipboard_id, "clip-1");
                assert!(matches!(c.content_type, ClipboardContentType::Html));
                assert_eq!(c.data, b"<b>hi</b>");
            }
            _ => panic!("wrong variant"),
        }
    }
}
