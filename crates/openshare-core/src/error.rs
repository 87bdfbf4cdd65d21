//! Top-level error aggregate (§7). Per-module errors (`Crypto`, `Handshake`,
//! `Transport`, `Protocol`, `Transfer`, `Storage`) compose into one enum via
//! `thiserror`'s `#[from]`; each module defines its own error type, and
//! `anyhow` is reserved for the CLI boundary rather than any library API.

use crate::crypto::CryptoError;
use crate::handshake::HandshakeError;
use crate::message::ProtocolError;
use crate::record::TransportError;
use storage::StorageError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Dial,
    Handshake,
    Read,
    Write,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TimeoutPhase::Dial => "dial",
            TimeoutPhase::Handshake => "handshake",
            TimeoutPhase::Read => "read",
            TimeoutPhase::Write => "write",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("chunk hash mismatch for transfer {transfer_id} chunk {chunk_index}")]
    ChunkHashMismatch { transfer_id: String, chunk_index: i64 },
    #[error("whole-file hash mismatch for transfer {transfer_id}")]
    WholeFileHashMismatch { transfer_id: String },
    #[error("retry budget exhausted for transfer {transfer_id} chunk {chunk_index}")]
    RetryBudgetExhausted { transfer_id: String, chunk_index: i64 },
    #[error("unknown transfer {0}")]
    UnknownTransfer(String),
}

#[derive(Error, Debug)]
pub enum OpenShareError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{phase} timed out")]
    Timeout { phase: TimeoutPhase },
    #[error("operation cancelled")]
    Cancelled,
}

impl OpenShareError {
    /// §7's propagation policy: does this error require closing the
    /// session it occurred on (vs. only the affected transfer)?
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            OpenShareError::Crypto(_)
                | OpenShareError::Handshake(_)
                | OpenShareError::Transport(_)
                | OpenShareError::Protocol(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_errors_are_not_session_fatal() {
        let err = OpenShareError::Transfer(TransferError::UnknownTransfer("x".into()));
        assert!(!err.is_session_fatal());
    }

    #[test]
    fn crypto_errors_are_session_fatal() {
        let err = OpenShareError::Crypto(CryptoError::AeadAuthentication);
        assert!(err.is_session_fatal());
    }
}
