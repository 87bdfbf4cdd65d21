//! Process-wide configuration (§2, §4.G, §4.H). A plain `serde`-derived
//! struct with a `Default` impl: data dir, listen port, and mDNS service
//! type, plus the dial/handshake deadlines, the in-flight chunk window, the
//! chunk retry budget, and the chunk-size policy thresholds.

use std::path::PathBuf;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Root directory for identity, inbox, and checkpoint state.
    pub data_dir: PathBuf,

    /// Port to listen on for incoming peer connections.
    pub listen_port: u16,

    /// mDNS service type advertised and browsed for peer discovery.
    pub service_type: String,

    /// Upper bound on concurrently in-flight chunk requests per transfer.
    pub max_in_flight_chunks: u32,

    /// Consecutive chunk-hash failures before a transfer aborts as corrupted.
    pub chunk_retry_budget: u32,

    /// Dial timeout, in milliseconds, for `connect_to`.
    pub dial_timeout_ms: u64,

    /// Handshake completion timeout, in milliseconds, after a stream connects.
    pub handshake_timeout_ms: u64,

    /// Chunk size policy thresholds, in bytes: files below `small_file_max`
    /// use `small_chunk_size`; below `medium_file_max` use
    /// `medium_chunk_size`; otherwise `large_chunk_size`.
    pub small_file_max: u64,
    pub small_chunk_size: u32,
    pub medium_file_max: u64,
    pub medium_chunk_size: u32,
    pub large_chunk_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            data_dir: std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".openshare"),
            listen_port: 9876,
            service_type: crate::discovery::SERVICE_TYPE.to_string(),
            max_in_flight_chunks: 8,
            chunk_retry_budget: 5,
            dial_timeout_ms: 15_000,
            handshake_timeout_ms: 30_000,
            small_file_max: 1024 * 1024,
            small_chunk_size: 64 * 1024,
            medium_file_max: 100 * 1024 * 1024,
            medium_chunk_size: 256 * 1024,
            large_chunk_size: 1024 * 1024,
        }
    }
}

impl ClientConfig {
    pub fn ensure_data_dir(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.data_dir.join("inbox"))?;
        Ok(())
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.data_dir.join("inbox")
    }

    pub fn identity_path(&self) -> PathBuf {
        self.data_dir.join("identity.key")
    }

    /// Deterministic chunk-size policy from §4.H:
    /// `< 1 MiB` -> 64 KiB, `< 100 MiB` -> 256 KiB, otherwise 1 MiB.
    pub fn chunk_size_for(&self, file_size: u64) -> u32 {
        if file_size < self.small_file_max {
            self.small_chunk_size
        } else if file_size < self.medium_file_max {
            self.medium_chunk_size
        } else {
            self.large_chunk_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_policy_matches_thresholds() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.chunk_size_for(1000), 64 * 1024);
        assert_eq!(cfg.chunk_size_for(50 * 1024 * 1024), 256 * 1024);
        assert_eq!(cfg.chunk_size_for(300 * 1024 * 1024), 1024 * 1024);
    }
}
