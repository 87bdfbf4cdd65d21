//! Offset-addressed inbox storage for incoming file transfers (§4.H, §6).
//!
//! Transfers are written directly into their final on-disk layout: a
//! preallocated `.{transfer_id}.tmp` file that chunks are written into at
//! `chunk_index * chunk_size`, plus a JSON checkpoint sidecar, finalized by
//! rename to `<file_name>` (with ` (k)` collision suffixing on conflict).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Window size for streaming a temp file through SHA-256 at finalize time,
/// matching `openshare_core::transfer::hash_file`'s window.
const HASH_WINDOW: usize = 256 * 1024;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// `(transfer_id, last_contiguously_written_chunk_index, timestamp)` (§3),
/// plus the announce metadata needed to rebuild an `IncomingTransfer` after
/// a restart, since the in-memory announce state does not survive the
/// process that received it.
/// Invariant: once persisted for a transfer_id, `last_chunk` only advances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    pub transfer_id: String,
    pub last_chunk: i64,
    pub timestamp: DateTime<Utc>,
    pub file_name: String,
    pub file_size: u64,
    pub file_hash: [u8; 32],
    pub chunk_size: u32,
    pub total_chunks: i64,
}

/// Storage surface the transfer engine drives for one receiver-side
/// transfer. Each method operates in terms of the transfer's temporary
/// file and checkpoint sidecar under the inbox directory.
#[async_trait]
pub trait Inbox: Send + Sync {
    /// Creates `.{transfer_id}.tmp` and preallocates it to `file_size`
    /// bytes. Idempotent: if the temp file already exists (resume), it is
    /// left untouched.
    async fn preallocate(&self, transfer_id: &str, file_size: u64) -> Result<(), StorageError>;

    /// Writes `data` at `chunk_index * chunk_size` under an exclusive
    /// per-transfer lock, flushing before returning.
    async fn write_chunk(
        &self,
        transfer_id: &str,
        chunk_index: i64,
        chunk_size: i64,
        data: &[u8],
    ) -> Result<(), StorageError>;

    /// Reads back the full temp file contents, for whole-file hash
    /// verification once all chunks have been written.
    async fn read_temp_file(&self, transfer_id: &str) -> Result<Vec<u8>, StorageError>;

    /// Streams the temp file through SHA-256 in fixed-size windows instead
    /// of buffering it whole, so whole-file verification at finalize needs
    /// O(chunk_size) memory regardless of file size (§4.H).
    async fn hash_temp_file(&self, transfer_id: &str) -> Result<[u8; 32], StorageError>;

    /// Deletes the temp file, e.g. after a hash mismatch or cancellation.
    async fn discard_temp_file(&self, transfer_id: &str) -> Result<(), StorageError>;

    /// Renames the temp file to `file_name` under the inbox root,
    /// appending ` (k)` before the extension on collision (smallest k >= 1
    /// that makes the name unique). Returns the final path.
    async fn finalize(&self, transfer_id: &str, file_name: &str) -> Result<PathBuf, StorageError>;

    /// Persists a checkpoint, overwriting any previous one for this
    /// transfer_id.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError>;

    /// Reads back a previously persisted checkpoint, if any.
    async fn load_checkpoint(
        &self,
        transfer_id: &str,
    ) -> Result<Option<Checkpoint>, StorageError>;

    /// Deletes a transfer's checkpoint sidecar, once the transfer completes.
    async fn discard_checkpoint(&self, transfer_id: &str) -> Result<(), StorageError>;
}

/// Local filesystem implementation rooted at `<data-root>/inbox/`.
pub struct LocalInbox {
    inbox_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalInbox {
    pub fn new(inbox_dir: PathBuf) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&inbox_dir)?;
        Ok(Self {
            inbox_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn temp_path(&self, transfer_id: &str) -> PathBuf {
        self.inbox_dir.join(format!(".{transfer_id}.tmp"))
    }

    fn checkpoint_path(&self, transfer_id: &str) -> PathBuf {
        self.inbox_dir.join(format!(".{transfer_id}.checkpoint"))
    }

    fn final_path(&self, file_name: &str) -> PathBuf {
        self.inbox_dir.join(file_name)
    }
}

#[async_trait]
impl Inbox for LocalInbox {
    async fn preallocate(&self, transfer_id: &str, file_size: u64) -> Result<(), StorageError> {
        let path = self.temp_path(transfer_id);
        if path.exists() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;
        file.set_len(file_size).await?;
        tracing::debug!(transfer_id, file_size, "preallocated inbox temp file");
        Ok(())
    }

    async fn write_chunk(
        &self,
        transfer_id: &str,
        chunk_index: i64,
        chunk_size: i64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        let path = self.temp_path(transfer_id);
        let mut file = OpenOptions::new().write(true).open(&path).await?;
        let offset = (chunk_index as u64) * (chunk_size as u64);
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_temp_file(&self, transfer_id: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.temp_path(transfer_id);
        Ok(fs::read(&path).await?)
    }

    async fn hash_temp_file(&self, transfer_id: &str) -> Result<[u8; 32], StorageError> {
        let path = self.temp_path(transfer_id);
        let mut file = File::open(&path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_WINDOW];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize().into())
    }

    async fn discard_temp_file(&self, transfer_id: &str) -> Result<(), StorageError> {
        let path = self.temp_path(transfer_id);
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn finalize(&self, transfer_id: &str, file_name: &str) -> Result<PathBuf, StorageError> {
        let temp_path = self.temp_path(transfer_id);
        let target = unique_destination(&self.final_path(file_name));
        fs::rename(&temp_path, &target).await?;
        tracing::info!(transfer_id, path = %target.display(), "finalized inbox file");
        Ok(target)
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let path = self.checkpoint_path(&checkpoint.transfer_id);
        let json = serde_json::to_vec_pretty(checkpoint)?;
        fs::write(&path, json).await?;
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        transfer_id: &str,
    ) -> Result<Option<Checkpoint>, StorageError> {
        let path = self.checkpoint_path(transfer_id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).await?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn discard_checkpoint(&self, transfer_id: &str) -> Result<(), StorageError> {
        let path = self.checkpoint_path(transfer_id);
        if path.exists() {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

/// Given `<dir>/name.ext`, returns the first of `name.ext`, `name (1).ext`,
/// `name (2).ext`, ... that does not already exist on disk.
fn unique_destination(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());

    let mut k: u64 = 1;
    loop {
        let candidate_name = match &extension {
            Some(ext) => format!("{stem} ({k}).{ext}"),
            None => format!("{stem} ({k})"),
        };
        let candidate = parent.join(candidate_name);
        if !candidate.exists() {
            return candidate;
        }
        k += 1;
    }
}
