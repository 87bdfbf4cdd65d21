//! File-transfer engine (§4.H): `announce`/`accept`/`cancel`, the chunked
//! send/receive loops they drive, resumable checkpoints, and whole-file
//! hash verification.
//!
//! Chunk transfer is driven entirely by `FileAnnounce`/`FileRequest`/
//! `FileChunk`/`FileChunkAck` messages exchanged through `peer::PeerManager`,
//! with incoming bytes landing through `storage::Inbox`.

use crate::config::ClientConfig;
use crate::error::{OpenShareError, TransferError};
use crate::message::{
    FileAnnounce, FileChunk, FileChunkAck, FileOutcome, FileRequest, FileResume, TypedMessage,
};
use crate::peer::{PeerEvent, PeerManager};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storage::{Checkpoint, Inbox};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, Mutex};

/// Chunks requested per `FileRequest`, and the outstanding-window size the
/// receive loop keeps topped up (§4.H).
pub const MAX_IN_FLIGHT: i64 = 8;

/// Identifies one side of a transfer: a given `transfer_id` may be in
/// flight with several peers at once (each gets its own progress state),
/// per §4.H's "at most one per transfer_id per peer" invariant.
type TransferKey = (String, String);

#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A peer announced a file we could choose to receive. Surfaced so a
    /// UI shell can decide whether to call `accept`.
    Announced {
        peer_id: String,
        transfer_id: String,
        file_name: String,
        file_size: u64,
    },
    Progress {
        transfer_id: String,
        bytes_transferred: u64,
        total_bytes: u64,
    },
    Completed {
        transfer_id: String,
        success: bool,
        detail: String,
    },
}

struct OutgoingTransfer {
    file_path: PathBuf,
    chunk_size: u32,
    total_chunks: i64,
    acknowledged: i64,
}

struct IncomingTransfer {
    file_name: String,
    file_size: u64,
    file_hash: [u8; 32],
    chunk_size: u32,
    total_chunks: i64,
    received_chunks: i64,
    next_request_start: i64,
    retry_counts: HashMap<i64, u32>,
}

/// Coordinates outgoing and incoming transfers for one local peer.
pub struct TransferEngine {
    config: ClientConfig,
    peers: Arc<PeerManager>,
    inbox: Arc<dyn Inbox>,
    outgoing: Mutex<HashMap<TransferKey, OutgoingTransfer>>,
    incoming: Mutex<HashMap<TransferKey, IncomingTransfer>>,
    events_tx: mpsc::Sender<TransferEvent>,
}

impl TransferEngine {
    pub fn new(
        config: ClientConfig,
        peers: Arc<PeerManager>,
        inbox: Arc<dyn Inbox>,
    ) -> (Arc<Self>, mpsc::Receiver<TransferEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let engine = Arc::new(Self {
            config,
            peers,
            inbox,
            outgoing: Mutex::new(HashMap::new()),
            incoming: Mutex::new(HashMap::new()),
            events_tx,
        });
        (engine, events_rx)
    }

    /// Drives the engine off one peer manager's event stream. Intended to
    /// run as a single long-lived task alongside the peer manager's own
    /// accept/dial loops; non-transfer events pass through untouched.
    pub async fn run(self: Arc<Self>, mut peer_events: mpsc::Receiver<PeerEvent>) {
        while let Some(event) = peer_events.recv().await {
            if let PeerEvent::MessageReceived { peer_id, message } = event {
                self.clone().handle_message(peer_id, message).await;
            }
        }
    }

    async fn handle_message(self: Arc<Self>, peer_id: String, message: TypedMessage) {
        let result = match message {
            TypedMessage::FileAnnounce(a) => self.handle_file_announce(peer_id, a).await,
            TypedMessage::FileRequest(r) => self.handle_file_request(peer_id, r).await,
            TypedMessage::FileChunk(c) => self.handle_file_chunk(peer_id, c).await,
            TypedMessage::FileChunkAck(a) => self.handle_file_chunk_ack(peer_id, a).await,
            TypedMessage::FileCancel(outcome) => self.handle_file_cancel(peer_id, outcome).await,
            TypedMessage::FileResume(r) => self.handle_file_resume(peer_id, r).await,
            _ => Ok(()),
        };
        if let Err(err) = result {
            tracing::warn!(peer_id, error = %err, "transfer message handling failed");
        }
    }

    /// Computes the whole-file SHA-256 (streaming, so hashing a large file
    /// yields cooperatively between reads), picks the chunk size, broadcasts
    /// a `FileAnnounce`, and registers an `OutgoingTransfer` for every
    /// currently-connected peer.
    pub async fn announce(&self, path: &Path) -> Result<String, OpenShareError> {
        let metadata = tokio::fs::metadata(path).await?;
        let file_size = metadata.len();
        let chunk_size = self.config.chunk_size_for(file_size);
        let total_chunks = div_ceil(file_size, chunk_size as u64) as i64;
        let file_hash = hash_file(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let transfer_id = random_transfer_id();

        let connected_peers = self.peers.connected_peer_ids().await;
        {
            let mut outgoing = self.outgoing.lock().await;
            for peer_id in &connected_peers {
                outgoing.insert(
                    (peer_id.clone(), transfer_id.clone()),
                    OutgoingTransfer {
                        file_path: path.to_path_buf(),
                        chunk_size,
                        total_chunks,
                        acknowledged: 0,
                    },
                );
            }
        }

        let announce = FileAnnounce {
            transfer_id: transfer_id.clone(),
            file_name,
            file_size: file_size as i64,
            file_hash,
            chunk_size: chunk_size as i32,
            total_chunks,
            mime_type: None,
        };
        self.peers
            .broadcast(&TypedMessage::FileAnnounce(announce))
            .await;
        tracing::info!(transfer_id, total_chunks, "announced outgoing transfer");
        Ok(transfer_id)
    }

    /// Requests the first window of chunks for `transfer_id` from
    /// `peer_id`, resuming from any persisted checkpoint. If this is a
    /// fresh process that never saw the original `FileAnnounce` (a restart
    /// mid-transfer), the checkpoint's announce metadata is used to rebuild
    /// the `IncomingTransfer` so arriving chunks aren't rejected as unknown.
    pub async fn accept(&self, peer_id: &str, transfer_id: &str) -> Result<(), OpenShareError> {
        let checkpoint = self.inbox.load_checkpoint(transfer_id).await?;
        let first_chunk_index = checkpoint.as_ref().map_or(0, |c| c.last_chunk + 1);

        {
            let mut incoming = self.incoming.lock().await;
            let key = (peer_id.to_string(), transfer_id.to_string());
            match incoming.get_mut(&key) {
                Some(transfer) => {
                    transfer.next_request_start = first_chunk_index;
                }
                None => {
                    if let Some(checkpoint) = &checkpoint {
                        incoming.insert(
                            key,
                            IncomingTransfer {
                                file_name: checkpoint.file_name.clone(),
                                file_size: checkpoint.file_size,
                                file_hash: checkpoint.file_hash,
                                chunk_size: checkpoint.chunk_size,
                                total_chunks: checkpoint.total_chunks,
                                received_chunks: first_chunk_index,
                                next_request_start: first_chunk_index,
                                retry_counts: HashMap::new(),
                            },
                        );
                    }
                }
            }
        }

        self.peers
            .send(
                peer_id,
                &TypedMessage::FileRequest(FileRequest {
                    transfer_id: transfer_id.to_string(),
                    first_chunk_index,
                    chunk_count: MAX_IN_FLIGHT as i32,
                }),
            )
            .await?;
        Ok(())
    }

    /// Drops the transfer locally, on whichever side it's on, and notifies
    /// the peer with `FileCancel`.
    pub async fn cancel(&self, peer_id: &str, transfer_id: &str) -> Result<(), OpenShareError> {
        let key = (peer_id.to_string(), transfer_id.to_string());
        self.outgoing.lock().await.remove(&key);
        if self.incoming.lock().await.remove(&key).is_some() {
            self.inbox.discard_temp_file(transfer_id).await?;
            self.inbox.discard_checkpoint(transfer_id).await?;
        }
        self.peers
            .send(
                peer_id,
                &TypedMessage::FileCancel(FileOutcome {
                    transfer_id: transfer_id.to_string(),
                    success: false,
                    error_message: Some("cancelled".to_string()),
                }),
            )
            .await?;
        Ok(())
    }

    async fn handle_file_announce(
        &self,
        peer_id: String,
        announce: FileAnnounce,
    ) -> Result<(), OpenShareError> {
        self.inbox
            .preallocate(&announce.transfer_id, announce.file_size as u64)
            .await?;

        self.incoming.lock().await.insert(
            (peer_id.clone(), announce.transfer_id.clone()),
            IncomingTransfer {
                file_name: announce.file_name.clone(),
                file_size: announce.file_size as u64,
                file_hash: announce.file_hash,
                chunk_size: announce.chunk_size as u32,
                total_chunks: announce.total_chunks,
                received_chunks: 0,
                next_request_start: 0,
                retry_counts: HashMap::new(),
            },
        );

        let _ = self
            .events_tx
            .send(TransferEvent::Announced {
                peer_id,
                transfer_id: announce.transfer_id.clone(),
                file_name: announce.file_name,
                file_size: announce.file_size as u64,
            })
            .await;
        tracing::info!(transfer_id = %announce.transfer_id, "incoming transfer announced");
        Ok(())
    }

    /// Sender side: serves up to `chunk_count` contiguous chunks starting
    /// at `first_chunk_index`.
    async fn handle_file_request(
        &self,
        peer_id: String,
        request: FileRequest,
    ) -> Result<(), OpenShareError> {
        let key = (peer_id.clone(), request.transfer_id.clone());
        let (file_path, chunk_size, total_chunks) = {
            let outgoing = self.outgoing.lock().await;
            let transfer = outgoing
                .get(&key)
                .ok_or_else(|| TransferError::UnknownTransfer(request.transfer_id.clone()))?;
            (transfer.file_path.clone(), transfer.chunk_size, transfer.total_chunks)
        };

        for offset in 0..request.chunk_count as i64 {
            let chunk_index = request.first_chunk_index + offset;
            if chunk_index >= total_chunks {
                break;
            }
            let data = read_chunk(&file_path, chunk_index, chunk_size).await?;
            let chunk_hash = sha256(&data);
            self.peers
                .send(
                    &peer_id,
                    &TypedMessage::FileChunk(FileChunk {
                        transfer_id: request.transfer_id.clone(),
                        chunk_index,
                        data,
                        chunk_hash,
                    }),
                )
                .await?;
        }
        Ok(())
    }

    /// Sender side: on a positive ack, counts it; on a negative ack,
    /// resends the single chunk.
    async fn handle_file_chunk_ack(
        &self,
        peer_id: String,
        ack: FileChunkAck,
    ) -> Result<(), OpenShareError> {
        let key = (peer_id.clone(), ack.transfer_id.clone());

        if ack.success {
            let completed = {
                let mut outgoing = self.outgoing.lock().await;
                let transfer = outgoing
                    .get_mut(&key)
                    .ok_or_else(|| TransferError::UnknownTransfer(ack.transfer_id.clone()))?;
                transfer.acknowledged += 1;
                transfer.acknowledged >= transfer.total_chunks
            };
            if completed {
                self.outgoing.lock().await.remove(&key);
                let _ = self
                    .events_tx
                    .send(TransferEvent::Completed {
                        transfer_id: ack.transfer_id,
                        success: true,
                        detail: "acknowledged by peer".to_string(),
                    })
                    .await;
            }
            return Ok(());
        }

        let (file_path, chunk_size) = {
            let outgoing = self.outgoing.lock().await;
            let transfer = outgoing
                .get(&key)
                .ok_or_else(|| TransferError::UnknownTransfer(ack.transfer_id.clone()))?;
            (transfer.file_path.clone(), transfer.chunk_size)
        };
        let data = read_chunk(&file_path, ack.chunk_index, chunk_size).await?;
        let chunk_hash = sha256(&data);
        self.peers
            .send(
                &peer_id,
                &TypedMessage::FileChunk(FileChunk {
                    transfer_id: ack.transfer_id,
                    chunk_index: ack.chunk_index,
                    data,
                    chunk_hash,
                }),
            )
            .await?;
        Ok(())
    }

    /// Receiver side: verify, write, checkpoint, ack, top up the window,
    /// and finalize once every chunk has arrived (§4.H).
    async fn handle_file_chunk(
        &self,
        peer_id: String,
        chunk: FileChunk,
    ) -> Result<(), OpenShareError> {
        let key = (peer_id.clone(), chunk.transfer_id.clone());

        let chunk_size = {
            let incoming = self.incoming.lock().await;
            incoming
                .get(&key)
                .ok_or_else(|| TransferError::UnknownTransfer(chunk.transfer_id.clone()))?
                .chunk_size
        };

        let computed_hash = sha256(&chunk.data);
        if !crate::crypto::constant_time_eq(&computed_hash, &chunk.chunk_hash) {
            self.peers
                .send(
                    &peer_id,
                    &TypedMessage::FileChunkAck(FileChunkAck {
                        transfer_id: chunk.transfer_id.clone(),
                        chunk_index: chunk.chunk_index,
                        success: false,
                    }),
                )
                .await?;

            let exhausted = {
                let mut incoming = self.incoming.lock().await;
                let transfer = incoming
                    .get_mut(&key)
                    .ok_or_else(|| TransferError::UnknownTransfer(chunk.transfer_id.clone()))?;
                let retries = transfer.retry_counts.entry(chunk.chunk_index).or_insert(0);
                *retries += 1;
                *retries >= self.config.chunk_retry_budget
            };
            if exhausted {
                self.abort_incoming(&peer_id, &chunk.transfer_id, "corrupted")
                    .await?;
            }
            return Ok(());
        }

        self.inbox
            .write_chunk(
                &chunk.transfer_id,
                chunk.chunk_index,
                chunk_size as i64,
                &chunk.data,
            )
            .await?;

        let (received_chunks, total_chunks, file_size, file_hash, file_name, request_more, request_start) = {
            let mut incoming = self.incoming.lock().await;
            let transfer = incoming
                .get_mut(&key)
                .ok_or_else(|| TransferError::UnknownTransfer(chunk.transfer_id.clone()))?;
            transfer.retry_counts.remove(&chunk.chunk_index);
            transfer.received_chunks += 1;

            let window_end = transfer.next_request_start + MAX_IN_FLIGHT - 1;
            let is_last_of_window = chunk.chunk_index == window_end;
            // The next window tiles contiguously onto this one: it starts
            // where this window ended, not `MAX_IN_FLIGHT` past whichever
            // chunk happened to arrive last.
            let next_window_start = transfer.next_request_start + MAX_IN_FLIGHT;
            let more_remaining = window_end + 1 < transfer.total_chunks;
            let request_more = is_last_of_window && more_remaining;
            if request_more {
                transfer.next_request_start = next_window_start;
            }

            (
                transfer.received_chunks,
                transfer.total_chunks,
                transfer.file_size,
                transfer.file_hash,
                transfer.file_name.clone(),
                request_more,
                transfer.next_request_start,
            )
        };

        // Checkpoint is durably flushed before the ack is sent, so it never
        // lags the acknowledged chunk by more than one (§5).
        self.inbox
            .save_checkpoint(&Checkpoint {
                transfer_id: chunk.transfer_id.clone(),
                last_chunk: chunk.chunk_index,
                timestamp: chrono::Utc::now(),
                file_name: file_name.clone(),
                file_size,
                file_hash,
                chunk_size,
                total_chunks,
            })
            .await?;

        self.peers
            .send(
                &peer_id,
                &TypedMessage::FileChunkAck(FileChunkAck {
                    transfer_id: chunk.transfer_id.clone(),
                    chunk_index: chunk.chunk_index,
                    success: true,
                }),
            )
            .await?;

        let _ = self
            .events_tx
            .send(TransferEvent::Progress {
                transfer_id: chunk.transfer_id.clone(),
                bytes_transferred: (received_chunks as u64) * (chunk_size as u64),
                total_bytes: file_size,
            })
            .await;

        if request_more {
            self.peers
                .send(
                    &peer_id,
                    &TypedMessage::FileRequest(FileRequest {
                        transfer_id: chunk.transfer_id.clone(),
                        first_chunk_index: request_start,
                        chunk_count: MAX_IN_FLIGHT as i32,
                    }),
                )
                .await?;
        }

        if received_chunks >= total_chunks {
            self.finalize_incoming(&peer_id, &chunk.transfer_id, &file_name, file_hash)
                .await?;
        }

        Ok(())
    }

    async fn finalize_incoming(
        &self,
        peer_id: &str,
        transfer_id: &str,
        file_name: &str,
        file_hash: [u8; 32],
    ) -> Result<(), OpenShareError> {
        let computed = self.inbox.hash_temp_file(transfer_id).await?;
        let key = (peer_id.to_string(), transfer_id.to_string());

        if !crate::crypto::constant_time_eq(&computed, &file_hash) {
            self.inbox.discard_temp_file(transfer_id).await?;
            self.inbox.discard_checkpoint(transfer_id).await?;
            self.incoming.lock().await.remove(&key);
            let _ = self
                .events_tx
                .send(TransferEvent::Completed {
                    transfer_id: transfer_id.to_string(),
                    success: false,
                    detail: "hash mismatch".to_string(),
                })
                .await;
            tracing::warn!(transfer_id, "whole-file hash mismatch, transfer aborted");
            return Ok(());
        }

        let final_path = self.inbox.finalize(transfer_id, file_name).await?;
        self.inbox.discard_checkpoint(transfer_id).await?;
        self.incoming.lock().await.remove(&key);

        self.peers
            .send(
                peer_id,
                &TypedMessage::FileComplete(FileOutcome {
                    transfer_id: transfer_id.to_string(),
                    success: true,
                    error_message: None,
                }),
            )
            .await?;

        let _ = self
            .events_tx
            .send(TransferEvent::Completed {
                transfer_id: transfer_id.to_string(),
                success: true,
                detail: final_path.display().to_string(),
            })
            .await;
        tracing::info!(transfer_id, path = %final_path.display(), "transfer finalized");
        Ok(())
    }

    async fn abort_incoming(
        &self,
        peer_id: &str,
        transfer_id: &str,
        reason: &str,
    ) -> Result<(), OpenShareError> {
        self.inbox.discard_temp_file(transfer_id).await?;
        self.inbox.discard_checkpoint(transfer_id).await?;
        self.incoming
            .lock()
            .await
            .remove(&(peer_id.to_string(), transfer_id.to_string()));
        self.peers
            .send(
                peer_id,
                &TypedMessage::FileCancel(FileOutcome {
                    transfer_id: transfer_id.to_string(),
                    success: false,
                    error_message: Some(reason.to_string()),
                }),
            )
            .await?;
        let _ = self
            .events_tx
            .send(TransferEvent::Completed {
                transfer_id: transfer_id.to_string(),
                success: false,
                detail: reason.to_string(),
            })
            .await;
        Ok(())
    }

    async fn handle_file_cancel(
        &self,
        peer_id: String,
        outcome: FileOutcome,
    ) -> Result<(), OpenShareError> {
        let key = (peer_id, outcome.transfer_id.clone());
        self.outgoing.lock().await.remove(&key);
        if self.incoming.lock().await.remove(&key).is_some() {
            self.inbox.discard_temp_file(&outcome.transfer_id).await?;
            self.inbox.discard_checkpoint(&outcome.transfer_id).await?;
        }
        tracing::debug!(transfer_id = %outcome.transfer_id, "peer cancelled transfer");
        Ok(())
    }

    /// A peer asking to resume mid-transfer is treated as an ordinary
    /// request for the next window past what it last received.
    async fn handle_file_resume(
        &self,
        peer_id: String,
        resume: FileResume,
    ) -> Result<(), OpenShareError> {
        self.peers
            .send(
                &peer_id,
                &TypedMessage::FileRequest(FileRequest {
                    transfer_id: resume.transfer_id,
                    first_chunk_index: resume.last_received_chunk + 1,
                    chunk_count: MAX_IN_FLIGHT as i32,
                }),
            )
            .await?;
        Ok(())
    }
}

/// 128-bit random transfer id, hex-encoded to 32 chars (§3 `OutgoingTransfer`).
fn random_transfer_id() -> String {
    let mut bytes = [0u8; 16];
    crate::crypto::fill_random(&mut bytes);
    hex::encode(bytes)
}

fn div_ceil(numerator: u64, denominator: u64) -> u64 {
    (numerator + denominator - 1) / denominator
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Streaming whole-file SHA-256, read in fixed-size windows so hashing a
/// large file yields cooperatively between reads (§5).
async fn hash_file(path: &Path) -> Result<[u8; 32], std::io::Error> {
    const WINDOW: usize = 256 * 1024;
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; WINDOW];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

async fn read_chunk(path: &Path, chunk_index: i64, chunk_size: u32) -> Result<Vec<u8>, std::io::Error> {
    let mut file = File::open(path).await?;
    let offset = (chunk_index as u64) * (chunk_size as u64);
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; chunk_size as usize];
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..]).await?;
        if n == 0 {
            break;
        }
        total += n;
    }
    buf.truncate(total);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalIdentity;
    use storage::LocalInbox;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (
        Arc<PeerManager>,
        mpsc::Receiver<PeerEvent>,
        Arc<PeerManager>,
        mpsc::Receiver<PeerEvent>,
        String,
        String,
    ) {
        let identity_a = Arc::new(LocalIdentity::generate());
        let identity_b = Arc::new(LocalIdentity::generate());
        let peer_id_a = identity_a.peer_id();
        let peer_id_b = identity_b.peer_id();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config_a = ClientConfig::default();
        config_a.listen_port = addr.port();
        config_a.small_chunk_size = 16;
        let mut config_b = ClientConfig::default();
        config_b.listen_port = 0;
        config_b.small_chunk_size = 16;

        let (manager_a, events_a) = PeerManager::new(identity_a, config_a);
        manager_a.start().await.unwrap();
        let (manager_b, events_b) = PeerManager::new(identity_b, config_b);

        let endpoint = crate::discovery::Endpoint {
            addresses: vec!["127.0.0.1".parse().unwrap()],
            port: addr.port(),
        };
        manager_b.connect_to_endpoint(None, endpoint).await.unwrap();

        (manager_a, events_a, manager_b, events_b, peer_id_a, peer_id_b)
    }

    #[tokio::test]
    async fn transfer_completes_and_writes_matching_file_on_receiver() {
        let (manager_a, events_a, manager_b, events_b, peer_id_a, _peer_id_b) =
            connected_pair().await;

        let source_dir = TempDir::new().unwrap();
        let source_path = source_dir.path().join("photo.bin");
        let contents: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&source_path, &contents).await.unwrap();

        let inbox_dir_a = TempDir::new().unwrap();
        let inbox_dir_b = TempDir::new().unwrap();
        let inbox_a: Arc<dyn Inbox> =
            Arc::new(LocalInbox::new(inbox_dir_a.path().to_path_buf()).unwrap());
        let inbox_b: Arc<dyn Inbox> =
            Arc::new(LocalInbox::new(inbox_dir_b.path().to_path_buf()).unwrap());

        let config = ClientConfig::default();
        let (engine_a, _transfer_events_a) =
            TransferEngine::new(config.clone(), manager_a, inbox_a);
        let (engine_b, mut transfer_events_b) =
            TransferEngine::new(config, manager_b, inbox_b);

        tokio::spawn(Arc::clone(&engine_a).run(events_a));
        tokio::spawn(Arc::clone(&engine_b).run(events_b));

        let transfer_id = engine_a.announce(&source_path).await.unwrap();

        let transfer_id_for_accept = loop {
            match transfer_events_b.recv().await.unwrap() {
                TransferEvent::Announced { transfer_id, .. } => break transfer_id,
                _ => continue,
            }
        };
        assert_eq!(transfer_id_for_accept, transfer_id);

        engine_b.accept(&peer_id_a, &transfer_id).await.unwrap();

        let completion = loop {
            match transfer_events_b.recv().await.unwrap() {
                TransferEvent::Completed { success, detail, .. } => break (success, detail),
                _ => continue,
            }
        };
        assert!(completion.0, "transfer should succeed: {}", completion.1);

        let final_path = inbox_dir_b.path().join("photo.bin");
        let received = tokio::fs::read(&final_path).await.unwrap();
        assert_eq!(received, contents);
    }

    /// Regression test for the window top-up math (§4.H, §8 "Transfer
    /// integrity"): 200 bytes at a 16-byte chunk size is 13 chunks, more
    /// than `MAX_IN_FLIGHT`, so this only finishes if successive request
    /// windows tile contiguously instead of drifting apart.
    #[tokio::test]
    async fn large_transfer_spans_multiple_contiguous_request_windows() {
        let (manager_a, events_a, manager_b, events_b, peer_id_a, _peer_id_b) =
            connected_pair().await;

        let source_dir = TempDir::new().unwrap();
        let source_path = source_dir.path().join("photo.bin");
        let contents: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&source_path, &contents).await.unwrap();

        let inbox_dir_a = TempDir::new().unwrap();
        let inbox_dir_b = TempDir::new().unwrap();
        let inbox_a: Arc<dyn Inbox> =
            Arc::new(LocalInbox::new(inbox_dir_a.path().to_path_buf()).unwrap());
        let inbox_b: Arc<dyn Inbox> =
            Arc::new(LocalInbox::new(inbox_dir_b.path().to_path_buf()).unwrap());

        let mut config = ClientConfig::default();
        config.small_chunk_size = 16;
        let (engine_a, _transfer_events_a) =
            TransferEngine::new(config.clone(), manager_a, inbox_a);
        let (engine_b, mut transfer_events_b) =
            TransferEngine::new(config, manager_b, inbox_b);

        tokio::spawn(Arc::clone(&engine_a).run(events_a));
        tokio::spawn(Arc::clone(&engine_b).run(events_b));

        let transfer_id = engine_a.announce(&source_path).await.unwrap();

        let transfer_id_for_accept = loop {
            match transfer_events_b.recv().await.unwrap() {
                TransferEvent::Announced { transfer_id, .. } => break transfer_id,
                _ => continue,
            }
        };
        assert_eq!(transfer_id_for_accept, transfer_id);

        engine_b.accept(&peer_id_a, &transfer_id).await.unwrap();

        let completion = loop {
            match transfer_events_b.recv().await.unwrap() {
                TransferEvent::Completed { success, detail, .. } => break (success, detail),
                _ => continue,
            }
        };
        assert!(completion.0, "transfer should succeed: {}", completion.1);

        let final_path = inbox_dir_b.path().join("photo.bin");
        let received = tokio::fs::read(&final_path).await.unwrap();
        assert_eq!(received, contents);
    }

    #[test]
    fn chunk_size_thresholds_pick_expected_window() {
        let config = ClientConfig::default();
        assert_eq!(config.chunk_size_for(10), 64 * 1024);
        let total_chunks = div_ceil(10, config.chunk_size_for(10) as u64);
        assert_eq!(total_chunks, 1);
    }

    #[tokio::test]
    async fn corrupted_chunk_retries_then_aborts_after_budget() {
        let (manager_a, events_a, manager_b, _events_b, peer_id_a, _peer_id_b) =
            connected_pair().await;
        tokio::spawn(async move {
            let mut events_a = events_a;
            while events_a.recv().await.is_some() {}
        });

        let mut config_b = ClientConfig::default();
        config_b.chunk_retry_budget = 2;
        let inbox_dir_b = TempDir::new().unwrap();
        let inbox_b: Arc<dyn Inbox> =
            Arc::new(LocalInbox::new(inbox_dir_b.path().to_path_buf()).unwrap());
        let (engine_b, mut transfer_events_b) = TransferEngine::new(config_b, manager_b, inbox_b);

        let transfer_id = "f".repeat(16);
        engine_b
            .handle_file_announce(
                peer_id_a.clone(),
                FileAnnounce {
                    transfer_id: transfer_id.clone(),
                    file_name: "x.bin".to_string(),
                    file_size: 16,
                    file_hash: [0u8; 32],
                    chunk_size: 16,
                    total_chunks: 1,
                    mime_type: None,
                },
            )
            .await
            .unwrap();

        // Two bad chunks exhaust the retry budget of 2 and abort the transfer.
        for _ in 0..2 {
            engine_b
                .handle_file_chunk(
                    peer_id_a.clone(),
                    FileChunk {
                        transfer_id: transfer_id.clone(),
                        chunk_index: 0,
                        data: vec![1u8; 16],
                        chunk_hash: [0xFFu8; 32],
                    },
                )
                .await
                .unwrap();
        }

        let completion = loop {
            match transfer_events_b.recv().await.unwrap() {
                TransferEvent::Completed { success, detail, .. } => break (success, detail),
                _ => continue,
            }
        };
        assert!(!completion.0);
        assert_eq!(completion.1, "corrupted");

        let _ = manager_a;
    }

    /// Scenario 5 (§8): a receiver interrupted mid-transfer resumes from its
    /// last checkpoint rather than re-requesting already-written chunks.
    #[tokio::test]
    async fn resume_requests_the_chunk_after_the_last_checkpoint() {
        let (manager_a, events_a, manager_b, _events_b, peer_id_a, _peer_id_b) =
            connected_pair().await;
        let mut events_a = events_a;

        let inbox_dir_b = TempDir::new().unwrap();
        let inbox_b: Arc<dyn Inbox> =
            Arc::new(LocalInbox::new(inbox_dir_b.path().to_path_buf()).unwrap());
        let config_b = ClientConfig::default();

        let transfer_id = "d".repeat(32);
        let chunk_size: u32 = 16;
        let total_chunks = 3i64;
        let chunk_data: Vec<Vec<u8>> = (0..total_chunks)
            .map(|i| vec![i as u8; chunk_size as usize])
            .collect();
        let full_contents: Vec<u8> = chunk_data.concat();
        let file_hash = sha256(&full_contents);

        // First "process": receive chunks 0 and 1, persisting a checkpoint
        // after each, then vanish before chunk 2 arrives or the transfer
        // finalizes.
        {
            let (engine_b, _transfer_events_b) =
                TransferEngine::new(config_b.clone(), Arc::clone(&manager_b), Arc::clone(&inbox_b));
            engine_b
                .handle_file_announce(
                    peer_id_a.clone(),
                    FileAnnounce {
                        transfer_id: transfer_id.clone(),
                        file_name: "resume.bin".to_string(),
                        file_size: (chunk_size as i64 * total_chunks) as i64,
                        file_hash,
                        chunk_size: chunk_size as i32,
                        total_chunks,
                        mime_type: None,
                    },
                )
                .await
                .unwrap();

            for chunk_index in 0..2i64 {
                let data = chunk_data[chunk_index as usize].clone();
                let chunk_hash = sha256(&data);
                engine_b
                    .handle_file_chunk(
                        peer_id_a.clone(),
                        FileChunk {
                            transfer_id: transfer_id.clone(),
                            chunk_index,
                            data,
                            chunk_hash,
                        },
                    )
                    .await
                    .unwrap();
            }

            let checkpoint = inbox_b.load_checkpoint(&transfer_id).await.unwrap().unwrap();
            assert_eq!(checkpoint.last_chunk, 1);
        }

        // Drain the FileChunkAck/FileRequest traffic the first "process"
        // generated on A's side before watching for the resume request.
        loop {
            match events_a.recv().await.unwrap() {
                PeerEvent::MessageReceived {
                    message: TypedMessage::FileChunkAck(ack),
                    ..
                } if ack.chunk_index == 1 => break,
                _ => continue,
            }
        }

        // Second "process": a fresh engine over the same inbox directory
        // resumes the same transfer_id, with no in-memory record of the
        // original announce.
        let (engine_b2, mut transfer_events_b2) =
            TransferEngine::new(config_b, Arc::clone(&manager_b), Arc::clone(&inbox_b));
        engine_b2.accept(&peer_id_a, &transfer_id).await.unwrap();

        let resumed_request = loop {
            match events_a.recv().await.unwrap() {
                PeerEvent::MessageReceived {
                    message: TypedMessage::FileRequest(request),
                    ..
                } if request.transfer_id == transfer_id => break request,
                _ => continue,
            }
        };
        assert_eq!(resumed_request.first_chunk_index, 2);

        // Deliver the remaining chunk the resumed request asked for; the
        // rebuilt `IncomingTransfer` must accept it and finalize with the
        // correct whole-file hash, not reject it as an unknown transfer.
        let last_index = resumed_request.first_chunk_index;
        let data = chunk_data[last_index as usize].clone();
        let chunk_hash = sha256(&data);
        engine_b2
            .handle_file_chunk(
                peer_id_a.clone(),
                FileChunk {
                    transfer_id: transfer_id.clone(),
                    chunk_index: last_index,
                    data,
                    chunk_hash,
                },
            )
            .await
            .unwrap();

        let completion = loop {
            match transfer_events_b2.recv().await.unwrap() {
                TransferEvent::Completed { success, detail, .. } => break (success, detail),
                _ => continue,
            }
        };
        assert!(completion.0, "resumed transfer should succeed: {}", completion.1);

        let final_path = inbox_dir_b.path().join("resume.bin");
        let received = tokio::fs::read(&final_path).await.unwrap();
        assert_eq!(received, full_contents);

        let _ = manager_a;
    }
}
