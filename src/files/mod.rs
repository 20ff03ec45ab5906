//! File-transfer adapter.
//!
//! Splits a file into fixed 1 MiB chunks, stamps the whole-file
//! SHA-256 into the metadata and a per-chunk SHA-256 into every
//! payload, and pushes chunks through a [`ChunkSink`] with bounded
//! concurrency and per-chunk retries. The sink is the per-chunk
//! crypto path (the session fans chunks out as `type: "file"`
//! envelopes); the bookkeeping above it lives here.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tracing::{debug, warn};

use crate::error::Fault;
use crate::protocol::{EnvelopeKind, FilePayload, MessageContent};
use crate::session::Core;

/// Fixed chunk size.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// At most this many chunks are in flight at once.
pub const MAX_CONCURRENT_CHUNKS: usize = 3;

/// Send attempts per chunk before the upload goes to `Failed`.
const CHUNK_ATTEMPTS: u32 = 3;

/// Where chunks go. The session implements this over the ratchet
/// path; tests use an in-memory sink. A successful return is the
/// chunk's acknowledgement.
pub trait ChunkSink: Clone + Send + Sync + 'static {
    fn put_chunk(&self, chunk: FilePayload) -> impl Future<Output = Result<(), Fault>> + Send;
}

impl ChunkSink for Core {
    fn put_chunk(&self, chunk: FilePayload) -> impl Future<Output = Result<(), Fault>> + Send {
        async move {
            self.send_content(MessageContent::File(chunk), Some(EnvelopeKind::File))
                .await
                .map(|_| ())
        }
    }
}

/// Metadata returned by `upload` and echoed in events.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub file_id: String,
    pub filename: String,
    pub size: u64,
    /// SHA-256 of the whole file, hex.
    pub checksum: String,
    pub total_chunks: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Active,
    Completed,
    Failed,
    Cancelled,
}

/// Progress surface for the host, one event stream per adapter.
#[derive(Debug)]
pub enum TransferEvent {
    Progress {
        file_id: String,
        chunks_done: u32,
        total_chunks: u32,
    },
    Completed { file_id: String },
    Failed { file_id: String, reason: String },
    Cancelled { file_id: String },
}

struct Chunk {
    data: Vec<u8>,
    checksum: String,
    acked: bool,
}

struct Transfer {
    meta: FileMeta,
    chunks: Vec<Chunk>,
    state: TransferState,
    cancel: Arc<AtomicBool>,
}

/// Upload bookkeeping over some chunk sink.
pub struct FileTransfer<S: ChunkSink> {
    sink: S,
    events: mpsc::UnboundedSender<TransferEvent>,
    transfers: Arc<Mutex<HashMap<String, Transfer>>>,
}

impl<S: ChunkSink> FileTransfer<S> {
    pub fn new(sink: S) -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                sink,
                events,
                transfers: Arc::new(Mutex::new(HashMap::new())),
            },
            events_rx,
        )
    }

    /// Read and chunk the file, then start pushing. Returns the
    /// metadata immediately; progress and the outcome arrive as
    /// events.
    pub async fn upload(&self, path: &Path) -> Result<FileMeta, Fault> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| Fault::Usage(format!("cannot read {}: {e}", path.display())))?;
        let filename = path
            .file_name()
            .ok_or_else(|| Fault::Usage(format!("not a file path: {}", path.display())))?
            .to_string_lossy()
            .to_string();

        let checksum = hex::encode(Sha256::digest(&data));
        let chunks: Vec<Chunk> = data
            .chunks(CHUNK_SIZE)
            .map(|piece| Chunk {
                checksum: hex::encode(Sha256::digest(piece)),
                data: piece.to_vec(),
                acked: false,
            })
            .collect();
        let total_chunks = chunks.len() as u32;

        let meta = FileMeta {
            file_id: generate_file_id(),
            filename,
            size: data.len() as u64,
            checksum,
            total_chunks,
        };

        let transfer = Transfer {
            meta: meta.clone(),
            chunks,
            state: TransferState::Active,
            cancel: Arc::new(AtomicBool::new(false)),
        };
        self.transfers
            .lock()
            .await
            .insert(meta.file_id.clone(), transfer);

        self.drive(meta.file_id.clone());
        Ok(meta)
    }

    /// Stop an active upload. Chunks already in flight finish their
    /// current attempt; nothing new starts.
    pub async fn cancel(&self, file_id: &str) -> Result<(), Fault> {
        let mut transfers = self.transfers.lock().await;
        let transfer = transfers
            .get_mut(file_id)
            .ok_or_else(|| Fault::Usage(format!("unknown transfer {file_id}")))?;
        if transfer.state == TransferState::Completed {
            return Err(Fault::Usage("transfer already completed".into()));
        }
        transfer.cancel.store(true, Ordering::Relaxed);
        transfer.state = TransferState::Cancelled;
        let _ = self.events.send(TransferEvent::Cancelled {
            file_id: file_id.to_string(),
        });
        Ok(())
    }

    /// Restart a failed or cancelled upload; only unacknowledged
    /// chunks are sent again.
    pub async fn resume(&self, file_id: &str) -> Result<(), Fault> {
        {
            let mut transfers = self.transfers.lock().await;
            let transfer = transfers
                .get_mut(file_id)
                .ok_or_else(|| Fault::Usage(format!("unknown transfer {file_id}")))?;
            match transfer.state {
                TransferState::Failed | TransferState::Cancelled => {}
                TransferState::Active => {
                    return Err(Fault::Usage("transfer is still active".into()))
                }
                TransferState::Completed => {
                    return Err(Fault::Usage("transfer already completed".into()))
                }
            }
            transfer.state = TransferState::Active;
            transfer.cancel = Arc::new(AtomicBool::new(false));
        }
        self.drive(file_id.to_string());
        Ok(())
    }

    pub async fn state(&self, file_id: &str) -> Option<TransferState> {
        self.transfers.lock().await.get(file_id).map(|t| t.state)
    }

    /// Spawn the pusher for every pending chunk of one transfer.
    fn drive(&self, file_id: String) {
        let sink = self.sink.clone();
        let events = self.events.clone();
        let transfers = self.transfers.clone();

        tokio::spawn(async move {
            let (meta, pending, cancel) = {
                let transfers = transfers.lock().await;
                let Some(transfer) = transfers.get(&file_id) else {
                    return;
                };
                let pending: Vec<u32> = transfer
                    .chunks
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| !c.acked)
                    .map(|(i, _)| i as u32)
                    .collect();
                (transfer.meta.clone(), pending, transfer.cancel.clone())
            };

            let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_CHUNKS));
            let failed = Arc::new(AtomicBool::new(false));
            let mut workers = Vec::new();

            for index in pending {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                if cancel.load(Ordering::Relaxed) || failed.load(Ordering::Relaxed) {
                    break;
                }

                let payload = {
                    let transfers = transfers.lock().await;
                    let Some(transfer) = transfers.get(&file_id) else {
                        return;
                    };
                    chunk_payload(&transfer.meta, &transfer.chunks[index as usize], index)
                };

                let sink = sink.clone();
                let events = events.clone();
                let transfers = transfers.clone();
                let cancel = cancel.clone();
                let failed_flag = failed.clone();
                let file_id = file_id.clone();
                workers.push(tokio::spawn(async move {
                    let _permit = permit;
                    if !push_chunk(&sink, payload, &cancel).await {
                        failed_flag.store(true, Ordering::Relaxed);
                        return;
                    }
                    let mut transfers = transfers.lock().await;
                    let Some(transfer) = transfers.get_mut(&file_id) else {
                        return;
                    };
                    transfer.chunks[index as usize].acked = true;
                    let chunks_done =
                        transfer.chunks.iter().filter(|c| c.acked).count() as u32;
                    let _ = events.send(TransferEvent::Progress {
                        file_id: file_id.clone(),
                        chunks_done,
                        total_chunks: transfer.meta.total_chunks,
                    });
                }));
            }

            for worker in workers {
                let _ = worker.await;
            }

            finalize(&transfers, &events, &file_id, &failed).await;
            debug!(file_id = %file_id, filename = %meta.filename, "transfer driver done");
        });
    }
}

/// One chunk, with retries. Returns false once the attempts are
/// exhausted or the transfer was cancelled under it.
async fn push_chunk<S: ChunkSink>(
    sink: &S,
    payload: FilePayload,
    cancel: &Arc<AtomicBool>,
) -> bool {
    for attempt in 1..=CHUNK_ATTEMPTS {
        if cancel.load(Ordering::Relaxed) {
            return false;
        }
        match sink.put_chunk(payload.clone()).await {
            Ok(()) => return true,
            Err(e) => {
                warn!(
                    file_id = %payload.file_id,
                    index = payload.index,
                    attempt,
                    "chunk send failed: {e}"
                );
            }
        }
    }
    false
}

/// Settle the transfer's final state after the drive pass.
async fn finalize(
    transfers: &Arc<Mutex<HashMap<String, Transfer>>>,
    events: &mpsc::UnboundedSender<TransferEvent>,
    file_id: &str,
    failed: &Arc<AtomicBool>,
) {
    let mut transfers = transfers.lock().await;
    let Some(transfer) = transfers.get_mut(file_id) else {
        return;
    };
    if transfer.state == TransferState::Cancelled {
        return;
    }
    if transfer.chunks.iter().all(|c| c.acked) {
        transfer.state = TransferState::Completed;
        let _ = events.send(TransferEvent::Completed {
            file_id: file_id.to_string(),
        });
    } else if failed.load(Ordering::Relaxed) {
        transfer.state = TransferState::Failed;
        let _ = events.send(TransferEvent::Failed {
            file_id: file_id.to_string(),
            reason: "chunk retries exhausted".into(),
        });
    }
}

/// Offer metadata rides on chunk 0 only; every chunk carries its own
/// digest and position.
fn chunk_payload(meta: &FileMeta, chunk: &Chunk, index: u32) -> FilePayload {
    let first = index == 0;
    FilePayload {
        file_id: meta.file_id.clone(),
        filename: first.then(|| meta.filename.clone()),
        size: first.then_some(meta.size),
        checksum: first.then(|| meta.checksum.clone()),
        index,
        total: meta.total_chunks,
        chunk_checksum: chunk.checksum.clone(),
        data: chunk.data.clone(),
    }
}

fn generate_file_id() -> String {
    let bytes: Vec<u8> = (0..8).map(|_| rand::thread_rng().gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::AtomicU32;

    /// Collects chunks; can be told to fail the first N puts.
    #[derive(Clone, Default)]
    struct MemorySink {
        chunks: Arc<std::sync::Mutex<Vec<FilePayload>>>,
        fail_next: Arc<AtomicU32>,
        delay_ms: u64,
    }

    impl ChunkSink for MemorySink {
        fn put_chunk(
            &self,
            chunk: FilePayload,
        ) -> impl Future<Output = Result<(), Fault>> + Send {
            let sink = self.clone();
            async move {
                if sink.delay_ms > 0 {
                    tokio::time::sleep(tokio::time::Duration::from_millis(sink.delay_ms)).await;
                }
                let remaining = sink.fail_next.load(Ordering::Relaxed);
                if remaining > 0 {
                    sink.fail_next.store(remaining - 1, Ordering::Relaxed);
                    return Err(Fault::Transport("injected failure".into()));
                }
                sink.chunks.lock().unwrap().push(chunk);
                Ok(())
            }
        }
    }

    fn temp_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    async fn wait_for_terminal(
        events: &mut mpsc::UnboundedReceiver<TransferEvent>,
    ) -> TransferEvent {
        while let Some(event) = events.recv().await {
            match event {
                TransferEvent::Progress { .. } => continue,
                terminal => return terminal,
            }
        }
        panic!("event stream closed before a terminal event");
    }

    #[tokio::test]
    async fn small_file_uploads_whole() {
        let file = temp_file(b"tiny payload");
        let sink = MemorySink::default();
        let (transfer, mut events) = FileTransfer::new(sink.clone());

        let meta = transfer.upload(file.path()).await.unwrap();
        assert_eq!(meta.total_chunks, 1);
        assert_eq!(meta.size, 12);
        assert_eq!(meta.checksum, hex::encode(Sha256::digest(b"tiny payload")));

        match wait_for_terminal(&mut events).await {
            TransferEvent::Completed { file_id } => assert_eq!(file_id, meta.file_id),
            other => panic!("expected completion, got {other:?}"),
        }

        let chunks = sink.chunks.lock().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].filename.as_deref(), Some(meta.filename.as_str()));
        assert_eq!(chunks[0].data, b"tiny payload");
        assert_eq!(
            transfer.state(&meta.file_id).await,
            Some(TransferState::Completed)
        );
    }

    #[tokio::test]
    async fn large_file_chunks_and_reassembles() {
        // 2.5 MiB: two full chunks and a partial tail.
        let contents: Vec<u8> = (0..(2 * CHUNK_SIZE + CHUNK_SIZE / 2))
            .map(|i| (i % 251) as u8)
            .collect();
        let file = temp_file(&contents);
        let sink = MemorySink::default();
        let (transfer, mut events) = FileTransfer::new(sink.clone());

        let meta = transfer.upload(file.path()).await.unwrap();
        assert_eq!(meta.total_chunks, 3);

        match wait_for_terminal(&mut events).await {
            TransferEvent::Completed { .. } => {}
            other => panic!("expected completion, got {other:?}"),
        }

        let mut chunks = sink.chunks.lock().unwrap().clone();
        chunks.sort_by_key(|c| c.index);
        assert_eq!(chunks.len(), 3);
        // Offer metadata only on the first chunk.
        assert!(chunks[0].filename.is_some());
        assert!(chunks[1].filename.is_none());
        // Per-chunk digests match the data that was sent.
        for chunk in &chunks {
            assert_eq!(chunk.chunk_checksum, hex::encode(Sha256::digest(&chunk.data)));
            assert_eq!(chunk.total, 3);
        }
        let reassembled: Vec<u8> = chunks.iter().flat_map(|c| c.data.clone()).collect();
        assert_eq!(reassembled, contents);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let file = temp_file(&vec![7u8; 1000]);
        let sink = MemorySink::default();
        // Two failures, then success: within the per-chunk budget.
        sink.fail_next.store(2, Ordering::Relaxed);
        let (transfer, mut events) = FileTransfer::new(sink.clone());

        let meta = transfer.upload(file.path()).await.unwrap();
        match wait_for_terminal(&mut events).await {
            TransferEvent::Completed { file_id } => assert_eq!(file_id, meta.file_id),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_retries_fail_then_resume_sends_missing_only() {
        let contents: Vec<u8> = vec![3u8; CHUNK_SIZE + 10];
        let file = temp_file(&contents);
        let sink = MemorySink::default();
        // Enough injected failures to exhaust one chunk's attempts.
        sink.fail_next.store(CHUNK_ATTEMPTS + 3, Ordering::Relaxed);
        let (transfer, mut events) = FileTransfer::new(sink.clone());

        let meta = transfer.upload(file.path()).await.unwrap();
        match wait_for_terminal(&mut events).await {
            TransferEvent::Failed { file_id, .. } => assert_eq!(file_id, meta.file_id),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(
            transfer.state(&meta.file_id).await,
            Some(TransferState::Failed)
        );

        let delivered_before = sink.chunks.lock().unwrap().len();
        assert!(delivered_before < meta.total_chunks as usize);

        sink.fail_next.store(0, Ordering::Relaxed);
        transfer.resume(&meta.file_id).await.unwrap();
        match wait_for_terminal(&mut events).await {
            TransferEvent::Completed { .. } => {}
            other => panic!("expected completion after resume, got {other:?}"),
        }

        // Resume sent only what was missing.
        let chunks = sink.chunks.lock().unwrap();
        assert_eq!(chunks.len(), meta.total_chunks as usize);
        let mut indices: Vec<u32> = chunks.iter().map(|c| c.index).collect();
        indices.sort_unstable();
        indices.dedup();
        assert_eq!(indices.len(), meta.total_chunks as usize);
    }

    #[tokio::test]
    async fn cancel_stops_an_active_transfer() {
        // Twice the concurrency budget, so cancellation lands before
        // the later chunks can start.
        let contents: Vec<u8> = vec![9u8; 6 * CHUNK_SIZE];
        let file = temp_file(&contents);
        let sink = MemorySink {
            delay_ms: 50,
            ..MemorySink::default()
        };
        let (transfer, mut events) = FileTransfer::new(sink.clone());

        let meta = transfer.upload(file.path()).await.unwrap();
        transfer.cancel(&meta.file_id).await.unwrap();

        match wait_for_terminal(&mut events).await {
            TransferEvent::Cancelled { file_id } => assert_eq!(file_id, meta.file_id),
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(
            transfer.state(&meta.file_id).await,
            Some(TransferState::Cancelled)
        );

        // Cancelled transfers resume from where they stopped.
        let sent_before = sink.chunks.lock().unwrap().len();
        assert!(sent_before < meta.total_chunks as usize);
        transfer.resume(&meta.file_id).await.unwrap();
        match wait_for_terminal(&mut events).await {
            TransferEvent::Completed { .. } => {}
            other => panic!("expected completion after resume, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_transfer_is_a_usage_fault() {
        let sink = MemorySink::default();
        let (transfer, _events) = FileTransfer::new(sink);
        assert_eq!(transfer.cancel("nope").await.unwrap_err().kind(), "usage");
        assert_eq!(transfer.resume("nope").await.unwrap_err().kind(), "usage");
    }
}
