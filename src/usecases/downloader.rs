//! Chunk-parallel media downloader.
//!
//! Splits `[0, size)` into fixed chunks, fetches up to `threads` of them in
//! parallel, and streams them to disk strictly in offset order. Out-of-order
//! completions are buffered keyed by offset; in-flight plus buffered chunks
//! never exceed twice the thread count, so memory stays bounded regardless
//! of file size. A data-center migration swaps the shared sender and retries
//! the same chunk without consuming its retry budget.
//!
//! Small files and disabled acceleration degenerate to a single lane over
//! the same engine, so both paths produce byte-identical output and the
//! same progress events.

use crate::domain::{DomainError, FileLocation, Media};
use crate::ports::{FileChunk, FileSender, MediaDownloadPort, TgGateway};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Below this total size parallel fetching buys nothing; one lane is used.
const MIN_PARALLEL_SIZE: u64 = 1024 * 1024;

/// Back-off unit for budgeted retries: `attempt * BASE_BACKOFF`.
const BASE_BACKOFF: Duration = Duration::from_millis(1000);

/// Consecutive migrations on one chunk above this count as budgeted
/// failures. Telegram redirects once in practice.
const MAX_MIGRATIONS_PER_CHUNK: u32 = 3;

/// Downloader knobs, read from `spider.*` configuration.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub accelerate: bool,
    pub chunk_size: usize,
    pub threads: usize,
    pub max_retries: u32,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            accelerate: true,
            chunk_size: 512 * 1024,
            threads: 5,
            max_retries: 3,
        }
    }
}

impl DownloadOptions {
    /// Lane count for a file of `total` bytes, clamped to [1, 8].
    fn effective_threads(&self, total: u64) -> usize {
        if !self.accelerate || total < MIN_PARALLEL_SIZE {
            1
        } else {
            self.threads.clamp(1, 8)
        }
    }
}

/// Shared slot holding the sender for the file's current home DC.
type SenderSlot = Arc<RwLock<Arc<dyn FileSender>>>;

/// A fetched chunk travelling to the ordered writer. The launch-gate permit
/// rides along and is released only once the bytes hit the disk, which is
/// what bounds in-flight + buffered chunks to `2 * threads`.
struct Fetched {
    offset: u64,
    bytes: Vec<u8>,
    _slot: OwnedSemaphorePermit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChunkSpec {
    offset: u64,
    limit: usize,
}

fn plan_chunks(total: u64, chunk_size: u64) -> Vec<ChunkSpec> {
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < total {
        let limit = chunk_size.min(total - offset);
        chunks.push(ChunkSpec {
            offset,
            limit: limit as usize,
        });
        offset += limit;
    }
    chunks
}

/// Fetch one chunk with the retry policy: migrations switch the shared
/// sender and cost nothing; any other failure burns one retry and backs
/// off linearly.
async fn fetch_chunk(
    gateway: &Arc<dyn TgGateway>,
    sender: &SenderSlot,
    location: &FileLocation,
    offset: u64,
    limit: usize,
    max_retries: u32,
) -> Result<Vec<u8>, DomainError> {
    let mut attempt: u32 = 0;
    let mut migrations: u32 = 0;
    loop {
        let current = Arc::clone(&*sender.read().await);
        let failure = match current.get_file(location, offset, limit).await {
            Ok(FileChunk::Bytes(bytes)) => return Ok(bytes),
            Ok(FileChunk::Migrate(dc)) => {
                if migrations < MAX_MIGRATIONS_PER_CHUNK {
                    migrations += 1;
                    match gateway.sender_for(dc).await {
                        Ok(fresh) => {
                            debug!(offset, dc, "file migrated, switching sender");
                            *sender.write().await = fresh;
                            continue;
                        }
                        Err(e) => e,
                    }
                } else {
                    DomainError::Gateway(format!("migration loop towards dc {dc}"))
                }
            }
            Err(e) => e,
        };
        attempt += 1;
        if attempt > max_retries {
            return Err(DomainError::Download {
                offset,
                reason: failure.to_string(),
            });
        }
        warn!(
            offset,
            attempt,
            max_retries,
            error = %failure,
            "chunk fetch failed, backing off"
        );
        sleep(BASE_BACKOFF * attempt).await;
    }
}

/// Chunk-parallel downloader over the RPC facade.
pub struct ChunkedDownloader {
    gateway: Arc<dyn TgGateway>,
    opts: DownloadOptions,
}

impl ChunkedDownloader {
    pub fn new(gateway: Arc<dyn TgGateway>, opts: DownloadOptions) -> Self {
        Self { gateway, opts }
    }

    /// Known total size: plan fixed chunks and fetch them across lanes.
    async fn download_known(
        &self,
        location: &FileLocation,
        sender: &SenderSlot,
        total: u64,
        out: &mut BufWriter<File>,
        on_progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<(), DomainError> {
        let threads = self.opts.effective_threads(total);
        let chunk_size = self.opts.chunk_size.max(1) as u64;
        let chunks = plan_chunks(total, chunk_size);
        debug!(total, chunks = chunks.len(), threads, "starting chunked download");

        let gate = Arc::new(Semaphore::new(threads * 2));
        let lanes = Arc::new(Semaphore::new(threads));
        let (tx, mut rx) = mpsc::channel::<Result<Fetched, DomainError>>(threads * 2);

        let mut tasks = JoinSet::new();
        for chunk in &chunks {
            let gateway = Arc::clone(&self.gateway);
            let sender = Arc::clone(sender);
            let location = location.clone();
            let gate = Arc::clone(&gate);
            let lanes = Arc::clone(&lanes);
            let tx = tx.clone();
            let max_retries = self.opts.max_retries;
            let ChunkSpec { offset, limit } = *chunk;
            tasks.spawn(async move {
                let Ok(slot) = gate.acquire_owned().await else {
                    return;
                };
                let fetched = {
                    let Ok(_lane) = lanes.acquire().await else {
                        return;
                    };
                    fetch_chunk(&gateway, &sender, &location, offset, limit, max_retries).await
                };
                let _ = tx
                    .send(fetched.map(|bytes| Fetched {
                        offset,
                        bytes,
                        _slot: slot,
                    }))
                    .await;
            });
        }
        drop(tx);

        let total_chunks = chunks.len();
        let mut pending: BTreeMap<u64, Fetched> = BTreeMap::new();
        let mut cursor: u64 = 0;
        let mut written = 0usize;
        while written < total_chunks {
            let fetched = match rx.recv().await {
                Some(Ok(f)) => f,
                Some(Err(e)) => {
                    tasks.shutdown().await;
                    return Err(e);
                }
                None => {
                    return Err(DomainError::Download {
                        offset: cursor,
                        reason: "chunk stream ended early".into(),
                    });
                }
            };
            pending.insert(fetched.offset, fetched);
            // Drain every consecutive chunk sitting at the write cursor.
            while let Some(entry) = pending.remove(&cursor) {
                let expected = chunk_size.min(total - cursor);
                if entry.bytes.len() as u64 != expected {
                    tasks.shutdown().await;
                    return Err(DomainError::Download {
                        offset: cursor,
                        reason: format!(
                            "short chunk: got {} bytes, expected {expected}",
                            entry.bytes.len()
                        ),
                    });
                }
                out.write_all(&entry.bytes).await?;
                cursor += expected;
                written += 1;
                drop(entry);
                on_progress(cursor, total);
            }
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    /// Unknown total size: sequential probe until a short or empty read.
    async fn download_probing(
        &self,
        location: &FileLocation,
        sender: &SenderSlot,
        out: &mut BufWriter<File>,
        on_progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<(), DomainError> {
        let chunk_size = self.opts.chunk_size.max(1);
        let mut offset = 0u64;
        loop {
            let bytes = fetch_chunk(
                &self.gateway,
                sender,
                location,
                offset,
                chunk_size,
                self.opts.max_retries,
            )
            .await?;
            if bytes.is_empty() {
                break;
            }
            let len = bytes.len();
            out.write_all(&bytes).await?;
            offset += len as u64;
            on_progress(offset, 0);
            if len < chunk_size {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl MediaDownloadPort for ChunkedDownloader {
    async fn download(
        &self,
        media: &Media,
        dest: &Path,
        on_progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<(), DomainError> {
        let location = media.location();
        let home = self.gateway.sender_for(media.dc_id()).await?;
        let sender: SenderSlot = Arc::new(RwLock::new(home));

        let file = File::create(dest).await?;
        let mut out = BufWriter::new(file);
        match media.size() {
            Some(total) => {
                self.download_known(&location, &sender, total, &mut out, on_progress)
                    .await?
            }
            None => {
                self.download_probing(&location, &sender, &mut out, on_progress)
                    .await?
            }
        }
        out.flush().await?;
        Ok(())
    }
}
