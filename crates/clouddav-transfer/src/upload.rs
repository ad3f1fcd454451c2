//! Chunked upload stream.
//!
//! One writable stream over N sequential chunk requests. The total on-wire
//! length is fixed when the stream is opened; writes of any size are buffered
//! and flushed along chunk boundaries of the shard's maximum chunk size. Only
//! one chunk is ever in flight per stream.
//!
//! State machine: `Open -> Writing -> Committing -> Done`, and `Failed` from
//! any non-terminal state. A chunk send that is cancelled half-way leaves the
//! stream `Failed`; there is no resume.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use crate::api::CloudApi;
use crate::error::{TransferError, TransferResult};
use crate::file::{escape_path, FileHandle};
use crate::hash::{CloudHasher, ContentDigest};
use crate::http::HttpRequest;
use crate::session::Session;
use crate::shard::ShardTarget;

/// Lifecycle of an upload stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Created, nothing written yet.
    Open,
    /// Accepting writes.
    Writing,
    /// All bytes sent; waiting for the final acknowledgement and the commit.
    Committing,
    /// Committed.
    Done,
    /// Terminated by an error or cancellation.
    Failed,
}

/// Byte range `[start, end)` of one chunk within the on-wire stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    /// Zero-based chunk number.
    pub index: u64,
    /// First byte.
    pub start: u64,
    /// One past the last byte.
    pub end: u64,
}

impl ChunkDescriptor {
    /// Chunk length in bytes.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// True for a zero-length chunk.
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// `Content-Range` value announcing this chunk and the total.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end - 1, total)
    }
}

/// Chunk boundaries for `total` bytes with at most `max_chunk_size` per chunk.
pub fn plan_chunks(total: u64, max_chunk_size: u64) -> Vec<ChunkDescriptor> {
    let max = max_chunk_size.max(1);
    let mut chunks = Vec::with_capacity(total.div_ceil(max) as usize);
    let mut start = 0;
    while start < total {
        let end = (start + max).min(total);
        chunks.push(ChunkDescriptor {
            index: chunks.len() as u64,
            start,
            end,
        });
        start = end;
    }
    chunks
}

/// PUT request carrying one chunk.
pub fn chunk_request(
    session: &Session,
    shard: &ShardTarget,
    destination: &str,
    chunk: &ChunkDescriptor,
    total: u64,
    body: Bytes,
) -> HttpRequest {
    let settings = session.settings();
    let base = settings.base_domain.trim_end_matches('/');
    let parent = crate::file::parent_of(destination);
    let token = session.access_token().unwrap_or_default();
    HttpRequest::put(shard.upload_url.as_str())
        .query(&[
            ("cloud_domain", "2"),
            ("x-email", session.login()),
            ("token", token.as_str()),
        ])
        .header("Content-Range", chunk.content_range(total))
        .header("X-Upload-Length", total.to_string())
        .header("Origin", base)
        .header("Referer", format!("{}/home{}", base, escape_path(parent)))
        .header("User-Agent", settings.user_agent.as_str())
        .body(body)
}

/// Completion signals of one upload, each resolved at most once.
///
/// A dropped sender (the receiver yields an error) means the stage never
/// completed: the upload failed or was abandoned.
#[derive(Debug)]
pub struct UploadSignals {
    /// Resolves with the on-wire byte count once every byte was handed over
    /// and the final acknowledgement checked.
    pub sent: oneshot::Receiver<u64>,
    /// Resolves with the final server path once the backend committed the file.
    pub processed: oneshot::Receiver<String>,
}

/// Outcome of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Final server path.
    pub path: String,
    /// Digest of the on-wire content.
    pub digest: ContentDigest,
    /// Plaintext size.
    pub plain_size: u64,
    /// Bytes stored on the backend.
    pub wire_size: u64,
    /// Chunk requests issued.
    pub chunks: u64,
    /// True if no bytes were transferred because the content already existed.
    pub deduplicated: bool,
}

/// A writable upload stream.
#[async_trait]
pub trait UploadSink: Send {
    /// Append bytes.
    async fn write(&mut self, data: &[u8]) -> TransferResult<()>;
    /// Flush, wait for the backend and commit.
    async fn finish(&mut self) -> TransferResult<UploadReceipt>;
    /// Take the completion signals; `None` after the first call.
    fn take_signals(&mut self) -> Option<UploadSignals>;
    /// Current state.
    fn state(&self) -> UploadState;
    /// Number of bytes the caller must write.
    fn declared_size(&self) -> u64;
}

/// Chunked upload of a known number of on-wire bytes to one shard.
pub struct ChunkedUploadStream {
    session: Arc<Session>,
    api: CloudApi,
    shard: ShardTarget,
    handle: FileHandle,
    total: u64,
    timeout: Duration,
    state: UploadState,
    buffer: BytesMut,
    offset: u64,
    written: u64,
    chunks: u64,
    hasher: CloudHasher,
    server_digest: Option<String>,
    sent_tx: Option<oneshot::Sender<u64>>,
    processed_tx: Option<oneshot::Sender<String>>,
    signals: Option<UploadSignals>,
}

impl std::fmt::Debug for ChunkedUploadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedUploadStream")
            .field("path", &self.handle.path)
            .field("state", &self.state)
            .field("total", &self.total)
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

impl ChunkedUploadStream {
    /// Open a stream sending `handle.on_wire_size()` bytes to `shard`.
    pub fn new(
        session: Arc<Session>,
        api: CloudApi,
        shard: ShardTarget,
        handle: FileHandle,
        timeout: Duration,
    ) -> Self {
        let total = handle.on_wire_size();
        let (sent_tx, sent) = oneshot::channel();
        let (processed_tx, processed) = oneshot::channel();
        let capacity = shard.max_chunk_size.min(total).max(1) as usize;
        debug!(path = %handle.path, total, max_chunk = shard.max_chunk_size, "opening upload stream");
        Self {
            session,
            api,
            shard,
            handle,
            total,
            timeout,
            state: UploadState::Open,
            buffer: BytesMut::with_capacity(capacity),
            offset: 0,
            written: 0,
            chunks: 0,
            hasher: CloudHasher::new(),
            server_digest: None,
            sent_tx: Some(sent_tx),
            processed_tx: Some(processed_tx),
            signals: Some(UploadSignals { sent, processed }),
        }
    }

    /// Destination file.
    pub fn handle(&self) -> &FileHandle {
        &self.handle
    }

    /// Bytes already handed to the transport.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn current_chunk_len(&self) -> u64 {
        self.shard.max_chunk_size.max(1).min(self.total - self.offset)
    }

    fn fail(&mut self, err: TransferError) -> TransferError {
        warn!(path = %self.handle.path, offset = self.offset, error = %err, "upload failed");
        self.state = UploadState::Failed;
        self.sent_tx = None;
        self.processed_tx = None;
        self.buffer.clear();
        err
    }

    fn ensure_writable(&self) -> TransferResult<()> {
        match self.state {
            UploadState::Open | UploadState::Writing => Ok(()),
            other => Err(TransferError::InvalidState(format!(
                "upload stream is {:?}",
                other
            ))),
        }
    }

    async fn flush_chunk(&mut self) -> TransferResult<()> {
        let body = self.buffer.split().freeze();
        let chunk = ChunkDescriptor {
            index: self.chunks,
            start: self.offset,
            end: self.offset + body.len() as u64,
        };
        let request = chunk_request(
            &self.session,
            &self.shard,
            &self.handle.path,
            &chunk,
            self.total,
            body,
        )
        .timeout(self.timeout);
        let timeout_secs = self.timeout.as_secs();

        // Stays Failed if this future is dropped mid-send.
        self.state = UploadState::Failed;
        let response = tokio::time::timeout(self.timeout, self.session.transport().send(request))
            .await
            .map_err(|_| TransferError::Timeout {
                offset: chunk.start,
                timeout_secs,
            })?
            .map_err(|e| TransferError::from_transport(e, chunk.start, timeout_secs))?;
        if !response.is_success() {
            return Err(TransferError::HttpStatus {
                status: response.status,
                offset: chunk.start,
            });
        }
        if chunk.end == self.total {
            let body = tokio::time::timeout(self.timeout, response.bytes())
                .await
                .map_err(|_| TransferError::Timeout {
                    offset: chunk.start,
                    timeout_secs,
                })?
                .map_err(|e| TransferError::from_transport(e, chunk.start, timeout_secs))?;
            let echoed = String::from_utf8_lossy(&body).trim().to_string();
            if !echoed.is_empty() {
                self.server_digest = Some(echoed);
            }
        }

        debug!(
            path = %self.handle.path,
            chunk = chunk.index,
            start = chunk.start,
            len = chunk.len(),
            "chunk accepted"
        );
        self.offset = chunk.end;
        self.chunks += 1;
        self.state = UploadState::Writing;
        Ok(())
    }

    async fn write_inner(&mut self, data: &[u8]) -> TransferResult<()> {
        let attempted = self.written + data.len() as u64;
        if attempted > self.total {
            return Err(TransferError::LengthMismatch {
                declared: self.total,
                actual: attempted,
            });
        }
        self.state = UploadState::Writing;
        let mut rest = data;
        while !rest.is_empty() {
            let want = self.current_chunk_len() as usize - self.buffer.len();
            let take = want.min(rest.len());
            self.buffer.extend_from_slice(&rest[..take]);
            self.hasher.update(&rest[..take]);
            self.written += take as u64;
            rest = &rest[take..];
            if self.buffer.len() as u64 == self.current_chunk_len() {
                self.flush_chunk().await?;
            }
        }
        Ok(())
    }

    async fn finish_inner(&mut self) -> TransferResult<UploadReceipt> {
        if self.written != self.total {
            return Err(TransferError::LengthMismatch {
                declared: self.total,
                actual: self.written,
            });
        }
        self.state = UploadState::Committing;

        let local = std::mem::take(&mut self.hasher).finalize();
        if let Some(server) = self.server_digest.take() {
            let matches = ContentDigest::from_hex(&server)
                .map(|d| d == local)
                .unwrap_or(false);
            if !matches {
                return Err(TransferError::DigestMismatch {
                    local: local.to_hex(),
                    server,
                });
            }
        }
        if let Some(tx) = self.sent_tx.take() {
            let _ = tx.send(self.total);
        }

        let path = self
            .api
            .add_file(
                &self.session,
                &self.handle.path,
                &local,
                self.total,
                self.handle.crypt.as_ref(),
            )
            .await?;
        if let Some(tx) = self.processed_tx.take() {
            let _ = tx.send(path.clone());
        }
        self.state = UploadState::Done;
        self.handle.digest = Some(local);
        info!(%path, size = self.total, chunks = self.chunks, "upload committed");
        Ok(UploadReceipt {
            path,
            digest: local,
            plain_size: self.handle.original_size,
            wire_size: self.total,
            chunks: self.chunks,
            deduplicated: false,
        })
    }
}

#[async_trait]
impl UploadSink for ChunkedUploadStream {
    async fn write(&mut self, data: &[u8]) -> TransferResult<()> {
        self.ensure_writable()?;
        match self.write_inner(data).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    #[instrument(skip(self), fields(path = %self.handle.path, total = self.total))]
    async fn finish(&mut self) -> TransferResult<UploadReceipt> {
        self.ensure_writable()?;
        match self.finish_inner().await {
            Ok(receipt) => Ok(receipt),
            Err(err) => Err(self.fail(err)),
        }
    }

    fn take_signals(&mut self) -> Option<UploadSignals> {
        self.signals.take()
    }

    fn state(&self) -> UploadState {
        self.state
    }

    fn declared_size(&self) -> u64 {
        self.total
    }
}
