//! Ranged downloads.
//!
//! Unlinked files are fetched from the account's base domain with client id
//! and token; linked files go through the public download host after their
//! URI passed the prefix check. Every request carries an inclusive `Range`, a
//! reply without partial content is an error unless the whole object was
//! asked for, and every wait (headers or next body chunk) is bounded by the
//! read timeout.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument};

use crate::api::get_request;
use crate::crypt::{CryptKey, FileCryptMeta, SectorCipher};
use crate::error::{TransferError, TransferResult};
use crate::file::FileHandle;
use crate::http::{BodyStream, HttpRequest};
use crate::session::Session;
use crate::shard::PublicBaseUrlSet;

/// Inclusive byte range `[start, end]`; an open end means "to the last byte".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte.
    pub start: u64,
    /// Last byte, inclusive.
    pub end: Option<u64>,
}

impl ByteRange {
    /// Range `[start, end]`.
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// Range from `start` to the last byte.
    pub fn starting_at(start: u64) -> Self {
        Self { start, end: None }
    }

    /// The whole object of `size` bytes.
    pub fn whole(size: u64) -> Self {
        match size {
            0 => Self::starting_at(0),
            size => Self::new(0, size - 1),
        }
    }

    /// `Range` header value.
    pub fn header(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }

    /// Number of bytes, if the end is known.
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end - self.start + 1)
    }

    /// Reject empty ranges and ranges past the end of an object of `size` bytes.
    pub fn check(&self, size: Option<u64>) -> TransferResult<()> {
        let end = self.end.unwrap_or(self.start);
        let invalid = end < self.start || size.map(|s| end >= s).unwrap_or(false);
        if invalid {
            return Err(TransferError::InvalidRange {
                start: self.start,
                end,
                size: size.unwrap_or(0),
            });
        }
        Ok(())
    }

    fn covers_whole(&self, size: Option<u64>) -> bool {
        self.start == 0
            && match (self.end, size) {
                (None, _) => true,
                (Some(end), Some(size)) => end + 1 == size,
                (Some(_), None) => false,
            }
    }
}

/// Authenticated ranged GET for `path`.
pub fn download_request(session: &Session, path: &str, range: &ByteRange) -> HttpRequest {
    get_request(session, path).header("Range", range.header())
}

/// Unauthenticated ranged GET for a resolved public download URL.
pub fn public_download_request(session: &Session, url: &str, range: &ByteRange) -> HttpRequest {
    HttpRequest::get(url)
        .header("Range", range.header())
        .header("Accept-Ranges", "bytes")
        .header("User-Agent", session.settings().user_agent.as_str())
}

fn parse_content_range_end(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes ")?;
    let (range, _total) = rest.split_once('/')?;
    let (_start, end) = range.split_once('-')?;
    end.trim().parse().ok()
}

/// A readable body for one ranged request.
pub struct RangeDownloadStream {
    body: BodyStream,
    start: u64,
    expected: Option<u64>,
    received: u64,
    read_timeout: Duration,
    done: bool,
}

impl std::fmt::Debug for RangeDownloadStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeDownloadStream")
            .field("start", &self.start)
            .field("expected", &self.expected)
            .field("received", &self.received)
            .finish_non_exhaustive()
    }
}

impl RangeDownloadStream {
    /// Open `range` of `handle`, choosing the linked or unlinked source.
    ///
    /// Linked files need the account's public bases.
    pub async fn open(
        session: &Session,
        handle: &FileHandle,
        range: ByteRange,
        bases: Option<&PublicBaseUrlSet>,
        read_timeout: Duration,
    ) -> TransferResult<Self> {
        let size = Some(handle.on_wire_size());
        match (&handle.link, bases) {
            (Some(link), Some(bases)) => {
                Self::open_linked(session, bases, &link.uri, range, size, read_timeout).await
            }
            (Some(_), None) => Err(TransferError::Resolution {
                reason: format!("no public bases resolved for linked file {}", handle.path),
            }),
            (None, _) => {
                Self::open_unlinked(session, &handle.path, range, size, read_timeout).await
            }
        }
    }

    /// Open `range` of the account file at `path`.
    #[instrument(skip(session, read_timeout))]
    pub async fn open_unlinked(
        session: &Session,
        path: &str,
        range: ByteRange,
        size: Option<u64>,
        read_timeout: Duration,
    ) -> TransferResult<Self> {
        range.check(size)?;
        let request = download_request(session, path, &range);
        Self::send(session, request, range, size, read_timeout).await
    }

    /// Open `range` of the public link `uri`.
    ///
    /// The link is validated against `bases` before any request is made.
    #[instrument(skip(session, bases, read_timeout))]
    pub async fn open_linked(
        session: &Session,
        bases: &PublicBaseUrlSet,
        uri: &str,
        range: ByteRange,
        size: Option<u64>,
        read_timeout: Duration,
    ) -> TransferResult<Self> {
        let url = bases.resolve_link(uri)?;
        range.check(size)?;
        let request = public_download_request(session, &url, &range);
        Self::send(session, request, range, size, read_timeout).await
    }

    async fn send(
        session: &Session,
        request: HttpRequest,
        range: ByteRange,
        size: Option<u64>,
        read_timeout: Duration,
    ) -> TransferResult<Self> {
        let timeout_secs = read_timeout.as_secs();
        let response = tokio::time::timeout(read_timeout, session.transport().send(request))
            .await
            .map_err(|_| TransferError::Timeout {
                offset: range.start,
                timeout_secs,
            })?
            .map_err(|e| TransferError::from_transport(e, range.start, timeout_secs))?;

        let expected = match response.status {
            206 => range.len().or_else(|| {
                response
                    .header("Content-Range")
                    .and_then(parse_content_range_end)
                    .map(|end| end - range.start + 1)
            }),
            200 if range.covers_whole(size) => size,
            200 => return Err(TransferError::RangeNotSupported { status: 200 }),
            status if (200..300).contains(&status) => {
                return Err(TransferError::RangeNotSupported { status })
            }
            status => {
                return Err(TransferError::HttpStatus {
                    status,
                    offset: range.start,
                })
            }
        };
        debug!(status = response.status, ?expected, "range response");
        Ok(Self {
            body: response.body,
            start: range.start,
            expected,
            received: 0,
            read_timeout,
            done: false,
        })
    }

    /// Bytes received so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Next piece of the body, `None` once the range is complete.
    pub async fn next_chunk(&mut self) -> TransferResult<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        let offset = self.start + self.received;
        let timeout_secs = self.read_timeout.as_secs();
        let next = tokio::time::timeout(self.read_timeout, self.body.next())
            .await
            .map_err(|_| TransferError::Timeout {
                offset,
                timeout_secs,
            })?;
        match next {
            Some(Ok(chunk)) => {
                self.received += chunk.len() as u64;
                if let Some(expected) = self.expected {
                    if self.received > expected {
                        return Err(TransferError::LengthMismatch {
                            declared: expected,
                            actual: self.received,
                        });
                    }
                }
                Ok(Some(chunk))
            }
            Some(Err(e)) => Err(TransferError::from_transport(e, offset, timeout_secs)),
            None => {
                self.done = true;
                if let Some(expected) = self.expected {
                    if self.received != expected {
                        return Err(TransferError::LengthMismatch {
                            declared: expected,
                            actual: self.received,
                        });
                    }
                }
                Ok(None)
            }
        }
    }

    /// Collect the rest of the range.
    pub async fn read_to_end(&mut self) -> TransferResult<Bytes> {
        let mut buf = BytesMut::with_capacity(self.expected.unwrap_or(0).min(64 << 20) as usize);
        while let Some(chunk) = self.next_chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Stream the rest of the range into `writer`; returns the byte count.
    pub async fn copy_to<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> TransferResult<u64> {
        let mut total = 0;
        while let Some(chunk) = self.next_chunk().await? {
            writer.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        writer.flush().await?;
        Ok(total)
    }
}

/// Reads plaintext ranges of an encrypted file.
///
/// A plaintext range is widened to whole sectors, fetched with one ranged
/// request, decrypted and trimmed; alignment padding is never returned.
pub struct DecryptingRangeReader {
    cipher: SectorCipher,
    meta: FileCryptMeta,
}

impl std::fmt::Debug for DecryptingRangeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptingRangeReader")
            .field("plain_size", &self.meta.plain_size)
            .finish_non_exhaustive()
    }
}

impl DecryptingRangeReader {
    /// Reader for a file encrypted with `key` and described by `meta`.
    pub fn new(key: &CryptKey, meta: &FileCryptMeta) -> TransferResult<Self> {
        Ok(Self {
            cipher: SectorCipher::new(key, meta)?,
            meta: meta.clone(),
        })
    }

    /// On-wire range holding plaintext bytes `[start, end]` and the first sector index.
    pub fn wire_range(&self, start: u64, end: u64) -> (ByteRange, u64) {
        let sector = self.cipher.sector_size() as u64;
        let first = start / sector;
        let last = end / sector;
        (
            ByteRange::new(first * sector, (last + 1) * sector - 1),
            first,
        )
    }

    /// Plaintext bytes `[start, end]` of `handle`.
    pub async fn read(
        &self,
        session: &Session,
        handle: &FileHandle,
        bases: Option<&PublicBaseUrlSet>,
        start: u64,
        end: u64,
        read_timeout: Duration,
    ) -> TransferResult<Bytes> {
        if end < start || end >= self.meta.plain_size {
            return Err(TransferError::InvalidRange {
                start,
                end,
                size: self.meta.plain_size,
            });
        }
        let (wire, first_sector) = self.wire_range(start, end);
        let mut stream = RangeDownloadStream::open(session, handle, wire, bases, read_timeout).await?;
        let mut data = stream.read_to_end().await?.to_vec();
        self.cipher.decrypt_sectors(&mut data, first_sector)?;
        let skip = (start - wire.start) as usize;
        let take = (end - start + 1) as usize;
        debug!(start, end, sectors = data.len() / self.cipher.sector_size(), "decrypted range");
        Ok(Bytes::copy_from_slice(&data[skip..skip + take]))
    }
}
