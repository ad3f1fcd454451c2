//! Content digest used for dedup and upload verification.
//!
//! 20 bytes. Objects of at most 20 bytes are their own digest (zero padded);
//! larger objects hash as SHA-1 over `"mrCloud" || content || decimal(size)`.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{TransferError, TransferResult};

/// Digest length in bytes.
pub const DIGEST_LEN: usize = 20;

const PREFIX: &[u8] = b"mrCloud";
const READ_BUF: usize = 64 * 1024;

/// A 20-byte content digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(pub [u8; DIGEST_LEN]);

impl ContentDigest {
    /// Uppercase hex, the form the backend uses.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Parse hex in either case.
    pub fn from_hex(value: &str) -> TransferResult<Self> {
        let bytes = hex::decode(value.trim()).map_err(|e| TransferError::InvalidDigest {
            value: value.to_string(),
            reason: e.to_string(),
        })?;
        let arr: [u8; DIGEST_LEN] = bytes.try_into().map_err(|_| TransferError::InvalidDigest {
            value: value.to_string(),
            reason: format!("not {} bytes", DIGEST_LEN),
        })?;
        Ok(ContentDigest(arr))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Streaming, single-pass digest computation.
#[derive(Clone)]
pub struct CloudHasher {
    sha: Sha1,
    head: Vec<u8>,
    size: u64,
}

impl std::fmt::Debug for CloudHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudHasher").field("size", &self.size).finish()
    }
}

impl Default for CloudHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl CloudHasher {
    /// Fresh hasher.
    pub fn new() -> Self {
        let mut sha = Sha1::new();
        sha.update(PREFIX);
        Self {
            sha,
            head: Vec::with_capacity(DIGEST_LEN),
            size: 0,
        }
    }

    /// Feed more content.
    pub fn update(&mut self, data: &[u8]) {
        if self.head.len() < DIGEST_LEN {
            let take = (DIGEST_LEN - self.head.len()).min(data.len());
            self.head.extend_from_slice(&data[..take]);
        }
        self.sha.update(data);
        self.size += data.len() as u64;
    }

    /// Bytes hashed so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Finish and return the digest.
    pub fn finalize(mut self) -> ContentDigest {
        let mut out = [0u8; DIGEST_LEN];
        if self.size <= DIGEST_LEN as u64 {
            out[..self.head.len()].copy_from_slice(&self.head);
            return ContentDigest(out);
        }
        self.sha.update(self.size.to_string().as_bytes());
        out.copy_from_slice(&self.sha.finalize());
        ContentDigest(out)
    }
}

/// Digest of an in-memory buffer.
pub fn digest(data: &[u8]) -> ContentDigest {
    let mut hasher = CloudHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Digest and size of everything readable from `reader`.
pub async fn digest_reader<R: AsyncRead + Unpin>(reader: &mut R) -> TransferResult<(ContentDigest, u64)> {
    let mut hasher = CloudHasher::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let size = hasher.size();
    Ok((hasher.finalize(), size))
}
