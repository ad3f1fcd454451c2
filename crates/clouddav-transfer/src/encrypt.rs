//! Encrypting upload stream.
//!
//! Buffers plaintext into whole sectors, encrypts each with its sector index
//! as tweak and forwards the ciphertext to the inner stream. The inner stream
//! was opened for the padded on-wire size; the final partial sector is zero
//! padded before encryption.

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::crypt::{CryptKey, FileCryptMeta, SectorCipher};
use crate::error::{TransferError, TransferResult};
use crate::upload::{UploadReceipt, UploadSignals, UploadSink, UploadState};

/// Wraps an [`UploadSink`] opened for the on-wire size of an encrypted file.
pub struct EncryptingUploadStream<S: UploadSink> {
    inner: S,
    cipher: SectorCipher,
    pending: Vec<u8>,
    sector_index: u64,
    plain_size: u64,
    plain_written: u64,
    alignment_bytes: u64,
    failed: bool,
}

impl<S: UploadSink> std::fmt::Debug for EncryptingUploadStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptingUploadStream")
            .field("sector_index", &self.sector_index)
            .field("plain_size", &self.plain_size)
            .field("plain_written", &self.plain_written)
            .finish_non_exhaustive()
    }
}

impl<S: UploadSink> EncryptingUploadStream<S> {
    /// Wrap `inner`, which must declare exactly `meta.wire_size()` bytes.
    pub fn new(inner: S, key: &CryptKey, meta: &FileCryptMeta) -> TransferResult<Self> {
        if inner.declared_size() != meta.wire_size() {
            return Err(TransferError::LengthMismatch {
                declared: meta.wire_size(),
                actual: inner.declared_size(),
            });
        }
        let cipher = SectorCipher::new(key, meta)?;
        Ok(Self {
            pending: Vec::with_capacity(cipher.sector_size()),
            inner,
            cipher,
            sector_index: 0,
            plain_size: meta.plain_size,
            plain_written: 0,
            alignment_bytes: meta.alignment_bytes,
            failed: false,
        })
    }

    fn sector_size(&self) -> usize {
        self.cipher.sector_size()
    }

    fn encrypt_pending(&mut self, out: &mut Vec<u8>) {
        self.cipher
            .encrypt_sector(&mut self.pending, self.sector_index);
        out.extend_from_slice(&self.pending);
        self.pending.clear();
        self.sector_index += 1;
    }

    async fn write_inner(&mut self, data: &[u8]) -> TransferResult<()> {
        let attempted = self.plain_written + data.len() as u64;
        if attempted > self.plain_size {
            return Err(TransferError::LengthMismatch {
                declared: self.plain_size,
                actual: attempted,
            });
        }
        let sector = self.sector_size();
        let mut out = Vec::with_capacity((self.pending.len() + data.len()) / sector * sector);
        let mut rest = data;
        while !rest.is_empty() {
            let take = (sector - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == sector {
                self.encrypt_pending(&mut out);
            }
        }
        self.plain_written = attempted;
        if !out.is_empty() {
            self.inner.write(&out).await?;
        }
        Ok(())
    }

    async fn finish_inner(&mut self) -> TransferResult<UploadReceipt> {
        if self.plain_written != self.plain_size {
            return Err(TransferError::LengthMismatch {
                declared: self.plain_size,
                actual: self.plain_written,
            });
        }
        if !self.pending.is_empty() {
            let padding = self.sector_size() - self.pending.len();
            if padding as u64 != self.alignment_bytes {
                return Err(TransferError::InvalidState(format!(
                    "final sector needs {} padding bytes, metadata records {}",
                    padding, self.alignment_bytes
                )));
            }
            self.pending.resize(self.sector_size(), 0);
            let mut out = Vec::with_capacity(self.sector_size());
            self.encrypt_pending(&mut out);
            debug!(sector = self.sector_index - 1, padding, "padded final sector");
            self.inner.write(&out).await?;
        }
        let mut receipt = self.inner.finish().await?;
        receipt.plain_size = self.plain_size;
        Ok(receipt)
    }
}

#[async_trait]
impl<S: UploadSink> UploadSink for EncryptingUploadStream<S> {
    async fn write(&mut self, data: &[u8]) -> TransferResult<()> {
        if self.failed {
            return Err(TransferError::InvalidState(
                "encrypting stream already failed".to_string(),
            ));
        }
        let result = self.write_inner(data).await;
        self.failed = result.is_err();
        result
    }

    #[instrument(skip(self), fields(plain_size = self.plain_size))]
    async fn finish(&mut self) -> TransferResult<UploadReceipt> {
        if self.failed {
            return Err(TransferError::InvalidState(
                "encrypting stream already failed".to_string(),
            ));
        }
        let result = self.finish_inner().await;
        self.failed = result.is_err();
        result
    }

    fn take_signals(&mut self) -> Option<UploadSignals> {
        self.inner.take_signals()
    }

    fn state(&self) -> UploadState {
        if self.failed {
            UploadState::Failed
        } else {
            self.inner.state()
        }
    }

    fn declared_size(&self) -> u64 {
        self.plain_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::{decrypt_all, SALT_LEN};
    use crate::hash::{digest, ContentDigest};
    use proptest::prelude::*;

    /// In-memory sink recording every write.
    struct VecSink {
        declared: u64,
        data: Vec<u8>,
        writes: Vec<usize>,
        finished: bool,
    }

    impl VecSink {
        fn new(declared: u64) -> Self {
            Self {
                declared,
                data: Vec::new(),
                writes: Vec::new(),
                finished: false,
            }
        }
    }

    #[async_trait]
    impl UploadSink for VecSink {
        async fn write(&mut self, data: &[u8]) -> TransferResult<()> {
            self.writes.push(data.len());
            self.data.extend_from_slice(data);
            Ok(())
        }

        async fn finish(&mut self) -> TransferResult<UploadReceipt> {
            self.finished = true;
            Ok(UploadReceipt {
                path: "/enc/file".to_string(),
                digest: digest(&self.data),
                plain_size: self.declared,
                wire_size: self.data.len() as u64,
                chunks: 1,
                deduplicated: false,
            })
        }

        fn take_signals(&mut self) -> Option<UploadSignals> {
            None
        }

        fn state(&self) -> UploadState {
            if self.finished {
                UploadState::Done
            } else {
                UploadState::Writing
            }
        }

        fn declared_size(&self) -> u64 {
            self.declared
        }
    }

    fn key() -> CryptKey {
        CryptKey::derive("pw", [4u8; SALT_LEN]).unwrap()
    }

    #[tokio::test]
    async fn test_padding_and_receipt() {
        let key = key();
        let plain: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let meta = FileCryptMeta::new(&key, plain.len() as u64, 512);
        let mut stream =
            EncryptingUploadStream::new(VecSink::new(meta.wire_size()), &key, &meta).unwrap();
        assert_eq!(stream.declared_size(), 1000);

        for piece in plain.chunks(77) {
            stream.write(piece).await.unwrap();
        }
        let receipt = stream.finish().await.unwrap();
        assert_eq!(receipt.plain_size, 1000);
        assert_eq!(receipt.wire_size, 1024);
        assert_eq!(stream.state(), UploadState::Done);

        let wire = &stream.inner.data;
        assert_eq!(wire.len(), 1024);
        assert!(stream.inner.writes.iter().all(|w| w % 512 == 0));
        assert_eq!(decrypt_all(wire, &key, &meta).unwrap(), plain);
        assert_ne!(receipt.digest, ContentDigest([0u8; 20]));
    }

    #[tokio::test]
    async fn test_rejects_inner_with_plain_size() {
        let key = key();
        let meta = FileCryptMeta::new(&key, 1000, 512);
        assert!(matches!(
            EncryptingUploadStream::new(VecSink::new(1000), &key, &meta),
            Err(TransferError::LengthMismatch { declared: 1024, actual: 1000 })
        ));
    }

    #[tokio::test]
    async fn test_overlong_plaintext_fails() {
        let key = key();
        let meta = FileCryptMeta::new(&key, 10, 512);
        let mut stream =
            EncryptingUploadStream::new(VecSink::new(meta.wire_size()), &key, &meta).unwrap();
        assert!(matches!(
            stream.write(&[0u8; 11]).await,
            Err(TransferError::LengthMismatch { declared: 10, actual: 11 })
        ));
        assert_eq!(stream.state(), UploadState::Failed);
        assert!(stream.finish().await.is_err());
        assert!(!stream.inner.finished);
    }

    #[tokio::test]
    async fn test_exact_sector_multiple_has_no_padding() {
        let key = key();
        let meta = FileCryptMeta::new(&key, 1024, 512);
        let mut stream =
            EncryptingUploadStream::new(VecSink::new(meta.wire_size()), &key, &meta).unwrap();
        stream.write(&[1u8; 1024]).await.unwrap();
        stream.finish().await.unwrap();
        assert_eq!(stream.inner.data.len(), 1024);
        assert_eq!(stream.inner.writes, vec![1024]);
    }

    proptest! {
        #[test]
        fn prop_stream_matches_one_shot_encryption(
            data in prop::collection::vec(any::<u8>(), 0..3000),
            piece in 1usize..700,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let key = key();
            let meta = FileCryptMeta::new(&key, data.len() as u64, 512);
            let wire = runtime.block_on(async {
                let mut stream =
                    EncryptingUploadStream::new(VecSink::new(meta.wire_size()), &key, &meta).unwrap();
                for chunk in data.chunks(piece) {
                    stream.write(chunk).await.unwrap();
                }
                stream.finish().await.unwrap();
                stream.inner.data
            });
            prop_assert_eq!(wire.len() as u64, meta.wire_size());
            prop_assert_eq!(decrypt_all(&wire, &key, &meta).unwrap(), data);
        }
    }
}
