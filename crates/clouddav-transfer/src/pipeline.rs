//! Transfer pipeline: dedup fast path, upload, download.
//!
//! Upload: plan (marker lookup) -> dedup check for plaintext uploads -> open
//! sink (shard resolution) -> stream -> commit. Download: stat -> public bases
//! for linked files -> ranged GET -> decrypt when needed.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use crate::api::{CloudApi, DedupOutcome};
use crate::config::TransferConfig;
use crate::crypt::{AccountCryptMeta, CryptMarker};
use crate::download::{ByteRange, DecryptingRangeReader, RangeDownloadStream};
use crate::error::{TransferError, TransferResult};
use crate::factory::{CryptPolicy, UploadStreamFactory};
use crate::file::{join, normalize, FileHandle};
use crate::hash::digest_reader;
use crate::session::Session;
use crate::shard::{PublicBaseUrlSet, ShardResolver};
use crate::upload::UploadReceipt;

const COPY_BUF: usize = 256 * 1024;
const DECRYPT_BATCH_SECTORS: u64 = 2048;

/// Entry points for moving files to and from the backend.
#[derive(Debug, Clone)]
pub struct TransferPipeline {
    config: TransferConfig,
    resolver: ShardResolver,
    api: CloudApi,
    factory: UploadStreamFactory,
}

impl TransferPipeline {
    /// Pipeline for `config`.
    pub fn new(config: TransferConfig) -> Self {
        Self {
            resolver: ShardResolver::new(config.upload.default_max_chunk_size, config.request_timeout()),
            api: CloudApi::new(&config.upload),
            factory: UploadStreamFactory::new(&config),
            config,
        }
    }

    /// The configuration.
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// The upload stream factory.
    pub fn factory(&self) -> &UploadStreamFactory {
        &self.factory
    }

    fn read_timeout(&self) -> Duration {
        self.config.read_timeout()
    }

    /// Link existing content with the same digest to `handle.path`.
    ///
    /// `Ok(None)` means "upload normally": dedup disabled, no digest, no match,
    /// or the check itself failed. A match the commit then rejects is fatal.
    #[instrument(skip(self, session, handle), fields(path = %handle.path))]
    pub async fn try_dedup(
        &self,
        session: &Session,
        handle: &FileHandle,
    ) -> TransferResult<Option<UploadReceipt>> {
        let digest = match (&handle.digest, self.config.upload.dedup_enabled) {
            (Some(digest), true) if !handle.is_encrypted() => *digest,
            _ => return Ok(None),
        };
        let size = handle.original_size;
        let existing = match self.api.check_existing(session, &digest, size).await {
            Ok(DedupOutcome::Found(existing)) => existing,
            Ok(DedupOutcome::NotFound) => return Ok(None),
            Err(err) => {
                warn!(error = %err, "dedup check failed, uploading");
                return Ok(None);
            }
        };
        let path = self
            .api
            .add_file(session, &handle.path, &digest, size, None)
            .await
            .map_err(|e| TransferError::DedupCommitRejected {
                path: handle.path.clone(),
                reason: e.to_string(),
            })?;
        info!(%existing, %path, "deduplicated upload");
        Ok(Some(UploadReceipt {
            path,
            digest,
            plain_size: size,
            wire_size: size,
            chunks: 0,
            deduplicated: true,
        }))
    }

    /// Upload everything `reader` yields (exactly `handle.original_size` bytes).
    #[instrument(skip(self, session, handle, reader), fields(path = %handle.path, size = handle.original_size))]
    pub async fn upload_reader<R: AsyncRead + Unpin + Send>(
        &self,
        session: &Arc<Session>,
        handle: FileHandle,
        reader: &mut R,
        policy: CryptPolicy,
    ) -> TransferResult<UploadReceipt> {
        let plan = self.factory.plan(session, handle, policy).await?;
        if !plan.is_encrypted() {
            if let Some(receipt) = self.try_dedup(session, &plan.handle).await? {
                return Ok(receipt);
            }
        }

        let mut sink = self.factory.open(session, plan).await?;
        let signals = sink.take_signals();
        let mut buf = vec![0u8; COPY_BUF];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            sink.write(&buf[..n]).await?;
        }
        let receipt = sink.finish().await?;

        if let Some(signals) = signals {
            let sent = signals.sent.await.ok();
            let processed = signals.processed.await.ok();
            debug!(?sent, ?processed, "upload signals");
        }
        Ok(receipt)
    }

    /// Upload a local file: hash it in one pass, then stream it.
    pub async fn upload_path(
        &self,
        session: &Arc<Session>,
        local: &Path,
        remote: &str,
        policy: CryptPolicy,
    ) -> TransferResult<UploadReceipt> {
        let mut file = tokio::fs::File::open(local).await?;
        let (digest, size) = digest_reader(&mut file).await?;
        file.rewind().await?;
        let handle = FileHandle::new(remote, size).with_digest(digest);
        debug!(local = %local.display(), %digest, size, "hashed local file");
        self.upload_reader(session, handle, &mut file, policy).await
    }

    /// Remote metadata for `path` as a handle, `None` if absent.
    pub async fn stat(&self, session: &Session, path: &str) -> TransferResult<Option<FileHandle>> {
        match self.api.file_info(session, path).await? {
            Some(info) if info.is_folder() => Err(TransferError::InvalidState(format!(
                "{} is a folder",
                path
            ))),
            Some(info) => Ok(Some(info.into_handle()?)),
            None => Ok(None),
        }
    }

    async fn bases_for(&self, session: &Session, handle: &FileHandle) -> TransferResult<Option<PublicBaseUrlSet>> {
        if handle.link.is_some() {
            Ok(Some(self.resolver.resolve_public_bases(session).await?))
        } else {
            Ok(None)
        }
    }

    async fn decrypting_reader(
        &self,
        session: &Session,
        handle: &FileHandle,
    ) -> TransferResult<Option<DecryptingRangeReader>> {
        let meta = match &handle.crypt {
            Some(meta) => meta,
            None => return Ok(None),
        };
        let location = self
            .factory
            .find_crypt_marker(session, handle)
            .await?
            .ok_or_else(|| TransferError::MissingCryptMarker {
                path: handle.path.clone(),
            })?;
        let key = session.crypt_key(&location.marker).await?;
        Ok(Some(DecryptingRangeReader::new(&key, meta)?))
    }

    /// Plaintext bytes `[start, end]` of `handle`.
    #[instrument(skip(self, session, handle), fields(path = %handle.path))]
    pub async fn download_range(
        &self,
        session: &Session,
        handle: &FileHandle,
        start: u64,
        end: u64,
    ) -> TransferResult<Bytes> {
        let bases = self.bases_for(session, handle).await?;
        match self.decrypting_reader(session, handle).await? {
            Some(reader) => {
                reader
                    .read(session, handle, bases.as_ref(), start, end, self.read_timeout())
                    .await
            }
            None => {
                let mut stream = RangeDownloadStream::open(
                    session,
                    handle,
                    ByteRange::new(start, end),
                    bases.as_ref(),
                    self.read_timeout(),
                )
                .await?;
                stream.read_to_end().await
            }
        }
    }

    /// Stream the whole plaintext of `handle` into `writer`.
    #[instrument(skip(self, session, handle, writer), fields(path = %handle.path))]
    pub async fn download_to<W: AsyncWrite + Unpin + Send>(
        &self,
        session: &Session,
        handle: &FileHandle,
        writer: &mut W,
    ) -> TransferResult<u64> {
        let bases = self.bases_for(session, handle).await?;
        let size = handle.original_size;
        match self.decrypting_reader(session, handle).await? {
            Some(reader) => {
                let batch = DECRYPT_BATCH_SECTORS * self.config.crypt.sector_size as u64;
                let mut start = 0;
                while start < size {
                    let end = (start + batch).min(size) - 1;
                    let data = reader
                        .read(session, handle, bases.as_ref(), start, end, self.read_timeout())
                        .await?;
                    writer.write_all(&data).await?;
                    start = end + 1;
                }
                writer.flush().await?;
                Ok(size)
            }
            None if size == 0 => Ok(0),
            None => {
                let mut stream = RangeDownloadStream::open(
                    session,
                    handle,
                    ByteRange::whole(size),
                    bases.as_ref(),
                    self.read_timeout(),
                )
                .await?;
                stream.copy_to(writer).await
            }
        }
    }

    /// Download a public link without knowing its size.
    #[instrument(skip(self, session, writer))]
    pub async fn download_link<W: AsyncWrite + Unpin + Send>(
        &self,
        session: &Session,
        uri: &str,
        writer: &mut W,
    ) -> TransferResult<u64> {
        let bases = self.resolver.resolve_public_bases(session).await?;
        let mut stream = RangeDownloadStream::open_linked(
            session,
            &bases,
            uri,
            ByteRange::starting_at(0),
            None,
            self.read_timeout(),
        )
        .await?;
        stream.copy_to(writer).await
    }

    /// Account crypto metadata, `None` until the first encrypted folder exists.
    pub async fn account_crypt_meta(&self, session: &Session) -> TransferResult<Option<AccountCryptMeta>> {
        let path = &self.config.crypt.account_meta_path;
        if self.api.file_info(session, path).await?.is_none() {
            return Ok(None);
        }
        let content = self.api.read_small(session, path).await?;
        AccountCryptMeta::from_bytes(&content).map(Some)
    }

    async fn write_small(&self, session: &Arc<Session>, path: &str, content: &[u8]) -> TransferResult<()> {
        let handle = FileHandle::new(path, content.len() as u64);
        let mut reader = content;
        self.upload_reader(session, handle, &mut reader, CryptPolicy::ForcePlain)
            .await?;
        Ok(())
    }

    /// Mark `folder` as encrypted under the account key.
    ///
    /// The first encrypted folder of an account generates the key and stores
    /// its salt in the account metadata; later folders reuse that salt and
    /// must unlock it with the session password. A folder equal to, inside,
    /// or above an encrypted folder is refused.
    #[instrument(skip(self, session))]
    pub async fn init_crypt_folder(
        &self,
        session: &Arc<Session>,
        folder: &str,
    ) -> TransferResult<CryptMarker> {
        let folder = normalize(folder);
        let marker_path = join(&folder, self.factory.marker_name());
        let in_folder = FileHandle::new(&marker_path, 0);
        if let Some(existing) = self.factory.find_crypt_marker(session, &in_folder).await? {
            return Err(TransferError::InvalidState(format!(
                "{} is already inside encrypted folder {}",
                folder, existing.folder
            )));
        }

        let mut account = match self.account_crypt_meta(session).await? {
            Some(account) => {
                if let Some(other) = account.overlapping(&folder) {
                    return Err(TransferError::InvalidState(format!(
                        "{} overlaps encrypted folder {}",
                        folder, other
                    )));
                }
                account
            }
            None => {
                let key = session.account_key().await?;
                info!(login = %session.login(), "generated account crypt key");
                AccountCryptMeta::new(&key)?
            }
        };
        // Fails on a wrong password before anything is written.
        session.crypt_key(&account.marker).await?;

        let marker = account.marker.clone();
        self.write_small(session, &marker_path, &marker.to_bytes()?).await?;
        account.register(&folder);
        self.write_small(session, &self.config.crypt.account_meta_path, &account.to_bytes()?)
            .await?;
        info!(%folder, folders = account.folders.len(), "encrypted folder initialised");
        Ok(marker)
    }
}
