//! Upload stream factory.
//!
//! Decides per destination whether the upload is encrypted, by looking for the
//! crypt marker object in the ancestor folders (root first), and builds the
//! matching sink. Planning has no side effects, so the dedup check can run
//! between [`UploadStreamFactory::plan`] and [`UploadStreamFactory::open`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::api::CloudApi;
use crate::config::TransferConfig;
use crate::crypt::{CryptKey, CryptMarker, FileCryptMeta};
use crate::encrypt::EncryptingUploadStream;
use crate::error::{TransferError, TransferResult};
use crate::file::{join, FileHandle};
use crate::session::Session;
use crate::shard::ShardResolver;
use crate::upload::{ChunkedUploadStream, UploadSink};

/// Caller override of the encryption decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CryptPolicy {
    /// Encrypt if an ancestor carries the marker and the session can encrypt.
    #[default]
    Auto,
    /// Never encrypt, even inside an encrypted folder.
    ForcePlain,
    /// Fail unless the upload ends up encrypted.
    Require,
}

/// A crypt marker found above a path.
#[derive(Debug, Clone)]
pub struct MarkerLocation {
    /// Folder holding the marker.
    pub folder: String,
    /// Parsed marker content.
    pub marker: CryptMarker,
}

/// Encryption decision for one upload.
#[derive(Debug, Clone)]
pub struct UploadPlan {
    /// Destination, with crypto metadata attached when encrypted.
    pub handle: FileHandle,
    /// Account key, when encrypted.
    pub key: Option<Arc<CryptKey>>,
}

impl UploadPlan {
    /// True if the upload will be encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.key.is_some()
    }
}

/// Builds upload sinks.
#[derive(Debug, Clone)]
pub struct UploadStreamFactory {
    resolver: ShardResolver,
    api: CloudApi,
    sector_size: usize,
    marker_name: String,
    timeout: Duration,
}

impl UploadStreamFactory {
    /// Factory for `config`.
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            resolver: ShardResolver::new(config.upload.default_max_chunk_size, config.request_timeout()),
            api: CloudApi::new(&config.upload),
            sector_size: config.crypt.sector_size,
            marker_name: config.crypt.marker_name.clone(),
            timeout: config.request_timeout(),
        }
    }

    /// Name of the marker object.
    pub fn marker_name(&self) -> &str {
        &self.marker_name
    }

    /// First crypt marker in the ancestor chain of `handle`, root first.
    #[instrument(skip(self, session, handle), fields(path = %handle.path))]
    pub async fn find_crypt_marker(
        &self,
        session: &Session,
        handle: &FileHandle,
    ) -> TransferResult<Option<MarkerLocation>> {
        for folder in handle.ancestors() {
            let marker_path = join(&folder, &self.marker_name);
            if self.api.file_info(session, &marker_path).await?.is_none() {
                continue;
            }
            let content = self.api.read_small(session, &marker_path).await?;
            let marker = CryptMarker::from_bytes(&content)?;
            debug!(%folder, "crypt marker found");
            return Ok(Some(MarkerLocation { folder, marker }));
        }
        Ok(None)
    }

    /// Decide whether `handle` is uploaded encrypted.
    pub async fn plan(
        &self,
        session: &Session,
        handle: FileHandle,
        policy: CryptPolicy,
    ) -> TransferResult<UploadPlan> {
        if policy == CryptPolicy::ForcePlain {
            return Ok(UploadPlan { handle, key: None });
        }
        let location = self.find_crypt_marker(session, &handle).await?;
        match (location, session.has_crypt()) {
            (Some(location), true) => {
                let key = session.crypt_key(&location.marker).await?;
                let meta = FileCryptMeta::new(&key, handle.original_size, self.sector_size);
                Ok(UploadPlan {
                    handle: handle.with_crypt(meta),
                    key: Some(key),
                })
            }
            (Some(location), false) if policy == CryptPolicy::Require => {
                Err(TransferError::Crypto(format!(
                    "{} is encrypted but the session has no crypt password",
                    location.folder
                )))
            }
            (None, _) if policy == CryptPolicy::Require => Err(TransferError::MissingCryptMarker {
                path: handle.path.clone(),
            }),
            (Some(location), false) => {
                warn!(folder = %location.folder, path = %handle.path, "no crypt password, uploading plaintext into encrypted folder");
                Ok(UploadPlan { handle, key: None })
            }
            (None, _) => Ok(UploadPlan { handle, key: None }),
        }
    }

    /// Open the sink for a plan: remove stale ciphertext, resolve a shard, wrap.
    #[instrument(skip(self, session, plan), fields(path = %plan.handle.path, encrypted = plan.is_encrypted()))]
    pub async fn open(
        &self,
        session: &Arc<Session>,
        plan: UploadPlan,
    ) -> TransferResult<Box<dyn UploadSink>> {
        if plan.is_encrypted() && self.api.file_info(session, &plan.handle.path).await?.is_some() {
            info!(path = %plan.handle.path, "removing existing object before encrypted rewrite");
            self.api.remove(session, &plan.handle.path).await?;
        }
        let shard = self.resolver.resolve(session).await?;
        let meta = plan.handle.crypt.clone();
        let inner = ChunkedUploadStream::new(
            session.clone(),
            self.api.clone(),
            shard,
            plan.handle,
            self.timeout,
        );
        match (plan.key, meta) {
            (Some(key), Some(meta)) => Ok(Box::new(EncryptingUploadStream::new(inner, &key, &meta)?)),
            _ => Ok(Box::new(inner)),
        }
    }

    /// Plan and open in one step.
    pub async fn create(
        &self,
        session: &Arc<Session>,
        handle: FileHandle,
        policy: CryptPolicy,
    ) -> TransferResult<Box<dyn UploadSink>> {
        let plan = self.plan(session, handle, policy).await?;
        self.open(session, plan).await
    }
}
