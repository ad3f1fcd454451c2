#![warn(missing_docs)]

//! clouddav transfer subsystem: sharded chunked upload, ranged download,
//! content-hash dedup and per-folder sector encryption.
//!
//! Upload path: Plan (crypt marker) → Dedup check → Shard → Encrypt → Chunk PUTs → Digest verify → Commit
//! Download path: Stat → Public base (linked files) → Ranged GET → Decrypt

pub mod api;
pub mod auth;
pub mod cli;
pub mod config;
pub mod crypt;
pub mod download;
pub mod encrypt;
pub mod error;
pub mod factory;
pub mod file;
pub mod hash;
pub mod http;
pub mod pipeline;
pub mod session;
pub mod shard;
pub mod upload;

pub use api::{CloudApi, DedupOutcome, ItemInfo};
pub use auth::{Auth, Authenticator, CredentialKey, Credentials, StaticAuth, StaticAuthenticator};
pub use config::{ConflictMode, CryptConfig, DownloadConfig, HttpSettings, TransferConfig, UploadConfig};
pub use crypt::{AccountCryptMeta, CryptKey, CryptMarker, FileCryptMeta, SectorCipher};
pub use download::{ByteRange, DecryptingRangeReader, RangeDownloadStream};
pub use encrypt::EncryptingUploadStream;
pub use error::{TransferError, TransferResult};
pub use factory::{CryptPolicy, MarkerLocation, UploadPlan, UploadStreamFactory};
pub use file::{FileHandle, PublicLink};
pub use hash::{CloudHasher, ContentDigest};
pub use http::{HttpRequest, HttpResponse, MockTransport, ReqwestTransport, Transport};
pub use pipeline::TransferPipeline;
pub use session::{ReqwestTransportFactory, Session, SessionRegistry, TransportFactory};
pub use shard::{PublicBaseUrlSet, ShardResolver, ShardTarget};
pub use upload::{ChunkDescriptor, ChunkedUploadStream, UploadReceipt, UploadSignals, UploadSink, UploadState};
