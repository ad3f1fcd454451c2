//! Transfer configuration: HTTP endpoints, chunking, timeouts and encryption knobs.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{TransferError, TransferResult};

/// Size of one cipher block; sectors must be a multiple of it.
pub const CIPHER_BLOCK_SIZE: usize = 16;

/// Endpoint and client identity settings shared by every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Client id sent to the dispatcher and on authenticated downloads.
    pub client_id: String,
    /// Optional proxy URL for all traffic.
    pub proxy: Option<String>,
    /// Web origin of the cloud; used for `Origin`/`Referer` and download URLs.
    pub base_domain: String,
    /// Base URL of the metadata API.
    pub api_base: String,
    /// Dispatcher endpoint resolving upload shards and public-link hosts.
    pub dispatcher_url: String,
    /// User agent sent on every request.
    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            client_id: "cloud-win".to_string(),
            proxy: None,
            base_domain: "https://cloud.mail.ru".to_string(),
            api_base: "https://cloud.mail.ru/api/v2".to_string(),
            dispatcher_url: "https://dispatcher.cloud.mail.ru/".to_string(),
            user_agent: concat!("clouddav/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// What the backend should do when the destination path already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictMode {
    /// Keep both objects; the backend picks a new name.
    Rename,
    /// Replace the existing object.
    #[default]
    Rewrite,
}

impl ConflictMode {
    /// Wire name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictMode::Rename => "rename",
            ConflictMode::Rewrite => "rewrite",
        }
    }
}

/// Upload path settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Chunk size used only when the dispatcher omits its hint.
    pub default_max_chunk_size: u64,
    /// Timeout for one chunk request.
    pub request_timeout_secs: u64,
    /// Attempt the content-hash short-circuit before uploading.
    pub dedup_enabled: bool,
    /// Conflict handling for commits.
    pub conflict: ConflictMode,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            default_max_chunk_size: 4 * 1024 * 1024,
            request_timeout_secs: 120,
            dedup_enabled: true,
            conflict: ConflictMode::default(),
        }
    }
}

/// Download path settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Maximum time to wait for response headers or the next body chunk.
    pub read_timeout_secs: u64,
    /// Connection establishment timeout.
    pub connect_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: 15,
            connect_timeout_secs: 10,
        }
    }
}

/// Encryption settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptConfig {
    /// Sector size in bytes; unit of padding and tweak derivation.
    pub sector_size: usize,
    /// Name of the marker object flagging an encrypted subtree.
    pub marker_name: String,
    /// Absolute path of the account crypto metadata object.
    pub account_meta_path: String,
}

impl Default for CryptConfig {
    fn default() -> Self {
        Self {
            sector_size: 512,
            marker_name: ".clouddav.crypt".to_string(),
            account_meta_path: "/.clouddav.account".to_string(),
        }
    }
}

/// Top-level configuration for the transfer pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TransferConfig {
    /// HTTP endpoints and identity.
    pub http: HttpSettings,
    /// Upload settings.
    pub upload: UploadConfig,
    /// Download settings.
    pub download: DownloadConfig,
    /// Encryption settings.
    pub crypt: CryptConfig,
}

impl TransferConfig {
    /// Load a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> TransferResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: TransferConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| TransferError::Config(e.to_string()))?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                return Err(TransferError::Config(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot honour.
    pub fn validate(&self) -> TransferResult<()> {
        if self.upload.default_max_chunk_size == 0 {
            return Err(TransferError::Config(
                "upload.default_max_chunk_size must be non-zero".to_string(),
            ));
        }
        if self.upload.request_timeout_secs == 0 {
            return Err(TransferError::Config(
                "upload.request_timeout_secs must be non-zero".to_string(),
            ));
        }
        let sector = self.crypt.sector_size;
        if sector == 0 || sector % CIPHER_BLOCK_SIZE != 0 {
            return Err(TransferError::Config(format!(
                "crypt.sector_size {} is not a non-zero multiple of {}",
                sector, CIPHER_BLOCK_SIZE
            )));
        }
        if !(1..=60).contains(&self.download.read_timeout_secs) {
            return Err(TransferError::Config(format!(
                "download.read_timeout_secs {} outside 1..=60",
                self.download.read_timeout_secs
            )));
        }
        if self.crypt.marker_name.is_empty() || self.crypt.marker_name.contains('/') {
            return Err(TransferError::Config(format!(
                "invalid crypt.marker_name {:?}",
                self.crypt.marker_name
            )));
        }
        let meta_path = &self.crypt.account_meta_path;
        if !meta_path.starts_with('/') || meta_path.len() < 2 || meta_path.ends_with('/') {
            return Err(TransferError::Config(format!(
                "crypt.account_meta_path {:?} must be an absolute file path",
                meta_path
            )));
        }
        Ok(())
    }

    /// Timeout applied to each chunk upload request.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.upload.request_timeout_secs)
    }

    /// Timeout applied to download headers and each body read.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.download.read_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_default_values() {
        let config = TransferConfig::default();
        assert_eq!(config.upload.default_max_chunk_size, 4_194_304);
        assert_eq!(config.download.read_timeout_secs, 15);
        assert_eq!(config.crypt.sector_size, 512);
        assert_eq!(config.crypt.marker_name, ".clouddav.crypt");
        assert_eq!(config.crypt.account_meta_path, "/.clouddav.account");
        assert_eq!(config.upload.conflict, ConflictMode::Rewrite);
        assert!(config.upload.dedup_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_file_with_partial_sections() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[http]
client_id = "test-client"
base_domain = "https://cloud.example"

[upload]
conflict = "rename"

[crypt]
sector_size = 4096
"#
        )
        .unwrap();

        let config = TransferConfig::from_file(file.path()).unwrap();
        assert_eq!(config.http.client_id, "test-client");
        assert_eq!(config.http.base_domain, "https://cloud.example");
        assert_eq!(config.http.api_base, HttpSettings::default().api_base);
        assert_eq!(config.upload.conflict, ConflictMode::Rename);
        assert_eq!(config.upload.request_timeout_secs, 120);
        assert_eq!(config.crypt.sector_size, 4096);
    }

    #[test]
    fn test_from_json_file() {
        let mut file = Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(file, r#"{{"download": {{"read_timeout_secs": 20}}}}"#).unwrap();
        let config = TransferConfig::from_file(file.path()).unwrap();
        assert_eq!(config.download.read_timeout_secs, 20);
        assert_eq!(config.read_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn test_unsupported_extension() {
        let file = Builder::new().suffix(".yaml").tempfile().unwrap();
        assert!(matches!(
            TransferConfig::from_file(file.path()),
            Err(TransferError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unaligned_sector() {
        let mut config = TransferConfig::default();
        config.crypt.sector_size = 500;
        assert!(config.validate().is_err());
        config.crypt.sector_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unbounded_read_timeout() {
        let mut config = TransferConfig::default();
        config.download.read_timeout_secs = 0;
        assert!(config.validate().is_err());
        config.download.read_timeout_secs = 600;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_relative_account_meta_path() {
        let mut config = TransferConfig::default();
        config.crypt.account_meta_path = "account.json".to_string();
        assert!(matches!(config.validate(), Err(TransferError::Config(_))));
        config.crypt.account_meta_path = "/".to_string();
        assert!(config.validate().is_err());
        config.crypt.account_meta_path = "/meta/account.json".to_string();
        assert!(config.validate().is_ok());
    }
}
