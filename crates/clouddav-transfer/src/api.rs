//! Metadata API: dedup check, commit, item info, removal and small reads.
//!
//! Each exchange has a request factory function returning a plain
//! [`HttpRequest`]; [`CloudApi`] sends them and interprets the replies.

use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::config::{ConflictMode, UploadConfig};
use crate::crypt::FileCryptMeta;
use crate::error::{TransferError, TransferResult};
use crate::file::{escape_path, FileHandle};
use crate::hash::ContentDigest;
use crate::http::{HttpRequest, HttpResponse};
use crate::session::Session;

/// Result of a dedup check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupOutcome {
    /// An object with this digest and size exists at the given path.
    Found(String),
    /// No such object.
    NotFound,
}

/// Metadata of a remote item.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ItemInfo {
    /// Full remote path.
    pub home: String,
    /// On-wire size.
    #[serde(default)]
    pub size: u64,
    /// Content digest (hex), files only.
    #[serde(default)]
    pub hash: Option<String>,
    /// `"file"` or `"folder"`.
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Public link, if published.
    #[serde(default)]
    pub weblink: Option<String>,
    /// Per-file crypto metadata for encrypted files.
    #[serde(default)]
    pub crypt: Option<FileCryptMeta>,
}

fn default_kind() -> String {
    "file".to_string()
}

impl ItemInfo {
    /// True for folders.
    pub fn is_folder(&self) -> bool {
        self.kind == "folder"
    }

    /// Handle describing this item for a download.
    pub fn into_handle(self) -> TransferResult<FileHandle> {
        let plain_size = self
            .crypt
            .as_ref()
            .map(|meta| meta.plain_size)
            .unwrap_or(self.size);
        let mut handle = FileHandle::new(&self.home, plain_size);
        if let Some(hash) = self.hash.as_deref().filter(|h| !h.is_empty()) {
            handle = handle.with_digest(ContentDigest::from_hex(hash)?);
        }
        if let Some(uri) = self.weblink {
            handle = handle.with_link(uri);
        }
        if let Some(meta) = self.crypt {
            if meta.wire_size() != self.size {
                return Err(TransferError::LengthMismatch {
                    declared: meta.wire_size(),
                    actual: self.size,
                });
            }
            handle = handle.with_crypt(meta);
        }
        Ok(handle)
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    status: Option<u16>,
    body: T,
}

#[derive(Debug, Deserialize)]
struct HashLookup {
    #[serde(default)]
    exists: bool,
    #[serde(default)]
    home: Option<String>,
}

fn authorized(session: &Session, request: HttpRequest) -> HttpRequest {
    let settings = session.settings();
    let request = request
        .query(&[("client_id", settings.client_id.as_str())])
        .header("User-Agent", settings.user_agent.as_str());
    match session.access_token() {
        Some(token) => request.query(&[("access_token", token.as_str())]),
        None => request,
    }
}

fn endpoint(session: &Session, path: &str) -> String {
    format!("{}{}", session.settings().api_base.trim_end_matches('/'), path)
}

/// Dedup check: does an object with `digest` and `size` exist?
pub fn dedup_request(session: &Session, digest: &ContentDigest, size: u64) -> HttpRequest {
    let size = size.to_string();
    authorized(
        session,
        HttpRequest::get(endpoint(session, "/file/hash"))
            .query(&[("hash", digest.to_hex().as_str()), ("size", size.as_str())]),
    )
}

/// Commit: bind `digest` to `path`.
pub fn add_file_request(
    session: &Session,
    path: &str,
    digest: &ContentDigest,
    size: u64,
    conflict: ConflictMode,
    crypt: Option<&FileCryptMeta>,
) -> TransferResult<HttpRequest> {
    let size = size.to_string();
    let hash = digest.to_hex();
    let crypt = crypt.map(serde_json::to_string).transpose()?;
    let mut fields = vec![
        ("home", path),
        ("hash", hash.as_str()),
        ("size", size.as_str()),
        ("conflict", conflict.as_str()),
    ];
    if let Some(crypt) = crypt.as_deref() {
        fields.push(("crypt", crypt));
    }
    Ok(authorized(
        session,
        HttpRequest::post(endpoint(session, "/file/add")),
    )
    .form(&fields))
}

/// Item info for `path`.
pub fn file_info_request(session: &Session, path: &str) -> HttpRequest {
    authorized(
        session,
        HttpRequest::get(endpoint(session, "/file")).query(&[("home", path)]),
    )
}

/// Remove `path`.
pub fn remove_request(session: &Session, path: &str) -> HttpRequest {
    authorized(session, HttpRequest::post(endpoint(session, "/file/remove")))
        .form(&[("home", path)])
}

/// Whole-object GET for `path` from the account's base domain.
pub fn get_request(session: &Session, path: &str) -> HttpRequest {
    let settings = session.settings();
    let url = format!(
        "{}/get{}",
        settings.base_domain.trim_end_matches('/'),
        escape_path(path)
    );
    let request = HttpRequest::get(url)
        .query(&[("client_id", settings.client_id.as_str())])
        .header("User-Agent", settings.user_agent.as_str());
    match session.access_token() {
        Some(token) => request.query(&[("token", token.as_str())]),
        None => request,
    }
}

/// Sends metadata requests for one pipeline.
#[derive(Debug, Clone)]
pub struct CloudApi {
    conflict: ConflictMode,
    timeout: Duration,
}

impl CloudApi {
    /// API client committing with the configured conflict mode.
    pub fn new(config: &UploadConfig) -> Self {
        Self {
            conflict: config.conflict,
            timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    async fn send(
        &self,
        session: &Session,
        operation: &'static str,
        request: HttpRequest,
    ) -> TransferResult<HttpResponse> {
        let request = request.timeout(self.timeout);
        tokio::time::timeout(self.timeout, session.transport().send(request))
            .await
            .map_err(|_| TransferError::Request {
                operation,
                reason: format!("timed out after {}s", self.timeout.as_secs()),
            })?
            .map_err(|e| TransferError::Request {
                operation,
                reason: e.to_string(),
            })
    }

    async fn body(operation: &'static str, response: HttpResponse) -> TransferResult<Bytes> {
        response.bytes().await.map_err(|e| TransferError::Request {
            operation,
            reason: e.to_string(),
        })
    }

    async fn parse<T: DeserializeOwned>(
        operation: &'static str,
        response: HttpResponse,
    ) -> TransferResult<T> {
        let status = response.status;
        let body = Self::body(operation, response).await?;
        if !(200..300).contains(&status) {
            return Err(TransferError::Rejected {
                operation,
                status,
                reason: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        let envelope: Envelope<T> = serde_json::from_slice(&body)?;
        match envelope.status {
            Some(code) if code != 200 => Err(TransferError::Rejected {
                operation,
                status: code,
                reason: String::from_utf8_lossy(&body).into_owned(),
            }),
            _ => Ok(envelope.body),
        }
    }

    /// Ask whether an object with `digest` and `size` already exists.
    #[instrument(skip(self, session, digest), fields(digest = %digest))]
    pub async fn check_existing(
        &self,
        session: &Session,
        digest: &ContentDigest,
        size: u64,
    ) -> TransferResult<DedupOutcome> {
        let response = self
            .send(session, "check_existing", dedup_request(session, digest, size))
            .await?;
        if response.status == 404 {
            return Ok(DedupOutcome::NotFound);
        }
        let lookup: HashLookup = Self::parse("check_existing", response).await?;
        let outcome = match lookup.home {
            Some(home) if lookup.exists => DedupOutcome::Found(home),
            _ => DedupOutcome::NotFound,
        };
        debug!(?outcome, "dedup check");
        Ok(outcome)
    }

    /// Commit the object with `digest` at `path`; returns the final server path.
    #[instrument(skip(self, session, digest, crypt))]
    pub async fn add_file(
        &self,
        session: &Session,
        path: &str,
        digest: &ContentDigest,
        size: u64,
        crypt: Option<&FileCryptMeta>,
    ) -> TransferResult<String> {
        let request = add_file_request(session, path, digest, size, self.conflict, crypt)?;
        let response = self.send(session, "add_file", request).await?;
        let home: String = Self::parse("add_file", response).await?;
        debug!(%home, "committed");
        Ok(home)
    }

    /// Item metadata, or `None` if nothing exists at `path`.
    pub async fn file_info(&self, session: &Session, path: &str) -> TransferResult<Option<ItemInfo>> {
        let response = self
            .send(session, "file_info", file_info_request(session, path))
            .await?;
        if response.status == 404 {
            return Ok(None);
        }
        Ok(Some(Self::parse("file_info", response).await?))
    }

    /// Remove the object at `path`.
    #[instrument(skip(self, session))]
    pub async fn remove(&self, session: &Session, path: &str) -> TransferResult<()> {
        let response = self
            .send(session, "remove", remove_request(session, path))
            .await?;
        let _: serde_json::Value = Self::parse("remove", response).await?;
        Ok(())
    }

    /// Read a small object (such as a crypt marker) in one request.
    pub async fn read_small(&self, session: &Session, path: &str) -> TransferResult<Bytes> {
        let response = self.send(session, "read_small", get_request(session, path)).await?;
        let status = response.status;
        let body = Self::body("read_small", response).await?;
        if !(200..300).contains(&status) {
            return Err(TransferError::Rejected {
                operation: "read_small",
                status,
                reason: format!("GET {} failed", path),
            });
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuth;
    use crate::config::HttpSettings;
    use crate::hash::digest;
    use crate::http::{MockTransport, Transport};
    use serde_json::json;
    use std::sync::Arc;

    fn session(mock: Arc<MockTransport>) -> Session {
        let transport: Arc<dyn Transport> = mock;
        Session::new(
            Arc::new(StaticAuth::new("user@example.com", "tok")),
            HttpSettings::default(),
            transport,
            None,
        )
    }

    fn api() -> CloudApi {
        CloudApi::new(&UploadConfig::default())
    }

    #[tokio::test]
    async fn test_check_existing_found_and_idempotent() {
        let mock = Arc::new(MockTransport::new(|req| {
            assert!(req.url.contains("/file/hash"));
            Ok(HttpResponse::json(
                200,
                &json!({"status": 200, "body": {"exists": true, "home": "/old/copy.bin"}}),
            ))
        }));
        let session = session(mock.clone());
        let d = digest(&[1u8; 100]);
        let first = api().check_existing(&session, &d, 100).await.unwrap();
        let second = api().check_existing(&session, &d, 100).await.unwrap();
        assert_eq!(first, DedupOutcome::Found("/old/copy.bin".to_string()));
        assert_eq!(first, second);

        let request = &mock.requests()[0];
        assert_eq!(request.query_param("hash"), Some(d.to_hex()));
        assert_eq!(request.query_param("size").as_deref(), Some("100"));
        assert_eq!(request.query_param("access_token").as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn test_check_existing_not_found() {
        let mock = Arc::new(MockTransport::new(|_| {
            Ok(HttpResponse::json(200, &json!({"status": 200, "body": {"exists": false}})))
        }));
        let outcome = api()
            .check_existing(&session(mock), &digest(b"abc"), 3)
            .await
            .unwrap();
        assert_eq!(outcome, DedupOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_add_file_sends_form_and_returns_home() {
        let mock = Arc::new(MockTransport::new(|_| {
            Ok(HttpResponse::json(200, &json!({"status": 200, "body": "/dst/file (1).bin"})))
        }));
        let session = session(mock.clone());
        let d = digest(&[7u8; 64]);
        let home = api()
            .add_file(&session, "/dst/file.bin", &d, 64, None)
            .await
            .unwrap();
        assert_eq!(home, "/dst/file (1).bin");

        let request = &mock.requests()[0];
        let body = String::from_utf8(request.body.clone().unwrap().to_vec()).unwrap();
        assert!(body.contains("home=%2Fdst%2Ffile.bin"));
        assert!(body.contains(&format!("hash={}", d.to_hex())));
        assert!(body.contains("size=64"));
        assert!(body.contains("conflict=rewrite"));
        assert!(!body.contains("crypt="));
    }

    #[tokio::test]
    async fn test_add_file_rejection() {
        let mock = Arc::new(MockTransport::new(|_| {
            Ok(HttpResponse::json(200, &json!({"status": 400, "body": "invalid"})))
        }));
        let err = api()
            .add_file(&session(mock), "/x", &digest(b"x"), 1, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Rejected {
                operation: "add_file",
                status: 400,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_file_info_and_handle() {
        let mock = Arc::new(MockTransport::new(|req| {
            if req.query_param("home").as_deref() == Some("/missing") {
                return Ok(HttpResponse::from_bytes(404, ""));
            }
            Ok(HttpResponse::json(
                200,
                &json!({"status": 200, "body": {
                    "home": "/a/b.bin", "size": 5000, "kind": "file",
                    "weblink": "https://cloud.example/public/xyz"
                }}),
            ))
        }));
        let session = session(mock);
        assert_eq!(api().file_info(&session, "/missing").await.unwrap(), None);
        let info = api().file_info(&session, "/a/b.bin").await.unwrap().unwrap();
        assert!(!info.is_folder());
        let handle = info.into_handle().unwrap();
        assert_eq!(handle.original_size, 5000);
        assert_eq!(handle.link.unwrap().uri, "https://cloud.example/public/xyz");
    }

    #[test]
    fn test_malformed_backend_digest() {
        let info = ItemInfo {
            home: "/a.bin".to_string(),
            size: 10,
            hash: Some("not-hex".to_string()),
            kind: "file".to_string(),
            weblink: None,
            crypt: None,
        };
        assert!(matches!(
            info.into_handle(),
            Err(TransferError::InvalidDigest { ref value, .. }) if value == "not-hex"
        ));
    }

    #[tokio::test]
    async fn test_remove_failure_is_rejected() {
        let mock = Arc::new(MockTransport::new(|_| Ok(HttpResponse::from_bytes(403, "denied"))));
        assert!(matches!(
            api().remove(&session(mock), "/x").await,
            Err(TransferError::Rejected { status: 403, .. })
        ));
    }

    #[test]
    fn test_get_request_escapes_path() {
        let mock = Arc::new(MockTransport::new(|_| Ok(HttpResponse::from_bytes(200, ""))));
        let request = get_request(&session(mock), "/My Docs/.clouddav.crypt");
        assert!(request
            .url
            .starts_with("https://cloud.mail.ru/get/My%20Docs/.clouddav.crypt?"));
        assert_eq!(request.query_param("token").as_deref(), Some("tok"));
    }
}
