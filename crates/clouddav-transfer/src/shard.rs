//! Shard resolution against the dispatcher.
//!
//! Every upload asks the dispatcher for a fresh target; results are never
//! cached because each answer may point at the least-loaded shard. The same
//! exchange also yields the accepted public-link prefixes and the direct
//! download host used for linked downloads.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, instrument};

use crate::auth::ANONYMOUS_LOGIN;
use crate::error::{TransferError, TransferResult};
use crate::http::{redact, HttpRequest};
use crate::session::Session;

/// Where one upload goes and how large each chunk may be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardTarget {
    /// Upload endpoint.
    pub upload_url: String,
    /// Maximum payload per chunk request.
    pub max_chunk_size: u64,
}

/// Accepted public-link prefixes and the direct download host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicBaseUrlSet {
    /// Prefixes a public link must start with, in dispatcher order.
    pub prefixes: Vec<String>,
    /// Host serving the raw bytes of public links.
    pub download_host: String,
}

impl PublicBaseUrlSet {
    /// Map a public link onto the direct download host.
    ///
    /// The link must start with exactly one accepted prefix. Anything else is
    /// rejected without touching the network.
    pub fn resolve_link(&self, uri: &str) -> TransferResult<String> {
        let mut matching = self.prefixes.iter().filter(|p| uri.starts_with(p.as_str()));
        let prefix = match (matching.next(), matching.next()) {
            (Some(prefix), None) => prefix,
            _ => {
                return Err(TransferError::LinkRejected {
                    uri: uri.to_string(),
                })
            }
        };
        let suffix = &uri[prefix.len()..];
        Ok(format!(
            "{}/{}",
            self.download_host.trim_end_matches('/'),
            suffix.trim_start_matches('/')
        ))
    }
}

#[derive(Debug, Deserialize)]
struct UrlEntry {
    url: String,
}

#[derive(Debug, Deserialize)]
struct DispatcherResponse {
    #[serde(default)]
    upload: Vec<UrlEntry>,
    #[serde(default)]
    max_chunk_size: Option<u64>,
    #[serde(default)]
    weblink_view: Vec<UrlEntry>,
    #[serde(default)]
    weblink_get: Vec<UrlEntry>,
}

/// Dispatcher query for `session`.
pub fn dispatcher_request(session: &Session) -> HttpRequest {
    let settings = session.settings();
    let request = HttpRequest::get(settings.dispatcher_url.as_str())
        .query(&[("client_id", settings.client_id.as_str())])
        .header("User-Agent", settings.user_agent.as_str());
    match session.access_token() {
        Some(token) if !session.is_anonymous() => {
            request.query(&[("access_token", token.as_str())])
        }
        _ => request.query(&[("email", ANONYMOUS_LOGIN), ("x-email", ANONYMOUS_LOGIN)]),
    }
}

/// Resolves upload shards and public-link bases.
#[derive(Debug, Clone)]
pub struct ShardResolver {
    default_max_chunk_size: u64,
    timeout: Duration,
}

impl ShardResolver {
    /// Resolver using `default_max_chunk_size` when the dispatcher gives no hint.
    pub fn new(default_max_chunk_size: u64, timeout: Duration) -> Self {
        Self {
            default_max_chunk_size,
            timeout,
        }
    }

    async fn query(&self, session: &Session) -> TransferResult<DispatcherResponse> {
        let request = dispatcher_request(session).timeout(self.timeout);
        let url = redact(&request.url);
        let response = tokio::time::timeout(self.timeout, session.transport().send(request))
            .await
            .map_err(|_| TransferError::Resolution {
                reason: format!("dispatcher timed out after {}s", self.timeout.as_secs()),
            })?
            .map_err(|e| TransferError::Resolution {
                reason: format!("dispatcher unreachable: {}", e),
            })?;
        let status = response.status;
        if !response.is_success() {
            return Err(TransferError::Resolution {
                reason: format!("dispatcher {} answered {}", url, status),
            });
        }
        let body = response.bytes().await.map_err(|e| TransferError::Resolution {
            reason: format!("dispatcher body: {}", e),
        })?;
        serde_json::from_slice(&body).map_err(|e| TransferError::Resolution {
            reason: format!("malformed dispatcher response: {}", e),
        })
    }

    /// Ask for an upload target. One dispatcher request per call.
    #[instrument(skip(self, session), fields(login = %session.login()))]
    pub async fn resolve(&self, session: &Session) -> TransferResult<ShardTarget> {
        let response = self.query(session).await?;
        let upload_url = response
            .upload
            .into_iter()
            .map(|entry| entry.url)
            .find(|url| !url.is_empty())
            .ok_or_else(|| TransferError::Resolution {
                reason: "dispatcher response has no upload url".to_string(),
            })?;
        let max_chunk_size = response
            .max_chunk_size
            .filter(|size| *size > 0)
            .unwrap_or(self.default_max_chunk_size);
        debug!(%upload_url, max_chunk_size, "resolved upload shard");
        Ok(ShardTarget {
            upload_url,
            max_chunk_size,
        })
    }

    /// Ask for the accepted public-link prefixes.
    #[instrument(skip(self, session), fields(login = %session.login()))]
    pub async fn resolve_public_bases(&self, session: &Session) -> TransferResult<PublicBaseUrlSet> {
        let response = self.query(session).await?;
        let prefixes: Vec<String> = response
            .weblink_view
            .into_iter()
            .map(|entry| entry.url)
            .filter(|url| !url.is_empty())
            .collect();
        let download_host = response
            .weblink_get
            .into_iter()
            .map(|entry| entry.url)
            .find(|url| !url.is_empty());
        match download_host {
            Some(download_host) if !prefixes.is_empty() => {
                debug!(prefixes = prefixes.len(), %download_host, "resolved public bases");
                Ok(PublicBaseUrlSet {
                    prefixes,
                    download_host,
                })
            }
            _ => Err(TransferError::Resolution {
                reason: "dispatcher response has no public link bases".to_string(),
            }),
        }
    }
}
