//! Error types for the transfer pipeline.

use thiserror::Error;

use crate::http::TransportError;

/// Result type alias for transfer operations.
pub type TransferResult<T> = Result<T, TransferError>;

/// All errors that can occur while moving bytes to or from the backend.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The dispatcher was unreachable or answered with something unusable.
    #[error("Shard resolution failed: {reason}")]
    Resolution {
        /// Description of what was wrong with the dispatcher exchange.
        reason: String,
    },

    /// A public link URI did not start with exactly one accepted base URL.
    #[error("Link rejected: {uri} does not match exactly one accepted base URL")]
    LinkRejected {
        /// The rejected link URI.
        uri: String,
    },

    /// Connection-level failure while transferring the range starting at `offset`.
    #[error("Transport error at offset {offset}: {reason}")]
    Transport {
        /// On-wire byte offset of the chunk or range that failed.
        offset: u64,
        /// Description of the failure.
        reason: String,
    },

    /// A request or body read exceeded its timeout.
    #[error("Timed out after {timeout_secs}s at offset {offset}")]
    Timeout {
        /// On-wire byte offset of the chunk or range that failed.
        offset: u64,
        /// The timeout that elapsed.
        timeout_secs: u64,
    },

    /// The backend answered a transfer request with a non-success status.
    #[error("HTTP {status} at offset {offset}")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
        /// On-wire byte offset of the chunk or range that failed.
        offset: u64,
    },

    /// A metadata API call could not be completed.
    #[error("{operation} request failed: {reason}")]
    Request {
        /// The API operation name.
        operation: &'static str,
        /// Description of the failure.
        reason: String,
    },

    /// The backend processed a metadata call and refused it.
    #[error("{operation} rejected by backend (status {status}): {reason}")]
    Rejected {
        /// The API operation name.
        operation: &'static str,
        /// Status reported by the backend.
        status: u16,
        /// Body or message returned by the backend.
        reason: String,
    },

    /// The number of transmitted bytes differs from the declared on-wire length.
    #[error("Length mismatch: declared {declared} bytes, got {actual}")]
    LengthMismatch {
        /// Declared on-wire length.
        declared: u64,
        /// Bytes actually written or received.
        actual: u64,
    },

    /// The digest echoed by the backend differs from the locally computed one.
    #[error("Digest mismatch: local {local}, server {server}")]
    DigestMismatch {
        /// Locally computed digest (hex).
        local: String,
        /// Digest reported by the backend.
        server: String,
    },

    /// A digest received from the backend or a caller is not 20 bytes of hex.
    #[error("Invalid digest {value:?}: {reason}")]
    InvalidDigest {
        /// The offending value.
        value: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A ranged request was answered without partial content.
    #[error("Range not supported: expected 206 Partial Content, got {status}")]
    RangeNotSupported {
        /// The status actually returned.
        status: u16,
    },

    /// The requested byte range is empty or outside the object.
    #[error("Invalid range {start}..={end} for object of {size} bytes")]
    InvalidRange {
        /// First requested byte.
        start: u64,
        /// Last requested byte (inclusive).
        end: u64,
        /// Object size.
        size: u64,
    },

    /// Encryption was required but no ancestor folder carries the crypt marker.
    #[error("No crypt marker found above {path}")]
    MissingCryptMarker {
        /// The path being uploaded.
        path: String,
    },

    /// The dedup check found the object but linking it to the new path failed.
    #[error("Commit rejected for deduplicated object {path}: {reason}")]
    DedupCommitRejected {
        /// Destination path.
        path: String,
        /// Reason reported by the commit step.
        reason: String,
    },

    /// Session construction failed for a credential pair.
    #[error("Authentication failed for {login}: {reason}")]
    Authentication {
        /// Login of the failed credential.
        login: String,
        /// Reason reported by the authenticator.
        reason: String,
    },

    /// Key derivation, key check or cipher setup failed.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// An operation was attempted in a state that does not allow it.
    #[error("Invalid stream state: {0}")]
    InvalidState(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error on a local source or sink.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON from the backend or in persisted metadata.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TransferError {
    /// Map a transport failure for the range starting at `offset`.
    pub fn from_transport(err: TransportError, offset: u64, timeout_secs: u64) -> Self {
        if err.timed_out {
            TransferError::Timeout {
                offset,
                timeout_secs,
            }
        } else {
            TransferError::Transport {
                offset,
                reason: err.message,
            }
        }
    }

    /// True if an external retry policy may restart the transfer from offset 0.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Transport { .. }
            | TransferError::Timeout { .. }
            | TransferError::Request { .. } => true,
            TransferError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// The on-wire offset of the failed chunk or range, when the error has one.
    pub fn offset(&self) -> Option<u64> {
        match self {
            TransferError::Transport { offset, .. }
            | TransferError::Timeout { offset, .. }
            | TransferError::HttpStatus { offset, .. } => Some(*offset),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_keeps_offset() {
        let err = TransferError::from_transport(
            TransportError {
                message: "connection reset".to_string(),
                timed_out: false,
            },
            8_388_608,
            120,
        );
        assert_eq!(err.offset(), Some(8_388_608));
        assert!(err.is_retryable());
        assert!(format!("{}", err).contains("connection reset"));
    }

    #[test]
    fn test_timeout_maps_to_timeout_variant() {
        let err = TransferError::from_transport(TransportError::timeout("read"), 42, 15);
        assert!(matches!(
            err,
            TransferError::Timeout {
                offset: 42,
                timeout_secs: 15
            }
        ));
    }

    #[test]
    fn test_consistency_errors_are_not_retryable() {
        let err = TransferError::LengthMismatch {
            declared: 10,
            actual: 11,
        };
        assert!(!err.is_retryable());
        assert_eq!(format!("{}", err), "Length mismatch: declared 10 bytes, got 11");

        let err = TransferError::LinkRejected {
            uri: "https://evil.example/x".to_string(),
        };
        assert!(!err.is_retryable());
        assert_eq!(err.offset(), None);
    }

    #[test]
    fn test_http_status_retry_classes() {
        assert!(TransferError::HttpStatus { status: 503, offset: 0 }.is_retryable());
        assert!(TransferError::HttpStatus { status: 429, offset: 0 }.is_retryable());
        assert!(!TransferError::HttpStatus { status: 403, offset: 0 }.is_retryable());
    }
}
