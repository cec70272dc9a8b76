//! Error types for domain synchronization
//!
//! Errors are classified by how the sync core reacts to them:
//! - Transport: network unreachable, non-2xx status, timeout. Degrades one domain.
//! - Malformed: payload did not decode. Treated like a transport failure.
//! - Local: config, preferences or snapshot persistence problems.

use std::path::PathBuf;
use thiserror::Error;

/// Error types for domain fetches and local persistence
#[derive(Debug, Error)]
pub enum SyncError {
    // Transport errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    // Payload errors
    #[error("Malformed payload: {0}")]
    Malformed(String),

    // Local errors
    #[error("No endpoint configured for {0}")]
    NotConfigured(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(String),
}

impl SyncError {
    /// Whether a domain's legacy endpoint is worth one attempt after this error.
    ///
    /// 404 is included: older deployments only expose the legacy route.
    pub fn should_try_fallback(&self) -> bool {
        match self {
            SyncError::Network(_) | SyncError::Timeout(_) | SyncError::Malformed(_) => true,
            SyncError::Http { status, .. } => *status == 404 || *status >= 500,
            _ => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Network(_) | SyncError::Http { .. } | SyncError::Timeout(_) => {
                ErrorKind::Transport
            }
            SyncError::Malformed(_) => ErrorKind::Malformed,
            SyncError::NotConfigured(_)
            | SyncError::Config(_)
            | SyncError::ConfigNotFound(_)
            | SyncError::Io(_) => ErrorKind::Local,
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Malformed(err.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(0)
        } else if err.is_decode() {
            SyncError::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            SyncError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

/// Serializable error stored in a cache entry and surfaced to the deriver
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainError {
    pub message: String,
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Transport,
    Malformed,
    Local,
}

impl From<&SyncError> for DomainError {
    fn from(err: &SyncError) -> Self {
        let status = match err {
            SyncError::Http { status, .. } => Some(*status),
            _ => None,
        };
        DomainError {
            message: err.to_string(),
            kind: err.kind(),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_classification() {
        assert!(SyncError::Network("down".into()).should_try_fallback());
        assert!(SyncError::Http { status: 502, message: String::new() }.should_try_fallback());
        assert!(SyncError::Http { status: 404, message: String::new() }.should_try_fallback());
        assert!(!SyncError::Http { status: 401, message: String::new() }.should_try_fallback());
        assert!(!SyncError::NotConfigured("attendance".into()).should_try_fallback());
    }

    #[test]
    fn test_domain_error_keeps_status() {
        let err = SyncError::Http {
            status: 503,
            message: "unavailable".into(),
        };
        let domain_err = DomainError::from(&err);
        assert_eq!(domain_err.kind, ErrorKind::Transport);
        assert_eq!(domain_err.status, Some(503));
        assert!(domain_err.message.contains("503"));
    }
}
