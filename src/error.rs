use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Invalid blob key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Storage write failed at {}: {source}", path.display())]
    StorageWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Content rejected: {detail}")]
    ContentRejected { detail: String },

    #[error("Scanner unavailable: {0}")]
    ScannerUnavailable(String),

    #[error("Failed to read upload source: {0}")]
    SourceRead(#[source] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IngestError {
    pub(crate) fn invalid_key(key: &str, reason: impl Into<String>) -> Self {
        IngestError::InvalidKey {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IngestError::StorageWrite {
            path: path.into(),
            source,
        }
    }

    /// True for failures that reflect a decision about the content itself,
    /// as opposed to an operational problem.
    pub fn is_content_decision(&self) -> bool {
        matches!(self, IngestError::ContentRejected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_is_distinct_from_unavailable() {
        let rejected = IngestError::ContentRejected {
            detail: "Eicar-Signature".to_string(),
        };
        let unavailable = IngestError::ScannerUnavailable("connection refused".to_string());
        assert!(rejected.is_content_decision());
        assert!(!unavailable.is_content_decision());
    }

    #[test]
    fn test_storage_error_mentions_path() {
        let err = IngestError::storage(
            "/srv/blobs/abc",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let msg = err.to_string();
        assert!(msg.contains("/srv/blobs/abc"));
        assert!(msg.contains("denied"));
    }
}
