use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Content-derived identity of a blob, also used as its storage-relative path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobKey(String);

impl BlobKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlobKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for BlobKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Where a blob lives: its key and the absolute path derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLocation {
    pub key: BlobKey,
    pub path: PathBuf,
}

impl StorageLocation {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Result of ingesting one upload. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadDescriptor {
    pub key: BlobKey,
    pub checksum: String,
    pub size: u64,
    pub content_type: String,
    pub storage_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanVerdict {
    pub clean: bool,
    pub detail: Option<String>,
}

impl ScanVerdict {
    pub fn clean() -> Self {
        Self {
            clean: true,
            detail: None,
        }
    }

    pub fn infected(detail: impl Into<String>) -> Self {
        Self {
            clean: false,
            detail: Some(detail.into()),
        }
    }
}
