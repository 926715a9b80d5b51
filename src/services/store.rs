//! Write-once blob storage keyed by content.
//!
//! Identical keys are assumed to carry identical bytes, so the key is used
//! verbatim as the file name and never made unique. Concurrent writers of the
//! same key are arbitrated by the filesystem alone: the blob file is opened
//! with exclusive create, and whoever loses that race treats the winner's file
//! as its own result. This works across processes sharing one storage root,
//! which an in-process lock map could not.

use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::models::{BlobKey, StorageLocation};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

// Not alphanumeric, so it can never be a shard directory.
const UNSHARDED_DIR: &str = "_";

/// Mapping from key to path below the storage root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageLayout {
    /// `<root>/<key>`
    #[default]
    Flat,
    /// `<root>/<key[0..2]>/<key[2..4]>/<key>`. Keys that cannot be sharded
    /// live under `<root>/_/<key>`, apart from the shard directories.
    Sharded,
}

impl fmt::Display for StorageLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageLayout::Flat => write!(f, "flat"),
            StorageLayout::Sharded => write!(f, "sharded"),
        }
    }
}

impl FromStr for StorageLayout {
    type Err = IngestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "flat" => Ok(StorageLayout::Flat),
            "sharded" => Ok(StorageLayout::Sharded),
            other => Err(IngestError::Config(format!(
                "Unknown storage layout '{}'",
                other
            ))),
        }
    }
}

impl StorageLayout {
    fn relative_path(self, key: &str) -> PathBuf {
        match self {
            StorageLayout::Sharded
                if key.len() >= 4 && key.bytes().take(4).all(|b| b.is_ascii_alphanumeric()) =>
            {
                Path::new(&key[..2]).join(&key[2..4]).join(key)
            }
            StorageLayout::Sharded => Path::new(UNSHARDED_DIR).join(key),
            StorageLayout::Flat => PathBuf::from(key),
        }
    }
}

/// How a `put` call ended. All three are successes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// This call created and wrote the blob.
    Written,
    /// The blob was already present; the source was not read.
    AlreadyPresent,
    /// Another writer created the blob between our existence check and our
    /// exclusive create; its content is authoritative.
    LostRace,
}

#[derive(Debug, Clone)]
pub struct ContentAddressedStore {
    root: PathBuf,
    layout: StorageLayout,
    permissions: Option<u32>,
    chunk_size: usize,
}

impl ContentAddressedStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            layout: StorageLayout::Flat,
            permissions: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        Self::new(config.storage_root.clone())
            .with_layout(config.layout)
            .with_permissions(config.file_permissions)
            .with_chunk_size(config.chunk_size)
    }

    pub fn with_layout(mut self, layout: StorageLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Permission bits applied to newly written blobs. `None` keeps the OS default.
    pub fn with_permissions(mut self, mode: Option<u32>) -> Self {
        self.permissions = mode;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pure mapping from key to location. Fails only for invalid keys.
    pub fn location(&self, key: &str) -> Result<StorageLocation> {
        validate_key(key)?;
        Ok(StorageLocation {
            key: BlobKey::new(key),
            path: self.root.join(self.layout.relative_path(key)),
        })
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let location = self.location(key)?;
        tokio::fs::try_exists(&location.path)
            .await
            .map_err(|e| IngestError::storage(&location.path, e))
    }

    pub async fn open(&self, key: &str) -> Result<File> {
        let location = self.location(key)?;
        File::open(&location.path)
            .await
            .map_err(|e| IngestError::storage(&location.path, e))
    }

    /// Stores `source` under `key` unless a blob with that key already exists.
    pub async fn put<R>(&self, key: &str, source: R) -> Result<StorageLocation>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.put_with_outcome(key, source)
            .await
            .map(|(location, _)| location)
    }

    pub async fn put_with_outcome<R>(
        &self,
        key: &str,
        source: R,
    ) -> Result<(StorageLocation, PutOutcome)>
    where
        R: AsyncRead + Unpin + Send,
    {
        let location = self.location(key)?;

        // Must happen before the source is touched: it may be single-use.
        let present = tokio::fs::try_exists(&location.path)
            .await
            .map_err(|e| IngestError::storage(&location.path, e))?;
        if present {
            tracing::debug!("Blob {} already stored, skipping write", key);
            return Ok((location, PutOutcome::AlreadyPresent));
        }

        ensure_parent_dir(&location.path).await?;

        let outcome = self.write_new(&location.path, source).await?;
        match outcome {
            PutOutcome::Written => {
                tracing::info!("Stored blob {} at {}", key, location.path.display());
                self.apply_permissions(&location.path).await;
            }
            PutOutcome::LostRace => {
                tracing::info!("Blob {} written concurrently by another writer", key);
            }
            PutOutcome::AlreadyPresent => {}
        }
        Ok((location, outcome))
    }

    async fn write_new<R>(&self, path: &Path, mut source: R) -> Result<PutOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(PutOutcome::LostRace),
            Err(e) => return Err(IngestError::storage(path, e)),
        };

        let written = match lock::lock_exclusive(&file) {
            Ok(()) => {
                let res = self.copy_chunks(&mut source, &mut file, path).await;
                lock::unlock(&file);
                res
            }
            Err(e) => Err(IngestError::storage(path, e)),
        };
        drop(file);

        match written {
            Ok(bytes) => {
                tracing::debug!("Wrote {} bytes to {}", bytes, path.display());
                Ok(PutOutcome::Written)
            }
            Err(e) => {
                // We created this file, so nobody else can be relying on it yet.
                if let Err(rm) = tokio::fs::remove_file(path).await {
                    tracing::warn!("Failed to remove partial blob {}: {}", path.display(), rm);
                }
                Err(e)
            }
        }
    }

    async fn copy_chunks<R>(&self, source: &mut R, file: &mut File, path: &Path) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut total = 0u64;
        loop {
            let n = source
                .read(&mut buffer)
                .await
                .map_err(IngestError::SourceRead)?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n])
                .await
                .map_err(|e| IngestError::storage(path, e))?;
            total += n as u64;
        }
        file.flush()
            .await
            .map_err(|e| IngestError::storage(path, e))?;
        file.sync_all()
            .await
            .map_err(|e| IngestError::storage(path, e))?;
        Ok(total)
    }

    async fn apply_permissions(&self, path: &Path) {
        let Some(mode) = self.permissions else {
            return;
        };
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(mode);
            if let Err(e) = tokio::fs::set_permissions(path, perms).await {
                tracing::warn!(
                    "Failed to apply permissions {:o} to {}: {}",
                    mode,
                    path.display(),
                    e
                );
            }
        }
        #[cfg(not(unix))]
        tracing::warn!(
            "File permissions {:o} not supported on this platform, leaving {} as is",
            mode,
            path.display()
        );
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(IngestError::invalid_key(key, "key must not be empty"));
    }
    if key.contains('\0') {
        return Err(IngestError::invalid_key(key, "key contains a NUL byte"));
    }
    if Path::new(key).is_absolute() || key.starts_with('/') {
        return Err(IngestError::invalid_key(key, "key must be relative"));
    }
    let escapes = key
        .split('/')
        .any(|part| part.is_empty() || part == "." || part == "..");
    let non_normal = Path::new(key)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if escapes || non_normal {
        return Err(IngestError::invalid_key(
            key,
            "key contains empty, '.' or '..' path components",
        ));
    }
    Ok(())
}

/// Creates the parent directory of `path`, tolerating concurrent creation.
async fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    match tokio::fs::metadata(parent).await {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => {
            return Err(IngestError::storage(
                parent,
                std::io::Error::new(
                    ErrorKind::NotADirectory,
                    format!("{} exists and is not a directory", parent.display()),
                ),
            ));
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(IngestError::storage(parent, e)),
    }

    match tokio::fs::create_dir_all(parent).await {
        Ok(()) => Ok(()),
        // Someone else created it first; that's what we wanted.
        Err(e) if e.kind() == ErrorKind::AlreadyExists => match tokio::fs::metadata(parent).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            _ => Err(IngestError::storage(parent, e)),
        },
        Err(e) => Err(IngestError::storage(parent, e)),
    }
}

#[cfg(unix)]
mod lock {
    use std::os::fd::AsRawFd;
    use nix::fcntl::{FlockArg, flock};
    use tokio::fs::File;

    pub fn lock_exclusive(file: &File) -> std::io::Result<()> {
        flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(std::io::Error::from)
    }

    pub fn unlock(file: &File) {
        if let Err(e) = flock(file.as_raw_fd(), FlockArg::Unlock) {
            tracing::debug!("flock unlock failed: {}", e);
        }
    }
}

#[cfg(not(unix))]
mod lock {
    use tokio::fs::File;

    pub fn lock_exclusive(_file: &File) -> std::io::Result<()> {
        Ok(())
    }

    pub fn unlock(_file: &File) {}
}
