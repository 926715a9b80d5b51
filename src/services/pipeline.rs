use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::models::UploadDescriptor;
use crate::services::classifier::MediaTypeClassifier;
use crate::services::digester::{self, Digest};
use crate::services::scanner::{self, ContentScanner, NoOpScanner};
use crate::services::store::ContentAddressedStore;
use crate::utils::hash::{ContentHasher, DigestAlgorithm};
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWriteExt};

pub trait SeekableSource: AsyncRead + AsyncSeek + Unpin + Send {}
impl<T: AsyncRead + AsyncSeek + Unpin + Send> SeekableSource for T {}

/// Byte source handed to the pipeline.
pub enum UploadSource {
    /// A file already on disk. Scanned in place.
    Path(PathBuf),
    Bytes(Bytes),
    Seekable(Box<dyn SeekableSource>),
    /// Forward-only stream; spooled to a temporary file before use.
    Stream(Box<dyn AsyncRead + Unpin + Send>),
}

impl UploadSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        UploadSource::Path(path.into())
    }

    pub fn seekable(reader: impl SeekableSource + 'static) -> Self {
        UploadSource::Seekable(Box::new(reader))
    }

    pub fn stream(reader: impl AsyncRead + Unpin + Send + 'static) -> Self {
        UploadSource::Stream(Box::new(reader))
    }
}

impl From<Bytes> for UploadSource {
    fn from(bytes: Bytes) -> Self {
        UploadSource::Bytes(bytes)
    }
}

impl From<Vec<u8>> for UploadSource {
    fn from(bytes: Vec<u8>) -> Self {
        UploadSource::Bytes(Bytes::from(bytes))
    }
}

/// Rewindable view of an upload, plus the on-disk file backing it if any.
struct Prepared {
    reader: Box<dyn SeekableSource>,
    materialized: Option<PathBuf>,
    name_hint: Option<String>,
    // Removed from disk when dropped.
    _spool: Option<NamedTempFile>,
}

impl Prepared {
    async fn rewind(&mut self) -> Result<()> {
        self.reader
            .seek(SeekFrom::Start(0))
            .await
            .map_err(IngestError::SourceRead)?;
        Ok(())
    }
}

pub struct IngestionPipeline {
    store: Arc<ContentAddressedStore>,
    classifier: Arc<MediaTypeClassifier>,
    scanner: Arc<dyn ContentScanner>,
    algorithm: DigestAlgorithm,
    chunk_size: usize,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<ContentAddressedStore>,
        classifier: Arc<MediaTypeClassifier>,
        scanner: Arc<dyn ContentScanner>,
        algorithm: DigestAlgorithm,
        chunk_size: usize,
    ) -> Self {
        Self {
            store,
            classifier,
            scanner,
            algorithm,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Builds the pipeline described by `config`. A disabled scanner is
    /// replaced by [`NoOpScanner`].
    pub async fn from_config(config: &IngestConfig) -> Result<Self> {
        let scanner: Arc<dyn ContentScanner> = if config.enable_virus_scan {
            scanner::create_scanner(config)?
        } else {
            Arc::new(NoOpScanner)
        };
        Ok(Self::new(
            Arc::new(ContentAddressedStore::from_config(config)),
            Arc::new(MediaTypeClassifier::from_config(config).await?),
            scanner,
            config.digest_algorithm,
            config.chunk_size,
        ))
    }

    pub fn store(&self) -> &ContentAddressedStore {
        &self.store
    }

    pub fn scanner(&self) -> &Arc<dyn ContentScanner> {
        &self.scanner
    }

    /// Scans (optionally), fingerprints, classifies and stores one upload.
    pub async fn ingest(
        &self,
        source: UploadSource,
        declared_name: Option<&str>,
        scan: bool,
    ) -> Result<UploadDescriptor> {
        let prepared = self.prepare(source, declared_name, scan).await?;
        self.complete(prepared, None, scan).await
    }

    /// Starts an upload whose bytes arrive piecewise.
    pub fn begin_chunked(&self, name: Option<&str>) -> Result<ChunkedUpload<'_>> {
        let spool = NamedTempFile::new().map_err(|e| IngestError::storage(std::env::temp_dir(), e))?;
        let file = spool
            .reopen()
            .map_err(|e| IngestError::storage(spool.path(), e))?;
        Ok(ChunkedUpload {
            pipeline: self,
            name: name.map(str::to_string),
            file: tokio::fs::File::from_std(file),
            spool,
            hasher: self.algorithm.hasher(),
            size: 0,
            failed: false,
        })
    }

    async fn prepare(
        &self,
        source: UploadSource,
        declared_name: Option<&str>,
        need_file: bool,
    ) -> Result<Prepared> {
        let declared = declared_name.map(str::to_string);
        match source {
            UploadSource::Path(path) => {
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(IngestError::SourceRead)?;
                // The file's own name takes precedence over the declared one.
                let name_hint = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
                    .or(declared);
                Ok(Prepared {
                    reader: Box::new(file),
                    materialized: Some(path),
                    name_hint,
                    _spool: None,
                })
            }
            UploadSource::Bytes(bytes) if !need_file => Ok(Prepared {
                reader: Box::new(std::io::Cursor::new(bytes)),
                materialized: None,
                name_hint: declared,
                _spool: None,
            }),
            UploadSource::Bytes(bytes) => {
                self.spool(std::io::Cursor::new(bytes), declared).await
            }
            UploadSource::Seekable(reader) if !need_file => Ok(Prepared {
                reader,
                materialized: None,
                name_hint: declared,
                _spool: None,
            }),
            UploadSource::Seekable(mut reader) => {
                reader
                    .seek(SeekFrom::Start(0))
                    .await
                    .map_err(IngestError::SourceRead)?;
                self.spool(reader, declared).await
            }
            UploadSource::Stream(reader) => self.spool(reader, declared).await,
        }
    }

    /// Copies `reader` into a temporary file and reopens it for reading.
    async fn spool<R>(&self, mut reader: R, name_hint: Option<String>) -> Result<Prepared>
    where
        R: AsyncRead + Unpin,
    {
        let spool = NamedTempFile::new().map_err(|e| IngestError::storage(std::env::temp_dir(), e))?;
        let path = spool.path().to_owned();
        let mut out = tokio::fs::File::from_std(
            spool.reopen().map_err(|e| IngestError::storage(&path, e))?,
        );

        let mut buffer = vec![0u8; self.chunk_size];
        let mut total = 0u64;
        loop {
            let n = reader
                .read(&mut buffer)
                .await
                .map_err(IngestError::SourceRead)?;
            if n == 0 {
                break;
            }
            out.write_all(&buffer[..n])
                .await
                .map_err(|e| IngestError::storage(&path, e))?;
            total += n as u64;
        }
        out.flush().await.map_err(|e| IngestError::storage(&path, e))?;
        tracing::debug!("Spooled {} bytes to {}", total, path.display());

        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| IngestError::storage(&path, e))?;
        Ok(Prepared {
            reader: Box::new(file),
            materialized: Some(path),
            name_hint,
            _spool: Some(spool),
        })
    }

    async fn complete(
        &self,
        mut prepared: Prepared,
        known: Option<Digest>,
        scan: bool,
    ) -> Result<UploadDescriptor> {
        if scan {
            let path = prepared.materialized.as_deref().ok_or_else(|| {
                IngestError::ScannerUnavailable("No materialized file to scan".to_string())
            })?;
            self.scan(path).await?;
        }

        let digest = match known {
            Some(digest) => digest,
            None => {
                prepared.rewind().await?;
                digester::digest(&mut prepared.reader, self.algorithm, self.chunk_size).await?
            }
        };

        prepared.rewind().await?;
        let content_type = self
            .classifier
            .classify(prepared.name_hint.as_deref(), &mut prepared.reader)
            .await?;

        prepared.rewind().await?;
        let location = self.store.put(&digest.checksum, &mut prepared.reader).await?;

        let descriptor = UploadDescriptor {
            key: location.key.clone(),
            checksum: digest.checksum,
            size: digest.size,
            content_type,
            storage_path: location.path,
        };
        tracing::info!(
            "Ingested {} ({} bytes, {})",
            descriptor.key,
            descriptor.size,
            descriptor.content_type
        );
        Ok(descriptor)
    }

    async fn scan(&self, path: &Path) -> Result<()> {
        let verdict = self.scanner.scan(path).await?;
        if verdict.clean {
            tracing::debug!("Scan clean: {}", path.display());
            return Ok(());
        }
        Err(IngestError::ContentRejected {
            detail: verdict
                .detail
                .unwrap_or_else(|| "content flagged by scanner".to_string()),
        })
    }
}

/// Upload received chunk by chunk, hashed as it is spooled.
///
/// A failed chunk write poisons the upload: every later call fails.
pub struct ChunkedUpload<'a> {
    pipeline: &'a IngestionPipeline,
    name: Option<String>,
    spool: NamedTempFile,
    file: tokio::fs::File,
    hasher: ContentHasher,
    size: u64,
    failed: bool,
}

impl ChunkedUpload<'_> {
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_intact()?;
        if let Err(e) = self.file.write_all(data).await {
            self.failed = true;
            return Err(IngestError::storage(self.spool.path(), e));
        }
        self.hasher.update(data);
        self.size += data.len() as u64;
        Ok(())
    }

    fn ensure_intact(&self) -> Result<()> {
        if self.failed {
            return Err(IngestError::storage(
                self.spool.path(),
                std::io::Error::other("an earlier chunk failed to spool"),
            ));
        }
        Ok(())
    }

    pub fn bytes_received(&self) -> u64 {
        self.size
    }

    pub async fn finish(self, scan: bool) -> Result<UploadDescriptor> {
        self.ensure_intact()?;
        let ChunkedUpload {
            pipeline,
            name,
            spool,
            mut file,
            hasher,
            size,
            failed: _,
        } = self;

        file.flush()
            .await
            .map_err(|e| IngestError::storage(spool.path(), e))?;
        drop(file);

        let path = spool.path().to_owned();
        let reader = tokio::fs::File::open(&path)
            .await
            .map_err(|e| IngestError::storage(&path, e))?;
        let digest = Digest {
            checksum: hasher.finalize_hex(),
            size,
        };
        let prepared = Prepared {
            reader: Box::new(reader),
            materialized: Some(path),
            name_hint: name,
            _spool: Some(spool),
        };
        pipeline.complete(prepared, Some(digest), scan).await
    }
}
