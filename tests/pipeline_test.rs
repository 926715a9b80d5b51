use async_trait::async_trait;
use blob_ingest::services::classifier::MediaTypeClassifier;
use blob_ingest::services::scanner::{ContentScanner, NoOpScanner};
use blob_ingest::utils::hash::DigestAlgorithm;
use blob_ingest::{
    ContentAddressedStore, IngestError, IngestionPipeline, Result, ScanVerdict, UploadSource,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
const PNG_HEADER: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01\x08\x06\0\0\0";

struct InfectedScanner;

#[async_trait]
impl ContentScanner for InfectedScanner {
    async fn scan(&self, _path: &Path) -> Result<ScanVerdict> {
        Ok(ScanVerdict::infected("Test.Virus.EICAR"))
    }

    async fn health_check(&self) -> bool {
        true
    }
}

struct OfflineScanner;

#[async_trait]
impl ContentScanner for OfflineScanner {
    async fn scan(&self, _path: &Path) -> Result<ScanVerdict> {
        Err(IngestError::ScannerUnavailable("connection refused".to_string()))
    }

    async fn health_check(&self) -> bool {
        false
    }
}

#[derive(Default)]
struct CountingScanner {
    calls: AtomicUsize,
}

#[async_trait]
impl ContentScanner for CountingScanner {
    async fn scan(&self, path: &Path) -> Result<ScanVerdict> {
        assert!(path.is_file());
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ScanVerdict::clean())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

fn pipeline(dir: &TempDir, scanner: Arc<dyn ContentScanner>) -> IngestionPipeline {
    IngestionPipeline::new(
        Arc::new(ContentAddressedStore::new(dir.path().join("blobs"))),
        Arc::new(MediaTypeClassifier::default()),
        scanner,
        DigestAlgorithm::Sha256,
        4096,
    )
}

#[tokio::test]
async fn test_empty_upload_has_well_known_digest() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir, Arc::new(NoOpScanner));
    let descriptor = pipeline.ingest(Vec::new().into(), None, false).await.unwrap();

    assert_eq!(descriptor.checksum, EMPTY_SHA256);
    assert_eq!(descriptor.size, 0);
    assert_eq!(descriptor.content_type, "application/octet-stream");
    assert_eq!(tokio::fs::metadata(&descriptor.storage_path).await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_extension_beats_sniffed_type() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir, Arc::new(NoOpScanner));
    let descriptor = pipeline
        .ingest(PNG_HEADER.to_vec().into(), Some("report.pdf"), false)
        .await
        .unwrap();
    assert_eq!(descriptor.content_type, "application/pdf");
}

#[tokio::test]
async fn test_png_sniffed_without_name() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir, Arc::new(NoOpScanner));
    let descriptor = pipeline
        .ingest(
            UploadSource::seekable(std::io::Cursor::new(PNG_HEADER.to_vec())),
            None,
            false,
        )
        .await
        .unwrap();
    assert_eq!(descriptor.content_type, "image/png");
    assert_eq!(descriptor.size, PNG_HEADER.len() as u64);
}

#[tokio::test]
async fn test_rejected_content_is_never_stored() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir, Arc::new(InfectedScanner));
    let content = b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";
    let key = blob_ingest::utils::hash::calculate_hash(DigestAlgorithm::Sha256, content);

    for source in [
        UploadSource::from(content.to_vec()),
        UploadSource::stream(std::io::Cursor::new(content.to_vec())),
        UploadSource::seekable(std::io::Cursor::new(content.to_vec())),
    ] {
        let err = pipeline.ingest(source, Some("eicar.txt"), true).await.unwrap_err();
        assert!(err.is_content_decision(), "unexpected error: {:?}", err);
    }

    assert!(!pipeline.store().exists(&key).await.unwrap());
    assert!(!dir.path().join("blobs").join(&key).exists());
}

#[tokio::test]
async fn test_rejected_path_source_is_left_to_caller() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir, Arc::new(InfectedScanner));
    let path = dir.path().join("upload.bin");
    tokio::fs::write(&path, b"bad bytes").await.unwrap();

    let err = pipeline
        .ingest(UploadSource::path(&path), None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::ContentRejected { .. }));
    assert!(path.exists(), "caller-owned files are not deleted");
}

#[tokio::test]
async fn test_unreachable_scanner_is_not_a_rejection() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir, Arc::new(OfflineScanner));
    let err = pipeline
        .ingest(b"anything".to_vec().into(), None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::ScannerUnavailable(_)));
    assert!(!err.is_content_decision());
}

#[tokio::test]
async fn test_clean_scan_then_store() {
    let dir = TempDir::new().unwrap();
    let scanner = Arc::new(CountingScanner::default());
    let pipeline = pipeline(&dir, scanner.clone());

    let descriptor = pipeline
        .ingest(
            UploadSource::stream(std::io::Cursor::new(b"clean payload".to_vec())),
            Some("payload.txt"),
            true,
        )
        .await
        .unwrap();

    assert_eq!(scanner.calls.load(Ordering::SeqCst), 1);
    assert_eq!(descriptor.content_type, "text/plain");
    assert_eq!(
        tokio::fs::read(&descriptor.storage_path).await.unwrap(),
        b"clean payload"
    );
}

#[tokio::test]
async fn test_chunked_upload_rejected_by_scan() {
    let dir = TempDir::new().unwrap();
    let pipeline = pipeline(&dir, Arc::new(InfectedScanner));

    let mut upload = pipeline.begin_chunked(Some("virus.txt")).unwrap();
    upload.write_chunk(b"part one, ").await.unwrap();
    upload.write_chunk(b"part two").await.unwrap();
    let err = upload.finish(true).await.unwrap_err();
    assert!(err.is_content_decision());

    let key =
        blob_ingest::utils::hash::calculate_hash(DigestAlgorithm::Sha256, b"part one, part two");
    assert!(!pipeline.store().exists(&key).await.unwrap());
}
