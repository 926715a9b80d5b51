pub mod config;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::config::IngestConfig;
pub use crate::error::{IngestError, Result};
pub use crate::models::{BlobKey, ScanVerdict, StorageLocation, UploadDescriptor};
pub use crate::services::classifier::MediaTypeClassifier;
pub use crate::services::pipeline::{ChunkedUpload, IngestionPipeline, UploadSource};
pub use crate::services::scanner::ContentScanner;
pub use crate::services::store::{ContentAddressedStore, PutOutcome, StorageLayout};
