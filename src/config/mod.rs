use crate::error::{IngestError, Result};
use crate::services::store::StorageLayout;
use crate::utils::hash::DigestAlgorithm;
use std::env;
use std::path::PathBuf;

/// Configuration for blob ingestion
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Root directory of the blob store (default: "./blobs")
    pub storage_root: PathBuf,

    /// Key-to-path layout (default: flat)
    pub layout: StorageLayout,

    /// Permission bits for new blobs; `None` leaves the OS default
    pub file_permissions: Option<u32>,

    /// Chunk size for streaming I/O in bytes (default: 64 KB)
    pub chunk_size: usize,

    /// Bytes inspected by magic sniffing (default: 1024)
    pub sniff_length: usize,

    /// Checksum algorithm (default: sha256)
    pub digest_algorithm: DigestAlgorithm,

    /// Enable virus scanning (default: false)
    pub enable_virus_scan: bool,

    /// Virus scanner type: "clamav" or "noop" (default: "noop")
    pub virus_scanner_type: String,

    /// ClamAV host (default: "127.0.0.1")
    pub clamav_host: String,

    /// ClamAV port (default: 3310)
    pub clamav_port: u16,

    /// clamd Unix socket; takes precedence over host/port when set
    pub clamav_socket: Option<PathBuf>,

    /// Additional `mime.types` table consulted before the built-in one
    pub mime_types_file: Option<PathBuf>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./blobs"),
            layout: StorageLayout::Flat,
            file_permissions: None,
            chunk_size: 64 * 1024, // 64 KB
            sniff_length: 1024,
            digest_algorithm: DigestAlgorithm::Sha256,
            enable_virus_scan: false,
            virus_scanner_type: "noop".to_string(),
            clamav_host: "127.0.0.1".to_string(),
            clamav_port: 3310,
            clamav_socket: None,
            mime_types_file: None,
        }
    }
}

impl IngestConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let default = Self::default();

        Ok(Self {
            storage_root: env::var("STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(default.storage_root),

            layout: match env::var("STORAGE_LAYOUT") {
                Ok(v) => v.parse()?,
                Err(_) => default.layout,
            },

            file_permissions: match env::var("FILE_UPLOAD_PERMISSIONS") {
                Ok(v) => Some(parse_mode(&v)?),
                Err(_) => default.file_permissions,
            },

            chunk_size: env::var("CHUNK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(default.chunk_size),

            sniff_length: env::var("SNIFF_LENGTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(default.sniff_length),

            digest_algorithm: match env::var("DIGEST_ALGORITHM") {
                Ok(v) => v.parse()?,
                Err(_) => default.digest_algorithm,
            },

            enable_virus_scan: env::var("ENABLE_VIRUS_SCAN")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(default.enable_virus_scan),

            virus_scanner_type: env::var("VIRUS_SCANNER_TYPE")
                .unwrap_or(default.virus_scanner_type),

            clamav_host: env::var("CLAMAV_HOST").unwrap_or(default.clamav_host),

            clamav_port: env::var("CLAMAV_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.clamav_port),

            clamav_socket: env::var("CLAMAV_SOCKET").ok().map(PathBuf::from),

            mime_types_file: env::var("MIME_TYPES_FILE").ok().map(PathBuf::from),
        })
    }

    /// Create config for development (no virus scanning)
    pub fn development() -> Self {
        Self {
            enable_virus_scan: false,
            virus_scanner_type: "noop".to_string(),
            ..Self::default()
        }
    }
}

/// Parses an octal permission string such as `0644`, `644` or `0o644`.
pub fn parse_mode(value: &str) -> Result<u32> {
    let digits = value.trim();
    let digits = digits.strip_prefix("0o").unwrap_or(digits);
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|mode| *mode <= 0o7777)
        .ok_or_else(|| IngestError::Config(format!("Invalid file permissions '{}'", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = IngestConfig::default();
        assert_eq!(config.chunk_size, 64 * 1024);
        assert_eq!(config.sniff_length, 1024);
        assert_eq!(config.layout, StorageLayout::Flat);
        assert_eq!(config.digest_algorithm, DigestAlgorithm::Sha256);
        assert!(config.file_permissions.is_none());
        assert!(!config.enable_virus_scan);
    }

    #[test]
    fn test_development_config() {
        let config = IngestConfig::development();
        assert!(!config.enable_virus_scan);
        assert_eq!(config.virus_scanner_type, "noop");
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("0644").unwrap(), 0o644);
        assert_eq!(parse_mode("600").unwrap(), 0o600);
        assert_eq!(parse_mode("0o755").unwrap(), 0o755);
        assert!(parse_mode("rw-r--r--").is_err());
        assert!(parse_mode("0999").is_err());
        assert!(parse_mode("77777").is_err());
    }
}
