use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::models::ScanVerdict;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// Trait for content scanning implementations
#[async_trait::async_trait]
pub trait ContentScanner: Send + Sync {
    /// Scan a materialized file for disallowed content
    async fn scan(&self, path: &Path) -> Result<ScanVerdict>;

    /// Check if the scanner is available/healthy
    async fn health_check(&self) -> bool;
}

trait ClamStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClamStream for T {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClamAvEndpoint {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix(PathBuf),
}

impl std::fmt::Display for ClamAvEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClamAvEndpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            #[cfg(unix)]
            ClamAvEndpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// ClamAV scanner talking to clamd over TCP or a Unix socket
///
/// Docker command to run ClamAV:
/// ```bash
/// docker run -d --name clamav -p 3310:3310 clamav/clamav:latest
/// ```
pub struct ClamAvScanner {
    endpoint: ClamAvEndpoint,
    chunk_size: usize,
    timeout: Duration,
}

impl ClamAvScanner {
    pub fn new(host: String, port: u16) -> Self {
        Self::with_endpoint(ClamAvEndpoint::Tcp { host, port })
    }

    #[cfg(unix)]
    pub fn unix(socket: impl Into<PathBuf>) -> Self {
        Self::with_endpoint(ClamAvEndpoint::Unix(socket.into()))
    }

    pub fn with_endpoint(endpoint: ClamAvEndpoint) -> Self {
        Self {
            endpoint,
            chunk_size: 64 * 1024,
            timeout: Duration::from_secs(300),
        }
    }

    pub fn from_config(config: &IngestConfig) -> Self {
        let scanner = match &config.clamav_socket {
            #[cfg(unix)]
            Some(socket) => Self::unix(socket.clone()),
            _ => Self::new(config.clamav_host.clone(), config.clamav_port),
        };
        scanner.with_chunk_size(config.chunk_size)
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn connect(&self) -> Result<Box<dyn ClamStream>> {
        let unavailable = |e: std::io::Error| {
            IngestError::ScannerUnavailable(format!(
                "Failed to connect to ClamAV at {}: {}",
                self.endpoint, e
            ))
        };
        match &self.endpoint {
            ClamAvEndpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(unavailable)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            ClamAvEndpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(unavailable)?;
                Ok(Box::new(stream))
            }
        }
    }

    async fn stream_file(&self, stream: &mut Box<dyn ClamStream>, path: &Path) -> Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(IngestError::SourceRead)?;

        // Use INSTREAM command for streaming data to clamd
        // Format: zINSTREAM\0 <length:u32 big-endian> <data> ... <0:u32>
        stream.write_all(b"zINSTREAM\0").await.map_err(connection_lost)?;

        let mut buffer = vec![0u8; self.chunk_size];
        let mut total_sent = 0u64;
        loop {
            let n = file.read(&mut buffer).await.map_err(IngestError::SourceRead)?;
            if n == 0 {
                break;
            }
            let len = (n as u32).to_be_bytes();
            stream.write_all(&len).await.map_err(connection_lost)?;
            stream.write_all(&buffer[..n]).await.map_err(connection_lost)?;
            total_sent += n as u64;
        }

        // Send zero-length chunk to indicate end of stream
        stream.write_all(&0u32.to_be_bytes()).await.map_err(connection_lost)?;
        stream.flush().await.map_err(connection_lost)?;
        tracing::debug!("Finished sending {} bytes to ClamAV", total_sent);

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.map_err(connection_lost)?;
        Ok(response)
    }

    /// Sends `zPING` and returns clamd's trimmed reply.
    async fn ping(&self) -> Result<String> {
        let mut stream = self.connect().await?;
        stream.write_all(b"zPING\0").await.map_err(connection_lost)?;
        stream.flush().await.map_err(connection_lost)?;

        let mut response = [0u8; 16];
        let n = stream.read(&mut response).await.map_err(connection_lost)?;
        Ok(String::from_utf8_lossy(&response[..n])
            .trim_end_matches('\0')
            .trim()
            .to_string())
    }
}

fn connection_lost(e: std::io::Error) -> IngestError {
    IngestError::ScannerUnavailable(format!("ClamAV connection lost: {}", e))
}

/// Interprets a clamd reply such as `stream: OK` or `stream: Eicar-Signature FOUND`.
pub fn parse_clamd_response(raw: &[u8]) -> Result<ScanVerdict> {
    let response = String::from_utf8_lossy(raw);
    let response = response.trim_end_matches('\0').trim();

    tracing::debug!("ClamAV response: {}", response);

    if response.ends_with("FOUND") {
        let threat = response
            .split_once(':')
            .map(|(_, rest)| rest.trim().trim_end_matches("FOUND").trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "Unknown threat".to_string());
        Ok(ScanVerdict::infected(threat))
    } else if response.ends_with("OK") {
        Ok(ScanVerdict::clean())
    } else if response.contains("ERROR") {
        let reason = if response.contains("size limit exceeded") {
            format!(
                "ClamAV limit exceeded: {}. Please increase StreamMaxLength in clamd.conf",
                response
            )
        } else {
            response.to_string()
        };
        Err(IngestError::ScannerUnavailable(reason))
    } else {
        Err(IngestError::ScannerUnavailable(format!(
            "Unexpected ClamAV response: '{}'",
            response
        )))
    }
}

#[async_trait::async_trait]
impl ContentScanner for ClamAvScanner {
    async fn scan(&self, path: &Path) -> Result<ScanVerdict> {
        let mut stream = self.connect().await?;

        let response = tokio::time::timeout(self.timeout, self.stream_file(&mut stream, path))
            .await
            .map_err(|_| {
                IngestError::ScannerUnavailable(format!(
                    "ClamAV scan timed out after {}s",
                    self.timeout.as_secs()
                ))
            })??;

        let verdict = parse_clamd_response(&response)?;
        if !verdict.clean {
            tracing::warn!(
                "ClamAV flagged {}: {}",
                path.display(),
                verdict.detail.as_deref().unwrap_or("")
            );
        }
        Ok(verdict)
    }

    async fn health_check(&self) -> bool {
        match tokio::time::timeout(self.timeout, self.ping()).await {
            Ok(Ok(reply)) if reply == "PONG" => true,
            Ok(Ok(reply)) => {
                tracing::debug!("Unexpected ClamAV ping reply '{}'", reply);
                false
            }
            Ok(Err(e)) => {
                tracing::debug!("ClamAV health check failed: {}", e);
                false
            }
            Err(_) => {
                tracing::debug!("ClamAV ping timed out at {}", self.endpoint);
                false
            }
        }
    }
}

/// No-op scanner for development/testing
pub struct NoOpScanner;

#[async_trait::async_trait]
impl ContentScanner for NoOpScanner {
    async fn scan(&self, path: &Path) -> Result<ScanVerdict> {
        tracing::warn!("NoOpScanner: Skipping scan of {}", path.display());
        Ok(ScanVerdict::clean())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Factory function to create appropriate scanner based on config.
/// An unrecognised scanner type is a configuration error.
pub fn create_scanner(config: &IngestConfig) -> Result<Arc<dyn ContentScanner>> {
    match config.virus_scanner_type.trim().to_lowercase().as_str() {
        "clamav" => Ok(Arc::new(ClamAvScanner::from_config(config))),
        "noop" | "none" | "disabled" => Ok(Arc::new(NoOpScanner)),
        other => Err(IngestError::Config(format!(
            "Unknown virus scanner type '{}'",
            other
        ))),
    }
}
