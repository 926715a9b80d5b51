use crate::error::{IngestError, Result};
use crate::utils::hash::{ContentHasher, DigestAlgorithm};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Checksum and byte count of a fully consumed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    pub checksum: String,
    pub size: u64,
}

/// `AsyncRead` adapter that hashes every byte passing through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Option<ContentHasher>,
    bytes_read: u64,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R, algorithm: DigestAlgorithm) -> Self {
        Self {
            inner,
            hasher: Some(algorithm.hasher()),
            bytes_read: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Consumes the adapter, returning the digest of the bytes read so far and
    /// the inner reader.
    pub fn finish(mut self) -> (Digest, R) {
        let checksum = self
            .hasher
            .take()
            .map(ContentHasher::finalize_hex)
            .unwrap_or_default();
        (
            Digest {
                checksum,
                size: self.bytes_read,
            },
            self.inner,
        )
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &res {
            let fresh = &buf.filled()[before..];
            if let Some(hasher) = this.hasher.as_mut() {
                hasher.update(fresh);
            }
            this.bytes_read += fresh.len() as u64;
        }
        res
    }
}

/// Hashes `stream` to exhaustion in chunks of at most `chunk_size` bytes.
///
/// The stream must be positioned at its start; it is left exhausted.
pub async fn digest<R>(stream: R, algorithm: DigestAlgorithm, chunk_size: usize) -> Result<Digest>
where
    R: AsyncRead + Unpin,
{
    let mut reader = HashingReader::new(stream, algorithm);
    let mut buffer = vec![0u8; chunk_size.max(1)];
    loop {
        let n = reader
            .read(&mut buffer)
            .await
            .map_err(IngestError::SourceRead)?;
        if n == 0 {
            break;
        }
    }
    let (digest, _) = reader.finish();
    tracing::debug!("Digested {} bytes: {}", digest.size, digest.checksum);
    Ok(digest)
}
