use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use std::collections::HashMap;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Default number of leading bytes inspected by magic sniffing.
pub const DEFAULT_SNIFF_LENGTH: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Definite(String),
    Inconclusive,
}

/// Input available to a strategy. `sample` is `None` until some strategy has
/// asked for content bytes.
pub struct ClassifyInput<'a> {
    pub name: Option<&'a str>,
    pub sample: Option<&'a [u8]>,
}

pub trait ClassifyStrategy: Send + Sync {
    /// Whether this strategy inspects content bytes.
    fn needs_sample(&self) -> bool;

    fn classify(&self, input: &ClassifyInput<'_>) -> Classification;
}

/// Filename extension lookup, with optional overrides from a `mime.types` table.
#[derive(Debug, Default, Clone)]
pub struct ExtensionLookup {
    overrides: HashMap<String, String>,
}

impl ExtensionLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_overrides(overrides: HashMap<String, String>) -> Self {
        Self { overrides }
    }

    /// Parses the `mime.types` format: `type/subtype ext1 ext2 ...`, `#` comments.
    pub fn parse_mime_types(table: &str) -> HashMap<String, String> {
        let mut overrides = HashMap::new();
        for line in table.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            let mut fields = line.split_whitespace();
            let Some(mime) = fields.next() else { continue };
            if !is_valid_mime_shape(mime) {
                continue;
            }
            for ext in fields {
                overrides.insert(ext.trim_start_matches('.').to_lowercase(), mime.to_string());
            }
        }
        overrides
    }

    pub async fn from_mime_types_file(path: &Path) -> Result<Self> {
        let table = tokio::fs::read_to_string(path).await.map_err(|e| {
            IngestError::Config(format!(
                "Failed to read MIME types file {}: {}",
                path.display(),
                e
            ))
        })?;
        let overrides = Self::parse_mime_types(&table);
        tracing::debug!(
            "Loaded {} extension overrides from {}",
            overrides.len(),
            path.display()
        );
        Ok(Self::with_overrides(overrides))
    }

    fn lookup(&self, name: &str) -> Option<String> {
        let ext = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())?;
        if let Some(mime) = self.overrides.get(&ext) {
            return Some(mime.clone());
        }
        mime_guess::from_ext(&ext).first_raw().map(str::to_string)
    }
}

impl ClassifyStrategy for ExtensionLookup {
    fn needs_sample(&self) -> bool {
        false
    }

    fn classify(&self, input: &ClassifyInput<'_>) -> Classification {
        match input.name.and_then(|n| self.lookup(n)) {
            // The generic binary type says nothing; let sniffing decide.
            Some(mime) if mime != OCTET_STREAM => Classification::Definite(mime),
            _ => Classification::Inconclusive,
        }
    }
}

/// Magic-byte sniffing over the content sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct MagicSniff;

impl ClassifyStrategy for MagicSniff {
    fn needs_sample(&self) -> bool {
        true
    }

    fn classify(&self, input: &ClassifyInput<'_>) -> Classification {
        let sample = match input.sample {
            Some(s) if !s.is_empty() => s,
            _ => return Classification::Inconclusive,
        };

        if let Some(kind) = infer::get(sample) {
            return Classification::Definite(kind.mime_type().to_string());
        }

        if looks_like_text(sample) {
            return Classification::Definite(mime::TEXT_PLAIN.essence_str().to_string());
        }

        Classification::Definite(OCTET_STREAM.to_string())
    }
}

/// A truncated sample may split a multi-byte character at the end.
fn looks_like_text(sample: &[u8]) -> bool {
    if sample.contains(&0) {
        return false;
    }
    match std::str::from_utf8(sample) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none() && e.valid_up_to() + 4 > sample.len(),
    }
}

/// Matches `type/subtype` with no whitespace and exactly one slash.
pub fn is_valid_mime_shape(value: &str) -> bool {
    match value.split_once('/') {
        Some((top, sub)) => {
            let ok = |s: &str| !s.is_empty() && !s.contains('/') && !s.chars().any(char::is_whitespace);
            ok(top) && ok(sub)
        }
        None => false,
    }
}

/// Ordered chain of classification strategies.
pub struct MediaTypeClassifier {
    strategies: Vec<Box<dyn ClassifyStrategy>>,
    sniff_length: usize,
}

impl Default for MediaTypeClassifier {
    fn default() -> Self {
        Self::new(ExtensionLookup::new(), DEFAULT_SNIFF_LENGTH)
    }
}

impl MediaTypeClassifier {
    pub fn new(extensions: ExtensionLookup, sniff_length: usize) -> Self {
        Self::with_strategies(
            vec![Box::new(extensions), Box::new(MagicSniff)],
            sniff_length,
        )
    }

    pub async fn from_config(config: &IngestConfig) -> Result<Self> {
        let extensions = match &config.mime_types_file {
            Some(path) => ExtensionLookup::from_mime_types_file(path).await?,
            None => ExtensionLookup::new(),
        };
        Ok(Self::new(extensions, config.sniff_length))
    }

    pub fn with_strategies(strategies: Vec<Box<dyn ClassifyStrategy>>, sniff_length: usize) -> Self {
        Self {
            strategies,
            sniff_length: sniff_length.max(1),
        }
    }

    pub fn sniff_length(&self) -> usize {
        self.sniff_length
    }

    /// Infers a MIME type from `name` and, only if needed, at most
    /// `sniff_length` leading bytes of `content`.
    ///
    /// Consumes part of a stream it is given. Callers holding a non-seekable
    /// source must buffer before calling this.
    pub async fn classify<R>(&self, name: Option<&str>, content: R) -> Result<String>
    where
        R: AsyncRead + Unpin,
    {
        let mut content = Some(content);
        let mut sample: Option<Vec<u8>> = None;

        for strategy in &self.strategies {
            if strategy.needs_sample() && sample.is_none() {
                let reader = content.take();
                sample = Some(match reader {
                    Some(r) => read_prefix(r, self.sniff_length).await?,
                    None => Vec::new(),
                });
            }
            let input = ClassifyInput {
                name,
                sample: sample.as_deref(),
            };
            if let Classification::Definite(mime) = strategy.classify(&input) {
                return Ok(validated(mime));
            }
        }

        Ok(OCTET_STREAM.to_string())
    }

    /// Classifies from an in-memory sample without touching any stream.
    pub fn classify_sample(&self, name: Option<&str>, sample: &[u8]) -> String {
        let sample = &sample[..sample.len().min(self.sniff_length)];
        let input = ClassifyInput {
            name,
            sample: Some(sample),
        };
        self.strategies
            .iter()
            .find_map(|s| match s.classify(&input) {
                Classification::Definite(mime) => Some(validated(mime)),
                Classification::Inconclusive => None,
            })
            .unwrap_or_else(|| OCTET_STREAM.to_string())
    }
}

fn validated(mime: String) -> String {
    if is_valid_mime_shape(&mime) {
        mime
    } else {
        tracing::debug!("Discarding malformed MIME type '{}'", mime);
        OCTET_STREAM.to_string()
    }
}

async fn read_prefix<R: AsyncRead + Unpin>(reader: R, limit: usize) -> Result<Vec<u8>> {
    let mut sample = Vec::with_capacity(limit);
    reader
        .take(limit as u64)
        .read_to_end(&mut sample)
        .await
        .map_err(IngestError::SourceRead)?;
    Ok(sample)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    #[tokio::test]
    async fn test_extension_wins_over_magic() {
        let classifier = MediaTypeClassifier::default();
        let mime = classifier
            .classify(Some("report.pdf"), PNG_MAGIC)
            .await
            .unwrap();
        assert_eq!(mime, "application/pdf");
    }

    #[tokio::test]
    async fn test_sniff_png_without_name() {
        let classifier = MediaTypeClassifier::default();
        let mime = classifier.classify(None, PNG_MAGIC).await.unwrap();
        assert_eq!(mime, "image/png");
    }

    #[tokio::test]
    async fn test_octet_stream_extension_falls_through_to_sniff() {
        let classifier = MediaTypeClassifier::new(
            ExtensionLookup::with_overrides(HashMap::from([(
                "blob".to_string(),
                OCTET_STREAM.to_string(),
            )])),
            DEFAULT_SNIFF_LENGTH,
        );
        let mime = classifier
            .classify(Some("image.blob"), PNG_MAGIC)
            .await
            .unwrap();
        assert_eq!(mime, "image/png");
    }

    #[tokio::test]
    async fn test_no_bytes_read_when_extension_matches() {
        let classifier = MediaTypeClassifier::default();
        let mut content: &[u8] = b"some content that must stay unread";
        classifier
            .classify(Some("notes.txt"), &mut content)
            .await
            .unwrap();
        assert_eq!(content.len(), 34);
    }

    #[tokio::test]
    async fn test_sniff_reads_bounded_prefix() {
        let classifier = MediaTypeClassifier::new(ExtensionLookup::new(), 16);
        let data = vec![b'a'; 100];
        let mut content: &[u8] = &data;
        let mime = classifier.classify(None, &mut content).await.unwrap();
        assert_eq!(mime, "text/plain");
        assert_eq!(content.len(), 84);
    }

    #[tokio::test]
    async fn test_unknown_binary_and_empty() {
        let classifier = MediaTypeClassifier::default();
        let binary = classifier
            .classify(None, &[0x00u8, 0x01, 0x02, 0xfe][..])
            .await
            .unwrap();
        assert_eq!(binary, OCTET_STREAM);

        let empty = classifier.classify(Some("noext"), &b""[..]).await.unwrap();
        assert_eq!(empty, OCTET_STREAM);
    }

    #[test]
    fn test_implausible_declared_type_is_accepted() {
        let classifier = MediaTypeClassifier::new(
            ExtensionLookup::with_overrides(HashMap::from([(
                "png".to_string(),
                "text/x-weird".to_string(),
            )])),
            DEFAULT_SNIFF_LENGTH,
        );
        assert_eq!(
            classifier.classify_sample(Some("photo.png"), PNG_MAGIC),
            "text/x-weird"
        );
    }

    #[test]
    fn test_malformed_result_replaced_with_fallback() {
        struct Broken;
        impl ClassifyStrategy for Broken {
            fn needs_sample(&self) -> bool {
                false
            }
            fn classify(&self, _input: &ClassifyInput<'_>) -> Classification {
                Classification::Definite("cannot open `file'".to_string())
            }
        }

        let classifier = MediaTypeClassifier::with_strategies(vec![Box::new(Broken)], 8);
        assert_eq!(classifier.classify_sample(None, b"x"), OCTET_STREAM);
    }

    #[test]
    fn test_mime_shape() {
        assert!(is_valid_mime_shape("image/png"));
        assert!(is_valid_mime_shape("application/vnd.ms-excel"));
        assert!(!is_valid_mime_shape("image"));
        assert!(!is_valid_mime_shape("image/png/extra"));
        assert!(!is_valid_mime_shape("text/ plain"));
        assert!(!is_valid_mime_shape("/png"));
    }

    #[test]
    fn test_parse_mime_types_table() {
        let table = "# local additions\n\
                     application/x-asurepo   arx  ARX2\n\
                     not-a-mime foo\n\
                     text/markdown md # inline comment\n";
        let map = ExtensionLookup::parse_mime_types(table);
        assert_eq!(map.get("arx").map(String::as_str), Some("application/x-asurepo"));
        assert_eq!(map.get("arx2").map(String::as_str), Some("application/x-asurepo"));
        assert_eq!(map.get("md").map(String::as_str), Some("text/markdown"));
        assert!(!map.contains_key("foo"));
    }
}
