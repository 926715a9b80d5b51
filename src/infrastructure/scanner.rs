use crate::config::IngestConfig;
use crate::error::Result;
use crate::services::scanner::{ContentScanner, NoOpScanner, create_scanner};
use std::sync::Arc;
use tracing::info;

pub async fn setup_scanner(config: &IngestConfig) -> Result<Arc<dyn ContentScanner>> {
    if !config.enable_virus_scan {
        info!("🦠 Virus scanning disabled");
        return Ok(Arc::new(NoOpScanner));
    }

    let scanner = create_scanner(config)?;

    // Warm up scanner connection
    if scanner.health_check().await {
        info!("🦠 Virus scanner connected successfully");
    } else {
        tracing::warn!(
            "⚠️  Virus scanner unreachable! Scanned uploads will fail until it comes back."
        );
    }

    Ok(scanner)
}
