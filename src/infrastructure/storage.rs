use crate::config::IngestConfig;
use crate::error::{IngestError, Result};
use crate::services::store::ContentAddressedStore;
use std::sync::Arc;
use tracing::info;

pub async fn setup_storage(config: &IngestConfig) -> Result<Arc<ContentAddressedStore>> {
    let root = &config.storage_root;

    info!(
        "📂 Blob store: {} (layout: {}, permissions: {})",
        root.display(),
        config.layout,
        config
            .file_permissions
            .map(|m| format!("{:o}", m))
            .unwrap_or_else(|| "os default".to_string())
    );

    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| IngestError::storage(root, e))?;

    Ok(Arc::new(ContentAddressedStore::from_config(config)))
}
