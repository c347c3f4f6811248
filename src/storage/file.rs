use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::models::*;

/// On-disk layout of a static catalog file: `{"products": [...]}`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub products: Vec<ProductRecord>,
}

pub async fn read_catalog_file(path: &Path) -> Result<Vec<ProductRecord>> {
    let bytes = tokio::fs::read(path).await?;
    let file: CatalogFile = serde_json::from_slice(&bytes)?;
    tracing::debug!(path = %path.display(), products = file.products.len(), "Read catalog file");
    Ok(file.products)
}

/// Writes to a sibling temp file first and renames it into place, so a reader
/// never sees a half-written catalog.
pub async fn write_catalog_file(path: &Path, products: Vec<ProductRecord>) -> Result<()> {
    let count = products.len();
    let body = serde_json::to_vec_pretty(&CatalogFile { products })?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body).await?;
    tokio::fs::rename(&tmp, path).await?;
    tracing::info!(path = %path.display(), products = count, "Wrote catalog file");
    Ok(())
}
