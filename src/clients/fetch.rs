use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use crate::models::*;

/// Downloads the source image of a feed entry.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

pub struct HttpImageFetcher {
    client: Client,
    max_bytes: usize,
}

impl HttpImageFetcher {
    pub fn new(user_agent: &str, timeout_ms: u64, max_bytes: usize) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_millis(timeout_ms))
            .build()?;
        Ok(Self { client, max_bytes })
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let parsed = url::Url::parse(url).map_err(|e| CatalogError::Validation(format!("bad image url {url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CatalogError::Validation(format!("unsupported image url scheme: {}", parsed.scheme())));
        }

        let response = self.client.get(parsed).header("Accept", "image/*").send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Transport(format!("image download failed: status={status} url={url}")));
        }
        if let Some(len) = response.content_length() {
            if len as usize > self.max_bytes {
                return Err(CatalogError::Validation(format!("image too large: {len} bytes")));
            }
        }
        let bytes = response.bytes().await?;
        if bytes.len() > self.max_bytes {
            return Err(CatalogError::Validation(format!("image too large: {} bytes", bytes.len())));
        }
        Ok(bytes.to_vec())
    }
}
