use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{primitives::ByteStream, types::ObjectCannedAcl, Client as S3Client};
use std::path::PathBuf;

use crate::config::Config;
use crate::models::*;

/// Stores product media and returns the reference records should carry.
#[async_trait]
pub trait MediaUploader: Send + Sync {
    async fn upload(&self, bytes: Vec<u8>, key: &str, content_type: &str) -> Result<String>;
}

/// Uploads to S3 or any S3-compatible endpoint (MinIO and friends).
pub struct S3MediaUploader {
    client: S3Client,
    bucket: String,
    region: String,
    public_base_url: Option<String>,
}

impl S3MediaUploader {
    pub async fn new(config: &Config, bucket: String) -> Result<Self> {
        let base_loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.aws_region.clone()));

        let loader = if let (Some(access_key), Some(secret_key)) =
            (&config.aws_access_key_id, &config.aws_secret_access_key)
        {
            let creds = aws_sdk_s3::config::Credentials::new(access_key, secret_key, None, None, "catalog-service");
            base_loader.credentials_provider(creds)
        } else {
            base_loader
        };

        let shared_config = loader.load().await;

        // Honor a custom endpoint; path-style addressing is what MinIO expects.
        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&shared_config);
        if let Some(endpoint) = &config.aws_endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = S3Client::from_conf(s3_config_builder.build());

        Ok(Self {
            client,
            bucket,
            region: config.aws_region.clone(),
            public_base_url: config.aws_public_base_url.clone(),
        })
    }

    pub fn public_url(&self, key: &str) -> String {
        public_url(self.public_base_url.as_deref(), &self.bucket, &self.region, key)
    }
}

fn public_url(public_base_url: Option<&str>, bucket: &str, region: &str, key: &str) -> String {
    if let Some(base) = public_base_url {
        let base = base.trim_end_matches('/');
        let sep = if base.ends_with('=') || base.contains('?') { "" } else { "/" };
        return format!("{}{}{}", base, sep, key);
    }
    if region == "us-east-1" {
        format!("https://{}.s3.amazonaws.com/{}", bucket, key)
    } else {
        format!("https://{}.s3.{}.amazonaws.com/{}", bucket, region, key)
    }
}

#[async_trait]
impl MediaUploader for S3MediaUploader {
    async fn upload(&self, bytes: Vec<u8>, key: &str, content_type: &str) -> Result<String> {
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .acl(ObjectCannedAcl::PublicRead)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, bucket = %self.bucket, key = %key, "Failed to upload media to S3");
                CatalogError::Transport(format!("S3 upload failed: {}", e))
            })?;

        let url = self.public_url(key);
        tracing::debug!(bucket = %self.bucket, key = %key, public_url = %url, size_bytes = size, "Uploaded media");
        Ok(url)
    }
}

/// Writes media into a local directory served as static files.
pub struct LocalMediaUploader {
    dir: PathBuf,
    base_url: String,
}

impl LocalMediaUploader {
    pub fn new(dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self { dir: dir.into(), base_url: base_url.into() }
    }
}

#[async_trait]
impl MediaUploader for LocalMediaUploader {
    async fn upload(&self, bytes: Vec<u8>, key: &str, _content_type: &str) -> Result<String> {
        // Only the file name is kept; the directory already plays the role of the prefix.
        let file_name = key.rsplit('/').next().unwrap_or(key);
        if file_name.is_empty() || file_name == ".." {
            return Err(CatalogError::Validation(format!("invalid media key: {key}")));
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.dir.join(file_name), bytes).await?;
        Ok(format!("{}/{}", self.base_url.trim_end_matches('/'), file_name))
    }
}
