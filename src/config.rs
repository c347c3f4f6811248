use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::models::{CatalogError, Result};

/// Brute-force KNN over the snapshot when the store is not used, or refuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheVectorSearch {
    BruteForce,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
    // Unset means no durable store; serving and ingestion fall back to the catalog file.
    pub mongodb_uri: Option<String>,
    pub database_name: String,
    pub catalog_collection: String,
    pub mongodb_serving_pool_size: u32,
    pub mongodb_ingestion_pool_size: u32,
    pub embedding_dimension: usize,
    pub vector_num_candidates: usize,
    pub text_vector_index: String,
    pub image_vector_index: String,
    pub store_timeout_ms: u64,
    pub enable_selective_routing: bool,
    pub catalog_snapshot_file: PathBuf,
    pub snapshot_refresh_cron: Option<String>,
    pub snapshot_rebuild_timeout_ms: u64,
    pub reload_catalog: bool,
    pub extra_latency_ms: u64,
    pub hybrid_text_weight: f32,
    pub hybrid_image_weight: f32,
    pub hybrid_candidate_multiplier: usize,
    pub cache_vector_search: CacheVectorSearch,
    pub embeddings_service_url: Option<String>,
    pub embeddings_timeout_ms: u64,
    pub embeddings_max_qps: f64,
    pub embedding_model_id: String,
    pub http_timeout_ms: u64,
    pub http_max_retries: u32,
    pub http_retry_backoff_ms: u64,
    pub http_user_agent: String,
    // Media storage
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_region: String,
    // Optional custom S3 endpoint (e.g. MinIO)
    pub aws_endpoint: Option<String>,
    pub aws_public_base_url: Option<String>,
    pub media_bucket: Option<String>,
    pub media_prefix: String,
    pub local_media_dir: PathBuf,
    pub local_media_base_url: String,
    pub max_image_size_mb: u64,
    // Ingestion run defaults
    pub ingest_target_count: usize,
    pub ingest_fx_rate: f64,
    pub settlement_currency: String,
    pub ingest_max_per_category: Option<usize>,
    pub ingest_cap_relax_start: f64,
    pub ingest_cap_relax_factor: f64,
    pub ingest_cap_relax_final: f64,
    pub ingest_workers: usize,
    pub ingest_require_embeddings: bool,
    pub upsert_max_retries: u32,
}

impl Config {
    pub fn from_env() -> Self {
    let get = |k: &str| std::env::var(k).ok().filter(|v| !v.trim().is_empty());
    let flag = |k: &str, default: bool| {
        get(k)
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(default)
    };

    let port: u16 = get("PORT").and_then(|s| s.parse().ok()).unwrap_or(3550);
    let mongodb_uri = get("MONGODB_URI");
    let database_name = get("DATABASE_NAME").unwrap_or_else(|| "catalog".to_string());
    let catalog_collection = get("CATALOG_COLLECTION").unwrap_or_else(|| "catalog_items".to_string());
    let mongodb_serving_pool_size: u32 = get("MONGODB_SERVING_POOL_SIZE").and_then(|s| s.parse().ok()).unwrap_or(10);
    let mongodb_ingestion_pool_size: u32 = get("MONGODB_INGESTION_POOL_SIZE").and_then(|s| s.parse().ok()).unwrap_or(4);
    let embedding_dimension: usize = get("EMBEDDING_DIMENSION").and_then(|s| s.parse().ok()).unwrap_or(1408);
    let vector_num_candidates: usize = get("VECTOR_NUM_CANDIDATES").and_then(|s| s.parse().ok()).unwrap_or(100);
    let text_vector_index = get("TEXT_VECTOR_INDEX").unwrap_or_else(|| "catalog_text_embedding".to_string());
    let image_vector_index = get("IMAGE_VECTOR_INDEX").unwrap_or_else(|| "catalog_image_embedding".to_string());
    let store_timeout_ms: u64 = get("STORE_TIMEOUT_MS").and_then(|s| s.parse().ok()).unwrap_or(2000);
    let enable_selective_routing = flag("ENABLE_SELECTIVE_ROUTING", false);
    let catalog_snapshot_file = get("CATALOG_SNAPSHOT_FILE").unwrap_or_else(|| "products.json".to_string()).into();
    let snapshot_refresh_cron = get("SNAPSHOT_REFRESH_CRON");
    let snapshot_rebuild_timeout_ms: u64 = get("SNAPSHOT_REBUILD_TIMEOUT_MS").and_then(|s| s.parse().ok()).unwrap_or(30000);
    let reload_catalog = flag("RELOAD_CATALOG", false);
    let extra_latency_ms: u64 = get("EXTRA_LATENCY_MS").and_then(|s| s.parse().ok()).unwrap_or(0);
    let hybrid_text_weight: f32 = get("HYBRID_TEXT_WEIGHT").and_then(|s| s.parse().ok()).unwrap_or(0.6);
    let hybrid_image_weight: f32 = get("HYBRID_IMAGE_WEIGHT").and_then(|s| s.parse().ok()).unwrap_or(0.4);
    let hybrid_candidate_multiplier: usize = get("HYBRID_CANDIDATE_MULTIPLIER").and_then(|s| s.parse().ok()).unwrap_or(4);
    let cache_vector_search = match get("CACHE_VECTOR_SEARCH").map(|s| s.to_lowercase()) {
        Some(v) if v == "disabled" || v == "off" => CacheVectorSearch::Disabled,
        _ => CacheVectorSearch::BruteForce,
    };
    let embeddings_service_url = get("EMBEDDINGS_SERVICE_URL");
    let embeddings_timeout_ms: u64 = get("EMBEDDINGS_TIMEOUT_MS").and_then(|s| s.parse().ok()).unwrap_or(30000);
    let embeddings_max_qps: f64 = get("EMBEDDINGS_MAX_QPS").and_then(|s| s.parse().ok()).unwrap_or(10.0);
    let embedding_model_id = get("EMBEDDING_MODEL_ID").unwrap_or_else(|| "multimodalembedding@001".to_string());
    let http_timeout_ms: u64 = get("HTTP_TIMEOUT_MS").and_then(|s| s.parse().ok()).unwrap_or(60000);
    let http_max_retries: u32 = get("HTTP_MAX_RETRIES").and_then(|s| s.parse().ok()).unwrap_or(3);
    let http_retry_backoff_ms: u64 = get("HTTP_RETRY_BACKOFF_MS").and_then(|s| s.parse().ok()).unwrap_or(500);
    let http_user_agent = get("HTTP_USER_AGENT").unwrap_or_else(|| "catalog-service/1.0".to_string());

    let aws_access_key_id = get("AWS_ACCESS_KEY_ID");
    let aws_secret_access_key = get("AWS_SECRET_ACCESS_KEY");
    let aws_region = get("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string());
    // Support multiple env var names for convenience
    let aws_endpoint = get("AWS_S3_ENDPOINT").or_else(|| get("AWS_ENDPOINT"));
    let aws_public_base_url = get("AWS_S3_PUBLIC_BASE_URL").or_else(|| get("AWS_S3_ACCESS_POINT"));
    let media_bucket = get("MEDIA_BUCKET");
    let media_prefix = get("MEDIA_PREFIX").unwrap_or_else(|| "products".to_string());
    let local_media_dir = get("LOCAL_MEDIA_DIR").unwrap_or_else(|| "static/img/products".to_string()).into();
    let local_media_base_url = get("LOCAL_MEDIA_BASE_URL").unwrap_or_else(|| "/static/img/products".to_string());
    let max_image_size_mb: u64 = get("MAX_IMAGE_SIZE_MB").and_then(|s| s.parse().ok()).unwrap_or(20);

    let ingest_target_count: usize = get("INGEST_TARGET_COUNT").and_then(|s| s.parse().ok()).unwrap_or(1000);
    let ingest_fx_rate: f64 = get("INGEST_FX_RATE").and_then(|s| s.parse().ok()).unwrap_or(88.0);
    let settlement_currency = get("SETTLEMENT_CURRENCY").unwrap_or_else(|| "USD".to_string());
    let ingest_max_per_category: Option<usize> = get("INGEST_MAX_PER_CATEGORY").and_then(|s| s.parse().ok());
    let ingest_cap_relax_start: f64 = get("INGEST_CAP_RELAX_START").and_then(|s| s.parse().ok()).unwrap_or(0.5);
    let ingest_cap_relax_factor: f64 = get("INGEST_CAP_RELAX_FACTOR").and_then(|s| s.parse().ok()).unwrap_or(1.5);
    let ingest_cap_relax_final: f64 = get("INGEST_CAP_RELAX_FINAL").and_then(|s| s.parse().ok()).unwrap_or(0.9);
    let ingest_workers: usize = get("INGEST_WORKERS").and_then(|s| s.parse().ok()).unwrap_or(16);
    let ingest_require_embeddings = flag("INGEST_REQUIRE_EMBEDDINGS", false);
    let upsert_max_retries: u32 = get("UPSERT_MAX_RETRIES").and_then(|s| s.parse().ok()).unwrap_or(3);

        Self {
            port,
            mongodb_uri,
            database_name,
            catalog_collection,
            mongodb_serving_pool_size,
            mongodb_ingestion_pool_size,
            embedding_dimension,
            vector_num_candidates,
            text_vector_index,
            image_vector_index,
            store_timeout_ms,
            enable_selective_routing,
            catalog_snapshot_file,
            snapshot_refresh_cron,
            snapshot_rebuild_timeout_ms,
            reload_catalog,
            extra_latency_ms,
            hybrid_text_weight,
            hybrid_image_weight,
            hybrid_candidate_multiplier,
            cache_vector_search,
            embeddings_service_url,
            embeddings_timeout_ms,
            embeddings_max_qps,
            embedding_model_id,
            http_timeout_ms,
            http_max_retries,
            http_retry_backoff_ms,
            http_user_agent,
            aws_access_key_id,
            aws_secret_access_key,
            aws_region,
            aws_endpoint,
            aws_public_base_url,
            media_bucket,
            media_prefix,
            local_media_dir,
            local_media_base_url,
            max_image_size_mb,
            ingest_target_count,
            ingest_fx_rate,
            settlement_currency,
            ingest_max_per_category,
            ingest_cap_relax_start,
            ingest_cap_relax_factor,
            ingest_cap_relax_final,
            ingest_workers,
            ingest_require_embeddings,
            upsert_max_retries,
        }
    }

    /// Startup checks. Anything rejected here is a configuration failure and
    /// the process should not start serving.
    pub fn validate(&self) -> Result<()> {
        if self.embedding_dimension == 0 {
            return Err(CatalogError::Configuration("EMBEDDING_DIMENSION must be positive".into()));
        }
        if self.embedding_model_id.trim().is_empty() {
            return Err(CatalogError::Configuration("EMBEDDING_MODEL_ID must not be empty".into()));
        }
        for (name, w) in [("HYBRID_TEXT_WEIGHT", self.hybrid_text_weight), ("HYBRID_IMAGE_WEIGHT", self.hybrid_image_weight)] {
            if !w.is_finite() || w < 0.0 {
                return Err(CatalogError::Configuration(format!("{name} must be a non-negative number")));
            }
        }
        if !(self.ingest_fx_rate.is_finite() && self.ingest_fx_rate > 0.0) {
            return Err(CatalogError::Configuration("INGEST_FX_RATE must be positive".into()));
        }
        let (start, end) = (self.ingest_cap_relax_start, self.ingest_cap_relax_final);
        if !(0.0..=1.0).contains(&start) || !(0.0..=1.0).contains(&end) || start > end {
            return Err(CatalogError::Configuration(format!(
                "cap relax fractions must satisfy 0 <= start <= final <= 1 (start={start}, final={end})"
            )));
        }
        if self.ingest_cap_relax_factor < 1.0 {
            return Err(CatalogError::Configuration("INGEST_CAP_RELAX_FACTOR must be >= 1".into()));
        }
        if self.ingest_workers == 0 {
            return Err(CatalogError::Configuration("INGEST_WORKERS must be at least 1".into()));
        }
        Ok(())
    }

    pub fn store_configured(&self) -> bool {
        self.mongodb_uri.is_some()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3550,
            mongodb_uri: None,
            database_name: "catalog".into(),
            catalog_collection: "catalog_items".into(),
            mongodb_serving_pool_size: 10,
            mongodb_ingestion_pool_size: 4,
            embedding_dimension: 1408,
            vector_num_candidates: 100,
            text_vector_index: "catalog_text_embedding".into(),
            image_vector_index: "catalog_image_embedding".into(),
            store_timeout_ms: 2000,
            enable_selective_routing: false,
            catalog_snapshot_file: "products.json".into(),
            snapshot_refresh_cron: None,
            snapshot_rebuild_timeout_ms: 30000,
            reload_catalog: false,
            extra_latency_ms: 0,
            hybrid_text_weight: 0.6,
            hybrid_image_weight: 0.4,
            hybrid_candidate_multiplier: 4,
            cache_vector_search: CacheVectorSearch::BruteForce,
            embeddings_service_url: None,
            embeddings_timeout_ms: 30000,
            embeddings_max_qps: 10.0,
            embedding_model_id: "multimodalembedding@001".into(),
            http_timeout_ms: 60000,
            http_max_retries: 3,
            http_retry_backoff_ms: 500,
            http_user_agent: "catalog-service/1.0".into(),
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_region: "us-east-1".into(),
            aws_endpoint: None,
            aws_public_base_url: None,
            media_bucket: None,
            media_prefix: "products".into(),
            local_media_dir: "static/img/products".into(),
            local_media_base_url: "/static/img/products".into(),
            max_image_size_mb: 20,
            ingest_target_count: 1000,
            ingest_fx_rate: 88.0,
            settlement_currency: "USD".into(),
            ingest_max_per_category: None,
            ingest_cap_relax_start: 0.5,
            ingest_cap_relax_factor: 1.5,
            ingest_cap_relax_final: 0.9,
            ingest_workers: 16,
            ingest_require_embeddings: false,
            upsert_max_retries: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_relax_fractions_and_bad_dimension() {
        let mut cfg = Config::default();
        cfg.ingest_cap_relax_start = 0.95;
        assert!(cfg.validate().unwrap_err().is_configuration());

        let mut cfg = Config::default();
        cfg.embedding_dimension = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.hybrid_image_weight = -1.0;
        assert!(cfg.validate().is_err());
    }
}
