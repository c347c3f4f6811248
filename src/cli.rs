use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};
use futures::TryStreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use catalog_service::{
    ensure_catalog_indexes, read_catalog_file, write_catalog_file, Config, Embedder, EmbeddingsServiceClient,
    FeedReader, HttpImageFetcher, InMemoryRecordStore, IngestionPipeline, IngestionReport, LocalMediaUploader, MediaUploader,
    MongoRecordStore, PipelineSettings, RateLimitedEmbedder, RecordStore, RunStatus, S3MediaUploader,
};

#[derive(Parser, Debug)]
#[command(name = "catalog-service")]
#[command(about = "Retail catalog storage, search and bulk ingestion")]
pub struct CatalogCli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the GraphQL API (default)
    Serve,
    /// Load a bulk product feed into the record store
    Ingest(IngestArgs),
    /// Write the record store's catalog to the static snapshot file
    ExportSnapshot {
        /// Output path (defaults to CATALOG_SNAPSHOT_FILE)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Create the B-tree and vector search indexes
    EnsureIndexes,
}

/// Overrides for one ingestion run; anything unset keeps its env value.
#[derive(Args, Debug, Clone)]
pub struct IngestArgs {
    /// Feed file: a JSON array, or JSON Lines for .jsonl/.ndjson
    #[arg(long, env = "INGEST_FEED_PATH")]
    pub feed: PathBuf,

    /// Exact number of products to load
    #[arg(long)]
    pub target: Option<usize>,

    /// Base per-category cap (default: 5% of target, at least 5)
    #[arg(long)]
    pub max_per_category: Option<usize>,

    /// Fraction of target at which caps relax
    #[arg(long)]
    pub relax_start: Option<f64>,

    /// Multiplier applied to the base cap once relaxed
    #[arg(long)]
    pub relax_factor: Option<f64>,

    /// Fraction of target after which caps are lifted
    #[arg(long)]
    pub relax_final: Option<f64>,

    /// Candidates processed concurrently
    #[arg(long)]
    pub workers: Option<usize>,

    /// Source currency units per settlement currency unit
    #[arg(long)]
    pub fx_rate: Option<f64>,

    /// Reject candidates whose embeddings fail
    #[arg(long)]
    pub require_embeddings: bool,
}

impl IngestArgs {
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(v) = self.target { cfg.ingest_target_count = v; }
        if let Some(v) = self.max_per_category { cfg.ingest_max_per_category = Some(v); }
        if let Some(v) = self.relax_start { cfg.ingest_cap_relax_start = v; }
        if let Some(v) = self.relax_factor { cfg.ingest_cap_relax_factor = v; }
        if let Some(v) = self.relax_final { cfg.ingest_cap_relax_final = v; }
        if let Some(v) = self.workers { cfg.ingest_workers = v; }
        if let Some(v) = self.fx_rate { cfg.ingest_fx_rate = v; }
        if self.require_embeddings { cfg.ingest_require_embeddings = true; }
    }
}

pub async fn connect_store(cfg: &Config, pool_size: u32, workload: &str) -> Result<Option<MongoRecordStore>> {
    let Some(uri) = &cfg.mongodb_uri else {
        return Ok(None);
    };
    let store = MongoRecordStore::connect(cfg, uri, pool_size, workload).await?;
    tracing::info!(database = %cfg.database_name, collection = %store.collection_name(), workload, "Connected to MongoDB");
    Ok(Some(store))
}

pub async fn run_ingest(cfg: Config, args: IngestArgs) -> Result<()> {
    // Offline mode ingests into memory seeded from the catalog file and writes it back.
    let mut offline: Option<Arc<InMemoryRecordStore>> = None;
    let store: Arc<dyn RecordStore> = match connect_store(&cfg, cfg.mongodb_ingestion_pool_size, "ingestion").await? {
        Some(mongo) => {
            ensure_catalog_indexes(&mongo, &cfg).await?;
            Arc::new(mongo)
        }
        None => {
            let path = &cfg.catalog_snapshot_file;
            let existing = if tokio::fs::try_exists(path).await.unwrap_or(false) {
                read_catalog_file(path).await?
            } else {
                Vec::new()
            };
            tracing::info!(path = %path.display(), existing = existing.len(), "No MONGODB_URI; ingesting into the catalog file");
            let memory = Arc::new(InMemoryRecordStore::with_records(cfg.embedding_dimension, existing));
            offline = Some(memory.clone());
            memory
        }
    };

    let max_bytes = (cfg.max_image_size_mb as usize).saturating_mul(1024 * 1024);
    let fetcher = Arc::new(HttpImageFetcher::new(&cfg.http_user_agent, cfg.http_timeout_ms, max_bytes)?);

    let uploader: Arc<dyn MediaUploader> = match &cfg.media_bucket {
        Some(bucket) => Arc::new(S3MediaUploader::new(&cfg, bucket.clone()).await?),
        None => Arc::new(LocalMediaUploader::new(cfg.local_media_dir.clone(), cfg.local_media_base_url.clone())),
    };

    let embedder: Option<Arc<dyn Embedder>> = match &cfg.embeddings_service_url {
        Some(url) => {
            let client = EmbeddingsServiceClient::new(
                url.clone(),
                cfg.embedding_model_id.clone(),
                cfg.embeddings_timeout_ms,
                cfg.http_user_agent.clone(),
                cfg.http_max_retries,
                cfg.http_retry_backoff_ms,
            )?;
            Some(Arc::new(RateLimitedEmbedder::new(client, cfg.embeddings_max_qps)))
        }
        None if cfg.ingest_require_embeddings => {
            bail!("embeddings are required but EMBEDDINGS_SERVICE_URL is not set")
        }
        None => {
            tracing::warn!("EMBEDDINGS_SERVICE_URL not set; records will be stored without vectors");
            None
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; finishing in-flight candidates");
            on_signal.cancel();
        }
    });

    let feed = FeedReader::open(args.feed.clone());
    tracing::info!(feed = %feed.path().display(), format = ?feed.format(), "Reading product feed");
    let pipeline = IngestionPipeline::new(store, fetcher, uploader, embedder, PipelineSettings::from_config(&cfg));
    let report = pipeline.run(feed.stream(), cancel).await?;

    if let Some(memory) = offline {
        write_catalog_file(&cfg.catalog_snapshot_file, memory.records()?).await?;
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    run_outcome(&report)
}

/// An under-filled run ends normally; its shortfall is already in the
/// report and the warning log. Only a cancelled run exits non-zero.
fn run_outcome(report: &IngestionReport) -> Result<()> {
    match report.status {
        RunStatus::Completed | RunStatus::UnderFilled => Ok(()),
        RunStatus::Cancelled => Err(anyhow!("cancelled after loading {} of {} products", report.accepted, report.target)),
    }
}

pub async fn export_snapshot(cfg: Config, output: Option<PathBuf>) -> Result<()> {
    let store = connect_store(&cfg, cfg.mongodb_serving_pool_size, "export")
        .await?
        .ok_or_else(|| anyhow!("export-snapshot needs MONGODB_URI"))?;
    let records: Vec<_> = store.scan_all().await?.try_collect().await?;
    let path = output.unwrap_or_else(|| cfg.catalog_snapshot_file.clone());
    write_catalog_file(&path, records).await?;
    Ok(())
}

pub async fn ensure_indexes(cfg: Config) -> Result<()> {
    let store = connect_store(&cfg, 1, "indexes")
        .await?
        .ok_or_else(|| anyhow!("ensure-indexes needs MONGODB_URI"))?;
    ensure_catalog_indexes(&store, &cfg).await?;
    Ok(())
}
