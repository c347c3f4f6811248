use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{fmt, EnvFilter};

mod cli;

use catalog_service::schema::create_schema;
use catalog_service::server::build_router;
use catalog_service::{
    ensure_catalog_indexes, Config, QueryEngine, QuerySettings, RecordStore, SnapshotCache, SnapshotSource,
    SourceRouter,
};
use crate::cli::{CatalogCli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .init();

    let args = CatalogCli::parse();
    let mut cfg = Config::from_env();

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            cfg.validate()?;
            serve(cfg).await
        }
        Command::Ingest(ingest) => {
            ingest.apply(&mut cfg);
            cfg.validate()?;
            cli::run_ingest(cfg, ingest).await
        }
        Command::ExportSnapshot { output } => cli::export_snapshot(cfg, output).await,
        Command::EnsureIndexes => {
            cfg.validate()?;
            cli::ensure_indexes(cfg).await
        }
    }
}

async fn serve(cfg: Config) -> anyhow::Result<()> {
    tracing::info!(
        database = %cfg.database_name,
        store_configured = cfg.store_configured(),
        selective_routing = cfg.enable_selective_routing,
        reload_catalog = cfg.reload_catalog,
        "Loaded configuration"
    );

    let store: Option<Arc<dyn RecordStore>> = match cli::connect_store(&cfg, cfg.mongodb_serving_pool_size, "serving").await? {
        Some(mongo) => {
            match ensure_catalog_indexes(&mongo, &cfg).await {
                Ok(()) => {}
                Err(e) if e.is_configuration() => return Err(e.into()),
                Err(e) => tracing::warn!(error = %e, "Failed to ensure catalog indexes"),
            }
            Some(Arc::new(mongo))
        }
        None => {
            tracing::info!(file = %cfg.catalog_snapshot_file.display(), "No MONGODB_URI; serving from the catalog file");
            None
        }
    };

    let source = match &store {
        Some(s) => SnapshotSource::store(s.clone()).with_fallback_file(cfg.catalog_snapshot_file.clone()),
        None => SnapshotSource::file(cfg.catalog_snapshot_file.clone()),
    };
    let cache = Arc::new(
        SnapshotCache::new(source, Duration::from_millis(cfg.snapshot_rebuild_timeout_ms)).always_reload(cfg.reload_catalog),
    );
    match cache.refresh().await {
        Ok(snapshot) => tracing::info!(products = snapshot.len(), generation = snapshot.generation(), "Catalog snapshot warmed"),
        Err(e) => tracing::warn!(error = %e, "Initial catalog snapshot failed; retrying on first read"),
    }

    // Keep the scheduler alive for as long as the server runs.
    let _scheduler = match &cfg.snapshot_refresh_cron {
        Some(expr) => Some(start_snapshot_refresh(expr, cache.clone()).await?),
        None => None,
    };

    let engine = Arc::new(QueryEngine::new(
        SourceRouter::from_config(&cfg),
        store,
        cache,
        QuerySettings::from_config(&cfg)?,
    ));
    let app = build_router(create_schema(engine));

    let addr: SocketAddr = format!("0.0.0.0:{}", cfg.port).parse()?;
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                tracing::error!(port = cfg.port, "Port is already in use. Try changing PORT or stop the other process.");
            }
            return Err(e.into());
        }
    };
    tracing::info!(port = cfg.port, "Catalog service listening");
    axum::serve(listener, app).await?;

    Ok(())
}

async fn start_snapshot_refresh(expr: &str, cache: Arc<SnapshotCache>) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;
    let job = Job::new_async(expr, move |_uuid, _l| {
        let cache = cache.clone();
        Box::pin(async move {
            match cache.refresh().await {
                Ok(snapshot) => tracing::info!(products = snapshot.len(), generation = snapshot.generation(), "Scheduled snapshot refresh"),
                Err(e) => tracing::error!(error = %e, "Scheduled snapshot refresh failed"),
            }
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;
    tracing::info!(cron = expr, "Snapshot refresh scheduler started");
    Ok(scheduler)
}
