use futures::TryStreamExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::models::*;
use crate::storage::{read_catalog_file, RecordStore};

/// Where a snapshot is rebuilt from. With both set, the file is the degraded
/// path used only when the store cannot be scanned.
#[derive(Clone, Default)]
pub struct SnapshotSource {
    pub store: Option<Arc<dyn RecordStore>>,
    pub file: Option<PathBuf>,
}

impl SnapshotSource {
    pub fn store(store: Arc<dyn RecordStore>) -> Self {
        Self { store: Some(store), file: None }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self { store: None, file: Some(path.into()) }
    }

    pub fn with_fallback_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }
}

/// Holds the current catalog snapshot behind a single swappable pointer.
///
/// Readers clone the `Arc` and keep using it for as long as they like; a
/// rebuild builds a complete new snapshot off to the side and replaces the
/// pointer in one write. Only one rebuild runs at a time.
pub struct SnapshotCache {
    source: SnapshotSource,
    current: RwLock<Option<Arc<CatalogSnapshot>>>,
    stale: AtomicBool,
    generation: AtomicU64,
    rebuild_lock: tokio::sync::Mutex<()>,
    rebuild_timeout: Duration,
    always_reload: bool,
}

impl SnapshotCache {
    pub fn new(source: SnapshotSource, rebuild_timeout: Duration) -> Self {
        Self {
            source,
            current: RwLock::new(None),
            stale: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            rebuild_lock: tokio::sync::Mutex::new(()),
            rebuild_timeout,
            always_reload: false,
        }
    }

    /// Rebuild on every `get`, as the demo's reload flag does. Expensive.
    pub fn always_reload(mut self, enabled: bool) -> Self {
        self.always_reload = enabled;
        self
    }

    /// The snapshot currently installed, without triggering a rebuild.
    pub fn current(&self) -> Option<Arc<CatalogSnapshot>> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Returns the current snapshot. Builds synchronously when there is none.
    /// When the snapshot is stale the first caller rebuilds while concurrent
    /// callers keep getting the previous snapshot.
    pub async fn get(&self) -> Result<Arc<CatalogSnapshot>> {
        if !self.always_reload {
            if let Some(snapshot) = self.current() {
                if !self.is_stale() {
                    return Ok(snapshot);
                }
                let Ok(_guard) = self.rebuild_lock.try_lock() else {
                    return Ok(snapshot);
                };
                if !self.is_stale() {
                    return Ok(self.current().unwrap_or(snapshot));
                }
                return match self.rebuild().await {
                    Ok(fresh) => Ok(fresh),
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            generation = snapshot.generation(),
                            built_at = %snapshot.built_at().to_rfc3339(),
                            "Snapshot rebuild failed; serving previous snapshot"
                        );
                        Ok(snapshot)
                    }
                };
            }
        }

        let _guard = self.rebuild_lock.lock().await;
        if !self.always_reload {
            if let Some(snapshot) = self.current() {
                if !self.is_stale() {
                    return Ok(snapshot);
                }
            }
        }
        match (self.rebuild().await, self.current()) {
            (Ok(fresh), _) => Ok(fresh),
            (Err(e), Some(previous)) => {
                tracing::warn!(error = %e, "Snapshot reload failed; serving previous snapshot");
                Ok(previous)
            }
            (Err(e), None) => Err(e),
        }
    }

    /// Marks the snapshot stale; the next `get` rebuilds it.
    pub fn invalidate(&self) {
        self.stale.store(true, Ordering::Release);
        tracing::debug!("Catalog snapshot invalidated");
    }

    /// Invalidates and rebuilds immediately. Used by the scheduled refresh.
    pub async fn refresh(&self) -> Result<Arc<CatalogSnapshot>> {
        let _guard = self.rebuild_lock.lock().await;
        self.invalidate();
        self.rebuild().await
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<ProductRecord>> {
        Ok(self.get().await?.find_by_id(id).cloned())
    }

    pub async fn search(&self, keyword: &str) -> Result<Vec<ProductRecord>> {
        Ok(self.get().await?.search(keyword).into_iter().cloned().collect())
    }

    // Callers hold `rebuild_lock`.
    async fn rebuild(&self) -> Result<Arc<CatalogSnapshot>> {
        // Cleared up front so an invalidate() that lands mid-scan is not lost.
        self.stale.store(false, Ordering::Release);
        let started = Instant::now();

        let records = match self.load_records().await {
            Ok(records) => records,
            Err(e) => {
                self.stale.store(true, Ordering::Release);
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let snapshot = Arc::new(CatalogSnapshot::build(generation, records));
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());

        tracing::info!(
            generation,
            records = snapshot.len(),
            built_at = %snapshot.built_at().to_rfc3339(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Catalog snapshot rebuilt"
        );
        Ok(snapshot)
    }

    async fn load_records(&self) -> Result<Vec<ProductRecord>> {
        if let Some(store) = &self.source.store {
            match self.scan_store(store.as_ref()).await {
                Ok(records) => return Ok(records),
                Err(e) if e.is_transport() && self.source.file.is_some() => {
                    tracing::warn!(error = %e, "Record store scan failed; rebuilding snapshot from catalog file");
                }
                Err(e) => return Err(e),
            }
        }
        match &self.source.file {
            Some(path) => read_catalog_file(path).await,
            None => Err(CatalogError::Configuration(
                "snapshot cache has neither a record store nor a catalog file".into(),
            )),
        }
    }

    async fn scan_store(&self, store: &dyn RecordStore) -> Result<Vec<ProductRecord>> {
        let scan = async {
            let stream = store.scan_all().await?;
            stream.try_collect::<Vec<_>>().await
        };
        tokio::time::timeout(self.rebuild_timeout, scan)
            .await
            .map_err(|_| CatalogError::Timeout(self.rebuild_timeout.as_millis() as u64))?
    }
}
