use futures::TryStreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::SnapshotCache;
use crate::config::{CacheVectorSearch, Config};
use crate::models::*;
use crate::query::vector::{brute_force_knn, rank_hybrid, HybridWeights};
use crate::routing::{RequestDirective, Source, SourceRouter};
use crate::storage::RecordStore;

#[derive(Debug, Clone)]
pub struct QuerySettings {
    pub store_timeout: Duration,
    pub dimension: usize,
    pub default_weights: HybridWeights,
    /// Each ANN leg of a hybrid query fetches `limit * multiplier` candidates.
    pub hybrid_candidate_multiplier: usize,
    pub cache_vector_search: CacheVectorSearch,
    pub extra_latency: Duration,
}

impl QuerySettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            store_timeout: Duration::from_millis(config.store_timeout_ms),
            dimension: config.embedding_dimension,
            default_weights: HybridWeights::new(config.hybrid_text_weight, config.hybrid_image_weight)?,
            hybrid_candidate_multiplier: config.hybrid_candidate_multiplier.max(1),
            cache_vector_search: config.cache_vector_search,
            extra_latency: Duration::from_millis(config.extra_latency_ms),
        })
    }
}

/// Answers catalog queries from whichever source the router picks.
///
/// Store-side transport failures and timeouts degrade to the snapshot cache.
/// An authoritative miss from the store (`NotFound`) and configuration errors
/// are returned as they are.
pub struct QueryEngine {
    router: SourceRouter,
    store: Option<Arc<dyn RecordStore>>,
    cache: Arc<SnapshotCache>,
    settings: QuerySettings,
}

impl QueryEngine {
    pub fn new(
        router: SourceRouter,
        store: Option<Arc<dyn RecordStore>>,
        cache: Arc<SnapshotCache>,
        settings: QuerySettings,
    ) -> Self {
        Self { router, store, cache, settings }
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    pub fn default_weights(&self) -> HybridWeights {
        self.settings.default_weights
    }

    fn store_for(&self, directive: RequestDirective) -> Option<&Arc<dyn RecordStore>> {
        match self.router.resolve(directive) {
            Source::Store => self.store.as_ref(),
            Source::Cache => None,
        }
    }

    async fn call_store<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.settings.store_timeout;
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| CatalogError::Timeout(timeout.as_millis() as u64))?
    }

    async fn inject_latency(&self) {
        if !self.settings.extra_latency.is_zero() {
            tokio::time::sleep(self.settings.extra_latency).await;
        }
    }

    /// Transport faults become `None` (serve from cache); anything else is returned.
    fn fallback_or_err<T>(op: &str, result: Result<T>) -> Result<Option<T>> {
        match result {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_transport() => {
                tracing::warn!(operation = op, error = %e, "Record store unavailable; falling back to snapshot cache");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn list_products(&self, directive: RequestDirective) -> Result<Vec<ProductRecord>> {
        self.inject_latency().await;
        if let Some(store) = self.store_for(directive) {
            let scan = async {
                let stream = store.scan_all().await?;
                stream.try_collect::<Vec<_>>().await
            };
            if let Some(records) = Self::fallback_or_err("list_products", self.call_store(scan).await)? {
                return Ok(records);
            }
        }
        Ok(self.cache.get().await?.records().to_vec())
    }

    pub async fn by_id(&self, id: &str, directive: RequestDirective) -> Result<ProductRecord> {
        self.inject_latency().await;
        let id = id.trim();
        if let Some(store) = self.store_for(directive) {
            let found = self.call_store(store.get_by_id(id)).await;
            if let Some(found) = Self::fallback_or_err("by_id", found)? {
                return found.ok_or_else(|| CatalogError::NotFound(format!("product {id}")));
            }
        }
        self.cache
            .find_by_id(id)
            .await?
            .ok_or_else(|| CatalogError::NotFound(format!("product {id}")))
    }

    pub async fn by_keyword(&self, query: &str, directive: RequestDirective) -> Result<Vec<ProductRecord>> {
        self.inject_latency().await;
        if let Some(store) = self.store_for(directive) {
            let hits = self.call_store(store.keyword_search(query)).await;
            if let Some(hits) = Self::fallback_or_err("by_keyword", hits)? {
                return Ok(hits);
            }
        }
        self.cache.search(query).await
    }

    /// KNN over one modality. On the cache side this is an exact linear scan
    /// over every snapshot record, unless disabled in configuration.
    pub async fn by_similarity(&self, query: VectorQuery, directive: RequestDirective) -> Result<Vec<ScoredRecord>> {
        query.check_dimension(self.settings.dimension)?;
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        self.inject_latency().await;

        if let Some(store) = self.store_for(directive) {
            let hits = self.call_store(store.vector_search(&query)).await;
            if let Some(hits) = Self::fallback_or_err("by_similarity", hits)? {
                return Ok(hits);
            }
        }

        self.ensure_cache_vector_search()?;
        let snapshot = self.cache.get().await?;
        brute_force_knn(snapshot.records(), &query)
    }

    /// Ranks by `w_text * d_text + w_image * d_image`, ascending, ties by id.
    /// Records lacking either vector are not ranked.
    pub async fn hybrid_similarity(
        &self,
        text_vector: Vec<f32>,
        image_vector: Vec<f32>,
        weights: Option<HybridWeights>,
        limit: usize,
        directive: RequestDirective,
    ) -> Result<Vec<ScoredRecord>> {
        let text_query = VectorQuery::new(text_vector, Modality::Text, limit);
        let image_query = VectorQuery::new(image_vector, Modality::Image, limit);
        text_query.check_dimension(self.settings.dimension)?;
        image_query.check_dimension(self.settings.dimension)?;
        let weights = weights.unwrap_or(self.settings.default_weights);
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.inject_latency().await;

        if let Some(store) = self.store_for(directive) {
            let candidates = self.hybrid_candidates(store.as_ref(), &text_query, &image_query).await;
            if let Some(candidates) = Self::fallback_or_err("hybrid_similarity", candidates)? {
                return rank_hybrid(candidates.values(), &text_query.vector, &image_query.vector, weights, limit);
            }
        }

        self.ensure_cache_vector_search()?;
        let snapshot = self.cache.get().await?;
        rank_hybrid(snapshot.records(), &text_query.vector, &image_query.vector, weights, limit)
    }

    /// Union of both ANN legs, keyed by id. Exact distances are recomputed
    /// afterwards so both legs are scored the same way.
    async fn hybrid_candidates(
        &self,
        store: &dyn RecordStore,
        text_query: &VectorQuery,
        image_query: &VectorQuery,
    ) -> Result<HashMap<String, ProductRecord>> {
        let breadth = text_query.limit.saturating_mul(self.settings.hybrid_candidate_multiplier);
        let text_leg = VectorQuery { limit: breadth, ..text_query.clone() };
        let image_leg = VectorQuery { limit: breadth, ..image_query.clone() };

        let (text_hits, image_hits) = futures::try_join!(
            self.call_store(store.vector_search(&text_leg)),
            self.call_store(store.vector_search(&image_leg)),
        )?;

        let mut candidates = HashMap::with_capacity(text_hits.len() + image_hits.len());
        for hit in text_hits.into_iter().chain(image_hits) {
            candidates.entry(hit.record.id.clone()).or_insert(hit.record);
        }
        Ok(candidates)
    }

    fn ensure_cache_vector_search(&self) -> Result<()> {
        match self.settings.cache_vector_search {
            CacheVectorSearch::BruteForce => Ok(()),
            CacheVectorSearch::Disabled => Err(CatalogError::Unsupported(
                "similarity search needs the record store; snapshot scans are disabled".into(),
            )),
        }
    }
}
