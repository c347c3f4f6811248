use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::models::*;
use crate::query::vector::brute_force_knn;
use crate::storage::RecordStore;

/// Process-local record store for offline runs. Vector search is an exact
/// linear scan, so results match what an ANN index would return at full recall.
pub struct InMemoryRecordStore {
    records: RwLock<BTreeMap<String, ProductRecord>>,
    dimension: usize,
}

impl InMemoryRecordStore {
    pub fn new(dimension: usize) -> Self {
        Self { records: RwLock::new(BTreeMap::new()), dimension }
    }

    pub fn with_records(dimension: usize, records: impl IntoIterator<Item = ProductRecord>) -> Self {
        let map = records.into_iter().map(|r| (r.id.clone(), r)).collect();
        Self { records: RwLock::new(map), dimension }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, ProductRecord>>> {
        self.records
            .read()
            .map_err(|_| CatalogError::Transport("in-memory store lock poisoned".into()))
    }

    pub fn len(&self) -> usize {
        self.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every record in id order.
    pub fn records(&self) -> Result<Vec<ProductRecord>> {
        Ok(self.read()?.values().cloned().collect())
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<ProductRecord>> {
        Ok(self.read()?.get(id).cloned())
    }

    async fn upsert(&self, record: &ProductRecord) -> Result<()> {
        record.validate(self.dimension)?;
        let mut guard = self
            .records
            .write()
            .map_err(|_| CatalogError::Transport("in-memory store lock poisoned".into()))?;
        guard.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn scan_all(&self) -> Result<BoxStream<'static, Result<ProductRecord>>> {
        let all = self.records()?;
        Ok(stream::iter(all.into_iter().map(Ok)).boxed())
    }

    async fn keyword_search(&self, keyword: &str) -> Result<Vec<ProductRecord>> {
        let needle = keyword.trim().to_lowercase();
        Ok(self
            .read()?
            .values()
            .filter(|r| needle.is_empty() || r.matches_keyword(&needle))
            .cloned()
            .collect())
    }

    async fn vector_search(&self, query: &VectorQuery) -> Result<Vec<ScoredRecord>> {
        query.check_dimension(self.dimension)?;
        let guard = self.read()?;
        brute_force_knn(guard.values(), query)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
