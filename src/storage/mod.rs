pub mod file;
pub mod indexes;
pub mod memory;
pub mod mongo;

pub use file::*;
pub use indexes::*;
pub use memory::*;
pub use mongo::*;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::models::*;

/// Durable, authoritative storage of catalog records.
///
/// Implementations signal connectivity problems as transport errors and leave
/// retrying to the caller. A query vector whose length differs from the
/// provisioned column is a configuration error, never an empty result.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<ProductRecord>>;

    /// Inserts or fully replaces the record with the same id. Applying the
    /// same record twice leaves the same stored state.
    async fn upsert(&self, record: &ProductRecord) -> Result<()>;

    /// A fresh, lazy pass over every record. Call again to restart.
    async fn scan_all(&self) -> Result<BoxStream<'static, Result<ProductRecord>>>;

    async fn keyword_search(&self, keyword: &str) -> Result<Vec<ProductRecord>>;

    /// Ascending distance. Approximate when backed by an ANN index.
    async fn vector_search(&self, query: &VectorQuery) -> Result<Vec<ScoredRecord>>;

    fn dimension(&self) -> usize;
}
