use async_trait::async_trait;
use bson::{doc, Document};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use mongodb::options::{ClientOptions, ReplaceOptions};
use mongodb::{Client, Collection, Database};
use std::time::Duration;

use crate::config::Config;
use crate::models::*;
use crate::query::vector::rank_order;
use crate::storage::RecordStore;

/// MongoDB-backed record store. Vector search uses Atlas `$vectorSearch`
/// against one index per modality.
#[derive(Clone)]
pub struct MongoRecordStore {
    db: Database,
    collection: Collection<ProductRecord>,
    dimension: usize,
    num_candidates: usize,
    text_index: String,
    image_index: String,
}

impl MongoRecordStore {
    /// Opens a client with its own connection pool. Serving and ingestion each
    /// connect separately so a bulk run cannot drain the serving pool.
    pub async fn connect(config: &Config, uri: &str, pool_size: u32, workload: &str) -> Result<Self> {
        let mut options = ClientOptions::parse(uri).await?;
        options.max_pool_size = Some(pool_size.max(1));
        options.app_name = Some(format!("catalog-service-{workload}"));
        options.server_selection_timeout = Some(Duration::from_millis(config.store_timeout_ms));
        options.connect_timeout = Some(Duration::from_millis(config.store_timeout_ms));
        let client = Client::with_options(options)?;
        let db = client.database(&config.database_name);

        tracing::info!(
            database = %config.database_name,
            collection = %config.catalog_collection,
            pool_size,
            workload,
            "Connected record store"
        );

        Ok(Self::with_db(db, config))
    }

    pub fn with_db(db: Database, config: &Config) -> Self {
        let collection = db.collection::<ProductRecord>(&config.catalog_collection);
        Self {
            db,
            collection,
            dimension: config.embedding_dimension,
            num_candidates: config.vector_num_candidates,
            text_index: config.text_vector_index.clone(),
            image_index: config.image_vector_index.clone(),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn collection_name(&self) -> &str {
        self.collection.name()
    }

    fn index_for(&self, modality: Modality) -> &str {
        match modality {
            Modality::Text => &self.text_index,
            Modality::Image => &self.image_index,
        }
    }

    fn vector_pipeline(&self, query: &VectorQuery) -> Vec<Document> {
        let query_vector: Vec<f64> = query.vector.iter().map(|v| *v as f64).collect();
        let mut stage = doc! {
            "index": self.index_for(query.modality),
            "path": query.modality.vector_path(),
            "queryVector": query_vector,
            "numCandidates": self.num_candidates.max(query.limit) as i64,
            "limit": query.limit as i64,
        };
        if let Some(category) = &query.category {
            stage.insert("filter", doc! { "categories": { "$eq": category.as_str() } });
        }
        vec![
            doc! { "$vectorSearch": stage },
            doc! { "$addFields": { "_score": { "$meta": "vectorSearchScore" } } },
        ]
    }
}

/// Atlas reports cosine similarity as `(1 + cos) / 2`.
/// A rejected `$vectorSearch` means the index and the configured dimension
/// disagree, which no amount of retrying or falling back fixes.
fn vector_search_error(index: &str, e: mongodb::error::Error) -> CatalogError {
    let err = CatalogError::from(e);
    if err.is_rejected_command() {
        CatalogError::Configuration(format!("vector search on index {index} was rejected: {err}"))
    } else {
        err
    }
}

fn score_to_distance(score: f64) -> f32 {
    (2.0 - 2.0 * score).clamp(0.0, 2.0) as f32
}

#[async_trait]
impl RecordStore for MongoRecordStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<ProductRecord>> {
        self.collection.find_one(doc! { "_id": id }, None).await.map_err(Into::into)
    }

    async fn upsert(&self, record: &ProductRecord) -> Result<()> {
        record.validate(self.dimension)?;
        let options = ReplaceOptions::builder().upsert(true).build();
        self.collection
            .replace_one(doc! { "_id": record.id.as_str() }, record, options)
            .await?;
        Ok(())
    }

    async fn scan_all(&self) -> Result<BoxStream<'static, Result<ProductRecord>>> {
        let cursor = self.collection.find(doc! {}, None).await?;
        Ok(cursor.map_err(CatalogError::from).boxed())
    }

    async fn keyword_search(&self, keyword: &str) -> Result<Vec<ProductRecord>> {
        let trimmed = keyword.trim();
        let filter = if trimmed.is_empty() {
            doc! {}
        } else {
            let pattern = regex::escape(trimmed);
            doc! {
                "$or": [
                    { "name": { "$regex": pattern.as_str(), "$options": "i" } },
                    { "description": { "$regex": pattern.as_str(), "$options": "i" } },
                    { "categories": { "$regex": pattern.as_str(), "$options": "i" } },
                ]
            }
        };
        let cursor = self.collection.find(filter, None).await?;
        cursor.try_collect::<Vec<ProductRecord>>().await.map_err(Into::into)
    }

    async fn vector_search(&self, query: &VectorQuery) -> Result<Vec<ScoredRecord>> {
        query.check_dimension(self.dimension)?;
        if query.limit == 0 {
            return Ok(Vec::new());
        }

        let index = self.index_for(query.modality);
        let mut cursor = self
            .collection
            .aggregate(self.vector_pipeline(query), None)
            .await
            .map_err(|e| vector_search_error(index, e))?;
        let mut hits = Vec::new();
        while let Some(doc) = cursor.try_next().await.map_err(|e| vector_search_error(index, e))? {
            let score = doc.get_f64("_score").unwrap_or(0.0);
            let record: ProductRecord = bson::from_document(doc)?;
            hits.push(ScoredRecord { record, distance: score_to_distance(score) });
        }
        hits.sort_by(rank_order);

        tracing::debug!(
            modality = %query.modality,
            limit = query.limit,
            num_candidates = self.num_candidates,
            hits = hits.len(),
            "Vector search completed"
        );
        Ok(hits)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_atlas_score_to_cosine_distance() {
        assert_eq!(score_to_distance(1.0), 0.0);
        assert!((score_to_distance(0.5) - 1.0).abs() < 1e-6);
        assert_eq!(score_to_distance(0.0), 2.0);
    }

    #[test]
    fn rejected_vector_search_is_a_configuration_error() {
        let cmd: mongodb::error::CommandError = bson::from_document(doc! {
            "code": 2,
            "codeName": "BadValue",
            "errmsg": "vector field is indexed with 768 dimensions but queried with 1408",
        })
        .unwrap();
        let err = vector_search_error("text_vec", mongodb::error::ErrorKind::Command(cmd).into());
        assert!(err.is_configuration());
        assert!(format!("{err}").contains("768 dimensions"));

        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "socket timeout");
        assert!(vector_search_error("text_vec", io.into()).is_transport());
    }
}
