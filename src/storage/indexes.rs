use bson::{doc, Document};
use futures::TryStreamExt;
use mongodb::IndexModel;

use crate::config::Config;
use crate::models::*;
use crate::storage::MongoRecordStore;

fn vector_index_definition(name: &str, path: &str, dimension: usize) -> Document {
    doc! {
        "name": name,
        "type": "vectorSearch",
        "definition": {
            "fields": [
                { "type": "vector", "path": path, "numDimensions": dimension as i32, "similarity": "cosine" },
                { "type": "filter", "path": "categories" },
            ]
        }
    }
}

/// `numDimensions` of the vector field in a `$listSearchIndexes` entry.
fn indexed_dimension(index: &Document) -> Option<i64> {
    let definition = index
        .get_document("latestDefinition")
        .or_else(|_| index.get_document("definition"))
        .ok()?;
    definition.get_array("fields").ok()?.iter().find_map(|field| {
        let field = field.as_document()?;
        if field.get_str("type").ok()? != "vector" {
            return None;
        }
        match field.get("numDimensions")? {
            bson::Bson::Int32(n) => Some(*n as i64),
            bson::Bson::Int64(n) => Some(*n),
            bson::Bson::Double(n) => Some(*n as i64),
            _ => None,
        }
    })
}

/// Names of the wanted indexes that do not exist yet. An existing index built
/// for another dimension is a configuration error.
fn missing_vector_indexes<'a>(existing: &[Document], wanted: &[&'a str], dimension: usize) -> Result<Vec<&'a str>> {
    let mut missing = Vec::new();
    for name in wanted {
        match existing.iter().find(|idx| idx.get_str("name").ok() == Some(*name)) {
            Some(idx) => match indexed_dimension(idx) {
                Some(indexed) if indexed != dimension as i64 => {
                    return Err(CatalogError::Configuration(format!(
                        "vector index {name} has {indexed} dimensions, EMBEDDING_DIMENSION is {dimension}"
                    )));
                }
                _ => {}
            },
            None => missing.push(*name),
        }
    }
    Ok(missing)
}

/// Creates the lookup indexes and the two vector search indexes. Deployments
/// without Atlas Search reject the search index commands; that is logged and
/// the store keeps working for everything except ANN queries.
pub async fn ensure_catalog_indexes(store: &MongoRecordStore, config: &Config) -> Result<()> {
    let db = store.database();
    let collection = db.collection::<Document>(store.collection_name());

    collection
        .create_index(IndexModel::builder().keys(doc! { "categories": 1 }).build(), None)
        .await?;
    collection
        .create_index(IndexModel::builder().keys(doc! { "name": 1 }).build(), None)
        .await?;
    tracing::info!(collection = %store.collection_name(), "Catalog lookup indexes ensured");

    let listed = match collection.aggregate(vec![doc! { "$listSearchIndexes": {} }], None).await {
        Ok(cursor) => cursor.try_collect::<Vec<Document>>().await,
        Err(e) => Err(e),
    };
    let existing = match listed {
        Ok(existing) => existing,
        Err(e) => {
            tracing::warn!(
                error = %e,
                "Could not list vector search indexes; similarity queries against the store will fail"
            );
            return Ok(());
        }
    };

    let wanted = [config.text_vector_index.as_str(), config.image_vector_index.as_str()];
    let missing = missing_vector_indexes(&existing, &wanted, config.embedding_dimension)?;
    if missing.is_empty() {
        tracing::info!(dimension = config.embedding_dimension, "Vector search indexes already present");
        return Ok(());
    }

    let definitions: Vec<Document> = missing
        .iter()
        .map(|name| {
            let path = if *name == config.text_vector_index { "text_embedding.vector" } else { "image_embedding.vector" };
            vector_index_definition(name, path, config.embedding_dimension)
        })
        .collect();
    let command = doc! { "createSearchIndexes": store.collection_name(), "indexes": definitions };
    match db.run_command(command, None).await {
        Ok(_) => tracing::info!(
            indexes = ?missing,
            dimension = config.embedding_dimension,
            "Vector search indexes requested"
        ),
        Err(e) => tracing::warn!(
            error = %e,
            "Could not create vector search indexes; similarity queries against the store will fail"
        ),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_index_has_category_filter() {
        let def = vector_index_definition("text_vec", "text_embedding.vector", 1408);
        let fields = def.get_document("definition").unwrap().get_array("fields").unwrap();
        assert_eq!(fields.len(), 2);
        let vector = fields[0].as_document().unwrap();
        assert_eq!(vector.get_i32("numDimensions").unwrap(), 1408);
        assert_eq!(vector.get_str("similarity").unwrap(), "cosine");
        assert_eq!(fields[1].as_document().unwrap().get_str("path").unwrap(), "categories");
    }

    fn listed(name: &str, dimension: i32) -> Document {
        let def = vector_index_definition(name, "text_embedding.vector", dimension as usize);
        doc! {
            "name": name,
            "status": "READY",
            "latestDefinition": def.get_document("definition").unwrap().clone(),
        }
    }

    #[test]
    fn existing_index_with_other_dimension_is_rejected() {
        let existing = vec![listed("text_vec", 768)];
        let err = missing_vector_indexes(&existing, &["text_vec", "image_vec"], 1408).unwrap_err();
        assert!(err.is_configuration());
        assert!(format!("{err}").contains("768"));
    }

    #[test]
    fn only_absent_indexes_are_created() {
        let existing = vec![listed("text_vec", 1408)];
        let missing = missing_vector_indexes(&existing, &["text_vec", "image_vec"], 1408).unwrap();
        assert_eq!(missing, vec!["image_vec"]);
        assert_eq!(missing_vector_indexes(&[], &["text_vec"], 1408).unwrap(), vec!["text_vec"]);
    }
}
