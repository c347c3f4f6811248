use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use catalog_service::schema::{create_schema, CatalogSchema};
use catalog_service::server::build_router;
use catalog_service::*;

const DIM: usize = 3;

fn product(id: &str, name: &str, text: [f32; 3]) -> ProductRecord {
    ProductRecord {
        id: id.into(),
        name: name.into(),
        description: format!("{name}. Hand made"),
        picture_ref: format!("/static/img/products/{id}.jpg"),
        price: Money::new("USD", 19, 990_000_000),
        categories: vec!["kitchen".into()],
        metadata: serde_json::from_value(json!({"brand": "Acme"})).unwrap(),
        text_embedding: Some(Embedding::new(text.to_vec(), "test-model")),
        image_embedding: Some(Embedding::new(text.to_vec(), "test-model")),
    }
}

/// Cache holds "mug" and "bowl"; the routed store only holds "store-only".
fn schema(selective: bool) -> CatalogSchema {
    let cache_source: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::with_records(
        DIM,
        vec![product("mug", "Stoneware Mug", [1.0, 0.0, 0.0]), product("bowl", "Salad Bowl", [0.0, 1.0, 0.0])],
    ));
    let store: Arc<dyn RecordStore> =
        Arc::new(InMemoryRecordStore::with_records(DIM, vec![product("store-only", "Teapot", [0.0, 0.0, 1.0])]));
    let cache = Arc::new(SnapshotCache::new(SnapshotSource::store(cache_source), Duration::from_secs(5)));
    let settings = QuerySettings {
        store_timeout: Duration::from_secs(1),
        dimension: DIM,
        default_weights: HybridWeights::new(0.6, 0.4).unwrap(),
        hybrid_candidate_multiplier: 4,
        cache_vector_search: CacheVectorSearch::BruteForce,
        extra_latency: Duration::ZERO,
    };
    let engine = QueryEngine::new(SourceRouter::new(selective, true), Some(store), cache, settings);
    create_schema(Arc::new(engine))
}

async fn spawn_server(schema: CatalogSchema) -> String {
    let app = build_router(schema);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    format!("http://{}", addr)
}

async fn post(base: &str, query: &str, use_database: bool) -> Value {
    let mut req = reqwest::Client::new().post(format!("{}/graphql", base)).json(&json!({ "query": query }));
    if use_database {
        req = req.header("use-database", "true");
    }
    req.send().await.unwrap().json().await.unwrap()
}

#[tokio::test]
async fn health_endpoint() {
    let base = spawn_server(schema(true)).await;
    let body = reqwest::get(format!("{}/health", base)).await.unwrap().text().await.unwrap();
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn product_by_id_from_cache() {
    let res = schema(true)
        .execute(r#"{ product(id: "mug") { id name picture categories metadata hasTextEmbedding price { currencyCode units nanos amount } } }"#)
        .await;
    assert!(res.errors.is_empty(), "{:?}", res.errors);
    let data = res.data.into_json().unwrap();
    let p = &data["product"];
    assert_eq!(p["name"], "Stoneware Mug");
    assert_eq!(p["picture"], "/static/img/products/mug.jpg");
    assert_eq!(p["metadata"]["brand"], "Acme");
    assert_eq!(p["hasTextEmbedding"], true);
    assert_eq!(p["price"]["currencyCode"], "USD");
    assert_eq!(p["price"]["units"], 19);
    assert!((p["price"]["amount"].as_f64().unwrap() - 19.99).abs() < 1e-9);
}

#[tokio::test]
async fn missing_product_has_not_found_code() {
    let res = schema(true).execute(r#"{ product(id: "nope") { id } }"#).await;
    assert_eq!(res.errors.len(), 1);
    let err = serde_json::to_value(&res.errors[0]).unwrap();
    assert_eq!(err["extensions"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn use_database_header_routes_to_store() {
    let base = spawn_server(schema(true)).await;
    let query = r#"{ product(id: "store-only") { name } }"#;

    let from_cache = post(&base, query, false).await;
    assert_eq!(from_cache["errors"][0]["extensions"]["code"], "NOT_FOUND");

    let from_store = post(&base, query, true).await;
    assert_eq!(from_store["data"]["product"]["name"], "Teapot");

    let listed = post(&base, "{ products { id } }", true).await;
    assert_eq!(listed["data"]["products"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn search_and_similarity_queries() {
    let s = schema(true);
    let res = s.execute(r#"{ searchProducts(query: "mug") { id } }"#).await;
    assert_eq!(res.data.into_json().unwrap(), json!({"searchProducts": [{"id": "mug"}]}));

    let res = s
        .execute(r#"{ similarProducts(vector: [0.0, 1.0, 0.0], modality: TEXT, limit: 1) { distance product { id } } }"#)
        .await;
    assert!(res.errors.is_empty(), "{:?}", res.errors);
    let data = res.data.into_json().unwrap();
    assert_eq!(data["similarProducts"][0]["product"]["id"], "bowl");

    let res = s
        .execute(r#"{ hybridProducts(textVector: [1.0, 0.0, 0.0], imageVector: [1.0, 0.0, 0.0], textWeight: 1.0, imageWeight: 0.0) { distance product { id } } }"#)
        .await;
    let data = res.data.into_json().unwrap();
    let ids: Vec<_> = data["hybridProducts"].as_array().unwrap().iter().map(|h| h["product"]["id"].clone()).collect();
    assert_eq!(ids, vec![json!("mug"), json!("bowl")]);
}

#[tokio::test]
async fn bad_arguments_are_reported() {
    let s = schema(true);
    let res = s.execute(r#"{ similarProducts(vector: [1.0], modality: IMAGE) { distance } }"#).await;
    let err = serde_json::to_value(&res.errors[0]).unwrap();
    assert_eq!(err["extensions"]["code"], "CONFIGURATION");

    let res = s.execute(r#"{ similarProducts(vector: [1.0, 0.0, 0.0], modality: IMAGE, limit: -1) { distance } }"#).await;
    let err = serde_json::to_value(&res.errors[0]).unwrap();
    assert_eq!(err["extensions"]["code"], "BAD_USER_INPUT");

    let res = s
        .execute(r#"{ hybridProducts(textVector: [1.0, 0.0, 0.0], imageVector: [1.0, 0.0, 0.0], textWeight: -1.0) { distance } }"#)
        .await;
    assert!(!res.errors.is_empty());
}
