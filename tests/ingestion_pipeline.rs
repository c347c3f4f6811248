use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use catalog_service::mapping::MappingSettings;
use catalog_service::*;

const DIM: usize = 4;
const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D, b'I', b'H', b'D', b'R'];

struct FakeFetcher;

#[async_trait]
impl ImageFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        if url.contains("broken") {
            return Err(CatalogError::Transport(format!("image download failed: {url}")));
        }
        Ok(PNG.to_vec())
    }
}

#[derive(Default)]
struct RecordingUploader {
    keys: Mutex<Vec<String>>,
    cancel_after: Option<(usize, CancellationToken)>,
}

#[async_trait]
impl MediaUploader for RecordingUploader {
    async fn upload(&self, _bytes: Vec<u8>, key: &str, content_type: &str) -> Result<String> {
        assert_eq!(content_type, "image/png");
        let count = {
            let mut keys = self.keys.lock().unwrap();
            keys.push(key.to_string());
            keys.len()
        };
        if let Some((n, token)) = &self.cancel_after {
            if count >= *n {
                token.cancel();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(format!("https://cdn.test/{key}"))
    }
}

struct FakeEmbedder {
    fail_on: &'static str,
    config_error: bool,
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingOutput> {
        let text = request.text.clone().unwrap_or_default();
        if self.config_error {
            return Err(CatalogError::Configuration("embedding model id missing".into()));
        }
        if !self.fail_on.is_empty() && text.contains(self.fail_on) {
            return Err(CatalogError::Transport("embeddings service error: status=503".into()));
        }
        let seed = text.len() as f32;
        Ok(EmbeddingOutput {
            text: Some(Embedding::new(vec![seed, 1.0, 0.0, 0.0], "test-model")),
            image: Some(Embedding::new(vec![0.0, 1.0, seed, 0.0], "test-model")),
        })
    }
}

/// Wraps the in-memory store, recording upsert order and failing the first
/// `fail_upserts` upserts (or every one for `usize::MAX`) with a transport error.
struct RecordingStore {
    inner: InMemoryRecordStore,
    order: Mutex<Vec<String>>,
    fail_upserts: usize,
    upsert_calls: AtomicUsize,
}

impl RecordingStore {
    fn new(fail_upserts: usize) -> Self {
        Self {
            inner: InMemoryRecordStore::new(DIM),
            order: Mutex::new(Vec::new()),
            fail_upserts,
            upsert_calls: AtomicUsize::new(0),
        }
    }

    fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordStore for RecordingStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<ProductRecord>> {
        self.inner.get_by_id(id).await
    }

    async fn upsert(&self, record: &ProductRecord) -> Result<()> {
        let call = self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_upserts {
            return Err(CatalogError::Transport("connection reset".into()));
        }
        self.inner.upsert(record).await?;
        self.order.lock().unwrap().push(record.categories[0].clone());
        Ok(())
    }

    async fn scan_all(&self) -> Result<BoxStream<'static, Result<ProductRecord>>> {
        self.inner.scan_all().await
    }

    async fn keyword_search(&self, keyword: &str) -> Result<Vec<ProductRecord>> {
        self.inner.keyword_search(keyword).await
    }

    async fn vector_search(&self, query: &VectorQuery) -> Result<Vec<ScoredRecord>> {
        self.inner.vector_search(query).await
    }

    fn dimension(&self) -> usize {
        DIM
    }
}

fn raw(id: &str, category: &str) -> RawProduct {
    serde_json::from_value(json!({
        "pid": id,
        "title": format!("Product {id}"),
        "description": "Cotton blend",
        "selling_price": "1,760",
        "images": [format!("https://img.test/{id}.jpeg")],
        "category": category,
        "brand": "Acme"
    }))
    .unwrap()
}

fn feed(items: Vec<RawProduct>) -> impl futures::Stream<Item = Result<RawProduct>> + Send {
    stream::iter(items.into_iter().map(Ok))
}

fn settings(target: usize, base_cap: Option<usize>, workers: usize) -> PipelineSettings {
    PipelineSettings {
        target,
        workers,
        dimension: DIM,
        require_embeddings: false,
        store_max_retries: 3,
        retry_backoff_ms: 1,
        store_timeout: Duration::from_secs(5),
        mapping: MappingSettings {
            fx_rate: 88.0,
            settlement_currency: "USD".into(),
            media_prefix: "products".into(),
        },
        quota: QuotaPolicy::new(target, base_cap, 0.5, 1.5, 0.9),
        max_deferred: target,
    }
}

fn pipeline(
    store: Arc<dyn RecordStore>,
    uploader: Arc<RecordingUploader>,
    embedder: Option<Arc<dyn Embedder>>,
    settings: PipelineSettings,
) -> IngestionPipeline {
    IngestionPipeline::new(store, Arc::new(FakeFetcher), uploader, embedder, settings)
}

fn embedder() -> Option<Arc<dyn Embedder>> {
    Some(Arc::new(FakeEmbedder { fail_on: "", config_error: false }))
}

#[tokio::test]
async fn category_caps_relax_in_stages() {
    // 30 entries of one category ahead of 30 entries spread over ten others.
    let mut items: Vec<RawProduct> = (0..30).map(|i| raw(&format!("big-{i}"), "Big")).collect();
    items.extend((0..30).map(|i| raw(&format!("other-{i}"), &format!("c{}", i % 10))));

    let store = Arc::new(RecordingStore::new(0));
    let p = pipeline(store.clone(), Arc::new(RecordingUploader::default()), embedder(), settings(40, Some(5), 1));
    let report = p.run(feed(items), CancellationToken::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.accepted, 40);

    // One worker: the i-th upsert happens with exactly i acceptances committed.
    // relax start = 20, relax final = 36, base cap 5, relaxed cap 8.
    let order = store.order();
    assert_eq!(order.len(), 40);
    let mut big = 0;
    for (i, category) in order.iter().enumerate() {
        if category == "big" {
            big += 1;
        }
        if i < 20 {
            assert!(big <= 5, "upsert {i}: {big} big records before caps relaxed");
        } else if i < 36 {
            assert!(big <= 8, "upsert {i}: {big} big records before caps were lifted");
        }
    }
    assert_eq!(report.accepted_per_category.get("big"), Some(&12));
    assert_eq!(report.rejected_total(), 0);
}

#[tokio::test]
async fn under_filled_run_is_reported() {
    let mut items = Vec::new();
    for i in 0..950 {
        items.push(raw(&format!("p{i}"), &format!("cat{}", i % 20)));
    }
    for i in 0..25 {
        let mut missing_title = raw(&format!("untitled-{i}"), "cat0");
        missing_title.title = None;
        items.push(missing_title);
    }
    for i in 0..25 {
        items.push(raw(&format!("p{i}"), "cat0"));
    }

    let store = Arc::new(InMemoryRecordStore::new(DIM));
    let p = pipeline(store.clone(), Arc::new(RecordingUploader::default()), embedder(), settings(1000, None, 8));
    let report = p.run(feed(items), CancellationToken::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::UnderFilled);
    assert!(report.is_under_filled());
    assert_eq!(report.accepted, 950);
    assert_eq!(report.scanned, 1000);
    assert_eq!(report.rejected_for(RejectReason::MissingTitle), 25);
    assert_eq!(report.rejected_for(RejectReason::Duplicate), 25);
    assert_eq!(store.len(), 950);
}

#[tokio::test]
async fn stops_at_exact_target() {
    let items: Vec<RawProduct> = (0..100).map(|i| raw(&format!("p{i}"), &format!("c{}", i % 10))).collect();
    let store = Arc::new(InMemoryRecordStore::new(DIM));
    let uploader = Arc::new(RecordingUploader::default());
    let p = pipeline(store.clone(), uploader.clone(), embedder(), settings(30, None, 8));
    let report = p.run(feed(items), CancellationToken::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.accepted, 30);
    assert_eq!(store.len(), 30);
    assert_eq!(uploader.keys.lock().unwrap().len(), 30);

    let stored = store.records().unwrap();
    let record = &stored[0];
    assert!(record.picture_ref.starts_with("https://cdn.test/products/product-"));
    assert!(record.picture_ref.ends_with(".png"));
    assert_eq!(record.price.currency_code, "USD");
    assert_eq!(record.price.units, 20);
    assert!(record.text_embedding.is_some() && record.image_embedding.is_some());
}

#[tokio::test]
async fn skips_records_already_in_store() {
    let existing = ProductRecord {
        id: "p0".into(),
        name: "Existing".into(),
        description: String::new(),
        picture_ref: "/static/img/products/existing.png".into(),
        price: Money::new("USD", 1, 0),
        categories: vec!["c0".into()],
        metadata: Default::default(),
        text_embedding: None,
        image_embedding: None,
    };
    let store = Arc::new(InMemoryRecordStore::with_records(DIM, vec![existing.clone()]));
    let items = vec![raw("p0", "c0"), raw("p1", "c0")];
    let p = pipeline(store.clone(), Arc::new(RecordingUploader::default()), embedder(), settings(2, None, 2));
    let report = p.run(feed(items), CancellationToken::new()).await.unwrap();

    assert_eq!(report.accepted, 1);
    assert_eq!(report.rejected_for(RejectReason::Duplicate), 1);
    assert_eq!(report.status, RunStatus::UnderFilled);
    assert_eq!(store.get_by_id("p0").await.unwrap(), Some(existing));
}

#[tokio::test]
async fn embedding_failures_follow_policy() {
    let mut flaky = raw("p1", "c0");
    flaky.description = Some("noembed".into());
    let items = vec![raw("p0", "c0"), flaky.clone()];
    let failing: Option<Arc<dyn Embedder>> = Some(Arc::new(FakeEmbedder { fail_on: "noembed", config_error: false }));

    let store = Arc::new(InMemoryRecordStore::new(DIM));
    let p = pipeline(store.clone(), Arc::new(RecordingUploader::default()), failing.clone(), settings(2, None, 2));
    let report = p.run(feed(items.clone()), CancellationToken::new()).await.unwrap();
    assert_eq!(report.accepted, 2);
    assert_eq!(report.embedding_failures, 1);
    let stored = store.get_by_id("p1").await.unwrap().unwrap();
    assert!(stored.text_embedding.is_none() && stored.image_embedding.is_none());

    let store = Arc::new(InMemoryRecordStore::new(DIM));
    let mut strict = settings(2, None, 2);
    strict.require_embeddings = true;
    let p = pipeline(store.clone(), Arc::new(RecordingUploader::default()), failing, strict);
    let report = p.run(feed(items), CancellationToken::new()).await.unwrap();
    assert_eq!(report.accepted, 1);
    assert_eq!(report.rejected_for(RejectReason::EmbeddingFailed), 1);
    assert!(store.get_by_id("p1").await.unwrap().is_none());
}

#[tokio::test]
async fn media_failure_frees_the_slot() {
    let mut broken = raw("p0", "c0");
    broken.images = vec!["https://broken.test/p0.jpeg".into()];
    let items = vec![broken, raw("p1", "c0"), raw("p2", "c0")];

    let store = Arc::new(InMemoryRecordStore::new(DIM));
    let p = pipeline(store.clone(), Arc::new(RecordingUploader::default()), embedder(), settings(2, Some(2), 1));
    let report = p.run(feed(items), CancellationToken::new()).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.accepted, 2);
    assert_eq!(report.rejected_for(RejectReason::MediaFailed), 1);
    assert!(store.get_by_id("p0").await.unwrap().is_none());
}

#[tokio::test]
async fn upserts_retry_transient_failures() {
    let store = Arc::new(RecordingStore::new(2));
    let items = vec![raw("p0", "c0"), raw("p1", "c1")];
    let p = pipeline(store.clone(), Arc::new(RecordingUploader::default()), embedder(), settings(2, None, 1));
    let report = p.run(feed(items), CancellationToken::new()).await.unwrap();
    assert_eq!(report.accepted, 2);
    assert_eq!(store.upsert_calls.load(Ordering::SeqCst), 4);

    let store = Arc::new(RecordingStore::new(usize::MAX));
    let p = pipeline(store.clone(), Arc::new(RecordingUploader::default()), embedder(), settings(1, None, 1));
    let report = p.run(feed(vec![raw("p0", "c0")]), CancellationToken::new()).await.unwrap();
    assert_eq!(report.accepted, 0);
    assert_eq!(report.rejected_for(RejectReason::UpsertFailed), 1);
    // One attempt plus three retries.
    assert_eq!(store.upsert_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn cancelled_before_start_loads_nothing() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let store = Arc::new(InMemoryRecordStore::new(DIM));
    let items: Vec<RawProduct> = (0..10).map(|i| raw(&format!("p{i}"), "c0")).collect();
    let p = pipeline(store.clone(), Arc::new(RecordingUploader::default()), embedder(), settings(5, None, 2));
    let report = p.run(feed(items), cancel).await.unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.accepted, 0);
    assert!(store.is_empty());
}

#[tokio::test]
async fn cancellation_drains_in_flight_work() {
    let cancel = CancellationToken::new();
    let uploader = Arc::new(RecordingUploader { keys: Mutex::new(Vec::new()), cancel_after: Some((3, cancel.clone())) });
    let store = Arc::new(InMemoryRecordStore::new(DIM));
    let items: Vec<RawProduct> = (0..200).map(|i| raw(&format!("p{i}"), &format!("c{}", i % 20))).collect();
    let p = pipeline(store.clone(), uploader.clone(), embedder(), settings(100, None, 4));
    let report = p.run(feed(items), cancel).await.unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert!(report.accepted >= 3);
    assert!(report.accepted < 100);
    // Everything that started media work was finished and stored.
    assert_eq!(store.len(), report.accepted);
    assert_eq!(uploader.keys.lock().unwrap().len(), report.accepted);
}

#[tokio::test]
async fn configuration_errors_abort_the_run() {
    let store = Arc::new(InMemoryRecordStore::new(DIM));
    let broken: Option<Arc<dyn Embedder>> = Some(Arc::new(FakeEmbedder { fail_on: "", config_error: true }));
    let p = pipeline(store.clone(), Arc::new(RecordingUploader::default()), broken, settings(3, None, 2));
    let items: Vec<RawProduct> = (0..5).map(|i| raw(&format!("p{i}"), "c0")).collect();
    let err = p.run(feed(items), CancellationToken::new()).await.unwrap_err();
    assert!(err.is_configuration());
    assert!(store.is_empty());
}

#[tokio::test]
async fn ingests_json_lines_feed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("feed.jsonl");
    let lines: Vec<String> = (0..6)
        .map(|i| serde_json::to_string(&raw(&format!("p{i}"), "Shoes")).unwrap())
        .chain(std::iter::once("{not json".to_string()))
        .collect();
    std::fs::write(&path, lines.join("\n")).unwrap();

    let store = Arc::new(InMemoryRecordStore::new(DIM));
    let p = pipeline(store.clone(), Arc::new(RecordingUploader::default()), embedder(), settings(10, None, 3));
    let report = p.run(FeedReader::open(&path).stream(), CancellationToken::new()).await.unwrap();

    assert_eq!(report.accepted, 6);
    assert_eq!(report.rejected_for(RejectReason::InvalidRecord), 1);
    let per_category: HashMap<_, _> = report.accepted_per_category.into_iter().collect();
    assert_eq!(per_category.get("shoes"), Some(&6));
}
