use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::models::*;

#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRequest {
    pub text: Option<String>,
    pub image_ref: Option<String>,
    pub dimension: usize,
}

/// Vectors come back already paired with the model that produced them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingOutput {
    pub text: Option<Embedding>,
    pub image: Option<Embedding>,
}

/// Computes text and/or image embeddings for one candidate.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingOutput>;
}

#[async_trait]
impl<E: Embedder + ?Sized> Embedder for Arc<E> {
    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingOutput> {
        (**self).embed(request).await
    }
}

/// GraphQL client for the multimodal embeddings service.
#[derive(Clone)]
pub struct EmbeddingsServiceClient {
    client: Client,
    base_url: String,
    model_id: String,
    user_agent: String,
    max_retries: u32,
    base_backoff_ms: u64,
}

impl EmbeddingsServiceClient {
    pub fn new(
        base_url: String,
        model_id: String,
        timeout_ms: u64,
        user_agent: String,
        max_retries: u32,
        base_backoff_ms: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .connect_timeout(Duration::from_millis(timeout_ms.min(10_000)))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model_id,
            user_agent,
            max_retries,
            base_backoff_ms,
        })
    }

    fn parse_vector(value: Option<&Value>, model_id: &str, dimension: usize, field: &str) -> Result<Option<Embedding>> {
        let Some(array) = value.and_then(|v| v.as_array()) else {
            return Ok(None);
        };
        let vector: Vec<f32> = array.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect();
        if vector.is_empty() {
            return Ok(None);
        }
        if vector.len() != dimension {
            return Err(CatalogError::Configuration(format!(
                "embeddings service returned {field} of dimension {} (expected {dimension})",
                vector.len()
            )));
        }
        Ok(Some(Embedding::new(vector, model_id)))
    }

    fn backoff_ms(&self, attempt: u32) -> u64 {
        self.base_backoff_ms.saturating_mul(1u64 << attempt.min(16))
    }

    async fn send_with_retry(&self, body: &Value) -> Result<Value> {
        // Simple bounded exponential backoff retry loop
        let url = format!("{}/graphql", self.base_url);
        let mut attempt: u32 = 0;
        loop {
            let resp_res = self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .header("User-Agent", &self.user_agent)
                .json(body)
                .send()
                .await;

            match resp_res {
                Ok(response) if response.status().is_success() => return Ok(response.json().await?),
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    let transient = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
                    if transient && attempt < self.max_retries {
                        let backoff = self.backoff_ms(attempt);
                        tracing::warn!(status = %status, attempt = attempt + 1, backoff_ms = backoff, "embeddings transient error; retrying");
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(CatalogError::Transport(format!(
                        "Embeddings service error: status={} body={}",
                        status,
                        text.chars().take(200).collect::<String>()
                    )));
                }
                Err(e) => {
                    if attempt < self.max_retries {
                        let backoff = self.backoff_ms(attempt);
                        tracing::warn!(error = %e, attempt = attempt + 1, backoff_ms = backoff, "embeddings request error; retrying");
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }
    }
}

#[async_trait]
impl Embedder for EmbeddingsServiceClient {
    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingOutput> {
        if request.text.is_none() && request.image_ref.is_none() {
            return Ok(EmbeddingOutput::default());
        }

        let mutation = r#"
            mutation EmbedMultimodal($input: MultimodalEmbeddingInput!) {
                embedMultimodal(input: $input) {
                    textVector
                    imageVector
                    modelId
                }
            }
        "#;

        let body = serde_json::json!({
            "query": mutation,
            "variables": {
                "input": {
                    "model": self.model_id,
                    "text": request.text,
                    "imageUrl": request.image_ref,
                    "dimension": request.dimension,
                }
            }
        });

        let result = self.send_with_retry(&body).await?;
        if let Some(errors) = result.get("errors") {
            return Err(CatalogError::Transport(format!("Embeddings service GraphQL errors: {}", errors)));
        }

        let payload = result.get("data").and_then(|d| d.get("embedMultimodal"));
        let model_id = payload
            .and_then(|p| p.get("modelId"))
            .and_then(|m| m.as_str())
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(self.model_id.as_str())
            .to_string();

        let text = Self::parse_vector(payload.and_then(|p| p.get("textVector")), &model_id, request.dimension, "textVector")?;
        let image = Self::parse_vector(payload.and_then(|p| p.get("imageVector")), &model_id, request.dimension, "imageVector")?;

        tracing::debug!(
            model_id = %model_id,
            text = text.is_some(),
            image = image.is_some(),
            dimension = request.dimension,
            "Generated embeddings"
        );
        Ok(EmbeddingOutput { text, image })
    }
}

struct RateState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket holding at most one token, so calls through it never exceed
/// `max_qps` in any one-second window. Waiters queue on the mutex.
pub struct RateLimitedEmbedder<E> {
    inner: E,
    state: Mutex<RateState>,
    refill_per_sec: f64,
}

impl<E: Embedder> RateLimitedEmbedder<E> {
    pub fn new(inner: E, max_qps: f64) -> Self {
        Self {
            inner,
            state: Mutex::new(RateState { tokens: 1.0, last_refill: Instant::now() }),
            refill_per_sec: max_qps,
        }
    }

    async fn acquire(&self) {
        if !(self.refill_per_sec.is_finite() && self.refill_per_sec > 0.0) {
            return;
        }
        let mut guard = self.state.lock().await;
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(guard.last_refill).as_secs_f64();
            guard.last_refill = now;
            guard.tokens = (guard.tokens + elapsed * self.refill_per_sec).min(1.0);
            if guard.tokens >= 1.0 {
                guard.tokens -= 1.0;
                return;
            }
            let wait = (1.0 - guard.tokens) / self.refill_per_sec;
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        }
    }
}

#[async_trait]
impl<E: Embedder> Embedder for RateLimitedEmbedder<E> {
    async fn embed(&self, request: &EmbeddingRequest) -> Result<EmbeddingOutput> {
        self.acquire().await;
        self.inner.embed(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_is_capped_for_large_retry_counts() {
        let client = EmbeddingsServiceClient::new("http://127.0.0.1:1".into(), "m".into(), 1_000, "t".into(), 100, 250).unwrap();
        assert_eq!(client.backoff_ms(0), 250);
        assert_eq!(client.backoff_ms(3), 2_000);
        assert_eq!(client.backoff_ms(64), 250 << 16);
        assert_eq!(client.backoff_ms(99), client.backoff_ms(16));
    }

    struct CountingEmbedder(AtomicUsize);

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, _request: &EmbeddingRequest) -> Result<EmbeddingOutput> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(EmbeddingOutput::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_spaces_calls() {
        let limited = RateLimitedEmbedder::new(CountingEmbedder(AtomicUsize::new(0)), 10.0);
        let req = EmbeddingRequest { text: Some("x".into()), image_ref: None, dimension: 4 };
        let started = Instant::now();
        for _ in 0..5 {
            limited.embed(&req).await.unwrap();
        }
        assert_eq!(limited.inner.0.load(Ordering::SeqCst), 5);
        assert!(started.elapsed() >= Duration::from_millis(390));
    }

    #[test]
    fn rejects_wrong_dimension_from_service() {
        let v = serde_json::json!([0.1, 0.2, 0.3]);
        let err = EmbeddingsServiceClient::parse_vector(Some(&v), "m", 4, "textVector").unwrap_err();
        assert!(err.is_configuration());
        let ok = EmbeddingsServiceClient::parse_vector(Some(&v), "m", 3, "textVector").unwrap().unwrap();
        assert_eq!(ok.model_id, "m");
        assert!(EmbeddingsServiceClient::parse_vector(None, "m", 3, "textVector").unwrap().is_none());
    }
}
