use futures::{Stream, StreamExt};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::clients::{Embedder, EmbeddingRequest, ImageFetcher, MediaUploader};
use crate::config::Config;
use crate::ingestion::quota::{QuotaBook, QuotaPolicy};
use crate::mapping::{map_candidate, media_key, ImageKind, MappingSettings};
use crate::models::*;
use crate::storage::RecordStore;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub target: usize,
    pub workers: usize,
    pub dimension: usize,
    /// Reject candidates whose embeddings fail instead of storing them without vectors.
    pub require_embeddings: bool,
    pub store_max_retries: u32,
    pub retry_backoff_ms: u64,
    pub store_timeout: Duration,
    pub mapping: MappingSettings,
    pub quota: QuotaPolicy,
    /// Over-cap candidates kept for another try once caps relax.
    pub max_deferred: usize,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        let target = config.ingest_target_count;
        Self {
            target,
            workers: config.ingest_workers.max(1),
            dimension: config.embedding_dimension,
            require_embeddings: config.ingest_require_embeddings,
            store_max_retries: config.upsert_max_retries,
            retry_backoff_ms: config.http_retry_backoff_ms,
            store_timeout: Duration::from_millis(config.store_timeout_ms),
            mapping: MappingSettings {
                fx_rate: config.ingest_fx_rate,
                settlement_currency: config.settlement_currency.clone(),
                media_prefix: config.media_prefix.clone(),
            },
            quota: QuotaPolicy::new(
                target,
                config.ingest_max_per_category,
                config.ingest_cap_relax_start,
                config.ingest_cap_relax_factor,
                config.ingest_cap_relax_final,
            ),
            max_deferred: target,
        }
    }
}

#[derive(Debug)]
struct Completion {
    id: String,
    fairness_key: String,
    outcome: CandidateOutcome,
    embedding_failed: bool,
}

/// The I/O half of a candidate: media, embeddings, upsert. Runs on its own
/// task so a slow candidate never stalls the coordinator.
struct CandidateWorker {
    store: Arc<dyn RecordStore>,
    fetcher: Arc<dyn ImageFetcher>,
    uploader: Arc<dyn MediaUploader>,
    embedder: Option<Arc<dyn Embedder>>,
    dimension: usize,
    require_embeddings: bool,
    media_prefix: String,
    store_max_retries: u32,
    retry_backoff_ms: u64,
    store_timeout: Duration,
}

impl CandidateWorker {
    /// Store call with a per-attempt timeout and bounded exponential backoff
    /// on transport failures.
    async fn with_store_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = match tokio::time::timeout(self.store_timeout, call()).await {
                Ok(r) => r,
                Err(_) => Err(CatalogError::Timeout(self.store_timeout.as_millis() as u64)),
            };
            match result {
                Err(e) if e.is_transport() && attempt < self.store_max_retries => {
                    let backoff = self.retry_backoff_ms.saturating_mul(1u64 << attempt.min(16));
                    tracing::warn!(operation = op, error = %e, attempt = attempt + 1, backoff_ms = backoff, "store transient error; retrying");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn store_media(&self, candidate: &IngestionCandidate) -> Result<String> {
        let bytes = self.fetcher.fetch(&candidate.source_image).await?;
        let kind = ImageKind::sniff(&bytes)?;
        let key = media_key(&self.media_prefix, &candidate.record.name, &candidate.record.id, kind.extension());
        self.uploader.upload(bytes, &key, &kind.content_type()).await
    }

    /// `Err` only for configuration failures, which end the run.
    async fn process(&self, candidate: IngestionCandidate) -> Result<Completion> {
        let id = candidate.id().to_string();
        let fairness_key = candidate.fairness_key.clone();
        let done = |outcome: CandidateOutcome, embedding_failed: bool| Completion {
            id: id.clone(),
            fairness_key: fairness_key.clone(),
            outcome,
            embedding_failed,
        };

        let picture_ref = match self.store_media(&candidate).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(product_id = %id, image = %candidate.source_image, error = %e, "Media upload failed; rejecting candidate");
                return Ok(done(CandidateOutcome::Rejected(RejectReason::MediaFailed), false));
            }
        };
        let image_ref = if picture_ref.starts_with("http://") || picture_ref.starts_with("https://") {
            picture_ref.clone()
        } else {
            candidate.source_image.clone()
        };
        let mut record = candidate.record;
        record.picture_ref = picture_ref;

        let mut embedding_failed = false;
        if let Some(embedder) = &self.embedder {
            let request = EmbeddingRequest {
                text: Some(record.description.clone()),
                image_ref: Some(image_ref),
                dimension: self.dimension,
            };
            match embedder.embed(&request).await {
                Ok(output) => {
                    record.text_embedding = output.text;
                    record.image_embedding = output.image;
                }
                Err(e) if e.is_configuration() => return Err(e),
                Err(e) if self.require_embeddings => {
                    tracing::warn!(product_id = %record.id, error = %e, "Embedding failed; rejecting candidate");
                    return Ok(done(CandidateOutcome::Rejected(RejectReason::EmbeddingFailed), false));
                }
                Err(e) => {
                    tracing::warn!(product_id = %record.id, error = %e, "Embedding failed; storing record without vectors");
                    embedding_failed = true;
                }
            }
        }

        let store = &self.store;
        let rec = &record;
        match self.with_store_retry("upsert", move || store.upsert(rec)).await {
            Ok(()) => Ok(done(CandidateOutcome::Accepted, embedding_failed)),
            Err(e) if e.is_configuration() => Err(e),
            Err(e) => {
                tracing::warn!(product_id = %record.id, error = %e, "Upsert failed after retries; rejecting candidate");
                Ok(done(CandidateOutcome::Rejected(RejectReason::UpsertFailed), embedding_failed))
            }
        }
    }
}

/// Turns a product feed into upserted catalog records, stopping at exactly
/// `target` acceptances or when the feed runs out.
///
/// A single coordinator owns the quota book, the seen-set and the deferred
/// queue. Media, embedding and upsert work for up to `workers` candidates
/// runs concurrently on separate tasks; each reserves its category slot
/// before it starts and commits or releases it when it finishes.
pub struct IngestionPipeline {
    worker: Arc<CandidateWorker>,
    settings: PipelineSettings,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        fetcher: Arc<dyn ImageFetcher>,
        uploader: Arc<dyn MediaUploader>,
        embedder: Option<Arc<dyn Embedder>>,
        settings: PipelineSettings,
    ) -> Self {
        let worker = Arc::new(CandidateWorker {
            store,
            fetcher,
            uploader,
            embedder,
            dimension: settings.dimension,
            require_embeddings: settings.require_embeddings,
            media_prefix: settings.mapping.media_prefix.clone(),
            store_max_retries: settings.store_max_retries,
            retry_backoff_ms: settings.retry_backoff_ms,
            store_timeout: settings.store_timeout,
        });
        Self { worker, settings }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Validation and dedup. `Ok(Err(_))` is an ordinary rejection.
    async fn admit(
        &self,
        raw: &RawProduct,
        seen: &mut HashSet<String>,
    ) -> Result<std::result::Result<IngestionCandidate, RejectReason>> {
        let candidate = match map_candidate(raw, &self.settings.mapping) {
            Ok(c) => c,
            Err(reason) => {
                tracing::debug!(product_id = ?raw.pid, reason = %reason, "Candidate failed validation");
                return Ok(Err(reason));
            }
        };
        if !seen.insert(candidate.id().to_string()) {
            tracing::debug!(product_id = %candidate.id(), "Duplicate id within run; skipping");
            return Ok(Err(RejectReason::Duplicate));
        }

        let store = &self.worker.store;
        let id = candidate.id();
        match self.worker.with_store_retry("get_by_id", move || store.get_by_id(id)).await {
            Ok(Some(_)) => {
                tracing::debug!(product_id = %candidate.id(), "Already in record store; skipping");
                Ok(Err(RejectReason::Duplicate))
            }
            Ok(None) => Ok(Ok(candidate)),
            Err(e) if e.is_configuration() => Err(e),
            Err(e) => {
                tracing::warn!(product_id = %candidate.id(), error = %e, "Dedup lookup failed; skipping candidate");
                Ok(Err(RejectReason::StoreUnavailable))
            }
        }
    }

    fn spawn(&self, tasks: &mut JoinSet<Result<Completion>>, candidate: IngestionCandidate) {
        let worker = self.worker.clone();
        tasks.spawn(async move { worker.process(candidate).await });
    }

    pub async fn run<S>(&self, feed: S, cancel: CancellationToken) -> Result<IngestionReport>
    where
        S: Stream<Item = Result<RawProduct>> + Send,
    {
        let started = Instant::now();
        let run_id = uuid::Uuid::new_v4();
        let target = self.settings.target;
        let workers = self.settings.workers.max(1);
        let mut feed = Box::pin(feed);
        let mut report = IngestionReport::new(target);
        let mut book = QuotaBook::new(self.settings.quota.clone());
        let mut seen: HashSet<String> = HashSet::new();
        let mut deferred: VecDeque<IngestionCandidate> = VecDeque::new();
        let mut ready: VecDeque<IngestionCandidate> = VecDeque::new();
        let mut deferred_dropped = 0usize;
        let mut tasks: JoinSet<Result<Completion>> = JoinSet::new();
        let mut exhausted = false;
        let mut fatal: Option<CatalogError> = None;

        tracing::info!(
            run_id = %run_id,
            target,
            workers,
            base_cap = book.policy().base_cap,
            relaxed_cap = book.policy().relaxed_cap(),
            relax_start = book.policy().relax_start_count(),
            relax_final = book.policy().relax_final_count(),
            "Ingestion run started"
        );

        loop {
            let halted = cancel.is_cancelled() || fatal.is_some();

            // Candidates freed up by a stage change go before new feed entries.
            while !halted && tasks.len() < workers {
                let Some(candidate) = ready.pop_front() else { break };
                if book.try_reserve(&candidate.fairness_key) {
                    self.spawn(&mut tasks, candidate);
                } else {
                    deferred.push_back(candidate);
                }
            }

            if book.is_complete() && tasks.is_empty() {
                break;
            }
            let can_pull = !halted && !exhausted && ready.is_empty() && tasks.len() < workers && book.has_room();
            if !can_pull && tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled(), if can_pull => {
                    tracing::warn!(in_flight = tasks.len(), accepted = book.accepted(), "Ingestion cancelled; draining in-flight candidates");
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    let completion = match joined {
                        Ok(Ok(c)) => c,
                        Ok(Err(e)) => {
                            tracing::error!(error = %e, "Fatal ingestion error; draining in-flight candidates");
                            fatal.get_or_insert(e);
                            continue;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Ingestion worker task failed");
                            fatal.get_or_insert(CatalogError::Transport(format!("ingestion worker failed: {e}")));
                            continue;
                        }
                    };
                    match completion.outcome {
                        CandidateOutcome::Accepted => {
                            report.accepted += 1;
                            if completion.embedding_failed {
                                report.embedding_failures += 1;
                            }
                            tracing::debug!(product_id = %completion.id, category = %completion.fairness_key, "Candidate accepted");
                            if let Some(stage) = book.commit(&completion.fairness_key) {
                                tracing::info!(
                                    stage = ?stage,
                                    accepted = book.accepted(),
                                    cap = ?book.policy().cap_for(stage),
                                    requeued = deferred.len(),
                                    "Category caps relaxed"
                                );
                                ready.extend(deferred.drain(..));
                            }
                        }
                        CandidateOutcome::Rejected(reason) => {
                            book.release(&completion.fairness_key);
                            report.record_rejection(reason);
                        }
                    }
                }

                item = feed.next(), if can_pull => {
                    match item {
                        None => exhausted = true,
                        Some(Err(e)) => {
                            report.scanned += 1;
                            report.record_rejection(RejectReason::InvalidRecord);
                            tracing::debug!(error = %e, "Unreadable feed entry");
                        }
                        Some(Ok(raw)) => {
                            report.scanned += 1;
                            match self.admit(&raw, &mut seen).await {
                                Ok(Ok(candidate)) => {
                                    if book.try_reserve(&candidate.fairness_key) {
                                        self.spawn(&mut tasks, candidate);
                                    } else if deferred.len() < self.settings.max_deferred {
                                        deferred.push_back(candidate);
                                    } else {
                                        deferred_dropped += 1;
                                    }
                                }
                                Ok(Err(reason)) => report.record_rejection(reason),
                                Err(e) => {
                                    tracing::error!(error = %e, "Fatal ingestion error; draining in-flight candidates");
                                    fatal.get_or_insert(e);
                                }
                            }
                        }
                    }
                }
            }
        }

        report.deferred = deferred.len() + ready.len() + deferred_dropped;
        report.accepted_per_category = book
            .accepted_per_category()
            .filter(|(_, n)| *n > 0)
            .map(|(k, n)| (k.to_string(), n))
            .collect::<BTreeMap<_, _>>();
        report.duration_ms = started.elapsed().as_millis() as i64;

        if report.rejected_total() > 0 {
            let by_reason = serde_json::to_string(&report.rejected).unwrap_or_else(|_| "{}".to_string());
            tracing::warn!(rejected = report.rejected_total(), by_reason = %by_reason, "Some candidates were rejected (summary)");
        }

        if let Some(e) = fatal {
            tracing::error!(run_id = %run_id, accepted = report.accepted, target, error = %e, "Ingestion run aborted");
            return Err(e);
        }

        report.status = if report.accepted >= target {
            RunStatus::Completed
        } else if cancel.is_cancelled() {
            tracing::warn!(accepted = report.accepted, target, "Ingestion run cancelled before reaching target");
            RunStatus::Cancelled
        } else {
            tracing::warn!(
                accepted = report.accepted,
                target,
                deferred = report.deferred,
                "Reached end of input before loading {} products",
                target
            );
            RunStatus::UnderFilled
        };

        tracing::info!(
            run_id = %run_id,
            accepted = report.accepted,
            target,
            scanned = report.scanned,
            rejected = report.rejected_total(),
            deferred = report.deferred,
            embedding_failures = report.embedding_failures,
            status = ?report.status,
            duration_ms = report.duration_ms,
            "Ingestion run finished"
        );
        Ok(report)
    }
}
