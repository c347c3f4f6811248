use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use crate::models::ProductRecord;

/// One entry of the external bulk feed, as loosely typed as the feed itself.
/// Price fields may be numbers or display strings such as "1,299".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawProduct {
    pub pid: Option<String>,
    #[serde(rename = "_id")]
    pub source_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub selling_price: Option<serde_json::Value>,
    pub actual_price: Option<serde_json::Value>,
    #[serde(deserialize_with = "image_list")]
    pub images: Vec<String>,
    pub category: Option<String>,
    pub sub_category: Option<String>,
    pub brand: Option<String>,
    pub average_rating: Option<serde_json::Value>,
    pub discount: Option<serde_json::Value>,
    pub out_of_stock: Option<serde_json::Value>,
    pub url: Option<String>,
    pub product_details: Option<serde_json::Value>,
}

/// Only a list counts as images; `null`, a bare string or any other shape
/// means the entry has none. Non-string list items are skipped.
fn image_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                serde_json::Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MissingId,
    MissingTitle,
    MissingPrice,
    MissingImage,
    InvalidPrice,
    Duplicate,
    MediaFailed,
    EmbeddingFailed,
    UpsertFailed,
    StoreUnavailable,
    InvalidRecord,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::MissingId => "missing_id",
            RejectReason::MissingTitle => "missing_title",
            RejectReason::MissingPrice => "missing_price",
            RejectReason::MissingImage => "missing_image",
            RejectReason::InvalidPrice => "invalid_price",
            RejectReason::Duplicate => "duplicate",
            RejectReason::MediaFailed => "media_failed",
            RejectReason::EmbeddingFailed => "embedding_failed",
            RejectReason::UpsertFailed => "upsert_failed",
            RejectReason::StoreUnavailable => "store_unavailable",
            RejectReason::InvalidRecord => "invalid_record",
        };
        f.write_str(s)
    }
}

/// A mapped feed entry on its way through one run. `record.picture_ref` still
/// points at the source image until media upload replaces it.
#[derive(Debug, Clone)]
pub struct IngestionCandidate {
    pub record: ProductRecord,
    pub fairness_key: String,
    pub source_image: String,
}

impl IngestionCandidate {
    pub fn id(&self) -> &str {
        &self.record.id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CandidateOutcome {
    Accepted,
    Rejected(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    UnderFilled,
    Cancelled,
}

/// Summary of a single ingestion run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionReport {
    pub target: usize,
    pub accepted: usize,
    pub scanned: usize,
    pub rejected: BTreeMap<RejectReason, usize>,
    pub deferred: usize,
    pub embedding_failures: usize,
    pub accepted_per_category: BTreeMap<String, usize>,
    pub status: RunStatus,
    pub duration_ms: i64,
}

impl IngestionReport {
    pub fn new(target: usize) -> Self {
        Self {
            target,
            accepted: 0,
            scanned: 0,
            rejected: BTreeMap::new(),
            deferred: 0,
            embedding_failures: 0,
            accepted_per_category: BTreeMap::new(),
            status: RunStatus::Completed,
            duration_ms: 0,
        }
    }

    pub fn record_rejection(&mut self, reason: RejectReason) {
        *self.rejected.entry(reason).or_insert(0) += 1;
    }

    pub fn rejected_total(&self) -> usize {
        self.rejected.values().sum()
    }

    pub fn rejected_for(&self, reason: RejectReason) -> usize {
        self.rejected.get(&reason).copied().unwrap_or(0)
    }

    pub fn is_under_filled(&self) -> bool {
        self.accepted < self.target
    }
}
