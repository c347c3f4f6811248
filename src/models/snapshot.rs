use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::models::ProductRecord;

/// Immutable point-in-time copy of the whole catalog. Built once, never mutated;
/// the cache swaps in a new value instead of editing this one.
#[derive(Debug)]
pub struct CatalogSnapshot {
    generation: u64,
    built_at: DateTime<Utc>,
    records: Vec<ProductRecord>,
    by_id: HashMap<String, usize>,
}

impl CatalogSnapshot {
    /// Later duplicates of an id replace earlier ones so lookups stay unambiguous.
    pub fn build(generation: u64, records: Vec<ProductRecord>) -> Self {
        let mut deduped: Vec<ProductRecord> = Vec::with_capacity(records.len());
        let mut by_id: HashMap<String, usize> = HashMap::with_capacity(records.len());
        for record in records {
            match by_id.get(&record.id) {
                Some(&idx) => deduped[idx] = record,
                None => {
                    by_id.insert(record.id.clone(), deduped.len());
                    deduped.push(record);
                }
            }
        }
        Self { generation, built_at: Utc::now(), records: deduped, by_id }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ProductRecord] {
        &self.records
    }

    pub fn find_by_id(&self, id: &str) -> Option<&ProductRecord> {
        self.by_id.get(id).map(|&idx| &self.records[idx])
    }

    /// Coarse filter, not a ranking: every record whose name, description or
    /// category tags contain `keyword` (case-insensitive), in snapshot order.
    pub fn search(&self, keyword: &str) -> Vec<&ProductRecord> {
        let needle = keyword.trim().to_lowercase();
        if needle.is_empty() {
            return self.records.iter().collect();
        }
        self.records.iter().filter(|r| r.matches_keyword(&needle)).collect()
    }
}
