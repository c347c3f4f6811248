use std::cmp::Ordering;

use crate::models::{CatalogError, Modality, ProductRecord, Result, ScoredRecord, VectorQuery};

/// Relative weight of each modality's distance in a hybrid score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HybridWeights {
    pub text: f32,
    pub image: f32,
}

impl HybridWeights {
    pub fn new(text: f32, image: f32) -> Result<Self> {
        if !(text.is_finite() && image.is_finite()) || text < 0.0 || image < 0.0 {
            return Err(CatalogError::Configuration(format!(
                "hybrid weights must be finite and non-negative (text={text}, image={image})"
            )));
        }
        Ok(Self { text, image })
    }

    pub fn score(&self, text_distance: f32, image_distance: f32) -> f32 {
        self.text * text_distance + self.image * image_distance
    }
}

/// Cosine distance `1 - cos(a, b)` in [0, 2]. A zero vector is equally far
/// from everything and gets distance 1.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    let cos = (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0);
    (1.0 - cos) as f32
}

/// Ascending distance, ties broken by id.
pub fn rank_order(a: &ScoredRecord, b: &ScoredRecord) -> Ordering {
    a.distance.total_cmp(&b.distance).then_with(|| a.record.id.cmp(&b.record.id))
}

fn stored_vector<'a>(record: &'a ProductRecord, modality: Modality, dimension: usize) -> Result<Option<&'a [f32]>> {
    match record.embedding(modality) {
        None => Ok(None),
        Some(emb) if emb.dimension() != dimension => Err(CatalogError::Configuration(format!(
            "record {} stores a {} vector of dimension {} (expected {})",
            record.id,
            modality,
            emb.dimension(),
            dimension
        ))),
        Some(emb) => Ok(Some(emb.vector.as_slice())),
    }
}

/// Exact KNN by linear scan. Records without a vector for the queried
/// modality are skipped; cost is O(records x dimension) per query.
pub fn brute_force_knn<'a, I>(records: I, query: &VectorQuery) -> Result<Vec<ScoredRecord>>
where
    I: IntoIterator<Item = &'a ProductRecord>,
{
    let dimension = query.vector.len();
    let mut scored = Vec::new();
    for record in records {
        if let Some(category) = &query.category {
            if !record.has_category(category) {
                continue;
            }
        }
        if let Some(stored) = stored_vector(record, query.modality, dimension)? {
            scored.push(ScoredRecord {
                distance: cosine_distance(&query.vector, stored),
                record: record.clone(),
            });
        }
    }
    scored.sort_by(rank_order);
    scored.truncate(query.limit);
    Ok(scored)
}

/// Scores every candidate by the weighted sum of its text and image distances.
/// Candidates missing either vector cannot be scored and are left out.
pub fn rank_hybrid<'a, I>(
    candidates: I,
    text_vector: &[f32],
    image_vector: &[f32],
    weights: HybridWeights,
    limit: usize,
) -> Result<Vec<ScoredRecord>>
where
    I: IntoIterator<Item = &'a ProductRecord>,
{
    let mut scored = Vec::new();
    for record in candidates {
        let text = stored_vector(record, Modality::Text, text_vector.len())?;
        let image = stored_vector(record, Modality::Image, image_vector.len())?;
        if let (Some(text), Some(image)) = (text, image) {
            let distance = weights.score(cosine_distance(text_vector, text), cosine_distance(image_vector, image));
            scored.push(ScoredRecord { record: record.clone(), distance });
        }
    }
    scored.sort_by(rank_order);
    scored.truncate(limit);
    Ok(scored)
}
