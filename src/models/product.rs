use serde::{Deserialize, Serialize};

use crate::models::{CatalogError, Result};

pub const NANOS_PER_UNIT: i64 = 1_000_000_000;

/// Money in a single currency, split into whole units and a nano fraction so
/// prices never accumulate floating point error once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    #[serde(alias = "currencyCode")]
    pub currency_code: String,
    pub units: i64,
    pub nanos: i32,
}

impl Money {
    pub fn new(currency_code: impl Into<String>, units: i64, nanos: i32) -> Self {
        Self { currency_code: currency_code.into(), units, nanos }
    }

    /// Converts a decimal amount into units (floored) and nanos (rounded),
    /// carrying a rounded-up fraction into the unit part.
    pub fn from_decimal(currency_code: impl Into<String>, amount: f64) -> Option<Self> {
        if !amount.is_finite() || amount < 0.0 {
            return None;
        }
        let mut units = amount.floor() as i64;
        let mut nanos = ((amount - units as f64) * NANOS_PER_UNIT as f64).round() as i64;
        if nanos >= NANOS_PER_UNIT {
            units += 1;
            nanos = 0;
        }
        Some(Self::new(currency_code, units, nanos as i32))
    }

    pub fn is_non_negative(&self) -> bool {
        self.units >= 0 && self.nanos >= 0 && (self.nanos as i64) < NANOS_PER_UNIT
    }

    pub fn as_f64(&self) -> f64 {
        self.units as f64 + self.nanos as f64 / NANOS_PER_UNIT as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, async_graphql::Enum)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
}

impl Modality {
    /// Document path of the vector column for this modality.
    pub fn vector_path(&self) -> &'static str {
        match self {
            Modality::Text => "text_embedding.vector",
            Modality::Image => "image_embedding.vector",
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Modality::Text => write!(f, "text"),
            Modality::Image => write!(f, "image"),
        }
    }
}

/// A vector together with the model that produced it. Keeping both in one
/// value means a stored vector can never lose its model id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub model_id: String,
}

impl Embedding {
    pub fn new(vector: Vec<f32>, model_id: impl Into<String>) -> Self {
        Self { vector, model_id: model_id.into() }
    }

    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// The catalog entity. `id` is the primary key and is never reused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(alias = "picture")]
    pub picture_ref: String,
    #[serde(alias = "priceUsd")]
    pub price: Money,
    pub categories: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_embedding: Option<Embedding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_embedding: Option<Embedding>,
}

impl ProductRecord {
    pub fn embedding(&self, modality: Modality) -> Option<&Embedding> {
        match modality {
            Modality::Text => self.text_embedding.as_ref(),
            Modality::Image => self.image_embedding.as_ref(),
        }
    }

    pub fn has_category(&self, category: &str) -> bool {
        let wanted = category.trim().to_lowercase();
        self.categories.iter().any(|c| *c == wanted)
    }

    /// Case-insensitive substring match over name, description and category tags.
    /// `needle` must already be lowercased.
    pub fn matches_keyword(&self, needle: &str) -> bool {
        self.name.to_lowercase().contains(needle)
            || self.description.to_lowercase().contains(needle)
            || self.categories.iter().any(|c| c.contains(needle))
    }

    /// Checks the record invariants against the deployment's vector dimension.
    pub fn validate(&self, dimension: usize) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(CatalogError::Validation("record id is empty".into()));
        }
        if self.categories.is_empty() {
            return Err(CatalogError::Validation(format!("record {} has no categories", self.id)));
        }
        if !self.price.is_non_negative() {
            return Err(CatalogError::Validation(format!("record {} has a negative price", self.id)));
        }
        for (modality, emb) in [(Modality::Text, &self.text_embedding), (Modality::Image, &self.image_embedding)] {
            if let Some(emb) = emb {
                if emb.model_id.trim().is_empty() {
                    return Err(CatalogError::Configuration(format!(
                        "record {} has a {} embedding without a model id",
                        self.id, modality
                    )));
                }
                if emb.dimension() != dimension {
                    return Err(CatalogError::Configuration(format!(
                        "record {} has a {} embedding of dimension {} (deployment uses {})",
                        self.id,
                        modality,
                        emb.dimension(),
                        dimension
                    )));
                }
            }
        }
        Ok(())
    }
}

/// KNN request against one vector column, optionally restricted to a category tag.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorQuery {
    pub vector: Vec<f32>,
    pub modality: Modality,
    pub limit: usize,
    pub category: Option<String>,
}

impl VectorQuery {
    pub fn new(vector: Vec<f32>, modality: Modality, limit: usize) -> Self {
        Self { vector, modality, limit, category: None }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into().trim().to_lowercase());
        self
    }

    pub fn check_dimension(&self, dimension: usize) -> Result<()> {
        if self.vector.len() != dimension {
            return Err(CatalogError::Configuration(format!(
                "query vector has dimension {} but the {} column is provisioned for {}",
                self.vector.len(),
                self.modality,
                dimension
            )));
        }
        Ok(())
    }
}

/// A record paired with its distance to a query; smaller is more similar.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub record: ProductRecord,
    pub distance: f32,
}

/// Lowercases, trims and deduplicates category tags, preserving first-seen order.
pub fn normalize_categories<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for c in raw {
        let c = c.as_ref().trim().to_lowercase();
        if !c.is_empty() && !out.contains(&c) {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ProductRecord {
        ProductRecord {
            id: "p1".into(),
            name: "Canvas Sneaker".into(),
            description: "Low top canvas sneaker".into(),
            picture_ref: "https://cdn.example.com/p1.jpg".into(),
            price: Money::new("USD", 12, 500_000_000),
            categories: vec!["footwear".into(), "sneakers".into()],
            metadata: Default::default(),
            text_embedding: Some(Embedding::new(vec![0.1, 0.2, 0.3], "mm@001")),
            image_embedding: None,
        }
    }

    #[test]
    fn money_splits_units_and_nanos() {
        let m = Money::from_decimal("USD", 14.765).unwrap();
        assert_eq!(m.units, 14);
        assert_eq!(m.nanos, 765_000_000);

        let carried = Money::from_decimal("USD", 2.9999999999).unwrap();
        assert_eq!(carried.units, 3);
        assert_eq!(carried.nanos, 0);

        assert!(Money::from_decimal("USD", -1.0).is_none());
        assert!(Money::from_decimal("USD", f64::NAN).is_none());
    }

    #[test]
    fn categories_are_lowercased_and_deduplicated() {
        let cats = normalize_categories(["Clothing ", "clothing", "", "T-Shirts"]);
        assert_eq!(cats, vec!["clothing".to_string(), "t-shirts".to_string()]);
    }

    #[test]
    fn validate_checks_dimension_and_model_id() {
        let rec = record();
        assert!(rec.validate(3).is_ok());
        assert!(rec.validate(4).unwrap_err().is_configuration());

        let mut missing_model = record();
        missing_model.text_embedding = Some(Embedding::new(vec![0.0; 3], ""));
        assert!(missing_model.validate(3).unwrap_err().is_configuration());

        let mut no_categories = record();
        no_categories.categories.clear();
        assert!(matches!(no_categories.validate(3), Err(CatalogError::Validation(_))));
    }

    #[test]
    fn keyword_match_covers_name_description_and_tags() {
        let rec = record();
        assert!(rec.matches_keyword("canvas"));
        assert!(rec.matches_keyword("low top"));
        assert!(rec.matches_keyword("sneakers"));
        assert!(!rec.matches_keyword("sandal"));
    }

    #[test]
    fn record_accepts_legacy_file_field_names() {
        let json = serde_json::json!({
            "id": "OLJCESPC7Z",
            "name": "Sunglasses",
            "description": "Add a modern touch to your outfits.",
            "picture": "/static/img/products/sunglasses.jpg",
            "priceUsd": { "currencyCode": "USD", "units": 19, "nanos": 990000000 },
            "categories": ["accessories"]
        });
        let rec: ProductRecord = serde_json::from_value(json).unwrap();
        assert_eq!(rec.id, "OLJCESPC7Z");
        assert_eq!(rec.price.units, 19);
        assert!(rec.text_embedding.is_none());
    }
}
