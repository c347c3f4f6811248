use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::models::*;

/// Category used for fairness when a feed entry carries none.
pub const UNCATEGORIZED: &str = "uncategorized";

/// Run-scoped parameters for turning feed entries into records.
#[derive(Debug, Clone)]
pub struct MappingSettings {
    /// Source currency units per settlement currency unit.
    pub fx_rate: f64,
    pub settlement_currency: String,
    pub media_prefix: String,
}

fn non_empty(s: &Option<String>) -> Option<&str> {
    s.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn price_value(v: &Option<Value>) -> Option<&Value> {
    v.as_ref().filter(|v| match v {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    })
}

/// Parses a feed price: numbers as-is, strings with every character other
/// than digits and '.' removed ("₹1,299.50" -> 1299.5).
pub fn parse_price(value: &Value) -> Option<f64> {
    let amount = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let cleaned: String = s.chars().filter(|c| c.is_ascii_digit() || *c == '.').collect();
            cleaned.parse::<f64>().ok()?
        }
        _ => return None,
    };
    (amount.is_finite() && amount >= 0.0).then_some(amount)
}

/// Converts a source amount into the settlement currency at a fixed rate.
pub fn normalize_price(amount: f64, fx_rate: f64, currency: &str) -> Option<Money> {
    if !(fx_rate.is_finite() && fx_rate > 0.0) {
        return None;
    }
    Money::from_decimal(currency, amount / fx_rate)
}

/// Lowercase ASCII slug of a title; runs of anything else become one '-'.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
        if slug.len() >= 60 {
            break;
        }
    }
    if slug.is_empty() {
        "product".to_string()
    } else {
        slug
    }
}

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())[..8].to_string()
}

/// `<prefix>/<slug-of-title>-<8 hex of sha256(id)>.<ext>`. The hash keeps two
/// products with the same title from overwriting each other's media.
pub fn media_key(prefix: &str, title: &str, id: &str, extension: &str) -> String {
    let file = format!("{}-{}.{}", slugify(title), short_hash(id), extension);
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        file
    } else {
        format!("{}/{}", prefix, file)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    Gif,
    Webp,
}

impl ImageKind {
    /// Identifies the format from the leading bytes; anything that is not a
    /// supported image is rejected.
    pub fn sniff(bytes: &[u8]) -> Result<Self> {
        match image::guess_format(bytes) {
            Ok(image::ImageFormat::Jpeg) => Ok(ImageKind::Jpeg),
            Ok(image::ImageFormat::Png) => Ok(ImageKind::Png),
            Ok(image::ImageFormat::Gif) => Ok(ImageKind::Gif),
            Ok(image::ImageFormat::WebP) => Ok(ImageKind::Webp),
            Ok(other) => Err(CatalogError::Validation(format!("unsupported image format: {:?}", other))),
            Err(e) => Err(CatalogError::Validation(format!("payload is not an image: {}", e))),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageKind::Jpeg => "jpg",
            ImageKind::Png => "png",
            ImageKind::Gif => "gif",
            ImageKind::Webp => "webp",
        }
    }

    pub fn content_type(&self) -> String {
        match self {
            ImageKind::Jpeg => mime::IMAGE_JPEG.to_string(),
            ImageKind::Png => mime::IMAGE_PNG.to_string(),
            ImageKind::Gif => mime::IMAGE_GIF.to_string(),
            ImageKind::Webp => format!("{}/webp", mime::IMAGE),
        }
    }
}

/// Most specific category of an entry, used as its fairness bucket.
pub fn fairness_key(raw: &RawProduct) -> String {
    non_empty(&raw.sub_category)
        .or_else(|| non_empty(&raw.category))
        .map(|c| c.to_lowercase())
        .unwrap_or_else(|| UNCATEGORIZED.to_string())
}

pub fn categories(raw: &RawProduct) -> Vec<String> {
    let cats = normalize_categories([raw.category.as_deref(), raw.sub_category.as_deref()].into_iter().flatten());
    if cats.is_empty() {
        vec![UNCATEGORIZED.to_string()]
    } else {
        cats
    }
}

fn metadata(raw: &RawProduct) -> Map<String, Value> {
    let mut meta = Map::new();
    let mut put = |key: &str, value: Option<Value>| {
        if let Some(v) = value.filter(|v| !v.is_null()) {
            meta.insert(key.to_string(), v);
        }
    };
    put("brand", non_empty(&raw.brand).map(|b| Value::String(b.to_string())));
    put("average_rating", raw.average_rating.clone());
    put("discount", raw.discount.clone());
    put("out_of_stock", raw.out_of_stock.clone());
    put("url", non_empty(&raw.url).map(|u| Value::String(u.to_string())));
    put("product_details", raw.product_details.clone());
    if !raw.images.is_empty() {
        put("original_images", Some(Value::from(raw.images.clone())));
    }
    meta
}

/// Checks required fields and maps one feed entry to a candidate record.
/// Media and embeddings are filled in later by the pipeline.
pub fn map_candidate(raw: &RawProduct, settings: &MappingSettings) -> std::result::Result<IngestionCandidate, RejectReason> {
    let id = non_empty(&raw.pid)
        .or_else(|| non_empty(&raw.source_id))
        .ok_or(RejectReason::MissingId)?
        .to_string();
    let title = non_empty(&raw.title).ok_or(RejectReason::MissingTitle)?.to_string();
    let price_raw = price_value(&raw.selling_price)
        .or_else(|| price_value(&raw.actual_price))
        .ok_or(RejectReason::MissingPrice)?;
    let source_image = raw
        .images
        .iter()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .ok_or(RejectReason::MissingImage)?
        .to_string();

    let amount = parse_price(price_raw).ok_or(RejectReason::InvalidPrice)?;
    let price = normalize_price(amount, settings.fx_rate, &settings.settlement_currency).ok_or(RejectReason::InvalidPrice)?;

    let description = match non_empty(&raw.description) {
        Some(desc) => format!("{}. {}", title, desc),
        None => title.clone(),
    };

    let record = ProductRecord {
        id,
        name: title,
        description,
        picture_ref: source_image.clone(),
        price,
        categories: categories(raw),
        metadata: metadata(raw),
        text_embedding: None,
        image_embedding: None,
    };

    Ok(IngestionCandidate { record, fairness_key: fairness_key(raw), source_image })
}
