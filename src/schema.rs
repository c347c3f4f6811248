use async_graphql::{Context, EmptyMutation, EmptySubscription, ErrorExtensions, Json, Object, Result, Schema, SimpleObject, ID};
use std::sync::Arc;

use crate::models::{CatalogError, Modality, Money, ProductRecord, ScoredRecord, VectorQuery};
use crate::query::{HybridWeights, QueryEngine};
use crate::routing::RequestDirective;

pub type CatalogSchema = Schema<Query, EmptyMutation, EmptySubscription>;

pub fn create_schema(engine: Arc<QueryEngine>) -> CatalogSchema {
    Schema::build(Query, EmptyMutation, EmptySubscription)
        .data(engine)
        .finish()
}

#[derive(SimpleObject, Clone)]
#[graphql(name = "Money")]
pub struct MoneyGraphQL {
    pub currency_code: String,
    pub units: i64,
    pub nanos: i32,
    pub amount: f64,
}

impl From<Money> for MoneyGraphQL {
    fn from(m: Money) -> Self {
        let amount = m.as_f64();
        Self { currency_code: m.currency_code, units: m.units, nanos: m.nanos, amount }
    }
}

#[derive(SimpleObject, Clone)]
#[graphql(name = "Product")]
pub struct ProductGraphQL {
    pub id: ID,
    pub name: String,
    pub description: String,
    pub picture: String,
    pub price: MoneyGraphQL,
    pub categories: Vec<String>,
    pub metadata: Json<serde_json::Value>,
    pub has_text_embedding: bool,
    pub has_image_embedding: bool,
}

impl From<ProductRecord> for ProductGraphQL {
    fn from(p: ProductRecord) -> Self {
        Self {
            id: p.id.into(),
            name: p.name,
            description: p.description,
            picture: p.picture_ref,
            price: p.price.into(),
            categories: p.categories,
            metadata: Json(serde_json::Value::Object(p.metadata)),
            has_text_embedding: p.text_embedding.is_some(),
            has_image_embedding: p.image_embedding.is_some(),
        }
    }
}

#[derive(SimpleObject, Clone)]
#[graphql(name = "ScoredProduct")]
pub struct ScoredProductGraphQL {
    pub product: ProductGraphQL,
    /// Smaller is more similar.
    pub distance: f32,
}

impl From<ScoredRecord> for ScoredProductGraphQL {
    fn from(s: ScoredRecord) -> Self {
        Self { product: s.record.into(), distance: s.distance }
    }
}

fn to_gql(e: CatalogError) -> async_graphql::Error {
    let code = match &e {
        CatalogError::NotFound(_) => "NOT_FOUND",
        CatalogError::Validation(_) => "BAD_USER_INPUT",
        CatalogError::Configuration(_) => "CONFIGURATION",
        CatalogError::Unsupported(_) => "UNSUPPORTED",
        _ => "UNAVAILABLE",
    };
    async_graphql::Error::new(e.to_string()).extend_with(|_, ext| ext.set("code", code))
}

fn limit_arg(limit: i32) -> Result<usize> {
    usize::try_from(limit).map_err(|_| to_gql(CatalogError::Validation(format!("limit must be non-negative, got {limit}"))))
}

fn directive(ctx: &Context<'_>) -> RequestDirective {
    ctx.data_opt::<RequestDirective>().copied().unwrap_or_default()
}

pub struct Query;

#[Object]
impl Query {
    async fn product(&self, ctx: &Context<'_>, id: ID) -> Result<ProductGraphQL> {
        let engine = ctx.data::<Arc<QueryEngine>>()?;
        let record = engine.by_id(id.as_str(), directive(ctx)).await.map_err(to_gql)?;
        Ok(record.into())
    }

    async fn products(&self, ctx: &Context<'_>) -> Result<Vec<ProductGraphQL>> {
        let engine = ctx.data::<Arc<QueryEngine>>()?;
        let records = engine.list_products(directive(ctx)).await.map_err(to_gql)?;
        Ok(records.into_iter().map(ProductGraphQL::from).collect())
    }

    async fn search_products(&self, ctx: &Context<'_>, query: String) -> Result<Vec<ProductGraphQL>> {
        let engine = ctx.data::<Arc<QueryEngine>>()?;
        let records = engine.by_keyword(&query, directive(ctx)).await.map_err(to_gql)?;
        Ok(records.into_iter().map(ProductGraphQL::from).collect())
    }

    async fn similar_products(
        &self,
        ctx: &Context<'_>,
        vector: Vec<f32>,
        modality: Modality,
        #[graphql(default = 10)] limit: i32,
        category: Option<String>,
    ) -> Result<Vec<ScoredProductGraphQL>> {
        let engine = ctx.data::<Arc<QueryEngine>>()?;
        let mut query = VectorQuery::new(vector, modality, limit_arg(limit)?);
        if let Some(category) = category {
            query = query.with_category(category);
        }
        let hits = engine.by_similarity(query, directive(ctx)).await.map_err(to_gql)?;
        Ok(hits.into_iter().map(ScoredProductGraphQL::from).collect())
    }

    /// Omitted weights fall back to the deployment defaults.
    async fn hybrid_products(
        &self,
        ctx: &Context<'_>,
        text_vector: Vec<f32>,
        image_vector: Vec<f32>,
        text_weight: Option<f32>,
        image_weight: Option<f32>,
        #[graphql(default = 10)] limit: i32,
    ) -> Result<Vec<ScoredProductGraphQL>> {
        let engine = ctx.data::<Arc<QueryEngine>>()?;
        let weights = match (text_weight, image_weight) {
            (None, None) => None,
            (t, i) => {
                let defaults = engine.default_weights();
                let w = HybridWeights::new(t.unwrap_or(defaults.text), i.unwrap_or(defaults.image)).map_err(to_gql)?;
                Some(w)
            }
        };
        let hits = engine
            .hybrid_similarity(text_vector, image_vector, weights, limit_arg(limit)?, directive(ctx))
            .await
            .map_err(to_gql)?;
        Ok(hits.into_iter().map(ScoredProductGraphQL::from).collect())
    }
}
