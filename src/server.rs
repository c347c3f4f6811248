use async_graphql::http::{playground_source, GraphQLPlaygroundConfig};
use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::{
    extract::State,
    http::{HeaderMap, Method},
    response::{Html, IntoResponse},
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::routing::RequestDirective;
use crate::schema::CatalogSchema;

/// Request header asking for a record store read (`use-database: true`).
pub const USE_DATABASE_HEADER: &str = "use-database";

#[derive(Clone)]
pub struct AppState {
    pub schema: CatalogSchema,
}

pub fn directive_from_headers(headers: &HeaderMap) -> RequestDirective {
    let use_database = headers
        .get(USE_DATABASE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    RequestDirective { use_database }
}

async fn graphql_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: GraphQLRequest,
) -> GraphQLResponse {
    let request = req.into_inner().data(directive_from_headers(&headers));
    state.schema.execute(request).await.into()
}

async fn graphql_playground() -> impl IntoResponse {
    Html(playground_source(GraphQLPlaygroundConfig::new("/graphql")))
}

async fn health() -> impl IntoResponse {
    "OK"
}

pub fn build_router(schema: CatalogSchema) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .allow_origin(Any);

    Router::new()
        .route("/graphql", get(graphql_playground).post(graphql_handler))
        .route("/health", get(health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { schema })
}
