pub mod cache;
pub mod clients;
pub mod config;
pub mod handlers;
pub mod ingestion;
pub mod mapping;
pub mod models;
pub mod query;
pub mod routing;
pub mod schema;
pub mod server;
pub mod storage;

// Convenient re-exports for tests and external callers
pub use cache::*;
pub use clients::*;
pub use config::*;
pub use handlers::*;
pub use ingestion::*;
pub use models::*;
pub use query::*;
pub use routing::*;
pub use storage::*;
