pub mod product;
pub mod snapshot;
pub mod ingestion;

pub use product::*;
pub use snapshot::*;
pub use ingestion::*;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("BSON encode error: {0}")]
    BsonEncode(#[from] bson::ser::Error),

    #[error("BSON decode error: {0}")]
    BsonDecode(#[from] bson::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CatalogError {
    /// Infrastructure faults: the serving path degrades to the snapshot cache,
    /// the ingestion path retries with backoff.
    pub fn is_transport(&self) -> bool {
        match self {
            CatalogError::Transport(_) | CatalogError::Timeout(_) | CatalogError::Http(_) => true,
            CatalogError::Database(e) => is_transient_mongo_error(e),
            _ => false,
        }
    }

    /// A command the server rejected outright, e.g. a `$vectorSearch` whose
    /// index was built with another dimension.
    pub fn is_rejected_command(&self) -> bool {
        match self {
            CatalogError::Database(e) => {
                matches!(*e.kind, mongodb::error::ErrorKind::Command(_)) && !is_transient_mongo_error(e)
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CatalogError::NotFound(_))
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, CatalogError::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;

/// Server error codes the driver itself treats as retryable reads/writes
/// (network, failover and shutdown conditions).
const TRANSIENT_COMMAND_CODES: [i32; 13] = [6, 7, 89, 91, 134, 189, 262, 9001, 10107, 11600, 11602, 13435, 13436];

fn is_transient_mongo_error(e: &mongodb::error::Error) -> bool {
    use mongodb::error::{ErrorKind, RETRYABLE_WRITE_ERROR, TRANSIENT_TRANSACTION_ERROR};

    if e.contains_label(RETRYABLE_WRITE_ERROR) || e.contains_label(TRANSIENT_TRANSACTION_ERROR) {
        return true;
    }
    match &*e.kind {
        ErrorKind::Command(cmd) => TRANSIENT_COMMAND_CODES.contains(&cmd.code),
        ErrorKind::BsonDeserialization(_) | ErrorKind::BsonSerialization(_) | ErrorKind::InvalidArgument { .. } => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transport_failures() {
        assert!(CatalogError::Transport("connection refused".into()).is_transport());
        assert!(CatalogError::Timeout(2000).is_transport());
        assert!(!CatalogError::NotFound("p1".into()).is_transport());
        assert!(!CatalogError::Configuration("dimension".into()).is_transport());
        assert!(!CatalogError::Validation("title".into()).is_transport());
    }

    fn command_error(code: i32, code_name: &str, message: &str) -> CatalogError {
        let cmd: mongodb::error::CommandError =
            bson::from_document(bson::doc! { "code": code, "codeName": code_name, "errmsg": message }).unwrap();
        CatalogError::from(mongodb::error::Error::from(mongodb::error::ErrorKind::Command(cmd)))
    }

    #[test]
    fn rejected_commands_are_not_transport() {
        let err = command_error(2, "BadValue", "vector field is indexed with 768 dimensions but queried with 1408");
        assert!(!err.is_transport());
        assert!(err.is_rejected_command());

        let err = command_error(91, "ShutdownInProgress", "shutting down");
        assert!(err.is_transport());
        assert!(!err.is_rejected_command());

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = CatalogError::from(mongodb::error::Error::from(io));
        assert!(err.is_transport());
        assert!(!err.is_rejected_command());
    }
}
