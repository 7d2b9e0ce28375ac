//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Errors that can occur in the ingestion pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Persistent store (Postgres/TimescaleDB) error.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Durable journal (SQLite) error.
    #[error("journal error: {0}")]
    Journal(#[from] rusqlite::Error),

    /// Record validation or privacy error.
    #[error("core error: {0}")]
    Core(#[from] chronicle_core::Error),

    /// JSON serialization error (journal payloads).
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// The pipeline is shutting down and no longer accepts work.
    #[error("shutting down")]
    ShuttingDown,
}

/// Result type alias for ingestion operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let err = Error::Config("DATABASE_URL is not set".to_string());
        assert_eq!(err.to_string(), "config error: DATABASE_URL is not set");
    }

    #[test]
    fn test_core_error_conversion() {
        let core = chronicle_core::Error::InvalidField {
            field: "tenant_id",
            reason: "must be a positive id, got 0".to_string(),
        };
        let err: Error = core.into();
        assert!(err.to_string().contains("tenant_id"));
    }
}
