//! Shared error types for the Chronicle pipeline.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or encoding records.
#[derive(Error, Debug)]
pub enum Error {
    /// A record field failed validation (e.g., a zero tenant id).
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// Display-name encryption or decryption failed.
    #[error("privacy error: {0}")]
    Privacy(String),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_field_display() {
        let err = Error::InvalidField {
            field: "tenant_id",
            reason: "must be non-zero".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("tenant_id"));
        assert!(msg.contains("must be non-zero"));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not valid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
