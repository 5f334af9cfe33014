//! # Error Types
//!
//! Domain-specific error types for barsa-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  barsa-core errors (this file)                                         │
//! │  ├── CoreError        - Record / collection shape errors               │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  barsa-db errors (separate crate)                                      │
//! │  └── DbError          - LocalStore failures                            │
//! │                                                                         │
//! │  barsa-sync errors (separate crate)                                    │
//! │  └── SyncError        - Session, remote and config failures            │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → DbError → SyncError               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised while building or converting records.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Collection name is not one of the known collections.
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    /// A value could not be turned into a [`Record`](crate::Record).
    ///
    /// ## When This Occurs
    /// - The value is not a JSON object
    /// - The object has no `id`, or `id` is not a non-empty string
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Typed (de)serialization of a record failed.
    #[error("Record serialization failed: {0}")]
    Serialization(String),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Several required fields are missing at once.
    #[error("missing required fields: {}", fields.join(", "))]
    MissingFields { fields: Vec<String> },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format.
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Field cannot be changed once set (the record `id`).
    #[error("{field} cannot be modified")]
    Immutable { field: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_message() {
        let err = ValidationError::MissingFields {
            fields: vec!["api_key".to_string(), "project_id".to_string()],
        };
        assert_eq!(err.to_string(), "missing required fields: api_key, project_id");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let err: CoreError = ValidationError::Required {
            field: "id".to_string(),
        }
        .into();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
