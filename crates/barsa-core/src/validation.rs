//! # Validation Module
//!
//! Input checks applied before anything reaches the LocalStore or the
//! remote.
//!
//! ## Usage
//! ```rust
//! use barsa_core::validation::validate_record_id;
//!
//! assert!(validate_record_id("order-17").is_ok());
//! assert!(validate_record_id("").is_err());
//! ```

use crate::credentials::Credentials;
use crate::error::ValidationError;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Longest accepted record id.
pub const MAX_RECORD_ID_LEN: usize = 128;

/// Validates a record id.
///
/// ## Rules
/// - Must not be empty or whitespace
/// - At most [`MAX_RECORD_ID_LEN`] characters
/// - Must not contain `/`, which the remote uses as a path separator
pub fn validate_record_id(id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "id".to_string(),
        });
    }

    if id.chars().count() > MAX_RECORD_ID_LEN {
        return Err(ValidationError::TooLong {
            field: "id".to_string(),
            max: MAX_RECORD_ID_LEN,
        });
    }

    if id.contains('/') {
        return Err(ValidationError::InvalidFormat {
            field: "id".to_string(),
            reason: "must not contain '/'".to_string(),
        });
    }

    Ok(())
}

/// Validates remote credentials without touching the network.
///
/// Checks the required subset first, then the endpoint's shape if one is
/// given.
pub fn validate_credentials(credentials: &Credentials) -> ValidationResult<()> {
    credentials.validate()?;

    if let Some(endpoint) = credentials.endpoint.as_deref() {
        let endpoint = endpoint.trim();
        let has_scheme = ["ws://", "wss://", "memory://"]
            .iter()
            .any(|scheme| endpoint.starts_with(scheme));
        if !endpoint.is_empty() && !has_scheme {
            return Err(ValidationError::InvalidFormat {
                field: "endpoint".to_string(),
                reason: "expected ws://, wss:// or memory://".to_string(),
            });
        }
    }

    Ok(())
}
