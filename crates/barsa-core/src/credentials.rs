//! # Remote Credentials
//!
//! Parameters needed to reach the remote document store.
//!
//! ## Field Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Credential Fields                                   │
//! │                                                                         │
//! │  REQUIRED (validation fails without them)                              │
//! │  ────────                                                              │
//! │  • api_key         access key                                          │
//! │  • project_id      project identity                                    │
//! │                                                                         │
//! │  OPTIONAL (passed through if present, stripped if empty)               │
//! │  ────────                                                              │
//! │  • endpoint             alternate endpoint                             │
//! │  • storage_bucket       storage namespace                              │
//! │  • messaging_sender_id  messaging identity                             │
//! │  • app_id               app identity                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::ValidationError;

/// Remote-access parameters.
///
/// `Debug` redacts the access key so credentials can be logged safely.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Credentials {
    /// Access key.
    #[serde(default)]
    pub api_key: String,

    /// Project identity.
    #[serde(default)]
    pub project_id: String,

    /// Alternate endpoint (e.g. `ws://10.0.0.5:8765/ws`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Storage namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_bucket: Option<String>,

    /// Messaging identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messaging_sender_id: Option<String>,

    /// App identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
}

impl Credentials {
    /// Names of the fields that must be non-empty.
    pub const REQUIRED_FIELDS: [&'static str; 2] = ["api_key", "project_id"];

    /// Creates credentials with only the required fields.
    pub fn new(api_key: impl Into<String>, project_id: impl Into<String>) -> Self {
        Credentials {
            api_key: api_key.into(),
            project_id: project_id.into(),
            ..Default::default()
        }
    }

    /// Sets the alternate endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Returns the required fields that are missing or blank.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.api_key.trim().is_empty() {
            missing.push("api_key");
        }
        if self.project_id.trim().is_empty() {
            missing.push("project_id");
        }
        missing
    }

    /// Returns true if the minimum required subset is present.
    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }

    /// Checks the required subset.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let missing = self.missing_fields();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::MissingFields {
                fields: missing.into_iter().map(String::from).collect(),
            })
        }
    }

    /// Returns a copy with every field trimmed and blank optional fields
    /// removed.
    ///
    /// ```rust
    /// use barsa_core::Credentials;
    ///
    /// let mut creds = Credentials::new(" key ", "granja");
    /// creds.storage_bucket = Some("   ".into());
    /// creds.app_id = Some("app-1".into());
    ///
    /// let clean = creds.normalized();
    /// assert_eq!(clean.api_key, "key");
    /// assert_eq!(clean.storage_bucket, None);
    /// assert_eq!(clean.app_id.as_deref(), Some("app-1"));
    /// ```
    pub fn normalized(&self) -> Self {
        fn clean(value: &Option<String>) -> Option<String> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        }

        Credentials {
            api_key: self.api_key.trim().to_string(),
            project_id: self.project_id.trim().to_string(),
            endpoint: clean(&self.endpoint),
            storage_bucket: clean(&self.storage_bucket),
            messaging_sender_id: clean(&self.messaging_sender_id),
            app_id: clean(&self.app_id),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let key = if self.api_key.is_empty() { "" } else { "***" };
        f.debug_struct("Credentials")
            .field("api_key", &key)
            .field("project_id", &self.project_id)
            .field("endpoint", &self.endpoint)
            .field("storage_bucket", &self.storage_bucket)
            .field("messaging_sender_id", &self.messaging_sender_id)
            .field("app_id", &self.app_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields() {
        assert_eq!(
            Credentials::default().missing_fields(),
            vec!["api_key", "project_id"]
        );
        assert_eq!(Credentials::new("k", " ").missing_fields(), vec!["project_id"]);
        assert!(Credentials::new("k", "p").is_complete());
    }

    #[test]
    fn test_validate_lists_fields() {
        let err = Credentials::new("", "p").validate().unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingFields {
                fields: vec!["api_key".to_string()]
            }
        );
    }

    #[test]
    fn test_debug_redacts_key() {
        let creds = Credentials::new("super-secret", "granja");
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("super-secret"));
        assert!(printed.contains("granja"));
    }

    #[test]
    fn test_empty_optionals_are_not_serialized() {
        let creds = Credentials::new("k", "p");
        let json = serde_json::to_value(&creds).unwrap();
        assert!(json.get("endpoint").is_none());
        assert_eq!(json["project_id"], "p");
    }
}
