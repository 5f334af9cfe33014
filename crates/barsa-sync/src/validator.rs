//! # Connection Validator
//!
//! Answers "do these credentials work?" without touching the primary
//! session.
//!
//! ```text
//!   validate(credentials)
//!        │
//!        ├─ required fields missing? ─────────────► invalid, MissingFields
//!        │                                          (no network call)
//!        ├─ endpoint malformed? ─────────────────► invalid, MalformedCredentials
//!        │
//!        ▼
//!   open("validator-<uuid>")  ── throwaway session
//!        │
//!        ▼
//!   set_merge("_diagnostics", { id: "connection-test", checkedAt })
//!        │
//!        ▼
//!   terminate()   ◄── runs on every path once a session exists
//! ```

use std::sync::Arc;
use std::time::Duration;

use barsa_core::validation::validate_credentials;
use barsa_core::{Credentials, Record, ValidationError, DIAGNOSTICS_COLLECTION, DIAGNOSTICS_DOCUMENT_ID};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use ts_rs::TS;
use uuid::Uuid;

use crate::error::{ConnectionFailureKind, SyncError, SyncResult};
use crate::remote::{RemoteConnector, RemoteSession};

/// Result of a credential check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ValidationOutcome {
    pub valid: bool,

    /// Failure classification. `None` when valid.
    pub kind: Option<ConnectionFailureKind>,

    /// Human diagnostic for `kind`.
    pub diagnostic: Option<String>,

    /// Underlying error text, for logs and support.
    pub detail: Option<String>,
}

impl ValidationOutcome {
    pub fn ok() -> Self {
        ValidationOutcome {
            valid: true,
            kind: None,
            diagnostic: None,
            detail: None,
        }
    }

    pub fn failed(kind: ConnectionFailureKind, detail: impl Into<String>) -> Self {
        ValidationOutcome {
            valid: false,
            kind: Some(kind),
            diagnostic: Some(kind.diagnostic().to_string()),
            detail: Some(detail.into()),
        }
    }

    fn from_error(err: &SyncError) -> Self {
        Self::failed(err.failure_kind(), err.to_string())
    }
}

/// Checks credentials with a single probe write on an isolated session.
pub struct ConnectionValidator {
    connector: Arc<dyn RemoteConnector>,
    timeout: Duration,
}

impl ConnectionValidator {
    pub fn new(connector: Arc<dyn RemoteConnector>, timeout: Duration) -> Self {
        ConnectionValidator { connector, timeout }
    }

    /// Validates `credentials`.
    pub async fn validate(&self, credentials: &Credentials) -> ValidationOutcome {
        let credentials = credentials.normalized();

        if let Err(e) = validate_credentials(&credentials) {
            debug!(error = %e, "Credentials rejected before connecting");
            return Self::precheck_failure(&e);
        }

        let session_name = format!("validator-{}", Uuid::new_v4());
        let session = match self.bounded(self.connector.open(&credentials, &session_name)).await {
            Ok(session) => session,
            Err(e) => {
                info!(session = %session_name, error = %e, "Validation session could not be opened");
                return ValidationOutcome::from_error(&e);
            }
        };

        let probe = self.probe(session.as_ref()).await;

        if let Err(e) = session.terminate().await {
            warn!(session = %session_name, ?e, "Failed to terminate validation session");
        }

        match probe {
            Ok(()) => {
                info!(project = %credentials.project_id, "Credentials validated");
                ValidationOutcome::ok()
            }
            Err(e) => {
                info!(project = %credentials.project_id, kind = %e.failure_kind(), error = %e, "Credential probe failed");
                ValidationOutcome::from_error(&e)
            }
        }
    }

    async fn probe(&self, session: &dyn RemoteSession) -> SyncResult<()> {
        let record = Record::from_value(json!({
            "id": DIAGNOSTICS_DOCUMENT_ID,
            "checkedAt": Utc::now().to_rfc3339(),
        }))?;
        self.bounded(session.set_merge(DIAGNOSTICS_COLLECTION, &record))
            .await
    }

    /// Runs `fut` under the validator's timeout. Expiry counts as the
    /// network being unavailable.
    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = SyncResult<T>>,
    ) -> SyncResult<T> {
        match timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.timeout.as_secs())),
        }
    }

    fn precheck_failure(err: &ValidationError) -> ValidationOutcome {
        let kind = match err {
            ValidationError::Required { .. } | ValidationError::MissingFields { .. } => {
                ConnectionFailureKind::MissingFields
            }
            _ => ConnectionFailureKind::MalformedCredentials,
        };
        ValidationOutcome::failed(kind, err.to_string())
    }
}
