//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Remote        │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Remote(kind)   │  │  InvalidMessage         │ │
//! │  │  MissingCreds   │  │  Connection     │  │  SerializationFailed    │ │
//! │  │  InvalidUrl     │  │  Timeout        │  │  DeserializationFailed  │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────────────────────────────────┐ │
//! │  │   LocalStore    │  │  Session                                    │ │
//! │  │                 │  │                                             │ │
//! │  │  DatabaseError  │  │  NotConnected, SessionClosed, ShuttingDown  │ │
//! │  └─────────────────┘  └─────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! None of these reach domain collaborators: the sync core logs them and
//! keeps running in local-only mode.

use barsa_core::ValidationError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ts_rs::TS;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

// =============================================================================
// Connection Failure Classification
// =============================================================================

/// Why a remote connection attempt failed.
///
/// Exposed so callers can branch on the kind rather than parse text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum ConnectionFailureKind {
    /// Required credential fields are missing. No network call was made.
    MissingFields,
    /// The remote refused the access key or the write.
    PermissionDenied,
    /// The project exists in the credentials but has no store behind it.
    NotProvisioned,
    /// The remote could not be reached.
    NetworkUnavailable,
    /// The credentials are present but unusable (bad key format, bad
    /// endpoint).
    MalformedCredentials,
    /// Anything else.
    Unknown,
}

impl ConnectionFailureKind {
    /// Human diagnostic for this kind, in the app's language.
    pub fn diagnostic(&self) -> &'static str {
        match self {
            ConnectionFailureKind::MissingFields => {
                "Faltan campos obligatorios de la configuración remota."
            }
            ConnectionFailureKind::PermissionDenied => {
                "Permiso denegado: revise la clave de acceso y las reglas de la base de datos."
            }
            ConnectionFailureKind::NotProvisioned => {
                "La base de datos remota no existe para este proyecto: créela antes de conectar."
            }
            ConnectionFailureKind::NetworkUnavailable => {
                "No se pudo contactar el servidor remoto: revise la conexión a internet."
            }
            ConnectionFailureKind::MalformedCredentials => {
                "Credenciales inválidas: revise la clave de acceso y el identificador del proyecto."
            }
            ConnectionFailureKind::Unknown => "Error desconocido al conectar con el servidor remoto.",
        }
    }

    /// Returns true if waiting and trying again could help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectionFailureKind::NetworkUnavailable | ConnectionFailureKind::Unknown
        )
    }
}

impl std::fmt::Display for ConnectionFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionFailureKind::MissingFields => "missing-fields",
            ConnectionFailureKind::PermissionDenied => "permission-denied",
            ConnectionFailureKind::NotProvisioned => "not-provisioned",
            ConnectionFailureKind::NetworkUnavailable => "network-unavailable",
            ConnectionFailureKind::MalformedCredentials => "malformed-credentials",
            ConnectionFailureKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A classified failure reported by a remote store implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: ConnectionFailureKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ConnectionFailureKind, message: impl Into<String>) -> Self {
        RemoteError {
            kind,
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ConnectionFailureKind::PermissionDenied, message)
    }

    pub fn not_provisioned(message: impl Into<String>) -> Self {
        Self::new(ConnectionFailureKind::NotProvisioned, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ConnectionFailureKind::NetworkUnavailable, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ConnectionFailureKind::MalformedCredentials, message)
    }
}

// =============================================================================
// Sync Error
// =============================================================================

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Credentials are missing required fields.
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(#[from] ValidationError),

    /// Invalid remote endpoint URL.
    #[error("Invalid endpoint URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Remote / Transport Errors
    // =========================================================================
    /// The remote reported a classified failure.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Failed to establish a connection.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection dropped.
    #[error("Disconnected from remote store")]
    Disconnected,

    /// Operation timed out.
    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    /// TLS/SSL error.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Invalid message received.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Failed to serialize message.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Failed to deserialize message.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    // =========================================================================
    // LocalStore Errors
    // =========================================================================
    /// LocalStore operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    // =========================================================================
    // Session Errors
    // =========================================================================
    /// No session is active.
    #[error("No active sync session")]
    NotConnected,

    /// The session was terminated while an operation was in flight.
    #[error("Sync session closed")]
    SessionClosed,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Manager is shutting down.
    #[error("Sync manager is shutting down")]
    ShuttingDown,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<barsa_db::DbError> for SyncError {
    fn from(err: barsa_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<barsa_core::CoreError> for SyncError {
    fn from(err: barsa_core::CoreError) -> Self {
        match err {
            barsa_core::CoreError::Validation(v) => SyncError::InvalidCredentials(v),
            other => SyncError::InvalidMessage(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed => SyncError::Disconnected,
            WsError::AlreadyClosed => SyncError::Disconnected,
            WsError::Protocol(p) => SyncError::WebSocketError(p.to_string()),
            WsError::Io(io) => SyncError::ConnectionFailed(io.to_string()),
            WsError::Tls(tls) => SyncError::TlsError(tls.to_string()),
            WsError::Url(url) => SyncError::InvalidUrl(url.to_string()),
            other => SyncError::WebSocketError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if this error is recoverable and the operation can be retried.
    ///
    /// ## Retryable Errors
    /// - Connection failures and timeouts
    /// - Transient remote failures
    ///
    /// ## Non-Retryable Errors
    /// - Configuration and credential errors
    /// - Permission and provisioning failures
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.kind.is_transient(),
            SyncError::ConnectionFailed(_)
            | SyncError::Disconnected
            | SyncError::Timeout(_)
            | SyncError::WebSocketError(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidCredentials(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if this error indicates a protocol mismatch.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidMessage(_)
                | SyncError::SerializationFailed(_)
                | SyncError::DeserializationFailed(_)
        )
    }

    /// Classifies the error for connection diagnostics.
    ///
    /// ```text
    /// Remote(kind)                          → kind
    /// InvalidCredentials                    → MissingFields
    /// InvalidUrl / InvalidConfig / TlsError → MalformedCredentials
    /// ConnectionFailed / Disconnected /
    ///   Timeout / WebSocketError            → NetworkUnavailable
    /// anything else                         → Unknown
    /// ```
    pub fn failure_kind(&self) -> ConnectionFailureKind {
        match self {
            SyncError::Remote(e) => e.kind,
            SyncError::InvalidCredentials(_) => ConnectionFailureKind::MissingFields,
            SyncError::InvalidUrl(_) | SyncError::InvalidConfig(_) | SyncError::TlsError(_) => {
                ConnectionFailureKind::MalformedCredentials
            }
            SyncError::ConnectionFailed(_)
            | SyncError::Disconnected
            | SyncError::Timeout(_)
            | SyncError::WebSocketError(_) => ConnectionFailureKind::NetworkUnavailable,
            _ => ConnectionFailureKind::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::ConnectionFailed("network error".into()).is_retryable());
        assert!(SyncError::Disconnected.is_retryable());
        assert!(SyncError::Timeout(10).is_retryable());
        assert!(SyncError::Remote(RemoteError::network("offline")).is_retryable());

        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
        assert!(!SyncError::Remote(RemoteError::permission_denied("no")).is_retryable());
        assert!(!SyncError::NotConnected.is_retryable());
    }

    #[test]
    fn test_failure_kind_mapping() {
        assert_eq!(
            SyncError::Timeout(10).failure_kind(),
            ConnectionFailureKind::NetworkUnavailable
        );
        assert_eq!(
            SyncError::InvalidUrl("x".into()).failure_kind(),
            ConnectionFailureKind::MalformedCredentials
        );
        assert_eq!(
            SyncError::InvalidConfig("WebSocket sessions need an endpoint".into()).failure_kind(),
            ConnectionFailureKind::MalformedCredentials
        );
        assert_eq!(
            SyncError::Remote(RemoteError::not_provisioned("none")).failure_kind(),
            ConnectionFailureKind::NotProvisioned
        );
        assert_eq!(
            SyncError::Internal("?".into()).failure_kind(),
            ConnectionFailureKind::Unknown
        );
    }

    #[test]
    fn test_every_kind_has_distinct_diagnostic() {
        let kinds = [
            ConnectionFailureKind::MissingFields,
            ConnectionFailureKind::PermissionDenied,
            ConnectionFailureKind::NotProvisioned,
            ConnectionFailureKind::NetworkUnavailable,
            ConnectionFailureKind::MalformedCredentials,
            ConnectionFailureKind::Unknown,
        ];
        let diagnostics: std::collections::HashSet<_> =
            kinds.iter().map(|k| k.diagnostic()).collect();
        assert_eq!(diagnostics.len(), kinds.len());
    }

    #[test]
    fn test_config_errors() {
        let err: SyncError = ValidationError::MissingFields {
            fields: vec!["api_key".into()],
        }
        .into();
        assert!(err.is_config_error());
        assert_eq!(err.failure_kind(), ConnectionFailureKind::MissingFields);
    }
}
