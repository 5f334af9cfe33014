//! # Remote Protocol Messages
//!
//! Messages exchanged between [`WsConnector`](crate::remote::WsConnector)
//! sessions and a [`DocumentHub`](crate::hub::DocumentHub).
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Remote Protocol Messages                           │
//! │                                                                         │
//! │  HANDSHAKE                                                             │
//! │  ─────────                                                             │
//! │  CLIENT ───► Hello { session_name, project_id, api_key, version }      │
//! │  HUB    ◄─── Welcome { session_id, server_time }                       │
//! │           or Error { kind, message }   (then close)                    │
//! │                                                                         │
//! │  REQUESTS (each answered by Ack or Error with the same request_id)     │
//! │  ──────────────────────────────────────────────────────────────────    │
//! │  CLIENT ───► EnableOfflineCache { request_id }                         │
//! │  CLIENT ───► SetMerge { request_id, collection, record }               │
//! │  CLIENT ───► Delete { request_id, collection, id }                     │
//! │  CLIENT ───► Subscribe { request_id, collection }                      │
//! │  HUB    ◄─── Ack { request_id }                                        │
//! │  HUB    ◄─── Error { request_id, kind, message }                       │
//! │                                                                         │
//! │  CHANGE FEED                                                           │
//! │  ───────────                                                           │
//! │  HUB    ───► Changes { subscription_id, batch }  (id = Subscribe's     │
//! │                                                   request_id)          │
//! │  CLIENT ───► Unsubscribe { subscription_id }                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Adjacently tagged JSON:
//! ```json
//! { "type": "Delete", "payload": { "requestId": 7, "collection": "orders", "id": "o-1" } }
//! ```

use barsa_core::{ChangeBatch, Collection, Credentials, Record};
use serde::{Deserialize, Serialize};

use crate::error::{ConnectionFailureKind, RemoteError};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

// =============================================================================
// Main Message Enum (Tagged Union)
// =============================================================================

/// All remote protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SyncMessage {
    // =========================================================================
    // Handshake Messages
    // =========================================================================
    /// First message on a connection, from the client.
    Hello(HelloPayload),

    /// Hub's reply to an accepted Hello.
    Welcome(WelcomePayload),

    // =========================================================================
    // Requests
    // =========================================================================
    #[serde(rename_all = "camelCase")]
    EnableOfflineCache { request_id: u64 },

    #[serde(rename_all = "camelCase")]
    SetMerge {
        request_id: u64,
        collection: String,
        record: Record,
    },

    #[serde(rename_all = "camelCase")]
    Delete {
        request_id: u64,
        collection: String,
        id: String,
    },

    #[serde(rename_all = "camelCase")]
    Subscribe {
        request_id: u64,
        collection: Collection,
    },

    #[serde(rename_all = "camelCase")]
    Unsubscribe { subscription_id: u64 },

    // =========================================================================
    // Responses
    // =========================================================================
    /// A change-feed notification.
    #[serde(rename_all = "camelCase")]
    Changes {
        subscription_id: u64,
        batch: ChangeBatch,
    },

    /// A request succeeded.
    #[serde(rename_all = "camelCase")]
    Ack { request_id: u64 },

    /// A request (or, without a request id, the connection) failed.
    #[serde(rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        kind: ConnectionFailureKind,
        message: String,
    },
}

// =============================================================================
// Handshake Payloads
// =============================================================================

/// Hello message sent by the client on connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    /// Session name, e.g. `primary` or `validator-<uuid>`.
    pub session_name: String,

    pub project_id: String,

    pub api_key: String,

    pub protocol_version: u32,
}

impl HelloPayload {
    pub fn new(credentials: &Credentials, session_name: &str) -> Self {
        HelloPayload {
            session_name: session_name.to_string(),
            project_id: credentials.project_id.clone(),
            api_key: credentials.api_key.clone(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Credentials the hub opens its backing session with.
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.api_key.clone(), self.project_id.clone())
    }
}

/// Welcome message sent by the hub after a successful handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomePayload {
    /// Hub-assigned connection id.
    pub session_id: u64,

    /// Hub time (RFC 3339).
    pub server_time: String,
}

// =============================================================================
// Message Helpers
// =============================================================================

impl SyncMessage {
    /// Returns the message type name as a string (for logging).
    pub fn type_name(&self) -> &'static str {
        match self {
            SyncMessage::Hello(_) => "Hello",
            SyncMessage::Welcome(_) => "Welcome",
            SyncMessage::EnableOfflineCache { .. } => "EnableOfflineCache",
            SyncMessage::SetMerge { .. } => "SetMerge",
            SyncMessage::Delete { .. } => "Delete",
            SyncMessage::Subscribe { .. } => "Subscribe",
            SyncMessage::Unsubscribe { .. } => "Unsubscribe",
            SyncMessage::Changes { .. } => "Changes",
            SyncMessage::Ack { .. } => "Ack",
            SyncMessage::Error { .. } => "Error",
        }
    }

    /// Returns the request id of a request or response, if it has one.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            SyncMessage::EnableOfflineCache { request_id }
            | SyncMessage::SetMerge { request_id, .. }
            | SyncMessage::Delete { request_id, .. }
            | SyncMessage::Subscribe { request_id, .. }
            | SyncMessage::Ack { request_id } => Some(*request_id),
            SyncMessage::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }

    /// Creates an Error message from a classified failure.
    pub fn error(request_id: Option<u64>, err: &RemoteError) -> Self {
        SyncMessage::Error {
            request_id,
            kind: err.kind,
            message: err.message.clone(),
        }
    }

    /// Serializes to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserializes from JSON string.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_serialization() {
        let hello = SyncMessage::Hello(HelloPayload::new(
            &Credentials::new("key-1", "barsa-test"),
            "primary",
        ));
        let json = hello.to_json().unwrap();
        assert!(json.contains("\"type\":\"Hello\""));
        assert!(json.contains("\"sessionName\":\"primary\""));

        match SyncMessage::from_json(&json).unwrap() {
            SyncMessage::Hello(payload) => {
                assert_eq!(payload.project_id, "barsa-test");
                assert_eq!(payload.protocol_version, PROTOCOL_VERSION);
            }
            other => panic!("Expected Hello, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_set_merge_wire_shape() {
        let msg = SyncMessage::SetMerge {
            request_id: 7,
            collection: "orders".into(),
            record: Record::from_value(json!({"id": "o-1", "client": "Ana"})).unwrap(),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "SetMerge");
        assert_eq!(value["payload"]["requestId"], 7);
        assert_eq!(value["payload"]["record"]["client"], "Ana");
        assert_eq!(msg.request_id(), Some(7));
    }

    #[test]
    fn test_error_carries_kind() {
        let msg = SyncMessage::error(Some(3), &RemoteError::permission_denied("no"));
        let json = msg.to_json().unwrap();
        assert!(json.contains("permission_denied"));
        assert_eq!(SyncMessage::from_json(&json).unwrap(), msg);
    }
}
