//! # Domain Types
//!
//! The shapes the sync core moves around.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Sync Core Types                                 │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │   Collection    │   │     Record      │   │  RemoteChange   │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  users          │   │  id (string)    │   │  added          │       │
//! │  │  batches        │   │  ...opaque      │   │  modified       │       │
//! │  │  orders         │   │     fields      │   │  removed        │       │
//! │  │  config         │   └─────────────────┘   └─────────────────┘       │
//! │  └─────────────────┘                                                    │
//! │                        ┌─────────────────────────────────────────┐      │
//! │                        │  ChangeBatch                            │      │
//! │                        │  collection + changes + documents       │      │
//! │                        │  + from_cache flag                      │      │
//! │                        └─────────────────────────────────────────┘      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A [`Record`] is any domain entity (user, batch, order, config). The core
//! only knows about its `id`; every other field is opaque JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult, ValidationError};

/// Name of the mandatory identity field on every record.
pub const ID_FIELD: &str = "id";

// =============================================================================
// Collection
// =============================================================================

/// A named set of records persisted together.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS,
)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum Collection {
    /// Application users (operators, administrators).
    Users,
    /// Poultry batches.
    Batches,
    /// Client orders and their weighings.
    Orders,
    /// Business configuration.
    Config,
}

impl Collection {
    /// Every collection, in bootstrap upload order.
    pub const ALL: [Collection; 4] = [
        Collection::Users,
        Collection::Batches,
        Collection::Orders,
        Collection::Config,
    ];

    /// Returns the persisted name of the collection.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Users => "users",
            Collection::Batches => "batches",
            Collection::Orders => "orders",
            Collection::Config => "config",
        }
    }

    /// Returns the notification name fired when this collection changes.
    ///
    /// ```rust
    /// use barsa_core::Collection;
    ///
    /// assert_eq!(Collection::Orders.event_name(), "orders-changed");
    /// ```
    pub fn event_name(&self) -> String {
        format!("{}-changed", self.as_str())
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Collection {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "users" => Ok(Collection::Users),
            "batches" => Ok(Collection::Batches),
            "orders" => Ok(Collection::Orders),
            "config" => Ok(Collection::Config),
            other => Err(CoreError::UnknownCollection(other.to_string())),
        }
    }
}

// =============================================================================
// Record
// =============================================================================

/// A uniquely `id`-keyed JSON object.
///
/// ## Invariant
/// `id` is always present and is a non-empty string. Construction paths
/// (`from_value`, `TryFrom<Map>`, deserialization) reject anything else, and
/// [`Record::insert`] refuses to touch `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    /// Creates a record carrying only its id.
    pub fn new(id: impl Into<String>) -> CoreResult<Self> {
        let mut fields = Map::new();
        fields.insert(ID_FIELD.to_string(), Value::String(id.into()));
        Record::try_from(fields)
    }

    /// Builds a record from an arbitrary JSON value.
    ///
    /// ```rust
    /// use barsa_core::Record;
    /// use serde_json::json;
    ///
    /// let record = Record::from_value(json!({"id": "b-1", "name": "Lote 1"})).unwrap();
    /// assert_eq!(record.id(), "b-1");
    /// assert!(Record::from_value(json!({"name": "no id"})).is_err());
    /// assert!(Record::from_value(json!([1, 2, 3])).is_err());
    /// ```
    pub fn from_value(value: Value) -> CoreResult<Self> {
        match value {
            Value::Object(fields) => Record::try_from(fields),
            other => Err(CoreError::InvalidRecord(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Serializes a typed domain value into a record.
    pub fn from_typed<T: Serialize>(value: &T) -> CoreResult<Self> {
        Record::from_value(serde_json::to_value(value)?)
    }

    /// Deserializes the record into a typed domain value.
    pub fn to_typed<T: serde::de::DeserializeOwned>(&self) -> CoreResult<T> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }

    /// Returns the record id.
    pub fn id(&self) -> &str {
        self.fields
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Returns a field value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Sets a field, returning the previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> CoreResult<Option<Value>> {
        let key = key.into();
        if key == ID_FIELD {
            return Err(ValidationError::Immutable { field: key }.into());
        }
        Ok(self.fields.insert(key, value))
    }

    /// Removes a field, returning its value.
    pub fn remove(&mut self, key: &str) -> CoreResult<Option<Value>> {
        if key == ID_FIELD {
            return Err(ValidationError::Immutable {
                field: key.to_string(),
            }
            .into());
        }
        Ok(self.fields.remove(key))
    }

    /// Returns all fields, `id` included.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Converts the record back into a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }

    /// Computes the structural fingerprint of the record.
    ///
    /// `serde_json::Map` keeps keys sorted, so two structurally equal
    /// records always serialize to the same bytes regardless of the order
    /// their fields were inserted in.
    pub fn fingerprint(&self) -> Fingerprint {
        let bytes = serde_json::to_vec(&self.fields).unwrap_or_default();
        Fingerprint(Sha256::digest(&bytes).into())
    }
}

impl TryFrom<Map<String, Value>> for Record {
    type Error = CoreError;

    fn try_from(fields: Map<String, Value>) -> Result<Self, Self::Error> {
        match fields.get(ID_FIELD) {
            Some(Value::String(id)) if !id.trim().is_empty() => Ok(Record { fields }),
            Some(Value::String(_)) => Err(CoreError::InvalidRecord("id is empty".into())),
            Some(other) => Err(CoreError::InvalidRecord(format!(
                "id must be a string, got {}",
                json_kind(other)
            ))),
            None => Err(CoreError::InvalidRecord("missing id".into())),
        }
    }
}

impl From<Record> for Map<String, Value> {
    fn from(record: Record) -> Self {
        record.fields
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Fingerprint
// =============================================================================

/// SHA-256 digest of a record's canonical JSON.
///
/// Used for change detection during merges instead of walking both
/// records field by field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// =============================================================================
// Remote Changes
// =============================================================================

/// Kind of a remote change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "added"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Removed => write!(f, "removed"),
        }
    }
}

/// One delta event delivered by the remote change feed.
///
/// Wire form: `{"kind": "added", "record": {...}}` or
/// `{"kind": "removed", "id": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RemoteChange {
    Added { record: Record },
    Modified { record: Record },
    Removed { id: String },
}

impl RemoteChange {
    /// Returns the id of the record the change refers to.
    pub fn id(&self) -> &str {
        match self {
            RemoteChange::Added { record } | RemoteChange::Modified { record } => record.id(),
            RemoteChange::Removed { id } => id,
        }
    }

    /// Returns the change kind.
    pub fn kind(&self) -> ChangeKind {
        match self {
            RemoteChange::Added { .. } => ChangeKind::Added,
            RemoteChange::Modified { .. } => ChangeKind::Modified,
            RemoteChange::Removed { .. } => ChangeKind::Removed,
        }
    }
}

/// A batch of remote changes for one collection, as delivered by one
/// change-feed notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    /// Collection the batch belongs to.
    pub collection: Collection,

    /// Delta since the previous notification.
    pub changes: Vec<RemoteChange>,

    /// Every document currently visible in the feed.
    #[serde(default)]
    pub documents: Vec<Record>,

    /// True when the batch was served from the offline cache rather than
    /// the server.
    #[serde(default)]
    pub from_cache: bool,
}

impl ChangeBatch {
    /// Creates an empty server batch.
    pub fn new(collection: Collection) -> Self {
        ChangeBatch {
            collection,
            changes: Vec::new(),
            documents: Vec::new(),
            from_cache: false,
        }
    }

    /// Returns true if the batch carries no delta.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns true if the batch can be skipped without looking at it.
    pub fn is_cache_noop(&self) -> bool {
        self.is_empty() && self.from_cache
    }
}
