//! # Record Set
//!
//! The in-memory form of a collection: insertion-ordered and unique by id.
//!
//! ```text
//!   entries: [ (A, fp_A) , (B, fp_B) , (C, fp_C) ]   ← order preserved
//!   index:   { "A": 0, "B": 1, "C": 2 }               ← O(1) lookup
//! ```
//!
//! Each entry caches its [`Fingerprint`], so an incoming record is compared
//! by hashing it once rather than walking both JSON trees.

use std::collections::HashMap;

use crate::types::{Fingerprint, Record};

#[derive(Debug, Clone)]
struct Entry {
    record: Record,
    fingerprint: Fingerprint,
}

/// An ordered, id-unique set of records.
#[derive(Debug, Clone, Default)]
pub struct RecordSet {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl RecordSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from records; a later duplicate id replaces the earlier
    /// entry in place.
    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        let mut set = RecordSet::new();
        for record in records {
            set.upsert(record);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Returns the record with the given id.
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.index.get(id).map(|&pos| &self.entries[pos].record)
    }

    /// Returns the cached fingerprint of the record with the given id.
    pub fn fingerprint_of(&self, id: &str) -> Option<Fingerprint> {
        self.index.get(id).map(|&pos| self.entries[pos].fingerprint)
    }

    /// Iterates records in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.entries.iter().map(|e| &e.record)
    }

    /// Returns the ids in insertion order.
    pub fn ids(&self) -> Vec<String> {
        self.iter().map(|r| r.id().to_string()).collect()
    }

    /// Inserts or replaces a record.
    ///
    /// ## Returns
    /// `true` if the set changed: the id was absent, or the stored record is
    /// structurally different. Replacing a record with an equal one is a
    /// no-op and returns `false`.
    pub fn upsert(&mut self, record: Record) -> bool {
        let fingerprint = record.fingerprint();
        match self.index.get(record.id()) {
            Some(&pos) => {
                if self.entries[pos].fingerprint == fingerprint {
                    return false;
                }
                self.entries[pos] = Entry {
                    record,
                    fingerprint,
                };
                true
            }
            None => {
                self.index
                    .insert(record.id().to_string(), self.entries.len());
                self.entries.push(Entry {
                    record,
                    fingerprint,
                });
                true
            }
        }
    }

    /// Removes a record by id.
    pub fn remove(&mut self, id: &str) -> Option<Record> {
        let pos = self.index.remove(id)?;
        let removed = self.entries.remove(pos);
        for entry in &self.entries[pos..] {
            if let Some(slot) = self.index.get_mut(entry.record.id()) {
                *slot -= 1;
            }
        }
        Some(removed.record)
    }

    /// Returns the records in insertion order.
    pub fn to_records(&self) -> Vec<Record> {
        self.iter().cloned().collect()
    }

    /// Consumes the set, returning the records in insertion order.
    pub fn into_records(self) -> Vec<Record> {
        self.entries.into_iter().map(|e| e.record).collect()
    }
}

impl FromIterator<Record> for RecordSet {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        RecordSet::from_records(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(value: serde_json::Value) -> Record {
        Record::from_value(value).unwrap()
    }

    #[test]
    fn test_upsert_reports_effective_change() {
        let mut set = RecordSet::new();
        assert!(set.upsert(rec(json!({"id": "a", "v": 1}))));
        assert!(!set.upsert(rec(json!({"id": "a", "v": 1}))));
        assert!(set.upsert(rec(json!({"id": "a", "v": 2}))));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("a").unwrap().get("v"), Some(&json!(2)));
    }

    #[test]
    fn test_remove_keeps_order_and_index() {
        let mut set: RecordSet = ["a", "b", "c", "d"]
            .iter()
            .map(|id| Record::new(*id).unwrap())
            .collect();

        assert!(set.remove("b").is_some());
        assert!(set.remove("b").is_none());
        assert_eq!(set.ids(), vec!["a", "c", "d"]);
        assert!(set.get("d").is_some());
        assert_eq!(set.get("c").unwrap().id(), "c");

        set.upsert(Record::new("b").unwrap());
        assert_eq!(set.ids(), vec!["a", "c", "d", "b"]);
    }

    #[test]
    fn test_duplicate_ids_collapse_in_place() {
        let set = RecordSet::from_records(vec![
            rec(json!({"id": "a", "v": 1})),
            rec(json!({"id": "b"})),
            rec(json!({"id": "a", "v": 9})),
        ]);
        assert_eq!(set.ids(), vec!["a", "b"]);
        assert_eq!(set.get("a").unwrap().get("v"), Some(&json!(9)));
    }
}
