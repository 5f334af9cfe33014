//! # Merge Engine
//!
//! Folds one remote change batch into a collection's local snapshot.
//!
//! ## Algorithm
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      MergeEngine::merge(snapshot, batch)                │
//! │                                                                         │
//! │  1. batch empty AND from cache ─────────────────────► unchanged        │
//! │                                                                         │
//! │  2. records = snapshot          (id-indexed RecordSet)                  │
//! │                                                                         │
//! │  3. removed X   ── X present? ──► remove X, dirty                       │
//! │                                                                         │
//! │  4. added/modified R ── fingerprint(R) ≠ fingerprint(records[R.id])    │
//! │                         or absent? ──► replace wholesale, dirty         │
//! │                                                                         │
//! │  5. snapshot was empty AND batch non-empty                             │
//! │        └─► also ingest every document the feed currently shows        │
//! │                                                                         │
//! │  6. dirty ? write + notify : nothing                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Remote records replace local ones whole: no field merge, no timestamp
//! comparison. The last event observed wins.

use barsa_core::{ChangeBatch, RecordSet, RemoteChange};

/// Result of merging one batch.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// The merged collection content.
    pub records: RecordSet,

    /// True if `records` differs from the input snapshot.
    pub dirty: bool,

    /// Records inserted or replaced.
    pub upserts: usize,

    /// Records removed.
    pub removals: usize,

    /// True if the bootstrap rule pulled in the feed's full view.
    pub bootstrapped: bool,
}

impl MergeOutcome {
    fn unchanged(records: RecordSet) -> Self {
        MergeOutcome {
            records,
            dirty: false,
            upserts: 0,
            removals: 0,
            bootstrapped: false,
        }
    }

    /// The content to write back, if anything changed.
    pub fn into_update(self) -> Option<RecordSet> {
        self.dirty.then_some(self.records)
    }
}

/// Stateless batch merger.
pub struct MergeEngine;

impl MergeEngine {
    /// Merges `batch` into `snapshot`.
    pub fn merge(snapshot: RecordSet, batch: &ChangeBatch) -> MergeOutcome {
        if batch.is_cache_noop() {
            return MergeOutcome::unchanged(snapshot);
        }

        let started_empty = snapshot.is_empty();
        let mut outcome = MergeOutcome::unchanged(snapshot);

        for change in &batch.changes {
            match change {
                RemoteChange::Removed { id } => {
                    if outcome.records.remove(id).is_some() {
                        outcome.removals += 1;
                        outcome.dirty = true;
                    }
                }
                RemoteChange::Added { record } | RemoteChange::Modified { record } => {
                    if outcome.records.upsert(record.clone()) {
                        outcome.upserts += 1;
                        outcome.dirty = true;
                    }
                }
            }
        }

        if started_empty && !batch.is_empty() {
            outcome.bootstrapped = true;
            for document in &batch.documents {
                if outcome.records.upsert(document.clone()) {
                    outcome.upserts += 1;
                    outcome.dirty = true;
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use barsa_core::{Collection, Record};
    use serde_json::json;

    fn rec(id: &str, v: i64) -> Record {
        Record::from_value(json!({"id": id, "v": v})).unwrap()
    }

    fn batch(changes: Vec<RemoteChange>) -> ChangeBatch {
        ChangeBatch {
            changes,
            ..ChangeBatch::new(Collection::Orders)
        }
    }

    #[test]
    fn test_modify_and_remove() {
        let local = RecordSet::from_records([rec("A", 1), rec("B", 2)]);
        let outcome = MergeEngine::merge(
            local,
            &batch(vec![
                RemoteChange::Modified { record: rec("A", 3) },
                RemoteChange::Removed { id: "B".into() },
            ]),
        );

        assert!(outcome.dirty);
        assert_eq!(outcome.records.to_records(), vec![rec("A", 3)]);
        assert_eq!((outcome.upserts, outcome.removals), (1, 1));
        assert!(!outcome.bootstrapped);
    }

    #[test]
    fn test_identical_batch_is_clean() {
        let local = RecordSet::from_records([rec("A", 1)]);
        let outcome = MergeEngine::merge(
            local,
            &batch(vec![
                RemoteChange::Added { record: rec("A", 1) },
                RemoteChange::Removed { id: "Z".into() },
            ]),
        );
        assert!(!outcome.dirty);
        assert!(outcome.into_update().is_none());
    }

    #[test]
    fn test_bootstrap_ingests_full_view() {
        let mut b = batch(vec![RemoteChange::Added { record: rec("C", 3) }]);
        b.documents = vec![rec("A", 1), rec("B", 2), rec("C", 3)];

        let outcome = MergeEngine::merge(RecordSet::new(), &b);
        assert!(outcome.bootstrapped);
        let mut ids = outcome.records.ids();
        ids.sort();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_full_view_ignored_when_local_has_data() {
        let mut b = batch(vec![RemoteChange::Added { record: rec("C", 3) }]);
        b.documents = vec![rec("A", 1), rec("B", 2), rec("C", 3)];

        let outcome = MergeEngine::merge(RecordSet::from_records([rec("X", 0)]), &b);
        assert!(!outcome.bootstrapped);
        assert_eq!(outcome.records.ids(), vec!["X", "C"]);
    }

    #[test]
    fn test_empty_cache_batch_is_skipped() {
        let b = ChangeBatch {
            from_cache: true,
            documents: vec![rec("A", 1)],
            ..ChangeBatch::new(Collection::Users)
        };
        let outcome = MergeEngine::merge(RecordSet::new(), &b);
        assert!(!outcome.dirty);
        assert!(outcome.records.is_empty());
    }

    #[test]
    fn test_remote_replaces_whole_record() {
        let local = RecordSet::from_records([Record::from_value(
            json!({"id": "A", "client": "Ana", "note": "local only"}),
        )
        .unwrap()]);
        let incoming = Record::from_value(json!({"id": "A", "client": "Beto"})).unwrap();

        let outcome = MergeEngine::merge(
            local,
            &batch(vec![RemoteChange::Modified {
                record: incoming.clone(),
            }]),
        );
        assert_eq!(outcome.records.get("A"), Some(&incoming));
    }
}
