//! # Change Notifications
//!
//! Per-collection observer interface. Collaborators subscribe to the
//! collections they render; the LocalStore publishes after every effective
//! write.
//!
//! ```text
//!   LocalStore.save(orders, o-1)
//!        │
//!        ▼
//!   ChangeNotifier.publish(CollectionChanged { orders, Saved(o-1) })
//!        │
//!        ├──► subscribe(Orders)   (orders screen)
//!        ├──► subscribe_all()     (upload mirror)
//!        └─╳  subscribe(Users)    (filtered out)
//! ```
//!
//! Channels are unbounded so a slow subscriber can never lose an event the
//! mirror depends on. Closed subscribers are dropped on the next publish.

use std::sync::{Arc, Mutex, MutexGuard};

use barsa_core::{Collection, Record};
use tokio::sync::mpsc;
use tracing::trace;

/// Why a collection changed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeCause {
    /// A collaborator saved this record.
    Saved(Record),
    /// A collaborator deleted the record with this id.
    Deleted(String),
    /// A remote change batch was merged in.
    Merged,
    /// The collection was replaced wholesale (restore, reset, seed).
    Restored,
}

impl ChangeCause {
    /// Returns true for changes made by local collaborators, the ones that
    /// need mirroring to the remote.
    pub fn is_local_mutation(&self) -> bool {
        matches!(self, ChangeCause::Saved(_) | ChangeCause::Deleted(_))
    }
}

/// A change notification for one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionChanged {
    pub collection: Collection,
    pub cause: ChangeCause,
}

impl CollectionChanged {
    /// Returns the event name, e.g. `orders-changed`.
    pub fn event_name(&self) -> String {
        self.collection.event_name()
    }
}

struct Subscriber {
    filter: Option<Collection>,
    tx: mpsc::UnboundedSender<CollectionChanged>,
}

/// Fan-out of [`CollectionChanged`] events. Cheap to clone; clones share
/// subscribers.
#[derive(Clone, Default)]
pub struct ChangeNotifier {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl ChangeNotifier {
    /// Creates a notifier with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribes to one collection.
    pub fn subscribe(&self, collection: Collection) -> mpsc::UnboundedReceiver<CollectionChanged> {
        self.add(Some(collection))
    }

    /// Subscribes to every collection.
    pub fn subscribe_all(&self) -> mpsc::UnboundedReceiver<CollectionChanged> {
        self.add(None)
    }

    fn add(&self, filter: Option<Collection>) -> mpsc::UnboundedReceiver<CollectionChanged> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(Subscriber { filter, tx });
        rx
    }

    /// Delivers an event to every matching subscriber.
    pub fn publish(&self, event: CollectionChanged) {
        trace!(event = %event.event_name(), "Publishing collection change");

        self.lock().retain(|sub| {
            if sub.filter.is_some_and(|c| c != event.collection) {
                return !sub.tx.is_closed();
            }
            sub.tx.send(event.clone()).is_ok()
        });
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.lock();
        subs.retain(|sub| !sub.tx.is_closed());
        subs.len()
    }
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("subscribers", &self.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merged(collection: Collection) -> CollectionChanged {
        CollectionChanged {
            collection,
            cause: ChangeCause::Merged,
        }
    }

    #[tokio::test]
    async fn test_filtered_subscription() {
        let notifier = ChangeNotifier::new();
        let mut orders = notifier.subscribe(Collection::Orders);
        let mut all = notifier.subscribe_all();

        notifier.publish(merged(Collection::Users));
        notifier.publish(merged(Collection::Orders));

        assert_eq!(orders.recv().await.unwrap().collection, Collection::Orders);
        assert!(orders.try_recv().is_err());

        assert_eq!(all.recv().await.unwrap().collection, Collection::Users);
        assert_eq!(all.recv().await.unwrap().collection, Collection::Orders);
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let notifier = ChangeNotifier::new();
        let rx = notifier.subscribe(Collection::Batches);
        let _keep = notifier.subscribe_all();
        assert_eq!(notifier.subscriber_count(), 2);

        drop(rx);
        notifier.publish(merged(Collection::Batches));
        assert_eq!(notifier.subscriber_count(), 1);
    }

    #[test]
    fn test_local_mutation_causes() {
        let record = Record::new("x").unwrap();
        assert!(ChangeCause::Saved(record).is_local_mutation());
        assert!(ChangeCause::Deleted("x".into()).is_local_mutation());
        assert!(!ChangeCause::Merged.is_local_mutation());
        assert!(!ChangeCause::Restored.is_local_mutation());
    }
}
