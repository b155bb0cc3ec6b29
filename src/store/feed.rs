// In-process change feed shared by the store implementations

use log::{debug, error};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use super::{ChangeEvent, EventFilter, Filter, Subscription, SubscriptionId, Table};

struct Subscriber {
    table: Table,
    events: EventFilter,
    row_filter: Option<Filter>,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl Subscriber {
    fn wants(&self, event: &ChangeEvent) -> bool {
        self.table == event.table
            && self.events.accepts(event.kind)
            && self.row_filter.as_ref().map_or(true, |f| f.matches(&event.row))
    }
}

#[derive(Default)]
pub struct ChangeFeed {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriptionId, Subscriber>>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, table: Table, events: EventFilter, row_filter: Option<Filter>) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.insert(id, Subscriber { table, events, row_filter, tx });
            debug!("Subscription {:?} opened on {} ({} active)", id, table, subscribers.len());
        } else {
            // The receiver will simply never yield.
            error!("Failed to lock subscriber table; subscription {:?} on {} is inert", id, table);
        }
        Subscription { id, events: rx }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.subscribers.lock() {
            Ok(mut subscribers) => {
                let removed = subscribers.remove(&id).is_some();
                if removed {
                    debug!("Subscription {:?} released ({} active)", id, subscribers.len());
                }
                removed
            }
            Err(_) => {
                error!("Failed to lock subscriber table while releasing {:?}", id);
                false
            }
        }
    }

    /// Delivers `event` to every matching subscriber, pruning dropped receivers.
    pub fn publish(&self, event: &ChangeEvent) {
        let mut subscribers = match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(_) => {
                error!("Failed to lock subscriber table; {:?} event on {} dropped", event.kind, event.table);
                return;
            }
        };

        let mut closed = Vec::new();
        for (id, subscriber) in subscribers.iter() {
            if subscriber.wants(event) && subscriber.tx.send(event.clone()).is_err() {
                closed.push(*id);
            }
        }

        for id in closed {
            subscribers.remove(&id);
            debug!("Subscriber {:?} receiver closed, removed", id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{make_row, ChangeKind};
    use serde_json::json;

    fn event(table: Table, kind: ChangeKind, conversation: &str) -> ChangeEvent {
        ChangeEvent {
            table,
            kind,
            row: make_row([("conversation_id", json!(conversation))]),
        }
    }

    #[test]
    fn test_publish_respects_table_kind_and_row_filter() {
        let feed = ChangeFeed::new();
        let mut scoped = feed.subscribe(
            Table::Messages,
            EventFilter::Insert,
            Some(Filter::eq("conversation_id", "c1")),
        );
        let mut everything = feed.subscribe(Table::Messages, EventFilter::All, None);

        feed.publish(&event(Table::Messages, ChangeKind::Insert, "c1"));
        feed.publish(&event(Table::Messages, ChangeKind::Insert, "c2"));
        feed.publish(&event(Table::Messages, ChangeKind::Update, "c1"));
        feed.publish(&event(Table::Profiles, ChangeKind::Insert, "c1"));

        assert_eq!(scoped.events.try_recv().map(|e| e.row["conversation_id"].clone()).ok(), Some(json!("c1")));
        assert!(scoped.events.try_recv().is_err());

        let mut seen = 0;
        while everything.events.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_unsubscribe_and_pruning() {
        let feed = ChangeFeed::new();
        let kept = feed.subscribe(Table::Profiles, EventFilter::All, None);
        let dropped = feed.subscribe(Table::Profiles, EventFilter::All, None);
        assert_eq!(feed.subscriber_count(), 2);

        drop(dropped);
        feed.publish(&event(Table::Profiles, ChangeKind::Update, "x"));
        assert_eq!(feed.subscriber_count(), 1);

        assert!(feed.unsubscribe(kept.id));
        assert!(!feed.unsubscribe(kept.id));
        assert_eq!(feed.subscriber_count(), 0);
    }
}
