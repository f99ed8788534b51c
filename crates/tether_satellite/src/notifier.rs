//! Change notifications for the application layer.
//!
//! The notifier fans out "these tables changed" events to subscribers
//! through per-subscriber queues. Delivery never blocks the caller: a
//! subscriber whose queue has been dropped is removed on the next
//! notification and does not affect anyone else.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tether_protocol::TransactionId;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::trace;

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrigin {
    /// Written through this satellite.
    Local,
    /// Applied from an inbound transaction.
    Remote,
}

/// One change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    /// Changed tables that matched the subscriber's predicate.
    pub tables: Vec<String>,
    /// Origin of the change.
    pub origin: ChangeOrigin,
    /// Transaction that caused the change.
    pub transaction_id: Option<TransactionId>,
}

/// Identifies a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type TablePredicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

struct Subscriber {
    id: SubscriberId,
    predicate: TablePredicate,
    sender: UnboundedSender<ChangeNotification>,
}

/// Receiving end of a subscription.
#[derive(Debug)]
pub struct ChangeStream {
    id: SubscriberId,
    receiver: UnboundedReceiver<ChangeNotification>,
}

impl ChangeStream {
    /// Handle used to unsubscribe.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Waits for the next notification. Returns `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<ChangeNotification> {
        self.receiver.recv().await
    }

    /// Returns a queued notification without waiting.
    pub fn try_recv(&mut self) -> Option<ChangeNotification> {
        match self.receiver.try_recv() {
            Ok(notification) => Some(notification),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

/// In-process publish/subscribe hub for table changes.
#[derive(Default)]
pub struct Notifier {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl Notifier {
    /// Creates a notifier with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to changes of tables accepted by `predicate`.
    pub fn subscribe<P>(&self, predicate: P) -> ChangeStream
    where
        P: Fn(&str) -> bool + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.write().push(Subscriber {
            id,
            predicate: Box::new(predicate),
            sender,
        });
        ChangeStream { id, receiver }
    }

    /// Subscribes to changes of the named tables.
    pub fn subscribe_tables<I, S>(&self, tables: I) -> ChangeStream
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tables: Vec<String> = tables.into_iter().map(Into::into).collect();
        self.subscribe(move |table| tables.iter().any(|t| t == table))
    }

    /// Subscribes to every table.
    pub fn subscribe_all(&self) -> ChangeStream {
        self.subscribe(|_| true)
    }

    /// Removes a subscriber. Its stream ends after draining queued
    /// notifications. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Announces that `tables` changed.
    pub fn notify(
        &self,
        tables: &[String],
        origin: ChangeOrigin,
        transaction_id: Option<TransactionId>,
    ) {
        if tables.is_empty() {
            return;
        }
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|subscriber| {
            let matched: Vec<String> = tables
                .iter()
                .filter(|t| (subscriber.predicate)(t.as_str()))
                .cloned()
                .collect();
            if matched.is_empty() {
                return !subscriber.sender.is_closed();
            }
            let delivered = subscriber
                .sender
                .send(ChangeNotification {
                    tables: matched,
                    origin,
                    transaction_id,
                })
                .is_ok();
            if !delivered {
                trace!(subscriber = %subscriber.id, "dropping closed subscriber");
            }
            delivered
        });
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
