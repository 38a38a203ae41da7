//! In-process fan-out of message-table changes to filtered subscribers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::Message;
use crate::store::{ChangeEvent, ChangeKind, ChangeSubscription, MessageFilter};

struct Subscriber {
    filter: MessageFilter,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

type Registry = DashMap<u64, Subscriber>;

/// Subscriber registry shared by the store adapters.
pub struct ChangeHub {
    subscribers: Arc<Registry>,
    next_id: AtomicU64,
    available: AtomicBool,
}

/// Removes its subscriber from the hub when dropped.
pub struct SubscriptionGuard {
    id: u64,
    registry: Weak<Registry>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.remove(&self.id).is_some() {
                debug!(subscription = self.id, "Change subscription removed");
            }
        }
    }
}

impl ChangeHub {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            available: AtomicBool::new(true),
        }
    }

    /// Register interest in rows matching `filter`.
    pub fn subscribe(&self, filter: MessageFilter) -> Result<ChangeSubscription, StoreError> {
        if !self.available.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("change feed is offline".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(id, Subscriber { filter, tx });
        debug!(subscription = id, "Change subscription added");

        Ok(ChangeSubscription {
            events: rx,
            _guard: SubscriptionGuard {
                id,
                registry: Arc::downgrade(&self.subscribers),
            },
        })
    }

    /// Deliver a change on `message` to every subscriber whose filter matches it.
    /// Returns how many subscribers were notified.
    pub fn publish(&self, kind: ChangeKind, message: &Message) -> usize {
        let event = ChangeEvent::for_message(kind, message);
        let mut delivered = 0;
        for entry in self.subscribers.iter() {
            if entry.value().filter.matches(message) && entry.value().tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        // Receivers dropped without their guard (task aborted mid-await) leave closed senders.
        self.subscribers.retain(|_, s| !s.tx.is_closed());
        delivered
    }

    /// Take the feed offline: new subscriptions fail and existing channels close.
    pub fn disconnect(&self) {
        self.available.store(false, Ordering::Release);
        let dropped = self.subscribers.len();
        self.subscribers.clear();
        info!(dropped, "Change feed disconnected");
    }

    pub fn reconnect(&self) {
        self.available.store(true, Ordering::Release);
        info!("Change feed reconnected");
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for ChangeHub {
    fn default() -> Self {
        Self::new()
    }
}
