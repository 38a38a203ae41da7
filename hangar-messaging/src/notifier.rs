//! Realtime notifier: turns store change events into "something changed" pings.
//!
//! Push is an optimization. When the feed cannot be opened, or drops, the
//! subscription goes quiet and polling keeps the views fresh.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{MessageFilter, MessageStore};

/// Live registration for one user. Dropping it unsubscribes.
pub struct Subscription {
    user_id: String,
    task: Option<JoinHandle<()>>,
    live: Arc<AtomicBool>,
}

impl Subscription {
    /// True while change events are flowing.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Cancel the delivery task; no new `on_change` call starts afterwards.
    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.live.store(false, Ordering::Release);
            debug!(user_id = %self.user_id, "Realtime subscription stopped");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct RealtimeNotifier {
    store: Arc<dyn MessageStore>,
}

impl RealtimeNotifier {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    /// Call `on_change` whenever a message sent or received by
    /// `current_user_id` is inserted, updated or deleted.
    ///
    /// Events carry no payload for the callback; duplicates and reordering
    /// are expected, so `on_change` should trigger a full re-fetch.
    /// Must be called from within a tokio runtime.
    pub fn subscribe<F>(&self, current_user_id: &str, on_change: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        let user_id = current_user_id.trim().to_string();
        let live = Arc::new(AtomicBool::new(false));

        if user_id.is_empty() {
            warn!("Realtime subscribe without a user, relying on polling");
            return Subscription {
                user_id,
                task: None,
                live,
            };
        }

        let mut feed = match self.store.subscribe(MessageFilter::involving(&user_id)) {
            Ok(feed) => feed,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Realtime unavailable, relying on polling");
                return Subscription {
                    user_id,
                    task: None,
                    live,
                };
            }
        };

        live.store(true, Ordering::Release);
        let task_live = live.clone();
        let task_user = user_id.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = feed.recv().await {
                debug!(user_id = %task_user, kind = ?event.kind, message_id = %event.message_id, "Change event");
                on_change();
            }
            task_live.store(false, Ordering::Release);
            info!(user_id = %task_user, "Realtime feed closed, relying on polling");
        });

        info!(user_id = %user_id, "Realtime subscription started");
        Subscription {
            user_id,
            task: Some(task),
            live,
        }
    }
}
