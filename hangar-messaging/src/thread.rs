//! Thread loading: the recent window of one conversation, enriched for display.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::MessagingConfig;
use crate::delivery::DeliveryManager;
use crate::error::MessagingResult;
use crate::identity::IdentityProvider;
use crate::models::input::MAX_MARK_READ_BATCH;
use crate::models::{Message, Profile, ReplyPreview, Thread, ThreadMessage};
use crate::store::{with_timeout, MessageFilter, MessageStore, Order};
use crate::utils::{require_id, unique_sender_ids};

pub struct ThreadLoader {
    store: Arc<dyn MessageStore>,
    identity: Arc<dyn IdentityProvider>,
    delivery: Arc<DeliveryManager>,
    config: MessagingConfig,
}

impl ThreadLoader {
    pub fn new(
        store: Arc<dyn MessageStore>,
        identity: Arc<dyn IdentityProvider>,
        delivery: Arc<DeliveryManager>,
        config: MessagingConfig,
    ) -> Self {
        Self {
            store,
            identity,
            delivery,
            config,
        }
    }

    /// Load the most recent `thread_limit` messages between the two users,
    /// oldest first, and mark the inbound unread ones as read.
    ///
    /// Reply targets are resolved inside the loaded window only; a target
    /// outside it (or deleted) yields `reply_to: None`.
    pub async fn load_thread(&self, current_user_id: &str, counterpart_id: &str) -> MessagingResult<Thread> {
        let current = require_id(current_user_id, "current_user_id")?;
        let counterpart = require_id(counterpart_id, "counterpart_id")?;

        let mut window = with_timeout(
            self.config.store_timeout,
            self.store.query(
                &MessageFilter::between(current, counterpart),
                Order::NewestFirst,
                Some(self.config.thread_limit),
            ),
        )
        .await
        .map_err(|e| {
            warn!(user_id = %current, counterpart_id = %counterpart, error = %e, "Thread load failed");
            e
        })?;
        window.reverse();

        let unread: Vec<String> = window
            .iter()
            .filter(|m| m.is_unread_for(current))
            .map(|m| m.id.clone())
            .collect();
        let marked_read = self.mark_window_read(current, &unread).await;
        for message in window.iter_mut() {
            if marked_read.contains(&message.id) {
                message.read = true;
            }
        }

        let senders = self.sender_snapshots(&window).await;
        let messages = enrich(window, &senders);

        debug!(
            user_id = %current,
            counterpart_id = %counterpart,
            count = messages.len(),
            marked_read = marked_read.len(),
            "Loaded thread"
        );

        Ok(Thread {
            counterpart_id: counterpart.to_string(),
            messages,
            marked_read,
        })
    }

    /// Viewing is reading. Windows wider than one receipt batch go out in
    /// chunks; a failed chunk is retried by the next load.
    async fn mark_window_read(&self, current: &str, unread: &[String]) -> Vec<String> {
        let mut marked = Vec::with_capacity(unread.len());
        for chunk in unread.chunks(MAX_MARK_READ_BATCH) {
            match self.delivery.mark_read(chunk, current).await {
                Ok(flipped) => marked.extend(flipped),
                Err(e) => {
                    warn!(user_id = %current, pending = chunk.len(), error = %e, "Could not mark thread as read");
                }
            }
        }
        marked
    }

    /// One identity lookup for all distinct senders in the window.
    async fn sender_snapshots(&self, window: &[Message]) -> HashMap<String, Profile> {
        let sender_ids = unique_sender_ids(window);
        if sender_ids.is_empty() {
            return HashMap::new();
        }
        match with_timeout(self.config.store_timeout, self.identity.get_users(&sender_ids)).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, senders = sender_ids.len(), "Sender profiles unavailable");
                HashMap::new()
            }
        }
    }
}

fn enrich(window: Vec<Message>, senders: &HashMap<String, Profile>) -> Vec<ThreadMessage> {
    let by_id: HashMap<&str, &Message> = window.iter().map(|m| (m.id.as_str(), m)).collect();

    let reply_previews: Vec<Option<ReplyPreview>> = window
        .iter()
        .map(|m| {
            m.reply_to_id
                .as_deref()
                .and_then(|target| by_id.get(target))
                .map(|target| ReplyPreview {
                    message: (*target).clone(),
                    sender: senders.get(&target.sender_id).cloned(),
                })
        })
        .collect();

    window
        .into_iter()
        .zip(reply_previews)
        .map(|(message, reply_to)| ThreadMessage {
            sender: senders.get(&message.sender_id).cloned(),
            message,
            reply_to,
        })
        .collect()
}
