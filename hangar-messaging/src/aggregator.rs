//! Conversation list: one entry per counterpart, newest activity first.

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tracing::{debug, warn};

use crate::config::MessagingConfig;
use crate::error::{MessagingError, MessagingResult, StoreError};
use crate::identity::IdentityProvider;
use crate::models::{Conversation, Message, Profile};
use crate::store::{with_timeout, MessageFilter, MessageStore, Order};
use crate::utils::require_user;

pub struct ConversationAggregator {
    store: Arc<dyn MessageStore>,
    identity: Arc<dyn IdentityProvider>,
    config: MessagingConfig,
}

/// Outcome of the two per-counterpart sub-queries.
struct Entry {
    conversation: Conversation,
    failed_queries: usize,
}

impl ConversationAggregator {
    pub fn new(
        store: Arc<dyn MessageStore>,
        identity: Arc<dyn IdentityProvider>,
        config: MessagingConfig,
    ) -> Self {
        Self {
            store,
            identity,
            config,
        }
    }

    /// List every conversation of `current_user_id`.
    ///
    /// A sub-query failure only degrades that counterpart's entry. The call
    /// fails with `StoreUnavailable` when the member listing fails or when
    /// every counterpart failed.
    pub async fn list_conversations(&self, current_user_id: &str) -> MessagingResult<Vec<Conversation>> {
        let current = require_user(current_user_id)?;

        let counterparts = with_timeout(
            self.config.store_timeout,
            self.identity.list_other_users(current),
        )
        .await?;

        if counterparts.is_empty() {
            return Ok(Vec::new());
        }

        let total = counterparts.len();
        let entries: Vec<Entry> = stream::iter(counterparts)
            .map(|counterpart| self.build_entry(current, counterpart))
            // buffered(0) never polls anything
            .buffered(self.config.aggregate_concurrency.max(1))
            .collect()
            .await;

        let fully_failed = entries.iter().filter(|e| e.failed_queries == 2).count();
        if fully_failed == total {
            warn!(user_id = %current, total, "Every conversation sub-query failed");
            return Err(MessagingError::StoreUnavailable(
                "conversation queries failed for every counterpart".to_string(),
            ));
        }

        let mut conversations: Vec<Conversation> =
            entries.into_iter().map(|e| e.conversation).collect();
        sort_by_recent_activity(&mut conversations);

        debug!(
            user_id = %current,
            count = conversations.len(),
            degraded = fully_failed,
            "Listed conversations"
        );
        Ok(conversations)
    }

    /// Unread messages addressed to `current_user_id` across all conversations.
    pub async fn total_unread(&self, current_user_id: &str) -> MessagingResult<u32> {
        let current = require_user(current_user_id)?;
        let filter = MessageFilter::And(vec![
            MessageFilter::ReceiverIs(current.to_string()),
            MessageFilter::Unread,
        ]);
        let count = with_timeout(self.config.store_timeout, self.store.count(&filter)).await?;
        Ok(saturating_count(count))
    }

    async fn build_entry(&self, current: &str, counterpart: Profile) -> Entry {
        let timeout = self.config.store_timeout;
        let last_filter = MessageFilter::between(current, &counterpart.id);
        let unread_filter = MessageFilter::unread_from(&counterpart.id, current);

        let (last, unread) = tokio::join!(
            with_timeout(
                timeout,
                self.store.query(&last_filter, Order::NewestFirst, Some(1))
            ),
            with_timeout(timeout, self.store.count(&unread_filter)),
        );

        let mut conversation = Conversation::empty(counterpart);
        let mut failed_queries = 0;

        match last {
            Ok(rows) => apply_last_message(&mut conversation, rows.into_iter().next()),
            Err(e) => {
                failed_queries += 1;
                log_sub_query_failure(current, &conversation.counterpart.id, "last message", &e);
            }
        }
        match unread {
            Ok(count) => conversation.unread_count = Some(saturating_count(count)),
            Err(e) => {
                failed_queries += 1;
                conversation.unread_count = None;
                log_sub_query_failure(current, &conversation.counterpart.id, "unread count", &e);
            }
        }
        conversation.degraded = failed_queries > 0;

        Entry {
            conversation,
            failed_queries,
        }
    }
}

fn apply_last_message(conversation: &mut Conversation, last: Option<Message>) {
    if let Some(message) = last {
        conversation.last_message = Some(message.body);
        conversation.last_message_time = Some(message.created_at);
    }
}

fn saturating_count(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}

fn log_sub_query_failure(current: &str, counterpart: &str, what: &str, error: &StoreError) {
    warn!(
        user_id = %current,
        counterpart_id = %counterpart,
        error = %error,
        "Conversation {} query failed, entry degraded",
        what
    );
}

/// Newest activity first; silent conversations last; otherwise listing order.
pub fn sort_by_recent_activity(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| match (a.last_message_time, b.last_message_time) {
        (Some(ta), Some(tb)) => tb.cmp(&ta),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
}

/// Case-insensitive display-name search. An empty query keeps everything.
pub fn filter_conversations<'a>(conversations: &'a [Conversation], query: &str) -> Vec<&'a Conversation> {
    let needle = query.trim().to_lowercase();
    conversations
        .iter()
        .filter(|c| {
            needle.is_empty()
                || c.counterpart
                    .display_name
                    .as_deref()
                    .map(|name| name.to_lowercase().contains(&needle))
                    .unwrap_or(false)
        })
        .collect()
}
