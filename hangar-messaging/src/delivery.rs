//! Write path: send, read receipts and retraction.
//!
//! A message moves `sent -> read` once, and only its receiver moves it. It is
//! deleted, from either state, only by its sender.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::MessagingConfig;
use crate::error::{MessagingError, MessagingResult};
use crate::models::input::{
    DeleteMessageInput, MarkReadInput, SendMessageInput, ValidateExt, MAX_MESSAGE_ID_LENGTH,
};
use crate::models::{Message, MessagePatch, NewMessage};
use crate::store::{with_timeout, MessageFilter, MessageStore, Order};
use crate::utils::validation::normalize_body;
use crate::utils::{require_id, require_user};

pub struct DeliveryManager {
    store: Arc<dyn MessageStore>,
    config: MessagingConfig,
}

impl DeliveryManager {
    pub fn new(store: Arc<dyn MessageStore>, config: MessagingConfig) -> Self {
        Self { store, config }
    }

    /// Persist a new message from `current_user_id` to `counterpart_id`.
    ///
    /// A `reply_to_id` that does not name a message of this pair fails the
    /// send with `InvalidReply`; it is never silently dropped.
    pub async fn send(
        &self,
        current_user_id: &str,
        counterpart_id: &str,
        body: &str,
        reply_to_id: Option<&str>,
    ) -> MessagingResult<Message> {
        let sender = require_user(current_user_id)?;
        let receiver = require_id(counterpart_id, "counterpart_id")?;
        let body = normalize_body(body, self.config.max_body_len)?;

        let input = SendMessageInput {
            sender_id: sender.to_string(),
            receiver_id: receiver.to_string(),
            body,
            reply_to_id: reply_to_id.map(|id| id.trim().to_string()),
        };
        input.validate_input()?;

        if let Some(target) = input.reply_to_id.as_deref() {
            self.check_reply_target(sender, receiver, target).await?;
        }

        let message = with_timeout(
            self.config.store_timeout,
            self.store.insert(NewMessage {
                sender_id: input.sender_id,
                receiver_id: input.receiver_id,
                body: input.body,
                reply_to_id: input.reply_to_id,
            }),
        )
        .await
        .map_err(|e| {
            warn!(sender_id = %sender, receiver_id = %receiver, error = %e, "Send failed");
            MessagingError::from(e)
        })?;

        info!(
            message_id = %message.id,
            sender_id = %message.sender_id,
            receiver_id = %message.receiver_id,
            reply = message.reply_to_id.is_some(),
            "Message sent"
        );
        Ok(message)
    }

    /// Flip `read` on the listed messages addressed to `current_user_id`.
    ///
    /// Messages addressed to someone else, already read, or already deleted
    /// are skipped without error, and so are blank or over-long ids. Returns
    /// the ids that actually changed. At most `MAX_MARK_READ_BATCH` ids per call.
    pub async fn mark_read(
        &self,
        message_ids: &[String],
        current_user_id: &str,
    ) -> MessagingResult<Vec<String>> {
        let reader = require_user(current_user_id)?;
        let input = MarkReadInput {
            user_id: reader.to_string(),
            message_ids: message_ids
                .iter()
                .filter(|id| !id.trim().is_empty() && id.len() <= MAX_MESSAGE_ID_LENGTH)
                .cloned()
                .collect(),
        };
        input.validate_input()?;

        if input.message_ids.is_empty() {
            return Ok(Vec::new());
        }

        // One conditional update: concurrent callers can only ever flip false -> true.
        let filter = MessageFilter::And(vec![
            MessageFilter::IdIn(input.message_ids),
            MessageFilter::ReceiverIs(input.user_id),
            MessageFilter::Unread,
        ]);
        let updated = with_timeout(
            self.config.store_timeout,
            self.store.update(&filter, MessagePatch::mark_read()),
        )
        .await?;

        let flipped: Vec<String> = updated.into_iter().map(|m| m.id).collect();
        if flipped.len() < message_ids.len() {
            debug!(
                user_id = %reader,
                requested = message_ids.len(),
                flipped = flipped.len(),
                "Skipped messages not eligible for a read receipt"
            );
        }
        Ok(flipped)
    }

    /// Permanently remove a message. Only its sender may do this.
    pub async fn delete_message(&self, message_id: &str, current_user_id: &str) -> MessagingResult<()> {
        let user = require_user(current_user_id)?;
        let input = DeleteMessageInput {
            user_id: user.to_string(),
            message_id: require_id(message_id, "message_id")?.to_string(),
        };
        input.validate_input()?;

        let existing = with_timeout(
            self.config.store_timeout,
            self.store
                .query(&MessageFilter::Id(input.message_id.clone()), Order::OldestFirst, Some(1)),
        )
        .await?;

        let Some(message) = existing.into_iter().next() else {
            return Err(MessagingError::NotFound(input.message_id));
        };

        if message.sender_id != input.user_id {
            warn!(
                message_id = %message.id,
                user_id = %user,
                "Rejected delete of a message sent by someone else"
            );
            return Err(MessagingError::Forbidden(
                "only the sender can delete a message".to_string(),
            ));
        }

        // Sender guard repeated in the filter so the delete itself can never overreach.
        let filter = MessageFilter::And(vec![
            MessageFilter::Id(input.message_id.clone()),
            MessageFilter::SenderIs(input.user_id),
        ]);
        let removed = with_timeout(self.config.store_timeout, self.store.delete(&filter)).await?;

        info!(message_id = %input.message_id, removed, "Message deleted");
        Ok(())
    }

    async fn check_reply_target(&self, sender: &str, receiver: &str, target: &str) -> MessagingResult<()> {
        let filter = MessageFilter::And(vec![
            MessageFilter::id(target),
            MessageFilter::between(sender, receiver),
        ]);
        let found = with_timeout(self.config.store_timeout, self.store.count(&filter)).await?;
        if found == 0 {
            warn!(reply_to_id = %target, sender_id = %sender, "Reply target outside conversation");
            return Err(MessagingError::InvalidReply(target.to_string()));
        }
        Ok(())
    }
}
