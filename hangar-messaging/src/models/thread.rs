use serde::{Deserialize, Serialize};

use super::message::Message;
use super::profile::Profile;

/// The message a reply points at, with its author.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ReplyPreview {
    pub message: Message,
    pub sender: Option<Profile>,
}

/// A thread entry enriched with sender identity and reply context.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ThreadMessage {
    pub message: Message,
    pub sender: Option<Profile>,
    pub reply_to: Option<ReplyPreview>,
}

/// Loaded window of a conversation, oldest message first.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Thread {
    pub counterpart_id: String,
    pub messages: Vec<ThreadMessage>,
    /// Ids flipped to read as part of loading this window.
    pub marked_read: Vec<String>,
}

impl Thread {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ThreadMessage> {
        self.messages.last()
    }

    pub fn find(&self, message_id: &str) -> Option<&ThreadMessage> {
        self.messages.iter().find(|m| m.message.id == message_id)
    }
}
