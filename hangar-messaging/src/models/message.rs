use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored direct message between exactly two users.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
    pub reply_to_id: Option<String>,
}

impl Message {
    /// True when the message travels between `a` and `b`, in either direction.
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender_id == a && self.receiver_id == b)
            || (self.sender_id == b && self.receiver_id == a)
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.sender_id == user_id || self.receiver_id == user_id
    }

    /// Unread and addressed to `user_id`.
    pub fn is_unread_for(&self, user_id: &str) -> bool {
        !self.read && self.receiver_id == user_id
    }
}

/// Insert payload. The store assigns `id`, `created_at` and `read = false`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub body: String,
    pub reply_to_id: Option<String>,
}

/// Column changes applied by an update. Only the read flag is mutable.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessagePatch {
    pub read: Option<bool>,
}

impl MessagePatch {
    pub fn mark_read() -> Self {
        Self { read: Some(true) }
    }

    pub fn apply(&self, message: &mut Message) {
        if let Some(read) = self.read {
            message.read = read;
        }
    }
}
