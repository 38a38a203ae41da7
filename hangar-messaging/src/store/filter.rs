use serde::{Deserialize, Serialize};

use crate::models::Message;

/// Typed row predicate understood by every store adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageFilter {
    All,
    Id(String),
    IdIn(Vec<String>),
    SenderIs(String),
    ReceiverIs(String),
    Unread,
    /// Messages between two users, either direction.
    Between(String, String),
    /// Messages the user sent or received.
    Involving(String),
    And(Vec<MessageFilter>),
}

impl MessageFilter {
    pub fn between(a: &str, b: &str) -> Self {
        MessageFilter::Between(a.to_string(), b.to_string())
    }

    pub fn involving(user_id: &str) -> Self {
        MessageFilter::Involving(user_id.to_string())
    }

    pub fn id(message_id: &str) -> Self {
        MessageFilter::Id(message_id.to_string())
    }

    /// Unread messages from `sender_id` to `receiver_id`.
    pub fn unread_from(sender_id: &str, receiver_id: &str) -> Self {
        MessageFilter::And(vec![
            MessageFilter::SenderIs(sender_id.to_string()),
            MessageFilter::ReceiverIs(receiver_id.to_string()),
            MessageFilter::Unread,
        ])
    }

    pub fn matches(&self, message: &Message) -> bool {
        match self {
            MessageFilter::All => true,
            MessageFilter::Id(id) => &message.id == id,
            MessageFilter::IdIn(ids) => ids.iter().any(|id| id == &message.id),
            MessageFilter::SenderIs(id) => &message.sender_id == id,
            MessageFilter::ReceiverIs(id) => &message.receiver_id == id,
            MessageFilter::Unread => !message.read,
            MessageFilter::Between(a, b) => message.is_between(a, b),
            MessageFilter::Involving(id) => message.involves(id),
            MessageFilter::And(parts) => parts.iter().all(|f| f.matches(message)),
        }
    }

    /// True when the predicate names `user_id` as sender, receiver or pair member.
    pub fn mentions(&self, user_id: &str) -> bool {
        match self {
            MessageFilter::SenderIs(id) | MessageFilter::ReceiverIs(id) | MessageFilter::Involving(id) => {
                id == user_id
            }
            MessageFilter::Between(a, b) => a == user_id || b == user_id,
            MessageFilter::And(parts) => parts.iter().any(|f| f.mentions(user_id)),
            MessageFilter::All | MessageFilter::Id(_) | MessageFilter::IdIn(_) | MessageFilter::Unread => false,
        }
    }

    /// Render as a SQL boolean expression over the `messages` table,
    /// pushing bound values onto `params` in placeholder order.
    pub(crate) fn to_sql(&self, params: &mut Vec<String>) -> String {
        match self {
            MessageFilter::All => "1 = 1".to_string(),
            MessageFilter::Id(id) => {
                params.push(id.clone());
                format!("id = ?{}", params.len())
            }
            MessageFilter::IdIn(ids) => {
                if ids.is_empty() {
                    return "1 = 0".to_string();
                }
                let placeholders: Vec<String> = ids
                    .iter()
                    .map(|id| {
                        params.push(id.clone());
                        format!("?{}", params.len())
                    })
                    .collect();
                format!("id IN ({})", placeholders.join(", "))
            }
            MessageFilter::SenderIs(id) => {
                params.push(id.clone());
                format!("sender_id = ?{}", params.len())
            }
            MessageFilter::ReceiverIs(id) => {
                params.push(id.clone());
                format!("receiver_id = ?{}", params.len())
            }
            MessageFilter::Unread => "read = 0".to_string(),
            MessageFilter::Between(a, b) => {
                params.push(a.clone());
                let pa = params.len();
                params.push(b.clone());
                let pb = params.len();
                format!(
                    "((sender_id = ?{pa} AND receiver_id = ?{pb}) OR (sender_id = ?{pb} AND receiver_id = ?{pa}))"
                )
            }
            MessageFilter::Involving(id) => {
                params.push(id.clone());
                let p = params.len();
                format!("(sender_id = ?{p} OR receiver_id = ?{p})")
            }
            MessageFilter::And(parts) => {
                if parts.is_empty() {
                    return "1 = 1".to_string();
                }
                let clauses: Vec<String> = parts.iter().map(|f| f.to_sql(params)).collect();
                format!("({})", clauses.join(" AND "))
            }
        }
    }
}
