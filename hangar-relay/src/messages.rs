use hangar_messaging::models::{Conversation, Message, Thread};
use hangar_messaging::MessagingError;
use serde::{Deserialize, Serialize};

/// WebSocket frames exchanged with clients.
///
/// Requests never carry the acting user; it always comes from the
/// authenticated connection, and stray user fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WsMessage {
    // Client -> server
    #[serde(rename = "connect")]
    Connect {
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    #[serde(rename = "list_conversations")]
    ListConversations,
    #[serde(rename = "load_thread")]
    LoadThread { counterpart_id: String },
    #[serde(rename = "send")]
    Send {
        counterpart_id: String,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to_id: Option<String>,
    },
    #[serde(rename = "mark_read")]
    MarkRead { message_ids: Vec<String> },
    #[serde(rename = "delete")]
    Delete { message_id: String },
    /// Request without `count`, reply with it.
    #[serde(rename = "total_unread")]
    TotalUnread {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<u32>,
    },

    // Server -> client
    #[serde(rename = "auth_response")]
    AuthResponse { success: bool, message: String },
    #[serde(rename = "conversations")]
    Conversations { conversations: Vec<Conversation> },
    #[serde(rename = "thread")]
    Thread { thread: Thread },
    #[serde(rename = "sent")]
    Sent { message: Message },
    #[serde(rename = "marked_read")]
    MarkedRead { message_ids: Vec<String> },
    #[serde(rename = "deleted")]
    Deleted { message_id: String },
    /// Something in the user's conversations changed; re-fetch.
    #[serde(rename = "changed")]
    Changed { at: i64 },
    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        message: String,
    },
}

impl WsMessage {
    pub fn error(message: impl Into<String>) -> Self {
        WsMessage::Error {
            code: None,
            message: message.into(),
        }
    }

    /// True for frames only the server may produce.
    pub fn is_server_only(&self) -> bool {
        matches!(
            self,
            WsMessage::AuthResponse { .. }
                | WsMessage::Conversations { .. }
                | WsMessage::Thread { .. }
                | WsMessage::Sent { .. }
                | WsMessage::MarkedRead { .. }
                | WsMessage::Deleted { .. }
                | WsMessage::Changed { .. }
                | WsMessage::Error { .. }
        )
    }
}

impl From<MessagingError> for WsMessage {
    fn from(err: MessagingError) -> Self {
        let code = match &err {
            MessagingError::Unauthenticated => "unauthenticated",
            MessagingError::InvalidArgument(_) => "invalid_argument",
            MessagingError::EmptyMessage => "empty_message",
            MessagingError::Forbidden(_) => "forbidden",
            MessagingError::StoreUnavailable(_) => "store_unavailable",
            MessagingError::InvalidReply(_) => "invalid_reply",
            MessagingError::NotFound(_) => "not_found",
        };
        WsMessage::Error {
            code: Some(code.to_string()),
            message: err.to_string(),
        }
    }
}
