use crate::error::MessagingError;
use crate::models::Message;

/// The authenticated user, or `Unauthenticated` when there is none.
pub fn require_user(user_id: &str) -> Result<&str, MessagingError> {
    let trimmed = user_id.trim();
    if trimmed.is_empty() {
        Err(MessagingError::Unauthenticated)
    } else {
        Ok(trimmed)
    }
}

/// A required identifier argument, or `InvalidArgument` naming it.
pub fn require_id<'a>(value: &'a str, name: &str) -> Result<&'a str, MessagingError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(MessagingError::InvalidArgument(format!("{} is required", name)))
    } else {
        Ok(trimmed)
    }
}

/// Distinct sender ids in first-seen order.
pub fn unique_sender_ids(messages: &[Message]) -> Vec<String> {
    let mut seen = Vec::new();
    for message in messages {
        if !seen.contains(&message.sender_id) {
            seen.push(message.sender_id.clone());
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_require_user() {
        assert_eq!(require_user(""), Err(MessagingError::Unauthenticated));
        assert_eq!(require_user("  "), Err(MessagingError::Unauthenticated));
        assert_eq!(require_user(" u1 "), Ok("u1"));
    }

    #[test]
    fn test_require_id_names_the_argument() {
        match require_id("", "counterpart_id") {
            Err(MessagingError::InvalidArgument(msg)) => assert!(msg.contains("counterpart_id")),
            other => panic!("Expected InvalidArgument, got {:?}", other),
        }
    }

    #[test]
    fn test_unique_sender_ids_keeps_first_seen_order() {
        let make = |sender: &str| Message {
            id: sender.to_string(),
            sender_id: sender.to_string(),
            receiver_id: "x".to_string(),
            body: "b".to_string(),
            created_at: Utc::now(),
            read: false,
            reply_to_id: None,
        };
        let messages = vec![make("b"), make("a"), make("b")];
        assert_eq!(unique_sender_ids(&messages), vec!["b", "a"]);
    }
}
