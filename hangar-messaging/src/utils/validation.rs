//! Message body normalization.

use crate::error::MessagingError;

/// Trim a message body and enforce the non-empty and length rules.
///
/// Length is counted in characters, not bytes.
pub fn normalize_body(body: &str, max_len: usize) -> Result<String, MessagingError> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(MessagingError::EmptyMessage);
    }
    let len = trimmed.chars().count();
    if len > max_len {
        return Err(MessagingError::InvalidArgument(format!(
            "Message too long ({} characters, max {})",
            len, max_len
        )));
    }
    // Newlines and tabs are fine, other control characters are not
    if trimmed
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
    {
        return Err(MessagingError::InvalidArgument(
            "Message contains invalid characters".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}
