//! Input DTOs with garde validation for the write operations.
//!
//! These structs validate caller data before anything reaches the store.

use garde::Validate;
use serde::Deserialize;

use crate::error::MessagingError;

/// Validation constants
pub const MAX_USER_ID_LENGTH: usize = 128;
pub const MAX_MESSAGE_ID_LENGTH: usize = 128;
pub const MAX_MARK_READ_BATCH: usize = 1000;

/// Input for sending a message. `body` is expected to be trimmed already.
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct SendMessageInput {
    #[garde(length(min = 1, max = MAX_USER_ID_LENGTH))]
    pub sender_id: String,
    #[garde(length(min = 1, max = MAX_USER_ID_LENGTH))]
    pub receiver_id: String,
    #[garde(length(min = 1))]
    pub body: String,
    #[garde(length(min = 1, max = MAX_MESSAGE_ID_LENGTH))]
    pub reply_to_id: Option<String>,
}

/// Input for marking messages as read
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct MarkReadInput {
    #[garde(length(min = 1, max = MAX_USER_ID_LENGTH))]
    pub user_id: String,
    #[garde(length(max = MAX_MARK_READ_BATCH), inner(length(min = 1, max = MAX_MESSAGE_ID_LENGTH)))]
    pub message_ids: Vec<String>,
}

/// Input for deleting a message
#[derive(Debug, Deserialize, Validate)]
#[garde(context(()))]
pub struct DeleteMessageInput {
    #[garde(length(min = 1, max = MAX_USER_ID_LENGTH))]
    pub user_id: String,
    #[garde(length(min = 1, max = MAX_MESSAGE_ID_LENGTH))]
    pub message_id: String,
}

/// Helper trait to turn garde reports into `InvalidArgument`
pub trait ValidateExt {
    fn validate_input(&self) -> Result<(), MessagingError>;
}

impl<T: Validate<Context = ()>> ValidateExt for T {
    fn validate_input(&self) -> Result<(), MessagingError> {
        self.validate()
            .map_err(|e| MessagingError::InvalidArgument(e.to_string()))
    }
}
