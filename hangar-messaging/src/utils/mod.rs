mod helpers;
pub mod validation;

pub use helpers::{require_id, require_user, unique_sender_ids};
