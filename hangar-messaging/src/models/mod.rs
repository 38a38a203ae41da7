mod conversation;
pub mod input;
mod message;
mod profile;
mod thread;

pub use conversation::{Conversation, MAX_BADGE_COUNT};
pub use message::{Message, MessagePatch, NewMessage};
pub use profile::Profile;
pub use thread::{ReplyPreview, Thread, ThreadMessage};
