//! Direct-messaging core: conversation lists, threads, delivery and read
//! state, realtime change pings. Storage and identity are pluggable.

pub mod aggregator;
pub mod config;
pub mod delivery;
mod error;
pub mod hub;
pub mod identity;
pub mod models;
pub mod notifier;
pub mod refresh;
pub mod session;
pub mod store;
pub mod thread;
mod utils;

pub use aggregator::ConversationAggregator;
pub use config::{ConfigError, MessagingConfig};
pub use delivery::DeliveryManager;
pub use error::{MessagingError, MessagingResult, StoreError};
pub use identity::{Directory, IdentityProvider};
pub use notifier::{RealtimeNotifier, Subscription};
pub use refresh::{PollHandle, RefreshOutcome, Refresher};
pub use session::{Inbox, LiveConversations};
pub use thread::ThreadLoader;
pub use utils::validation::normalize_body;
