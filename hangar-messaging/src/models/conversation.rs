use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::profile::Profile;

/// Counts above this render as "99+".
pub const MAX_BADGE_COUNT: u32 = 99;

/// Derived view of the messages exchanged with one counterpart.
///
/// Built fresh by the aggregator on every listing; never persisted.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub counterpart: Profile,
    pub last_message: Option<String>,
    pub last_message_time: Option<DateTime<Utc>>,
    /// `None` only when the unread sub-query failed.
    pub unread_count: Option<u32>,
    /// Set when any sub-query for this counterpart failed.
    pub degraded: bool,
}

impl Conversation {
    pub fn empty(counterpart: Profile) -> Self {
        Self {
            counterpart,
            last_message: None,
            last_message_time: None,
            unread_count: Some(0),
            degraded: false,
        }
    }

    pub fn has_unread(&self) -> bool {
        self.unread_count.unwrap_or(0) > 0
    }

    /// Unread badge text, `None` when there is nothing to show.
    pub fn badge(&self) -> Option<String> {
        match self.unread_count {
            None | Some(0) => None,
            Some(n) if n > MAX_BADGE_COUNT => Some(format!("{}+", MAX_BADGE_COUNT)),
            Some(n) => Some(n.to_string()),
        }
    }
}
