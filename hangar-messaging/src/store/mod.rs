//! Message store adapter: the persistence seam of the messaging core.
//!
//! The core talks to the message table only through [`MessageStore`]. Profiles
//! live behind [`crate::identity::IdentityProvider`].

mod filter;
mod memory;
mod sqlite;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::hub::SubscriptionGuard;
use crate::models::{Message, MessagePatch, NewMessage};

pub use filter::MessageFilter;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Sort order on `created_at`; ties always fall back to insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    OldestFirst,
    NewestFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A row-level change on the message table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub message_id: String,
    pub sender_id: String,
    pub receiver_id: String,
}

impl ChangeEvent {
    pub fn for_message(kind: ChangeKind, message: &Message) -> Self {
        Self {
            kind,
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
        }
    }
}

/// Live change feed. Dropping it unsubscribes.
pub struct ChangeSubscription {
    pub(crate) events: mpsc::UnboundedReceiver<ChangeEvent>,
    pub(crate) _guard: SubscriptionGuard,
}

impl ChangeSubscription {
    /// Next event, or `None` once the channel closed.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.events.try_recv().ok()
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn query(
        &self,
        filter: &MessageFilter,
        order: Order,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Message>>;

    /// Number of matching rows without fetching them.
    async fn count(&self, filter: &MessageFilter) -> StoreResult<usize> {
        Ok(self.query(filter, Order::OldestFirst, None).await?.len())
    }

    async fn insert(&self, row: NewMessage) -> StoreResult<Message>;

    /// Apply `patch` to every matching row; returns the affected rows as updated.
    async fn update(&self, filter: &MessageFilter, patch: MessagePatch) -> StoreResult<Vec<Message>>;

    /// Remove every matching row; returns how many were removed.
    async fn delete(&self, filter: &MessageFilter) -> StoreResult<usize>;

    fn subscribe(&self, filter: MessageFilter) -> StoreResult<ChangeSubscription>;
}

/// Run a store call with an upper bound, mapping expiry to [`StoreError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
