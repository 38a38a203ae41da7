use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{ChangeKind, ChangeSubscription, MessageFilter, MessageStore, Order, StoreResult};
use crate::error::StoreError;
use crate::hub::ChangeHub;
use crate::models::{Message, MessagePatch, NewMessage};

#[derive(Default)]
struct Table {
    /// Insertion order doubles as the tie-breaker for equal timestamps.
    rows: Vec<Message>,
    last_created: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Faults {
    offline: bool,
    failing_users: HashSet<String>,
    latency: Option<Duration>,
}

/// Message table held in process memory.
///
/// Besides serving tests and embedded use it can simulate outages: the whole
/// store going offline, calls touching a given user failing, or slow calls.
#[derive(Default)]
pub struct MemoryStore {
    table: Mutex<Table>,
    faults: Mutex<Faults>,
    hub: ChangeHub,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hub(&self) -> &ChangeHub {
        &self.hub
    }

    /// Insert a fully formed row as-is (imports and fixtures). No change event.
    pub fn seed(&self, message: Message) -> StoreResult<()> {
        let mut table = self.table()?;
        table.last_created = Some(match table.last_created {
            Some(last) if last > message.created_at => last,
            _ => message.created_at,
        });
        table.rows.push(message);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.table().map(|t| t.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.offline = offline;
        }
    }

    /// Make every call whose filter or row names `user_id` fail.
    pub fn fail_calls_for(&self, user_id: &str) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.failing_users.insert(user_id.to_string());
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            *faults = Faults::default();
        }
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.latency = latency;
        }
    }

    fn table(&self) -> StoreResult<MutexGuard<'_, Table>> {
        self.table
            .lock()
            .map_err(|e| StoreError::Backend(format!("message table lock poisoned: {}", e)))
    }

    async fn check_faults(&self, mentioned: &[&str]) -> StoreResult<()> {
        let (offline, failing, latency) = {
            let faults = self
                .faults
                .lock()
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            let failing = mentioned
                .iter()
                .find(|user| faults.failing_users.contains(**user))
                .map(|user| user.to_string());
            (faults.offline, failing, faults.latency)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if offline {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        if let Some(user) = failing {
            return Err(StoreError::Unavailable(format!("calls for {} are failing", user)));
        }
        Ok(())
    }

    async fn check_filter(&self, filter: &MessageFilter) -> StoreResult<()> {
        let failing: Vec<String> = self
            .faults
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .failing_users
            .iter()
            .filter(|user| filter.mentions(user))
            .cloned()
            .collect();
        let mentioned: Vec<&str> = failing.iter().map(String::as_str).collect();
        self.check_faults(&mentioned).await
    }
}

/// Server clock that always moves forward, even when the wall clock does not.
fn next_timestamp(last: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match last {
        Some(last) if last >= now => last + chrono::Duration::microseconds(1),
        _ => now,
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn query(
        &self,
        filter: &MessageFilter,
        order: Order,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Message>> {
        self.check_filter(filter).await?;

        let table = self.table()?;
        let mut rows: Vec<Message> = table
            .rows
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        drop(table);

        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if order == Order::NewestFirst {
            rows.reverse();
        }
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn count(&self, filter: &MessageFilter) -> StoreResult<usize> {
        self.check_filter(filter).await?;
        let table = self.table()?;
        Ok(table.rows.iter().filter(|m| filter.matches(m)).count())
    }

    async fn insert(&self, row: NewMessage) -> StoreResult<Message> {
        self.check_faults(&[row.sender_id.as_str(), row.receiver_id.as_str()])
            .await?;

        let message = {
            let mut table = self.table()?;
            let created_at = next_timestamp(table.last_created);
            table.last_created = Some(created_at);
            let message = Message {
                id: uuid::Uuid::new_v4().to_string(),
                sender_id: row.sender_id,
                receiver_id: row.receiver_id,
                body: row.body,
                created_at,
                read: false,
                reply_to_id: row.reply_to_id,
            };
            table.rows.push(message.clone());
            message
        };

        debug!(message_id = %message.id, "Inserted message");
        self.hub.publish(ChangeKind::Insert, &message);
        Ok(message)
    }

    async fn update(&self, filter: &MessageFilter, patch: MessagePatch) -> StoreResult<Vec<Message>> {
        self.check_filter(filter).await?;

        let updated: Vec<Message> = {
            let mut table = self.table()?;
            table
                .rows
                .iter_mut()
                .filter(|m| filter.matches(m))
                .map(|m| {
                    patch.apply(m);
                    m.clone()
                })
                .collect()
        };

        for message in &updated {
            self.hub.publish(ChangeKind::Update, message);
        }
        Ok(updated)
    }

    async fn delete(&self, filter: &MessageFilter) -> StoreResult<usize> {
        self.check_filter(filter).await?;

        let removed: Vec<Message> = {
            let mut table = self.table()?;
            let (removed, kept): (Vec<Message>, Vec<Message>) =
                table.rows.drain(..).partition(|m| filter.matches(m));
            table.rows = kept;
            removed
        };

        for message in &removed {
            self.hub.publish(ChangeKind::Delete, message);
        }
        Ok(removed.len())
    }

    fn subscribe(&self, filter: MessageFilter) -> StoreResult<ChangeSubscription> {
        self.hub.subscribe(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn new_message(from: &str, to: &str, body: &str) -> NewMessage {
        NewMessage {
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            body: body.to_string(),
            reply_to_id: None,
        }
    }

    #[tokio::test]
    async fn test_insert_assigns_id_and_unread() {
        let store = MemoryStore::new();
        let msg = store.insert(new_message("a", "b", "hi")).await.unwrap();
        assert!(!msg.id.is_empty());
        assert!(!msg.read);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_timestamps_never_go_backwards() {
        let store = MemoryStore::new();
        let future = Utc::now() + chrono::Duration::hours(1);
        store
            .seed(Message {
                id: "old".to_string(),
                sender_id: "a".to_string(),
                receiver_id: "b".to_string(),
                body: "from the future".to_string(),
                created_at: future,
                read: false,
                reply_to_id: None,
            })
            .unwrap();

        let msg = store.insert(new_message("a", "b", "later")).await.unwrap();
        assert!(msg.created_at >= future);
    }

    #[tokio::test]
    async fn test_equal_timestamps_keep_insertion_order() {
        let store = MemoryStore::new();
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        for id in ["first", "second", "third"] {
            store
                .seed(Message {
                    id: id.to_string(),
                    sender_id: "a".to_string(),
                    receiver_id: "b".to_string(),
                    body: id.to_string(),
                    created_at: ts,
                    read: false,
                    reply_to_id: None,
                })
                .unwrap();
        }

        let asc = store
            .query(&MessageFilter::All, Order::OldestFirst, None)
            .await
            .unwrap();
        let ids: Vec<&str> = asc.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);

        let newest = store
            .query(&MessageFilter::All, Order::NewestFirst, Some(1))
            .await
            .unwrap();
        assert_eq!(newest[0].id, "third");
    }

    #[tokio::test]
    async fn test_update_and_delete_publish_events() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(MessageFilter::involving("b")).unwrap();

        let msg = store.insert(new_message("a", "b", "hi")).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().kind, ChangeKind::Insert);

        let updated = store
            .update(&MessageFilter::id(&msg.id), MessagePatch::mark_read())
            .await
            .unwrap();
        assert!(updated[0].read);
        assert_eq!(sub.recv().await.unwrap().kind, ChangeKind::Update);

        assert_eq!(store.delete(&MessageFilter::id(&msg.id)).await.unwrap(), 1);
        assert_eq!(sub.recv().await.unwrap().kind, ChangeKind::Delete);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryStore::new();
        store.insert(new_message("a", "b", "hi")).await.unwrap();

        store.fail_calls_for("b");
        assert!(store.count(&MessageFilter::between("a", "b")).await.is_err());
        assert_eq!(store.count(&MessageFilter::involving("a")).await.unwrap(), 1);

        store.clear_faults();
        store.set_offline(true);
        assert!(matches!(
            store.query(&MessageFilter::All, Order::OldestFirst, None).await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
