use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use super::{ChangeKind, ChangeSubscription, MessageFilter, MessageStore, Order, StoreResult};
use crate::error::StoreError;
use crate::hub::ChangeHub;
use crate::identity::IdentityProvider;
use crate::models::{Message, MessagePatch, NewMessage, Profile};

const MESSAGE_COLUMNS: &str = "id, sender_id, receiver_id, body, created_at, read, reply_to_id";

/// SQLite-backed message table plus the member profiles it refers to.
///
/// Changes are published from the blocking task right after the write, so a
/// caller that times out on a write which still commits does not cost
/// subscribers their push.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    hub: Arc<ChangeHub>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened message database");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            hub: Arc::new(ChangeHub::new()),
        })
    }

    pub fn hub(&self) -> &ChangeHub {
        &self.hub
    }

    /// Create or refresh a member profile.
    pub async fn upsert_profile(&self, profile: Profile) -> StoreResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO profiles (id, display_name, avatar_ref, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name,
                                               avatar_ref = excluded.avatar_ref",
                (
                    &profile.id,
                    &profile.display_name,
                    &profile.avatar_ref,
                    Utc::now().timestamp_millis(),
                ),
            )?;
            Ok(())
        })
        .await
    }

    /// Run blocking SQLite work off the async executor.
    async fn with_conn<T, F>(&self, work: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| StoreError::Backend(format!("connection lock poisoned: {}", e)))?;
            work(&guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("database task failed: {}", e)))?
    }
}

fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        -- Member profiles (snapshot of the identity provider)
        CREATE TABLE IF NOT EXISTS profiles (
            id TEXT PRIMARY KEY,
            display_name TEXT,
            avatar_ref TEXT,
            created_at INTEGER NOT NULL
        );

        -- Direct messages
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            sender_id TEXT NOT NULL,
            receiver_id TEXT NOT NULL,
            body TEXT NOT NULL CHECK(length(body) > 0),
            created_at INTEGER NOT NULL,
            read INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_messages_pair ON messages(sender_id, receiver_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_messages_inbox ON messages(receiver_id, read);
        ",
    )?;

    // Migration: replies were added after the first message tables shipped
    let has_reply_to: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM pragma_table_info('messages') WHERE name = 'reply_to_id'",
            [],
            |row| row.get::<_, i32>(0),
        )
        .map(|count| count > 0)
        .unwrap_or(false);

    if !has_reply_to {
        conn.execute("ALTER TABLE messages ADD COLUMN reply_to_id TEXT", [])?;
        debug!("Added reply_to_id column to messages");
    }

    Ok(())
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let created_ms: i64 = row.get(4)?;
    let created_at = DateTime::<Utc>::from_timestamp_millis(created_ms)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(4, created_ms))?;
    Ok(Message {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        receiver_id: row.get(2)?,
        body: row.get(3)?,
        created_at,
        read: row.get::<_, i32>(5)? == 1,
        reply_to_id: row.get(6)?,
    })
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<Profile> {
    Ok(Profile {
        id: row.get(0)?,
        display_name: row.get(1)?,
        avatar_ref: row.get(2)?,
    })
}

fn select_messages(
    conn: &Connection,
    filter: &MessageFilter,
    order: Order,
    limit: Option<usize>,
) -> StoreResult<Vec<Message>> {
    let mut params = Vec::new();
    let clause = filter.to_sql(&mut params);
    let direction = match order {
        Order::OldestFirst => "ASC",
        Order::NewestFirst => "DESC",
    };
    let mut sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE {clause}
         ORDER BY created_at {direction}, rowid {direction}"
    );
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {}", limit));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(params.iter()), message_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn query(
        &self,
        filter: &MessageFilter,
        order: Order,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Message>> {
        let filter = filter.clone();
        self.with_conn(move |conn| select_messages(conn, &filter, order, limit))
            .await
    }

    async fn count(&self, filter: &MessageFilter) -> StoreResult<usize> {
        let filter = filter.clone();
        self.with_conn(move |conn| {
            let mut params = Vec::new();
            let clause = filter.to_sql(&mut params);
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM messages WHERE {clause}"),
                params_from_iter(params.iter()),
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    async fn insert(&self, row: NewMessage) -> StoreResult<Message> {
        let hub = self.hub.clone();
        self.with_conn(move |conn| {
            // Server clock, nudged forward so timestamps strictly increase.
            let latest: Option<i64> =
                conn.query_row("SELECT MAX(created_at) FROM messages", [], |r| r.get(0))?;
            let now_ms = Utc::now().timestamp_millis();
            let created_ms = match latest {
                Some(latest) if latest >= now_ms => latest + 1,
                _ => now_ms,
            };
            let created_at = DateTime::<Utc>::from_timestamp_millis(created_ms)
                .ok_or_else(|| StoreError::Backend(format!("bad timestamp {}", created_ms)))?;

            let message = Message {
                id: uuid::Uuid::new_v4().to_string(),
                sender_id: row.sender_id,
                receiver_id: row.receiver_id,
                body: row.body,
                created_at,
                read: false,
                reply_to_id: row.reply_to_id,
            };
            conn.execute(
                "INSERT INTO messages (id, sender_id, receiver_id, body, created_at, read, reply_to_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
                (
                    &message.id,
                    &message.sender_id,
                    &message.receiver_id,
                    &message.body,
                    created_ms,
                    &message.reply_to_id,
                ),
            )?;
            hub.publish(ChangeKind::Insert, &message);
            Ok(message)
        })
        .await
    }

    async fn update(&self, filter: &MessageFilter, patch: MessagePatch) -> StoreResult<Vec<Message>> {
        let filter = filter.clone();
        let hub = self.hub.clone();
        self.with_conn(move |conn| {
            let Some(read) = patch.read else {
                return select_messages(conn, &filter, Order::OldestFirst, None);
            };
            let mut params = Vec::new();
            let clause = filter.to_sql(&mut params);
            let sql = format!(
                "UPDATE messages SET read = {} WHERE {clause} RETURNING {MESSAGE_COLUMNS}",
                if read { 1 } else { 0 }
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), message_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for message in &rows {
                hub.publish(ChangeKind::Update, message);
            }
            Ok(rows)
        })
        .await
    }

    async fn delete(&self, filter: &MessageFilter) -> StoreResult<usize> {
        let filter = filter.clone();
        let hub = self.hub.clone();
        self.with_conn(move |conn| {
            let mut params = Vec::new();
            let clause = filter.to_sql(&mut params);
            let sql = format!("DELETE FROM messages WHERE {clause} RETURNING {MESSAGE_COLUMNS}");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(params.iter()), message_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for message in &rows {
                hub.publish(ChangeKind::Delete, message);
            }
            Ok(rows.len())
        })
        .await
    }

    fn subscribe(&self, filter: MessageFilter) -> StoreResult<ChangeSubscription> {
        self.hub.subscribe(filter)
    }
}

#[async_trait]
impl IdentityProvider for SqliteStore {
    async fn list_other_users(&self, excluding_id: &str) -> Result<Vec<Profile>, StoreError> {
        let excluding_id = excluding_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, display_name, avatar_ref FROM profiles
                 WHERE id != ?1
                 ORDER BY display_name COLLATE NOCASE, id",
            )?;
            let profiles = stmt
                .query_map([&excluding_id], profile_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(profiles)
        })
        .await
    }

    async fn get_user(&self, id: &str) -> Result<Option<Profile>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let profile = conn
                .query_row(
                    "SELECT id, display_name, avatar_ref FROM profiles WHERE id = ?1",
                    [&id],
                    profile_from_row,
                )
                .optional()?;
            Ok(profile)
        })
        .await
    }

    async fn get_users(&self, ids: &[String]) -> Result<HashMap<String, Profile>, StoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT id, display_name, avatar_ref FROM profiles WHERE id IN ({})",
                placeholders.join(", ")
            );
            let mut stmt = conn.prepare(&sql)?;
            let profiles = stmt
                .query_map(params_from_iter(ids.iter()), profile_from_row)?
                .map(|r| r.map(|p| (p.id.clone(), p)))
                .collect::<rusqlite::Result<HashMap<_, _>>>()?;
            Ok(profiles)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn new_message(from: &str, to: &str, body: &str) -> NewMessage {
        NewMessage {
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            body: body.to_string(),
            reply_to_id: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_query_pair() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(new_message("a", "b", "one")).await.unwrap();
        store.insert(new_message("b", "a", "two")).await.unwrap();
        store.insert(new_message("a", "c", "elsewhere")).await.unwrap();

        let rows = store
            .query(&MessageFilter::between("a", "b"), Order::OldestFirst, None)
            .await
            .unwrap();
        let bodies: Vec<&str> = rows.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["one", "two"]);

        let newest = store
            .query(&MessageFilter::between("b", "a"), Order::NewestFirst, Some(1))
            .await
            .unwrap();
        assert_eq!(newest[0].body, "two");
    }

    #[tokio::test]
    async fn test_update_returns_only_flipped_rows() {
        let store = SqliteStore::open_in_memory().unwrap();
        let m1 = store.insert(new_message("a", "b", "one")).await.unwrap();
        let m2 = store.insert(new_message("b", "a", "two")).await.unwrap();

        let filter = MessageFilter::And(vec![
            MessageFilter::IdIn(vec![m1.id.clone(), m2.id.clone()]),
            MessageFilter::ReceiverIs("b".to_string()),
            MessageFilter::Unread,
        ]);
        let updated = store.update(&filter, MessagePatch::mark_read()).await.unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].id, m1.id);
        assert!(updated[0].read);

        let again = store.update(&filter, MessagePatch::mark_read()).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(store.count(&MessageFilter::unread_from("b", "a")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_publishes_and_counts() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut sub = store.subscribe(MessageFilter::involving("a")).unwrap();
        let msg = store.insert(new_message("a", "b", "bye")).await.unwrap();
        assert_eq!(sub.recv().await.unwrap().kind, ChangeKind::Insert);

        assert_eq!(store.delete(&MessageFilter::id(&msg.id)).await.unwrap(), 1);
        let event = sub.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Delete);
        assert_eq!(event.message_id, msg.id);
        assert_eq!(store.delete(&MessageFilter::id(&msg.id)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_insert_still_notifies() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut sub = store.subscribe(MessageFilter::involving("b")).unwrap();

        // Park the blocking insert behind the connection lock until the caller gives up
        let held = store.conn.lock().unwrap();
        let result = crate::store::with_timeout(
            Duration::from_millis(50),
            store.insert(new_message("a", "b", "late")),
        )
        .await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
        drop(held);

        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("no change event for the committed insert")
            .unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(store.count(&MessageFilter::All).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reply_reference_round_trips() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store.insert(new_message("a", "b", "Merhaba")).await.unwrap();
        let reply = store
            .insert(NewMessage {
                reply_to_id: Some(first.id.clone()),
                ..new_message("a", "b", "Nasılsın?")
            })
            .await
            .unwrap();

        let rows = store
            .query(&MessageFilter::id(&reply.id), Order::OldestFirst, None)
            .await
            .unwrap();
        assert_eq!(rows[0].reply_to_id.as_deref(), Some(first.id.as_str()));
        assert!(rows[0].created_at >= first.created_at);
    }

    #[tokio::test]
    async fn test_profiles_listing_sorted_by_name() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_profile(Profile::new("u2", "zeynep")).await.unwrap();
        store.upsert_profile(Profile::new("u1", "Ahmet")).await.unwrap();
        store.upsert_profile(Profile::new("me", "Me")).await.unwrap();

        let others = store.list_other_users("me").await.unwrap();
        let ids: Vec<&str> = others.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["u1", "u2"]);

        store
            .upsert_profile(Profile::new("u1", "Ahmet Y.").with_avatar("a.png"))
            .await
            .unwrap();
        let found = store.get_users(&["u1".to_string(), "ghost".to_string()]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["u1"].avatar_ref.as_deref(), Some("a.png"));
        assert!(store.get_user("ghost").await.unwrap().is_none());
    }
}
