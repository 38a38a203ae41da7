//! End-to-end flows through the messaging core
//!
//! Every scenario runs against both the in-memory store and an in-memory
//! SQLite database, so the two backends are held to the same behavior.

use std::sync::Arc;

use hangar_messaging::models::Profile;
use hangar_messaging::store::{MemoryStore, MessageFilter, MessageStore, Order, SqliteStore};
use hangar_messaging::{
    ConversationAggregator, DeliveryManager, Directory, IdentityProvider, MessagingConfig,
    MessagingError, ThreadLoader,
};

struct Harness {
    store: Arc<dyn MessageStore>,
    aggregator: ConversationAggregator,
    delivery: Arc<DeliveryManager>,
    threads: ThreadLoader,
}

impl Harness {
    fn new(store: Arc<dyn MessageStore>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self::with_config(store, identity, MessagingConfig::default())
    }

    fn with_config(
        store: Arc<dyn MessageStore>,
        identity: Arc<dyn IdentityProvider>,
        config: MessagingConfig,
    ) -> Self {
        let delivery = Arc::new(DeliveryManager::new(store.clone(), config.clone()));
        Self {
            aggregator: ConversationAggregator::new(store.clone(), identity.clone(), config.clone()),
            threads: ThreadLoader::new(store.clone(), identity, delivery.clone(), config),
            delivery,
            store,
        }
    }

    async fn unread(&self, user: &str, counterpart: &str) -> Option<u32> {
        self.aggregator
            .list_conversations(user)
            .await
            .unwrap()
            .into_iter()
            .find(|c| c.counterpart.id == counterpart)
            .and_then(|c| c.unread_count)
    }

    async fn is_read(&self, message_id: &str) -> bool {
        self.store
            .query(&MessageFilter::id(message_id), Order::OldestFirst, Some(1))
            .await
            .unwrap()[0]
            .read
    }
}

fn people() -> Vec<Profile> {
    vec![
        Profile::new("A", "Ayşe"),
        Profile::new("B", "Burak"),
        Profile::new("C", "Canan"),
    ]
}

fn memory_harness() -> Harness {
    Harness::new(
        Arc::new(MemoryStore::new()),
        Arc::new(Directory::with_profiles(people())),
    )
}

async fn sqlite_harness() -> Harness {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    for profile in people() {
        store.upsert_profile(profile).await.unwrap();
    }
    Harness::new(store.clone(), store)
}

async fn both() -> Vec<(&'static str, Harness)> {
    vec![("memory", memory_harness()), ("sqlite", sqlite_harness().await)]
}

#[tokio::test]
async fn test_first_message_shows_up_for_both_sides() {
    for (backend, h) in both().await {
        h.delivery.send("A", "B", "Merhaba", None).await.unwrap();

        let for_a = h.aggregator.list_conversations("A").await.unwrap();
        let b = for_a.iter().find(|c| c.counterpart.id == "B").unwrap();
        assert_eq!(b.last_message.as_deref(), Some("Merhaba"), "{}", backend);
        assert_eq!(b.unread_count, Some(0), "{}", backend);
        // Most recent activity first
        assert_eq!(for_a[0].counterpart.id, "B", "{}", backend);

        let for_b = h.aggregator.list_conversations("B").await.unwrap();
        let a = for_b.iter().find(|c| c.counterpart.id == "A").unwrap();
        assert_eq!(a.last_message.as_deref(), Some("Merhaba"), "{}", backend);
        assert_eq!(a.unread_count, Some(1), "{}", backend);
        assert_eq!(h.aggregator.total_unread("B").await.unwrap(), 1, "{}", backend);
    }
}

#[tokio::test]
async fn test_opening_thread_clears_unread() {
    for (backend, h) in both().await {
        let first = h.delivery.send("A", "B", "Merhaba", None).await.unwrap();

        let thread = h.threads.load_thread("B", "A").await.unwrap();
        assert_eq!(thread.len(), 1, "{}", backend);
        assert_eq!(thread.marked_read, vec![first.id.clone()], "{}", backend);
        assert_eq!(h.unread("B", "A").await, Some(0), "{}", backend);
        assert!(h.is_read(&first.id).await, "{}", backend);
    }
}

#[tokio::test]
async fn test_opening_long_thread_clears_every_unread() {
    let config = MessagingConfig {
        thread_limit: 1500,
        ..MessagingConfig::default()
    };
    let sqlite = Arc::new(SqliteStore::open_in_memory().unwrap());
    let backends: Vec<(&str, Harness)> = vec![
        (
            "memory",
            Harness::with_config(
                Arc::new(MemoryStore::new()),
                Arc::new(Directory::with_profiles(people())),
                config.clone(),
            ),
        ),
        ("sqlite", Harness::with_config(sqlite.clone(), sqlite, config)),
    ];

    for (backend, h) in backends {
        for i in 0..1001 {
            h.delivery.send("B", "A", &format!("#{}", i), None).await.unwrap();
        }

        let thread = h.threads.load_thread("A", "B").await.unwrap();
        assert_eq!(thread.len(), 1001, "{}", backend);
        assert_eq!(thread.marked_read.len(), 1001, "{}", backend);
        assert_eq!(
            h.store.count(&MessageFilter::unread_from("B", "A")).await.unwrap(),
            0,
            "{}",
            backend
        );
    }
}

#[tokio::test]
async fn test_reply_then_delete_leaves_dangling_reference() {
    for (backend, h) in both().await {
        let first = h.delivery.send("A", "B", "Merhaba", None).await.unwrap();
        let reply = h
            .delivery
            .send("A", "B", "Nasılsın?", Some(&first.id))
            .await
            .unwrap();

        let thread = h.threads.load_thread("A", "B").await.unwrap();
        assert_eq!(thread.len(), 2, "{}", backend);
        let second = &thread.messages[1];
        assert_eq!(second.message.id, reply.id, "{}", backend);
        assert_eq!(
            second.reply_to.as_ref().map(|r| r.message.id.as_str()),
            Some(first.id.as_str()),
            "{}",
            backend
        );

        h.delivery.delete_message(&first.id, "A").await.unwrap();
        let thread = h.threads.load_thread("B", "A").await.unwrap();
        assert_eq!(thread.len(), 1, "{}", backend);
        assert_eq!(thread.messages[0].message.body, "Nasılsın?", "{}", backend);
        assert!(thread.messages[0].reply_to.is_none(), "{}", backend);
    }
}

#[tokio::test]
async fn test_uninvolved_reader_changes_nothing() {
    for (backend, h) in both().await {
        let msg = h.delivery.send("A", "B", "Merhaba", None).await.unwrap();
        let flipped = h.delivery.mark_read(&[msg.id.clone()], "C").await.unwrap();
        assert!(flipped.is_empty(), "{}", backend);
        assert!(!h.is_read(&msg.id).await, "{}", backend);
        assert_eq!(h.unread("B", "A").await, Some(1), "{}", backend);
    }
}

#[tokio::test]
async fn test_single_counterpart_failure_degrades_entry() {
    let store = Arc::new(MemoryStore::new());
    let h = Harness::new(store.clone(), Arc::new(Directory::with_profiles(people())));
    h.delivery.send("B", "A", "Merhaba", None).await.unwrap();
    h.delivery.send("C", "A", "Selam", None).await.unwrap();

    store.fail_calls_for("C");
    let list = h.aggregator.list_conversations("A").await.unwrap();
    assert_eq!(list.len(), 2);

    let b = list.iter().find(|c| c.counterpart.id == "B").unwrap();
    assert_eq!(b.unread_count, Some(1));
    assert!(!b.degraded);

    let c = list.iter().find(|c| c.counterpart.id == "C").unwrap();
    assert!(c.degraded);
    assert_eq!(c.unread_count, None);
    assert_eq!(c.last_message, None);
}

#[tokio::test]
async fn test_systemic_failure_fails_listing() {
    let store = Arc::new(MemoryStore::new());
    let h = Harness::new(store.clone(), Arc::new(Directory::with_profiles(people())));
    h.delivery.send("B", "A", "Merhaba", None).await.unwrap();

    store.set_offline(true);
    assert!(matches!(
        h.aggregator.list_conversations("A").await,
        Err(MessagingError::StoreUnavailable(_))
    ));
}

#[tokio::test]
async fn test_thread_order_is_non_decreasing() {
    for (backend, h) in both().await {
        for i in 0..20 {
            let (from, to) = if i % 3 == 0 { ("B", "A") } else { ("A", "B") };
            h.delivery.send(from, to, &format!("#{}", i), None).await.unwrap();
        }
        let thread = h.threads.load_thread("A", "B").await.unwrap();
        let bodies: Vec<String> = thread.messages.iter().map(|m| m.message.body.clone()).collect();
        let expected: Vec<String> = (0..20).map(|i| format!("#{}", i)).collect();
        assert_eq!(bodies, expected, "{}", backend);
        assert!(
            thread
                .messages
                .windows(2)
                .all(|w| w[0].message.created_at <= w[1].message.created_at),
            "{}",
            backend
        );
    }
}

#[tokio::test]
async fn test_unread_count_matches_raw_rows() {
    for (backend, h) in both().await {
        let m1 = h.delivery.send("B", "A", "1", None).await.unwrap();
        h.delivery.send("B", "A", "2", None).await.unwrap();
        h.delivery.send("B", "A", "3", None).await.unwrap();
        h.delivery.send("A", "B", "outgoing", None).await.unwrap();
        h.delivery.send("C", "A", "other", None).await.unwrap();
        h.delivery.mark_read(&[m1.id.clone()], "A").await.unwrap();

        let raw = h
            .store
            .count(&MessageFilter::unread_from("B", "A"))
            .await
            .unwrap();
        assert_eq!(raw, 2, "{}", backend);
        assert_eq!(h.unread("A", "B").await, Some(raw as u32), "{}", backend);
        assert_eq!(h.aggregator.total_unread("A").await.unwrap(), 3, "{}", backend);
    }
}

#[tokio::test]
async fn test_read_state_never_reverts() {
    for (backend, h) in both().await {
        let msg = h.delivery.send("A", "B", "Merhaba", None).await.unwrap();
        let ids = vec![msg.id.clone()];

        assert_eq!(h.delivery.mark_read(&ids, "B").await.unwrap(), ids, "{}", backend);
        // Second call is a clean no-op
        assert!(h.delivery.mark_read(&ids, "B").await.unwrap().is_empty(), "{}", backend);

        h.delivery.send("A", "B", "again", None).await.unwrap();
        h.threads.load_thread("A", "B").await.unwrap();
        h.aggregator.list_conversations("B").await.unwrap();
        assert!(h.is_read(&msg.id).await, "{}", backend);
    }
}

#[tokio::test]
async fn test_only_sender_deletes() {
    for (backend, h) in both().await {
        let msg = h.delivery.send("A", "B", "Merhaba", None).await.unwrap();
        for intruder in ["B", "C"] {
            assert!(
                matches!(
                    h.delivery.delete_message(&msg.id, intruder).await,
                    Err(MessagingError::Forbidden(_))
                ),
                "{}",
                backend
            );
        }
        h.delivery.delete_message(&msg.id, "A").await.unwrap();
        assert_eq!(h.store.count(&MessageFilter::All).await.unwrap(), 0, "{}", backend);
    }
}

#[tokio::test]
async fn test_conversations_without_messages_sort_last() {
    for (backend, h) in both().await {
        h.delivery.send("C", "A", "Selam", None).await.unwrap();
        let list = h.aggregator.list_conversations("A").await.unwrap();
        let order: Vec<&str> = list.iter().map(|c| c.counterpart.id.as_str()).collect();
        assert_eq!(order, vec!["C", "B"], "{}", backend);
        assert!(list[1].last_message.is_none(), "{}", backend);
        assert_eq!(list[1].unread_count, Some(0), "{}", backend);
    }
}
