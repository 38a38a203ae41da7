use std::sync::Arc;

use dashmap::DashMap;
use hangar_messaging::store::MessageStore;
use hangar_messaging::{
    ConversationAggregator, DeliveryManager, IdentityProvider, MessagingConfig, RealtimeNotifier,
    ThreadLoader,
};
use tokio::sync::mpsc;

/// Relay state: connected clients plus the messaging services they call into.
pub struct RelayState {
    /// user_id -> list of sender channels (supports multiple connections per user)
    pub clients: DashMap<String, Vec<mpsc::UnboundedSender<String>>>,
    pub aggregator: ConversationAggregator,
    pub threads: ThreadLoader,
    pub delivery: Arc<DeliveryManager>,
    pub notifier: RealtimeNotifier,
    access_token: Option<String>,
}

impl RelayState {
    pub fn new(
        store: Arc<dyn MessageStore>,
        identity: Arc<dyn IdentityProvider>,
        config: MessagingConfig,
    ) -> Self {
        let delivery = Arc::new(DeliveryManager::new(store.clone(), config.clone()));
        Self {
            clients: DashMap::new(),
            aggregator: ConversationAggregator::new(store.clone(), identity.clone(), config.clone()),
            threads: ThreadLoader::new(store.clone(), identity, delivery.clone(), config),
            delivery,
            notifier: RealtimeNotifier::new(store),
            access_token: None,
        }
    }

    /// Require `token` on every `connect`. An empty token disables the check.
    pub fn with_access_token(mut self, token: Option<String>) -> Self {
        self.access_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn check_token(&self, presented: Option<&str>) -> Result<(), &'static str> {
        match (&self.access_token, presented) {
            (None, _) => Ok(()),
            (Some(expected), Some(received)) if received == expected => Ok(()),
            (Some(_), Some(_)) => Err("Invalid token"),
            (Some(_), None) => Err("No token provided"),
        }
    }

    /// Register a new client connection (supports multiple connections per user)
    pub fn add_client(&self, user_id: String, tx: mpsc::UnboundedSender<String>) {
        self.clients.entry(user_id).or_default().push(tx);
    }

    /// Drop closed channels for `user_id`, and the user entry once none are left
    pub fn remove_client(&self, user_id: &str) {
        if let Some(mut entry) = self.clients.get_mut(user_id) {
            entry.retain(|tx| !tx.is_closed());
            if entry.is_empty() {
                drop(entry);
                self.clients.remove(user_id);
            }
        }
    }

    /// Users with at least one open connection
    pub fn online_users(&self) -> Vec<String> {
        self.clients
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.clients
            .get(user_id)
            .map(|channels| !channels.is_empty())
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.clients.iter().map(|e| e.value().len()).sum()
    }
}
