//! Per-user inbox session: who is signed in, which conversation is open and
//! what is being replied to.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::aggregator::{filter_conversations, ConversationAggregator};
use crate::config::MessagingConfig;
use crate::delivery::DeliveryManager;
use crate::error::{MessagingError, MessagingResult};
use crate::identity::IdentityProvider;
use crate::models::{Conversation, Thread};
use crate::notifier::{RealtimeNotifier, Subscription};
use crate::refresh::{PollHandle, Refresher};
use crate::store::MessageStore;
use crate::thread::ThreadLoader;
use crate::utils::{require_id, require_user};

#[derive(Default)]
struct SessionState {
    current_user: Option<String>,
    selected: Option<String>,
    reply_to: Option<String>,
    search: String,
    subscriptions: Vec<Subscription>,
}

pub struct Inbox {
    aggregator: Arc<ConversationAggregator>,
    threads: ThreadLoader,
    delivery: Arc<DeliveryManager>,
    notifier: RealtimeNotifier,
    config: MessagingConfig,
    state: Mutex<SessionState>,
}

/// Conversation list kept fresh by polling plus realtime pings.
/// Dropping it stops both.
pub struct LiveConversations {
    refresher: Refresher<Vec<Conversation>>,
    subscription: Subscription,
    _poll: PollHandle,
}

impl LiveConversations {
    pub fn latest(&self) -> Option<Vec<Conversation>> {
        self.refresher.latest()
    }

    pub fn watch(&self) -> watch::Receiver<Option<Vec<Conversation>>> {
        self.refresher.watch()
    }

    /// Force a refresh, for example after a local write.
    pub fn refresh(&self) {
        self.refresher.trigger();
    }

    /// False when only polling is keeping the list fresh.
    pub fn is_realtime(&self) -> bool {
        self.subscription.is_live()
    }
}

impl Inbox {
    pub fn new(
        store: Arc<dyn MessageStore>,
        identity: Arc<dyn IdentityProvider>,
        config: MessagingConfig,
    ) -> Self {
        let delivery = Arc::new(DeliveryManager::new(store.clone(), config.clone()));
        Self {
            aggregator: Arc::new(ConversationAggregator::new(
                store.clone(),
                identity.clone(),
                config.clone(),
            )),
            threads: ThreadLoader::new(
                store.clone(),
                identity,
                delivery.clone(),
                config.clone(),
            ),
            delivery,
            notifier: RealtimeNotifier::new(store),
            config,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Start a session for `user_id`, replacing any previous one.
    pub fn sign_in(&self, user_id: &str) -> MessagingResult<()> {
        let user = require_user(user_id)?.to_string();
        let mut state = self.state();
        *state = SessionState {
            current_user: Some(user.clone()),
            ..SessionState::default()
        };
        info!(user_id = %user, "Inbox session started");
        Ok(())
    }

    /// End the session: drop subscriptions and forget all session state.
    pub fn logout(&self) {
        let previous = std::mem::take(&mut *self.state());
        if let Some(user) = previous.current_user {
            info!(user_id = %user, subscriptions = previous.subscriptions.len(), "Inbox session ended");
        }
    }

    pub fn current_user(&self) -> MessagingResult<String> {
        self.state()
            .current_user
            .clone()
            .ok_or(MessagingError::Unauthenticated)
    }

    pub fn selected(&self) -> Option<String> {
        self.state().selected.clone()
    }

    pub fn reply_target(&self) -> Option<String> {
        self.state().reply_to.clone()
    }

    pub fn set_search(&self, query: &str) {
        self.state().search = query.trim().to_string();
    }

    /// Conversation list, narrowed by the current search query.
    pub async fn conversations(&self) -> MessagingResult<Vec<Conversation>> {
        let user = self.current_user()?;
        let all = self.aggregator.list_conversations(&user).await?;
        let search = self.state().search.clone();
        if search.is_empty() {
            return Ok(all);
        }
        Ok(filter_conversations(&all, &search).into_iter().cloned().collect())
    }

    pub async fn total_unread(&self) -> MessagingResult<u32> {
        let user = self.current_user()?;
        self.aggregator.total_unread(&user).await
    }

    /// Select a conversation and load it. Switching conversations drops the reply draft.
    pub async fn open(&self, counterpart_id: &str) -> MessagingResult<Thread> {
        let user = self.current_user()?;
        let counterpart = require_id(counterpart_id, "counterpart_id")?.to_string();
        let thread = self.threads.load_thread(&user, &counterpart).await?;

        let mut state = self.state();
        if state.selected.as_deref() != Some(counterpart.as_str()) {
            state.reply_to = None;
        }
        state.selected = Some(counterpart);
        Ok(thread)
    }

    pub fn close(&self) {
        let mut state = self.state();
        state.selected = None;
        state.reply_to = None;
    }

    /// Mark `message_id` as the target of the next `send`.
    pub fn start_reply(&self, message_id: &str) -> MessagingResult<()> {
        self.current_user()?;
        let id = require_id(message_id, "message_id")?.to_string();
        let mut state = self.state();
        if state.selected.is_none() {
            return Err(MessagingError::InvalidArgument(
                "no conversation is open".to_string(),
            ));
        }
        state.reply_to = Some(id);
        Ok(())
    }

    pub fn cancel_reply(&self) {
        self.state().reply_to = None;
    }

    /// Send `body` to the open conversation, as a reply when a draft target
    /// is set. Returns the re-fetched thread.
    pub async fn send(&self, body: &str) -> MessagingResult<Thread> {
        let user = self.current_user()?;
        let (counterpart, reply_to) = {
            let state = self.state();
            let counterpart = state.selected.clone().ok_or_else(|| {
                MessagingError::InvalidArgument("no conversation is open".to_string())
            })?;
            (counterpart, state.reply_to.clone())
        };

        let sent = self
            .delivery
            .send(&user, &counterpart, body, reply_to.as_deref())
            .await?;
        {
            let mut state = self.state();
            if state.reply_to == reply_to {
                state.reply_to = None;
            }
        }
        debug!(message_id = %sent.id, "Reloading thread after send");
        self.threads.load_thread(&user, &counterpart).await
    }

    pub async fn delete(&self, message_id: &str) -> MessagingResult<()> {
        let user = self.current_user()?;
        self.delivery.delete_message(message_id, &user).await?;
        let mut state = self.state();
        if state.reply_to.as_deref() == Some(message_id.trim()) {
            state.reply_to = None;
        }
        Ok(())
    }

    pub async fn mark_read(&self, message_ids: &[String]) -> MessagingResult<Vec<String>> {
        let user = self.current_user()?;
        self.delivery.mark_read(message_ids, &user).await
    }

    /// Register `on_change` for the session's user. The subscription lives
    /// until `logout`. Returns whether realtime delivery is active.
    pub fn watch<F>(&self, on_change: F) -> MessagingResult<bool>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let user = self.current_user()?;
        let subscription = self.notifier.subscribe(&user, on_change);
        let live = subscription.is_live();
        self.state().subscriptions.push(subscription);
        Ok(live)
    }

    /// Conversation list refreshed on every poll tick and every change ping.
    /// Must be called from within a tokio runtime.
    pub fn live_conversations(&self) -> MessagingResult<LiveConversations> {
        let user = self.current_user()?;
        let aggregator = self.aggregator.clone();
        let task_user = user.clone();
        let refresher = Refresher::new(move || {
            let aggregator = aggregator.clone();
            let user = task_user.clone();
            async move { aggregator.list_conversations(&user).await }
        });

        let pinged = refresher.clone();
        let subscription = self.notifier.subscribe(&user, move || pinged.trigger());
        let poll = refresher.spawn_polling(self.config.poll_interval);

        Ok(LiveConversations {
            refresher,
            subscription,
            _poll: poll,
        })
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        // Session state stays consistent across a panic; keep using it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
