/// Realtime client: wires session, push channel, stores and trackers together
use crate::config::Config;
use crate::connection::{ChannelEvent, ConnectionManager, ConnectionState};
use crate::conversation_store::{ConversationStore, ThreadView};
use crate::delivery::{DeliveryTracker, SendOutcome};
use crate::error::Result;
use crate::messenger_types::{
    Attachment, Conversation, ConversationId, Message, Notification, PushEvent, UserId,
};
use crate::notifications::NotificationSynchronizer;
use crate::session::{Session, SessionHandle};
use crate::transport::{PortalApi, PushConnector};
use crate::typing::{TypingCoordinator, TypingSignal};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Change notifications for views
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientUpdate {
    Connection { state: ConnectionState },
    Conversation { conversation_id: ConversationId },
    Typing { conversation_id: ConversationId },
    Notifications,
}

/// Process-wide entry point used by the portal views
#[derive(Clone)]
pub struct RealtimeClient {
    config: Config,
    api: Arc<dyn PortalApi>,
    session: SessionHandle,
    connection: ConnectionManager,
    conversations: ConversationStore,
    delivery: DeliveryTracker,
    typing: TypingCoordinator,
    notifications: NotificationSynchronizer,
    updates: broadcast::Sender<ClientUpdate>,
    typing_signals: Arc<Mutex<Option<mpsc::UnboundedReceiver<TypingSignal>>>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl RealtimeClient {
    pub fn new(
        config: Config,
        api: Arc<dyn PortalApi>,
        connector: Arc<dyn PushConnector>,
        session: SessionHandle,
    ) -> Self {
        let connection = ConnectionManager::new(&config, connector);
        let conversations = ConversationStore::new();
        let delivery = DeliveryTracker::new(api.clone(), conversations.clone(), session.clone());
        let (typing, typing_rx) = TypingCoordinator::new(&config);
        let notifications = NotificationSynchronizer::new(api.clone(), config.notification_page_size);
        let (updates, _) = broadcast::channel(config.event_buffer.max(1));

        Self {
            config,
            api,
            session,
            connection,
            conversations,
            delivery,
            typing,
            notifications,
            updates,
            typing_signals: Arc::new(Mutex::new(Some(typing_rx))),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn the background tasks: session watcher, push dispatcher, typing forwarder.
    /// Calling it twice is a no-op.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }

        let client = self.clone();
        tasks.push(tokio::spawn(async move { client.run_session_watcher().await }));

        let client = self.clone();
        let events = self.connection.subscribe();
        tasks.push(tokio::spawn(async move { client.run_dispatcher(events).await }));

        let client = self.clone();
        tasks.push(tokio::spawn(async move { client.run_connection_watcher().await }));

        if let Some(rx) = self.typing_signals.lock().await.take() {
            let api = self.api.clone();
            tasks.push(tokio::spawn(async move { forward_typing(api, rx).await }));
        }
        info!("Realtime client started");
    }

    /// Stop background tasks and close the channel
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.connection.disconnect().await;
        info!("Realtime client stopped");
    }

    // ─── Session ─────────────────────────────────────────────────────────────

    async fn run_session_watcher(&self) {
        let mut rx = self.session.subscribe();
        let mut applied_user: Option<UserId> = None;
        loop {
            let session = rx.borrow_and_update().clone();
            let next_user = session.as_ref().map(|s| s.user_id.clone());
            self.apply_session(applied_user.as_deref(), session).await;
            applied_user = next_user;
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// `previous_user` is the user the stores currently belong to. The watch only
    /// keeps the latest value, so a logout followed by a login may arrive as a
    /// single change to a different user.
    async fn apply_session(&self, previous_user: Option<&str>, session: Option<Session>) {
        match &session {
            Some(s) => {
                if previous_user.is_some_and(|prev| prev != s.user_id) {
                    self.connection.ensure_connected(None).await;
                    self.clear_session_state().await;
                    info!("Session switched to {}, previous user's state cleared", s.user_id);
                }
                self.conversations.set_local_user(Some(s.user_id.clone())).await;
                self.connection.ensure_connected(Some(s)).await;
                if let Err(e) = self.notifications.refresh().await {
                    warn!("Initial notification fetch failed: {}", e);
                }
                self.publish(ClientUpdate::Notifications);
            }
            None => {
                self.connection.ensure_connected(None).await;
                self.clear_session_state().await;
                info!("Session ended, realtime state cleared");
            }
        }
    }

    async fn clear_session_state(&self) {
        self.typing.reset().await;
        self.delivery.reset().await;
        self.conversations.clear().await;
        self.notifications.clear().await;
        self.publish(ClientUpdate::Notifications);
    }

    // ─── Push dispatch ───────────────────────────────────────────────────────

    async fn run_dispatcher(&self, mut events: broadcast::Receiver<ChannelEvent>) {
        loop {
            match events.recv().await {
                Ok(ChannelEvent { user_id, event }) => {
                    // Queued before a session switch: belongs to the previous user
                    let current = self.session.current().is_some_and(|s| s.user_id == user_id);
                    if current {
                        self.handle_event(event).await;
                    } else {
                        debug!("Dropping {} event for ended session of {}", event.event_type(), user_id);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Dispatcher lagged {} push events, refetching notifications", n);
                    self.refresh_notifications().await;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn run_connection_watcher(&self) {
        let mut rx = self.connection.watch_state();
        let mut was_connected = false;
        loop {
            let state = *rx.borrow_and_update();
            self.publish(ClientUpdate::Connection { state });
            match state {
                ConnectionState::Connected => {
                    // Pushes may have been missed while the channel was down
                    if was_connected {
                        self.refresh_notifications().await;
                    }
                    was_connected = true;
                }
                ConnectionState::Disconnected => was_connected = false,
                ConnectionState::Connecting | ConnectionState::ReconnectScheduled => {}
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Route one pushed event to its owning component
    pub async fn handle_event(&self, event: PushEvent) {
        match event {
            PushEvent::NewMessage { message } => {
                let message = Message::from(message);
                let conversation_id = message.conversation_id.clone();
                // A delivered message ends that sender's typing burst
                self.typing
                    .apply_remote(&conversation_id, &message.sender_id, false)
                    .await;
                if self.conversations.apply_incoming(message).await {
                    self.publish(ClientUpdate::Conversation { conversation_id });
                }
            }
            PushEvent::ReadReceipt {
                conversation_id,
                message_id,
                reader_id,
                read_at,
            } => {
                if self
                    .delivery
                    .apply_read_receipt(&conversation_id, &message_id, &reader_id, read_at)
                    .await
                {
                    self.publish(ClientUpdate::Conversation { conversation_id });
                }
            }
            PushEvent::Typing {
                conversation_id,
                user_id,
                is_typing,
            } => {
                let is_self = self.session.current().is_some_and(|s| s.user_id == user_id);
                if !is_self {
                    self.typing.apply_remote(&conversation_id, &user_id, is_typing).await;
                    self.publish(ClientUpdate::Typing { conversation_id });
                }
            }
            PushEvent::Notification { notification } => {
                if self.notifications.apply_pushed(notification).await {
                    self.publish(ClientUpdate::Notifications);
                }
            }
            PushEvent::KeepAlive => {}
        }
    }

    // ─── Conversations ───────────────────────────────────────────────────────

    pub async fn upsert_conversations(&self, conversations: Vec<Conversation>) {
        self.conversations.upsert_conversations(conversations).await;
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.conversations.conversations().await
    }

    /// Switch the viewed conversation; typing state of the previous one is discarded
    pub async fn select_conversation(&self, conversation_id: Option<&str>) {
        let previous = self
            .conversations
            .set_active(conversation_id.map(str::to_string))
            .await;
        if let Some(previous) = previous {
            if Some(previous.as_str()) != conversation_id {
                self.typing.clear_conversation(&previous).await;
                self.publish(ClientUpdate::Typing {
                    conversation_id: previous,
                });
            }
        }
        if let Some(id) = conversation_id {
            self.publish(ClientUpdate::Conversation {
                conversation_id: id.to_string(),
            });
        }
    }

    pub async fn thread(&self, conversation_id: &str) -> Option<ThreadView> {
        self.conversations.thread(conversation_id).await
    }

    pub async fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.conversations.messages(conversation_id).await
    }

    pub async fn load_older(&self, conversation_id: &str) -> Result<usize> {
        let added = self
            .conversations
            .load_older(self.api.as_ref(), conversation_id, self.config.history_page_size)
            .await?;
        if added > 0 {
            self.publish(ClientUpdate::Conversation {
                conversation_id: conversation_id.to_string(),
            });
        }
        Ok(added)
    }

    // ─── Sending ─────────────────────────────────────────────────────────────

    pub async fn send(
        &self,
        conversation_id: &str,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> Result<SendOutcome> {
        self.typing.stop_typing(conversation_id).await;
        let outcome = self.delivery.send(conversation_id, content, attachments).await;
        self.publish(ClientUpdate::Conversation {
            conversation_id: conversation_id.to_string(),
        });
        outcome
    }

    pub async fn retry(&self, provisional_id: &str) -> Result<SendOutcome> {
        let conversation_id = self.conversation_of(provisional_id).await;
        let outcome = self.delivery.retry(provisional_id).await?;
        if let Some(conversation_id) = conversation_id {
            self.publish(ClientUpdate::Conversation { conversation_id });
        }
        Ok(outcome)
    }

    pub async fn remove(&self, provisional_id: &str) -> Result<()> {
        let conversation_id = self.conversation_of(provisional_id).await;
        self.delivery.remove(provisional_id).await?;
        if let Some(conversation_id) = conversation_id {
            self.publish(ClientUpdate::Conversation { conversation_id });
        }
        Ok(())
    }

    pub async fn is_sending(&self, conversation_id: &str) -> bool {
        self.delivery.is_sending(conversation_id).await
    }

    // ─── Typing ──────────────────────────────────────────────────────────────

    pub async fn notify_typing(&self, conversation_id: &str) {
        self.typing.notify_typing(conversation_id).await;
    }

    pub async fn stop_typing(&self, conversation_id: &str) {
        self.typing.stop_typing(conversation_id).await;
    }

    pub async fn typing_users(&self, conversation_id: &str) -> Vec<String> {
        self.typing.typing_users(conversation_id).await
    }

    // ─── Notifications ───────────────────────────────────────────────────────

    pub async fn unread_notifications(&self) -> u32 {
        self.notifications.unread_count().await
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.notifications.notifications().await
    }

    pub async fn mark_as_read(&self, id: &str) {
        if self.notifications.mark_as_read(id).await {
            self.publish(ClientUpdate::Notifications);
        }
    }

    pub async fn mark_all_as_read(&self) {
        self.notifications.mark_all_as_read().await;
        self.publish(ClientUpdate::Notifications);
    }

    pub async fn load_more_notifications(&self) -> Result<usize> {
        let added = self.notifications.load_more().await?;
        self.publish(ClientUpdate::Notifications);
        Ok(added)
    }

    pub async fn delete_notification(&self, id: &str) -> Result<()> {
        self.notifications.delete(id).await?;
        self.publish(ClientUpdate::Notifications);
        Ok(())
    }

    async fn refresh_notifications(&self) {
        match self.notifications.refresh().await {
            Ok(()) => self.publish(ClientUpdate::Notifications),
            Err(e) => warn!("Notification refetch failed: {}", e),
        }
    }

    // ─── Accessors ───────────────────────────────────────────────────────────

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn updates(&self) -> broadcast::Receiver<ClientUpdate> {
        self.updates.subscribe()
    }

    fn publish(&self, update: ClientUpdate) {
        // Nobody listening is fine
        let _ = self.updates.send(update);
    }

    async fn conversation_of(&self, provisional_id: &str) -> Option<ConversationId> {
        self.conversations
            .find_provisional(provisional_id)
            .await
            .map(|m| m.conversation_id)
    }
}

async fn forward_typing(api: Arc<dyn PortalApi>, mut rx: mpsc::UnboundedReceiver<TypingSignal>) {
    while let Some(signal) = rx.recv().await {
        debug!(
            "Typing {} in {}",
            if signal.is_typing { "start" } else { "stop" },
            signal.conversation_id
        );
        if let Err(e) = api.send_typing(&signal.conversation_id, signal.is_typing).await {
            // Lossy by nature; the remote side expires stale state
            if e.is_transient() {
                debug!("Typing signal not delivered: {}", e);
            } else {
                error!("Typing signal rejected: {}", e);
            }
        }
    }
}
