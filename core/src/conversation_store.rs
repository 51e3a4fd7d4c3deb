/// Conversation state: ordered message lists, pagination cursors, summaries
///
/// All mutations of one conversation happen under a single write lock, so a
/// reader never sees a new last message without its unread adjustment.
use crate::error::Result;
use crate::messenger_types::{
    Conversation, ConversationId, DeliveryStatus, HistoryCursor, Message, MessageId, UserId,
};
use crate::transport::PortalApi;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Snapshot of one conversation for rendering
#[derive(Debug, Clone)]
pub struct ThreadView {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub loading_older: bool,
}

#[derive(Debug)]
struct Thread {
    summary: Conversation,
    messages: Vec<Message>,
    has_more: bool,
    /// Ticket of the page load in flight. Dead once that load finishes, is
    /// dropped by its caller, or is reset on conversation switch.
    page_load: Weak<()>,
}

impl Thread {
    fn new(summary: Conversation) -> Self {
        Self {
            summary,
            messages: Vec::new(),
            // Unknown until the first page comes back
            has_more: true,
            page_load: Weak::new(),
        }
    }

    fn is_loading_older(&self) -> bool {
        self.page_load.strong_count() > 0
    }

    fn owns_page_load(&self, ticket: &Arc<()>) -> bool {
        self.page_load
            .upgrade()
            .is_some_and(|current| Arc::ptr_eq(&current, ticket))
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    fn sort(&mut self) {
        self.messages.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
    }

    /// Move the summary forward if `message` is at least as recent as the current last message
    fn touch_summary(&mut self, message: &Message) {
        let newer = self
            .summary
            .last_message
            .as_ref()
            .map_or(true, |last| message.created_at >= last.created_at);
        if newer {
            self.summary.last_message = Some(message.preview());
        }
        if message.created_at > self.summary.last_activity {
            self.summary.last_activity = message.created_at;
        }
    }

    /// A provisional entry was replaced: keep the preview pointing at a live id
    fn repoint_summary(&mut self, old: &MessageId, replacement: &Message) {
        if let Some(last) = &self.summary.last_message {
            if &last.message_id == old {
                self.summary.last_message = Some(replacement.preview());
            }
        }
        self.touch_summary(replacement);
    }

    fn oldest_confirmed_cursor(&self) -> Option<HistoryCursor> {
        self.messages
            .iter()
            .find(|m| m.is_confirmed())
            .map(|m| HistoryCursor {
                before_timestamp: m.created_at,
                before_id: m.id.as_str().to_string(),
            })
    }

    fn view(&self) -> ThreadView {
        ThreadView {
            conversation: self.summary.clone(),
            messages: self.messages.clone(),
            has_more: self.has_more,
            loading_older: self.is_loading_older(),
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    local_user: Option<UserId>,
    active: Option<ConversationId>,
    threads: HashMap<ConversationId, Thread>,
    /// provisional id -> conversation
    provisional: HashMap<String, ConversationId>,
    /// Read receipts for confirmed ids we have not seen yet (our send still unconfirmed)
    early_receipts: HashMap<String, DateTime<Utc>>,
    /// Bumped by `clear`; in-flight page loads from an older epoch are dropped
    epoch: u64,
}

impl StoreState {
    /// Thread for `conversation_id`, created on first use with `activity` as its last activity
    fn thread_mut(
        &mut self,
        conversation_id: &str,
        participants: &[&str],
        activity: DateTime<Utc>,
    ) -> &mut Thread {
        self.threads
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                let mut people: Vec<UserId> = Vec::new();
                for p in participants {
                    if !p.is_empty() && !people.iter().any(|x| x == p) {
                        people.push(p.to_string());
                    }
                }
                let mut summary = Conversation::new(conversation_id.to_string(), people);
                summary.last_activity = activity;
                Thread::new(summary)
            })
    }

    /// Attach a receipt that arrived before our copy of the message was confirmed
    fn take_early_receipt(&mut self, message: &mut Message) {
        if let Some(read_at) = self.early_receipts.remove(message.id.as_str()) {
            message.read_at = message.read_at.or(Some(read_at));
        }
    }

    fn provisional_thread_mut(&mut self, provisional_id: &str) -> Option<&mut Thread> {
        let conversation_id = self.provisional.get(provisional_id)?;
        self.threads.get_mut(conversation_id)
    }
}

/// Per-conversation message lists owned by the realtime core
#[derive(Clone, Default)]
pub struct ConversationStore {
    state: Arc<RwLock<StoreState>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Who "we" are; decides which incoming messages count as unread
    pub async fn set_local_user(&self, user_id: Option<UserId>) {
        self.state.write().await.local_user = user_id;
    }

    /// Load or refresh conversation summaries (messaging view opened)
    pub async fn upsert_conversations(&self, conversations: Vec<Conversation>) {
        let mut state = self.state.write().await;
        for conversation in conversations {
            match state.threads.get_mut(&conversation.id) {
                Some(thread) => {
                    let local_newer = match (&thread.summary.last_message, &conversation.last_message) {
                        (Some(local), Some(remote)) => local.created_at > remote.created_at,
                        (Some(_), None) => true,
                        _ => false,
                    };
                    let last_message = if local_newer {
                        thread.summary.last_message.take()
                    } else {
                        conversation.last_message
                    };
                    thread.summary = Conversation {
                        last_message,
                        last_activity: thread.summary.last_activity.max(conversation.last_activity),
                        ..conversation
                    };
                }
                None => {
                    state
                        .threads
                        .insert(conversation.id.clone(), Thread::new(conversation));
                }
            }
        }
    }

    /// Mark the conversation the user is looking at; returns the previously active one.
    /// Leaving a conversation abandons its in-flight page load.
    pub async fn set_active(&self, conversation_id: Option<ConversationId>) -> Option<ConversationId> {
        let mut state = self.state.write().await;
        if let Some(id) = &conversation_id {
            if let Some(thread) = state.threads.get_mut(id) {
                thread.summary.unread_count = 0;
            }
        }
        let previous = std::mem::replace(&mut state.active, conversation_id);
        if let Some(prev) = &previous {
            if state.active.as_ref() != Some(prev) {
                if let Some(thread) = state.threads.get_mut(prev) {
                    thread.page_load = Weak::new();
                }
            }
        }
        previous
    }

    pub async fn active(&self) -> Option<ConversationId> {
        self.state.read().await.active.clone()
    }

    /// Optimistic insert of a locally composed message
    pub async fn insert_pending(&self, message: Message) {
        let mut state = self.state.write().await;
        let conversation_id = message.conversation_id.clone();
        state
            .provisional
            .insert(message.id.as_str().to_string(), conversation_id.clone());
        let thread = state.thread_mut(
            &conversation_id,
            &[message.sender_id.as_str()],
            message.created_at,
        );
        thread.touch_summary(&message);
        thread.messages.push(message);
        thread.sort();
    }

    /// Replace a provisional entry with its confirmed counterpart.
    ///
    /// If the provisional entry is gone (removed locally) the confirmed message is
    /// inserted anyway. If the confirmed id is already present (push echo won the
    /// race) the existing entry is updated in place. Either way exactly one entry
    /// carries the confirmed id afterwards.
    pub async fn reconcile(&self, provisional_id: &str, mut confirmed: Message) {
        let mut state = self.state.write().await;
        state.provisional.remove(provisional_id);
        state.take_early_receipt(&mut confirmed);
        let old_id = MessageId::Provisional(provisional_id.to_string());
        let thread = state.thread_mut(
            &confirmed.conversation_id,
            &[confirmed.sender_id.as_str()],
            confirmed.created_at,
        );

        if let Some(pos) = thread.position(&old_id) {
            thread.messages.remove(pos);
        }
        upsert_confirmed(thread, confirmed.clone());
        thread.repoint_summary(&old_id, &confirmed);
        thread.sort();
    }

    pub async fn mark_failed(&self, provisional_id: &str, reason: String) -> bool {
        self.set_provisional_status(provisional_id, |m| {
            m.status = DeliveryStatus::Failed {
                reason: reason.clone(),
            }
        })
        .await
    }

    pub async fn mark_pending(&self, provisional_id: &str) -> bool {
        self.set_provisional_status(provisional_id, |m| {
            m.status = DeliveryStatus::Pending
        })
        .await
    }

    async fn set_provisional_status<F>(&self, provisional_id: &str, update: F) -> bool
    where
        F: Fn(&mut Message),
    {
        let mut state = self.state.write().await;
        let id = MessageId::Provisional(provisional_id.to_string());
        let Some(thread) = state.provisional_thread_mut(provisional_id) else {
            return false;
        };
        match thread.position(&id) {
            Some(pos) => {
                update(&mut thread.messages[pos]);
                true
            }
            None => false,
        }
    }

    pub async fn find_provisional(&self, provisional_id: &str) -> Option<Message> {
        let state = self.state.read().await;
        let conversation_id = state.provisional.get(provisional_id)?;
        let id = MessageId::Provisional(provisional_id.to_string());
        state
            .threads
            .get(conversation_id)?
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    /// Drop an unconfirmed entry; confirmed messages are never client-deleted
    pub async fn remove_provisional(&self, provisional_id: &str) -> Option<Message> {
        let mut state = self.state.write().await;
        let conversation_id = state.provisional.remove(provisional_id)?;
        let id = MessageId::Provisional(provisional_id.to_string());
        let thread = state.threads.get_mut(&conversation_id)?;
        let pos = thread.position(&id)?;
        let removed = thread.messages.remove(pos);

        // Preview must not point at a message that no longer exists
        let points_at_removed = thread
            .summary
            .last_message
            .as_ref()
            .is_some_and(|last| last.message_id == id);
        if points_at_removed {
            thread.summary.last_message = thread.messages.last().map(Message::preview);
        }
        Some(removed)
    }

    /// Insert a pushed message. Returns false when it was a duplicate.
    pub async fn apply_incoming(&self, mut message: Message) -> bool {
        let mut state = self.state.write().await;
        let is_own = state.local_user.as_deref() == Some(message.sender_id.as_str());
        if is_own {
            state.take_early_receipt(&mut message);
        }
        let is_active = state.active.as_deref() == Some(message.conversation_id.as_str());

        // Echo of our own send that beat the HTTP response
        let echoed_provisional = message
            .client_ref
            .as_ref()
            .filter(|_| is_own)
            .filter(|client_ref| state.provisional.contains_key(client_ref.as_str()))
            .cloned();
        if let Some(client_ref) = &echoed_provisional {
            state.provisional.remove(client_ref);
        }

        let local_user = state.local_user.clone().unwrap_or_default();
        let thread = state.thread_mut(
            &message.conversation_id,
            &[message.sender_id.as_str(), local_user.as_str()],
            message.created_at,
        );

        let replaced = echoed_provisional.map(MessageId::Provisional);
        if let Some(old_id) = &replaced {
            if let Some(pos) = thread.position(old_id) {
                thread.messages.remove(pos);
            }
        }

        if let Some(pos) = thread.position(&message.id) {
            if let Some(old_id) = &replaced {
                let existing = thread.messages[pos].clone();
                thread.repoint_summary(old_id, &existing);
            }
            debug!("Ignoring duplicate message {}", message.id);
            return false;
        }

        if let Some(old_id) = replaced {
            thread.repoint_summary(&old_id, &message);
            thread.messages.push(message);
            thread.sort();
            return true;
        }

        thread.touch_summary(&message);
        if !is_own && !is_active {
            thread.summary.unread_count = thread.summary.unread_count.saturating_add(1);
        }
        thread.messages.push(message);
        thread.sort();
        true
    }

    /// Flag one of our confirmed messages as read by the other side.
    ///
    /// A receipt for an id we do not hold yet, while one of our sends in that
    /// conversation is unconfirmed, is kept and applied once the confirmation lands.
    pub async fn mark_read(&self, conversation_id: &str, message_id: &str, read_at: DateTime<Utc>) -> bool {
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        let Some(thread) = state.threads.get_mut(conversation_id) else {
            return false;
        };
        let is_own = |m: &Message| state.local_user.as_deref() == Some(m.sender_id.as_str());
        let id = MessageId::Confirmed(message_id.to_string());

        match thread.position(&id) {
            Some(pos) => {
                let message = &mut thread.messages[pos];
                if !is_own(message) {
                    return false;
                }
                if message.read_at.is_none() {
                    message.read_at = Some(read_at);
                }
                true
            }
            None => {
                let awaiting_confirmation = thread
                    .messages
                    .iter()
                    .any(|m| !m.is_confirmed() && is_own(m));
                if awaiting_confirmation {
                    debug!("Holding read receipt for {} until our send is confirmed", message_id);
                    state.early_receipts.insert(message_id.to_string(), read_at);
                }
                false
            }
        }
    }

    /// Prepend the next page of older history. No-op once the server reported the end,
    /// or while another page load for the same conversation is in flight.
    ///
    /// Dropping the returned future releases the in-flight marker, so a later call
    /// can retry.
    pub async fn load_older(&self, api: &dyn PortalApi, conversation_id: &str, limit: usize) -> Result<usize> {
        let ticket = Arc::new(());
        let (cursor, epoch) = {
            let mut state = self.state.write().await;
            let epoch = state.epoch;
            let thread = state.thread_mut(conversation_id, &[], DateTime::<Utc>::MIN_UTC);
            if !thread.has_more || thread.is_loading_older() {
                return Ok(0);
            }
            thread.page_load = Arc::downgrade(&ticket);
            (thread.oldest_confirmed_cursor(), epoch)
        };

        let page = api.fetch_history(conversation_id, cursor.as_ref(), limit).await;

        let mut state = self.state.write().await;
        if state.epoch != epoch {
            debug!("Discarding history page for {}: store was cleared", conversation_id);
            return Ok(0);
        }
        let thread = state.thread_mut(conversation_id, &[], DateTime::<Utc>::MIN_UTC);
        if !thread.owns_page_load(&ticket) {
            debug!("Discarding history page for {}: pagination was reset", conversation_id);
            return Ok(0);
        }
        thread.page_load = Weak::new();
        let page = page?;

        let mut added = 0;
        for record in page.messages {
            let message = Message::from(record);
            if thread.position(&message.id).is_none() {
                thread.touch_summary(&message);
                thread.messages.push(message);
                added += 1;
            }
        }
        thread.has_more = page.has_more;
        thread.sort();
        info!(
            "Loaded {} older messages for {} (has_more: {})",
            added, conversation_id, thread.has_more
        );
        Ok(added)
    }

    pub async fn messages(&self, conversation_id: &str) -> Vec<Message> {
        let state = self.state.read().await;
        state
            .threads
            .get(conversation_id)
            .map(|t| t.messages.clone())
            .unwrap_or_default()
    }

    pub async fn thread(&self, conversation_id: &str) -> Option<ThreadView> {
        let state = self.state.read().await;
        state.threads.get(conversation_id).map(Thread::view)
    }

    pub async fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        let state = self.state.read().await;
        state.threads.get(conversation_id).map(|t| t.summary.clone())
    }

    pub async fn has_more(&self, conversation_id: &str) -> bool {
        let state = self.state.read().await;
        state.threads.get(conversation_id).map_or(true, |t| t.has_more)
    }

    /// Conversation list, most recent activity first
    pub async fn conversations(&self) -> Vec<Conversation> {
        let state = self.state.read().await;
        let mut list: Vec<Conversation> = state.threads.values().map(|t| t.summary.clone()).collect();
        list.sort_by(|a, b| b.last_activity.cmp(&a.last_activity).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Forget everything (logout)
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        let epoch = state.epoch + 1;
        *state = StoreState {
            epoch,
            ..StoreState::default()
        };
    }
}

fn upsert_confirmed(thread: &mut Thread, confirmed: Message) {
    match thread.position(&confirmed.id) {
        Some(pos) => {
            let existing = &mut thread.messages[pos];
            let read_at = existing.read_at.or(confirmed.read_at);
            *existing = Message {
                read_at,
                ..confirmed
            };
        }
        None => thread.messages.push(confirmed),
    }
}
