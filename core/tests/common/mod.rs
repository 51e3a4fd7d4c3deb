// In-memory portal server and push connector shared by the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use portal_realtime::error::{RealtimeError, Result};
use portal_realtime::messenger_types::{
    HistoryCursor, HistoryPage, MessageRecord, Notification, NotificationPage, PushEvent,
    SendMessageRequest,
};
use portal_realtime::transport::{PortalApi, PushChannel, PushConnector};
use portal_realtime::{Config, Role, Session};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;

pub fn family_session() -> Session {
    Session::new("token-family", Role::Family, "fam-1")
}

pub fn doctor_session() -> Session {
    Session::new("token-doctor", Role::Doctor, "dr-1")
}

/// Config with fast backoff and a keepalive long enough to never fire in tests
pub fn test_config() -> Config {
    Config {
        reconnect_initial_delay: Duration::from_secs(1),
        reconnect_max_delay: Duration::from_secs(8),
        reconnect_multiplier: 2,
        keepalive_timeout: Duration::from_secs(24 * 3600),
        typing_quiet_period: Duration::from_secs(3),
        remote_typing_timeout: Duration::from_secs(5),
        history_page_size: 2,
        notification_page_size: 20,
        ..Config::default()
    }
}

pub fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap() + ChronoDuration::minutes(minute as i64)
}

pub fn record(id: &str, conversation_id: &str, sender_id: &str, content: &str, minute: u32) -> MessageRecord {
    MessageRecord {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender_id.to_string(),
        content: content.to_string(),
        attachments: Vec::new(),
        created_at: at(minute),
        read_at: None,
        client_ref: None,
    }
}

pub fn notification(id: &str, read: bool, minute: u32) -> Notification {
    Notification {
        id: id.to_string(),
        kind: "appointment_reminder".to_string(),
        title: format!("Reminder {}", id),
        message: "Your appointment is tomorrow".to_string(),
        read,
        created_at: at(minute),
        related: None,
    }
}

#[derive(Default)]
struct ApiState {
    offline: bool,
    next_id: u64,
    sent: Vec<SendMessageRequest>,
    typing: Vec<(String, bool)>,
    /// conversation -> messages, oldest first
    history: HashMap<String, Vec<MessageRecord>>,
    history_calls: usize,
    /// newest first
    notifications: Vec<Notification>,
}

/// API calls that a test can hold open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    SendMessage,
    FetchHistory,
    FetchNotifications,
    MarkAllRead,
}

/// Stand-in for the portal REST API
#[derive(Default)]
pub struct FakePortalApi {
    state: Mutex<ApiState>,
    gates: Mutex<HashMap<Call, Arc<Semaphore>>>,
}

impl FakePortalApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls of this kind block until `release`
    pub fn hold(&self, call: Call) {
        self.gates
            .lock()
            .unwrap()
            .insert(call, Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, call: Call) {
        if let Some(gate) = self.gates.lock().unwrap().remove(&call) {
            gate.close();
        }
    }

    async fn pass(&self, call: Call) {
        let gate = self.gates.lock().unwrap().get(&call).cloned();
        if let Some(gate) = gate {
            // Closed on release
            let _ = gate.acquire().await;
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub fn seed_history(&self, conversation_id: &str, mut messages: Vec<MessageRecord>) {
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        self.state
            .lock()
            .unwrap()
            .history
            .insert(conversation_id.to_string(), messages);
    }

    pub fn seed_notifications(&self, mut notifications: Vec<Notification>) {
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        self.state.lock().unwrap().notifications = notifications;
    }

    pub fn sent(&self) -> Vec<SendMessageRequest> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn typing_signals(&self) -> Vec<(String, bool)> {
        self.state.lock().unwrap().typing.clone()
    }

    pub fn history_calls(&self) -> usize {
        self.state.lock().unwrap().history_calls
    }

    pub fn server_unread(&self) -> u32 {
        unread(&self.state.lock().unwrap())
    }

    fn check_online(state: &ApiState) -> Result<()> {
        if state.offline {
            Err(RealtimeError::Http("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

fn unread(state: &ApiState) -> u32 {
    state.notifications.iter().filter(|n| !n.read).count() as u32
}

#[async_trait]
impl PortalApi for FakePortalApi {
    async fn send_message(&self, request: &SendMessageRequest) -> Result<MessageRecord> {
        self.pass(Call::SendMessage).await;
        let mut state = self.state.lock().unwrap();
        Self::check_online(&state)?;
        state.next_id += 1;
        let record = MessageRecord {
            id: format!("srv-{}", state.next_id),
            conversation_id: request.conversation_id.clone(),
            sender_id: "fam-1".to_string(),
            content: request.content.clone(),
            attachments: request.attachments.clone(),
            created_at: Utc::now(),
            read_at: None,
            client_ref: Some(request.client_ref.clone()),
        };
        state.sent.push(request.clone());
        state
            .history
            .entry(request.conversation_id.clone())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn fetch_history(
        &self,
        conversation_id: &str,
        before: Option<&HistoryCursor>,
        limit: usize,
    ) -> Result<HistoryPage> {
        self.pass(Call::FetchHistory).await;
        let mut state = self.state.lock().unwrap();
        Self::check_online(&state)?;
        state.history_calls += 1;
        let all = state.history.get(conversation_id).cloned().unwrap_or_default();
        let older: Vec<MessageRecord> = all
            .into_iter()
            .filter(|m| match before {
                Some(c) => (m.created_at, m.id.as_str()) < (c.before_timestamp, c.before_id.as_str()),
                None => true,
            })
            .collect();
        let start = older.len().saturating_sub(limit);
        Ok(HistoryPage {
            has_more: start > 0,
            messages: older[start..].to_vec(),
        })
    }

    async fn send_typing(&self, conversation_id: &str, is_typing: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_online(&state)?;
        state.typing.push((conversation_id.to_string(), is_typing));
        Ok(())
    }

    async fn fetch_notifications(&self, before: Option<&str>, limit: usize) -> Result<NotificationPage> {
        self.pass(Call::FetchNotifications).await;
        let state = self.state.lock().unwrap();
        Self::check_online(&state)?;
        let start = match before {
            Some(id) => state
                .notifications
                .iter()
                .position(|n| n.id == id)
                .map_or(state.notifications.len(), |p| p + 1),
            None => 0,
        };
        let end = (start + limit).min(state.notifications.len());
        Ok(NotificationPage {
            notifications: state.notifications[start..end].to_vec(),
            has_more: end < state.notifications.len(),
        })
    }

    async fn fetch_unread_count(&self) -> Result<u32> {
        let state = self.state.lock().unwrap();
        Self::check_online(&state)?;
        Ok(unread(&state))
    }

    async fn mark_notification_read(&self, id: &str) -> Result<u32> {
        let mut state = self.state.lock().unwrap();
        Self::check_online(&state)?;
        if let Some(n) = state.notifications.iter_mut().find(|n| n.id == id) {
            n.read = true;
        }
        Ok(unread(&state))
    }

    async fn mark_all_notifications_read(&self) -> Result<u32> {
        self.pass(Call::MarkAllRead).await;
        let mut state = self.state.lock().unwrap();
        Self::check_online(&state)?;
        for n in state.notifications.iter_mut() {
            n.read = true;
        }
        Ok(unread(&state))
    }

    async fn delete_notification(&self, id: &str) -> Result<u32> {
        let mut state = self.state.lock().unwrap();
        Self::check_online(&state)?;
        let before = state.notifications.len();
        state.notifications.retain(|n| n.id != id);
        if state.notifications.len() == before {
            return Err(RealtimeError::Api {
                status: 404,
                message: "notification not found".to_string(),
            });
        }
        Ok(unread(&state))
    }
}

#[derive(Default)]
struct ConnectorState {
    failures_left: usize,
    opens: Vec<(Instant, String)>,
    senders: Vec<mpsc::Sender<PushEvent>>,
}

/// Push connector handing out in-memory channels
#[derive(Default)]
pub struct FakeConnector {
    state: Mutex<ConnectorState>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` open attempts fail
    pub fn fail_next(&self, n: usize) {
        self.state.lock().unwrap().failures_left = n;
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().opens.len()
    }

    pub fn open_instants(&self) -> Vec<Instant> {
        self.state.lock().unwrap().opens.iter().map(|(t, _)| *t).collect()
    }

    pub fn opened_tokens(&self) -> Vec<String> {
        self.state.lock().unwrap().opens.iter().map(|(_, t)| t.clone()).collect()
    }

    /// Channels whose receiving side is still held by a reader
    pub fn live_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .senders
            .iter()
            .filter(|s| !s.is_closed())
            .count()
    }

    /// Deliver an event on the live channel
    pub fn push(&self, event: PushEvent) {
        let state = self.state.lock().unwrap();
        let sender = state
            .senders
            .iter()
            .rev()
            .find(|s| !s.is_closed())
            .expect("no live push channel");
        sender.try_send(event).expect("push channel full");
    }

    /// Server closes every open channel
    pub fn drop_channels(&self) {
        self.state.lock().unwrap().senders.clear();
    }
}

#[async_trait]
impl PushConnector for FakeConnector {
    async fn open(&self, session: &Session) -> Result<PushChannel> {
        let mut state = self.state.lock().unwrap();
        state.opens.push((Instant::now(), session.token.clone()));
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(RealtimeError::Connection("events endpoint unreachable".to_string()));
        }
        let (tx, rx) = mpsc::channel(64);
        state.senders.push(tx);
        Ok(rx)
    }
}
