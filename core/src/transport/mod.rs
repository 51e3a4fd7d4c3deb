/// Collaborator interfaces: request/response portal API and the push channel
pub mod http_api;
pub mod sse;

use crate::error::Result;
use crate::messenger_types::{
    HistoryCursor, HistoryPage, MessageRecord, NotificationPage, PushEvent, SendMessageRequest,
};
use crate::session::Session;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use http_api::HttpPortalApi;
pub use sse::{SseConnector, SseFrame, SseParser};

/// Receiving end of one open push channel. Dropping it closes the channel.
pub type PushChannel = mpsc::Receiver<PushEvent>;

/// Request/response calls the realtime core issues against the portal backend
#[async_trait]
pub trait PortalApi: Send + Sync {
    /// Post a message; returns the server-confirmed record
    async fn send_message(&self, request: &SendMessageRequest) -> Result<MessageRecord>;

    /// Fetch messages older than `before` (newest page when `None`)
    async fn fetch_history(
        &self,
        conversation_id: &str,
        before: Option<&HistoryCursor>,
        limit: usize,
    ) -> Result<HistoryPage>;

    /// Tell the other participant we started/stopped typing
    async fn send_typing(&self, conversation_id: &str, is_typing: bool) -> Result<()>;

    /// Fetch notifications older than the notification with id `before`
    async fn fetch_notifications(&self, before: Option<&str>, limit: usize)
        -> Result<NotificationPage>;

    async fn fetch_unread_count(&self) -> Result<u32>;

    /// Mark one notification read; returns the server's unread count
    async fn mark_notification_read(&self, id: &str) -> Result<u32>;

    /// Mark every notification read; returns the server's unread count
    async fn mark_all_notifications_read(&self) -> Result<u32>;

    /// Delete a notification server-side; returns the server's unread count
    async fn delete_notification(&self, id: &str) -> Result<u32>;
}

/// Opens the server-push channel for a session
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn open(&self, session: &Session) -> Result<PushChannel>;
}
