/// Shared types for the messaging and notification core
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type ConversationId = String;
pub type UserId = String;

const PREVIEW_CHARS: usize = 80;
const PROVISIONAL_PREFIX: &str = "local-";

/// Identity of a message: provisional before the server confirms it, confirmed after.
/// A message never carries both.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MessageId {
    Provisional(String),
    Confirmed(String),
}

impl MessageId {
    /// Fresh client-side id for an outgoing message
    pub fn new_provisional() -> Self {
        MessageId::Provisional(format!("{}{}", PROVISIONAL_PREFIX, uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            MessageId::Provisional(id) | MessageId::Confirmed(id) => id,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, MessageId::Confirmed(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery state of a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Shown optimistically, send in flight
    Pending,
    /// Confirmed by the server
    Sent,
    /// Send rejected or network failed; waits for retry/remove
    Failed { reason: String },
}

/// Reference to a file already uploaded to the blob store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub url: String,
    pub content_type: String,
    pub size_bytes: u64,
}

/// One chat message as held by the conversation store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Server timestamp once confirmed, local creation time before that
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    /// Set when the recipient acknowledged reading (display only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    /// Provisional id the sender attached to the request, echoed back by the server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

impl Message {
    /// Optimistic local message, not yet sent
    pub fn pending(
        conversation_id: ConversationId,
        sender_id: UserId,
        content: String,
        attachments: Vec<Attachment>,
    ) -> Self {
        let id = MessageId::new_provisional();
        Self {
            client_ref: Some(id.as_str().to_string()),
            id,
            conversation_id,
            sender_id,
            content,
            attachments,
            created_at: Utc::now(),
            status: DeliveryStatus::Pending,
            read_at: None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.id.is_confirmed()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, DeliveryStatus::Failed { .. })
    }

    pub fn preview(&self) -> MessagePreview {
        let text = if self.content.trim().is_empty() && !self.attachments.is_empty() {
            format!("[{} attachment(s)]", self.attachments.len())
        } else {
            self.content.chars().take(PREVIEW_CHARS).collect()
        };
        MessagePreview {
            message_id: self.id.clone(),
            sender_id: self.sender_id.clone(),
            text,
            created_at: self.created_at,
        }
    }

    /// Sort key: confirmed messages by (server time, id), unconfirmed ones after them by local time
    pub(crate) fn order_key(&self) -> (bool, DateTime<Utc>, &str) {
        (!self.is_confirmed(), self.created_at, self.id.as_str())
    }
}

/// Server-side message record (request/response and push payloads)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

impl From<MessageRecord> for Message {
    fn from(record: MessageRecord) -> Self {
        Self {
            id: MessageId::Confirmed(record.id),
            conversation_id: record.conversation_id,
            sender_id: record.sender_id,
            content: record.content,
            attachments: record.attachments,
            created_at: record.created_at,
            status: DeliveryStatus::Sent,
            read_at: record.read_at,
            client_ref: record.client_ref,
        }
    }
}

/// Body of the send-message call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub client_ref: String,
}

impl SendMessageRequest {
    pub fn for_message(message: &Message) -> Self {
        Self {
            conversation_id: message.conversation_id.clone(),
            content: message.content.clone(),
            attachments: message.attachments.clone(),
            client_ref: message.id.as_str().to_string(),
        }
    }
}

/// Before-cursor for history pagination: the oldest loaded confirmed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryCursor {
    pub before_timestamp: DateTime<Utc>,
    pub before_id: String,
}

/// One page of historical messages
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryPage {
    pub messages: Vec<MessageRecord>,
    pub has_more: bool,
}

/// Last-message summary shown in the conversation list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePreview {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Summary of one doctor/family thread (for the conversation list)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: Vec<UserId>,
    #[serde(default)]
    pub last_message: Option<MessagePreview>,
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub unread_count: u32,
}

impl Conversation {
    pub fn new(id: ConversationId, participants: Vec<UserId>) -> Self {
        Self {
            id,
            participants,
            last_message: None,
            last_activity: Utc::now(),
            unread_count: 0,
        }
    }
}

/// Entity a notification points at (appointment, record, conversation...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedEntity {
    pub kind: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related: Option<RelatedEntity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationPage {
    pub notifications: Vec<Notification>,
    pub has_more: bool,
}

/// Server answer carrying the authoritative unread counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCount {
    pub unread_count: u32,
}

/// Events delivered over the push channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    /// A message was posted to one of our conversations
    NewMessage { message: MessageRecord },
    /// The other participant has seen a message
    ReadReceipt {
        conversation_id: ConversationId,
        message_id: String,
        reader_id: UserId,
        read_at: DateTime<Utc>,
    },
    /// Remote typing start/stop
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    /// A new notification for this user
    Notification { notification: Notification },
    /// Liveness only
    KeepAlive,
}

impl PushEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            PushEvent::NewMessage { .. } => "new_message",
            PushEvent::ReadReceipt { .. } => "read_receipt",
            PushEvent::Typing { .. } => "typing",
            PushEvent::Notification { .. } => "notification",
            PushEvent::KeepAlive => "keep_alive",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisional_ids_are_unique() {
        let a = MessageId::new_provisional();
        let b = MessageId::new_provisional();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with(PROVISIONAL_PREFIX));
        assert!(!a.is_confirmed());
    }

    #[test]
    fn test_pending_message_carries_its_client_ref() {
        let msg = Message::pending("c1".into(), "u1".into(), "Hello".into(), vec![]);
        assert_eq!(msg.status, DeliveryStatus::Pending);
        assert_eq!(msg.client_ref.as_deref(), Some(msg.id.as_str()));

        let request = SendMessageRequest::for_message(&msg);
        assert_eq!(request.client_ref, msg.id.as_str());
        assert_eq!(request.content, "Hello");
    }

    #[test]
    fn test_push_event_wire_format() {
        let json = r#"{"type":"typing","conversation_id":"c1","user_id":"dr-2","is_typing":true}"#;
        let event: PushEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event,
            PushEvent::Typing {
                conversation_id: "c1".into(),
                user_id: "dr-2".into(),
                is_typing: true,
            }
        );

        let keepalive: PushEvent = serde_json::from_str(r#"{"type":"keep_alive"}"#).unwrap();
        assert_eq!(keepalive.event_type(), "keep_alive");
    }

    #[test]
    fn test_notification_type_field() {
        let json = r#"{
            "id": "n1",
            "type": "appointment",
            "title": "Appointment confirmed",
            "message": "Tomorrow 10:00",
            "created_at": "2026-03-01T10:00:00Z",
            "related": {"kind": "appointment", "id": "a-9"}
        }"#;
        let n: Notification = serde_json::from_str(json).unwrap();
        assert_eq!(n.kind, "appointment");
        assert!(!n.read);
        assert_eq!(n.related.unwrap().id, "a-9");
    }

    #[test]
    fn test_preview_truncates_and_describes_attachments() {
        let long = "x".repeat(200);
        let msg = Message::pending("c1".into(), "u1".into(), long, vec![]);
        assert_eq!(msg.preview().text.chars().count(), PREVIEW_CHARS);

        let attachment = Attachment {
            file_name: "scan.pdf".into(),
            url: "https://blob/scan.pdf".into(),
            content_type: "application/pdf".into(),
            size_bytes: 1024,
        };
        let msg = Message::pending("c1".into(), "u1".into(), String::new(), vec![attachment]);
        assert_eq!(msg.preview().text, "[1 attachment(s)]");
    }

    #[test]
    fn test_unconfirmed_sorts_after_confirmed() {
        let record = MessageRecord {
            id: "m1".into(),
            conversation_id: "c1".into(),
            sender_id: "u2".into(),
            content: "later".into(),
            attachments: vec![],
            created_at: Utc::now() + chrono::Duration::hours(1),
            read_at: None,
            client_ref: None,
        };
        let confirmed = Message::from(record);
        let pending = Message::pending("c1".into(), "u1".into(), "now".into(), vec![]);
        assert!(confirmed.order_key() < pending.order_key());
    }
}
