/// Outgoing message delivery: optimistic insert, send, reconcile or fail
use crate::conversation_store::ConversationStore;
use crate::error::{RealtimeError, Result};
use crate::messenger_types::{Attachment, ConversationId, DeliveryStatus, Message, SendMessageRequest};
use crate::session::SessionHandle;
use crate::transport::PortalApi;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Server confirmed; the provisional entry was replaced by `message_id`
    Sent {
        provisional_id: String,
        message_id: String,
    },
    /// Entry stays in the store with status `failed`
    Failed {
        provisional_id: String,
        reason: String,
    },
}

impl SendOutcome {
    pub fn provisional_id(&self) -> &str {
        match self {
            SendOutcome::Sent { provisional_id, .. } | SendOutcome::Failed { provisional_id, .. } => {
                provisional_id
            }
        }
    }
}

/// Tracks in-flight sends and drives message status transitions
#[derive(Clone)]
pub struct DeliveryTracker {
    api: Arc<dyn PortalApi>,
    store: ConversationStore,
    session: SessionHandle,
    /// provisional id -> conversation, while the request is outstanding
    in_flight: Arc<RwLock<HashMap<String, ConversationId>>>,
}

impl DeliveryTracker {
    pub fn new(api: Arc<dyn PortalApi>, store: ConversationStore, session: SessionHandle) -> Self {
        Self {
            api,
            store,
            session,
            in_flight: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Show the message immediately as `pending`, then send it.
    ///
    /// Only validation problems come back as `Err`; network and server failures
    /// are reported as `SendOutcome::Failed` and leave the entry in the store.
    pub async fn send(
        &self,
        conversation_id: &str,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> Result<SendOutcome> {
        if content.trim().is_empty() && attachments.is_empty() {
            return Err(RealtimeError::Validation(
                "message needs content or an attachment".to_string(),
            ));
        }
        let session = self.session.current().ok_or(RealtimeError::NoSession)?;

        let message = Message::pending(
            conversation_id.to_string(),
            session.user_id,
            content.to_string(),
            attachments,
        );
        debug!("Queued {} in {}", message.id, conversation_id);
        self.store.insert_pending(message.clone()).await;
        self.in_flight
            .write()
            .await
            .insert(message.id.as_str().to_string(), message.conversation_id.clone());

        Ok(self.deliver(&message).await)
    }

    /// Re-send a failed message under its original provisional id
    pub async fn retry(&self, provisional_id: &str) -> Result<SendOutcome> {
        let message = self
            .store
            .find_provisional(provisional_id)
            .await
            .ok_or_else(|| RealtimeError::NotFound(format!("message {}", provisional_id)))?;

        {
            let mut in_flight = self.in_flight.write().await;
            if !message.is_failed() || in_flight.contains_key(provisional_id) {
                return Err(RealtimeError::InvalidState(format!(
                    "message {} is not in failed state",
                    provisional_id
                )));
            }
            in_flight.insert(provisional_id.to_string(), message.conversation_id.clone());
        }

        self.store.mark_pending(provisional_id).await;
        info!("Retrying {}", provisional_id);
        Ok(self.deliver(&message).await)
    }

    /// Discard an unconfirmed message.
    ///
    /// Removal only hides the local attempt: a send already in flight that the
    /// server later confirms is still inserted.
    pub async fn remove(&self, provisional_id: &str) -> Result<()> {
        let removed = self
            .store
            .remove_provisional(provisional_id)
            .await
            .ok_or_else(|| RealtimeError::NotFound(format!("unconfirmed message {}", provisional_id)))?;

        if removed.status == DeliveryStatus::Pending {
            debug!(
                "Removed {} while its send is in flight; a confirmation will still be shown",
                provisional_id
            );
        }
        Ok(())
    }

    /// The other participant saw one of our messages. Display only.
    pub async fn apply_read_receipt(
        &self,
        conversation_id: &str,
        message_id: &str,
        reader_id: &str,
        read_at: DateTime<Utc>,
    ) -> bool {
        let is_self = self
            .session
            .current()
            .is_some_and(|s| s.user_id == reader_id);
        if is_self {
            // Our own read marker echoed from another tab
            return false;
        }
        self.store.mark_read(conversation_id, message_id, read_at).await
    }

    /// "Currently sending" indicator for a conversation
    pub async fn is_sending(&self, conversation_id: &str) -> bool {
        self.in_flight
            .read()
            .await
            .values()
            .any(|c| c == conversation_id)
    }

    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.read().await.len()
    }

    /// Forget in-flight bookkeeping (logout). Outstanding requests still resolve.
    pub async fn reset(&self) {
        self.in_flight.write().await.clear();
    }

    /// Issue the request for an entry the caller already registered as in flight
    async fn deliver(&self, message: &Message) -> SendOutcome {
        let provisional_id = message.id.as_str().to_string();
        let request = SendMessageRequest::for_message(message);
        let result = self.api.send_message(&request).await;

        self.in_flight.write().await.remove(&provisional_id);

        // Session changed while the request was out: the store now belongs to someone else
        let same_user = self
            .session
            .current()
            .is_some_and(|s| s.user_id == message.sender_id);
        if !same_user {
            debug!("Dropping result for {}: session ended", provisional_id);
            return match result {
                Ok(record) => SendOutcome::Sent {
                    provisional_id,
                    message_id: record.id,
                },
                Err(e) => SendOutcome::Failed {
                    provisional_id,
                    reason: e.to_string(),
                },
            };
        }

        match result {
            Ok(record) => {
                let confirmed = Message::from(record);
                let message_id = confirmed.id.as_str().to_string();
                info!("Message {} confirmed as {}", provisional_id, message_id);
                self.store.reconcile(&provisional_id, confirmed).await;
                SendOutcome::Sent {
                    provisional_id,
                    message_id,
                }
            }
            Err(e) => {
                if e.is_transient() {
                    warn!("Send of {} failed (network): {}", provisional_id, e);
                } else {
                    warn!("Send of {} rejected: {}", provisional_id, e);
                }
                let reason = e.to_string();
                self.store.mark_failed(&provisional_id, reason.clone()).await;
                SendOutcome::Failed {
                    provisional_id,
                    reason,
                }
            }
        }
    }
}
