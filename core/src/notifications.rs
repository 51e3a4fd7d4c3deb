/// Notification list and unread counter: optimistic mark-read, server reconciliation
use crate::error::Result;
use crate::messenger_types::Notification;
use crate::transport::PortalApi;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Pushed notifications remembered for merging into a refresh that raced with them
const RECENT_PUSHES: usize = 64;

#[derive(Debug, Default)]
struct NotificationState {
    /// Newest first
    items: Vec<Notification>,
    unread: u32,
    has_more: bool,
    /// Bumped by `clear`; responses from an older epoch are ignored
    epoch: u64,
    /// Sequence number of the last accepted push
    push_seq: u64,
    /// Most recent pushes with their sequence numbers, oldest first
    recent_pushes: Vec<(u64, Notification)>,
}

impl NotificationState {
    fn find_mut(&mut self, id: &str) -> Option<&mut Notification> {
        self.items.iter_mut().find(|n| n.id == id)
    }

    fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|n| n.id == id)
    }
}

#[derive(Clone)]
pub struct NotificationSynchronizer {
    api: Arc<dyn PortalApi>,
    page_size: usize,
    state: Arc<RwLock<NotificationState>>,
}

impl NotificationSynchronizer {
    pub fn new(api: Arc<dyn PortalApi>, page_size: usize) -> Self {
        Self {
            api,
            page_size: page_size.max(1),
            state: Arc::new(RwLock::new(NotificationState::default())),
        }
    }

    /// Full refetch: first page and the authoritative unread count overwrite local state.
    /// Pushes accepted while the fetch was in flight and missing from the page are kept.
    pub async fn refresh(&self) -> Result<()> {
        let (epoch, since) = {
            let state = self.state.read().await;
            (state.epoch, state.push_seq)
        };
        let (page, unread) = tokio::try_join!(
            self.api.fetch_notifications(None, self.page_size),
            self.api.fetch_unread_count()
        )?;

        let mut state = self.state.write().await;
        if state.epoch != epoch {
            return Ok(());
        }
        let mut items = page.notifications;
        let mut unread = unread;
        for (_, pushed) in state.recent_pushes.iter().filter(|(seq, _)| *seq > since) {
            if items.iter().any(|n| n.id == pushed.id) {
                continue;
            }
            // Current local copy: it may have been marked read, or deleted, since the push
            let Some(current) = state.items.iter().find(|n| n.id == pushed.id) else {
                continue;
            };
            if !current.read {
                unread = unread.saturating_add(1);
            }
            items.insert(0, current.clone());
        }
        state.items = items;
        state.has_more = page.has_more;
        state.unread = unread;
        info!(
            "Notifications refreshed: {} loaded, {} unread",
            state.items.len(),
            state.unread
        );
        Ok(())
    }

    /// Append the next (older) page. Returns how many new items were added.
    pub async fn load_more(&self) -> Result<usize> {
        let (cursor, epoch) = {
            let state = self.state.read().await;
            if !state.has_more {
                return Ok(0);
            }
            (state.items.last().map(|n| n.id.clone()), state.epoch)
        };

        let page = self
            .api
            .fetch_notifications(cursor.as_deref(), self.page_size)
            .await?;

        let mut state = self.state.write().await;
        if state.epoch != epoch {
            return Ok(0);
        }
        let mut added = 0;
        for notification in page.notifications {
            if !state.contains(&notification.id) {
                state.items.push(notification);
                added += 1;
            }
        }
        state.has_more = page.has_more;
        Ok(added)
    }

    /// Pushed notification: prepend and count once, however often it is delivered
    pub async fn apply_pushed(&self, notification: Notification) -> bool {
        let mut state = self.state.write().await;
        if state.contains(&notification.id) {
            debug!("Ignoring duplicate notification {}", notification.id);
            return false;
        }
        if !notification.read {
            state.unread = state.unread.saturating_add(1);
        }
        state.push_seq += 1;
        let seq = state.push_seq;
        state.recent_pushes.push((seq, notification.clone()));
        if state.recent_pushes.len() > RECENT_PUSHES {
            let excess = state.recent_pushes.len() - RECENT_PUSHES;
            state.recent_pushes.drain(..excess);
        }
        state.items.insert(0, notification);
        true
    }

    /// Optimistically mark one notification read, then reconcile with the server count.
    /// Already-read or unknown ids are a no-op. Server failures are logged and the
    /// optimistic state is kept until the next refresh.
    pub async fn mark_as_read(&self, id: &str) -> bool {
        let epoch = {
            let mut state = self.state.write().await;
            let Some(notification) = state.find_mut(id) else {
                debug!("mark_as_read: unknown notification {}", id);
                return false;
            };
            if notification.read {
                return false;
            }
            notification.read = true;
            state.unread = state.unread.saturating_sub(1);
            state.epoch
        };

        match self.api.mark_notification_read(id).await {
            Ok(unread) => self.reconcile_unread(epoch, unread).await,
            Err(e) => warn!("Failed to mark notification {} read: {}", id, e),
        }
        true
    }

    /// Optimistically mark everything loaded as read and zero the counter.
    /// No rollback on failure; the next refresh corrects any drift.
    pub async fn mark_all_as_read(&self) {
        let epoch = {
            let mut state = self.state.write().await;
            for notification in state.items.iter_mut() {
                notification.read = true;
            }
            state.unread = 0;
            state.epoch
        };

        match self.api.mark_all_notifications_read().await {
            Ok(unread) => self.reconcile_unread(epoch, unread).await,
            Err(e) => warn!("Failed to mark all notifications read: {}", e),
        }
    }

    /// Server-side delete; the item disappears locally only once the server agrees
    pub async fn delete(&self, id: &str) -> Result<()> {
        let epoch = self.state.read().await.epoch;
        let unread = self.api.delete_notification(id).await?;

        let mut state = self.state.write().await;
        if state.epoch != epoch {
            return Ok(());
        }
        state.items.retain(|n| n.id != id);
        state.unread = unread;
        Ok(())
    }

    pub async fn unread_count(&self) -> u32 {
        self.state.read().await.unread
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.state.read().await.items.clone()
    }

    pub async fn has_more(&self) -> bool {
        self.state.read().await.has_more
    }

    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        let epoch = state.epoch + 1;
        *state = NotificationState {
            epoch,
            ..NotificationState::default()
        };
    }

    async fn reconcile_unread(&self, epoch: u64, unread: u32) {
        let mut state = self.state.write().await;
        if state.epoch == epoch {
            state.unread = unread;
        }
    }
}
