/// Push channel lifecycle: single live channel, reconnect with backoff, teardown on logout
use crate::config::Config;
use crate::messenger_types::{PushEvent, UserId};
use crate::session::Session;
use crate::transport::{PushChannel, PushConnector};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Connection state of the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No session, or torn down
    Disconnected,
    /// Opening the channel
    Connecting,
    /// Channel open and delivering events
    Connected,
    /// Waiting for the backoff timer before the next attempt
    ReconnectScheduled,
}

/// Pushed event together with the user whose channel delivered it
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub user_id: UserId,
    pub event: PushEvent,
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            initial_delay: config.reconnect_initial_delay,
            max_delay: config.reconnect_max_delay,
            multiplier: config.reconnect_multiplier.max(1),
        }
    }

    /// Delay before the next attempt after `consecutive_failures` failures (1-based).
    /// Non-decreasing in its argument and capped at `max_delay`.
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1);
        let factor = self.multiplier.saturating_pow(exponent);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

struct Worker {
    session_token: String,
    handle: JoinHandle<()>,
}

struct Slot {
    /// Bumped on every teardown/restart; stale workers compare against it
    generation: u64,
    worker: Option<Worker>,
}

struct Inner {
    connector: Arc<dyn PushConnector>,
    policy: ReconnectPolicy,
    connect_timeout: Duration,
    keepalive_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ChannelEvent>,
    slot: Mutex<Slot>,
}

/// Owner of the process-wide push channel. Consumers only subscribe.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(config: &Config, connector: Arc<dyn PushConnector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            inner: Arc::new(Inner {
                connector,
                policy: ReconnectPolicy::from_config(config),
                connect_timeout: config.connect_timeout,
                keepalive_timeout: config.keepalive_timeout,
                state,
                events,
                slot: Mutex::new(Slot {
                    generation: 0,
                    worker: None,
                }),
            }),
        }
    }

    /// Make the channel match the session: open one if needed, tear down when there is none.
    /// Idempotent.
    pub async fn ensure_connected(&self, session: Option<&Session>) {
        let mut slot = self.inner.slot.lock().await;

        let Some(session) = session else {
            self.inner.teardown(&mut slot);
            return;
        };

        if let Some(worker) = &slot.worker {
            if worker.session_token == session.token && !worker.handle.is_finished() {
                debug!("Push channel already owned for this session");
                return;
            }
        }

        // New session or dead worker: cancel whatever is pending before starting over
        self.inner.teardown(&mut slot);
        slot.generation += 1;
        let generation = slot.generation;
        info!(
            "Starting push channel for {} (generation {})",
            session.user_id, generation
        );
        let inner = self.inner.clone();
        let session = session.clone();
        let session_token = session.token.clone();
        let handle = tokio::spawn(async move { inner.run_channel(session, generation).await });
        slot.worker = Some(Worker {
            session_token,
            handle,
        });
    }

    /// Terminal teardown path (logout)
    pub async fn disconnect(&self) {
        self.ensure_connected(None).await;
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Subscribe to pushed events (keep-alives are filtered out)
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }
}

impl Inner {
    fn teardown(&self, slot: &mut Slot) {
        slot.generation += 1;
        if let Some(worker) = slot.worker.take() {
            worker.handle.abort();
            info!("Push channel closed and pending reconnect cancelled");
        }
        self.state.send_if_modified(|state| {
            let changed = *state != ConnectionState::Disconnected;
            *state = ConnectionState::Disconnected;
            changed
        });
    }

    /// Only the worker of the current generation may publish
    async fn publish_state(&self, generation: u64, next: ConnectionState) -> bool {
        let slot = self.slot.lock().await;
        if slot.generation != generation {
            return false;
        }
        self.state.send_if_modified(|state| {
            let changed = *state != next;
            *state = next;
            changed
        });
        true
    }

    async fn forward(&self, generation: u64, user_id: &str, event: PushEvent) -> bool {
        let slot = self.slot.lock().await;
        if slot.generation != generation {
            return false;
        }
        // No subscribers is fine: nobody is rendering yet
        let _ = self.events.send(ChannelEvent {
            user_id: user_id.to_string(),
            event,
        });
        true
    }

    /// Connect / read / back off until aborted
    async fn run_channel(self: Arc<Self>, session: Session, generation: u64) {
        let mut consecutive_failures: u32 = 0;

        loop {
            if !self.publish_state(generation, ConnectionState::Connecting).await {
                return;
            }

            match timeout(self.connect_timeout, self.connector.open(&session)).await {
                Ok(Ok(channel)) => {
                    if !self.publish_state(generation, ConnectionState::Connected).await {
                        return;
                    }
                    info!("Push channel connected for {}", session.user_id);
                    consecutive_failures = 0;

                    if !self.pump(channel, generation, &session.user_id).await {
                        return;
                    }
                }
                Ok(Err(e)) => {
                    warn!("Failed to open push channel: {}", e);
                }
                Err(_) => {
                    warn!("Push channel connect timeout after {:?}", self.connect_timeout);
                }
            }

            consecutive_failures = consecutive_failures.saturating_add(1);
            let delay = self.policy.delay_for(consecutive_failures);
            if !self
                .publish_state(generation, ConnectionState::ReconnectScheduled)
                .await
            {
                return;
            }
            info!(
                "Reconnecting push channel in {:?} (attempt {})",
                delay, consecutive_failures
            );
            sleep(delay).await;
        }
    }

    /// Read events until the channel drops. Returns false when this worker went stale.
    async fn pump(&self, mut channel: PushChannel, generation: u64, user_id: &str) -> bool {
        loop {
            match timeout(self.keepalive_timeout, channel.recv()).await {
                Ok(Some(PushEvent::KeepAlive)) => {
                    debug!("Push channel keep-alive");
                }
                Ok(Some(event)) => {
                    debug!("Push event: {}", event.event_type());
                    if !self.forward(generation, user_id, event).await {
                        return false;
                    }
                }
                Ok(None) => {
                    warn!("Push channel closed by server");
                    return true;
                }
                Err(_) => {
                    warn!(
                        "No push traffic for {:?}, treating channel as dropped",
                        self.keepalive_timeout
                    );
                    return true;
                }
            }
        }
    }
}
