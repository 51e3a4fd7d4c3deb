/// Typing indicators: debounced local start/stop signals, self-expiring remote state
use crate::config::Config;
use crate::messenger_types::{ConversationId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Outgoing typing signal, to be forwarded to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingSignal {
    pub conversation_id: ConversationId,
    pub is_typing: bool,
}

struct LocalTyping {
    conversation_id: ConversationId,
    generation: u64,
    stop_timer: JoinHandle<()>,
}

#[derive(Default)]
struct TypingState {
    local: Option<LocalTyping>,
    next_generation: u64,
    /// (conversation, user) -> last "start" seen
    remote: HashMap<(ConversationId, UserId), Instant>,
}

#[derive(Clone)]
pub struct TypingCoordinator {
    state: Arc<Mutex<TypingState>>,
    signals: mpsc::UnboundedSender<TypingSignal>,
    quiet_period: Duration,
    remote_timeout: Duration,
}

impl TypingCoordinator {
    /// Returns the coordinator and the stream of outgoing signals
    pub fn new(config: &Config) -> (Self, mpsc::UnboundedReceiver<TypingSignal>) {
        let (signals, rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            state: Arc::new(Mutex::new(TypingState::default())),
            signals,
            quiet_period: config.typing_quiet_period,
            remote_timeout: config.remote_typing_timeout,
        };
        (coordinator, rx)
    }

    /// Keystroke burst in `conversation_id`. Emits "start" only on the idle-to-active
    /// transition and re-arms the quiet timer that emits "stop".
    pub async fn notify_typing(&self, conversation_id: &str) {
        let mut state = self.state.lock().await;

        let same_conversation = state
            .local
            .as_ref()
            .is_some_and(|l| l.conversation_id == conversation_id);

        if let Some(previous) = state.local.take() {
            previous.stop_timer.abort();
            if !same_conversation {
                self.emit(&previous.conversation_id, false);
            }
        }
        if !same_conversation {
            self.emit(conversation_id, true);
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let stop_timer = self.spawn_stop_timer(conversation_id.to_string(), generation);
        state.local = Some(LocalTyping {
            conversation_id: conversation_id.to_string(),
            generation,
            stop_timer,
        });
    }

    /// Explicit stop (message sent, input cleared)
    pub async fn stop_typing(&self, conversation_id: &str) {
        let mut state = self.state.lock().await;
        let matches = state
            .local
            .as_ref()
            .is_some_and(|l| l.conversation_id == conversation_id);
        if matches {
            if let Some(local) = state.local.take() {
                local.stop_timer.abort();
                self.emit(conversation_id, false);
            }
        }
    }

    pub async fn is_local_typing(&self, conversation_id: &str) -> bool {
        let state = self.state.lock().await;
        state
            .local
            .as_ref()
            .is_some_and(|l| l.conversation_id == conversation_id)
    }

    /// Remote start/stop signal
    pub async fn apply_remote(&self, conversation_id: &str, user_id: &str, is_typing: bool) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let timeout = self.remote_timeout;
        state.remote.retain(|_, seen| now.duration_since(*seen) < timeout);

        let key = (conversation_id.to_string(), user_id.to_string());
        if is_typing {
            state.remote.insert(key, now);
        } else {
            state.remote.remove(&key);
        }
    }

    pub async fn is_typing(&self, conversation_id: &str, user_id: &str) -> bool {
        self.is_typing_at(conversation_id, user_id, Instant::now()).await
    }

    /// "Typing" only while `now - last_start < timeout`
    pub async fn is_typing_at(&self, conversation_id: &str, user_id: &str, now: Instant) -> bool {
        let state = self.state.lock().await;
        state
            .remote
            .get(&(conversation_id.to_string(), user_id.to_string()))
            .is_some_and(|seen| now.saturating_duration_since(*seen) < self.remote_timeout)
    }

    /// Users currently typing in a conversation
    pub async fn typing_users(&self, conversation_id: &str) -> Vec<UserId> {
        let now = Instant::now();
        let state = self.state.lock().await;
        let mut users: Vec<UserId> = state
            .remote
            .iter()
            .filter(|((conv, _), seen)| {
                conv == conversation_id && now.duration_since(**seen) < self.remote_timeout
            })
            .map(|((_, user), _)| user.clone())
            .collect();
        users.sort();
        users
    }

    /// Conversation switched away: drop its timers and remote state without telling the server
    pub async fn clear_conversation(&self, conversation_id: &str) {
        let mut state = self.state.lock().await;
        let matches = state
            .local
            .as_ref()
            .is_some_and(|l| l.conversation_id == conversation_id);
        if matches {
            if let Some(local) = state.local.take() {
                local.stop_timer.abort();
            }
        }
        state.remote.retain(|(conv, _), _| conv != conversation_id);
    }

    /// Drop everything (logout)
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        if let Some(local) = state.local.take() {
            local.stop_timer.abort();
        }
        state.remote.clear();
    }

    fn spawn_stop_timer(&self, conversation_id: ConversationId, generation: u64) -> JoinHandle<()> {
        let coordinator = self.clone();
        let quiet_period = self.quiet_period;
        tokio::spawn(async move {
            sleep(quiet_period).await;
            let mut state = coordinator.state.lock().await;
            let current = state
                .local
                .as_ref()
                .is_some_and(|l| l.generation == generation);
            if current {
                state.local = None;
                coordinator.emit(&conversation_id, false);
            }
        })
    }

    fn emit(&self, conversation_id: &str, is_typing: bool) {
        let signal = TypingSignal {
            conversation_id: conversation_id.to_string(),
            is_typing,
        };
        if self.signals.send(signal).is_err() {
            debug!("Typing signal dropped: no forwarder");
        }
    }
}
