/// Portal Realtime - messaging and notification core for the family/doctor portal
///
/// Keeps one authenticated push channel alive per session, tracks optimistic
/// message delivery, merges live and historical conversation data, coordinates
/// typing indicators and keeps the notification list and unread count in sync.

pub mod error;
pub mod config;
pub mod session;
pub mod messenger_types;
pub mod transport;
pub mod connection;
pub mod conversation_store;
pub mod delivery;
pub mod typing;
pub mod notifications;
pub mod client;

pub use client::{ClientUpdate, RealtimeClient};
pub use config::Config;
pub use connection::{ChannelEvent, ConnectionManager, ConnectionState, ReconnectPolicy};
pub use conversation_store::{ConversationStore, ThreadView};
pub use delivery::{DeliveryTracker, SendOutcome};
pub use error::{RealtimeError, Result};
pub use notifications::NotificationSynchronizer;
pub use session::{Role, Session, SessionHandle};
pub use typing::{TypingCoordinator, TypingSignal};
