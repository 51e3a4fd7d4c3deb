/// Session presence as observed by the realtime core
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

/// Portal role of the signed-in user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Doctor,
    Family,
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "doctor" => Ok(Role::Doctor),
            "family" => Ok(Role::Family),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Credential issued at login. Owned by the authentication layer.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub role: Role,
    pub user_id: String,
}

impl Session {
    pub fn new(token: impl Into<String>, role: Role, user_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            role,
            user_id: user_id.into(),
        }
    }
}

// Keep the token out of logs
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("role", &self.role)
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Reactive session value: the auth layer writes, the core observes.
#[derive(Clone)]
pub struct SessionHandle {
    tx: watch::Sender<Option<Session>>,
}

impl SessionHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn login(&self, session: Session) {
        self.tx.send_replace(Some(session));
    }

    pub fn logout(&self) {
        self.tx.send_if_modified(|current| current.take().is_some());
    }

    pub fn current(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}
