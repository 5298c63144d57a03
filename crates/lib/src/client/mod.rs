//! Messaging backend abstraction.
//!
//! The forwarder only needs five things from a backend: connect, check authorization,
//! subscribe to new messages on one chat, forward a message, and run until the
//! connection drops. [`Connector`] and [`MessagingClient`] describe exactly that so the
//! service can be driven by the Telegram client in production and a scripted fake in tests.

mod telegram;

pub use telegram::{login, TelegramClient, TelegramConnector};

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;

use crate::session::SessionStore;

/// Application identity presented at connect time. A session belongs to the app that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    pub api_id: i64,
    pub api_hash: String,
}

/// Reference to a chat: numeric id (e.g. -1002524727804) or public username (without the `@`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatRef {
    Id(i64),
    Username(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ChatRefError {
    #[error("empty chat reference")]
    Empty,
    #[error("chat reference must be a numeric id or @username: {0}")]
    Invalid(String),
}

impl FromStr for ChatRef {
    type Err = ChatRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ChatRefError::Empty);
        }
        if let Some(name) = s.strip_prefix('@') {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(ChatRefError::Invalid(s.to_string()));
            }
            return Ok(ChatRef::Username(name.to_string()));
        }
        s.parse::<i64>()
            .map(ChatRef::Id)
            .map_err(|_| ChatRefError::Invalid(s.to_string()))
    }
}

impl fmt::Display for ChatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRef::Id(id) => write!(f, "{}", id),
            ChatRef::Username(name) => write!(f, "@{}", name),
        }
    }
}

impl ChatRef {
    /// True if an incoming message from this chat belongs to the reference.
    pub fn matches(&self, chat_id: i64, chat_username: Option<&str>) -> bool {
        match self {
            ChatRef::Id(id) => *id == chat_id,
            ChatRef::Username(name) => chat_username
                .map(|u| u.eq_ignore_ascii_case(name))
                .unwrap_or(false),
        }
    }

    /// Value for a Bot API `chat_id` field.
    pub fn to_api_value(&self) -> serde_json::Value {
        match self {
            ChatRef::Id(id) => serde_json::Value::from(*id),
            ChatRef::Username(name) => serde_json::Value::String(format!("@{}", name)),
        }
    }
}

/// A new message on the subscribed chat. The service reads `id` and hands the rest back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub id: i64,
    pub chat_id: i64,
    pub chat_username: Option<String>,
    pub text: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connection(String),
    /// Rejected by the backend (rate limit, permissions, bad target). Displays the backend's own text.
    #[error("{description}")]
    Api { code: i64, description: String },
    #[error("session not authorized")]
    Unauthorized,
    #[error("a subscription is already registered")]
    AlreadySubscribed,
    #[error("session store {0} is in use by another process")]
    SessionLocked(String),
    #[error("session store io: {0}")]
    SessionIo(#[from] std::io::Error),
    #[error("session store format: {0}")]
    SessionFormat(#[from] serde_json::Error),
    #[error("unexpected response: {0}")]
    Protocol(String),
}

/// Opens connections to a messaging backend.
#[async_trait]
pub trait Connector: Send + Sync {
    type Client: MessagingClient;

    /// Connect using the application identity and the session store. Fails with
    /// [`ClientError::Connection`] when the backend is unreachable. Succeeds without a valid
    /// session; call [`MessagingClient::is_authorized`] to find out.
    async fn connect(
        &self,
        identity: &AppIdentity,
        session: SessionStore,
    ) -> Result<Self::Client, ClientError>;
}

/// A connected messaging backend.
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Whether the current session may act on behalf of the user/bot.
    async fn is_authorized(&self) -> Result<bool, ClientError>;

    /// Register the single new-message subscription for `source`. Events arrive on the returned
    /// receiver in the order the backend emits them, while [`run_until_disconnected`](Self::run_until_disconnected) is polled.
    async fn subscribe(&self, source: &ChatRef) -> Result<mpsc::Receiver<MessageEvent>, ClientError>;

    /// Forward `message` into `target`.
    async fn forward_message(&self, target: &ChatRef, message: &MessageEvent) -> Result<(), ClientError>;

    /// Drive event delivery until the connection is lost. Returns `Ok(())` on disconnect.
    async fn run_until_disconnected(&self) -> Result<(), ClientError>;
}
