//! Telegram client: getMe / getUpdates long-poll / forwardMessage via the Bot API.

use crate::client::{AppIdentity, ChatRef, ClientError, Connector, MessageEvent, MessagingClient};
use crate::session::{SessionData, SessionStore};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

const LONG_POLL_TIMEOUT: u64 = 30;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_DELAY: Duration = Duration::from_secs(2);
/// Consecutive transport failures after which the connection counts as lost.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;
const EVENT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BotUser {
    id: i64,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<Message>,
    #[serde(default)]
    channel_post: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
    chat: Chat,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
    #[serde(default)]
    username: Option<String>,
}

impl From<Message> for MessageEvent {
    fn from(m: Message) -> Self {
        MessageEvent {
            id: m.message_id,
            chat_id: m.chat.id,
            chat_username: m.chat.username,
            text: m.text.or(m.caption),
        }
    }
}

/// POST `{api_base}/bot{token}/{method}` and unwrap the Bot API envelope.
async fn call_api<T: DeserializeOwned>(
    http: &reqwest::Client,
    api_base: &str,
    token: &str,
    method: &str,
    body: &serde_json::Value,
    timeout: Duration,
) -> Result<T, ClientError> {
    let url = format!("{}/bot{}/{}", api_base, token, method);
    let res = http
        .post(&url)
        .json(body)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| ClientError::Connection(e.to_string()))?;
    let status = res.status();
    let text = res
        .text()
        .await
        .map_err(|e| ClientError::Connection(e.to_string()))?;
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(ClientError::Unauthorized);
    }
    let data: ApiResponse<T> = match serde_json::from_str(&text) {
        Ok(d) => d,
        Err(_) if !status.is_success() => {
            return Err(ClientError::Api {
                code: i64::from(status.as_u16()),
                description: format!("{} failed: {} {}", method, status, text),
            })
        }
        Err(e) => return Err(ClientError::Protocol(format!("{}: {}", method, e))),
    };
    if !data.ok {
        let code = data.error_code.unwrap_or_else(|| i64::from(status.as_u16()));
        if code == 401 {
            return Err(ClientError::Unauthorized);
        }
        return Err(ClientError::Api {
            code,
            description: data
                .description
                .unwrap_or_else(|| format!("{} returned ok: false", method)),
        });
    }
    data.result
        .ok_or_else(|| ClientError::Protocol(format!("{} returned no result", method)))
}

/// Validate a bot token with getMe and store it as a fresh session bound to `identity`.
/// Returns the bot's display name (`@username`, or the numeric id when it has none).
pub async fn login(
    api_base: &str,
    identity: &AppIdentity,
    session: &SessionStore,
    token: &str,
) -> Result<String, ClientError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(ClientError::Unauthorized);
    }
    let http = reqwest::Client::new();
    let me: BotUser = call_api(
        &http,
        api_base,
        token,
        "getMe",
        &serde_json::json!({}),
        REQUEST_TIMEOUT,
    )
    .await?;
    session.save(&SessionData {
        api_id: identity.api_id,
        bot_token: token.to_string(),
        update_offset: None,
    })?;
    log::info!("telegram: session stored at {}", session.path().display());
    Ok(me
        .username
        .map(|u| format!("@{}", u))
        .unwrap_or_else(|| me.id.to_string()))
}

/// Opens [`TelegramClient`] connections against one Bot API endpoint.
pub struct TelegramConnector {
    api_base: String,
    http: reqwest::Client,
}

impl TelegramConnector {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Connector for TelegramConnector {
    type Client = TelegramClient;

    async fn connect(
        &self,
        identity: &AppIdentity,
        session: SessionStore,
    ) -> Result<TelegramClient, ClientError> {
        let credential = session.load()?;
        let client = TelegramClient {
            api_base: self.api_base.clone(),
            http: self.http.clone(),
            identity: identity.clone(),
            session,
            credential: Mutex::new(credential),
            subscription: Mutex::new(None),
        };
        client.probe().await?;
        log::info!("telegram: connected to {}", client.api_base);
        Ok(client)
    }
}

struct Subscription {
    source: ChatRef,
    tx: mpsc::Sender<MessageEvent>,
}

/// Connected Bot API client. Holds the session store (and its lock) for its lifetime.
pub struct TelegramClient {
    api_base: String,
    http: reqwest::Client,
    identity: AppIdentity,
    session: SessionStore,
    credential: Mutex<Option<SessionData>>,
    subscription: Mutex<Option<Subscription>>,
}

impl TelegramClient {
    /// Reachability check: any HTTP answer from the Bot API is enough.
    async fn probe(&self) -> Result<(), ClientError> {
        let token = self
            .credential
            .lock()
            .await
            .as_ref()
            .map(|c| c.bot_token.clone())
            .unwrap_or_default();
        let url = format!("{}/bot{}/getMe", self.api_base, token);
        self.http
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn token(&self) -> Result<String, ClientError> {
        self.credential
            .lock()
            .await
            .as_ref()
            .map(|c| c.bot_token.clone())
            .ok_or(ClientError::Unauthorized)
    }

    async fn get_updates(&self, token: &str, offset: Option<i64>) -> Result<Vec<Update>, ClientError> {
        let mut body = serde_json::json!({
            "timeout": LONG_POLL_TIMEOUT,
            "allowed_updates": ["message", "channel_post"],
        });
        if let Some(off) = offset {
            body["offset"] = serde_json::Value::from(off);
        }
        call_api(
            &self.http,
            &self.api_base,
            token,
            "getUpdates",
            &body,
            Duration::from_secs(LONG_POLL_TIMEOUT + 10),
        )
        .await
    }

    /// Remember the next offset in the session so a restart does not replay delivered updates.
    async fn persist_offset(&self, offset: i64) {
        let snapshot = {
            let mut g = self.credential.lock().await;
            match g.as_mut() {
                Some(c) => {
                    c.update_offset = Some(offset);
                    c.clone()
                }
                None => return,
            }
        };
        if let Err(e) = self.session.save_async(&snapshot).await {
            log::warn!("telegram: could not persist update offset: {}", e);
        }
    }
}

#[async_trait]
impl MessagingClient for TelegramClient {
    async fn is_authorized(&self) -> Result<bool, ClientError> {
        let token = {
            let g = self.credential.lock().await;
            let Some(c) = g.as_ref() else {
                log::debug!("telegram: no session credential");
                return Ok(false);
            };
            if c.api_id != self.identity.api_id {
                log::warn!(
                    "telegram: session was created for app {}, not {}",
                    c.api_id,
                    self.identity.api_id
                );
                return Ok(false);
            }
            c.bot_token.clone()
        };
        let me: Result<BotUser, ClientError> = call_api(
            &self.http,
            &self.api_base,
            &token,
            "getMe",
            &serde_json::json!({}),
            REQUEST_TIMEOUT,
        )
        .await;
        match me {
            Ok(user) => {
                log::debug!("telegram: authorized as bot {}", user.id);
                Ok(true)
            }
            Err(ClientError::Unauthorized) => Ok(false),
            // A malformed token yields 404 rather than 401.
            Err(ClientError::Api { code: 404, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn subscribe(&self, source: &ChatRef) -> Result<mpsc::Receiver<MessageEvent>, ClientError> {
        let mut g = self.subscription.lock().await;
        if g.is_some() {
            return Err(ClientError::AlreadySubscribed);
        }
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        *g = Some(Subscription {
            source: source.clone(),
            tx,
        });
        log::debug!("telegram: subscribed to {}", source);
        Ok(rx)
    }

    async fn forward_message(&self, target: &ChatRef, message: &MessageEvent) -> Result<(), ClientError> {
        let token = self.token().await?;
        let body = serde_json::json!({
            "chat_id": target.to_api_value(),
            "from_chat_id": message.chat_id,
            "message_id": message.id,
        });
        let _: serde_json::Value = call_api(
            &self.http,
            &self.api_base,
            &token,
            "forwardMessage",
            &body,
            REQUEST_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn run_until_disconnected(&self) -> Result<(), ClientError> {
        let (source, tx) = {
            let g = self.subscription.lock().await;
            let sub = g.as_ref().ok_or_else(|| {
                ClientError::Protocol("run_until_disconnected called without a subscription".to_string())
            })?;
            (sub.source.clone(), sub.tx.clone())
        };
        let token = self.token().await?;
        let mut offset = self
            .credential
            .lock()
            .await
            .as_ref()
            .and_then(|c| c.update_offset);
        let mut failures = 0u32;
        log::info!("telegram: starting getUpdates long-poll loop");
        loop {
            match self.get_updates(&token, offset).await {
                Ok(updates) => {
                    failures = 0;
                    let next = updates.iter().map(|u| u.update_id).max().map(|id| id + 1);
                    for u in updates {
                        let Some(msg) = u.message.or(u.channel_post) else {
                            continue;
                        };
                        if !source.matches(msg.chat.id, msg.chat.username.as_deref()) {
                            continue;
                        }
                        if tx.send(MessageEvent::from(msg)).await.is_err() {
                            log::debug!("telegram: event receiver closed, stopping loop");
                            return Ok(());
                        }
                    }
                    if let Some(n) = next {
                        offset = Some(n);
                        self.persist_offset(n).await;
                    }
                }
                Err(ClientError::Unauthorized) => {
                    log::warn!("telegram: session no longer authorized, disconnecting");
                    return Ok(());
                }
                Err(ClientError::Api { code: 409, description }) => {
                    log::warn!("telegram: getUpdates conflict, disconnecting: {}", description);
                    return Ok(());
                }
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        log::warn!("telegram: connection lost after {} failures: {}", failures, e);
                        return Ok(());
                    }
                    log::debug!("telegram getUpdates error: {}", e);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }
}
