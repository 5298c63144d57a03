//! Integration test: run the Telegram client against an in-process mock Bot API (axum on a free
//! port). Covers login, authorization, the getUpdates loop, forwarding, and disconnect handling.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::any,
    Json, Router,
};
use lib::client::{
    login, AppIdentity, ChatRef, ClientError, Connector, MessageEvent, MessagingClient,
    TelegramConnector,
};
use lib::config::ForwarderSettings;
use lib::service::{ForwarderService, RunOutcome};
use lib::session::{SessionData, SessionStore};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

const TOKEN: &str = "123:good";
const SOURCE: i64 = -100;

#[derive(Default)]
struct MockState {
    polls: Mutex<Vec<Option<i64>>>,
    forwarded: Mutex<Vec<Value>>,
}

fn api_ok(result: Value) -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "ok": true, "result": result })))
}

fn api_err(status: StatusCode, description: &str) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({
            "ok": false,
            "error_code": status.as_u16(),
            "description": description,
        })),
    )
}

async fn bot_api(
    State(state): State<Arc<MockState>>,
    Path((bot, method)): Path<(String, String)>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    if bot != format!("bot{}", TOKEN) {
        return api_err(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    match method.as_str() {
        "getMe" => api_ok(json!({ "id": 1, "is_bot": true, "username": "relay_bot" })),
        "getUpdates" => {
            let offset = body.get("offset").and_then(Value::as_i64);
            let mut polls = state.polls.lock().unwrap();
            polls.push(offset);
            if polls.len() > 1 {
                // Token revoked after the first batch: the client treats this as a disconnect.
                return api_err(StatusCode::UNAUTHORIZED, "Unauthorized");
            }
            api_ok(json!([
                { "update_id": 10, "channel_post": { "message_id": 42, "chat": { "id": SOURCE }, "text": "BTC long" } },
                { "update_id": 11, "channel_post": { "message_id": 7, "chat": { "id": -200 }, "text": "other chat" } },
                { "update_id": 12, "channel_post": { "message_id": 43, "chat": { "id": SOURCE }, "text": "ETH short" } },
                { "update_id": 13, "message": { "message_id": 44, "chat": { "id": SOURCE }, "caption": "chart" } }
            ]))
        }
        "forwardMessage" => {
            if body.get("message_id").and_then(Value::as_i64) == Some(43) {
                return api_err(
                    StatusCode::TOO_MANY_REQUESTS,
                    "Too Many Requests: retry after 5",
                );
            }
            state.forwarded.lock().unwrap().push(body);
            api_ok(json!({ "message_id": 900 }))
        }
        _ => api_err(StatusCode::NOT_FOUND, "Not Found"),
    }
}

async fn spawn_mock(state: Arc<MockState>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock bot api");
    let addr = listener.local_addr().expect("local_addr");
    let app = Router::new()
        .route("/:bot/:method", any(bot_api))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tgforward-telegram-test-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn identity() -> AppIdentity {
    AppIdentity {
        api_id: 29462291,
        api_hash: "hash".to_string(),
    }
}

fn seed_session(path: &std::path::Path, api_id: i64, token: &str) {
    let store = SessionStore::open(path).expect("open session");
    store
        .save(&SessionData {
            api_id,
            bot_token: token.to_string(),
            update_offset: None,
        })
        .expect("save session");
}

#[tokio::test]
async fn login_stores_session_for_valid_token() {
    let base = spawn_mock(Arc::new(MockState::default())).await;
    let dir = temp_dir();
    let store = SessionStore::open(dir.join("session.session")).expect("open");

    let bot = login(&base, &identity(), &store, TOKEN).await.expect("login");
    assert_eq!(bot, "@relay_bot");
    let data = store.load().expect("load").expect("session present");
    assert_eq!(data.api_id, identity().api_id);
    assert_eq!(data.bot_token, TOKEN);
}

#[tokio::test]
async fn login_rejects_bad_token_without_writing() {
    let base = spawn_mock(Arc::new(MockState::default())).await;
    let dir = temp_dir();
    let store = SessionStore::open(dir.join("session.session")).expect("open");

    let err = login(&base, &identity(), &store, "123:bad").await.unwrap_err();
    assert!(matches!(err, ClientError::Unauthorized));
    assert!(store.load().expect("load").is_none());
}

#[tokio::test]
async fn connect_to_unreachable_backend_fails() {
    let base = format!("http://127.0.0.1:{}", free_port());
    let dir = temp_dir();
    let store = SessionStore::open(dir.join("session.session")).expect("open");

    let res = TelegramConnector::new(base).connect(&identity(), store).await;
    assert!(matches!(res, Err(ClientError::Connection(_))));
}

#[tokio::test]
async fn authorization_depends_on_token_and_app_identity() {
    let base = spawn_mock(Arc::new(MockState::default())).await;
    let connector = TelegramConnector::new(base);

    let dir = temp_dir();
    let empty = SessionStore::open(dir.join("empty.session")).expect("open");
    let client = connector.connect(&identity(), empty).await.expect("connect");
    assert!(!client.is_authorized().await.expect("auth check"));

    let revoked = dir.join("revoked.session");
    seed_session(&revoked, identity().api_id, "123:revoked");
    let store = SessionStore::open(&revoked).expect("open");
    let client = connector.connect(&identity(), store).await.expect("connect");
    assert!(!client.is_authorized().await.expect("auth check"));

    let foreign = dir.join("foreign.session");
    seed_session(&foreign, 1, TOKEN);
    let store = SessionStore::open(&foreign).expect("open");
    let client = connector.connect(&identity(), store).await.expect("connect");
    assert!(!client.is_authorized().await.expect("auth check"));

    let good = dir.join("good.session");
    seed_session(&good, identity().api_id, TOKEN);
    let store = SessionStore::open(&good).expect("open");
    let client = connector.connect(&identity(), store).await.expect("connect");
    assert!(client.is_authorized().await.expect("auth check"));
}

#[tokio::test]
async fn only_one_subscription_allowed() {
    let base = spawn_mock(Arc::new(MockState::default())).await;
    let dir = temp_dir();
    let store = SessionStore::open(dir.join("session.session")).expect("open");
    let client = TelegramConnector::new(base)
        .connect(&identity(), store)
        .await
        .expect("connect");

    let _rx = client.subscribe(&ChatRef::Id(SOURCE)).await.expect("subscribe");
    let again = client.subscribe(&ChatRef::Id(SOURCE)).await;
    assert!(matches!(again, Err(ClientError::AlreadySubscribed)));
}

#[tokio::test]
async fn forward_error_carries_backend_description() {
    let base = spawn_mock(Arc::new(MockState::default())).await;
    let dir = temp_dir();
    let path = dir.join("session.session");
    seed_session(&path, identity().api_id, TOKEN);
    let store = SessionStore::open(&path).expect("open");
    let client = TelegramConnector::new(base)
        .connect(&identity(), store)
        .await
        .expect("connect");

    let event = MessageEvent {
        id: 43,
        chat_id: SOURCE,
        chat_username: None,
        text: None,
    };
    let err = client
        .forward_message(&ChatRef::Username("target".to_string()), &event)
        .await
        .unwrap_err();
    match err {
        ClientError::Api { code, description } => {
            assert_eq!(code, 429);
            assert_eq!(description, "Too Many Requests: retry after 5");
        }
        other => panic!("expected api error, got {:?}", other),
    }
}

#[tokio::test]
async fn service_forwards_source_posts_until_disconnected() {
    let state = Arc::new(MockState::default());
    let base = spawn_mock(state.clone()).await;
    let dir = temp_dir();
    let settings = ForwarderSettings {
        identity: identity(),
        source: ChatRef::Id(SOURCE),
        target: ChatRef::Username("manualsignalcheck".to_string()),
        session_path: dir.join("session.session"),
        log_file: dir.join("forwarder.log"),
        api_base: base.clone(),
    };
    seed_session(&settings.session_path, identity().api_id, TOKEN);

    let service = ForwarderService::new(TelegramConnector::new(base), settings.clone());
    assert_eq!(service.run().await, RunOutcome::Disconnected);

    let text = std::fs::read_to_string(&settings.log_file).expect("read log");
    assert!(text.contains("Connected and session authorized."));
    assert!(text.contains("Listening for new messages..."));
    assert!(text.contains("Message forwarded: 42"));
    assert!(text.contains("Error forwarding message: Too Many Requests: retry after 5"));
    assert!(text.contains("Message forwarded: 44"));
    assert!(!text.contains("Message forwarded: 7"));
    assert!(text.contains("Disconnected."));

    let forwarded = state.forwarded.lock().unwrap().clone();
    let ids: Vec<i64> = forwarded
        .iter()
        .filter_map(|b| b.get("message_id").and_then(Value::as_i64))
        .collect();
    assert_eq!(ids, vec![42, 44]);
    assert_eq!(forwarded[0]["chat_id"], json!("@manualsignalcheck"));
    assert_eq!(forwarded[0]["from_chat_id"], json!(SOURCE));

    assert_eq!(*state.polls.lock().unwrap(), vec![None, Some(14)]);
    let store = SessionStore::open(&settings.session_path).expect("reopen after run");
    let data = store.load().expect("load").expect("session present");
    assert_eq!(data.update_offset, Some(14));
}
