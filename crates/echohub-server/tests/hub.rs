//! End-to-end tests against a real server with WebSocket clients.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use echohub_core::UserId;
use echohub_server::{start, HubConfig, ServerHandle};
use echohub_store::messages::PageRequest;
use echohub_store::sessions::default_session_ttl;
use echohub_store::users::NewUser;
use echohub_store::{ConversationRepo, Database, MessageRepo, SessionRepo, UserRepo};

const TIMEOUT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct TestHub {
    handle: ServerHandle,
    db: Database,
}

struct User {
    id: i64,
    token: String,
}

fn test_config() -> HubConfig {
    let mut config = HubConfig::default();
    config.server.host = "127.0.0.1".into();
    config.server.port = 0;
    config.rate_limit.limit = 10_000;
    config
}

async fn boot(config: HubConfig) -> TestHub {
    let db = Database::in_memory().unwrap();
    let handle = start(&config, db.clone()).await.unwrap();
    TestHub { handle, db }
}

impl TestHub {
    fn user(&self, username: &str) -> User {
        let id = UserRepo::new(self.db.clone())
            .insert(&NewUser {
                username: username.into(),
                first_name: username.into(),
                email: format!("{username}@example.com"),
                ..NewUser::default()
            })
            .unwrap();
        let session = SessionRepo::new(self.db.clone())
            .create(id, default_session_ttl())
            .unwrap();
        User {
            id: id.get(),
            token: session.token,
        }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.handle.addr())
    }

    async fn connect(&self, user: &User) -> WsStream {
        let mut request = self.ws_url().into_client_request().unwrap();
        request.headers_mut().insert(
            "cookie",
            HeaderValue::from_str(&format!("session_id={}", user.token)).unwrap(),
        );
        let (ws, _) = connect_async(request).await.unwrap();
        ws
    }

    /// Wait until the registry holds exactly `n` connections.
    async fn wait_for_connections(&self, n: usize) {
        timeout(TIMEOUT, async {
            while self.handle.connections() != n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection count never settled");
    }
}

async fn send(ws: &mut WsStream, frame: Value) {
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// True if no text frame arrives within a short quiet period.
async fn stays_quiet(ws: &mut WsStream) -> bool {
    loop {
        match timeout(QUIET, ws.next()).await {
            Err(_) => return true,
            Ok(Some(Ok(Message::Text(_)))) => return false,
            Ok(Some(Ok(_))) => continue,
            Ok(_) => return true,
        }
    }
}

/// Drain until the server closes the stream.
async fn expect_closed(ws: &mut WsStream) {
    timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("server did not close the connection");
}

#[tokio::test]
async fn chat_is_acked_persisted_and_delivered() {
    let hub = boot(test_config()).await;
    let a = hub.user("amine");
    let b = hub.user("badr");
    let mut ws_a = hub.connect(&a).await;
    let mut ws_b = hub.connect(&b).await;
    hub.wait_for_connections(2).await;

    send(
        &mut ws_a,
        json!({"type": "message", "reciever_id": b.id, "content": "hello", "temp_id": 42}),
    )
    .await;

    let ack = read_json(&mut ws_a).await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["temp_id"], 42);
    assert_eq!(ack["content"], "Message delivered");
    let conversation_id = ack["conversation_id"].as_i64().unwrap();

    let delivered = read_json(&mut ws_b).await;
    assert_eq!(delivered["type"], "message");
    assert_eq!(delivered["author_id"], a.id);
    assert_eq!(delivered["content"], "hello");
    assert_eq!(delivered["conversation_id"], conversation_id);

    // The sender does not get its own broadcast copy.
    assert!(stays_quiet(&mut ws_a).await);

    let stored = MessageRepo::new(hub.db.clone())
        .page(
            UserId::new(b.id),
            PageRequest {
                conversation_id: conversation_id.into(),
                before_id: -1,
                limit: 10,
            },
        )
        .unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].author_id, UserId::new(a.id));
    assert!(!stored[0].is_outgoing);

    let conversation = ConversationRepo::new(hub.db.clone())
        .get(conversation_id.into())
        .unwrap();
    assert!(conversation.last_message_at.is_some());
}

#[tokio::test]
async fn client_supplied_author_is_overwritten() {
    let hub = boot(test_config()).await;
    let a = hub.user("amine");
    let b = hub.user("badr");
    let mut ws_a = hub.connect(&a).await;
    let mut ws_b = hub.connect(&b).await;
    hub.wait_for_connections(2).await;

    send(
        &mut ws_a,
        json!({"type": "message", "author_id": b.id, "reciever_id": b.id, "content": "spoof"}),
    )
    .await;
    read_json(&mut ws_a).await;
    let delivered = read_json(&mut ws_b).await;
    assert_eq!(delivered["author_id"], a.id);
}

#[tokio::test]
async fn concurrent_first_contact_shares_one_conversation() {
    let hub = boot(test_config()).await;
    let a = hub.user("amine");
    let b = hub.user("badr");
    let mut ws_a = hub.connect(&a).await;
    let mut ws_b = hub.connect(&b).await;
    hub.wait_for_connections(2).await;

    let to_b = json!({"type": "message", "reciever_id": b.id, "content": "hi b", "temp_id": 1});
    let to_a = json!({"type": "message", "reciever_id": a.id, "content": "hi a", "temp_id": 2});
    tokio::join!(send(&mut ws_a, to_b), send(&mut ws_b, to_a));

    // Each side sees its own ack and the other's message, in either order.
    let mut conversation_ids = Vec::new();
    for ws in [&mut ws_a, &mut ws_b] {
        for _ in 0..2 {
            let frame = read_json(ws).await;
            conversation_ids.push(frame["conversation_id"].as_i64().unwrap());
        }
    }
    assert!(conversation_ids.windows(2).all(|w| w[0] == w[1]));

    let rows = ConversationRepo::new(hub.db.clone())
        .list_for_user(UserId::new(a.id))
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn typing_reaches_everyone_but_the_author() {
    let hub = boot(test_config()).await;
    let a = hub.user("amine");
    let b = hub.user("badr");
    let c = hub.user("chama");
    let mut ws_a = hub.connect(&a).await;
    let mut ws_b = hub.connect(&b).await;
    let mut ws_c = hub.connect(&c).await;
    hub.wait_for_connections(3).await;

    send(&mut ws_a, json!({"type": "typing", "conversation_id": 5})).await;

    for ws in [&mut ws_b, &mut ws_c] {
        let frame = read_json(ws).await;
        assert_eq!(frame["type"], "typing");
        assert_eq!(frame["author_id"], a.id);
        assert_eq!(frame["conversation_id"], 5);
    }
    assert!(stays_quiet(&mut ws_a).await);
}

#[tokio::test]
async fn invalid_chat_gets_error_and_connection_survives() {
    let hub = boot(test_config()).await;
    let a = hub.user("amine");
    let b = hub.user("badr");
    let mut ws_a = hub.connect(&a).await;

    send(
        &mut ws_a,
        json!({"type": "message", "reciever_id": b.id, "content": "", "temp_id": 7}),
    )
    .await;
    let err = read_json(&mut ws_a).await;
    assert!(err["error"].is_string());
    assert_eq!(err["temp_id"], 7);

    send(&mut ws_a, json!({"type": "user_status"})).await;
    send(
        &mut ws_a,
        json!({"type": "message", "reciever_id": b.id, "content": "ok", "temp_id": 8}),
    )
    .await;
    let ack = read_json(&mut ws_a).await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["temp_id"], 8);
}

#[tokio::test]
async fn malformed_frame_closes_and_unregisters() {
    let hub = boot(test_config()).await;
    let a = hub.user("amine");
    let mut ws = hub.connect(&a).await;
    hub.wait_for_connections(1).await;

    ws.send(Message::text("{not json")).await.unwrap();
    expect_closed(&mut ws).await;
    hub.wait_for_connections(0).await;
}

#[tokio::test]
async fn client_close_unregisters() {
    let hub = boot(test_config()).await;
    let a = hub.user("amine");
    let mut ws = hub.connect(&a).await;
    hub.wait_for_connections(1).await;

    ws.close(None).await.unwrap();
    hub.wait_for_connections(0).await;
}

#[tokio::test]
async fn unauthenticated_socket_is_refused() {
    let hub = boot(test_config()).await;
    let (mut ws, _) = connect_async(hub.ws_url()).await.unwrap();

    let frame = read_json(&mut ws).await;
    assert_eq!(frame, json!({"error": "Unauthorized"}));
    expect_closed(&mut ws).await;
    assert_eq!(hub.handle.connections(), 0);
}

#[tokio::test]
async fn http_routes_are_rate_limited() {
    let mut config = test_config();
    config.rate_limit.limit = 3;
    config.rate_limit.window_ms = 60_000;
    let hub = boot(config).await;
    let client = reqwest::Client::new();
    let url = format!("http://{}/health", hub.handle.addr());

    for _ in 0..3 {
        let response = client.get(&url).send().await.unwrap();
        assert_eq!(response.status(), 200);
    }
    let rejected = client.get(&url).send().await.unwrap();
    assert_eq!(rejected.status(), 429);
    let body: Value = rejected.json().await.unwrap();
    assert!(body["error"].is_string());

    // The upgrade endpoint sits behind the same limiter.
    assert!(connect_async(hub.ws_url()).await.is_err());
}

#[tokio::test]
async fn shutdown_closes_live_connections() {
    let hub = boot(test_config()).await;
    let a = hub.user("amine");
    let mut ws = hub.connect(&a).await;
    hub.wait_for_connections(1).await;

    let TestHub { handle, .. } = hub;
    assert!(handle.shutdown(Some(Duration::from_secs(5))).await);
    expect_closed(&mut ws).await;
}
