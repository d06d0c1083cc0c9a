//! Drives a real `Session` against an in-process WebSocket endpoint and
//! asserts the handshake, keepalive, and reconnect behavior observed from
//! the server side.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use url::Url;
use uuid::Uuid;

use holdfast::config::Config;
use holdfast::identity::Identity;
use holdfast::session::Session;

const WINDOWS_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";
const MAC_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";

#[derive(Debug)]
enum ServerEvent {
    Connected {
        attempt: usize,
        headers: Vec<(String, String)>,
    },
    Received {
        attempt: usize,
        frame: Value,
    },
}

/// What the fixture endpoint does after the client answers the challenge.
#[derive(Clone, Copy, PartialEq)]
enum Mode {
    CloseAfterAuthReply,
    KeepOpen,
}

#[derive(Clone)]
struct FixtureState {
    events: mpsc::UnboundedSender<ServerEvent>,
    attempts: Arc<AtomicUsize>,
    mode: Mode,
}

async fn spawn_fixture(mode: Mode) -> (SocketAddr, mpsc::UnboundedReceiver<ServerEvent>) {
    let (events, events_rx) = mpsc::unbounded_channel();
    let state = FixtureState {
        events,
        attempts: Arc::new(AtomicUsize::new(0)),
        mode,
    };
    let app = Router::new().route("/", get(ws_handler)).with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fixture");
    let addr = listener.local_addr().expect("fixture addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve fixture");
    });
    (addr, events_rx)
}

async fn ws_handler(
    State(state): State<FixtureState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let captured = ["user-agent", "os", "browser", "platform", "pragma"]
        .iter()
        .filter_map(|name| {
            headers
                .get(*name)
                .and_then(|value| value.to_str().ok())
                .map(|value| (name.to_string(), value.to_string()))
        })
        .collect::<Vec<_>>();
    ws.on_upgrade(move |socket| handle_socket(socket, state, captured))
}

async fn handle_socket(mut socket: WebSocket, state: FixtureState, headers: Vec<(String, String)>) {
    let attempt = state.attempts.fetch_add(1, Ordering::SeqCst) + 1;
    let _ = state.events.send(ServerEvent::Connected { attempt, headers });

    let challenge = json!({"id": format!("m{attempt}"), "action": "AUTH"}).to_string();
    if socket.send(WsMessage::Text(challenge)).await.is_err() {
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        if let WsMessage::Text(text) = message {
            let frame: Value = serde_json::from_str(&text).expect("client frames are json");
            let _ = state.events.send(ServerEvent::Received { attempt, frame });
            if state.mode == Mode::CloseAfterAuthReply {
                // Dropping the socket is the induced failure.
                break;
            }
        }
    }
}

fn test_config(addr: SocketAddr) -> Config {
    Config {
        endpoints: vec![Url::parse(&format!("ws://{addr}/")).expect("endpoint url")],
        ping_interval: Duration::from_millis(200),
        reconnect_delay: Duration::from_millis(100),
        handshake_timeout: Duration::from_secs(5),
        ..Config::default()
    }
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for fixture event")
        .expect("fixture closed")
}

async fn expect_connected(
    rx: &mut mpsc::UnboundedReceiver<ServerEvent>,
) -> (usize, Vec<(String, String)>) {
    match next_event(rx).await {
        ServerEvent::Connected { attempt, headers } => (attempt, headers),
        other => panic!("expected a connection, got {other:?}"),
    }
}

async fn expect_received(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> (usize, Value) {
    match next_event(rx).await {
        ServerEvent::Received { attempt, frame } => (attempt, frame),
        other => panic!("expected a client frame, got {other:?}"),
    }
}

#[tokio::test]
async fn auth_reply_echoes_id_and_browser_id_survives_reconnects() {
    let (addr, mut events) = spawn_fixture(Mode::CloseAfterAuthReply).await;
    let identity = Arc::new(Identity::new("abc123", Some(WINDOWS_UA.to_string())).unwrap());
    let session = Session::new(identity, None, Arc::new(test_config(addr)));
    let runner = tokio::spawn(session.run());

    let (attempt, _) = expect_connected(&mut events).await;
    assert_eq!(attempt, 1);
    let (_, reply) = expect_received(&mut events).await;
    assert_eq!(reply["id"], "m1");
    assert_eq!(reply["origin_action"], "AUTH");
    assert_eq!(reply["result"]["user_id"], "abc123");
    assert_eq!(reply["result"]["user_agent"], WINDOWS_UA);
    assert_eq!(reply["result"]["device_type"], "desktop");
    assert_eq!(reply["result"]["version"], "4.29.0");
    assert!(reply["result"]["timestamp"].as_u64().unwrap() > 0);
    let first_browser_id = reply["result"]["browser_id"].as_str().unwrap().to_string();
    Uuid::parse_str(&first_browser_id).expect("browser_id is a uuid");

    // The fixture closed the socket; the session must come back on its own
    // and present the same logical client.
    let (attempt, _) = expect_connected(&mut events).await;
    assert_eq!(attempt, 2);
    let (_, reply) = expect_received(&mut events).await;
    assert_eq!(reply["id"], "m2");
    assert_eq!(reply["result"]["browser_id"], first_browser_id.as_str());

    // Two induced failures, three observed attempts.
    let (attempt, _) = expect_connected(&mut events).await;
    assert_eq!(attempt, 3);

    runner.abort();
}

#[tokio::test]
async fn pings_flow_only_after_the_auth_reply() {
    let (addr, mut events) = spawn_fixture(Mode::KeepOpen).await;
    let identity = Arc::new(Identity::new("abc123", Some(MAC_UA.to_string())).unwrap());
    let session = Session::new(identity, None, Arc::new(test_config(addr)));
    let runner = tokio::spawn(session.run());

    let _ = expect_connected(&mut events).await;

    // First client frame is the handshake completion, never a ping.
    let (_, reply) = expect_received(&mut events).await;
    assert_eq!(reply["origin_action"], "AUTH");

    let (_, ping) = expect_received(&mut events).await;
    assert_eq!(ping["action"], "PING");
    assert_eq!(ping["version"], "1.0.0");
    assert_eq!(ping["data"], json!({}));
    let first_id = ping["id"].as_str().unwrap().to_string();
    Uuid::parse_str(&first_id).expect("ping id is a uuid");

    let (_, ping) = expect_received(&mut events).await;
    assert_eq!(ping["action"], "PING");
    assert_ne!(ping["id"].as_str().unwrap(), first_id);

    runner.abort();
}

#[tokio::test]
async fn upgrade_request_presents_the_browser_header_set() {
    let (addr, mut events) = spawn_fixture(Mode::KeepOpen).await;
    let identity = Arc::new(Identity::new("abc123", Some(MAC_UA.to_string())).unwrap());
    let session = Session::new(identity, None, Arc::new(test_config(addr)));
    let runner = tokio::spawn(session.run());

    let (_, headers) = expect_connected(&mut events).await;
    let get = |name: &str| {
        headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    };
    assert_eq!(get("user-agent"), Some(MAC_UA));
    assert_eq!(get("os"), Some("Mac"));
    assert_eq!(get("browser"), Some("Chrome"));
    assert_eq!(get("platform"), Some("Desktop"));
    assert_eq!(get("pragma"), Some("no-cache"));

    runner.abort();
}
