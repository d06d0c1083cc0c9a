//! The per-identity session lifecycle: connect, answer the server's AUTH
//! challenge, keep the connection alive with periodic pings, and reconnect
//! after a fixed delay whenever the transport dies. One session never
//! affects another; all of its state lives on its own task.

pub mod protocol;

use std::fmt;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior, sleep};
use tokio_tungstenite::tungstenite::Message;
use tracing::{Instrument, debug, error, info, info_span, warn};
use url::Url;
use uuid::Uuid;

use crate::config::Config;
use crate::identity::Identity;
use crate::proxy::ProxyRef;
use crate::session::protocol::{ACTION_AUTH, ACTION_PONG, AuthReply, Envelope, Ping};
use crate::transport::{self, TransportError, WsStream};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Why a live connection ended. Both outcomes feed the same reconnect
/// loop; an error additionally tears the transport down without a
/// graceful close.
#[derive(Debug)]
pub enum CloseReason {
    Remote(Option<u16>),
    Errored(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Remote(Some(code)) => write!(f, "closed by remote (code {code})"),
            CloseReason::Remote(None) => write!(f, "connection ended"),
            CloseReason::Errored(err) => write!(f, "transport error: {err}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Handshaking,
    Active,
}

#[derive(Debug, PartialEq, Eq)]
enum Dispatch {
    None,
    Activated,
}

/// One logical session for one identity+proxy pair. The `browser_id` is
/// generated once and reused in every AUTH reply across reconnects; it
/// identifies this client to the endpoints independent of transport churn.
pub struct Session {
    identity: Arc<Identity>,
    proxy: Option<ProxyRef>,
    config: Arc<Config>,
    browser_id: Uuid,
    last_endpoint: Option<Url>,
}

impl Session {
    pub fn new(identity: Arc<Identity>, proxy: Option<ProxyRef>, config: Arc<Config>) -> Self {
        Self {
            identity,
            proxy,
            config,
            browser_id: Uuid::new_v4(),
            last_endpoint: None,
        }
    }

    pub fn browser_id(&self) -> Uuid {
        self.browser_id
    }

    fn peer_label(&self) -> String {
        self.proxy
            .as_ref()
            .map(|proxy| proxy.to_string())
            .unwrap_or_else(|| "direct".to_string())
    }

    /// Run the session forever: connect, drive until the connection dies,
    /// wait the fixed reconnect delay, repeat.
    pub async fn run(mut self) {
        let span = info_span!("session", peer = %self.peer_label());
        async move {
            loop {
                match self.connect_once().await {
                    Ok(reason @ CloseReason::Errored(_)) => {
                        warn!(%reason, "connection terminated")
                    }
                    Ok(reason) => info!(%reason, "connection closed"),
                    Err(err) => warn!(error = %err, "connect attempt failed"),
                }
                debug!(
                    delay_secs = self.config.reconnect_delay.as_secs(),
                    last_endpoint = ?self.last_endpoint.as_ref().map(Url::as_str),
                    "scheduling reconnect"
                );
                sleep(self.config.reconnect_delay).await;
            }
        }
        .instrument(span)
        .await
    }

    async fn connect_once(&mut self) -> Result<CloseReason, SessionError> {
        let endpoint = self.config.pick_endpoint().clone();
        info!(%endpoint, "connecting");
        let stream = transport::connect_websocket(
            &endpoint,
            self.proxy.as_ref(),
            &self.identity,
            self.config.handshake_timeout,
        )
        .await?;
        self.last_endpoint = Some(endpoint);
        info!("websocket connected, awaiting server challenge");
        Ok(self.drive(stream).await)
    }

    /// Consume connection events and the keepalive tick in one place; all
    /// state transitions happen here.
    async fn drive(&self, stream: WsStream) -> CloseReason {
        let (conn, mut events) = Connection::start(stream);
        let mut phase = Phase::Handshaking;
        // Never polled before the handshake completes; reset on AUTH so the
        // first ping lands one full interval after activation.
        let mut keepalive = time::interval(self.config.ping_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                _ = keepalive.tick(), if phase == Phase::Active => {
                    let ping = Ping::new();
                    debug!(id = %ping.id, "sending keepalive ping");
                    conn.send_json(&ping, "ping");
                }
                event = events.recv() => match event {
                    Some(ConnectionEvent::Frame(raw)) => {
                        if self.dispatch(&raw, &conn) == Dispatch::Activated
                            && phase == Phase::Handshaking
                        {
                            phase = Phase::Active;
                            keepalive.reset();
                            info!("handshake complete, keepalive armed");
                        }
                    }
                    Some(ConnectionEvent::Closed(code)) => break CloseReason::Remote(code),
                    Some(ConnectionEvent::Errored(err)) => break CloseReason::Errored(err),
                    None => break CloseReason::Errored("connection event channel closed".to_string()),
                }
            }
        };

        // Aborting the pump tasks drops the socket: for errors this is the
        // immediate (non-graceful) teardown; keepalive dies with the loop.
        conn.shutdown();
        reason
    }

    fn dispatch(&self, raw: &str, conn: &Connection) -> Dispatch {
        debug!(frame = raw, "received frame");
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, frame = raw, "dropping unparseable frame");
                return Dispatch::None;
            }
        };

        match envelope.action.as_str() {
            ACTION_AUTH => {
                let reply = AuthReply::new(
                    &envelope.id,
                    self.browser_id,
                    &self.identity,
                    &self.config.client_version,
                );
                info!(id = %envelope.id, "answering auth challenge");
                conn.send_json(&reply, "auth reply");
                Dispatch::Activated
            }
            ACTION_PONG => {
                debug!(id = %envelope.id, "received pong");
                Dispatch::None
            }
            other => {
                warn!(action = other, data = ?envelope.data, "unrecognized action");
                Dispatch::None
            }
        }
    }
}

enum ConnectionEvent {
    Frame(String),
    Closed(Option<u16>),
    Errored(String),
}

/// Writer/reader pump around one WebSocket connection. Outbound messages
/// go through an unbounded channel to the writer task; inbound frames and
/// the close/error outcome come back as events.
struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    fn start(stream: WsStream) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<ConnectionEvent>();
        let (mut sink, mut source) = stream.split();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            let mut terminal_sent = false;
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let _ = event_tx.send(ConnectionEvent::Frame(text));
                    }
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            let _ = event_tx.send(ConnectionEvent::Frame(text));
                        }
                        Err(_) => warn!("dropping non-utf8 binary frame"),
                    },
                    Ok(Message::Close(frame)) => {
                        let code = frame.map(|frame| u16::from(frame.code));
                        let _ = event_tx.send(ConnectionEvent::Closed(code));
                        terminal_sent = true;
                        break;
                    }
                    // Transport-level ping/pong is answered by tungstenite.
                    Ok(_) => {}
                    Err(err) => {
                        let _ = event_tx.send(ConnectionEvent::Errored(err.to_string()));
                        terminal_sent = true;
                        break;
                    }
                }
            }
            if !terminal_sent {
                let _ = event_tx.send(ConnectionEvent::Closed(None));
            }
        });

        (
            Self {
                outbound,
                tasks: vec![writer, reader],
            },
            event_rx,
        )
    }

    /// Serialize and send one message. When the connection is not open
    /// this logs and drops the message; nothing queues or retries.
    fn send_json<T: Serialize>(&self, message: &T, kind: &str) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(err) => {
                error!(error = %err, kind, "failed to encode outbound message");
                return;
            }
        };
        debug!(message = %text, kind, "sending message");
        if self.outbound.send(Message::Text(text)).is_err() {
            error!(kind, "websocket is not open, message dropped");
        }
    }

    fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}
