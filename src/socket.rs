//! WebSocket distribution server.
//!
//! Every connected editor gets its own outbound channel drained by a writer
//! task, so a slow client never holds up delivery to the others. Connection
//! changes and inbound frames are surfaced as [`ServerEvent`]s; nothing here
//! ever fails because of what a client sent.

use axum::extract::State;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use uuid::Uuid;

use crate::error::Result;
use crate::protocol::Envelope;

pub type ClientId = Uuid;

/// Body returned for plain HTTP requests to the server root.
pub const HEALTH_TEXT: &str = "Plugin hot reload server running";

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Listening(SocketAddr),
    /// A client finished its handshake. Carries the live connection count.
    Connection(usize),
    /// A client went away. Carries the live connection count.
    Disconnection(usize),
    Message { client: ClientId, envelope: Envelope },
}

/// State shared between the server handle and connection tasks.
pub(crate) struct Shared {
    clients: DashMap<ClientId, UnboundedSender<Message>>,
    events: UnboundedSender<ServerEvent>,
}

impl Shared {
    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    /// Queue a text frame for every open connection. Returns how many
    /// connections accepted it.
    fn broadcast_text(&self, text: &str) -> usize {
        let frame = Utf8Bytes::from(text.to_owned());
        self.clients
            .iter()
            .filter(|client| client.value().send(Message::Text(frame.clone())).is_ok())
            .count()
    }
}

pub struct SocketServer {
    port: u16,
    shared: Arc<Shared>,
    shutdown: parking_lot::Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
}

impl SocketServer {
    pub fn new(port: u16) -> (Self, UnboundedReceiver<ServerEvent>) {
        let (events, rx) = unbounded_channel();
        let server = Self {
            port,
            shared: Arc::new(Shared {
                clients: DashMap::new(),
                events,
            }),
            shutdown: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
        };
        (server, rx)
    }

    /// Bind `0.0.0.0:<port>` and start accepting connections in the
    /// background. Returns the bound address (useful with port 0).
    pub async fn start(&self) -> Result<SocketAddr> {
        self.shutdown();

        let bind_addr = format!("0.0.0.0:{}", self.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        *self.shutdown.lock() = Some(shutdown_tx);
        *self.local_addr.lock() = Some(addr);

        let app = build_router(self.shared.clone());
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await;
            if let Err(e) = result {
                tracing::error!("Hot reload server error: {e}");
            }
        });

        tracing::info!("Server started on port {}", addr.port());
        self.shared.emit(ServerEvent::Listening(addr));
        Ok(addr)
    }

    /// Stop accepting connections. Safe to call when not running.
    pub fn shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.len()
    }

    /// Send `{type, payload}` to every open connection.
    pub fn broadcast(&self, kind: &str, payload: Value) -> usize {
        self.broadcast_envelope(&Envelope::new(kind, payload))
    }

    pub fn broadcast_envelope(&self, envelope: &Envelope) -> usize {
        self.shared.broadcast_text(&envelope.to_text())
    }

    /// Read a file and broadcast it base64-encoded as an `update`. A missing
    /// or unreadable file sends nothing.
    pub async fn broadcast_file(&self, path: &Path) -> usize {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            tracing::debug!("Nothing to broadcast: {} does not exist", path.display());
            return 0;
        }
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to read {} for broadcast: {e}", path.display());
                return 0;
            }
        };
        self.broadcast_envelope(&Envelope::update(STANDARD.encode(bytes)))
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Build the router (exposed for testing). The root answers WebSocket
/// upgrades and plain GETs alike.
pub(crate) fn build_router(shared: Arc<Shared>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/{*path}", get(root))
        .with_state(shared)
}

async fn root(
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    State(shared): State<Arc<Shared>>,
) -> Response {
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_connection(socket, shared)),
        Err(_) => HEALTH_TEXT.into_response(),
    }
}

/// Drive one client connection until it closes.
async fn handle_connection(socket: WebSocket, shared: Arc<Shared>) {
    let id = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = unbounded_channel::<Message>();
    shared.clients.insert(id, tx);
    let count = shared.clients.len();
    tracing::info!("Client {id} connected. Total: {count}");
    shared.emit(ServerEvent::Connection(count));

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let text = match msg {
            Message::Text(text) => text.to_string(),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    tracing::warn!("Dropping non-UTF-8 binary frame from {id}");
                    continue;
                }
            },
            Message::Close(_) => break,
            _ => continue,
        };

        match Envelope::parse(&text) {
            Ok(envelope) => {
                tracing::debug!("Message from {id}: {}", envelope.kind);
                shared.emit(ServerEvent::Message {
                    client: id,
                    envelope,
                });
            }
            Err(e) => tracing::warn!("Failed to parse message from {id}: {e}"),
        }
    }

    shared.clients.remove(&id);
    send_task.abort();
    let count = shared.clients.len();
    tracing::info!("Client {id} disconnected. Total: {count}");
    shared.emit(ServerEvent::Disconnection(count));
}
