//! Editor-side WebSocket client.
//!
//! Connects to exactly one hot reload server, installs every `update` it
//! receives and answers with `done`. Problems are reported to the user as
//! toasts and never returned; there is no automatic reconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Error, Result};
use crate::installer::Installer;
use crate::protocol::{Envelope, Incoming};

pub const DEFAULT_SERVER_URL: &str = "ws://localhost:3000";

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SHORT_TOAST: Duration = Duration::from_millis(2000);
const LONG_TOAST: Duration = Duration::from_millis(3000);

struct Connection {
    url: String,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub struct SocketClient {
    installer: Arc<Installer>,
    connection: parking_lot::Mutex<Option<Connection>>,
}

impl SocketClient {
    pub fn new(installer: Installer) -> Self {
        Self {
            installer: Arc::new(installer),
            connection: parking_lot::Mutex::new(None),
        }
    }

    fn toast(&self, message: &str, duration: Duration) {
        self.installer.host().notifier.toast(message, duration);
    }

    /// Close any existing connection, then connect to `url`.
    pub async fn connect(&self, url: &str) {
        self.disconnect();

        let (url, stream) = match open(url).await {
            Ok(opened) => opened,
            Err(e) => {
                tracing::error!("{e}");
                let toast = match e {
                    Error::Configuration(_) => "Invalid Hot Reload Server URL",
                    _ => "Hot Reload Connection Error",
                };
                self.toast(toast, LONG_TOAST);
                return;
            }
        };
        tracing::info!("Connected to Hot Reload Server");
        self.toast("Connected to Hot Reload Server", LONG_TOAST);

        let (mut sink, mut source) = stream.split();
        let (outbound, mut queue) = unbounded_channel::<Message>();
        let connected = Arc::new(AtomicBool::new(true));

        let writer = tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let installer = self.installer.clone();
        let reader_connected = connected.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text.to_string(),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::warn!("Ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::error!("{}", Error::Connection(e.to_string()));
                        installer.host().notifier.toast("Hot Reload Connection Error", LONG_TOAST);
                        break;
                    }
                };
                handle_frame(&installer, &outbound, &text).await;
            }
            reader_connected.store(false, Ordering::SeqCst);
            tracing::info!("Disconnected from Hot Reload Server");
        });

        *self.connection.lock() = Some(Connection {
            url,
            connected,
            reader,
            writer,
        });
    }

    /// Close the connection if one is open. Safe to call repeatedly.
    pub fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().take() {
            tracing::info!("Closing connection to {}", connection.url);
            connection.connected.store(false, Ordering::SeqCst);
            connection.reader.abort();
            // Dropping the reader drops the outbound sender, which lets the
            // writer flush and send a close frame.
            drop(connection.writer);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .as_ref()
            .is_some_and(|c| c.connected.load(Ordering::SeqCst))
    }

    pub fn url(&self) -> Option<String> {
        self.connection.lock().as_ref().map(|c| c.url.clone())
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Validate `url` and complete the WebSocket handshake. A bad URL is a
/// `Configuration` error, a failed handshake a `Connection` error.
async fn open(url: &str) -> Result<(String, Stream)> {
    let parsed = url::Url::parse(url)
        .map_err(|e| Error::Configuration(format!("invalid WebSocket URL {url}: {e}")))?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return Err(Error::Configuration(format!(
            "invalid WebSocket URL {url}: unsupported scheme {}",
            parsed.scheme()
        )));
    }

    tracing::info!("Connecting to {parsed}...");
    let (stream, _) = connect_async(parsed.as_str())
        .await
        .map_err(|e| Error::Connection(format!("could not reach {parsed}: {e}")))?;
    Ok((parsed.to_string(), stream))
}

async fn handle_frame(installer: &Installer, outbound: &UnboundedSender<Message>, text: &str) {
    let notifier = &installer.host().notifier;
    let incoming = match Envelope::parse(text).and_then(Envelope::interpret) {
        Ok(incoming) => incoming,
        Err(e) => {
            tracing::error!("Error processing update: {e}");
            notifier.toast("Hot Reload Failed", LONG_TOAST);
            return;
        }
    };

    match incoming {
        Incoming::Update(update) => {
            notifier.toast("Receiving update...", SHORT_TOAST);
            match installer.install_plugin_zip(&update.zip).await {
                Ok(id) => {
                    tracing::info!("Installed update for plugin {id}");
                    notifier.toast("Hot Reload Complete", SHORT_TOAST);
                    if outbound.send(Message::text(Envelope::done().to_text())).is_err() {
                        tracing::debug!("Connection closed before done could be sent");
                    }
                }
                Err(e) => {
                    tracing::error!("Error processing update: {e}");
                    notifier.toast("Hot Reload Failed", LONG_TOAST);
                }
            }
        }
        other => tracing::debug!("Ignoring message: {other:?}"),
    }
}
