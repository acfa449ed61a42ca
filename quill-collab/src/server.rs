//! WebSocket transport: one task per connection, routed by path.
//!
//! ```text
//! ws://host/ws/{document_id}
//!        │
//!        ▼
//!  handshake ── bad path ──► 404
//!        │
//!        ▼
//!  hub.open ──► select! { socket frame → hub.handle_client
//!                         outbound queue → socket }
//!        │
//!        ▼
//!  hub.disconnect
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

use crate::hub::{ClientHandle, FanoutHub};
use crate::protocol::{ClientMessage, DocumentId};

type ConnectionError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames queued per connection before it is dropped as unresponsive
    pub outbound_capacity: usize,
    /// Longest accepted document id, in bytes
    pub max_document_id_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            outbound_capacity: 256,
            max_document_id_len: 256,
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, small queues.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            outbound_capacity: 32,
            max_document_id_len: 64,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub messages_received: u64,
    pub malformed_messages: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
    messages_received: AtomicU64,
    malformed_messages: AtomicU64,
}

/// Extract the document id from a request path.
///
/// Accepts `/ws/{id}` and `/{id}`; a query string is ignored. The id must be
/// non-empty, contain no `/` and be at most `max_len` bytes.
pub fn document_id_from_path(path: &str, max_len: usize) -> Option<DocumentId> {
    let path = path.split('?').next().unwrap_or_default();
    let path = path.strip_prefix('/')?;
    let id = path.strip_prefix("ws/").unwrap_or(path);
    if id.is_empty() || id == "ws" || id.contains('/') || id.len() > max_len {
        return None;
    }
    Some(DocumentId::from(id))
}

/// The collaboration socket server.
pub struct CollabServer {
    config: ServerConfig,
    hub: Arc<FanoutHub>,
    stats: Arc<AtomicServerStats>,
}

impl CollabServer {
    pub fn new(config: ServerConfig, hub: Arc<FanoutHub>) -> Self {
        Self {
            config,
            hub,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(&self.config.bind_addr).await
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!("Collab server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let config = self.config.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, config, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<FanoutHub>,
        config: ServerConfig,
        stats: Arc<AtomicServerStats>,
    ) -> Result<(), ConnectionError> {
        let mut routed: Option<DocumentId> = None;
        let handshake = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
            match document_id_from_path(request.uri().path(), config.max_document_id_len) {
                Some(document_id) => {
                    routed = Some(document_id);
                    Ok(response)
                }
                None => {
                    let mut rejection = ErrorResponse::new(Some("Unknown document path".to_string()));
                    *rejection.status_mut() = StatusCode::NOT_FOUND;
                    Err(rejection)
                }
            }
        })
        .await;

        let ws_stream = match handshake {
            Ok(ws_stream) => ws_stream,
            Err(e) => {
                stats.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
                log::debug!("Handshake from {addr} rejected: {e}");
                return Ok(());
            }
        };
        let Some(document_id) = routed else {
            return Ok(());
        };

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket connection from {addr} on document {document_id}");

        let (handle, outbound) = ClientHandle::channel(config.outbound_capacity);
        let handle_id = handle.id();

        let result = match hub.open(&document_id, handle).await {
            Ok(()) => Self::pump(ws_stream, outbound, &hub, &document_id, handle_id, addr, &stats).await,
            Err(e) => Err(e.into()),
        };

        hub.disconnect(&document_id, handle_id).await;
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection from {addr} on document {document_id} closed");
        result
    }

    /// Move frames both ways until either side closes.
    async fn pump(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        mut outbound: tokio::sync::mpsc::Receiver<Arc<str>>,
        hub: &FanoutHub,
        document_id: &DocumentId,
        handle_id: uuid::Uuid,
        addr: SocketAddr,
        stats: &AtomicServerStats,
    ) -> Result<(), ConnectionError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            stats.messages_received.fetch_add(1, Ordering::Relaxed);
                            let message = match ClientMessage::decode(text.as_str()) {
                                Ok(message) => message,
                                Err(e) => {
                                    stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
                                    log::warn!("Ignoring message from {addr}: {e}");
                                    continue;
                                }
                            };
                            match hub.handle_client(document_id, handle_id, message).await {
                                Ok(Some(reply)) => {
                                    ws_sender.send(Message::text(reply.encode()?)).await?;
                                }
                                Ok(None) => {}
                                Err(e) => log::error!("Failed to handle message from {addr}: {e}"),
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => break,

                        Some(Err(e)) => {
                            log::debug!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        Some(Ok(_)) => {
                            log::trace!("Ignoring non-text frame from {addr}");
                        }
                    }
                }

                frame = outbound.recv() => {
                    match frame {
                        Some(frame) => ws_sender.send(Message::text(frame.to_string())).await?,
                        // The hub dropped this handle
                        None => {
                            log::warn!("Closing unresponsive connection from {addr}");
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: self.stats.rejected_handshakes.load(Ordering::Relaxed),
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            malformed_messages: self.stats.malformed_messages.load(Ordering::Relaxed),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn hub(&self) -> &Arc<FanoutHub> {
        &self.hub
    }
}
