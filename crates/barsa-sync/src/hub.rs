//! # Document Hub Server
//!
//! Serves a [`MemoryRemote`] over the remote protocol, so devices on a local
//! network can share one remote store without a cloud account.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Document Hub Architecture                        │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     DocumentHub (Axum)                          │   │
//! │  │                                                                 │   │
//! │  │  /health ──▶ "OK"                                               │   │
//! │  │  /ws     ──▶ WebSocket upgrade                                  │   │
//! │  │                   │                                             │   │
//! │  │                   ▼                                             │   │
//! │  │         ┌──────────────────┐                                    │   │
//! │  │         │ connection task  │  Hello → MemoryRemote::open        │   │
//! │  │         │ (per client)     │  requests → MemorySession          │   │
//! │  │         └────────┬─────────┘  Subscription → Changes forwarder  │   │
//! │  │                  │                                              │   │
//! │  │                  ▼                                              │   │
//! │  │         ┌──────────────────┐                                    │   │
//! │  │         │   MemoryRemote   │  shared by every connection        │   │
//! │  │         └──────────────────┘                                    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  Message Flow:                                                          │
//! │  ─────────────                                                          │
//! │  1. Client connects and sends Hello                                     │
//! │  2. Hub opens a backing session and replies Welcome                     │
//! │  3. Each request is answered with Ack or Error                          │
//! │  4. Each subscription streams Changes until Unsubscribe or close        │
//! │  5. On close the backing session is terminated                          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::config::HubSettings;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::protocol::{HelloPayload, SyncMessage, WelcomePayload, PROTOCOL_VERSION};
use crate::remote::{MemoryRemote, RemoteConnector, RemoteSession};

// =============================================================================
// Constants
// =============================================================================

/// Ping interval to keep connections alive.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long a new connection has to send Hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum message size (4MB; a bootstrap snapshot of a large collection
/// travels in one Changes message).
const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

// =============================================================================
// Hub State
// =============================================================================

/// A connected client.
#[derive(Debug, Clone)]
pub struct ConnectedClient {
    pub session_id: u64,
    pub session_name: String,
    pub project_id: String,
    pub connected_at: std::time::Instant,
}

/// Shared state for the hub server.
pub struct HubState {
    remote: MemoryRemote,
    clients: RwLock<HashMap<u64, ConnectedClient>>,
    next_session: AtomicU64,
}

impl HubState {
    fn new(remote: MemoryRemote) -> Self {
        HubState {
            remote,
            clients: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(0),
        }
    }

    /// Returns the number of connected clients.
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Returns the session names of connected clients.
    pub async fn client_names(&self) -> Vec<String> {
        self.clients
            .read()
            .await
            .values()
            .map(|c| c.session_name.clone())
            .collect()
    }
}

// =============================================================================
// Hub Server
// =============================================================================

/// WebSocket server exposing a [`MemoryRemote`].
pub struct DocumentHub {
    settings: HubSettings,
    state: Arc<HubState>,
}

/// Handle for controlling a running hub.
#[derive(Clone)]
pub struct HubHandle {
    state: Arc<HubState>,
    local_addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
}

impl HubHandle {
    /// Address the hub is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket endpoint to put in client credentials.
    pub fn endpoint(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    /// The store the hub serves.
    pub fn remote(&self) -> &MemoryRemote {
        &self.state.remote
    }

    pub async fn client_count(&self) -> usize {
        self.state.client_count().await
    }

    pub async fn client_names(&self) -> Vec<String> {
        self.state.client_names().await
    }

    /// Shuts down the hub server.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Hub shutdown channel closed".into()))
    }
}

impl DocumentHub {
    pub fn new(settings: HubSettings, remote: MemoryRemote) -> Self {
        DocumentHub {
            settings,
            state: Arc::new(HubState::new(remote)),
        }
    }

    /// Builds the router without binding, for embedding in a larger app.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(self.state.clone())
    }

    /// Starts the hub server and returns a handle.
    pub async fn start(self) -> SyncResult<HubHandle> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let app = self.router();

        let bind_addr = self.settings.bind_address();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            SyncError::ConnectionFailed(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SyncError::ConnectionFailed(e.to_string()))?;

        info!(addr = %local_addr, "Document hub started");

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await;
                    info!("Document hub shutting down");
                })
                .await
                .ok();
        });

        Ok(HubHandle {
            state: self.state,
            local_addr,
            shutdown_tx,
        })
    }
}

// =============================================================================
// WebSocket Handler
// =============================================================================

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    "OK"
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<HubState>>) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handles one client connection.
async fn handle_socket(socket: WebSocket, state: Arc<HubState>) {
    let (mut sender, mut receiver) = socket.split();

    let hello = match receive_hello(&mut receiver).await {
        Ok(hello) => hello,
        Err(e) => {
            warn!(?e, "Failed to receive Hello - closing connection");
            return;
        }
    };

    if hello.protocol_version != PROTOCOL_VERSION {
        let err = RemoteError::malformed(format!(
            "protocol version {} not supported (hub speaks {})",
            hello.protocol_version, PROTOCOL_VERSION
        ));
        let _ = send_message(&mut sender, &SyncMessage::error(None, &err)).await;
        return;
    }

    let session = match state.remote.open(&hello.credentials(), &hello.session_name).await {
        Ok(session) => session,
        Err(e) => {
            let err = RemoteError::new(e.failure_kind(), e.to_string());
            warn!(session = %hello.session_name, %err, "Rejecting connection");
            let _ = send_message(&mut sender, &SyncMessage::error(None, &err)).await;
            return;
        }
    };

    let session_id = state.next_session.fetch_add(1, Ordering::Relaxed) + 1;
    let welcome = SyncMessage::Welcome(WelcomePayload {
        session_id,
        server_time: chrono::Utc::now().to_rfc3339(),
    });
    if let Err(e) = send_message(&mut sender, &welcome).await {
        warn!(session = %hello.session_name, ?e, "Failed to send Welcome");
        let _ = session.terminate().await;
        return;
    }

    state.clients.write().await.insert(
        session_id,
        ConnectedClient {
            session_id,
            session_name: hello.session_name.clone(),
            project_id: hello.project_id.clone(),
            connected_at: std::time::Instant::now(),
        },
    );
    info!(session = %hello.session_name, project = %hello.project_id, session_id, "Client connected");

    // Outgoing message task
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
    let outgoing_handle = tokio::spawn(async move {
        while let Some(msg) = outgoing_rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Ping task
    let ping_tx = outgoing_tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_interval = interval(PING_INTERVAL);
        loop {
            ping_interval.tick().await;
            if ping_tx.send(Message::Ping(axum::body::Bytes::new())).is_err() {
                break;
            }
        }
    });

    let mut connection = Connection {
        session,
        outgoing: outgoing_tx,
        forwarders: HashMap::new(),
    };

    // Main receive loop
    loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => match SyncMessage::from_json(text.as_str()) {
                Ok(msg) => connection.handle(msg).await,
                Err(e) => debug!(session_id, ?e, "Invalid message format"),
            },
            Some(Ok(Message::Binary(data))) => match serde_json::from_slice::<SyncMessage>(&data) {
                Ok(msg) => connection.handle(msg).await,
                Err(e) => debug!(session_id, ?e, "Invalid binary message"),
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = connection.outgoing.send(Message::Pong(data));
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                info!(session_id, "Client requested close");
                break;
            }
            Some(Err(e)) => {
                warn!(session_id, ?e, "WebSocket error");
                break;
            }
            None => {
                info!(session_id, "Client disconnected");
                break;
            }
        }
    }

    // Cleanup
    connection.close().await;
    ping_handle.abort();
    outgoing_handle.abort();
    state.clients.write().await.remove(&session_id);
}

/// Per-connection request handling.
struct Connection {
    session: Box<dyn RemoteSession>,
    outgoing: mpsc::UnboundedSender<Message>,
    forwarders: HashMap<u64, JoinHandle<()>>,
}

impl Connection {
    fn send(&self, msg: &SyncMessage) {
        match msg.to_json() {
            Ok(json) => {
                let _ = self.outgoing.send(Message::Text(json.into()));
            }
            Err(e) => warn!(?e, msg_type = %msg.type_name(), "Failed to serialize message"),
        }
    }

    fn reply(&self, request_id: u64, result: SyncResult<()>) {
        match result {
            Ok(()) => self.send(&SyncMessage::Ack { request_id }),
            Err(e) => {
                let err = match e {
                    SyncError::Remote(remote) => remote,
                    other => RemoteError::new(other.failure_kind(), other.to_string()),
                };
                self.send(&SyncMessage::error(Some(request_id), &err));
            }
        }
    }

    async fn handle(&mut self, msg: SyncMessage) {
        match msg {
            SyncMessage::EnableOfflineCache { request_id } => {
                let result = self.session.enable_offline_cache().await;
                self.reply(request_id, result);
            }
            SyncMessage::SetMerge {
                request_id,
                collection,
                record,
            } => {
                let result = self.session.set_merge(&collection, &record).await;
                self.reply(request_id, result);
            }
            SyncMessage::Delete {
                request_id,
                collection,
                id,
            } => {
                let result = self.session.delete(&collection, &id).await;
                self.reply(request_id, result);
            }
            SyncMessage::Subscribe {
                request_id,
                collection,
            } => match self.session.subscribe(collection).await {
                Ok(mut subscription) => {
                    self.reply(request_id, Ok(()));
                    let outgoing = self.outgoing.clone();
                    let forwarder = tokio::spawn(async move {
                        while let Some(batch) = subscription.next().await {
                            let changes = SyncMessage::Changes {
                                subscription_id: request_id,
                                batch,
                            };
                            let Ok(json) = changes.to_json() else {
                                continue;
                            };
                            if outgoing.send(Message::Text(json.into())).is_err() {
                                break;
                            }
                        }
                    });
                    self.forwarders.insert(request_id, forwarder);
                }
                Err(e) => self.reply(request_id, Err(e)),
            },
            SyncMessage::Unsubscribe { subscription_id } => {
                if let Some(forwarder) = self.forwarders.remove(&subscription_id) {
                    forwarder.abort();
                }
            }
            other => {
                let request_id = other.request_id();
                debug!(msg_type = %other.type_name(), "Unexpected message from client");
                self.send(&SyncMessage::error(
                    request_id,
                    &RemoteError::malformed(format!("unexpected {}", other.type_name())),
                ));
            }
        }
    }

    async fn close(&mut self) {
        for (_, forwarder) in self.forwarders.drain() {
            forwarder.abort();
        }
        if let Err(e) = self.session.terminate().await {
            warn!(?e, "Failed to terminate backing session");
        }
    }
}

/// Receives and parses the Hello message.
async fn receive_hello(receiver: &mut SplitStream<WebSocket>) -> SyncResult<HelloPayload> {
    let first = tokio::time::timeout(HELLO_TIMEOUT, receiver.next()).await;

    match first {
        Ok(Some(Ok(msg))) => {
            let text = match msg {
                Message::Text(t) => t.to_string(),
                Message::Binary(b) => String::from_utf8_lossy(&b).to_string(),
                _ => return Err(SyncError::InvalidMessage("Expected text message".into())),
            };

            match SyncMessage::from_json(text.as_str())
                .map_err(|e| SyncError::DeserializationFailed(e.to_string()))?
            {
                SyncMessage::Hello(payload) => Ok(payload),
                other => Err(SyncError::InvalidMessage(format!(
                    "Expected Hello, got {}",
                    other.type_name()
                ))),
            }
        }
        Ok(Some(Err(e))) => Err(SyncError::WebSocketError(e.to_string())),
        Ok(None) => Err(SyncError::Disconnected),
        Err(_) => Err(SyncError::Timeout(HELLO_TIMEOUT.as_secs())),
    }
}

/// Sends a SyncMessage.
async fn send_message(sender: &mut SplitSink<WebSocket, Message>, msg: &SyncMessage) -> SyncResult<()> {
    let json = msg.to_json()?;
    sender
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| SyncError::WebSocketError(format!("Send error: {}", e)))
}
