//! # WebSocket Remote
//!
//! Client side of the remote protocol: each session is one WebSocket
//! connection to a [`DocumentHub`](crate::hub::DocumentHub).
//!
//! ## Session Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      WebSocket Session Lifecycle                        │
//! │                                                                         │
//! │  open()                                                                │
//! │    │  connect (bounded by connect_timeout)                              │
//! │    │  Hello ─────────────────────────────► hub                          │
//! │    │  Welcome / Error ◄──────────────────── hub                         │
//! │    ▼                                                                    │
//! │  ┌──────────────────────── connection task ──────────────────────────┐ │
//! │  │  outgoing requests ──► socket                                     │ │
//! │  │  Ack / Error      ──► pending[request_id]  (oneshot)              │ │
//! │  │  Changes          ──► feeds[subscription_id] (Subscription)       │ │
//! │  │  periodic ping                                                    │ │
//! │  └───────────────────────────────────────────────────────────────────┘ │
//! │    │                                                                    │
//! │    ▼  terminate() / socket closed                                       │
//! │  pending requests fail with Disconnected, every feed ends              │
//! │                                                                         │
//! │  No automatic reconnect: the session manager opens a new session       │
//! │  on the next configuration save.                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use barsa_core::{ChangeBatch, Collection, Credentials, Record};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SyncSettings;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::protocol::{HelloPayload, SyncMessage, WelcomePayload};
use crate::remote::{RemoteConnector, RemoteSession, Subscription};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;
type Reply = Result<(), RemoteError>;

// =============================================================================
// Connector
// =============================================================================

/// Opens WebSocket sessions against the endpoint named in the credentials.
#[derive(Debug, Clone)]
pub struct WsConnector {
    /// Bound on connecting plus the handshake.
    pub connect_timeout: Duration,

    /// Bound on waiting for a request's Ack.
    pub request_timeout: Duration,

    /// Keep-alive ping interval.
    pub ping_interval: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        WsConnector {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
        }
    }
}

impl WsConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses the configured connect timeout for both bounds.
    pub fn from_settings(settings: &SyncSettings) -> Self {
        WsConnector {
            connect_timeout: settings.connect_timeout(),
            request_timeout: settings.connect_timeout(),
            ..Default::default()
        }
    }

    fn endpoint(credentials: &Credentials) -> SyncResult<Url> {
        let endpoint = credentials
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| {
                SyncError::InvalidConfig("WebSocket sessions need an endpoint".into())
            })?;

        let url = Url::parse(endpoint)?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(SyncError::InvalidUrl(format!(
                "unsupported scheme for WebSocket remote: {}",
                other
            ))),
        }
    }
}

#[async_trait]
impl RemoteConnector for WsConnector {
    async fn open(
        &self,
        credentials: &Credentials,
        session_name: &str,
    ) -> SyncResult<Box<dyn RemoteSession>> {
        let url = Self::endpoint(credentials)?;
        let limit = self.connect_timeout;

        let handshake = async {
            let (ws_stream, response) = connect_async(url.as_str()).await?;
            debug!(status = ?response.status(), "WebSocket handshake complete");

            let (mut write, mut read) = ws_stream.split();
            let hello = SyncMessage::Hello(HelloPayload::new(credentials, session_name));
            write.send(WsMessage::Text(hello.to_json()?.into())).await?;
            let welcome = receive_welcome(&mut read).await?;
            Ok::<_, SyncError>((write, read, welcome))
        };

        let (write, read, welcome) = match timeout(limit, handshake).await {
            Ok(result) => result?,
            Err(_) => return Err(SyncError::Timeout(limit.as_secs())),
        };

        info!(
            session = %session_name,
            url = %url,
            session_id = welcome.session_id,
            "Remote session opened"
        );

        let shared = Arc::new(Shared::default());
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let task_shared = shared.clone();
        let ping_interval = self.ping_interval;
        tokio::spawn(async move {
            if let Err(e) =
                connection_loop(write, read, outgoing_rx, shutdown_rx, &task_shared, ping_interval)
                    .await
            {
                warn!(?e, "Remote connection ended with error");
            }
            task_shared.close();
        });

        Ok(Box::new(WsSession {
            name: session_name.to_string(),
            shared,
            outgoing_tx,
            shutdown_tx,
            request_timeout: self.request_timeout,
        }))
    }
}

/// Waits for the hub's answer to Hello.
async fn receive_welcome(read: &mut WsSource) -> SyncResult<WelcomePayload> {
    while let Some(frame) = read.next().await {
        match frame? {
            WsMessage::Text(text) => {
                return match SyncMessage::from_json(text.as_str())
                    .map_err(|e| SyncError::DeserializationFailed(e.to_string()))?
                {
                    SyncMessage::Welcome(welcome) => Ok(welcome),
                    SyncMessage::Error { kind, message, .. } => {
                        Err(RemoteError::new(kind, message).into())
                    }
                    other => Err(SyncError::InvalidMessage(format!(
                        "expected Welcome, got {}",
                        other.type_name()
                    ))),
                };
            }
            WsMessage::Close(_) => return Err(SyncError::Disconnected),
            _ => continue,
        }
    }
    Err(SyncError::Disconnected)
}

// =============================================================================
// Shared Connection State
// =============================================================================

#[derive(Default)]
struct Shared {
    next_request: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    feeds: Mutex<HashMap<u64, mpsc::UnboundedSender<ChangeBatch>>>,
    closed: AtomicBool,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn feeds(&self) -> MutexGuard<'_, HashMap<u64, mpsc::UnboundedSender<ChangeBatch>>> {
        self.feeds.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn next_request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Fails every pending request and ends every feed.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending().clear();
        self.feeds().clear();
    }

    /// Routes one incoming message.
    fn dispatch(&self, message: SyncMessage) {
        match message {
            SyncMessage::Ack { request_id } => {
                if let Some(reply) = self.pending().remove(&request_id) {
                    let _ = reply.send(Ok(()));
                }
            }
            SyncMessage::Error {
                request_id: Some(request_id),
                kind,
                message,
            } => {
                if let Some(reply) = self.pending().remove(&request_id) {
                    let _ = reply.send(Err(RemoteError::new(kind, message)));
                }
            }
            SyncMessage::Error {
                request_id: None,
                kind,
                message,
            } => {
                warn!(%kind, %message, "Hub reported a connection error");
            }
            SyncMessage::Changes {
                subscription_id,
                batch,
            } => {
                let mut feeds = self.feeds();
                let delivered = feeds
                    .get(&subscription_id)
                    .is_some_and(|feed| feed.send(batch).is_ok());
                if !delivered {
                    feeds.remove(&subscription_id);
                }
            }
            other => {
                debug!(msg_type = %other.type_name(), "Unexpected message from hub");
            }
        }
    }
}

/// Main connection loop - handles sending and receiving.
async fn connection_loop(
    mut write: WsSink,
    mut read: WsSource,
    mut outgoing_rx: mpsc::UnboundedReceiver<SyncMessage>,
    mut shutdown_rx: mpsc::Receiver<()>,
    shared: &Shared,
    ping_every: Duration,
) -> SyncResult<()> {
    let mut ping_interval = tokio::time::interval(ping_every);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            Some(msg) = outgoing_rx.recv() => {
                debug!(msg_type = %msg.type_name(), "Sending message");
                write.send(WsMessage::Text(msg.to_json()?.into())).await?;
            }

            frame = read.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => match SyncMessage::from_json(text.as_str()) {
                        Ok(msg) => shared.dispatch(msg),
                        Err(e) => warn!(?e, "Failed to parse message"),
                    },
                    Some(Ok(WsMessage::Ping(data))) => {
                        write.send(WsMessage::Pong(data)).await?;
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(?frame, "Received close frame");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(SyncError::from(e)),
                    None => return Ok(()),
                }
            }

            _ = ping_interval.tick() => {
                write.send(WsMessage::Ping(Vec::new().into())).await?;
            }

            _ = shutdown_rx.recv() => {
                debug!("Closing remote connection");
                let _ = write.send(WsMessage::Close(None)).await;
                return Ok(());
            }
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// A session on a WebSocket remote.
pub struct WsSession {
    name: String,
    shared: Arc<Shared>,
    outgoing_tx: mpsc::UnboundedSender<SyncMessage>,
    shutdown_tx: mpsc::Sender<()>,
    request_timeout: Duration,
}

impl WsSession {
    /// Sends a request and waits for its Ack.
    async fn request(&self, request_id: u64, message: SyncMessage) -> SyncResult<()> {
        if self.shared.is_closed() {
            return Err(SyncError::SessionClosed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared.pending().insert(request_id, reply_tx);

        if self.outgoing_tx.send(message).is_err() {
            self.shared.pending().remove(&request_id);
            return Err(SyncError::SessionClosed);
        }

        match timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(remote))) => Err(remote.into()),
            Ok(Err(_)) => Err(SyncError::Disconnected),
            Err(_) => {
                self.shared.pending().remove(&request_id);
                Err(SyncError::Timeout(self.request_timeout.as_secs()))
            }
        }
    }
}

#[async_trait]
impl RemoteSession for WsSession {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enable_offline_cache(&self) -> SyncResult<()> {
        let request_id = self.shared.next_request_id();
        self.request(request_id, SyncMessage::EnableOfflineCache { request_id })
            .await
    }

    async fn set_merge(&self, collection: &str, record: &Record) -> SyncResult<()> {
        let request_id = self.shared.next_request_id();
        self.request(
            request_id,
            SyncMessage::SetMerge {
                request_id,
                collection: collection.to_string(),
                record: record.clone(),
            },
        )
        .await
    }

    async fn delete(&self, collection: &str, id: &str) -> SyncResult<()> {
        let request_id = self.shared.next_request_id();
        self.request(
            request_id,
            SyncMessage::Delete {
                request_id,
                collection: collection.to_string(),
                id: id.to_string(),
            },
        )
        .await
    }

    async fn subscribe(&self, collection: Collection) -> SyncResult<Subscription> {
        let subscription_id = self.shared.next_request_id();
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();

        // Registered first: the initial snapshot may arrive right behind the Ack.
        self.shared.feeds().insert(subscription_id, feed_tx);

        let subscribe = SyncMessage::Subscribe {
            request_id: subscription_id,
            collection,
        };
        if let Err(e) = self.request(subscription_id, subscribe).await {
            self.shared.feeds().remove(&subscription_id);
            return Err(e);
        }

        let shared = self.shared.clone();
        let outgoing = self.outgoing_tx.clone();
        Ok(Subscription::new(collection, feed_rx, move || {
            shared.feeds().remove(&subscription_id);
            if !shared.is_closed() {
                let _ = outgoing.send(SyncMessage::Unsubscribe { subscription_id });
            }
        }))
    }

    async fn terminate(&self) -> SyncResult<()> {
        if self.shared.is_closed() {
            return Ok(());
        }
        let _ = self.shutdown_tx.try_send(());
        self.shared.close();
        info!(session = %self.name, "Remote session terminated");
        Ok(())
    }
}
