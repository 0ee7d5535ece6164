//! WebSocket sync server.
//!
//! ```text
//! Client A ──┐                         ┌── Store (RocksDB)
//!            ├── Join(room) ── HubRegistry ── RoomHub(room) ── Subscriber A
//! Client B ──┘                                   │            Subscriber B
//!                                                └── sweeper (presence timeout)
//! ```
//!
//! The first frame of every connection must be `Join`. The server assigns
//! the connection id and answers with the room snapshot plus the current
//! presence list, then relays room traffic until either side closes. A
//! connection whose outgoing queue overflows, or whose socket stops
//! accepting frames for `send_timeout`, is closed, as is every connection
//! of a room that gets deleted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use thiserror::Error;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::awareness::DEFAULT_HEARTBEAT_TIMEOUT;
use crate::broadcast::RecvError;
use crate::hub::{Attachment, HubConfig, HubRegistry, RoomHub};
use crate::protocol::{MessageType, SyncMessage};
use crate::storage::{Store, StoreConfig, StoreError};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How long a fresh socket may stay silent before sending `Join`.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Per-connection outgoing queue; overflow disconnects
    pub broadcast_capacity: usize,
    /// Presence entries idle longer than this are evicted
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    /// Longest a single socket write may block before the peer is dropped
    pub send_timeout: Duration,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:1234".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            sweep_interval: Duration::from_secs(5),
            send_timeout: Duration::from_secs(10),
            storage_path: None,
        }
    }
}

impl ServerConfig {
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            broadcast_capacity: self.broadcast_capacity,
            max_connections: self.max_peers_per_room,
            heartbeat_timeout: self.heartbeat_timeout,
            sweep_interval: self.sweep_interval,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_frames: u64,
    pub active_rooms: usize,
    pub updates_merged: u64,
    pub updates_dropped: u64,
    pub snapshots_persisted: u64,
    pub lagged_disconnects: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<HubRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// `store` is shared with the membership authority when both run in
    /// one process; `None` keeps documents in memory only.
    pub fn new(config: ServerConfig, store: Option<Arc<Store>>) -> Self {
        let registry = Arc::new(HubRegistry::new(config.hub_config(), store));
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Open the store at `config.storage_path`, if set, and build the server.
    pub fn open(config: ServerConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(Store::open(StoreConfig::new(path))?)),
            None => None,
        };
        Ok(Self::new(config, store))
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default(), None)
    }

    pub fn registry(&self) -> &Arc<HubRegistry> {
        &self.registry
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let send_timeout = self.config.send_timeout;
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats, send_timeout).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<HubRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        send_timeout: Duration,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        stats.write().await.total_connections += 1;

        let Some(room_id) = Self::await_join(&mut ws_receiver, addr).await else {
            stats.write().await.rejected_connections += 1;
            let _ = ws_sender.send(Message::Close(None)).await;
            return Ok(());
        };

        let (hub, attachment) = match registry.join(room_id).await {
            Ok(joined) => joined,
            Err(e) => {
                log::warn!("Rejected {addr} from room {room_id}: {e}");
                stats.write().await.rejected_connections += 1;
                let _ = ws_sender.send(Message::Close(None)).await;
                return Ok(());
            }
        };
        let connection_id = attachment.connection_id;
        {
            let mut s = stats.write().await;
            s.active_connections += 1;
            s.active_rooms = registry.room_count().await;
        }
        log::info!("{addr} joined room {room_id} as {connection_id}");

        let mut link = Link {
            sink: &mut ws_sender,
            send_timeout,
        };
        let outcome = Self::pump(&mut link, &mut ws_receiver, &hub, attachment, &stats).await;

        if let Err(e) = registry.leave(&hub, connection_id).await {
            log::error!("Room {room_id} kept resident after {connection_id} left: {e}");
        }
        {
            let metrics = registry.metrics();
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = registry.room_count().await;
            s.updates_merged = metrics.updates_merged.load(Ordering::Relaxed);
            s.updates_dropped = metrics.updates_dropped.load(Ordering::Relaxed);
            s.snapshots_persisted = metrics.snapshots_persisted.load(Ordering::Relaxed);
            s.lagged_disconnects = metrics.lagged_disconnects.load(Ordering::Relaxed);
        }
        log::info!("Connection {connection_id} from {addr} closed");
        outcome
    }

    /// Wait for the opening `Join` and return its room.
    async fn await_join(ws_receiver: &mut WsSource, addr: SocketAddr) -> Option<Uuid> {
        let first = match tokio::time::timeout(JOIN_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => data,
            Ok(Some(Ok(_))) => {
                log::warn!("{addr} sent a non-binary opening frame");
                return None;
            }
            Ok(Some(Err(e))) => {
                log::warn!("WebSocket error from {addr} before join: {e}");
                return None;
            }
            Ok(None) => return None,
            Err(_) => {
                log::warn!("{addr} did not join within {JOIN_TIMEOUT:?}");
                return None;
            }
        };
        match SyncMessage::decode(&first) {
            Ok(msg) if msg.msg_type == MessageType::Join => Some(msg.room_id),
            Ok(msg) => {
                log::warn!("{addr} opened with {:?} instead of Join", msg.msg_type);
                None
            }
            Err(e) => {
                log::warn!("Failed to decode opening frame from {addr}: {e}");
                None
            }
        }
    }

    /// Relay frames both ways until the connection ends.
    async fn pump(
        ws_sender: &mut Link<'_>,
        ws_receiver: &mut WsSource,
        hub: &RoomHub,
        attachment: Attachment,
        stats: &RwLock<ServerStats>,
    ) -> Result<(), BoxError> {
        let Attachment {
            connection_id,
            mut subscriber,
            greeting,
        } = attachment;

        for frame in greeting {
            ws_sender.send(Message::Binary(frame.into())).await?;
        }

        loop {
            tokio::select! {
                _ = hub.wait_deleted() => {
                    log::info!("Room {} deleted, closing {connection_id}", hub.room_id());
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }

                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            match SyncMessage::decode(&bytes) {
                                // Client-supplied connection ids are ignored; the
                                // server-assigned id is authoritative.
                                Ok(sync_msg) => {
                                    if let Some(reply) = Self::dispatch(hub, connection_id, sync_msg).await {
                                        ws_sender.send(Message::Binary(reply.into())).await?;
                                    }
                                }
                                Err(e) => {
                                    stats.write().await.malformed_frames += 1;
                                    log::warn!("Failed to decode frame from {connection_id}: {e}");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {connection_id}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                outgoing = subscriber.recv() => {
                    match outgoing {
                        Ok(bytes) => match ws_sender.send(Message::Binary(bytes.as_ref().clone().into())).await {
                            Ok(()) => {}
                            Err(SendError::Stalled(after)) => {
                                hub.metrics().lagged_disconnects.fetch_add(1, Ordering::Relaxed);
                                log::warn!("Connection {connection_id} stopped reading for {after:?}, disconnecting");
                                break;
                            }
                            Err(e) => return Err(e.into()),
                        },
                        Err(RecvError::Lagged(n)) => {
                            hub.metrics().lagged_disconnects.fetch_add(1, Ordering::Relaxed);
                            log::warn!("Connection {connection_id} lagged by {n} messages, disconnecting");
                            let _ = ws_sender.send(Message::Close(None)).await;
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply one client message to the hub, returning a direct reply if any.
    async fn dispatch(hub: &RoomHub, connection_id: Uuid, msg: SyncMessage) -> Option<Vec<u8>> {
        match msg.msg_type {
            MessageType::Update => {
                hub.apply_update(connection_id, msg.payload).await;
                None
            }
            MessageType::SyncStep1 => match hub.sync_step1(connection_id, &msg.payload).await {
                Ok(reply) => Some(reply),
                Err(e) => {
                    log::warn!("Bad state vector from {connection_id}: {e}");
                    None
                }
            },
            MessageType::Awareness => {
                match msg.awareness_state() {
                    Ok(state) => {
                        hub.publish_awareness(connection_id, msg.clock, state).await;
                    }
                    Err(e) => log::warn!("Bad awareness payload from {connection_id}: {e}"),
                }
                None
            }
            MessageType::Heartbeat => {
                hub.heartbeat(connection_id).await;
                None
            }
            MessageType::Join => {
                log::debug!("Ignoring repeated Join from {connection_id}");
                None
            }
            other => {
                log::debug!("Unhandled message type from {connection_id}: {other:?}");
                None
            }
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }
}

#[derive(Debug, Error)]
enum SendError {
    #[error("peer stopped reading for {0:?}")]
    Stalled(Duration),
    #[error(transparent)]
    Socket(#[from] WsError),
}

/// Outgoing half of a connection whose writes give up after `send_timeout`.
struct Link<'a> {
    sink: &'a mut WsSink,
    send_timeout: Duration,
}

impl Link<'_> {
    async fn send(&mut self, message: Message) -> Result<(), SendError> {
        match tokio::time::timeout(self.send_timeout, self.sink.send(message)).await {
            Ok(sent) => Ok(sent?),
            Err(_) => Err(SendError::Stalled(self.send_timeout)),
        }
    }
}
