//! WebSocket sync client.
//!
//! Keeps a local replica of the room document. Local edits are applied to
//! the replica first and then shipped as `Update` frames; remote frames
//! are merged into the replica as they arrive and surfaced as
//! [`SyncEvent`]s.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::awareness::{AwarenessEntry, AwarenessState, AwarenessTable, CursorRange};
use crate::document::{ChatMessage, Operation, ReplicatedDocument};
use crate::error::{CollabError, Result};
use crate::protocol::{MessageType, ProtocolError, SyncMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Initial (or requested) state merged; carries our assigned id
    Synced(Uuid),
    /// A remote operation was merged into the local replica
    RemoteOperation { origin: Uuid, clock: u64 },
    AwarenessChanged { connection_id: Uuid, state: AwarenessState },
    PeerLeft(Uuid),
    Disconnected,
}

struct Shared {
    document: Mutex<ReplicatedDocument>,
    peers: Mutex<AwarenessTable>,
    connection_id: RwLock<Option<Uuid>>,
    state: RwLock<ConnectionState>,
}

pub struct SyncClient {
    room_id: Uuid,
    server_url: String,
    profile: AwarenessState,
    shared: Arc<Shared>,
    clock: AtomicU64,
    awareness_clock: AtomicU64,
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    /// `profile` is the name and color announced with presence updates.
    pub fn new(room_id: Uuid, server_url: impl Into<String>, profile: AwarenessState) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            room_id,
            server_url: server_url.into(),
            profile,
            shared: Arc::new(Shared {
                document: Mutex::new(ReplicatedDocument::new()),
                // Peers are evicted by the server; keep them until told otherwise.
                peers: Mutex::new(AwarenessTable::new(Duration::MAX)),
                connection_id: RwLock::new(None),
                state: RwLock::new(ConnectionState::Disconnected),
            }),
            clock: AtomicU64::new(0),
            awareness_clock: AtomicU64::new(0),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    pub async fn connection_id(&self) -> Option<Uuid> {
        *self.shared.connection_id.read().await
    }

    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Open the socket, send `Join`, and start the reader and writer tasks.
    pub async fn connect(&mut self) -> Result<()> {
        *self.shared.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                log::warn!("Could not reach {}: {e}", self.server_url);
                return Err(ProtocolError::ConnectionClosed.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        let join = SyncMessage::join(self.room_id).encode()?;
        out_tx.send(join).await.map_err(|_| ProtocolError::ConnectionClosed)?;
        self.outgoing_tx = Some(out_tx);
        *self.shared.state.write().await = ConnectionState::Connected;

        let shared = self.shared.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match SyncMessage::decode(&bytes) {
                            Ok(sync_msg) => {
                                if let Some(event) = Self::absorb(&shared, sync_msg).await {
                                    let _ = event_tx.send(event).await;
                                }
                            }
                            Err(e) => log::warn!("Undecodable frame from server: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *shared.state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Fold one server frame into local state.
    async fn absorb(shared: &Shared, msg: SyncMessage) -> Option<SyncEvent> {
        match msg.msg_type {
            MessageType::SyncStep2 => {
                let op = Operation::from(msg.payload);
                if let Err(e) = shared.document.lock().await.merge_remote_operation(&op) {
                    log::warn!("Server snapshot rejected: {e}");
                    return None;
                }
                let mut id = shared.connection_id.write().await;
                if id.is_none() {
                    *id = Some(msg.connection_id);
                }
                Some(SyncEvent::Synced(msg.connection_id))
            }
            MessageType::Update => {
                let op = Operation::from(msg.payload);
                if let Err(e) = shared.document.lock().await.merge_remote_operation(&op) {
                    log::warn!("Remote operation from {} rejected: {e}", msg.connection_id);
                    return None;
                }
                Some(SyncEvent::RemoteOperation {
                    origin: msg.connection_id,
                    clock: msg.clock,
                })
            }
            MessageType::Awareness => {
                let state = msg.awareness_state().ok()?;
                let accepted = shared
                    .peers
                    .lock()
                    .await
                    .publish(msg.connection_id, msg.clock, state.clone());
                accepted.then_some(SyncEvent::AwarenessChanged {
                    connection_id: msg.connection_id,
                    state,
                })
            }
            MessageType::AwarenessRemove => {
                shared.peers.lock().await.remove(msg.connection_id);
                Some(SyncEvent::PeerLeft(msg.connection_id))
            }
            _ => None,
        }
    }

    async fn send(&self, msg: SyncMessage) -> Result<()> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or_else(|| CollabError::Transport("not connected".to_string()))?;
        tx.send(msg.encode()?)
            .await
            .map_err(|_| CollabError::from(ProtocolError::ConnectionClosed))
    }

    async fn ship(&self, op: Operation) -> Result<()> {
        let clock = self.clock.fetch_add(1, Ordering::Relaxed) + 1;
        let id = self.connection_id().await.unwrap_or_else(Uuid::nil);
        self.send(SyncMessage::update(id, self.room_id, clock, op.into_bytes())).await
    }

    pub async fn insert(&self, position: u32, text: &str) -> Result<()> {
        let op = self.shared.document.lock().await.apply_local_insert(position, text);
        self.ship(op).await
    }

    pub async fn delete(&self, start: u32, length: u32) -> Result<()> {
        let op = self.shared.document.lock().await.apply_local_delete(start, length);
        self.ship(op).await
    }

    /// Append a chat message under this client's profile.
    pub async fn send_chat(&self, text: &str) -> Result<()> {
        let message = ChatMessage::new(&self.profile.display_name, &self.profile.color, text);
        let op = self.shared.document.lock().await.append_chat_message(message)?;
        self.ship(op).await
    }

    /// Send raw bytes as an update, bypassing the local replica.
    pub async fn send_raw_update(&self, payload: Vec<u8>) -> Result<()> {
        self.ship(Operation::from(payload)).await
    }

    /// Ask the server for anything the local replica is missing.
    pub async fn request_sync(&self) -> Result<()> {
        let sv = self.shared.document.lock().await.state_vector();
        let id = self.connection_id().await.unwrap_or_else(Uuid::nil);
        self.send(SyncMessage::sync_step1(id, self.room_id, sv)).await
    }

    pub async fn publish_awareness(&self, cursor: Option<CursorRange>) -> Result<()> {
        let clock = self.awareness_clock.fetch_add(1, Ordering::Relaxed) + 1;
        let mut state = self.profile.clone();
        state.cursor = cursor;
        let id = self.connection_id().await.unwrap_or_else(Uuid::nil);
        self.send(SyncMessage::awareness(id, self.room_id, clock, &state)?).await
    }

    pub async fn heartbeat(&self) -> Result<()> {
        let id = self.connection_id().await.unwrap_or_else(Uuid::nil);
        self.send(SyncMessage::heartbeat(id, self.room_id)).await
    }

    /// Send a heartbeat every `period` until the connection drops.
    pub fn spawn_heartbeat(&self, period: Duration) -> Option<JoinHandle<()>> {
        let tx = self.outgoing_tx.clone()?;
        let room_id = self.room_id;
        let shared = self.shared.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let id = shared.connection_id.read().await.unwrap_or_else(Uuid::nil);
                let Ok(frame) = SyncMessage::heartbeat(id, room_id).encode() else {
                    break;
                };
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        }))
    }

    /// Close the socket. The local replica is kept.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.shared.state.write().await = ConnectionState::Disconnected;
    }

    pub async fn text(&self) -> String {
        self.shared.document.lock().await.text()
    }

    pub async fn chat_messages(&self) -> Vec<ChatMessage> {
        self.shared.document.lock().await.chat_messages()
    }

    /// Remote presence, sorted by display name.
    pub async fn peers(&self) -> Vec<AwarenessEntry> {
        self.shared.peers.lock().await.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SyncClient {
        SyncClient::new(Uuid::new_v4(), "ws://127.0.0.1:1", AwarenessState::new("Alice", "#ff0000"))
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let mut client = client();
        assert_eq!(client.state().await, ConnectionState::Disconnected);
        assert!(client.connection_id().await.is_none());
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let client = client();
        assert!(matches!(client.insert(0, "x").await, Err(CollabError::Transport(_))));
        // The edit still lands locally.
        assert_eq!(client.text().await, "x");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let mut client = client();
        assert!(client.connect().await.is_err());
        assert_eq!(client.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_absorb_snapshot_sets_identity() {
        let shared = client().shared.clone();
        let mut source = ReplicatedDocument::new();
        source.apply_local_insert(0, "seed");
        let assigned = Uuid::new_v4();
        let msg = SyncMessage::sync_step2(assigned, Uuid::nil(), source.snapshot());

        let event = SyncClient::absorb(&shared, msg).await;
        assert!(matches!(event, Some(SyncEvent::Synced(id)) if id == assigned));
        assert_eq!(*shared.connection_id.read().await, Some(assigned));
        assert_eq!(shared.document.lock().await.text(), "seed");
    }

    #[tokio::test]
    async fn test_absorb_presence_lifecycle() {
        let shared = client().shared.clone();
        let peer = Uuid::new_v4();
        let msg = SyncMessage::awareness(peer, Uuid::nil(), 1, &AwarenessState::new("Bob", "#00ff00")).unwrap();
        assert!(matches!(
            SyncClient::absorb(&shared, msg).await,
            Some(SyncEvent::AwarenessChanged { .. })
        ));
        assert_eq!(shared.peers.lock().await.len(), 1);

        let gone = SyncMessage::awareness_remove(peer, Uuid::nil());
        assert!(matches!(SyncClient::absorb(&shared, gone).await, Some(SyncEvent::PeerLeft(p)) if p == peer));
        assert!(shared.peers.lock().await.is_empty());
    }
}
