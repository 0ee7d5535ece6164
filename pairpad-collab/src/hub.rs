//! Room sync hubs and the registry that owns them.
//!
//! ```text
//!            join                     leave (last connection)
//! Open(1..N) ◄──────── Empty ◄───────────────────────────────── Retired
//!   │  merge + rebroadcast            ▲ load snapshot               ▲
//!   │  awareness publish / heartbeat  │ or seed default             │
//!   │  sweep stale presence           │                             │
//!   └── last detach ──► Closing ── persist snapshot ── removed ─────┘
//!                          │
//!                          └── persist failed ──► Open (stays resident)
//!
//! delete room: removed without persisting ──► Deleted (connections closed)
//! ```
//!
//! All mutation of a room (merge, publish, heartbeat, detach, sweep) runs
//! under that room's state mutex, and the rebroadcast is queued before the
//! mutex is released, so every connection sees operations in the order
//! the hub merged them. The registry lock only guards the room map itself:
//! attaching, detaching, loading and flushing all happen outside it, and
//! storage calls run on the blocking pool.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::awareness::{color_for, AwarenessEntry, AwarenessState, AwarenessTable, DEFAULT_HEARTBEAT_TIMEOUT};
use crate::broadcast::{BroadcastGroup, Subscriber};
use crate::document::{ChatMessage, Operation, ReplicatedDocument};
use crate::error::{CollabError, Result};
use crate::protocol::SyncMessage;
use crate::storage::Store;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Per-connection queue bound; overflow disconnects the connection
    pub broadcast_capacity: usize,
    pub max_connections: usize,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            max_connections: 100,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Lock-free counters shared by every hub of a registry.
#[derive(Debug, Default)]
pub struct HubMetrics {
    pub updates_merged: AtomicU64,
    pub updates_dropped: AtomicU64,
    pub awareness_published: AtomicU64,
    pub awareness_evicted: AtomicU64,
    pub snapshots_persisted: AtomicU64,
    pub persistence_failures: AtomicU64,
    pub lagged_disconnects: AtomicU64,
}

impl HubMetrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Where a hub is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubPhase {
    /// Accepting connections
    Open,
    /// Emptied; flushing before it leaves the registry
    Closing,
    /// Flushed and no longer in the registry
    Retired,
    /// Its room was deleted; attached connections are being closed
    Deleted,
}

/// What a freshly attached connection gets.
#[derive(Debug)]
pub struct Attachment {
    pub connection_id: Uuid,
    pub subscriber: Subscriber,
    /// Encoded messages to send before anything from `subscriber`:
    /// the snapshot, then one awareness message per online entry.
    pub greeting: Vec<Vec<u8>>,
}

struct HubState {
    document: ReplicatedDocument,
    awareness: AwarenessTable,
    connections: HashSet<Uuid>,
    sequence: u64,
}

/// One active room.
pub struct RoomHub {
    room_id: Uuid,
    state: Mutex<HubState>,
    group: BroadcastGroup,
    config: HubConfig,
    metrics: Arc<HubMetrics>,
    // Written under `state`; read anywhere.
    phase: watch::Sender<HubPhase>,
    // Held across a snapshot flush so a delete can wait it out.
    flush: Mutex<()>,
}

impl RoomHub {
    pub fn new(room_id: Uuid, document: ReplicatedDocument, config: HubConfig, metrics: Arc<HubMetrics>) -> Self {
        let (phase, _) = watch::channel(HubPhase::Open);
        Self {
            room_id,
            state: Mutex::new(HubState {
                document,
                awareness: AwarenessTable::new(config.heartbeat_timeout),
                connections: HashSet::new(),
                sequence: 0,
            }),
            group: BroadcastGroup::new(config.broadcast_capacity),
            config,
            metrics,
            phase,
            flush: Mutex::new(()),
        }
    }

    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    pub fn metrics(&self) -> &Arc<HubMetrics> {
        &self.metrics
    }

    pub fn phase(&self) -> HubPhase {
        *self.phase.borrow()
    }

    /// Register a new connection. The subscription is taken under the state
    /// lock, so the snapshot and the live stream meet without gap or overlap.
    pub async fn attach(&self) -> Result<Attachment> {
        self.try_attach()
            .await?
            .ok_or_else(|| CollabError::Transport(format!("room {} is shutting down", self.room_id)))
    }

    // `None` when the hub is no longer open.
    async fn try_attach(&self) -> Result<Option<Attachment>> {
        let mut state = self.state.lock().await;
        if self.phase() != HubPhase::Open {
            return Ok(None);
        }
        if state.connections.len() >= self.config.max_connections {
            return Err(CollabError::Transport(format!(
                "room {} is full ({} connections)",
                self.room_id, self.config.max_connections
            )));
        }

        let connection_id = Uuid::new_v4();
        state.connections.insert(connection_id);
        let subscriber = self.group.subscribe(connection_id);

        let mut greeting = Vec::with_capacity(1 + state.awareness.len());
        greeting.push(SyncMessage::sync_step2(connection_id, self.room_id, state.document.snapshot()).encode()?);
        for entry in state.awareness.list() {
            greeting.push(
                SyncMessage::awareness(entry.connection_id, self.room_id, entry.clock, &entry.state)?.encode()?,
            );
        }

        log::info!(
            "Connection {connection_id} attached to room {} ({} connected)",
            self.room_id,
            state.connections.len()
        );
        Ok(Some(Attachment {
            connection_id,
            subscriber,
            greeting,
        }))
    }

    /// Remove a connection and its presence. Returns `true` when this was
    /// the last connection of an open hub, which is then `Closing` and owned
    /// by the caller until flushed or reopened.
    pub async fn detach(&self, connection_id: Uuid) -> bool {
        let mut state = self.state.lock().await;
        state.connections.remove(&connection_id);
        if state.awareness.remove(connection_id).is_some() {
            self.broadcast_departure(connection_id);
        }
        log::info!(
            "Connection {connection_id} detached from room {} ({} remaining)",
            self.room_id,
            state.connections.len()
        );
        self.close_locked(&state)
    }

    /// Move an empty open hub to `Closing`. Returns whether it did.
    pub async fn close_if_empty(&self) -> bool {
        let state = self.state.lock().await;
        self.close_locked(&state)
    }

    fn close_locked(&self, state: &HubState) -> bool {
        if state.connections.is_empty() && self.phase() == HubPhase::Open {
            self.phase.send_replace(HubPhase::Closing);
            return true;
        }
        false
    }

    // Back to `Open` after a failed flush.
    async fn reopen(&self) {
        let _state = self.state.lock().await;
        if self.phase() == HubPhase::Closing {
            self.phase.send_replace(HubPhase::Open);
        }
    }

    fn mark_retired(&self) {
        self.phase.send_if_modified(|phase| {
            if *phase == HubPhase::Deleted {
                return false;
            }
            *phase = HubPhase::Retired;
            true
        });
    }

    /// Stop accepting traffic and wait out any flush in progress. Attached
    /// connections observe the change through [`RoomHub::wait_deleted`].
    async fn mark_deleted(&self) {
        {
            let _state = self.state.lock().await;
            self.phase.send_replace(HubPhase::Deleted);
        }
        let _flush = self.flush.lock().await;
    }

    /// Resolves once the hub has left `Closing`.
    pub async fn wait_settled(&self) {
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase != HubPhase::Closing).await;
    }

    /// Resolves once the room has been deleted.
    pub async fn wait_deleted(&self) {
        let mut rx = self.phase.subscribe();
        let _ = rx.wait_for(|phase| *phase == HubPhase::Deleted).await;
    }

    /// Merge an operation from `origin` and relay it verbatim to everyone
    /// else. A malformed operation is dropped: logged, never relayed, and
    /// the sender stays connected. Returns whether it was merged.
    pub async fn apply_update(&self, origin: Uuid, payload: Vec<u8>) -> bool {
        let mut state = self.state.lock().await;
        if self.phase() != HubPhase::Open {
            return false;
        }
        let op = Operation::from(payload);
        if let Err(e) = state.document.merge_remote_operation(&op) {
            HubMetrics::bump(&self.metrics.updates_dropped);
            log::warn!("Dropped operation from {origin} in room {}: {e}", self.room_id);
            return false;
        }
        state.sequence += 1;
        let msg = SyncMessage::update(origin, self.room_id, state.sequence, op.into_bytes());
        if let Err(e) = self.group.broadcast(Some(origin), &msg) {
            log::error!("Failed to encode relay for room {}: {e}", self.room_id);
        }
        HubMetrics::bump(&self.metrics.updates_merged);
        true
    }

    /// Answer a state vector with the diff the peer is missing.
    pub async fn sync_step1(&self, connection_id: Uuid, state_vector: &[u8]) -> Result<Vec<u8>> {
        let state = self.state.lock().await;
        let diff = state.document.diff_since(state_vector)?;
        Ok(SyncMessage::sync_step2(connection_id, self.room_id, diff).encode()?)
    }

    /// Last-writer-wins upsert of a connection's presence, relayed to others.
    /// A blank colour is replaced by one derived from the connection id.
    pub async fn publish_awareness(&self, origin: Uuid, clock: u64, mut entry: AwarenessState) -> bool {
        let mut state = self.state.lock().await;
        if !state.connections.contains(&origin) {
            return false;
        }
        if entry.color.trim().is_empty() {
            entry.color = color_for(origin);
        }
        if !state.awareness.publish(origin, clock, entry.clone()) {
            log::trace!("Stale awareness from {origin} (clock {clock}) ignored");
            return false;
        }
        match SyncMessage::awareness(origin, self.room_id, clock, &entry) {
            Ok(msg) => {
                let _ = self.group.broadcast(Some(origin), &msg);
            }
            Err(e) => log::error!("Failed to encode awareness for room {}: {e}", self.room_id),
        }
        HubMetrics::bump(&self.metrics.awareness_published);
        log::trace!("Awareness from {origin} in room {}", self.room_id);
        true
    }

    pub async fn heartbeat(&self, connection_id: Uuid) -> bool {
        self.state.lock().await.awareness.heartbeat(connection_id)
    }

    /// Evict presence entries whose heartbeat stopped, announcing each.
    pub async fn sweep(&self) -> Vec<Uuid> {
        let mut state = self.state.lock().await;
        let evicted = state.awareness.evict_stale();
        for connection_id in &evicted {
            self.broadcast_departure(*connection_id);
            HubMetrics::bump(&self.metrics.awareness_evicted);
            log::debug!("Evicted stale presence {connection_id} from room {}", self.room_id);
        }
        evicted
    }

    fn broadcast_departure(&self, connection_id: Uuid) {
        let msg = SyncMessage::awareness_remove(connection_id, self.room_id);
        if let Err(e) = self.group.broadcast(None, &msg) {
            log::error!("Failed to encode departure for room {}: {e}", self.room_id);
        }
    }

    pub async fn snapshot(&self) -> Vec<u8> {
        self.state.lock().await.document.snapshot()
    }

    pub async fn text(&self) -> String {
        self.state.lock().await.document.text()
    }

    pub async fn chat_messages(&self) -> Vec<ChatMessage> {
        self.state.lock().await.document.chat_messages()
    }

    pub async fn presence(&self) -> Vec<AwarenessEntry> {
        self.state.lock().await.awareness.list()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }
}

struct RoomEntry {
    hub: Arc<RoomHub>,
    sweeper: JoinHandle<()>,
}

// Persisted snapshot if any, else the room language's welcome text,
// else blank for rooms with no record.
fn load_from_store(store: &Store, room_id: Uuid) -> Result<ReplicatedDocument> {
    if let Some(snapshot) = store.load_snapshot(room_id)? {
        let document = ReplicatedDocument::from_snapshot(&snapshot)
            .map_err(|e| CollabError::Persistence(format!("corrupt snapshot for room {room_id}: {e}")))?;
        log::info!("Loaded persisted snapshot for room {room_id}");
        return Ok(document);
    }
    Ok(match store.get_room(room_id)? {
        Some(room) => ReplicatedDocument::with_text(room.language.default_content()),
        None => ReplicatedDocument::new(),
    })
}

/// Maps room ids to their live hub. Owned by the composition root.
pub struct HubRegistry {
    hubs: RwLock<HashMap<Uuid, RoomEntry>>,
    // Bumped on every removal from `hubs`.
    evictions: AtomicU64,
    store: Option<Arc<Store>>,
    config: HubConfig,
    metrics: Arc<HubMetrics>,
}

impl HubRegistry {
    pub fn new(config: HubConfig, store: Option<Arc<Store>>) -> Self {
        Self {
            hubs: RwLock::new(HashMap::new()),
            evictions: AtomicU64::new(0),
            store,
            config,
            metrics: Arc::new(HubMetrics::default()),
        }
    }

    pub fn in_memory(config: HubConfig) -> Self {
        Self::new(config, None)
    }

    pub fn metrics(&self) -> &Arc<HubMetrics> {
        &self.metrics
    }

    pub fn store(&self) -> Option<&Arc<Store>> {
        self.store.as_ref()
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    async fn load_document(&self, room_id: Uuid) -> Result<ReplicatedDocument> {
        let Some(store) = self.store.clone() else {
            return Ok(ReplicatedDocument::new());
        };
        tokio::task::spawn_blocking(move || load_from_store(&store, room_id))
            .await
            .map_err(|e| CollabError::Persistence(format!("load task failed: {e}")))?
    }

    fn spawn_sweeper(&self, hub: &Arc<RoomHub>) -> JoinHandle<()> {
        let weak: Weak<RoomHub> = Arc::downgrade(hub);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(hub) = weak.upgrade() else { break };
                hub.sweep().await;
            }
        })
    }

    /// The live hub for `room_id`, activating it if needed. The document is
    /// loaded without holding the registry lock.
    pub async fn get_or_create(&self, room_id: Uuid) -> Result<Arc<RoomHub>> {
        loop {
            let epoch = {
                let hubs = self.hubs.read().await;
                if let Some(entry) = hubs.get(&room_id) {
                    return Ok(entry.hub.clone());
                }
                self.evictions.load(Ordering::Acquire)
            };

            let document = self.load_document(room_id).await.map_err(|e| {
                HubMetrics::bump(&self.metrics.persistence_failures);
                log::error!("Room {room_id} could not be activated: {e}");
                match e {
                    CollabError::Persistence(_) => e,
                    other => CollabError::Persistence(other.to_string()),
                }
            })?;

            let mut hubs = self.hubs.write().await;
            if let Some(entry) = hubs.get(&room_id) {
                return Ok(entry.hub.clone());
            }
            if self.evictions.load(Ordering::Acquire) != epoch {
                // A hub left while we were loading; its flush may be newer
                // than what we read.
                continue;
            }
            let hub = Arc::new(RoomHub::new(room_id, document, self.config.clone(), self.metrics.clone()));
            let sweeper = self.spawn_sweeper(&hub);
            hubs.insert(
                room_id,
                RoomEntry {
                    hub: hub.clone(),
                    sweeper,
                },
            );
            log::info!("Room {room_id} activated ({} active)", hubs.len());
            return Ok(hub);
        }
    }

    /// Activate (if needed) and attach. A hub caught closing is waited out,
    /// then the join retries against whatever is live.
    pub async fn join(&self, room_id: Uuid) -> Result<(Arc<RoomHub>, Attachment)> {
        loop {
            let hub = self.get_or_create(room_id).await?;
            if let Some(attachment) = hub.try_attach().await? {
                return Ok((hub, attachment));
            }
            hub.wait_settled().await;
        }
    }

    /// Detach a connection from the hub it joined, and evict the hub if that
    /// was the last one. Returns whether the hub was evicted.
    pub async fn leave(&self, hub: &Arc<RoomHub>, connection_id: Uuid) -> Result<bool> {
        if !hub.detach(connection_id).await {
            return Ok(false);
        }
        self.retire(hub).await
    }

    /// Persist and drop the hub if nobody is connected. A failed flush keeps
    /// the hub resident.
    pub async fn evict_if_empty(&self, room_id: Uuid) -> Result<bool> {
        let Some(hub) = self.get(room_id).await else {
            return Ok(false);
        };
        if !hub.close_if_empty().await {
            return Ok(false);
        }
        self.retire(&hub).await
    }

    // Flush a `Closing` hub and drop it from the map.
    async fn retire(&self, hub: &Arc<RoomHub>) -> Result<bool> {
        if let Err(e) = self.flush(hub).await {
            hub.reopen().await;
            return Err(e);
        }
        self.remove(hub).await;
        hub.mark_retired();
        Ok(true)
    }

    async fn remove(&self, hub: &Arc<RoomHub>) -> Option<RoomEntry> {
        let room_id = hub.room_id();
        let mut hubs = self.hubs.write().await;
        if !hubs.get(&room_id).is_some_and(|entry| Arc::ptr_eq(&entry.hub, hub)) {
            return None;
        }
        let entry = hubs.remove(&room_id)?;
        self.evictions.fetch_add(1, Ordering::Release);
        entry.sweeper.abort();
        log::info!("Room {room_id} evicted ({} active)", hubs.len());
        Some(entry)
    }

    /// Drop a deleted room's hub without flushing it and close every
    /// connection still attached. Returns whether a hub was live.
    pub async fn discard(&self, room_id: Uuid) -> bool {
        let Some(hub) = self.get(room_id).await else {
            return false;
        };
        self.remove(&hub).await;
        hub.mark_deleted().await;
        log::info!("Room {room_id} discarded");
        true
    }

    async fn flush(&self, hub: &RoomHub) -> Result<()> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        let _flush = hub.flush.lock().await;
        if hub.phase() == HubPhase::Deleted {
            return Ok(());
        }
        let room_id = hub.room_id();
        let snapshot = hub.snapshot().await;
        let raw_len = snapshot.len();
        let saved = tokio::task::spawn_blocking(move || store.save_snapshot(room_id, &snapshot))
            .await
            .map_err(|e| CollabError::Persistence(format!("flush task failed: {e}")))?;
        match saved {
            Ok(compressed) => {
                HubMetrics::bump(&self.metrics.snapshots_persisted);
                log::info!("Persisted snapshot for room {room_id} ({raw_len} bytes, {compressed} compressed)");
                Ok(())
            }
            Err(e) => {
                HubMetrics::bump(&self.metrics.persistence_failures);
                log::error!("Failed to persist snapshot for room {room_id}: {e}");
                Err(e.into())
            }
        }
    }

    /// Flush every active room without evicting it.
    pub async fn persist_all(&self) -> Result<usize> {
        let hubs: Vec<Arc<RoomHub>> = self.hubs.read().await.values().map(|e| e.hub.clone()).collect();
        for hub in &hubs {
            self.flush(hub).await?;
        }
        Ok(hubs.len())
    }

    pub async fn get(&self, room_id: Uuid) -> Option<Arc<RoomHub>> {
        self.hubs.read().await.get(&room_id).map(|e| e.hub.clone())
    }

    pub async fn room_count(&self) -> usize {
        self.hubs.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<Uuid> {
        self.hubs.read().await.keys().copied().collect()
    }
}

impl Drop for HubRegistry {
    fn drop(&mut self) {
        for entry in self.hubs.get_mut().values() {
            entry.sweeper.abort();
        }
    }
}
