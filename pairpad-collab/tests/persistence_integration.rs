//! Persistence integration tests.
//!
//! Verifies:
//! - A room's snapshot is written when its last connection leaves
//! - A re-activated room is rehydrated from that snapshot
//! - A brand new room starts from its language's welcome text
//! - Documents survive a full server restart on the same data directory
//! - Deleting a room through the API closes its live connections for good

use std::path::Path;
use std::sync::Arc;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use pairpad_collab::api::{router, AppState};
use pairpad_collab::authority::{AuthorityConfig, MembershipAuthority};
use pairpad_collab::awareness::AwarenessState;
use pairpad_collab::client::{SyncClient, SyncEvent};
use pairpad_collab::document::ReplicatedDocument;
use pairpad_collab::model::{Identity, Language};
use pairpad_collab::server::{ServerConfig, SyncServer};
use pairpad_collab::storage::{Store, StoreConfig};
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tower::ServiceExt;
use uuid::Uuid;

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn start_server(store: Arc<Store>) -> (Arc<SyncServer>, String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = Arc::new(SyncServer::new(ServerConfig::default(), Some(store)));
    let serving = server.clone();
    let handle = tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });
    (server, url, handle)
}

async fn connect(name: &str, room_id: Uuid, url: &str) -> (SyncClient, Receiver<SyncEvent>) {
    let mut client = SyncClient::new(room_id, url, AwarenessState::new(name, "#6366f1"));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(SyncEvent::Synced(_))) => {}
        other => panic!("Expected Synced event, got {other:?}"),
    }
    (client, events)
}

/// Poll until the registry has let go of every room.
async fn wait_for_eviction(server: &SyncServer) {
    for _ in 0..100 {
        if server.registry().room_count().await == 0 {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("room was never evicted");
}

/// RocksDB holds a directory lock until the last handle drops.
async fn reopen(path: &Path) -> Store {
    for _ in 0..100 {
        if let Ok(store) = Store::open(StoreConfig::for_testing(path)) {
            return store;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("store at {} never became available", path.display());
}

// ─── Snapshot on idle ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_snapshot_written_on_last_leave_and_rehydrated() {
    let dir = tempdir().unwrap();
    let store = Arc::new(Store::open(StoreConfig::for_testing(dir.path())).unwrap());
    let (server, url, _handle) = start_server(store.clone()).await;
    let room = Uuid::new_v4();

    let (mut alice, _events) = connect("Alice", room, &url).await;
    alice.insert(0, "persist me").await.unwrap();
    alice.disconnect().await;
    wait_for_eviction(&server).await;

    let snapshot = store.load_snapshot(room).unwrap().expect("snapshot written");
    assert_eq!(ReplicatedDocument::from_snapshot(&snapshot).unwrap().text(), "persist me");

    let (bob, _events) = connect("Bob", room, &url).await;
    assert_eq!(bob.text().await, "persist me");
}

#[tokio::test]
async fn test_chat_history_persists() {
    let dir = tempdir().unwrap();
    let store = Arc::new(Store::open(StoreConfig::for_testing(dir.path())).unwrap());
    let (server, url, _handle) = start_server(store).await;
    let room = Uuid::new_v4();

    let (mut alice, _events) = connect("Alice", room, &url).await;
    alice.send_chat("first").await.unwrap();
    alice.send_chat("second").await.unwrap();
    alice.disconnect().await;
    wait_for_eviction(&server).await;

    let (bob, _events) = connect("Bob", room, &url).await;
    let texts: Vec<String> = bob.chat_messages().await.into_iter().map(|m| m.text).collect();
    assert_eq!(texts, vec!["first".to_string(), "second".to_string()]);
}

// ─── Seeding ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_new_room_seeded_with_language_default() {
    let dir = tempdir().unwrap();
    let store = Arc::new(Store::open(StoreConfig::for_testing(dir.path())).unwrap());
    let authority = MembershipAuthority::new(store.clone(), AuthorityConfig::default());
    let room = authority
        .create_room("Scripts", Language::Python, &Identity::guest("g1"))
        .unwrap();
    let (_server, url, _handle) = start_server(store).await;

    let (alice, _events) = connect("Alice", room.id, &url).await;
    assert_eq!(alice.text().await, Language::Python.default_content());
}

#[tokio::test]
async fn test_unknown_room_starts_blank() {
    let dir = tempdir().unwrap();
    let store = Arc::new(Store::open(StoreConfig::for_testing(dir.path())).unwrap());
    let (_server, url, _handle) = start_server(store).await;

    let (alice, _events) = connect("Alice", Uuid::new_v4(), &url).await;
    assert_eq!(alice.text().await, "");
}

#[tokio::test]
async fn test_deleting_room_drops_snapshot() {
    let dir = tempdir().unwrap();
    let store = Arc::new(Store::open(StoreConfig::for_testing(dir.path())).unwrap());
    let authority = MembershipAuthority::new(store.clone(), AuthorityConfig::default());
    let owner = Identity::guest("g1");
    let room = authority.create_room("Temp", Language::Css, &owner).unwrap();
    let (server, url, _handle) = start_server(store.clone()).await;

    let (mut alice, _events) = connect("Alice", room.id, &url).await;
    alice.insert(0, "/* x */").await.unwrap();
    alice.disconnect().await;
    wait_for_eviction(&server).await;
    assert!(store.load_snapshot(room.id).unwrap().is_some());

    authority.delete_room(room.id, &owner).unwrap();
    assert!(store.load_snapshot(room.id).unwrap().is_none());
}

#[tokio::test]
async fn test_deleting_room_while_connected() {
    let dir = tempdir().unwrap();
    let store = Arc::new(Store::open(StoreConfig::for_testing(dir.path())).unwrap());
    let authority = Arc::new(MembershipAuthority::new(store.clone(), AuthorityConfig::default()));
    let room = authority
        .create_room("Doomed", Language::TypeScript, &Identity::guest("g1"))
        .unwrap();
    let (server, url, _handle) = start_server(store.clone()).await;
    let api = router(AppState::new(authority).with_rooms(server.registry().clone()));

    let (alice, mut events) = connect("Alice", room.id, &url).await;
    alice.insert(0, "// unsaved").await.unwrap();
    let hub = server.registry().get(room.id).await.unwrap();
    for _ in 0..100 {
        if hub.text().await.starts_with("// unsaved") {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }

    let request = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/rooms/{}", room.id))
        .header("x-guest-id", "g1")
        .body(Body::empty())
        .unwrap();
    let response = api.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let closed = timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Some(SyncEvent::Disconnected) | None => break,
                Some(_) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "client stayed connected to a deleted room");

    for _ in 0..100 {
        if server.stats().await.active_connections == 0 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.stats().await.active_connections, 0);
    assert_eq!(server.registry().room_count().await, 0);
    assert!(store.load_snapshot(room.id).unwrap().is_none());
    assert!(store.get_room(room.id).unwrap().is_none());
}

// ─── Restart ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_document_survives_restart() {
    let dir = tempdir().unwrap();
    let room = Uuid::new_v4();

    {
        let store = Arc::new(Store::open(StoreConfig::for_testing(dir.path())).unwrap());
        let (server, url, handle) = start_server(store).await;
        let (mut alice, _events) = connect("Alice", room, &url).await;
        alice.insert(0, "before restart").await.unwrap();
        alice.disconnect().await;
        wait_for_eviction(&server).await;
        handle.abort();
    }

    let store = Arc::new(reopen(dir.path()).await);
    let (_server, url, _handle) = start_server(store).await;
    let (bob, _events) = connect("Bob", room, &url).await;
    assert_eq!(bob.text().await, "before restart");
}
