//! Pairpad server: the WebSocket sync transport and the REST API in one
//! process, sharing one RocksDB store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pairpad_collab::api::{self, ApiConfig, AppState};
use pairpad_collab::authority::{AuthorityConfig, MembershipAuthority};
use pairpad_collab::server::{ServerConfig, SyncServer};
use pairpad_collab::storage::{Store, StoreConfig};

const INVITE_PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Parser, Debug)]
#[command(name = "pairpad-server")]
#[command(version, about = "Collaborative code rooms: sync transport + REST API", long_about = None)]
struct Args {
    /// Interface both listeners bind to
    #[arg(long, env = "HOST", default_value = "127.0.0.1")]
    host: String,

    /// REST API port
    #[arg(long, env = "PORT", default_value_t = 4000)]
    port: u16,

    /// WebSocket sync port
    #[arg(long, env = "SYNC_PORT", default_value_t = 1234)]
    sync_port: u16,

    /// RocksDB directory
    #[arg(long, env = "DATA_DIR", default_value = "pairpad_data")]
    data_dir: PathBuf,

    /// Base URL used in invite links
    #[arg(long, env = "FRONTEND_URL", default_value = "http://localhost:5173")]
    frontend_url: String,

    /// Seconds without a heartbeat before a presence entry is dropped
    #[arg(long, env = "HEARTBEAT_TIMEOUT_SECS", default_value_t = 30)]
    heartbeat_timeout_secs: u64,

    #[arg(long, env = "MAX_PEERS_PER_ROOM", default_value_t = 100)]
    max_peers_per_room: usize,

    /// Per-connection outgoing queue before a slow client is dropped
    #[arg(long, env = "BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,

    /// fsync every store write
    #[arg(long, env = "SYNC_WRITES")]
    sync_writes: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let store = Arc::new(Store::open(StoreConfig {
        sync_writes: args.sync_writes,
        ..StoreConfig::new(&args.data_dir)
    })?);
    log::info!("Opened store at {}", store.path().display());

    let authority = Arc::new(MembershipAuthority::new(
        store.clone(),
        AuthorityConfig {
            frontend_url: args.frontend_url.clone(),
            ..AuthorityConfig::default()
        },
    ));

    let sync_config = ServerConfig {
        bind_addr: format!("{}:{}", args.host, args.sync_port),
        max_peers_per_room: args.max_peers_per_room,
        broadcast_capacity: args.broadcast_capacity,
        heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout_secs),
        ..ServerConfig::default()
    };
    let sync_server = SyncServer::new(sync_config, Some(store));
    let api_config = ApiConfig {
        bind_addr: format!("{}:{}", args.host, args.port),
    };

    let purger = authority.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(INVITE_PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            let purger = purger.clone();
            match tokio::task::spawn_blocking(move || purger.purge_expired_invites()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => log::warn!("Invite purge failed: {e}"),
                Err(e) => log::warn!("Invite purge task failed: {e}"),
            }
        }
    });

    let state = AppState::new(authority).with_rooms(sync_server.registry().clone());
    tokio::select! {
        result = sync_server.run() => {
            if let Err(e) = result {
                log::error!("Sync server stopped: {e}");
            }
        }
        result = api::run(&api_config, state) => {
            if let Err(e) = result {
                log::error!("REST API stopped: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down");
        }
    }

    match sync_server.registry().persist_all().await {
        Ok(n) => log::info!("Flushed {n} active rooms"),
        Err(e) => log::error!("Final flush failed: {e}"),
    }
    Ok(())
}
