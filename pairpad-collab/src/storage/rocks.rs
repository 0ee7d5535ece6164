//! RocksDB-backed store for room state.
//!
//! Column families:
//! - `documents`: replicated document snapshots (LZ4), keyed by room id
//! - `rooms`: [`Room`] records (bincode), keyed by room id
//! - `members`: [`RoomMember`] rows (bincode), keyed by `room_id ++ email`
//! - `invites`: [`Invite`] records (bincode), keyed by token
//!
//! Multi-record changes (room creation with its admin row, invite
//! acceptance, room deletion) go through a single `WriteBatch`.

use chrono::{DateTime, Utc};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Invite, Room, RoomMember};

const CF_DOCUMENTS: &str = "documents";
const CF_ROOMS: &str = "rooms";
const CF_MEMBERS: &str = "members";
const CF_INVITES: &str = "invites";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_ROOMS, CF_MEMBERS, CF_INVITES];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pairpad_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

fn member_key(room_id: Uuid, email: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + email.len());
    key.extend_from_slice(room_id.as_bytes());
    key.extend_from_slice(email.as_bytes());
    key
}

/// Durable storage for snapshots and the room/member/invite records.
pub struct Store {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl Store {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Snapshots are already LZ4 framed.
            CF_DOCUMENTS => opts.set_compression_type(DBCompressionType::None),
            CF_MEMBERS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    // ─── Document snapshots ───────────────────────────────────────────

    /// Save a document snapshot. Returns the compressed size.
    pub fn save_snapshot(&self, room_id: Uuid, snapshot: &[u8]) -> Result<usize, StoreError> {
        let compressed = lz4_flex::compress_prepend_size(snapshot);
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DOCUMENTS)?, room_id.as_bytes(), &compressed);
        self.write(batch)?;
        Ok(compressed.len())
    }

    pub fn load_snapshot(&self, room_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        match self.db.get_cf(self.cf(CF_DOCUMENTS)?, room_id.as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::CompressionError(e.to_string())),
            None => Ok(None),
        }
    }

    // ─── Rooms ────────────────────────────────────────────────────────

    /// Create a room together with its first membership row.
    pub fn create_room(&self, room: &Room, admin: &RoomMember) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_ROOMS)?, room.id.as_bytes(), encode(room)?);
        batch.put_cf(
            self.cf(CF_MEMBERS)?,
            member_key(admin.room_id, &admin.email),
            encode(admin)?,
        );
        self.write(batch)
    }

    pub fn put_room(&self, room: &Room) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_ROOMS)?, room.id.as_bytes(), encode(room)?);
        self.write(batch)
    }

    pub fn get_room(&self, room_id: Uuid) -> Result<Option<Room>, StoreError> {
        self.get(CF_ROOMS, room_id.as_bytes())
    }

    pub fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_ROOMS)?, IteratorMode::Start) {
            let (_, value) = item?;
            rooms.push(decode(&value)?);
        }
        Ok(rooms)
    }

    /// Remove a room with its members, invites and snapshot.
    pub fn delete_room(&self, room_id: Uuid) -> Result<(), StoreError> {
        let cf_members = self.cf(CF_MEMBERS)?;
        let cf_invites = self.cf(CF_INVITES)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_ROOMS)?, room_id.as_bytes());
        batch.delete_cf(self.cf(CF_DOCUMENTS)?, room_id.as_bytes());

        for key in self.member_keys(room_id)? {
            batch.delete_cf(cf_members, key);
        }
        for item in self.db.iterator_cf(cf_invites, IteratorMode::Start) {
            let (key, value) = item?;
            let invite: Invite = decode(&value)?;
            if invite.room_id == room_id {
                batch.delete_cf(cf_invites, key);
            }
        }
        self.write(batch)
    }

    // ─── Members ──────────────────────────────────────────────────────

    fn member_keys(&self, room_id: Uuid) -> Result<Vec<Box<[u8]>>, StoreError> {
        let prefix = room_id.as_bytes();
        let mut keys = Vec::new();
        let iter = self.db.iterator_cf(
            self.cf(CF_MEMBERS)?,
            IteratorMode::From(&prefix[..], Direction::Forward),
        );
        for item in iter {
            let (key, _) = item?;
            if key.len() < 16 || &key[..16] != prefix {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    /// Insert or replace the row for `(room_id, email)`.
    pub fn put_member(&self, member: &RoomMember) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_MEMBERS)?,
            member_key(member.room_id, &member.email),
            encode(member)?,
        );
        self.write(batch)
    }

    pub fn get_member(&self, room_id: Uuid, email: &str) -> Result<Option<RoomMember>, StoreError> {
        self.get(CF_MEMBERS, &member_key(room_id, email))
    }

    /// Rows for one room in key order (by email).
    pub fn list_members(&self, room_id: Uuid) -> Result<Vec<RoomMember>, StoreError> {
        let prefix = room_id.as_bytes();
        let mut members = Vec::new();
        let iter = self.db.iterator_cf(
            self.cf(CF_MEMBERS)?,
            IteratorMode::From(&prefix[..], Direction::Forward),
        );
        for item in iter {
            let (key, value) = item?;
            if key.len() < 16 || &key[..16] != prefix {
                break;
            }
            members.push(decode(&value)?);
        }
        Ok(members)
    }

    // ─── Invites ──────────────────────────────────────────────────────

    pub fn put_invite(&self, invite: &Invite) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_INVITES)?, invite.token.as_bytes(), encode(invite)?);
        self.write(batch)
    }

    pub fn get_invite(&self, token: &str) -> Result<Option<Invite>, StoreError> {
        self.get(CF_INVITES, token.as_bytes())
    }

    /// Mark an invite used and upsert the resulting membership in one batch.
    pub fn commit_acceptance(&self, invite: &Invite, member: &RoomMember) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_INVITES)?, invite.token.as_bytes(), encode(invite)?);
        batch.put_cf(
            self.cf(CF_MEMBERS)?,
            member_key(member.room_id, &member.email),
            encode(member)?,
        );
        self.write(batch)
    }

    /// Drop every invite that expired before `now`. Returns how many went.
    /// Used invites are kept until they expire like any other, so a replayed
    /// token keeps answering "already used" for its whole lifetime.
    pub fn purge_expired_invites(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let cf = self.cf(CF_INVITES)?;
        let mut batch = WriteBatch::default();
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let invite: Invite = decode(&value)?;
            if invite.is_expired_at(now) {
                batch.delete_cf(cf, key);
                count += 1;
            }
        }
        if count > 0 {
            self.write(batch)?;
        }
        Ok(count)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Identity, Language, Role};
    use chrono::Duration;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    fn member(room_id: Uuid, email: &str, role: Role) -> RoomMember {
        RoomMember {
            room_id,
            identity: Identity::user(email, email, email),
            email: email.into(),
            role,
            joined_at: Utc::now(),
        }
    }

    fn invite(room_id: Uuid, token: &str, expires_at: DateTime<Utc>) -> Invite {
        Invite {
            token: token.into(),
            room_id,
            invited_by: Identity::guest("g"),
            invited_email: "bob@example.com".into(),
            used: false,
            created_at: Utc::now(),
            expires_at,
        }
    }

    #[test]
    fn test_store_open() {
        let (dir, store) = open_temp();
        assert_eq!(store.path(), dir.path());
        assert!(store.path().exists());
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        let room_id = Uuid::new_v4();
        let data = b"snapshot bytes snapshot bytes snapshot bytes".repeat(20);

        let compressed = store.save_snapshot(room_id, &data).unwrap();
        assert!(compressed < data.len());
        assert_eq!(store.load_snapshot(room_id).unwrap(), Some(data));
        assert_eq!(store.load_snapshot(Uuid::new_v4()).unwrap(), None);
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let room_id = Uuid::new_v4();
        {
            let store = Store::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.save_snapshot(room_id, b"persisted").unwrap();
            store.sync().unwrap();
        }
        let store = Store::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.load_snapshot(room_id).unwrap().as_deref(), Some(&b"persisted"[..]));
    }

    #[test]
    fn test_room_crud() {
        let (_dir, store) = open_temp();
        let owner = Identity::user("u1", "alice@example.com", "Alice");
        let mut room = Room::new("Demo", Language::Python, owner).unwrap();
        store
            .create_room(&room, &member(room.id, "alice@example.com", Role::Admin))
            .unwrap();

        assert_eq!(store.get_room(room.id).unwrap(), Some(room.clone()));
        room.name = "Renamed".into();
        store.put_room(&room).unwrap();
        assert_eq!(store.get_room(room.id).unwrap().unwrap().name, "Renamed");
        assert_eq!(store.list_rooms().unwrap().len(), 1);
    }

    #[test]
    fn test_member_upsert_keyed_by_email() {
        let (_dir, store) = open_temp();
        let room_id = Uuid::new_v4();
        store.put_member(&member(room_id, "bob@example.com", Role::Member)).unwrap();
        store.put_member(&member(room_id, "bob@example.com", Role::Admin)).unwrap();
        store.put_member(&member(Uuid::new_v4(), "bob@example.com", Role::Member)).unwrap();

        let rows = store.list_members(room_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].role, Role::Admin);
        assert!(store.get_member(room_id, "bob@example.com").unwrap().is_some());
    }

    #[test]
    fn test_delete_room_cascades() {
        let (_dir, store) = open_temp();
        let room = Room::new("Doomed", Language::Css, Identity::guest("g")).unwrap();
        let other = Room::new("Kept", Language::Css, Identity::guest("g")).unwrap();
        store.create_room(&room, &member(room.id, "a@x.io", Role::Admin)).unwrap();
        store.create_room(&other, &member(other.id, "a@x.io", Role::Admin)).unwrap();
        store.put_invite(&invite(room.id, "t1", Utc::now() + Duration::hours(1))).unwrap();
        store.put_invite(&invite(other.id, "t2", Utc::now() + Duration::hours(1))).unwrap();
        store.save_snapshot(room.id, b"doc").unwrap();

        store.delete_room(room.id).unwrap();

        assert!(store.get_room(room.id).unwrap().is_none());
        assert!(store.list_members(room.id).unwrap().is_empty());
        assert!(store.get_invite("t1").unwrap().is_none());
        assert!(store.load_snapshot(room.id).unwrap().is_none());

        assert!(store.get_room(other.id).unwrap().is_some());
        assert_eq!(store.list_members(other.id).unwrap().len(), 1);
        assert!(store.get_invite("t2").unwrap().is_some());
    }

    #[test]
    fn test_commit_acceptance() {
        let (_dir, store) = open_temp();
        let room_id = Uuid::new_v4();
        let mut inv = invite(room_id, "tok", Utc::now() + Duration::hours(1));
        store.put_invite(&inv).unwrap();

        inv.used = true;
        store
            .commit_acceptance(&inv, &member(room_id, "bob@example.com", Role::Member))
            .unwrap();

        assert!(store.get_invite("tok").unwrap().unwrap().used);
        assert_eq!(store.list_members(room_id).unwrap().len(), 1);
    }

    #[test]
    fn test_purge_expired_invites() {
        let (_dir, store) = open_temp();
        let room_id = Uuid::new_v4();
        let now = Utc::now();
        store.put_invite(&invite(room_id, "old", now - Duration::hours(1))).unwrap();
        store.put_invite(&invite(room_id, "fresh", now + Duration::hours(1))).unwrap();

        assert_eq!(store.purge_expired_invites(now).unwrap(), 1);
        assert!(store.get_invite("old").unwrap().is_none());
        assert!(store.get_invite("fresh").unwrap().is_some());
        assert_eq!(store.purge_expired_invites(now).unwrap(), 0);
    }

    #[test]
    fn test_purge_keeps_used_invites_until_expiry() {
        let (_dir, store) = open_temp();
        let room_id = Uuid::new_v4();
        let now = Utc::now();
        let mut used = invite(room_id, "used", now + Duration::hours(1));
        used.used = true;
        store.put_invite(&used).unwrap();

        assert_eq!(store.purge_expired_invites(now).unwrap(), 0);
        assert!(store.get_invite("used").unwrap().unwrap().used);
        assert_eq!(store.purge_expired_invites(now + Duration::hours(2)).unwrap(), 1);
    }

    #[test]
    fn test_store_error_display() {
        assert_eq!(StoreError::DatabaseError("boom".into()).to_string(), "Database error: boom");
        assert_eq!(StoreError::NotFound("room".into()).to_string(), "Not found: room");
    }
}
