//! Binary protocol between a client connection and its room's sync hub.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ connection_id │ room_id  │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes      │ 16 bytes │ varint   │ variable │
//! └──────────┴───────────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Two logical channels share one connection: the sync channel carries the
//! replicated document (snapshot exchange and incremental operations), the
//! awareness channel carries presence upserts and removals. Framing and
//! handshake belong to the transport; one WebSocket binary frame is one
//! message, at most [`MAX_FRAME_BYTES`] long. Awareness payloads are
//! bincode-encoded [`AwarenessState`]s.
//!
//! `connection_id` on inbound messages is advisory only: the hub always
//! stamps the id of the connection a message actually arrived on.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::awareness::AwarenessState;

/// Upper bound on one encoded message. Declared lengths beyond it are
/// rejected before anything is allocated.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_FRAME_BYTES>()
}

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// First message on a connection: selects the room.
    Join = 1,
    /// State vector, asking the other side for what it is missing
    SyncStep1 = 2,
    /// Full snapshot or state diff
    SyncStep2 = 3,
    /// Incremental document operation (text or chat)
    Update = 4,
    /// Presence entry upsert
    Awareness = 5,
    /// Presence entry removal (departure)
    AwarenessRemove = 6,
    /// Liveness signal for stale-presence eviction
    Heartbeat = 7,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub connection_id: Uuid,
    pub room_id: Uuid,
    /// Awareness clock for presence messages, hub sequence for updates
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, connection_id: Uuid, room_id: Uuid, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            connection_id,
            room_id,
            clock,
            payload,
        }
    }

    /// Join a room. Sent once, before anything else.
    pub fn join(room_id: Uuid) -> Self {
        Self::new(MessageType::Join, Uuid::nil(), room_id, 0, Vec::new())
    }

    pub fn sync_step1(connection_id: Uuid, room_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, connection_id, room_id, 0, state_vector)
    }

    /// Sent by the hub right after a join: `connection_id` is the id the hub
    /// assigned to the joining connection and `payload` is a full snapshot.
    pub fn sync_step2(connection_id: Uuid, room_id: Uuid, update: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, connection_id, room_id, 0, update)
    }

    pub fn update(connection_id: Uuid, room_id: Uuid, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, connection_id, room_id, clock, update)
    }

    pub fn awareness(
        connection_id: Uuid,
        room_id: Uuid,
        clock: u64,
        state: &AwarenessState,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(state, wire_config())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self::new(MessageType::Awareness, connection_id, room_id, clock, payload))
    }

    pub fn awareness_remove(connection_id: Uuid, room_id: Uuid) -> Self {
        Self::new(MessageType::AwarenessRemove, connection_id, room_id, 0, Vec::new())
    }

    pub fn heartbeat(connection_id: Uuid, room_id: Uuid) -> Self {
        Self::new(MessageType::Heartbeat, connection_id, room_id, 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, wire_config())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, wire_config())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse an awareness payload.
    pub fn awareness_state(&self) -> Result<AwarenessState, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (state, _) = bincode::serde::decode_from_slice(&self.payload, wire_config())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(state)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::CursorRange;

    #[test]
    fn test_update_roundtrip() {
        let conn = Uuid::new_v4();
        let room = Uuid::new_v4();
        let payload = vec![1, 2, 3, 4, 5];

        let msg = SyncMessage::update(conn, room, 42, payload.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.connection_id, conn);
        assert_eq!(decoded.room_id, room);
        assert_eq!(decoded.clock, 42);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_join_carries_room_only() {
        let room = Uuid::new_v4();
        let decoded = SyncMessage::decode(&SyncMessage::join(room).encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Join);
        assert_eq!(decoded.room_id, room);
        assert!(decoded.connection_id.is_nil());
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_awareness_payload() {
        let state = AwarenessState {
            display_name: "Alice".into(),
            color: "#ff0000".into(),
            cursor: Some(CursorRange { anchor: 3, head: 7 }),
        };
        let msg = SyncMessage::awareness(Uuid::new_v4(), Uuid::new_v4(), 7, &state).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.clock, 7);
        assert_eq!(decoded.awareness_state().unwrap(), state);
    }

    #[test]
    fn test_awareness_state_on_wrong_type() {
        let msg = SyncMessage::heartbeat(Uuid::new_v4(), Uuid::new_v4());
        assert!(matches!(msg.awareness_state(), Err(ProtocolError::InvalidMessageType)));
    }

    #[test]
    fn test_oversized_declared_payload_rejected() {
        let msg = SyncMessage::update(Uuid::new_v4(), Uuid::new_v4(), 1, vec![7u8; 4]);
        let mut bytes = msg.encode().unwrap();
        // The payload length prefix is the byte right before the payload;
        // replace it with a varint claiming u32::MAX bytes.
        let prefix_at = bytes.len() - 5;
        bytes.truncate(prefix_at);
        bytes.extend_from_slice(&[0xFC, 0xFF, 0xFF, 0xFF, 0xFF]);
        bytes.extend_from_slice(&[7u8; 4]);
        assert!(matches!(
            SyncMessage::decode(&bytes),
            Err(ProtocolError::DeserializationError(_))
        ));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Join as u8, 1);
        assert_eq!(MessageType::SyncStep1 as u8, 2);
        assert_eq!(MessageType::SyncStep2 as u8, 3);
        assert_eq!(MessageType::Update as u8, 4);
        assert_eq!(MessageType::Awareness as u8, 5);
        assert_eq!(MessageType::AwarenessRemove as u8, 6);
        assert_eq!(MessageType::Heartbeat as u8, 7);
    }

    #[test]
    fn test_large_update() {
        let update = vec![42u8; 65536];
        let msg = SyncMessage::update(Uuid::new_v4(), Uuid::new_v4(), 999, update.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.payload, update);
    }
}
