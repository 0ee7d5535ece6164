//! Replicated room document: the shared code buffer plus the chat log.
//!
//! Backed by a single `yrs` document holding two root types:
//!
//! | root   | type  | contents                                  |
//! |--------|-------|-------------------------------------------|
//! | `code` | Text  | the editor buffer, UTF-16 offsets         |
//! | `chat` | Array | one map per [`ChatMessage`], append-only  |
//!
//! Every local mutation returns an [`Operation`]: the binary v1 update for
//! exactly that change. Operations carry yrs item ids (client id + clock),
//! so merging is idempotent and commutes with concurrent operations; ties
//! between concurrent inserts at the same position resolve by client id on
//! every replica. A delete that arrives before its insert is held by yrs
//! as pending and integrates once the insert is known.
//!
//! Remote bytes are shape-checked by [`crate::update_shape`] before yrs
//! decodes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use yrs::updates::decoder::Decode;

use crate::update_shape::{check_state_vector_v1, check_update_v1};
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, Doc, GetString, OffsetKind, Options, Out, ReadTxn, StateVector, Text, Transact,
    Update,
};

const CODE: &str = "code";
const CHAT: &str = "chat";

pub const DEFAULT_CHAT_AUTHOR: &str = "Guest";
pub const DEFAULT_CHAT_COLOR: &str = "#6366f1";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("malformed operation: {0}")]
    MalformedOperation(String),
    #[error("operation could not be integrated: {0}")]
    Rejected(String),
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),
    #[error("malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("chat message is empty")]
    EmptyChatMessage,
}

/// An encoded document change, ready to broadcast or merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation(Vec<u8>);

impl Operation {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Structural validation without touching any replica.
    pub fn validate(&self) -> Result<(), DocumentError> {
        decode_operation(&self.0).map(|_| ())
    }
}

impl From<Vec<u8>> for Operation {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// One entry of the chat log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub author: String,
    pub author_color: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    /// New message stamped now. Blank author/colour fall back to the defaults.
    pub fn new(author: &str, author_color: &str, text: impl Into<String>) -> Self {
        let author = if author.trim().is_empty() { DEFAULT_CHAT_AUTHOR } else { author.trim() };
        let author_color = if author_color.trim().is_empty() {
            DEFAULT_CHAT_COLOR
        } else {
            author_color.trim()
        };
        Self {
            id: Uuid::new_v4().to_string(),
            author: author.to_string(),
            author_color: author_color.to_string(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    fn to_any(&self) -> Any {
        let mut map: HashMap<String, Any> = HashMap::new();
        map.insert("id".into(), Any::from(self.id.as_str()));
        map.insert("user".into(), Any::from(self.author.as_str()));
        map.insert("userColor".into(), Any::from(self.author_color.as_str()));
        map.insert("text".into(), Any::from(self.text.as_str()));
        map.insert("timestamp".into(), Any::from(self.timestamp.to_rfc3339().as_str()));
        Any::Map(Arc::new(map))
    }

    fn from_any(value: &Any) -> Option<Self> {
        let Any::Map(map) = value else {
            return None;
        };
        let field = |key: &str| match map.get(key) {
            Some(Any::String(s)) => Some(s.to_string()),
            _ => None,
        };
        let timestamp = DateTime::parse_from_rfc3339(&field("timestamp")?)
            .ok()?
            .with_timezone(&Utc);
        Some(Self {
            id: field("id")?,
            author: field("user").unwrap_or_else(|| DEFAULT_CHAT_AUTHOR.to_string()),
            author_color: field("userColor").unwrap_or_else(|| DEFAULT_CHAT_COLOR.to_string()),
            text: field("text")?,
            timestamp,
        })
    }
}

fn decode_operation(bytes: &[u8]) -> Result<Update, DocumentError> {
    check_update_v1(bytes).map_err(DocumentError::MalformedOperation)?;
    Update::decode_v1(bytes).map_err(|e| DocumentError::MalformedOperation(e.to_string()))
}

fn new_doc() -> Doc {
    Doc::with_options(Options {
        offset_kind: OffsetKind::Utf16,
        ..Options::default()
    })
}

/// A replica of one room's shared state. Pure data and merge logic.
pub struct ReplicatedDocument {
    doc: Doc,
}

impl ReplicatedDocument {
    pub fn new() -> Self {
        Self { doc: new_doc() }
    }

    /// Fresh document whose buffer starts with `content`.
    pub fn with_text(content: &str) -> Self {
        let document = Self::new();
        if !content.is_empty() {
            let code = document.doc.get_or_insert_text(CODE);
            let mut txn = document.doc.transact_mut();
            code.insert(&mut txn, 0, content);
        }
        document
    }

    /// Rehydrate from a snapshot produced by [`ReplicatedDocument::snapshot`].
    pub fn from_snapshot(bytes: &[u8]) -> Result<Self, DocumentError> {
        let mut document = Self::new();
        document.load_snapshot(bytes)?;
        Ok(document)
    }

    // Runs `change` and returns the v1 diff it produced.
    fn capture<F>(&self, change: F) -> Operation
    where
        F: FnOnce(&Doc),
    {
        let before = self.doc.transact().state_vector();
        change(&self.doc);
        Operation(self.doc.transact().encode_diff_v1(&before))
    }

    /// Insert at a UTF-16 offset, clamped to `[0, len]`.
    pub fn apply_local_insert(&mut self, position: u32, text: &str) -> Operation {
        self.capture(|doc| {
            let code = doc.get_or_insert_text(CODE);
            let mut txn = doc.transact_mut();
            let at = position.min(code.len(&txn));
            code.insert(&mut txn, at, text);
        })
    }

    /// Delete `length` UTF-16 units from `start`; both are clamped to the buffer.
    pub fn apply_local_delete(&mut self, start: u32, length: u32) -> Operation {
        self.capture(|doc| {
            let code = doc.get_or_insert_text(CODE);
            let mut txn = doc.transact_mut();
            let len = code.len(&txn);
            let start = start.min(len);
            let length = length.min(len - start);
            if length > 0 {
                code.remove_range(&mut txn, start, length);
            }
        })
    }

    /// Append a chat message. Text is trimmed; blank text is rejected.
    pub fn append_chat_message(&mut self, mut message: ChatMessage) -> Result<Operation, DocumentError> {
        let trimmed = message.text.trim();
        if trimmed.is_empty() {
            return Err(DocumentError::EmptyChatMessage);
        }
        message.text = trimmed.to_string();
        let value = message.to_any();
        Ok(self.capture(move |doc| {
            let chat = doc.get_or_insert_array(CHAT);
            let mut txn = doc.transact_mut();
            chat.push_back(&mut txn, value);
        }))
    }

    /// Integrate a remote operation. Merging an already-known operation is a no-op.
    pub fn merge_remote_operation(&mut self, op: &Operation) -> Result<(), DocumentError> {
        let update = decode_operation(op.as_bytes())?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::Rejected(e.to_string()))
    }

    /// Chat operations share the text path: both are document updates.
    pub fn merge_remote_chat_operation(&mut self, op: &Operation) -> Result<(), DocumentError> {
        self.merge_remote_operation(op)
    }

    /// Full state, sufficient to initialize a new replica.
    pub fn snapshot(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Replace this replica's state with a snapshot. Cold start only.
    pub fn load_snapshot(&mut self, bytes: &[u8]) -> Result<(), DocumentError> {
        check_update_v1(bytes).map_err(DocumentError::MalformedSnapshot)?;
        let update = Update::decode_v1(bytes)
            .map_err(|e| DocumentError::MalformedSnapshot(e.to_string()))?;
        let doc = new_doc();
        {
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| DocumentError::MalformedSnapshot(e.to_string()))?;
        }
        self.doc = doc;
        Ok(())
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything this replica has that a peer with `state_vector` lacks.
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        check_state_vector_v1(state_vector).map_err(DocumentError::MalformedStateVector)?;
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| DocumentError::MalformedStateVector(e.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    pub fn text(&self) -> String {
        let code = self.doc.get_or_insert_text(CODE);
        let txn = self.doc.transact();
        code.get_string(&txn)
    }

    /// Buffer length in UTF-16 units.
    pub fn len(&self) -> u32 {
        let code = self.doc.get_or_insert_text(CODE);
        let txn = self.doc.transact();
        code.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chat log in replica order. Entries that do not decode are skipped.
    pub fn chat_messages(&self) -> Vec<ChatMessage> {
        let chat = self.doc.get_or_insert_array(CHAT);
        let txn = self.doc.transact();
        chat.iter(&txn)
            .filter_map(|out| match out {
                Out::Any(any) => ChatMessage::from_any(&any),
                _ => None,
            })
            .collect()
    }
}

impl Default for ReplicatedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReplicatedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedDocument")
            .field("client_id", &self.doc.client_id())
            .field("len", &self.len())
            .finish()
    }
}
