//! Message storage - append-only conversation turns with per-session ids.
//!
//! Every message key embeds a zero-padded per-session id, so a prefix scan
//! over one session returns rows in insertion order. Appending a message
//! bumps the parent session's `last_active` inside the same transaction.
//!
//! # Tables
//!
//! - `messages`: "{session_id}:{id:020}" -> message row (JSON)
//! - `message_seq`: session_id -> last assigned message id

use std::sync::Arc;

use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StorageError, decode_row, encode_row};
use crate::session::{SESSION_TABLE, Session};

pub(crate) const MESSAGE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("messages");
pub(crate) const MESSAGE_SEQ_TABLE: TableDefinition<&str, u64> =
    TableDefinition::new("message_seq");

/// What a message is, on the wire between agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Task,
    Query,
    Response,
    Broadcast,
    System,
    Error,
    Status,
}

/// A persisted conversation turn.
///
/// Immutable once stored, except `importance_score` which may be filled in
/// after the fact by scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Monotonic per-session id, assigned on append starting at 1.
    pub id: u64,
    pub session_id: String,
    pub timestamp: i64,
    pub kind: MessageKind,
    pub sender: String,
    /// `None` means the message was broadcast to everyone.
    #[serde(default)]
    pub recipient: Option<String>,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub importance_score: Option<f64>,
}

/// A message to be appended; id and timestamp are assigned by storage.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: String,
    pub kind: MessageKind,
    pub sender: String,
    pub recipient: Option<String>,
    pub content: String,
    pub metadata: Map<String, Value>,
    pub importance_score: Option<f64>,
}

impl NewMessage {
    pub fn new(
        session_id: impl Into<String>,
        kind: MessageKind,
        sender: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            sender: sender.into(),
            recipient: None,
            content: content.into(),
            metadata: Map::new(),
            importance_score: None,
        }
    }

    #[must_use]
    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance_score = Some(importance);
        self
    }
}

fn message_key(session_id: &str, id: u64) -> String {
    format!("{session_id}:{id:020}")
}

/// Storage for conversation messages.
#[derive(Clone)]
pub struct MessageStorage {
    db: Arc<Database>,
}

impl MessageStorage {
    /// Create a new MessageStorage instance.
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(MESSAGE_TABLE)?;
        write_txn.open_table(MESSAGE_SEQ_TABLE)?;
        write_txn.open_table(SESSION_TABLE)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Append a message, assigning its id and timestamp.
    ///
    /// Fails with `Integrity` if the session does not exist. The id
    /// assignment, row insert, and session `last_active` bump commit
    /// together or not at all.
    pub fn append(&self, draft: NewMessage) -> Result<StoredMessage> {
        let write_txn = self.db.begin_write()?;
        let message = {
            let mut session_table = write_txn.open_table(SESSION_TABLE)?;
            let mut session: Session = match session_table.get(draft.session_id.as_str())? {
                Some(value) => decode_row(value.value(), &format!("session {}", draft.session_id))?,
                None => {
                    return Err(StorageError::Integrity(format!(
                        "session {} does not exist",
                        draft.session_id
                    )));
                }
            };

            let mut seq_table = write_txn.open_table(MESSAGE_SEQ_TABLE)?;
            let next_id = match seq_table.get(draft.session_id.as_str())? {
                Some(value) => value.value() + 1,
                None => 1,
            };
            seq_table.insert(draft.session_id.as_str(), next_id)?;

            let now = Utc::now().timestamp_millis();
            let message = StoredMessage {
                id: next_id,
                session_id: draft.session_id,
                timestamp: now,
                kind: draft.kind,
                sender: draft.sender,
                recipient: draft.recipient,
                content: draft.content,
                metadata: draft.metadata,
                importance_score: draft.importance_score,
            };

            let mut message_table = write_txn.open_table(MESSAGE_TABLE)?;
            let bytes = encode_row(&message)?;
            message_table.insert(
                message_key(&message.session_id, message.id).as_str(),
                bytes.as_slice(),
            )?;

            session.last_active = session.last_active.max(now);
            let session_bytes = encode_row(&session)?;
            session_table.insert(message.session_id.as_str(), session_bytes.as_slice())?;

            message
        };
        write_txn.commit()?;
        Ok(message)
    }

    pub fn get(&self, session_id: &str, id: u64) -> Result<Option<StoredMessage>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MESSAGE_TABLE)?;

        match table.get(message_key(session_id, id).as_str())? {
            Some(value) => Ok(Some(decode_row(
                value.value(),
                &format!("message {session_id}:{id}"),
            )?)),
            None => Ok(None),
        }
    }

    /// List a session's messages in session order (timestamp, ties by
    /// insertion order), optionally filtered by sender and paginated.
    ///
    /// An unknown session yields an empty list, not an error.
    pub fn list(
        &self,
        session_id: &str,
        sender: Option<&str>,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<StoredMessage>> {
        let mut messages = self.load_session(session_id)?;

        // Keys scan in insertion order; the stable sort leaves that as
        // the timestamp tie-breaker.
        messages.sort_by_key(|m| m.timestamp);

        let filtered = messages
            .into_iter()
            .filter(|m| sender.is_none_or(|s| m.sender == s))
            .skip(offset);

        Ok(match limit {
            Some(limit) => filtered.take(limit).collect(),
            None => filtered.collect(),
        })
    }

    /// The last `n` messages of a session, in session order.
    pub fn recent(&self, session_id: &str, n: usize) -> Result<Vec<StoredMessage>> {
        let mut messages = self.load_session(session_id)?;
        messages.sort_by_key(|m| m.timestamp);

        let start = messages.len().saturating_sub(n);
        Ok(messages.split_off(start))
    }

    pub fn count(&self, session_id: &str) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MESSAGE_TABLE)?;

        let prefix = format!("{session_id}:");
        let mut count = 0;
        for item in table.range(prefix.as_str()..)? {
            let (key, _) = item?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    fn load_session(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MESSAGE_TABLE)?;

        let prefix = format!("{session_id}:");
        let mut messages = Vec::new();
        for item in table.range(prefix.as_str()..)? {
            let (key, value) = item?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            let message = decode_row(value.value(), &format!("message {}", key.value()))?;
            messages.push(message);
        }
        Ok(messages)
    }
}
