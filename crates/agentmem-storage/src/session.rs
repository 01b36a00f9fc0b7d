//! Session storage - conversation session rows and the delete cascade.
//!
//! Sessions are the root entity: messages, agent states, and session-scoped
//! memories all hang off a session and are removed together by
//! [`SessionStorage::delete_cascade`] in a single write transaction.
//!
//! # Tables
//!
//! - `sessions`: session_id -> session row (JSON)

use std::sync::Arc;

use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::agent_state::AGENT_STATE_TABLE;
use crate::error::{Result, StorageError, decode_row, encode_row};
use crate::memory::{
    MEMORY_AGENT_INDEX, MEMORY_SESSION_INDEX, MEMORY_TABLE, MemoryRecord, memory_index_key,
};
use crate::message::{MESSAGE_SEQ_TABLE, MESSAGE_TABLE};

pub(crate) const SESSION_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// A conversation session.
///
/// `last_active` is monotonic non-decreasing: message and agent-state writes
/// bump it, and metadata merges refresh it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub created_at: i64,
    pub last_active: i64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Session {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            session_id: session_id.into(),
            created_at: now,
            last_active: now,
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Sort order for [`SessionStorage::list`], always descending (newest first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrder {
    #[default]
    LastActive,
    CreatedAt,
}

/// What a cascade removed, plus the memory ids the caller needs for
/// search-index cleanup (the text index lives outside this transaction).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeStats {
    pub messages: usize,
    pub agent_states: usize,
    pub memories: usize,
    pub memory_ids: Vec<u64>,
}

/// Storage for session rows.
#[derive(Clone)]
pub struct SessionStorage {
    db: Arc<Database>,
}

impl SessionStorage {
    /// Create a new SessionStorage instance.
    ///
    /// Opens every table the cascade touches so a standalone instance can
    /// delete sessions without the sibling storages having run first.
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(SESSION_TABLE)?;
        write_txn.open_table(MESSAGE_TABLE)?;
        write_txn.open_table(MESSAGE_SEQ_TABLE)?;
        write_txn.open_table(AGENT_STATE_TABLE)?;
        write_txn.open_table(MEMORY_TABLE)?;
        write_txn.open_table(MEMORY_AGENT_INDEX)?;
        write_txn.open_table(MEMORY_SESSION_INDEX)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Insert a new session. Fails with `Integrity` if the id is taken.
    pub fn create(&self, session: &Session) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SESSION_TABLE)?;
            let exists = table.get(session.session_id.as_str())?.is_some();
            if exists {
                return Err(StorageError::Integrity(format!(
                    "session {} already exists",
                    session.session_id
                )));
            }
            let bytes = encode_row(session)?;
            table.insert(session.session_id.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Result<Option<Session>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSION_TABLE)?;

        match table.get(session_id)? {
            Some(value) => Ok(Some(decode_row(
                value.value(),
                &format!("session {session_id}"),
            )?)),
            None => Ok(None),
        }
    }

    pub fn exists(&self, session_id: &str) -> Result<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSION_TABLE)?;
        Ok(table.get(session_id)?.is_some())
    }

    /// List sessions newest-first with pagination.
    pub fn list(&self, limit: usize, offset: usize, order: SessionOrder) -> Result<Vec<Session>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSION_TABLE)?;

        let mut sessions = Vec::new();
        for item in table.iter()? {
            let (key, value) = item?;
            let session = decode_row(value.value(), &format!("session {}", key.value()))?;
            sessions.push(session);
        }

        sessions.sort_by(|a: &Session, b: &Session| {
            let primary = match order {
                SessionOrder::LastActive => b.last_active.cmp(&a.last_active),
                SessionOrder::CreatedAt => b.created_at.cmp(&a.created_at),
            };
            primary.then_with(|| a.session_id.cmp(&b.session_id))
        });

        Ok(sessions.into_iter().skip(offset).take(limit).collect())
    }

    pub fn count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSION_TABLE)?;
        Ok(table.len()? as usize)
    }

    /// Merge keys into the session metadata and refresh `last_active`.
    ///
    /// Existing keys not named in `patch` survive; named keys are replaced.
    /// The read-modify-write runs inside one transaction, so concurrent
    /// merges cannot lose each other's keys. Returns the updated session.
    pub fn merge_metadata(
        &self,
        session_id: &str,
        patch: &Map<String, Value>,
    ) -> Result<Session> {
        let write_txn = self.db.begin_write()?;
        let session = {
            let mut table = write_txn.open_table(SESSION_TABLE)?;

            let mut session: Session = match table.get(session_id)? {
                Some(value) => decode_row(value.value(), &format!("session {session_id}"))?,
                None => return Err(StorageError::NotFound(format!("session {session_id}"))),
            };

            for (key, value) in patch {
                session.metadata.insert(key.clone(), value.clone());
            }
            let now = Utc::now().timestamp_millis();
            session.last_active = session.last_active.max(now);

            let bytes = encode_row(&session)?;
            table.insert(session_id, bytes.as_slice())?;
            session
        };
        write_txn.commit()?;
        Ok(session)
    }

    /// Delete a session and everything that references it, atomically.
    ///
    /// Returns `None` when the session does not exist (nothing removed).
    /// Search-index cleanup for the returned `memory_ids` is the caller's
    /// job; the index is rebuildable, so a crash between this commit and
    /// that cleanup leaves only harmless stale entries.
    pub fn delete_cascade(&self, session_id: &str) -> Result<Option<CascadeStats>> {
        let write_txn = self.db.begin_write()?;
        let stats = {
            let mut session_table = write_txn.open_table(SESSION_TABLE)?;
            if session_table.remove(session_id)?.is_none() {
                return Ok(None);
            }

            let prefix = format!("{session_id}:");
            let mut stats = CascadeStats::default();

            // Messages, plus the per-session id counter
            let mut message_table = write_txn.open_table(MESSAGE_TABLE)?;
            let message_keys: Vec<String> = collect_prefixed_keys(&message_table, &prefix)?;
            for key in &message_keys {
                message_table.remove(key.as_str())?;
            }
            stats.messages = message_keys.len();

            let mut seq_table = write_txn.open_table(MESSAGE_SEQ_TABLE)?;
            seq_table.remove(session_id)?;

            // Agent states
            let mut state_table = write_txn.open_table(AGENT_STATE_TABLE)?;
            let state_keys: Vec<String> = collect_prefixed_keys(&state_table, &prefix)?;
            for key in &state_keys {
                state_table.remove(key.as_str())?;
            }
            stats.agent_states = state_keys.len();

            // Session-scoped memories and both of their index entries
            let mut session_index = write_txn.open_table(MEMORY_SESSION_INDEX)?;
            let mut memory_table = write_txn.open_table(MEMORY_TABLE)?;
            let mut agent_index = write_txn.open_table(MEMORY_AGENT_INDEX)?;

            let index_entries: Vec<(String, u64)> = {
                let mut entries = Vec::new();
                for item in session_index.range(prefix.as_str()..)? {
                    let (key, value) = item?;
                    let key_str = key.value();
                    if !key_str.starts_with(&prefix) {
                        break;
                    }
                    entries.push((key_str.to_string(), value.value()));
                }
                entries
            };

            for (index_key, memory_id) in &index_entries {
                session_index.remove(index_key.as_str())?;
                if let Some(bytes) = memory_table.remove(*memory_id)? {
                    let record: MemoryRecord =
                        decode_row(bytes.value(), &format!("memory {memory_id}"))?;
                    agent_index
                        .remove(memory_index_key(&record.agent_id, *memory_id).as_str())?;
                }
                stats.memory_ids.push(*memory_id);
            }
            stats.memories = stats.memory_ids.len();

            stats
        };
        write_txn.commit()?;

        debug!(
            session_id,
            messages = stats.messages,
            agent_states = stats.agent_states,
            memories = stats.memories,
            "session deleted"
        );
        Ok(Some(stats))
    }
}

/// Collect all keys starting with `prefix` from a string-keyed table.
fn collect_prefixed_keys<T>(table: &T, prefix: &str) -> Result<Vec<String>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut keys = Vec::new();
    for item in table.range(prefix..)? {
        let (key, _) = item?;
        let key_str = key.value();
        if !key_str.starts_with(prefix) {
            break;
        }
        keys.push(key_str.to_string());
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    /// Returns both the storage and the TempDir to ensure the directory
    /// is not deleted while the database is in use.
    fn test_storage() -> (SessionStorage, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db = Arc::new(Database::create(dir.path().join("test.redb")).unwrap());
        (SessionStorage::new(db).unwrap(), dir)
    }

    fn metadata(pairs: &[(&str, &str)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    #[test]
    fn test_create_and_get_roundtrip() {
        let (storage, _dir) = test_storage();

        let session = Session::new("s1").with_metadata(metadata(&[("user", "alice")]));
        storage.create(&session).unwrap();

        let loaded = storage.get("s1").unwrap().unwrap();
        assert_eq!(loaded.session_id, "s1");
        assert_eq!(loaded.created_at, session.created_at);
        assert_eq!(loaded.metadata, metadata(&[("user", "alice")]));
    }

    #[test]
    fn test_get_nonexistent_session() {
        let (storage, _dir) = test_storage();
        assert!(storage.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_create_duplicate_fails() {
        let (storage, _dir) = test_storage();

        storage.create(&Session::new("s1")).unwrap();
        let err = storage.create(&Session::new("s1")).unwrap_err();
        assert!(matches!(err, StorageError::Integrity(_)));

        // The original row is untouched
        assert!(storage.get("s1").unwrap().is_some());
    }

    #[test]
    fn test_merge_metadata_keeps_existing_keys() {
        let (storage, _dir) = test_storage();

        let session = Session::new("s1").with_metadata(metadata(&[("a", "1")]));
        storage.create(&session).unwrap();

        storage.merge_metadata("s1", &metadata(&[("b", "2")])).unwrap();
        let merged = storage.merge_metadata("s1", &metadata(&[("a", "updated")])).unwrap();

        assert_eq!(merged.metadata.get("a").unwrap(), "updated");
        assert_eq!(merged.metadata.get("b").unwrap(), "2");
        assert!(merged.last_active >= session.last_active);
    }

    #[test]
    fn test_merge_metadata_missing_session() {
        let (storage, _dir) = test_storage();
        let err = storage.merge_metadata("ghost", &Map::new()).unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn test_list_orders_and_paginates() {
        let (storage, _dir) = test_storage();

        for i in 0..5 {
            let mut session = Session::new(format!("s{i}"));
            // Spread the timestamps so ordering is unambiguous
            session.created_at = 1_000 + i;
            session.last_active = 2_000 - i;
            storage.create(&session).unwrap();
        }

        let by_active = storage.list(10, 0, SessionOrder::LastActive).unwrap();
        assert_eq!(by_active[0].session_id, "s0");
        assert_eq!(by_active[4].session_id, "s4");

        let by_created = storage.list(10, 0, SessionOrder::CreatedAt).unwrap();
        assert_eq!(by_created[0].session_id, "s4");

        let page = storage.list(2, 1, SessionOrder::LastActive).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].session_id, "s1");
        assert_eq!(page[1].session_id, "s2");
    }

    #[test]
    fn test_count_sessions() {
        let (storage, _dir) = test_storage();
        assert_eq!(storage.count().unwrap(), 0);

        storage.create(&Session::new("s1")).unwrap();
        storage.create(&Session::new("s2")).unwrap();
        assert_eq!(storage.count().unwrap(), 2);
    }

    #[test]
    fn test_delete_cascade_empty_session() {
        let (storage, _dir) = test_storage();

        storage.create(&Session::new("s1")).unwrap();
        let stats = storage.delete_cascade("s1").unwrap().unwrap();
        assert_eq!(stats, CascadeStats::default());
        assert!(storage.get("s1").unwrap().is_none());
    }

    #[test]
    fn test_delete_cascade_missing_session() {
        let (storage, _dir) = test_storage();
        assert!(storage.delete_cascade("ghost").unwrap().is_none());
    }
}
