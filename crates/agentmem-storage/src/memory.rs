//! Memory storage - durable facts and episodes derived from conversations.
//!
//! Rows are the source of truth; the text-search index over memory content
//! lives in [`crate::memory_index`] and is rebuildable from these rows.
//! Two secondary key tables let reads scan by agent and let the session
//! cascade scan by session without touching unrelated rows.
//!
//! # Tables
//!
//! - `memories`: memory id -> memory row (JSON)
//! - `memory_seq`: "next" -> last assigned memory id
//! - `memory_agent_index`: "{agent_id}:{id:020}" -> memory id
//! - `memory_session_index`: "{session_id}:{id:020}" -> memory id

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StorageError, decode_row, encode_row};
use crate::session::SESSION_TABLE;

pub(crate) const MEMORY_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("memories");
const MEMORY_SEQ_TABLE: TableDefinition<&str, u64> = TableDefinition::new("memory_seq");
pub(crate) const MEMORY_AGENT_INDEX: TableDefinition<&str, u64> =
    TableDefinition::new("memory_agent_index");
pub(crate) const MEMORY_SESSION_INDEX: TableDefinition<&str, u64> =
    TableDefinition::new("memory_session_index");

const SEQ_KEY: &str = "next";

/// How a memory was formed, which drives retrieval defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    /// Short-lived scratch state for an in-progress task.
    Working,
    /// Something that happened in a conversation.
    Episodic,
    /// A durable fact, independent of any one conversation.
    Semantic,
}

/// A persisted memory row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: u64,
    pub agent_id: String,
    /// `None` means the memory is agent-global rather than session-scoped.
    #[serde(default)]
    pub session_id: Option<String>,
    pub kind: MemoryKind,
    pub content: String,
    pub importance: f64,
    pub access_count: u64,
    pub created_at: i64,
    #[serde(default)]
    pub last_accessed_at: Option<i64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A memory to be appended; id and timestamps are assigned by storage.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub agent_id: String,
    pub session_id: Option<String>,
    pub kind: MemoryKind,
    pub content: String,
    pub importance: f64,
    pub metadata: Map<String, Value>,
}

impl NewMemory {
    pub fn new(agent_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            session_id: None,
            kind: MemoryKind::Episodic,
            content: content.into(),
            importance: 0.5,
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: MemoryKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_importance(mut self, importance: f64) -> Self {
        self.importance = importance;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Totals for [`MemoryStorage::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub total: usize,
    pub working: usize,
    pub episodic: usize,
    pub semantic: usize,
    pub total_content_bytes: usize,
}

pub(crate) fn memory_index_key(owner: &str, id: u64) -> String {
    format!("{owner}:{id:020}")
}

/// Storage for memory rows and their secondary key tables.
#[derive(Clone)]
pub struct MemoryStorage {
    db: Arc<Database>,
}

impl MemoryStorage {
    /// Create a new MemoryStorage instance.
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(MEMORY_TABLE)?;
        write_txn.open_table(MEMORY_SEQ_TABLE)?;
        write_txn.open_table(MEMORY_AGENT_INDEX)?;
        write_txn.open_table(MEMORY_SESSION_INDEX)?;
        write_txn.open_table(SESSION_TABLE)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Append a memory, assigning its id. Ids are never reused, even after
    /// deletes.
    ///
    /// A session-scoped memory fails with `Integrity` if its session does
    /// not exist; agent-global memories need no parent. Memory writes do
    /// not bump session `last_active`.
    pub fn append(&self, draft: NewMemory) -> Result<MemoryRecord> {
        let write_txn = self.db.begin_write()?;
        let record = {
            if let Some(session_id) = &draft.session_id {
                let session_table = write_txn.open_table(SESSION_TABLE)?;
                let exists = session_table.get(session_id.as_str())?.is_some();
                if !exists {
                    return Err(StorageError::Integrity(format!(
                        "session {session_id} does not exist"
                    )));
                }
            }

            let mut seq_table = write_txn.open_table(MEMORY_SEQ_TABLE)?;
            let id = match seq_table.get(SEQ_KEY)? {
                Some(value) => value.value() + 1,
                None => 1,
            };
            seq_table.insert(SEQ_KEY, id)?;

            let record = MemoryRecord {
                id,
                agent_id: draft.agent_id,
                session_id: draft.session_id,
                kind: draft.kind,
                content: draft.content,
                importance: draft.importance,
                access_count: 0,
                created_at: Utc::now().timestamp_millis(),
                last_accessed_at: None,
                metadata: draft.metadata,
            };

            let mut table = write_txn.open_table(MEMORY_TABLE)?;
            let bytes = encode_row(&record)?;
            table.insert(id, bytes.as_slice())?;

            let mut agent_index = write_txn.open_table(MEMORY_AGENT_INDEX)?;
            agent_index.insert(memory_index_key(&record.agent_id, id).as_str(), id)?;

            if let Some(session_id) = &record.session_id {
                let mut session_index = write_txn.open_table(MEMORY_SESSION_INDEX)?;
                session_index.insert(memory_index_key(session_id, id).as_str(), id)?;
            }

            record
        };
        write_txn.commit()?;
        Ok(record)
    }

    pub fn get(&self, id: u64) -> Result<Option<MemoryRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MEMORY_TABLE)?;

        match table.get(id)? {
            Some(value) => Ok(Some(decode_row(value.value(), &format!("memory {id}"))?)),
            None => Ok(None),
        }
    }

    /// Fetch rows for the given ids, silently skipping ids with no row.
    ///
    /// Search hits may reference rows deleted after the index was last
    /// written, so missing ids are normal here.
    pub fn get_many(&self, ids: &[u64]) -> Result<Vec<MemoryRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MEMORY_TABLE)?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(value) = table.get(*id)? {
                records.push(decode_row(value.value(), &format!("memory {id}"))?);
            }
        }
        Ok(records)
    }

    /// List an agent's memories, most important first (ties newest-first),
    /// optionally filtered by kind and session.
    pub fn list(
        &self,
        agent_id: &str,
        kind: Option<MemoryKind>,
        session_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<MemoryRecord>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(MEMORY_AGENT_INDEX)?;
        let table = read_txn.open_table(MEMORY_TABLE)?;

        let prefix = format!("{agent_id}:");
        let mut records = Vec::new();
        for item in index.range(prefix.as_str()..)? {
            let (key, value) = item?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            let id = value.value();
            let Some(bytes) = table.get(id)? else {
                continue;
            };
            let record: MemoryRecord = decode_row(bytes.value(), &format!("memory {id}"))?;
            if kind.is_none_or(|k| record.kind == k)
                && session_id.is_none_or(|s| record.session_id.as_deref() == Some(s))
            {
                records.push(record);
            }
        }

        records.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(Ordering::Equal)
                .then(b.created_at.cmp(&a.created_at))
        });

        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    /// Record a retrieval hit: bump `access_count` and stamp
    /// `last_accessed_at`, returning the updated row.
    ///
    /// The read-modify-write runs inside one transaction, so concurrent
    /// hits each count.
    pub fn touch_access(&self, id: u64) -> Result<MemoryRecord> {
        let write_txn = self.db.begin_write()?;
        let record = {
            let mut table = write_txn.open_table(MEMORY_TABLE)?;

            let mut record: MemoryRecord = match table.get(id)? {
                Some(value) => decode_row(value.value(), &format!("memory {id}"))?,
                None => return Err(StorageError::NotFound(format!("memory {id}"))),
            };

            record.access_count += 1;
            record.last_accessed_at = Some(Utc::now().timestamp_millis());

            let bytes = encode_row(&record)?;
            table.insert(id, bytes.as_slice())?;
            record
        };
        write_txn.commit()?;
        Ok(record)
    }

    /// Delete the given memories if they belong to `agent_id`, returning
    /// the ids actually removed. Unknown and foreign ids are skipped.
    ///
    /// The caller is responsible for removing the returned ids from the
    /// text-search index.
    pub fn delete(&self, agent_id: &str, ids: &[u64]) -> Result<Vec<u64>> {
        let write_txn = self.db.begin_write()?;
        let deleted = {
            let mut table = write_txn.open_table(MEMORY_TABLE)?;
            let mut agent_index = write_txn.open_table(MEMORY_AGENT_INDEX)?;
            let mut session_index = write_txn.open_table(MEMORY_SESSION_INDEX)?;

            let mut deleted = Vec::new();
            for id in ids {
                let owned = match table.get(*id)? {
                    Some(value) => {
                        let record: MemoryRecord =
                            decode_row(value.value(), &format!("memory {id}"))?;
                        (record.agent_id == agent_id).then_some(record)
                    }
                    None => None,
                };
                let Some(record) = owned else {
                    continue;
                };

                table.remove(*id)?;
                agent_index.remove(memory_index_key(&record.agent_id, *id).as_str())?;
                if let Some(session_id) = &record.session_id {
                    session_index.remove(memory_index_key(session_id, *id).as_str())?;
                }
                deleted.push(*id);
            }
            deleted
        };
        write_txn.commit()?;
        Ok(deleted)
    }

    /// Every memory row, for rebuilding the text-search index.
    pub fn all(&self) -> Result<Vec<MemoryRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MEMORY_TABLE)?;

        let mut records = Vec::with_capacity(table.len()? as usize);
        for item in table.iter()? {
            let (key, value) = item?;
            records.push(decode_row(value.value(), &format!("memory {}", key.value()))?);
        }
        Ok(records)
    }

    pub fn stats(&self) -> Result<MemoryStats> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MEMORY_TABLE)?;

        let mut stats = MemoryStats::default();
        for item in table.iter()? {
            let (key, value) = item?;
            let record: MemoryRecord =
                decode_row(value.value(), &format!("memory {}", key.value()))?;
            stats.total += 1;
            match record.kind {
                MemoryKind::Working => stats.working += 1,
                MemoryKind::Episodic => stats.episodic += 1,
                MemoryKind::Semantic => stats.semantic += 1,
            }
            stats.total_content_bytes += record.content.len();
        }
        Ok(stats)
    }
}
