//! AgentMem Storage - durable conversation and memory persistence
//!
//! This crate provides the persistence layer for AgentMem, using redb as the
//! embedded database and tantivy for full-text search over memory content.
//! Each entity type gets its own module holding the typed row and its
//! storage; rows are serialized as JSON.
//!
//! # Architecture
//!
//! Memory rows are authoritative and the search index is derived from them,
//! rebuildable at any time. [`Storage`] wires the per-entity storages to one
//! database and owns the operations that touch rows and index together
//! (memory append/delete, the session delete cascade). Composite keys use
//! `:` as separator, so ids handed to this crate must not contain it.
//!
//! # Tables
//!
//! - `sessions` - Conversation sessions
//! - `messages` / `message_seq` - Conversation turns, per-session id counters
//! - `agent_states` - Per-agent session snapshots
//! - `memories` / `memory_seq` - Memory rows and their id counter
//! - `memory_agent_index` / `memory_session_index` - Secondary key tables

pub mod agent_state;
pub mod error;
pub mod memory;
pub mod memory_index;
pub mod message;
pub mod session;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use redb::Database;
use tracing::warn;

pub use agent_state::{AgentState, AgentStateStorage};
pub use error::{Result, StorageError};
pub use memory::{MemoryKind, MemoryRecord, MemoryStats, MemoryStorage, NewMemory};
pub use memory_index::{IndexableMemory, MemoryHit, MemoryIndex};
pub use message::{MessageKind, MessageStorage, NewMessage, StoredMessage};
pub use session::{CascadeStats, Session, SessionOrder, SessionStorage};

/// Central storage manager that initializes all storage subsystems.
pub struct Storage {
    pub sessions: SessionStorage,
    pub messages: MessageStorage,
    pub agent_states: AgentStateStorage,
    pub memories: MemoryStorage,
    pub index: MemoryIndex,
}

impl Storage {
    /// Open the storage rooted at the given directory, creating the
    /// database file and search index if they don't exist.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)
            .with_context(|| format!("failed to create storage dir: {}", root.display()))?;

        let db = Arc::new(Database::create(root.join("agentmem.redb"))?);
        let index = MemoryIndex::open(&root.join("index"))?;

        Ok(Self {
            sessions: SessionStorage::new(db.clone())?,
            messages: MessageStorage::new(db.clone())?,
            agent_states: AgentStateStorage::new(db.clone())?,
            memories: MemoryStorage::new(db)?,
            index,
        })
    }

    /// Append a memory row, then index its content for search.
    ///
    /// The row commit is the durability point. If indexing fails, the row
    /// still stands and search misses it until [`Storage::rebuild_index`]
    /// runs; the failure is logged.
    pub fn append_memory(&self, draft: NewMemory) -> Result<MemoryRecord> {
        let record = self.memories.append(draft)?;
        if let Err(err) = self.index.index_memory(&IndexableMemory::from(&record)) {
            warn!(memory_id = record.id, error = %err, "memory stored but not indexed");
        }
        Ok(record)
    }

    /// Delete memories owned by `agent_id` from rows and index, returning
    /// the ids actually removed.
    pub fn delete_memories(&self, agent_id: &str, ids: &[u64]) -> Result<Vec<u64>> {
        let deleted = self.memories.delete(agent_id, ids)?;
        if let Err(err) = self.index.remove_many(&deleted) {
            warn!(error = %err, "deleted memory rows linger in the search index");
        }
        Ok(deleted)
    }

    /// Delete a session and all its messages, agent states, and memories.
    ///
    /// Row-side removal is one atomic transaction; index cleanup follows
    /// and any stale leftovers are harmless because search resolves hits
    /// against rows.
    pub fn delete_session(&self, session_id: &str) -> Result<Option<CascadeStats>> {
        let Some(stats) = self.sessions.delete_cascade(session_id)? else {
            return Ok(None);
        };
        if let Err(err) = self.index.remove_many(&stats.memory_ids) {
            warn!(session_id, error = %err, "cascade left stale entries in the search index");
        }
        Ok(Some(stats))
    }

    /// Regenerate the search index from the memory rows.
    pub fn rebuild_index(&self) -> Result<usize> {
        let records = self.memories.all()?;
        self.index.rebuild(records.iter().map(IndexableMemory::from))
    }
}
