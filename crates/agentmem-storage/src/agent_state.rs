//! Agent state storage - one full snapshot per (agent, session).
//!
//! State blobs are opaque to storage: saves always overwrite the whole
//! row, never merge, so the stored value is exactly what some agent last
//! wrote. Keys lead with the session id so the delete cascade can sweep
//! a session's states with one prefix scan.
//!
//! # Tables
//!
//! - `agent_states`: "{session_id}:{agent_id}" -> state row (JSON)

use std::sync::Arc;

use chrono::Utc;
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, StorageError, decode_row, encode_row};
use crate::session::{SESSION_TABLE, Session};

pub(crate) const AGENT_STATE_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("agent_states");

/// A persisted agent snapshot. `state` is owned by the writing agent and
/// never interpreted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub session_id: String,
    pub state: Value,
    pub updated_at: i64,
}

fn state_key(session_id: &str, agent_id: &str) -> String {
    format!("{session_id}:{agent_id}")
}

/// Storage for per-agent session state.
#[derive(Clone)]
pub struct AgentStateStorage {
    db: Arc<Database>,
}

impl AgentStateStorage {
    /// Create a new AgentStateStorage instance.
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        write_txn.open_table(AGENT_STATE_TABLE)?;
        write_txn.open_table(SESSION_TABLE)?;
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Overwrite the snapshot for (agent, session) and bump the session's
    /// `last_active`, in one transaction.
    ///
    /// Fails with `Integrity` if the session does not exist. Concurrent
    /// saves serialize on the write transaction, so the surviving row is
    /// always one caller's complete snapshot.
    pub fn save(&self, agent_id: &str, session_id: &str, state: Value) -> Result<AgentState> {
        let write_txn = self.db.begin_write()?;
        let row = {
            let mut session_table = write_txn.open_table(SESSION_TABLE)?;
            let mut session: Session = match session_table.get(session_id)? {
                Some(value) => decode_row(value.value(), &format!("session {session_id}"))?,
                None => {
                    return Err(StorageError::Integrity(format!(
                        "session {session_id} does not exist"
                    )));
                }
            };

            let now = Utc::now().timestamp_millis();
            let row = AgentState {
                agent_id: agent_id.to_string(),
                session_id: session_id.to_string(),
                state,
                updated_at: now,
            };

            let mut table = write_txn.open_table(AGENT_STATE_TABLE)?;
            let bytes = encode_row(&row)?;
            table.insert(state_key(session_id, agent_id).as_str(), bytes.as_slice())?;

            session.last_active = session.last_active.max(now);
            let session_bytes = encode_row(&session)?;
            session_table.insert(session_id, session_bytes.as_slice())?;

            row
        };
        write_txn.commit()?;
        Ok(row)
    }

    pub fn load(&self, agent_id: &str, session_id: &str) -> Result<Option<AgentState>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(AGENT_STATE_TABLE)?;

        match table.get(state_key(session_id, agent_id).as_str())? {
            Some(value) => Ok(Some(decode_row(
                value.value(),
                &format!("agent state {session_id}:{agent_id}"),
            )?)),
            None => Ok(None),
        }
    }
}
