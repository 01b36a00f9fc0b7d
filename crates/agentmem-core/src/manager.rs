//! Async facade over the blocking storage layer.
//!
//! The manager is where policy lives: ids are validated before they can
//! reach a composite key, memory importance is range-checked fail-closed,
//! and every storage call runs on the blocking pool so async callers
//! never stall a runtime worker.

use std::path::Path;
use std::sync::Arc;

use agentmem_storage::{
    AgentState, MemoryKind, MemoryRecord, MemoryStats, NewMemory, NewMessage, Session,
    SessionOrder, Storage, StorageError, StoredMessage,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::error::{MemoryError, Result};
use crate::importance::ImportanceScorer;
use crate::query::{QueryEngine, SearchOptions};
use crate::retriever::MemoryRetriever;

/// Compact overview of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: i64,
    pub last_active: i64,
    pub message_count: usize,
    pub metadata: Map<String, Value>,
}

/// Async entry point for everything the memory subsystem does. Cheap to
/// clone; all clones share one [`Storage`].
#[derive(Clone)]
pub struct MemoryManager {
    storage: Arc<Storage>,
    scorer: ImportanceScorer,
}

impl MemoryManager {
    /// Open (or create) the store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Arc::new(Storage::open(root)?)))
    }

    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            scorer: ImportanceScorer::new(),
        }
    }

    #[must_use]
    pub fn with_scorer(mut self, scorer: ImportanceScorer) -> Self {
        self.scorer = scorer;
        self
    }

    /// Direct handle to the blocking layer.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Search handle sharing this manager's storage.
    pub fn query_engine(&self) -> QueryEngine {
        QueryEngine::new(self.storage.clone())
    }

    /// Recall handle sharing this manager's storage.
    pub fn retriever(&self) -> MemoryRetriever {
        MemoryRetriever::new(self.query_engine())
    }

    async fn run_blocking<T, F>(&self, task: F) -> Result<T>
    where
        F: FnOnce(Arc<Storage>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.storage.clone();
        tokio::task::spawn_blocking(move || task(storage)).await?
    }

    // Session lifecycle

    /// Create a session and return its id. Without an explicit id a UUID
    /// is generated; a collision on a generated id is retried, while an
    /// explicitly supplied duplicate surfaces as an integrity error.
    pub async fn create_session(
        &self,
        session_id: Option<String>,
        metadata: Map<String, Value>,
    ) -> Result<String> {
        if let Some(id) = &session_id {
            validate_id("session id", id)?;
        }

        self.run_blocking(move |storage| {
            if let Some(id) = session_id {
                let session = Session::new(id.clone()).with_metadata(metadata);
                storage.sessions.create(&session)?;
                return Ok(id);
            }

            loop {
                let id = Uuid::new_v4().to_string();
                let session = Session::new(id.clone()).with_metadata(metadata.clone());
                match storage.sessions.create(&session) {
                    Ok(()) => return Ok(id),
                    Err(StorageError::Integrity(_)) => continue,
                    Err(err) => return Err(err.into()),
                }
            }
        })
        .await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let session_id = session_id.to_string();
        self.run_blocking(move |storage| Ok(storage.sessions.get(&session_id)?))
            .await
    }

    pub async fn list_sessions(
        &self,
        limit: usize,
        offset: usize,
        order: SessionOrder,
    ) -> Result<Vec<Session>> {
        self.run_blocking(move |storage| Ok(storage.sessions.list(limit, offset, order)?))
            .await
    }

    /// Merge `patch` into the session's metadata. Keys absent from the
    /// patch survive. Returns the updated session.
    pub async fn update_session_metadata(
        &self,
        session_id: &str,
        patch: Map<String, Value>,
    ) -> Result<Session> {
        let session_id = session_id.to_string();
        self.run_blocking(move |storage| {
            Ok(storage.sessions.merge_metadata(&session_id, &patch)?)
        })
        .await
    }

    /// Remove a session and everything hanging off it. Returns whether a
    /// session was actually there.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let session_id = session_id.to_string();
        self.run_blocking(move |storage| Ok(storage.delete_session(&session_id)?.is_some()))
            .await
    }

    /// Session fields plus the message count, or `None` when the session
    /// does not exist.
    pub async fn get_session_summary(&self, session_id: &str) -> Result<Option<SessionSummary>> {
        let session_id = session_id.to_string();
        self.run_blocking(move |storage| {
            let Some(session) = storage.sessions.get(&session_id)? else {
                return Ok(None);
            };
            let message_count = storage.messages.count(&session_id)?;
            Ok(Some(SessionSummary {
                session_id: session.session_id,
                created_at: session.created_at,
                last_active: session.last_active,
                message_count,
                metadata: session.metadata,
            }))
        })
        .await
    }

    // Messages

    /// Persist one message. The session must exist; a missing importance
    /// gets a scorer default so later pruning has something to rank by.
    /// Returns the stored row with its assigned id and timestamp.
    pub async fn store_message(&self, draft: NewMessage) -> Result<StoredMessage> {
        validate_id("session id", &draft.session_id)?;
        if draft.sender.is_empty() {
            return Err(MemoryError::Validation("sender must not be empty".into()));
        }

        let scorer = self.scorer;
        self.run_blocking(move |storage| {
            let draft = if draft.importance_score.is_none() {
                let now = Utc::now().timestamp_millis();
                let provisional = StoredMessage {
                    id: 0,
                    session_id: draft.session_id.clone(),
                    timestamp: now,
                    kind: draft.kind,
                    sender: draft.sender.clone(),
                    recipient: draft.recipient.clone(),
                    content: draft.content.clone(),
                    metadata: draft.metadata.clone(),
                    importance_score: None,
                };
                let score = scorer.score(&provisional, false, now);
                draft.with_importance(score)
            } else {
                draft
            };
            Ok(storage.messages.append(draft)?)
        })
        .await
    }

    /// Messages in chronological order. An unknown session yields an
    /// empty list, not an error.
    pub async fn get_messages(
        &self,
        session_id: &str,
        sender: Option<&str>,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<Vec<StoredMessage>> {
        let session_id = session_id.to_string();
        let sender = sender.map(str::to_string);
        self.run_blocking(move |storage| {
            Ok(storage
                .messages
                .list(&session_id, sender.as_deref(), limit, offset)?)
        })
        .await
    }

    /// The newest `n` messages, oldest first.
    pub async fn get_recent_messages(
        &self,
        session_id: &str,
        n: usize,
    ) -> Result<Vec<StoredMessage>> {
        let session_id = session_id.to_string();
        self.run_blocking(move |storage| Ok(storage.messages.recent(&session_id, n)?))
            .await
    }

    pub async fn get_message_count(&self, session_id: &str) -> Result<usize> {
        let session_id = session_id.to_string();
        self.run_blocking(move |storage| Ok(storage.messages.count(&session_id)?))
            .await
    }

    // Agent state

    /// Replace an agent's per-session state snapshot wholesale.
    pub async fn save_agent_state(
        &self,
        agent_id: &str,
        session_id: &str,
        state: Value,
    ) -> Result<AgentState> {
        validate_id("agent id", agent_id)?;
        validate_id("session id", session_id)?;

        let agent_id = agent_id.to_string();
        let session_id = session_id.to_string();
        self.run_blocking(move |storage| {
            Ok(storage.agent_states.save(&agent_id, &session_id, state)?)
        })
        .await
    }

    pub async fn load_agent_state(
        &self,
        agent_id: &str,
        session_id: &str,
    ) -> Result<Option<AgentState>> {
        let agent_id = agent_id.to_string();
        let session_id = session_id.to_string();
        self.run_blocking(move |storage| Ok(storage.agent_states.load(&agent_id, &session_id)?))
            .await
    }

    // Memories

    /// Persist one memory, fail-closed: a rejected write leaves no row
    /// behind. Session-scoped memories require the session to exist.
    pub async fn store_memory(&self, draft: NewMemory) -> Result<MemoryRecord> {
        validate_id("agent id", &draft.agent_id)?;
        if let Some(session_id) = &draft.session_id {
            validate_id("session id", session_id)?;
        }
        if draft.content.trim().is_empty() {
            return Err(MemoryError::Validation(
                "memory content must not be empty".into(),
            ));
        }
        if !(0.0..=1.0).contains(&draft.importance) {
            return Err(MemoryError::Validation(format!(
                "importance must be within 0.0..=1.0, got {}",
                draft.importance
            )));
        }

        self.run_blocking(move |storage| Ok(storage.append_memory(draft)?))
            .await
    }

    /// Search the agent's memories, then bump access tracking per hit.
    /// A failed bump never fails the read; the stale row is returned
    /// instead.
    pub async fn retrieve_memories(
        &self,
        agent_id: &str,
        query: &str,
        kind: Option<MemoryKind>,
        session_id: Option<&str>,
        limit: usize,
        min_importance: f64,
    ) -> Result<Vec<MemoryRecord>> {
        let agent_id = agent_id.to_string();
        let query = query.to_string();
        let session_id = session_id.map(str::to_string);

        self.run_blocking(move |storage| {
            let mut options = SearchOptions::default()
                .with_min_importance(min_importance)
                .with_limit(limit);
            if let Some(kind) = kind {
                options = options.with_kind(kind);
            }
            if let Some(session_id) = session_id {
                options = options.with_session(session_id);
            }

            let engine = QueryEngine::new(storage.clone());
            let hits = engine.search(&agent_id, &query, &options)?;
            let memories = hits
                .into_iter()
                .map(|record| match storage.memories.touch_access(record.id) {
                    Ok(updated) => updated,
                    Err(err) => {
                        warn!("access bump for memory {} failed: {err}", record.id);
                        record
                    }
                })
                .collect();
            Ok(memories)
        })
        .await
    }

    pub async fn list_memories(
        &self,
        agent_id: &str,
        kind: Option<MemoryKind>,
        session_id: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<MemoryRecord>> {
        let agent_id = agent_id.to_string();
        let session_id = session_id.map(str::to_string);
        self.run_blocking(move |storage| {
            Ok(storage
                .memories
                .list(&agent_id, kind, session_id.as_deref(), limit)?)
        })
        .await
    }

    /// Delete the given memories, ignoring ids the agent does not own.
    /// Returns the ids actually removed.
    pub async fn delete_memories(&self, agent_id: &str, ids: Vec<u64>) -> Result<Vec<u64>> {
        let agent_id = agent_id.to_string();
        self.run_blocking(move |storage| Ok(storage.delete_memories(&agent_id, &ids)?))
            .await
    }

    pub async fn memory_stats(&self) -> Result<MemoryStats> {
        self.run_blocking(move |storage| Ok(storage.memories.stats()?))
            .await
    }

    /// Rebuild the search index from the rows. Returns how many memories
    /// were reindexed.
    pub async fn rebuild_search_index(&self) -> Result<usize> {
        self.run_blocking(move |storage| Ok(storage.rebuild_index()?))
            .await
    }
}

/// Ids embed in composite storage keys, where ':' is the separator.
fn validate_id(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(MemoryError::Validation(format!("{what} must not be empty")));
    }
    if value.contains(':') {
        return Err(MemoryError::Validation(format!(
            "{what} must not contain ':'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmem_storage::MessageKind;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_manager() -> (MemoryManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let manager = MemoryManager::open(dir.path()).unwrap();
        (manager, dir)
        // TempDir kept alive for the duration of the test
    }

    #[tokio::test]
    async fn test_create_session_generates_uuid() {
        let (manager, _dir) = test_manager();

        let id = manager.create_session(None, Map::new()).await.unwrap();
        assert_eq!(id.len(), 36);

        let session = manager.get_session(&id).await.unwrap().unwrap();
        assert_eq!(session.session_id, id);
        assert!(session.created_at > 0);
    }

    #[tokio::test]
    async fn test_create_session_explicit_id_and_duplicate() {
        let (manager, _dir) = test_manager();

        let id = manager
            .create_session(Some("team-planning".to_string()), Map::new())
            .await
            .unwrap();
        assert_eq!(id, "team-planning");

        let err = manager
            .create_session(Some("team-planning".to_string()), Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Integrity(_)));
    }

    #[tokio::test]
    async fn test_create_session_rejects_invalid_ids() {
        let (manager, _dir) = test_manager();

        let err = manager
            .create_session(Some(String::new()), Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));

        let err = manager
            .create_session(Some("a:b".to_string()), Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    #[tokio::test]
    async fn test_store_message_assigns_ids_and_default_importance() {
        let (manager, _dir) = test_manager();
        let session_id = manager.create_session(None, Map::new()).await.unwrap();

        let first = manager
            .store_message(NewMessage::new(
                &session_id,
                MessageKind::Query,
                "user",
                "what is the rollout plan for tomorrow?",
            ))
            .await
            .unwrap();
        assert_eq!(first.id, 1);
        let importance = first.importance_score.unwrap();
        assert!(importance > 0.0 && importance <= 1.0);

        let second = manager
            .store_message(
                NewMessage::new(
                    &session_id,
                    MessageKind::Response,
                    "planner",
                    "canary first, then full fleet",
                )
                .with_importance(0.9),
            )
            .await
            .unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(second.importance_score, Some(0.9));
    }

    #[tokio::test]
    async fn test_store_message_rejections() {
        let (manager, _dir) = test_manager();

        let err = manager
            .store_message(NewMessage::new(
                "missing-session",
                MessageKind::Task,
                "user",
                "hello",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Integrity(_)));

        let session_id = manager.create_session(None, Map::new()).await.unwrap();
        let err = manager
            .store_message(NewMessage::new(
                &session_id,
                MessageKind::Task,
                "",
                "hello",
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
    }

    #[tokio::test]
    async fn test_get_messages_unknown_session_is_empty() {
        let (manager, _dir) = test_manager();
        let messages = manager
            .get_messages("never-created", None, None, 0)
            .await
            .unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_agent_state_overwrites() {
        let (manager, _dir) = test_manager();
        let session_id = manager.create_session(None, Map::new()).await.unwrap();

        manager
            .save_agent_state("worker", &session_id, json!({"step": 1, "phase": "plan"}))
            .await
            .unwrap();
        manager
            .save_agent_state("worker", &session_id, json!({"step": 2}))
            .await
            .unwrap();

        let state = manager
            .load_agent_state("worker", &session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.state, json!({"step": 2}));
    }

    #[tokio::test]
    async fn test_concurrent_state_saves_single_winner() {
        let (manager, _dir) = test_manager();
        let session_id = manager.create_session(None, Map::new()).await.unwrap();

        let mut handles = Vec::new();
        for round in 0..8i64 {
            let manager = manager.clone();
            let session_id = session_id.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .save_agent_state("worker", &session_id, json!({ "round": round }))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // Every save is a complete snapshot, so the survivor is exactly
        // one of the written values
        let state = manager
            .load_agent_state("worker", &session_id)
            .await
            .unwrap()
            .unwrap();
        let round = state.state["round"].as_i64().unwrap();
        assert!((0..8).contains(&round));
    }

    #[tokio::test]
    async fn test_store_memory_fails_closed() {
        let (manager, _dir) = test_manager();

        let err = manager
            .store_memory(NewMemory::new("researcher", "a fact").with_importance(1.5))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));

        let err = manager
            .store_memory(NewMemory::new("researcher", "a fact").with_importance(-0.1))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));

        let err = manager
            .store_memory(NewMemory::new("researcher", "   "))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));

        let stats = manager.memory_stats().await.unwrap();
        assert_eq!(stats.total, 0);
    }

    #[tokio::test]
    async fn test_retrieve_memories_bumps_access() {
        let (manager, _dir) = test_manager();

        let stored = manager
            .store_memory(
                NewMemory::new("researcher", "the capital of france is paris")
                    .with_kind(MemoryKind::Semantic)
                    .with_importance(0.9),
            )
            .await
            .unwrap();
        assert_eq!(stored.access_count, 0);
        assert!(stored.last_accessed_at.is_none());

        let hits = manager
            .retrieve_memories(
                "researcher",
                "capital of france",
                Some(MemoryKind::Semantic),
                None,
                10,
                0.0,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].access_count, 1);
        assert!(hits[0].last_accessed_at.is_some());

        // The stored row agrees with what the read returned
        let row = manager
            .storage()
            .memories
            .get(stored.id)
            .unwrap()
            .unwrap();
        assert_eq!(row.access_count, 1);
    }

    #[tokio::test]
    async fn test_delete_session_cascades() {
        let (manager, _dir) = test_manager();
        let session_id = manager.create_session(None, Map::new()).await.unwrap();

        manager
            .store_message(NewMessage::new(
                &session_id,
                MessageKind::Task,
                "user",
                "collect the quarterly numbers",
            ))
            .await
            .unwrap();
        manager
            .save_agent_state("worker", &session_id, json!({"progress": "half"}))
            .await
            .unwrap();
        let scoped = manager
            .store_memory(
                NewMemory::new("worker", "numbers live in the finance share")
                    .with_session(session_id.clone()),
            )
            .await
            .unwrap();
        let global = manager
            .store_memory(NewMemory::new("worker", "quarter ends in march"))
            .await
            .unwrap();

        assert!(manager.delete_session(&session_id).await.unwrap());

        assert!(manager.get_session(&session_id).await.unwrap().is_none());
        assert!(
            manager
                .get_messages(&session_id, None, None, 0)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(
            manager
                .load_agent_state("worker", &session_id)
                .await
                .unwrap()
                .is_none()
        );
        assert!(manager.storage().memories.get(scoped.id).unwrap().is_none());
        assert!(manager.storage().memories.get(global.id).unwrap().is_some());

        // Second delete is a no-op
        assert!(!manager.delete_session(&session_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_session_summary() {
        let (manager, _dir) = test_manager();
        let mut metadata = Map::new();
        metadata.insert("owner".to_string(), json!("alice"));
        let session_id = manager
            .create_session(Some("standup".to_string()), metadata)
            .await
            .unwrap();

        for content in ["first", "second"] {
            manager
                .store_message(NewMessage::new(
                    &session_id,
                    MessageKind::Status,
                    "worker",
                    content,
                ))
                .await
                .unwrap();
        }

        let summary = manager
            .get_session_summary(&session_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.session_id, "standup");
        assert_eq!(summary.message_count, 2);
        assert_eq!(summary.metadata["owner"], json!("alice"));

        assert!(
            manager
                .get_session_summary("absent")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_list_sessions_orders() {
        let (manager, _dir) = test_manager();
        manager
            .create_session(Some("alpha".to_string()), Map::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        manager
            .create_session(Some("beta".to_string()), Map::new())
            .await
            .unwrap();

        let by_created = manager
            .list_sessions(100, 0, SessionOrder::CreatedAt)
            .await
            .unwrap();
        let ids: Vec<&str> = by_created.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["beta", "alpha"]);

        // Activity in alpha moves it back to the front
        tokio::time::sleep(Duration::from_millis(5)).await;
        manager
            .store_message(NewMessage::new(
                "alpha",
                MessageKind::Status,
                "worker",
                "still here",
            ))
            .await
            .unwrap();
        let by_active = manager
            .list_sessions(100, 0, SessionOrder::LastActive)
            .await
            .unwrap();
        let ids: Vec<&str> = by_active.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_rebuild_search_index_restores_search() {
        let (manager, _dir) = test_manager();

        // Row-only write, bypassing the facade's dual write
        let record = manager
            .storage()
            .memories
            .append(NewMemory::new("worker", "unindexed aardvark sighting"))
            .unwrap();

        let before = manager
            .retrieve_memories("worker", "aardvark", None, None, 10, 0.0)
            .await
            .unwrap();
        assert!(before.is_empty());

        let reindexed = manager.rebuild_search_index().await.unwrap();
        assert_eq!(reindexed, 1);

        let after = manager
            .retrieve_memories("worker", "aardvark", None, None, 10, 0.0)
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, record.id);
    }
}
