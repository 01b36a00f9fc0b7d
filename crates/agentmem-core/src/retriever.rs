//! Conversation-driven memory recall.
//!
//! Sits between the query engine and context assembly: given an incoming
//! message, pull the handful of memories worth injecting. Recall is
//! best-effort by contract; it augments the primary path and must never
//! gate it.

use agentmem_storage::{MemoryKind, MemoryRecord};
use tracing::warn;

use crate::error::Result;
use crate::query::{QueryEngine, SearchOptions};

/// Importance floor for message-driven recall.
const RECALL_MIN_IMPORTANCE: f64 = 0.4;

/// Memories recalled per message unless the caller asks otherwise.
pub const DEFAULT_RECALL_LIMIT: usize = 3;

/// High-level recall interface for agents mid-conversation.
#[derive(Clone)]
pub struct MemoryRetriever {
    engine: QueryEngine,
}

impl MemoryRetriever {
    pub fn new(engine: QueryEngine) -> Self {
        Self { engine }
    }

    /// Memories relevant to one incoming message, keyword-matched with
    /// a raised importance floor. Failures of any kind are logged and
    /// degrade to an empty result; recall never stalls a conversation.
    pub async fn retrieve_for_message(
        &self,
        agent_id: &str,
        content: &str,
        session_id: Option<&str>,
        limit: usize,
    ) -> Vec<MemoryRecord> {
        let engine = self.engine.clone();
        let agent_id = agent_id.to_string();
        let content = content.to_string();
        let session_id = session_id.map(str::to_string);

        let outcome = tokio::task::spawn_blocking(move || {
            let mut options = SearchOptions::default()
                .with_min_importance(RECALL_MIN_IMPORTANCE)
                .with_limit(limit);
            if let Some(session_id) = session_id {
                options = options.with_session(session_id);
            }
            engine.search(&agent_id, &content, &options)
        })
        .await;

        match outcome {
            Ok(Ok(memories)) => memories,
            Ok(Err(err)) => {
                warn!("memory recall failed, continuing without it: {err}");
                Vec::new()
            }
            Err(err) => {
                warn!("memory recall task failed: {err}");
                Vec::new()
            }
        }
    }

    /// Fact-style memories, with a raised importance floor.
    pub async fn retrieve_semantic(
        &self,
        agent_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        self.preset(agent_id, query, MemoryKind::Semantic, 0.5, limit)
            .await
    }

    /// Past-interaction memories.
    pub async fn retrieve_episodic(
        &self,
        agent_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        self.preset(agent_id, query, MemoryKind::Episodic, 0.4, limit)
            .await
    }

    async fn preset(
        &self,
        agent_id: &str,
        query: &str,
        kind: MemoryKind,
        min_importance: f64,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let engine = self.engine.clone();
        let agent_id = agent_id.to_string();
        let query = query.to_string();
        let options = SearchOptions::default()
            .with_kind(kind)
            .with_min_importance(min_importance)
            .with_limit(limit);

        tokio::task::spawn_blocking(move || engine.search(&agent_id, &query, &options)).await?
    }
}
