//! Optional memory capability for agents.
//!
//! An agent either carries the full memory stack or runs memory-less,
//! and calls the same methods either way. `Detached` recalls nothing,
//! accepts writes as no-ops, and passes pending context through
//! untouched, so callers never branch on a nullable field.

use agentmem_storage::{MemoryRecord, NewMemory, NewMessage, StoredMessage};

use crate::context::{ContextConfig, ContextEntry, ContextManager, ContextWindow};
use crate::error::Result;
use crate::manager::MemoryManager;
use crate::retriever::{DEFAULT_RECALL_LIMIT, MemoryRetriever};
use crate::tokens;

#[derive(Clone)]
pub enum MemoryAttachment {
    Attached {
        manager: MemoryManager,
        retriever: MemoryRetriever,
        context: ContextManager,
    },
    Detached,
}

impl MemoryAttachment {
    pub fn attached(manager: MemoryManager, config: ContextConfig) -> Self {
        let retriever = manager.retriever();
        Self::Attached {
            manager,
            retriever,
            context: ContextManager::new(config),
        }
    }

    pub fn detached() -> Self {
        Self::Detached
    }

    pub fn is_attached(&self) -> bool {
        matches!(self, Self::Attached { .. })
    }

    /// The manager, when one is attached.
    pub fn manager(&self) -> Option<&MemoryManager> {
        match self {
            Self::Attached { manager, .. } => Some(manager),
            Self::Detached => None,
        }
    }

    /// Store a conversation message. Detached agents drop it and report
    /// success.
    pub async fn record_message(&self, draft: NewMessage) -> Result<Option<StoredMessage>> {
        match self {
            Self::Attached { manager, .. } => Ok(Some(manager.store_message(draft).await?)),
            Self::Detached => Ok(None),
        }
    }

    /// Store a memory. Detached agents drop it and report success.
    pub async fn record_memory(&self, draft: NewMemory) -> Result<Option<MemoryRecord>> {
        match self {
            Self::Attached { manager, .. } => Ok(Some(manager.store_memory(draft).await?)),
            Self::Detached => Ok(None),
        }
    }

    /// Memories relevant to an incoming message; always empty when
    /// detached.
    pub async fn recall(&self, agent_id: &str, content: &str) -> Vec<MemoryRecord> {
        match self {
            Self::Attached { retriever, .. } => {
                retriever
                    .retrieve_for_message(agent_id, content, None, DEFAULT_RECALL_LIMIT)
                    .await
            }
            Self::Detached => Vec::new(),
        }
    }

    /// Assemble the context for an agent's next turn: stored history plus
    /// `pending` messages, pruned to budget, with relevant memories
    /// injected. Detached agents get their pending messages back
    /// unchanged.
    pub async fn prepare_context(
        &self,
        session_id: &str,
        agent_id: &str,
        pending: &[StoredMessage],
    ) -> Result<ContextWindow> {
        match self {
            Self::Attached {
                manager, context, ..
            } => {
                context
                    .prepare_from_storage(manager, session_id, Some(agent_id), pending)
                    .await
            }
            Self::Detached => Ok(ContextWindow {
                messages: pending.iter().map(ContextEntry::from).collect(),
                memories: Vec::new(),
                total_tokens: tokens::estimate_conversation(pending),
                pruned_count: 0,
                counts: Default::default(),
            }),
        }
    }
}
