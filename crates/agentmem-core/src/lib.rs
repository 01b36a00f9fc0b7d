pub mod attachment;
pub mod context;
pub mod error;
pub mod importance;
pub mod manager;
pub mod query;
pub mod retriever;
pub mod tokens;

pub use attachment::MemoryAttachment;
pub use context::{
    ContextConfig, ContextCounts, ContextEntry, ContextManager, ContextWindow, MEMORY_BLOCK_HEADER,
    TokenUsage,
};
pub use error::{MemoryError, Result};
pub use importance::{ImportanceScorer, ScorerWeights};
pub use manager::{MemoryManager, SessionSummary};
pub use query::{QueryEngine, SearchOptions, extract_keywords, preprocess_query};
pub use retriever::{DEFAULT_RECALL_LIMIT, MemoryRetriever};

// Storage types that cross the public surface
pub use agentmem_storage::{
    AgentState, MemoryKind, MemoryRecord, MemoryStats, MessageKind, NewMemory, NewMessage, Session,
    SessionOrder, Storage, StoredMessage,
};
