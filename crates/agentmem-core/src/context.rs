//! Context assembly - token-bounded windows over conversation history.
//!
//! `prepare_context` partitions a history into protected messages (system
//! messages and the newest N) and prunable candidates, admits candidates
//! best-score-first against the token budget, and reassembles everything
//! chronologically. Retrieved memories ride along as one synthetic system
//! entry filled against whatever headroom the messages left.

use std::cmp::Ordering;

use agentmem_storage::{MemoryRecord, MessageKind, StoredMessage};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::importance::{ImportanceScorer, has_reply_at};
use crate::manager::MemoryManager;
use crate::retriever::DEFAULT_RECALL_LIMIT;
use crate::tokens;

/// Header line of the synthetic memory entry.
pub const MEMORY_BLOCK_HEADER: &str = "## Relevant Context from Memory:";

const MEMORY_BLOCK_SENDER: &str = "system";

/// Budget configuration for context assembly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Hard model context limit.
    pub max_tokens: usize,
    /// Headroom reserved for the model's reply.
    pub buffer_tokens: usize,
    /// How many of the newest messages are always kept.
    pub always_keep_recent: usize,
    /// Whether system messages are always kept.
    pub always_keep_system: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 180_000,
            buffer_tokens: 20_000,
            always_keep_recent: 10,
            always_keep_system: true,
        }
    }
}

impl ContextConfig {
    /// The budget actually available for context once the reply buffer is
    /// set aside.
    pub fn effective_max(&self) -> usize {
        self.max_tokens.saturating_sub(self.buffer_tokens)
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    #[must_use]
    pub fn with_buffer_tokens(mut self, buffer_tokens: usize) -> Self {
        self.buffer_tokens = buffer_tokens;
        self
    }

    #[must_use]
    pub fn with_always_keep_recent(mut self, count: usize) -> Self {
        self.always_keep_recent = count;
        self
    }

    #[must_use]
    pub fn with_always_keep_system(mut self, keep: bool) -> Self {
        self.always_keep_system = keep;
        self
    }
}

/// One entry of an assembled context window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextEntry {
    pub kind: MessageKind,
    pub sender: String,
    pub content: String,
}

impl From<&StoredMessage> for ContextEntry {
    fn from(message: &StoredMessage) -> Self {
        Self {
            kind: message.kind,
            sender: message.sender.clone(),
            content: message.content.clone(),
        }
    }
}

/// How many entries each selection rule contributed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ContextCounts {
    pub system: usize,
    pub recent: usize,
    pub scored: usize,
    pub memories: usize,
}

/// An assembled, budget-respecting context window.
#[derive(Debug, Clone, Serialize)]
pub struct ContextWindow {
    /// Entries in chronological order, memory block included.
    pub messages: Vec<ContextEntry>,
    /// The memories admitted into the synthetic entry.
    pub memories: Vec<MemoryRecord>,
    pub total_tokens: usize,
    /// Candidates that did not make the cut.
    pub pruned_count: usize,
    pub counts: ContextCounts,
}

/// Read-only budget diagnostic for a history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub total_tokens: usize,
    pub max_tokens: usize,
    pub effective_max_tokens: usize,
    pub buffer_tokens: usize,
    pub available_tokens: usize,
    pub message_count: usize,
    pub per_message_tokens: Vec<usize>,
    pub needs_pruning: bool,
}

/// Assembles pruned, token-bounded context windows. Pure and stateless;
/// safe to share and call concurrently.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextManager {
    config: ContextConfig,
    scorer: ImportanceScorer,
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        Self {
            config,
            scorer: ImportanceScorer::new(),
        }
    }

    #[must_use]
    pub fn with_scorer(mut self, scorer: ImportanceScorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Assemble a context window from a chronological history and
    /// relevance-ranked memories.
    ///
    /// Protected messages (system kind when enabled, plus the newest
    /// `always_keep_recent` by position) are always present; if they alone
    /// exceed the budget this fails with `ContextOverflow` rather than
    /// truncating them. Remaining candidates are admitted best-score-first
    /// (stored importance wins over computed), skipping entries that do
    /// not fit while still trying smaller ones. The output is always
    /// chronological, and its `total_tokens` never exceeds
    /// `max_tokens - buffer_tokens`.
    pub fn prepare_context(
        &self,
        messages: &[StoredMessage],
        memories: &[MemoryRecord],
        now_ms: i64,
    ) -> Result<ContextWindow> {
        let effective_max = self.config.effective_max();
        let len = messages.len();
        let recent_start = len.saturating_sub(self.config.always_keep_recent);

        let mut protected = vec![false; len];
        let mut counts = ContextCounts::default();
        for (idx, message) in messages.iter().enumerate() {
            if self.config.always_keep_system && message.kind == MessageKind::System {
                protected[idx] = true;
                counts.system += 1;
            } else if idx >= recent_start {
                protected[idx] = true;
                counts.recent += 1;
            }
        }

        let costs: Vec<usize> = messages.iter().map(tokens::estimate_message).collect();

        let mut message_total: usize = (0..len)
            .filter(|&idx| protected[idx])
            .map(|idx| costs[idx])
            .sum();
        let mut any_entries = protected.iter().any(|&p| p);
        let protected_cost = message_total
            + if any_entries {
                tokens::CONVERSATION_OVERHEAD_TOKENS
            } else {
                0
            };
        if protected_cost > effective_max {
            return Err(MemoryError::ContextOverflow {
                protected_tokens: protected_cost,
                budget_tokens: effective_max,
            });
        }

        let mut candidates: Vec<(usize, f64)> = (0..len)
            .filter(|&idx| !protected[idx])
            .map(|idx| {
                let score = messages[idx].importance_score.unwrap_or_else(|| {
                    self.scorer
                        .score(&messages[idx], has_reply_at(messages, idx), now_ms)
                });
                (idx, score)
            })
            .collect();
        let candidate_count = candidates.len();
        candidates.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        // Best-effort bin-fill: an entry that misses is skipped, smaller
        // lower-ranked ones may still fit
        let mut admitted = vec![false; len];
        for (idx, _score) in &candidates {
            let would_be =
                message_total + costs[*idx] + tokens::CONVERSATION_OVERHEAD_TOKENS;
            if would_be <= effective_max {
                admitted[*idx] = true;
                message_total += costs[*idx];
                any_entries = true;
                counts.scored += 1;
            }
        }
        let pruned_count = candidate_count - counts.scored;

        let mut entries: Vec<ContextEntry> = (0..len)
            .filter(|&idx| protected[idx] || admitted[idx])
            .map(|idx| ContextEntry::from(&messages[idx]))
            .collect();

        let mut total_tokens = message_total
            + if any_entries {
                tokens::CONVERSATION_OVERHEAD_TOKENS
            } else {
                0
            };

        // Memories fill leftover headroom only; they never evict messages
        let mut included_memories = Vec::new();
        if !memories.is_empty() {
            // The wrap overhead applies once the block lands, message
            // survivors or none
            let floor = message_total + tokens::CONVERSATION_OVERHEAD_TOKENS;
            let headroom = effective_max.saturating_sub(floor);
            if let Some((content, selected)) = format_memory_block(memories, headroom) {
                total_tokens = floor + tokens::estimate_entry(MEMORY_BLOCK_SENDER, &content);
                let insert_at = entries
                    .iter()
                    .take_while(|entry| entry.kind == MessageKind::System)
                    .count();
                entries.insert(
                    insert_at,
                    ContextEntry {
                        kind: MessageKind::System,
                        sender: MEMORY_BLOCK_SENDER.to_string(),
                        content,
                    },
                );
                counts.memories = selected.len();
                included_memories = selected;
            }
        }

        Ok(ContextWindow {
            messages: entries,
            memories: included_memories,
            total_tokens,
            pruned_count,
            counts,
        })
    }

    /// Cheap pre-check: would `prepare_context` have to drop anything?
    /// Never mutates and never errs.
    pub fn should_prune(&self, messages: &[StoredMessage]) -> bool {
        tokens::estimate_conversation(messages) > self.config.effective_max()
    }

    /// Read-only budget breakdown for a history.
    pub fn get_token_usage(&self, messages: &[StoredMessage]) -> TokenUsage {
        let per_message_tokens = tokens::per_message(messages);
        let total_tokens = tokens::estimate_conversation(messages);
        let effective_max_tokens = self.config.effective_max();

        TokenUsage {
            total_tokens,
            max_tokens: self.config.max_tokens,
            effective_max_tokens,
            buffer_tokens: self.config.buffer_tokens,
            available_tokens: effective_max_tokens.saturating_sub(total_tokens),
            message_count: messages.len(),
            per_message_tokens,
            needs_pruning: total_tokens > effective_max_tokens,
        }
    }

    /// Load a session's history through the manager, append any not-yet-
    /// stored messages, retrieve memories relevant to the newest message
    /// when an agent id is given, and assemble the window.
    pub async fn prepare_from_storage(
        &self,
        manager: &MemoryManager,
        session_id: &str,
        agent_id: Option<&str>,
        extra_messages: &[StoredMessage],
    ) -> Result<ContextWindow> {
        let mut messages = manager.get_messages(session_id, None, None, 0).await?;
        messages.extend(extra_messages.iter().cloned());

        // Recall deliberately spans sessions; facts learned elsewhere
        // are the point of injecting memories here
        let memories = match (agent_id, messages.last()) {
            (Some(agent_id), Some(last)) => {
                manager
                    .retriever()
                    .retrieve_for_message(agent_id, &last.content, None, DEFAULT_RECALL_LIMIT)
                    .await
            }
            _ => Vec::new(),
        };

        self.prepare_context(&messages, &memories, Utc::now().timestamp_millis())
    }
}

/// Fit memories into `headroom` as a single block, first-miss stops.
/// Returns `None` when not even one bullet fits.
fn format_memory_block(
    memories: &[MemoryRecord],
    headroom: usize,
) -> Option<(String, Vec<MemoryRecord>)> {
    if headroom == 0 {
        return None;
    }

    let mut content = MEMORY_BLOCK_HEADER.to_string();
    let mut included = Vec::new();
    for memory in memories {
        let candidate = format!("{content}\n- {}", memory.content);
        if tokens::estimate_entry(MEMORY_BLOCK_SENDER, &candidate) > headroom {
            break;
        }
        content = candidate;
        included.push(memory.clone());
    }

    if included.is_empty() {
        None
    } else {
        Some((content, included))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmem_storage::MemoryKind;
    use serde_json::Map;

    // 40 chars -> 10 tokens; with a short sender every message costs 21
    const CONTENT_40: &str = "0123456789012345678901234567890123456789";

    fn message(
        id: u64,
        kind: MessageKind,
        sender: &str,
        content: &str,
        importance: Option<f64>,
    ) -> StoredMessage {
        StoredMessage {
            id,
            session_id: "s1".to_string(),
            timestamp: id as i64,
            kind,
            sender: sender.to_string(),
            recipient: None,
            content: content.to_string(),
            metadata: Map::new(),
            importance_score: importance,
        }
    }

    fn memory(id: u64, content: &str) -> MemoryRecord {
        MemoryRecord {
            id,
            agent_id: "a1".to_string(),
            session_id: None,
            kind: MemoryKind::Semantic,
            content: content.to_string(),
            importance: 0.8,
            access_count: 0,
            created_at: 0,
            last_accessed_at: None,
            metadata: Map::new(),
        }
    }

    /// Unique 40-char content per id keeps every message at 21 tokens
    /// while letting assertions identify survivors.
    fn body(id: u64) -> String {
        format!("{id:040}")
    }

    /// Two system + ten conversational messages, candidate importances
    /// chosen so ids 3 and 5 are the clear winners.
    fn twelve_message_history() -> Vec<StoredMessage> {
        let mut messages = vec![
            message(1, MessageKind::System, "system", &body(1), None),
            message(2, MessageKind::System, "system", &body(2), None),
        ];
        let importances = [0.9, 0.2, 0.8, 0.3, 0.1];
        for (offset, importance) in importances.iter().enumerate() {
            let id = 3 + offset as u64;
            messages.push(message(
                id,
                MessageKind::Response,
                "alice",
                &body(id),
                Some(*importance),
            ));
        }
        for id in 8..=12 {
            messages.push(message(id, MessageKind::Response, "bob", &body(id), Some(0.5)));
        }
        messages
    }

    #[test]
    fn test_small_history_passes_through() {
        let config = ContextConfig::default().with_always_keep_recent(5);
        let manager = ContextManager::new(config);
        let messages = twelve_message_history();

        let window = manager.prepare_context(&messages, &[], 0).unwrap();
        assert_eq!(window.messages.len(), 12);
        assert_eq!(window.pruned_count, 0);
        assert_eq!(window.counts.system, 2);
        assert_eq!(window.counts.recent, 5);
        assert_eq!(window.counts.scored, 5);
    }

    #[test]
    fn test_prunes_to_budget_keeping_protected_and_best() {
        // effective 200: 7 protected (147 + 5 wrap) leave room for exactly
        // two more 21-token candidates
        let config = ContextConfig::default()
            .with_max_tokens(220)
            .with_buffer_tokens(20)
            .with_always_keep_recent(5);
        let manager = ContextManager::new(config);
        let messages = twelve_message_history();

        let window = manager.prepare_context(&messages, &[], 0).unwrap();

        assert_eq!(window.messages.len(), 9);
        assert_eq!(window.pruned_count, 3);
        assert_eq!(
            window.counts,
            ContextCounts {
                system: 2,
                recent: 5,
                scored: 2,
                memories: 0
            }
        );
        assert!(window.total_tokens <= 200);

        // Chronological output: both system, the two best candidates
        // (ids 3 and 5), then the recent tail
        let expected: Vec<String> = [1u64, 2, 3, 5, 8, 9, 10, 11, 12]
            .iter()
            .map(|id| body(*id))
            .collect();
        let got: Vec<&str> = window.messages.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_protected_floor_overflow_fails() {
        let config = ContextConfig::default()
            .with_max_tokens(100)
            .with_buffer_tokens(50)
            .with_always_keep_recent(0);
        let manager = ContextManager::new(config);
        let big = "x".repeat(400); // 100 tokens content alone
        let messages = vec![message(1, MessageKind::System, "system", &big, None)];

        let err = manager.prepare_context(&messages, &[], 0).unwrap_err();
        match err {
            MemoryError::ContextOverflow {
                protected_tokens,
                budget_tokens,
            } => {
                assert_eq!(budget_tokens, 50);
                assert!(protected_tokens > 50);
            }
            other => panic!("expected ContextOverflow, got {other:?}"),
        }
    }

    #[test]
    fn test_bin_fill_skips_oversized_and_keeps_trying() {
        let config = ContextConfig::default()
            .with_max_tokens(50)
            .with_buffer_tokens(0)
            .with_always_keep_recent(0)
            .with_always_keep_system(false);
        let manager = ContextManager::new(config);

        let big = "x".repeat(200); // cost 61
        let messages = vec![
            message(1, MessageKind::Response, "bob", &big, Some(0.9)),
            message(2, MessageKind::Response, "bob", CONTENT_40, Some(0.5)),
            message(3, MessageKind::Response, "bob", CONTENT_40, Some(0.4)),
        ];

        let window = manager.prepare_context(&messages, &[], 0).unwrap();
        assert_eq!(window.messages.len(), 2);
        assert_eq!(window.pruned_count, 1);
        assert!(window.messages.iter().all(|e| e.content == CONTENT_40));
        assert!(window.total_tokens <= 50);
    }

    #[test]
    fn test_higher_score_wins_when_only_one_fits() {
        let config = ContextConfig::default()
            .with_max_tokens(26)
            .with_buffer_tokens(0)
            .with_always_keep_recent(0)
            .with_always_keep_system(false);
        let manager = ContextManager::new(config);

        let messages = vec![
            message(1, MessageKind::Response, "ann", CONTENT_40, Some(0.5)),
            message(2, MessageKind::Response, "bob", CONTENT_40, Some(0.9)),
        ];

        let window = manager.prepare_context(&messages, &[], 0).unwrap();
        assert_eq!(window.messages.len(), 1);
        // The later message wins on score despite its position
        assert_eq!(window.messages[0].sender, "bob");
        assert_eq!(window.pruned_count, 1);

        // Equal scores fall back to the earlier position
        let tied = vec![
            message(1, MessageKind::Query, "alice", CONTENT_40, Some(0.7)),
            message(2, MessageKind::Response, "bob", CONTENT_40, Some(0.7)),
        ];
        let window = manager.prepare_context(&tied, &[], 0).unwrap();
        assert_eq!(window.messages.len(), 1);
        assert_eq!(window.messages[0].sender, "alice");
    }

    #[test]
    fn test_memories_fill_headroom_after_system() {
        let manager = ContextManager::new(ContextConfig::default());
        let messages = vec![
            message(1, MessageKind::System, "system", "you are a helpful agent", None),
            message(2, MessageKind::Query, "user", "what did we decide?", None),
        ];
        let memories = vec![memory(1, "the team chose redb"), memory(2, "ship on friday")];

        let window = manager.prepare_context(&messages, &memories, 0).unwrap();

        assert_eq!(window.messages.len(), 3);
        assert_eq!(window.messages[1].kind, MessageKind::System);
        assert!(window.messages[1].content.starts_with(MEMORY_BLOCK_HEADER));
        assert!(window.messages[1].content.contains("- the team chose redb"));
        assert!(window.messages[1].content.contains("- ship on friday"));
        assert_eq!(window.counts.memories, 2);
        assert_eq!(window.memories.len(), 2);
        assert!(window.total_tokens <= manager.config().effective_max());
    }

    #[test]
    fn test_memories_never_evict_messages() {
        // Budget exactly covers the one protected message, leaving no
        // headroom for the memory block
        let config = ContextConfig::default()
            .with_max_tokens(26)
            .with_buffer_tokens(0)
            .with_always_keep_recent(1);
        let manager = ContextManager::new(config);
        let messages = vec![message(1, MessageKind::Response, "bob", CONTENT_40, None)];
        let memories = vec![memory(1, "something relevant")];

        let window = manager.prepare_context(&messages, &memories, 0).unwrap();
        assert_eq!(window.messages.len(), 1);
        assert_eq!(window.messages[0].content, CONTENT_40);
        assert!(window.memories.is_empty());
        assert_eq!(window.counts.memories, 0);
    }

    #[test]
    fn test_memory_block_first_miss_stops() {
        let config = ContextConfig::default()
            .with_max_tokens(70)
            .with_buffer_tokens(0)
            .with_always_keep_recent(1);
        let manager = ContextManager::new(config);
        let messages = vec![message(1, MessageKind::Response, "bob", CONTENT_40, None)];
        // 26 message tokens leave 44; header block with the first bullet
        // fits, the long second bullet does not
        let memories = vec![memory(1, "short fact"), memory(2, &"y".repeat(400))];

        let window = manager.prepare_context(&messages, &memories, 0).unwrap();
        assert_eq!(window.memories.len(), 1);
        assert_eq!(window.memories[0].id, 1);
        assert!(window.total_tokens <= 70);
    }

    #[test]
    fn test_empty_history_with_memories() {
        let manager = ContextManager::new(ContextConfig::default());
        let memories = vec![memory(1, "standalone fact")];

        let window = manager.prepare_context(&[], &memories, 0).unwrap();
        assert_eq!(window.messages.len(), 1);
        assert!(window.messages[0].content.contains("standalone fact"));
        assert_eq!(window.counts.memories, 1);
    }

    #[test]
    fn test_should_prune_is_pure() {
        let config = ContextConfig::default()
            .with_max_tokens(100)
            .with_buffer_tokens(10);
        let manager = ContextManager::new(config);
        let messages = twelve_message_history();

        let first = manager.should_prune(&messages);
        let second = manager.should_prune(&messages);
        assert!(first);
        assert_eq!(first, second);
        assert_eq!(messages.len(), 12);

        assert!(!manager.should_prune(&[]));
    }

    #[test]
    fn test_token_usage_breakdown() {
        let config = ContextConfig::default()
            .with_max_tokens(100)
            .with_buffer_tokens(20);
        let manager = ContextManager::new(config);
        let messages = vec![
            message(1, MessageKind::Query, "alice", CONTENT_40, None),
            message(2, MessageKind::Response, "bob", CONTENT_40, None),
        ];

        let usage = manager.get_token_usage(&messages);
        assert_eq!(usage.total_tokens, 47);
        assert_eq!(usage.max_tokens, 100);
        assert_eq!(usage.effective_max_tokens, 80);
        assert_eq!(usage.buffer_tokens, 20);
        assert_eq!(usage.available_tokens, 33);
        assert_eq!(usage.message_count, 2);
        assert_eq!(usage.per_message_tokens, vec![21, 21]);
        assert!(!usage.needs_pruning);

        // Identical inputs give identical diagnostics
        assert_eq!(usage, manager.get_token_usage(&messages));
    }
}
