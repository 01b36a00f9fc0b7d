//! Keyword search over stored memories.
//!
//! The engine sanitizes free text, runs it through the search index, then
//! re-ranks the surviving rows by relevance and importance. Keyword
//! extraction is frequency-based with a stop-word filter.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use agentmem_storage::{MemoryKind, MemoryRecord, Storage};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// How many extracted keywords a free-text search uses.
const SEARCH_KEYWORD_LIMIT: usize = 5;

/// Words too common to be useful search keywords.
const STOPWORDS: [&str; 54] = [
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "were", "be", "been", "being", "have", "has", "had", "do",
    "does", "did", "will", "would", "could", "should", "may", "might", "can", "i", "you", "he",
    "she", "it", "we", "they", "what", "which", "who", "when", "where", "why", "how", "this",
    "that", "these", "those",
];

/// Filters applied on top of a text match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Restrict results to one memory kind.
    pub kind: Option<MemoryKind>,
    /// Restrict results to memories tied to this session.
    pub session_id: Option<String>,
    /// Drop results below this stored importance.
    pub min_importance: f64,
    /// Maximum number of results.
    pub limit: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            kind: None,
            session_id: None,
            min_importance: 0.0,
            limit: 10,
        }
    }
}

impl SearchOptions {
    #[must_use]
    pub fn with_kind(mut self, kind: MemoryKind) -> Self {
        self.kind = Some(kind);
        self
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_min_importance(mut self, min_importance: f64) -> Self {
        self.min_importance = min_importance;
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Blocking search front-end over [`Storage`]. Cheap to clone; the async
/// layer moves clones into `spawn_blocking`.
#[derive(Clone)]
pub struct QueryEngine {
    storage: Arc<Storage>,
}

impl QueryEngine {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Free-text search. Up to five keywords extracted from the query
    /// drive an OR match; keyword-free queries fall back to the
    /// sanitized raw text, and a query with nothing searchable at all
    /// returns nothing.
    pub fn search(
        &self,
        agent_id: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<MemoryRecord>> {
        let keywords = extract_keywords(query, SEARCH_KEYWORD_LIMIT);
        if !keywords.is_empty() {
            return self.run(agent_id, &keywords.join(" OR "), options);
        }

        let processed = preprocess_query(query);
        if processed.is_empty() {
            return Ok(Vec::new());
        }
        self.run(agent_id, &processed, options)
    }

    /// Match any of the given keywords. Empty input returns nothing.
    pub fn search_by_keywords(
        &self,
        agent_id: &str,
        keywords: &[String],
        options: &SearchOptions,
    ) -> Result<Vec<MemoryRecord>> {
        let cleaned: Vec<String> = keywords
            .iter()
            .map(|keyword| preprocess_query(keyword))
            .filter(|keyword| !keyword.is_empty())
            .collect();
        if cleaned.is_empty() {
            return Ok(Vec::new());
        }
        self.run(agent_id, &cleaned.join(" OR "), options)
    }

    /// Search scoped to one session, with a raised importance floor.
    pub fn search_recent(
        &self,
        agent_id: &str,
        query: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>> {
        let options = SearchOptions::default()
            .with_session(session_id)
            .with_min_importance(0.3)
            .with_limit(limit);
        self.search(agent_id, query, &options)
    }

    /// Index lookup plus row-side filtering. Over-fetches so that rows the
    /// filters reject do not starve the final cut.
    fn run(
        &self,
        agent_id: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<MemoryRecord>> {
        let fetch = options.limit.saturating_mul(4).max(64);
        let hits = self.storage.index.search(
            query,
            agent_id,
            options.session_id.as_deref(),
            fetch,
        )?;
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<u64> = hits.iter().map(|hit| hit.id).collect();
        let relevance: HashMap<u64, f32> =
            hits.iter().map(|hit| (hit.id, hit.relevance)).collect();

        let mut matched: Vec<(f32, MemoryRecord)> = self
            .storage
            .memories
            .get_many(&ids)?
            .into_iter()
            .filter(|record| record.importance >= options.min_importance)
            .filter(|record| options.kind.is_none_or(|kind| record.kind == kind))
            .map(|record| {
                let score = relevance.get(&record.id).copied().unwrap_or(0.0);
                (score, record)
            })
            .collect();

        matched.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(Ordering::Equal)
                .then(
                    b.1.importance
                        .partial_cmp(&a.1.importance)
                        .unwrap_or(Ordering::Equal),
                )
        });
        matched.truncate(options.limit);

        Ok(matched.into_iter().map(|(_, record)| record).collect())
    }
}

/// Lowercase, strip anything the index tokenizer would choke on, collapse
/// whitespace. Hyphens survive.
pub fn preprocess_query(query: &str) -> String {
    static NON_SEARCHABLE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[^a-z0-9\s\-]").expect("invalid query sanitizer regex"));

    let lowered = query.to_lowercase();
    let cleaned = NON_SEARCHABLE.replace_all(&lowered, " ");
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Top `top_k` words by frequency, stop words and words of three or fewer
/// characters excluded. Ties keep first-occurrence order.
pub fn extract_keywords(text: &str, top_k: usize) -> Vec<String> {
    static WORD: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\b\w+\b").expect("invalid word regex"));

    if text.is_empty() || top_k == 0 {
        return Vec::new();
    }

    let lowered = text.to_lowercase();
    let mut counts: Vec<(String, usize)> = Vec::new();
    for word in WORD.find_iter(&lowered).map(|m| m.as_str()) {
        if word.len() <= 3 || STOPWORDS.contains(&word) {
            continue;
        }
        match counts.iter_mut().find(|(seen, _)| seen.as_str() == word) {
            Some((_, count)) => *count += 1,
            None => counts.push((word.to_string(), 1)),
        }
    }

    // Stable sort keeps first-seen order among equal counts
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts.truncate(top_k);
    counts.into_iter().map(|(word, _)| word).collect()
}
