//! Importance scoring - which messages deserve to survive pruning.
//!
//! Scores are a weighted sum of four independently clamped [0,1] factors:
//! recency (exponential decay), content markers, interaction (was it
//! replied to), and sender role. Deterministic for a fixed `now_ms`, so
//! repeated scoring of the same history yields the same ordering.

use std::cmp::Ordering;
use std::sync::LazyLock;

use agentmem_storage::{MessageKind, StoredMessage};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Weights for the four scoring components. Defaults sum to 1.0; callers
/// supplying their own keep them summing to 1.0 so scores stay in [0,1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScorerWeights {
    pub recency: f64,
    pub content: f64,
    pub interaction: f64,
    pub role: f64,
}

impl Default for ScorerWeights {
    fn default() -> Self {
        Self {
            recency: 0.3,
            content: 0.4,
            interaction: 0.2,
            role: 0.1,
        }
    }
}

/// Hours for the recency factor to decay to 1/e.
const RECENCY_DECAY_HOURS: f64 = 24.0;

/// Substrings that mark content worth keeping.
const SALIENT_KEYWORDS: [&str; 16] = [
    "error",
    "exception",
    "failed",
    "bug",
    "issue",
    "important",
    "critical",
    "urgent",
    "decided",
    "decision",
    "conclusion",
    "summary",
    "key point",
    "note that",
    "remember",
    "don't forget",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct ImportanceScorer {
    weights: ScorerWeights,
}

impl ImportanceScorer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_weights(weights: ScorerWeights) -> Self {
        Self { weights }
    }

    /// Score one message in [0,1].
    ///
    /// `has_reply` is whether some later message in the session was
    /// addressed to this message's sender; [`ImportanceScorer::rank`]
    /// derives it when scoring a whole slice.
    pub fn score(&self, message: &StoredMessage, has_reply: bool, now_ms: i64) -> f64 {
        let recency = recency_score(message.timestamp, now_ms);
        let content = content_score(&message.content);
        let interaction = if has_reply { 1.0 } else { 0.5 };
        let role = role_score(message);

        let score = recency * self.weights.recency
            + content * self.weights.content
            + interaction * self.weights.interaction
            + role * self.weights.role;
        score.clamp(0.0, 1.0)
    }

    /// Score a whole slice, returning (index, score) sorted by score
    /// descending with ties broken by earlier position.
    pub fn rank(&self, messages: &[StoredMessage], now_ms: i64) -> Vec<(usize, f64)> {
        let mut scored: Vec<(usize, f64)> = messages
            .iter()
            .enumerate()
            .map(|(idx, message)| {
                let has_reply = has_reply_at(messages, idx);
                (idx, self.score(message, has_reply, now_ms))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scored
    }
}

/// Whether any later message is addressed back to this one's sender.
pub(crate) fn has_reply_at(messages: &[StoredMessage], idx: usize) -> bool {
    let sender = messages[idx].sender.as_str();
    messages[idx + 1..]
        .iter()
        .any(|m| m.recipient.as_deref() == Some(sender))
}

fn recency_score(timestamp_ms: i64, now_ms: i64) -> f64 {
    let age_hours = (now_ms - timestamp_ms) as f64 / 3_600_000.0;
    // Messages stamped ahead of "now" clamp to fully recent
    (-age_hours / RECENCY_DECAY_HOURS).exp().clamp(0.0, 1.0)
}

fn content_score(content: &str) -> f64 {
    static LIST_MARKER: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^\s*[-*\d]+\.").expect("invalid list marker regex"));

    if content.is_empty() {
        return 0.0;
    }

    let mut score: f64 = 0.5;
    let lowered = content.to_lowercase();

    for keyword in SALIENT_KEYWORDS {
        if lowered.contains(keyword) {
            score += 0.1;
        }
    }

    // Questions seek information
    if content.contains('?') {
        score += 0.15;
    }
    // Inline code or fenced blocks
    if content.contains('`') {
        score += 0.1;
    }
    // Numbered or bulleted structure
    if LIST_MARKER.is_match(content) {
        score += 0.05;
    }
    // Links to references
    if content.contains("http://") || content.contains("https://") {
        score += 0.05;
    }
    if content.len() > 500 {
        score += 0.05;
    }
    if content.len() < 20 {
        score -= 0.1;
    }

    score.clamp(0.0, 1.0)
}

fn role_score(message: &StoredMessage) -> f64 {
    if message.sender.eq_ignore_ascii_case("user") {
        1.0
    } else if message.kind == MessageKind::System {
        0.9
    } else {
        0.7
    }
}
