//! Token estimation for context budgeting.
//!
//! A fixed bytes-per-token heuristic, not a real tokenizer: fast enough to
//! run on every message of every context assembly, and accurate enough for
//! budgeting because the reply buffer absorbs the estimation error.

use agentmem_storage::StoredMessage;

/// Rough bytes of text per model token.
pub const CHARS_PER_TOKEN: usize = 4;

/// Fixed per-message framing cost on top of sender and content.
const MESSAGE_OVERHEAD_TOKENS: usize = 10;

/// Fixed cost for wrapping messages into one conversation.
pub(crate) const CONVERSATION_OVERHEAD_TOKENS: usize = 5;

/// Estimated token cost of a piece of text. Empty text costs nothing;
/// anything else costs at least one token.
pub fn estimate(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    (text.len() / CHARS_PER_TOKEN).max(1)
}

/// Estimated cost of one context entry given its sender and content.
pub fn estimate_entry(sender: &str, content: &str) -> usize {
    estimate(sender) + estimate(content) + MESSAGE_OVERHEAD_TOKENS
}

/// Estimated cost of one message: sender + content + framing overhead.
pub fn estimate_message(message: &StoredMessage) -> usize {
    estimate_entry(&message.sender, &message.content)
}

/// Estimated cost of a whole conversation. Empty conversations cost
/// nothing.
pub fn estimate_conversation(messages: &[StoredMessage]) -> usize {
    if messages.is_empty() {
        return 0;
    }
    messages.iter().map(estimate_message).sum::<usize>() + CONVERSATION_OVERHEAD_TOKENS
}

/// Per-message costs, index-aligned with the input.
pub fn per_message(messages: &[StoredMessage]) -> Vec<usize> {
    messages.iter().map(estimate_message).collect()
}

/// Cut text down to roughly `max_tokens`, appending `...` when truncated.
/// The cut lands on a char boundary.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    if estimate(text) <= max_tokens {
        return text.to_string();
    }

    let max_chars = max_tokens * CHARS_PER_TOKEN;
    if text.len() <= max_chars {
        return text.to_string();
    }

    let mut boundary = max_chars.saturating_sub(3);
    while boundary > 0 && !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!("{}...", &text[..boundary])
}
