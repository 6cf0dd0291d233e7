//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 bytes per token. This is a cheap
//! proxy, not a tokenizer; it only has to be stable and monotonic so the
//! compactor can compare it against a budget. Swap [`estimate_tokens`] for a
//! provider-accurate count without touching the compactor's control flow.

use palaver_core::message::ChatMessage;

/// Bytes of text that count toward the budget for one message.
///
/// Covers kind, content, tool-call id, and every tool call's id, name and
/// arguments. Role and timestamps are not counted.
pub fn message_chars(message: &ChatMessage) -> usize {
    let calls: usize = message
        .tool_calls
        .iter()
        .map(|call| call.id.len() + call.name.len() + call.arguments.len())
        .sum();

    message.kind.as_str().len()
        + message.content.len()
        + message.tool_call_id.as_deref().map_or(0, str::len)
        + calls
}

/// Estimate the token count of a system prompt plus history.
///
/// Heuristic: 1 token ≈ 4 bytes, rounded down over the whole sequence.
pub fn estimate_tokens(system_prompt: &str, messages: &[ChatMessage]) -> usize {
    let chars: usize = system_prompt.len() + messages.iter().map(message_chars).sum::<usize>();
    chars / 4
}
