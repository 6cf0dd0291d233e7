//! Turn sanitizer: repairs tool-call/tool-result pairing.
//!
//! Tool-use protocols require every assistant tool call to be answered by a
//! contiguous run of tool results immediately after it, and reject tool
//! results that answer nothing. Histories drift out of that shape after
//! manual edits, interrupted turns, or compaction cutting across a turn, so
//! every sequence is passed through [`sanitize`] before it reaches a provider.
//!
//! Rules, applied left to right:
//!
//! 1. A tool result not consumed by a preceding assistant tool-call block is
//!    an orphan and is dropped.
//! 2. The contiguous tool results after an assistant tool-call message are
//!    bucketed by call ID; blank IDs and IDs the assistant never issued are
//!    dropped.
//! 3. Calls left without any result are stripped from the assistant message
//!    (its text is kept; a duplicated call ID keeps its first occurrence).
//! 4. The assistant message is emitted, then its results grouped by call in
//!    call order.

use std::collections::{HashMap, HashSet};

use palaver_core::message::{ChatMessage, Role, ToolCall};
use tracing::debug;

/// Repair `messages` so every tool call/result pairing is valid.
///
/// Returns the repaired sequence and whether anything was dropped or
/// stripped. Regrouping results into call order alone does not count as a
/// change. Idempotent: a sanitized sequence passes through unchanged.
pub fn sanitize(messages: &[ChatMessage]) -> (Vec<ChatMessage>, bool) {
    let mut out = Vec::with_capacity(messages.len());
    let mut changed = false;
    let mut i = 0;

    while i < messages.len() {
        let message = &messages[i];
        match message.role {
            Role::Tool => {
                debug!(
                    tool_call_id = ?message.tool_call_id,
                    index = i,
                    "Dropping orphan tool result"
                );
                changed = true;
                i += 1;
            }
            Role::Assistant if !message.tool_calls.is_empty() => {
                let block_end = messages[i + 1..]
                    .iter()
                    .position(|m| m.role != Role::Tool)
                    .map_or(messages.len(), |offset| i + 1 + offset);
                changed |= repair_tool_turn(message, &messages[i + 1..block_end], &mut out);
                i = block_end;
            }
            _ => {
                out.push(message.clone());
                i += 1;
            }
        }
    }

    (out, changed)
}

/// Emit one assistant tool-call message and its surviving results.
///
/// Returns true when a result was dropped or a call stripped.
fn repair_tool_turn(assistant: &ChatMessage, results: &[ChatMessage], out: &mut Vec<ChatMessage>) -> bool {
    let mut dropped = false;
    let mut seen = HashSet::new();
    let calls: Vec<&ToolCall> = assistant
        .tool_calls
        .iter()
        .filter(|call| seen.insert(call.id.as_str()))
        .collect();

    let mut buckets: HashMap<&str, Vec<&ChatMessage>> = HashMap::new();
    for result in results {
        let Some(id) = result.answered_call_id() else {
            debug!("Dropping tool result without a call id");
            dropped = true;
            continue;
        };
        if !calls.iter().any(|call| call.id == id) {
            debug!(tool_call_id = id, "Dropping tool result for a call that was never issued");
            dropped = true;
            continue;
        }
        buckets.entry(id).or_default().push(result);
    }

    let kept: Vec<ToolCall> = calls
        .into_iter()
        .filter(|call| buckets.contains_key(call.id.as_str()))
        .cloned()
        .collect();

    let stripped = kept.len() != assistant.tool_calls.len();
    if stripped {
        debug!(
            issued = assistant.tool_calls.len(),
            answered = kept.len(),
            "Stripping unanswered tool calls"
        );
    }

    let mut grouped = Vec::new();
    for call in &kept {
        if let Some(bucket) = buckets.remove(call.id.as_str()) {
            grouped.extend(bucket.into_iter().cloned());
        }
    }

    let mut repaired = assistant.clone();
    repaired.tool_calls = kept;
    out.push(repaired);
    out.extend(grouped);
    dropped || stripped
}

/// True when every tool result directly answers a call of the assistant
/// message heading its contiguous block.
pub fn is_well_paired(messages: &[ChatMessage]) -> bool {
    let mut open_calls: Option<&[ToolCall]> = None;
    for message in messages {
        match message.role {
            Role::Tool => {
                let Some(calls) = open_calls else {
                    return false;
                };
                let Some(id) = message.answered_call_id() else {
                    return false;
                };
                if !calls.iter().any(|call| call.id == id) {
                    return false;
                }
            }
            Role::Assistant if !message.tool_calls.is_empty() => {
                open_calls = Some(&message.tool_calls);
            }
            _ => open_calls = None,
        }
    }
    true
}
