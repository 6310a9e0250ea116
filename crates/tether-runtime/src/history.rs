//! Authoritative history → transcript entries, and the merge of those
//! entries with optimistic local lines the server has not echoed yet.

use serde_json::Value;
use std::collections::HashMap;
use tether_core::message::{is_tool_result_role, MessagePart};
use tether_core::text::{fingerprint, normalize_whitespace};
use tether_core::transcript::{error_line, tool_call_line, tool_result_line};
use tether_core::{ChatMessage, EntryKind, EntryMeta, EntrySource, TranscriptEntry};

pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";
pub const HEARTBEAT_PROMPT_MARKER: &str = "HEARTBEAT.md";
pub const RESET_SENTINEL: &str = "A new session was started via /new or /reset";

/// Heartbeat probes, their acknowledgements, and session-reset sentinels.
pub fn is_control_message(message: &ChatMessage) -> bool {
    let text = message.text();
    let trimmed = text.trim();
    if trimmed.contains(RESET_SENTINEL) {
        return true;
    }
    match message.role.as_str() {
        "assistant" => trimmed == HEARTBEAT_OK || trimmed.starts_with(HEARTBEAT_OK),
        "user" | "system" => {
            trimmed.contains(HEARTBEAT_PROMPT_MARKER) && trimmed.contains(HEARTBEAT_OK)
        }
        _ => false,
    }
}

/// Extracts the message list from a `chat.history` payload.
pub fn parse_history(payload: &Value) -> Vec<ChatMessage> {
    let items = match payload {
        Value::Array(items) => items.as_slice(),
        Value::Object(object) => match object.get("messages") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };
    items.iter().filter_map(ChatMessage::from_value).collect()
}

/// Builds confirmed transcript entries from history, in server order.
///
/// Within one assistant message the order is tool lines, thinking, then
/// text, which is the order the live path produces them in.
pub fn entries_from_history(messages: &[ChatMessage]) -> Vec<TranscriptEntry> {
    let mut builder = HistoryBuilder::default();
    for message in messages.iter().filter(|message| !is_control_message(message)) {
        let ts = message.timestamp_ms.unwrap_or(0);
        if is_tool_result_role(&message.role) {
            for part in &message.parts {
                if let MessagePart::ToolResult { name, text, .. } = part {
                    builder.push(EntryKind::Tool, "tool", tool_result_line(name.as_deref(), text), ts);
                }
            }
            continue;
        }
        match message.role.as_str() {
            "user" => builder.push(EntryKind::User, "user", message.text(), ts),
            "assistant" => {
                for part in &message.parts {
                    match part {
                        MessagePart::ToolCall { name, arguments, .. } => {
                            builder.push(EntryKind::Tool, "tool", tool_call_line(name, arguments), ts);
                        }
                        MessagePart::ToolResult { name, text, .. } => builder.push(
                            EntryKind::Tool,
                            "tool",
                            tool_result_line(name.as_deref(), text),
                            ts,
                        ),
                        _ => {}
                    }
                }
                builder.push(EntryKind::Thinking, "assistant", message.thinking(), ts);
                builder.push(EntryKind::Assistant, "assistant", message.text(), ts);
                if message.is_error() && message.text().trim().is_empty() {
                    builder.push(
                        EntryKind::Meta,
                        "system",
                        error_line(message.error_message.as_deref()),
                        ts,
                    );
                }
            }
            _ => builder.push(EntryKind::Meta, message.role.clone(), message.text(), ts),
        }
    }
    builder.entries
}

#[derive(Default)]
struct HistoryBuilder {
    entries: Vec<TranscriptEntry>,
    occurrences: HashMap<(EntryKind, String), usize>,
}

impl HistoryBuilder {
    fn push(&mut self, kind: EntryKind, role: impl Into<String>, text: String, timestamp_ms: i64) {
        let text = text.trim().to_string();
        if text.is_empty() {
            return;
        }
        let occurrence = self
            .occurrences
            .entry((kind, text.clone()))
            .and_modify(|count| *count += 1)
            .or_insert(0);
        let id = format!(
            "hist:{}",
            fingerprint(&[kind.as_str(), &text, &occurrence.to_string()])
        );
        let entry = TranscriptEntry::new(kind, role, text, id, timestamp_ms)
            .with_meta(EntryMeta {
                source: Some(EntrySource::History),
                ..EntryMeta::default()
            })
            .confirmed();
        self.entries.push(entry);
    }
}

/// Merges `history` with the local transcript.
///
/// Confirmed local entries that still exist in history act as anchors and
/// move the cursor forward. Each unconfirmed local line is searched forward
/// from the cursor. A line with no match is held back and placed just before
/// the next local line that history does contain, or after all of history
/// when none follows. History order always wins.
pub fn merge_pending(history: Vec<TranscriptEntry>, local: &[TranscriptEntry]) -> Vec<TranscriptEntry> {
    let mut merged = history;
    let mut cursor = 0;
    let mut unplaced: Vec<TranscriptEntry> = Vec::new();
    for entry in local {
        let found = if entry.confirmed {
            merged.iter().position(|candidate| candidate.entry_id == entry.entry_id)
        } else {
            (cursor..merged.len()).find(|&index| same_line(&merged[index], entry))
        };
        let Some(index) = found else {
            if !entry.confirmed {
                unplaced.push(entry.clone());
            }
            continue;
        };

        let at = index.max(cursor);
        let shift = unplaced.len();
        for (offset, pending) in unplaced.drain(..).enumerate() {
            merged.insert(at + offset, pending);
        }
        if index >= at {
            let index = index + shift;
            if !entry.confirmed {
                adopt_pending_meta(&mut merged[index], entry);
            }
            cursor = index + 1;
        } else {
            cursor = at + shift;
        }
    }
    merged.extend(unplaced);
    merged
}

fn same_line(historized: &TranscriptEntry, pending: &TranscriptEntry) -> bool {
    if historized.kind != pending.kind {
        return false;
    }
    match pending.kind {
        EntryKind::User => normalize_whitespace(&historized.text) == normalize_whitespace(&pending.text),
        _ => historized.text.trim() == pending.text.trim(),
    }
}

fn adopt_pending_meta(historized: &mut TranscriptEntry, pending: &TranscriptEntry) {
    let meta = &mut historized.meta;
    if meta.run_id.is_none() {
        meta.run_id = pending.meta.run_id.clone();
    }
    if meta.thinking_duration_ms.is_none() {
        meta.thinking_duration_ms = pending.meta.thinking_duration_ms;
    }
    if meta.terminal_seq.is_none() {
        meta.terminal_seq = pending.meta.terminal_seq;
    }
}

/// True when history already holds an assistant reply for a run that started
/// at `run_started_ms`. Messages without timestamps only count when the reply
/// is the last message in history.
pub fn history_shows_completion(messages: &[ChatMessage], run_started_ms: i64) -> bool {
    let relevant = messages
        .iter()
        .filter(|message| !is_control_message(message))
        .collect::<Vec<_>>();
    let Some(last_reply) = relevant
        .iter()
        .rposition(|message| message.role == "assistant" && !message.text().trim().is_empty())
    else {
        return false;
    };
    match relevant[last_reply].timestamp_ms {
        Some(ts) => ts >= run_started_ms,
        None => last_reply + 1 == relevant.len(),
    }
}
