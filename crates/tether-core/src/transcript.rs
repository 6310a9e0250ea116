use crate::text::truncate_utf8;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

const MAX_TOOL_TEXT_BYTES: usize = 2_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    User,
    Assistant,
    Thinking,
    Tool,
    Meta,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::User => "user",
            EntryKind::Assistant => "assistant",
            EntryKind::Thinking => "thinking",
            EntryKind::Tool => "tool",
            EntryKind::Meta => "meta",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an entry's content came from. Ordered by authority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntrySource {
    Local,
    Lifecycle,
    Chat,
    History,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntryMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<EntrySource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_seq: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub kind: EntryKind,
    pub role: String,
    pub text: String,
    pub sequence_key: u64,
    pub timestamp_ms: i64,
    pub entry_id: String,
    pub confirmed: bool,
    #[serde(default)]
    pub meta: EntryMeta,
}

impl TranscriptEntry {
    pub fn new(
        kind: EntryKind,
        role: impl Into<String>,
        text: impl Into<String>,
        entry_id: impl Into<String>,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            kind,
            role: role.into(),
            text: text.into(),
            sequence_key: 0,
            timestamp_ms,
            entry_id: entry_id.into(),
            confirmed: false,
            meta: EntryMeta::default(),
        }
    }

    pub fn with_meta(mut self, meta: EntryMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn confirmed(mut self) -> Self {
        self.confirmed = true;
        self
    }

    fn same_content(&self, other: &TranscriptEntry) -> bool {
        self.kind == other.kind
            && self.role == other.role
            && self.text == other.text
            && self.confirmed == other.confirmed
            && self.meta == other.meta
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    Unchanged,
}

/// The ordered, append-only view of one agent's conversation.
///
/// Identity is the entry id: writing an id that already exists replaces the
/// entry in place and keeps its sequence key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentTranscript {
    entries: Vec<TranscriptEntry>,
    next_sequence: u64,
}

impl AgentTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, entry_id: &str) -> Option<&TranscriptEntry> {
        self.entries.iter().find(|entry| entry.entry_id == entry_id)
    }

    pub fn upsert(&mut self, mut entry: TranscriptEntry) -> UpsertOutcome {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|existing| existing.entry_id == entry.entry_id)
        {
            if existing.same_content(&entry) {
                return UpsertOutcome::Unchanged;
            }
            entry.sequence_key = existing.sequence_key;
            *existing = entry;
            return UpsertOutcome::Replaced;
        }
        entry.sequence_key = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push(entry);
        UpsertOutcome::Inserted
    }

    /// First entry of `kind` produced by `run_id`, whatever its id is now.
    pub fn find_run_entry(&self, run_id: &str, kind: EntryKind) -> Option<&TranscriptEntry> {
        self.entries
            .iter()
            .find(|entry| entry.kind == kind && entry.meta.run_id.as_deref() == Some(run_id))
    }

    /// Entries the server has not echoed back through history yet.
    pub fn pending(&self) -> Vec<TranscriptEntry> {
        self.entries
            .iter()
            .filter(|entry| !entry.confirmed)
            .cloned()
            .collect()
    }

    /// True when `entries` would leave the transcript as it is, ignoring sequence keys.
    pub fn matches(&self, entries: &[TranscriptEntry]) -> bool {
        self.entries.len() == entries.len()
            && self
                .entries
                .iter()
                .zip(entries)
                .all(|(left, right)| left.entry_id == right.entry_id && left.same_content(right))
    }

    /// Replaces the whole transcript, renumbering sequence keys in the given order.
    pub fn replace_all(&mut self, entries: Vec<TranscriptEntry>) {
        self.entries = entries;
        for (index, entry) in self.entries.iter_mut().enumerate() {
            entry.sequence_key = index as u64;
        }
        self.next_sequence = self.entries.len() as u64;
    }
}

/// Canonical one-line rendering of a tool call. Live tool events and
/// historized tool calls must format identically so the history merge can
/// match them.
pub fn tool_call_line(name: &str, arguments: &Value) -> String {
    let args = match arguments {
        Value::Null => String::new(),
        Value::Object(map) if map.is_empty() => String::new(),
        other => other.to_string(),
    };
    let line = format!("{name}({args})");
    truncate_utf8(&line, MAX_TOOL_TEXT_BYTES).to_string()
}

pub fn tool_result_line(name: Option<&str>, text: &str) -> String {
    let line = format!("{} result: {}", name.unwrap_or("tool"), text.trim());
    truncate_utf8(&line, MAX_TOOL_TEXT_BYTES).to_string()
}

/// Meta line for a failed run; shared by live terminals and history.
pub fn error_line(message: Option<&str>) -> String {
    let message = message
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .unwrap_or("run failed");
    let line = format!("error: {message}");
    truncate_utf8(&line, MAX_TOOL_TEXT_BYTES).to_string()
}
