//! Per-agent run state machine.
//!
//! The engine is synchronous and clock-injected: callers hand it decoded
//! events, fetched history and session summaries together with `now`, and act
//! on the returned [`EngineEffect`]s. It performs no I/O of its own.

use crate::closed_runs::{ClosedRun, ClosedRunCache};
use crate::history::{entries_from_history, history_shows_completion, merge_pending};
use crate::refresh::SessionSummary;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::time::Duration;
use tether_core::events::ChatEvent;
use tether_core::text::{fingerprint, merge_stream_text};
use tether_core::transcript::{error_line, tool_call_line, tool_result_line, UpsertOutcome};
use tether_core::{
    AgentTranscript, ChatMessage, EntryKind, EntryMeta, EntrySource, GatewayEvent, StreamKind,
    TranscriptEntry,
};
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_CLOSED_RUN_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_CLOSED_RUN_CAPACITY: usize = 512;
pub const DEFAULT_OBSERVATION_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub closed_run_ttl: Duration,
    pub closed_run_capacity: usize,
    pub observation_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            closed_run_ttl: DEFAULT_CLOSED_RUN_TTL,
            closed_run_capacity: DEFAULT_CLOSED_RUN_CAPACITY,
            observation_capacity: DEFAULT_OBSERVATION_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Running,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Running => "running",
            AgentStatus::Error => "error",
        }
    }
}

/// Why the engine wants the authoritative history refetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResyncReason {
    MissingReasoning,
    CompetingRun,
    SequenceGap,
    Reconnected,
    SummaryMismatch,
    Requested,
}

impl ResyncReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResyncReason::MissingReasoning => "missing_reasoning",
            ResyncReason::CompetingRun => "competing_run",
            ResyncReason::SequenceGap => "sequence_gap",
            ResyncReason::Reconnected => "reconnected",
            ResyncReason::SummaryMismatch => "summary_mismatch",
            ResyncReason::Requested => "requested",
        }
    }
}

/// Provisional streamed text for an agent's active run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveStream {
    pub agent: String,
    pub run_id: String,
    pub assistant: String,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEffect {
    Live(LiveStream),
    LiveCleared { agent: String, run_id: String },
    TranscriptChanged { agent: String },
    StatusChanged { agent: String, status: AgentStatus },
    ResyncRequested { agent: String, reason: ResyncReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationKind {
    /// An accepted chat terminal was replaced by one with a higher seq.
    /// The observation carries the seq that lost.
    Superseded,
    /// A terminal at or below the run's watermark.
    Stale,
    /// A lifecycle terminal that arrived after the chat terminal won.
    Shadowed,
}

/// A terminal event that did not become (or stopped being) the run's
/// canonical entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalObservation {
    pub agent: String,
    pub run_id: String,
    pub event: &'static str,
    pub seq: u64,
    pub kind: ObservationKind,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct RunState {
    run_id: String,
    started_at: DateTime<Utc>,
    assistant: String,
    reasoning: String,
    reasoning_started_at: Option<DateTime<Utc>>,
    tool_lines: HashSet<String>,
}

impl RunState {
    fn new(run_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            run_id: run_id.to_string(),
            started_at: now,
            assistant: String::new(),
            reasoning: String::new(),
            reasoning_started_at: None,
            tool_lines: HashSet::new(),
        }
    }

    fn merge(&mut self, stream: StreamKind, text: &str, now: DateTime<Utc>) -> bool {
        if text.is_empty() {
            return false;
        }
        let buffer = match stream {
            StreamKind::Assistant => &mut self.assistant,
            StreamKind::Reasoning => &mut self.reasoning,
        };
        let merged = merge_stream_text(buffer, text);
        if merged == *buffer {
            return false;
        }
        *buffer = merged;
        if stream == StreamKind::Reasoning && self.reasoning_started_at.is_none() {
            self.reasoning_started_at = Some(now);
        }
        true
    }

    fn live(&self, agent: &str) -> LiveStream {
        LiveStream {
            agent: agent.to_string(),
            run_id: self.run_id.clone(),
            assistant: self.assistant.clone(),
            reasoning: self.reasoning.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentState {
    session_key: String,
    status: AgentStatus,
    transcript: AgentTranscript,
    active: Option<RunState>,
    last_history_sync_at: Option<DateTime<Utc>>,
    last_activity_at: Option<DateTime<Utc>>,
}

impl AgentState {
    fn new(session_key: &str) -> Self {
        Self {
            session_key: session_key.to_string(),
            status: AgentStatus::Idle,
            transcript: AgentTranscript::new(),
            active: None,
            last_history_sync_at: None,
            last_activity_at: None,
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn transcript(&self) -> &AgentTranscript {
        &self.transcript
    }

    pub fn active_run_id(&self) -> Option<&str> {
        self.active.as_ref().map(|run| run.run_id.as_str())
    }

    pub fn last_history_sync_at(&self) -> Option<DateTime<Utc>> {
        self.last_history_sync_at
    }

    pub fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        self.last_activity_at
    }

    fn set_status(&mut self, status: AgentStatus, effects: &mut Vec<EngineEffect>) {
        if self.status == status {
            return;
        }
        self.status = status;
        effects.push(EngineEffect::StatusChanged {
            agent: self.session_key.clone(),
            status,
        });
    }

    /// Writes the single `kind` entry a run owns. An entry the run already
    /// produced keeps its id and position, even if history renamed it.
    fn write_run_entry(
        &mut self,
        run_id: &str,
        kind: EntryKind,
        text: &str,
        meta: EntryMeta,
        now: DateTime<Utc>,
    ) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        let (entry_id, timestamp_ms, confirmed) = match self.transcript.find_run_entry(run_id, kind) {
            Some(existing) => (
                existing.entry_id.clone(),
                existing.timestamp_ms,
                existing.confirmed && existing.text == text,
            ),
            None => (run_entry_id(run_id, kind), now.timestamp_millis(), false),
        };
        let role = match kind {
            EntryKind::Meta => "system",
            _ => "assistant",
        };
        let mut entry = TranscriptEntry::new(kind, role, text, entry_id, timestamp_ms).with_meta(meta);
        entry.confirmed = confirmed;
        self.transcript.upsert(entry) != UpsertOutcome::Unchanged
    }
}

fn run_entry_id(run_id: &str, kind: EntryKind) -> String {
    match kind {
        EntryKind::Meta => format!("run:{run_id}:error"),
        other => format!("run:{run_id}:{}", other.as_str()),
    }
}

fn message_parts(message: Option<&ChatMessage>) -> (String, String) {
    message
        .map(|message| (message.text(), message.thinking()))
        .unwrap_or_default()
}

fn prefer(primary: String, fallback: &str) -> String {
    if primary.trim().is_empty() {
        fallback.to_string()
    } else {
        primary
    }
}

/// Admission: what may open a run on an agent with no active run.
fn opens_run(event: &GatewayEvent) -> bool {
    matches!(
        event,
        GatewayEvent::LifecycleStart(_)
            | GatewayEvent::ChatDelta(_)
            | GatewayEvent::AgentStreamDelta(_)
            | GatewayEvent::ChatFinal(_)
    )
}

struct Terminal {
    source: EntrySource,
    seq: u64,
    status: AgentStatus,
    assistant: String,
    thinking: String,
    error: Option<String>,
}

impl Terminal {
    fn from_event(event: &GatewayEvent, run: &RunState) -> Option<Self> {
        let chat = |chat: &ChatEvent, status: AgentStatus| {
            let (text, thinking) = message_parts(chat.message.as_ref());
            Terminal {
                source: EntrySource::Chat,
                seq: chat.seq,
                status,
                assistant: prefer(text, &run.assistant),
                thinking: prefer(thinking, &run.reasoning),
                error: None,
            }
        };
        match event {
            GatewayEvent::ChatFinal(event) | GatewayEvent::ChatAborted(event) => {
                Some(chat(event, AgentStatus::Idle))
            }
            GatewayEvent::ChatError(event) => {
                let reason = event.error_message.as_deref().or_else(|| {
                    event
                        .message
                        .as_ref()
                        .and_then(|message| message.error_message.as_deref())
                });
                Some(Terminal {
                    error: Some(error_line(reason)),
                    ..chat(event, AgentStatus::Error)
                })
            }
            GatewayEvent::LifecycleEnd(event) => Some(Terminal {
                source: EntrySource::Lifecycle,
                seq: event.seq,
                status: AgentStatus::Idle,
                assistant: run.assistant.clone(),
                thinking: run.reasoning.clone(),
                error: None,
            }),
            GatewayEvent::LifecycleError(event) => Some(Terminal {
                source: EntrySource::Lifecycle,
                seq: event.seq,
                status: AgentStatus::Error,
                assistant: run.assistant.clone(),
                thinking: run.reasoning.clone(),
                error: Some(error_line(event.error.as_deref())),
            }),
            _ => None,
        }
    }
}

/// Owns every agent's run state, the closed-run cache and the terminal
/// observation ring.
#[derive(Debug)]
pub struct ReconciliationEngine {
    config: EngineConfig,
    agents: BTreeMap<String, AgentState>,
    closed: ClosedRunCache,
    observations: VecDeque<TerminalObservation>,
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl ReconciliationEngine {
    pub fn new(config: EngineConfig) -> Self {
        let ttl = chrono::Duration::from_std(config.closed_run_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        Self {
            closed: ClosedRunCache::new(ttl, config.closed_run_capacity),
            agents: BTreeMap::new(),
            observations: VecDeque::new(),
            config,
        }
    }

    /// Starts tracking `session_key`. Returns false when already tracked.
    pub fn track_agent(&mut self, session_key: &str) -> bool {
        if self.agents.contains_key(session_key) {
            return false;
        }
        self.agents
            .insert(session_key.to_string(), AgentState::new(session_key));
        true
    }

    pub fn agent(&self, session_key: &str) -> Option<&AgentState> {
        self.agents.get(session_key)
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentState> {
        self.agents.values()
    }

    pub fn observations(&self) -> &VecDeque<TerminalObservation> {
        &self.observations
    }

    pub fn live(&self, session_key: &str) -> Option<LiveStream> {
        let agent = self.agents.get(session_key)?;
        agent.active.as_ref().map(|run| run.live(session_key))
    }

    pub fn apply_event(&mut self, event: &GatewayEvent, now: DateTime<Utc>) -> Vec<EngineEffect> {
        let run_id = event.run_id();
        if let Some(closed) = self.closed.get_mut(run_id, now).cloned() {
            return self.apply_to_closed_run(event, closed, now);
        }
        let Some(agent_key) = self.route(event) else {
            debug!(event = "engine_event_unrouted", run_id, kind = event.name());
            return Vec::new();
        };

        let mut effects = Vec::new();
        let agent = self
            .agents
            .entry(agent_key.clone())
            .or_insert_with(|| AgentState::new(&agent_key));
        agent.last_activity_at = Some(now);

        match agent.active_run_id() {
            Some(active) if active == run_id => {}
            Some(active) => {
                debug!(
                    event = "engine_event_discarded",
                    agent = %agent_key,
                    run_id,
                    active_run_id = active,
                    kind = event.name()
                );
                if matches!(event, GatewayEvent::LifecycleStart(_)) {
                    effects.push(EngineEffect::ResyncRequested {
                        agent: agent_key,
                        reason: ResyncReason::CompetingRun,
                    });
                }
                return effects;
            }
            None => {
                if !opens_run(event) {
                    debug!(
                        event = "engine_event_without_run",
                        agent = %agent_key,
                        run_id,
                        kind = event.name()
                    );
                    return effects;
                }
                agent.active = Some(RunState::new(run_id, now));
                if !event.is_terminal() {
                    agent.set_status(AgentStatus::Running, &mut effects);
                }
                info!(
                    event = "engine_run_opened",
                    agent = %agent_key,
                    run_id,
                    opened_by = event.name()
                );
            }
        }

        if event.is_terminal() {
            let Some(run) = agent.active.take() else {
                return effects;
            };
            if let Some(closed) = close_run(agent, run, event, now, &mut effects) {
                self.closed.insert(run_id, closed, now);
            }
            return effects;
        }

        let Some(run) = agent.active.as_mut() else {
            return effects;
        };
        match event {
            GatewayEvent::ChatDelta(chat) => {
                let (text, thinking) = message_parts(chat.message.as_ref());
                let reasoning = run.merge(StreamKind::Reasoning, &thinking, now);
                let assistant = run.merge(StreamKind::Assistant, &text, now);
                if reasoning || assistant {
                    effects.push(EngineEffect::Live(run.live(&agent_key)));
                }
            }
            GatewayEvent::AgentStreamDelta(delta) => {
                if run.merge(delta.stream, &delta.text, now) {
                    effects.push(EngineEffect::Live(run.live(&agent_key)));
                }
            }
            GatewayEvent::AgentToolCall(tool) | GatewayEvent::AgentToolResult(tool) => {
                let (phase, line) = if matches!(event, GatewayEvent::AgentToolCall(_)) {
                    ("call", tool_call_line(&tool.name, &tool.arguments))
                } else {
                    (
                        "result",
                        tool_result_line(Some(&tool.name), tool.result.as_deref().unwrap_or_default()),
                    )
                };
                let key = fingerprint(&[phase, tool.tool_call_id.as_deref().unwrap_or_default(), &line]);
                if !run.tool_lines.insert(key.clone()) {
                    debug!(event = "engine_tool_line_duplicate", agent = %agent_key, run_id);
                    return effects;
                }
                let entry = TranscriptEntry::new(
                    EntryKind::Tool,
                    "tool",
                    line,
                    format!("run:{run_id}:tool:{key}"),
                    now.timestamp_millis(),
                )
                .with_meta(EntryMeta {
                    run_id: Some(run_id.to_string()),
                    source: Some(EntrySource::Lifecycle),
                    ..EntryMeta::default()
                });
                agent.transcript.upsert(entry);
                effects.push(EngineEffect::TranscriptChanged { agent: agent_key });
            }
            _ => {}
        }
        effects
    }

    /// Merges fetched history into `session_key`'s transcript and heals a
    /// run whose terminal event was missed.
    pub fn apply_history(
        &mut self,
        session_key: &str,
        messages: &[ChatMessage],
        now: DateTime<Utc>,
    ) -> Vec<EngineEffect> {
        let mut effects = Vec::new();
        let agent = self
            .agents
            .entry(session_key.to_string())
            .or_insert_with(|| AgentState::new(session_key));

        let merged = merge_pending(entries_from_history(messages), agent.transcript.entries());
        if !agent.transcript.matches(&merged) {
            agent.transcript.replace_all(merged);
            effects.push(EngineEffect::TranscriptChanged {
                agent: session_key.to_string(),
            });
        }
        agent.last_history_sync_at = Some(now);

        let completed = agent.status == AgentStatus::Running
            && agent.active.as_ref().is_some_and(|run| {
                history_shows_completion(messages, run.started_at.timestamp_millis())
            });
        if completed {
            if let Some(run) = agent.active.take() {
                info!(
                    event = "engine_run_closed_by_history",
                    agent = session_key,
                    run_id = %run.run_id
                );
                effects.push(EngineEffect::LiveCleared {
                    agent: session_key.to_string(),
                    run_id: run.run_id.clone(),
                });
                agent.set_status(AgentStatus::Idle, &mut effects);
                self.closed.insert(
                    &run.run_id,
                    ClosedRun {
                        agent: session_key.to_string(),
                        chat_seq: None,
                        lifecycle_seq: None,
                        source: EntrySource::History,
                    },
                    now,
                );
            }
        }
        effects
    }

    /// Flags tracked agents whose server summary disagrees with local state.
    pub fn apply_summary(&self, summaries: &[SessionSummary]) -> Vec<EngineEffect> {
        let mut effects = Vec::new();
        for summary in summaries {
            let Some(agent) = self.agents.get(&summary.key) else {
                continue;
            };
            let newer = match (summary.updated_at_ms, agent.last_history_sync_at) {
                (_, None) => true,
                (Some(updated), Some(synced)) => updated > synced.timestamp_millis(),
                (None, Some(_)) => false,
            };
            let running_mismatch = summary
                .running
                .is_some_and(|running| running != (agent.status == AgentStatus::Running));
            if newer || running_mismatch {
                debug!(
                    event = "engine_summary_mismatch",
                    agent = %summary.key,
                    newer,
                    running_mismatch
                );
                effects.push(EngineEffect::ResyncRequested {
                    agent: summary.key.clone(),
                    reason: ResyncReason::SummaryMismatch,
                });
            }
        }
        effects
    }

    pub fn resync_all(&self, reason: ResyncReason) -> Vec<EngineEffect> {
        self.agents
            .keys()
            .map(|agent| EngineEffect::ResyncRequested {
                agent: agent.clone(),
                reason,
            })
            .collect()
    }

    /// Adds an optimistic user line; history confirms it later.
    pub fn record_local_user_message(
        &mut self,
        session_key: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> (String, Vec<EngineEffect>) {
        let entry_id = format!("local:{}", Uuid::new_v4());
        let agent = self
            .agents
            .entry(session_key.to_string())
            .or_insert_with(|| AgentState::new(session_key));
        agent.last_activity_at = Some(now);
        agent.transcript.upsert(
            TranscriptEntry::new(EntryKind::User, "user", text.trim(), entry_id.clone(), now.timestamp_millis())
                .with_meta(EntryMeta {
                    source: Some(EntrySource::Local),
                    ..EntryMeta::default()
                }),
        );
        let effects = vec![EngineEffect::TranscriptChanged {
            agent: session_key.to_string(),
        }];
        (entry_id, effects)
    }

    fn route(&self, event: &GatewayEvent) -> Option<String> {
        let run_id = event.run_id();
        self.agents
            .values()
            .find(|agent| agent.active_run_id() == Some(run_id))
            .map(|agent| agent.session_key.clone())
            .or_else(|| {
                event
                    .session_key()
                    .filter(|key| !key.trim().is_empty())
                    .map(str::to_string)
            })
    }

    fn apply_to_closed_run(
        &mut self,
        event: &GatewayEvent,
        mut closed: ClosedRun,
        now: DateTime<Utc>,
    ) -> Vec<EngineEffect> {
        let mut effects = Vec::new();
        let run_id = event.run_id();
        let seq = event.seq();
        if !event.is_terminal() {
            debug!(event = "engine_closed_run_event_dropped", run_id, kind = event.name());
            return effects;
        }
        let Some(agent) = self.agents.get_mut(&closed.agent) else {
            return effects;
        };

        let observation = match event {
            GatewayEvent::ChatFinal(chat) => match (closed.source, closed.chat_seq) {
                (EntrySource::History, _) => Some((ObservationKind::Stale, seq)),
                (_, Some(previous)) if seq <= previous => Some((ObservationKind::Stale, seq)),
                (_, previous) => {
                    rewrite_chat_final(agent, run_id, chat, now, &mut effects);
                    closed.chat_seq = Some(seq);
                    closed.source = EntrySource::Chat;
                    previous.map(|previous| (ObservationKind::Superseded, previous))
                }
            },
            GatewayEvent::LifecycleEnd(_) | GatewayEvent::LifecycleError(_) => {
                if closed.source == EntrySource::Chat {
                    Some((ObservationKind::Shadowed, seq))
                } else {
                    Some((ObservationKind::Stale, seq))
                }
            }
            // Late chat aborted/error is stale for every closed run,
            // lifecycle-closed ones included.
            _ => Some((ObservationKind::Stale, seq)),
        };

        let agent_key = closed.agent.clone();
        if let Some(slot) = self.closed.get_mut(run_id, now) {
            *slot = closed;
        }
        if let Some((kind, seq)) = observation {
            self.observe(TerminalObservation {
                agent: agent_key,
                run_id: run_id.to_string(),
                event: event.name(),
                seq,
                kind,
                observed_at: now,
            });
        }
        effects
    }

    fn observe(&mut self, observation: TerminalObservation) {
        debug!(
            event = "engine_terminal_observed",
            agent = %observation.agent,
            run_id = %observation.run_id,
            kind = ?observation.kind,
            seq = observation.seq,
            terminal = observation.event
        );
        self.observations.push_back(observation);
        while self.observations.len() > self.config.observation_capacity {
            self.observations.pop_front();
        }
    }
}

fn close_run(
    agent: &mut AgentState,
    run: RunState,
    event: &GatewayEvent,
    now: DateTime<Utc>,
    effects: &mut Vec<EngineEffect>,
) -> Option<ClosedRun> {
    let terminal = Terminal::from_event(event, &run)?;
    let duration_ms = run
        .reasoning_started_at
        .map(|started| (now - started).num_milliseconds().max(0) as u64);
    let meta = EntryMeta {
        run_id: Some(run.run_id.clone()),
        source: Some(terminal.source),
        thinking_duration_ms: None,
        terminal_seq: Some(terminal.seq),
    };

    let mut changed =
        agent.write_run_entry(&run.run_id, EntryKind::Thinking, &terminal.thinking, meta.clone(), now);
    changed |= agent.write_run_entry(
        &run.run_id,
        EntryKind::Assistant,
        &terminal.assistant,
        EntryMeta {
            thinking_duration_ms: duration_ms,
            ..meta.clone()
        },
        now,
    );
    if let Some(error) = &terminal.error {
        changed |= agent.write_run_entry(&run.run_id, EntryKind::Meta, error, meta, now);
    }

    effects.push(EngineEffect::LiveCleared {
        agent: agent.session_key.clone(),
        run_id: run.run_id.clone(),
    });
    if changed {
        effects.push(EngineEffect::TranscriptChanged {
            agent: agent.session_key.clone(),
        });
    }
    agent.set_status(terminal.status, effects);
    if matches!(event, GatewayEvent::ChatFinal(_) | GatewayEvent::LifecycleEnd(_))
        && terminal.thinking.trim().is_empty()
        && !terminal.assistant.trim().is_empty()
    {
        effects.push(EngineEffect::ResyncRequested {
            agent: agent.session_key.clone(),
            reason: ResyncReason::MissingReasoning,
        });
    }
    info!(
        event = "engine_run_closed",
        agent = %agent.session_key,
        run_id = %run.run_id,
        terminal = event.name(),
        seq = terminal.seq,
        status = terminal.status.as_str()
    );

    let (chat_seq, lifecycle_seq) = match terminal.source {
        EntrySource::Chat => (Some(terminal.seq), None),
        _ => (None, Some(terminal.seq)),
    };
    Some(ClosedRun {
        agent: agent.session_key.clone(),
        chat_seq,
        lifecycle_seq,
        source: terminal.source,
    })
}

/// Replaces a closed run's text with a later chat final, keeping the
/// reasoning duration measured while the run was live.
fn rewrite_chat_final(
    agent: &mut AgentState,
    run_id: &str,
    chat: &ChatEvent,
    now: DateTime<Utc>,
    effects: &mut Vec<EngineEffect>,
) {
    let (text, thinking) = message_parts(chat.message.as_ref());
    let existing = agent.transcript.find_run_entry(run_id, EntryKind::Assistant);
    let duration_ms = existing.and_then(|entry| entry.meta.thinking_duration_ms);
    let text = match existing {
        Some(entry) if text.trim().is_empty() => entry.text.clone(),
        _ => text,
    };
    let meta = EntryMeta {
        run_id: Some(run_id.to_string()),
        source: Some(EntrySource::Chat),
        thinking_duration_ms: None,
        terminal_seq: Some(chat.seq),
    };
    let mut changed = agent.write_run_entry(run_id, EntryKind::Thinking, &thinking, meta.clone(), now);
    changed |= agent.write_run_entry(
        run_id,
        EntryKind::Assistant,
        &text,
        EntryMeta {
            thinking_duration_ms: duration_ms,
            ..meta
        },
        now,
    );
    if changed {
        effects.push(EngineEffect::TranscriptChanged {
            agent: agent.session_key.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::{json, Value};
    use tether_core::events::{decode_agent_event, decode_chat_event};

    const BASE_MS: i64 = 1_700_000_000_000;

    fn at(offset_ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(BASE_MS + offset_ms)
            .single()
            .expect("valid timestamp")
    }

    fn chat(state: &str, run_id: &str, seq: u64, message: Value) -> GatewayEvent {
        decode_chat_event(
            &json!({"runId": run_id, "sessionKey": "main", "state": state, "seq": seq, "message": message}),
            None,
        )
        .expect("chat event")
    }

    fn reply(text: &str) -> Value {
        json!({"role": "assistant", "content": text, "thinking": "considered"})
    }

    fn agent_event(stream: &str, run_id: &str, seq: u64, data: Value) -> GatewayEvent {
        decode_agent_event(
            &json!({"runId": run_id, "sessionKey": "main", "stream": stream, "seq": seq, "data": data}),
            None,
        )
        .expect("agent event")
    }

    fn start(run_id: &str, seq: u64) -> GatewayEvent {
        agent_event("lifecycle", run_id, seq, json!({"phase": "start"}))
    }

    fn history_message(value: Value) -> ChatMessage {
        ChatMessage::from_value(&value).expect("message")
    }

    fn live_text(effects: &[EngineEffect]) -> Option<String> {
        effects.iter().find_map(|effect| match effect {
            EngineEffect::Live(live) => Some(live.assistant.clone()),
            _ => None,
        })
    }

    fn entries_of(engine: &ReconciliationEngine, kind: EntryKind) -> Vec<TranscriptEntry> {
        engine
            .agent("main")
            .expect("agent")
            .transcript()
            .entries()
            .iter()
            .filter(|entry| entry.kind == kind)
            .cloned()
            .collect()
    }

    fn status_of(engine: &ReconciliationEngine) -> AgentStatus {
        engine.agent("main").expect("agent").status()
    }

    #[test]
    fn streamed_run_settles_into_one_assistant_entry() {
        let mut engine = ReconciliationEngine::default();
        let effects = engine.apply_event(
            &chat("delta", "r1", 1, json!({"role": "assistant", "content": "Hel"})),
            at(0),
        );
        assert_eq!(live_text(&effects).as_deref(), Some("Hel"));
        assert!(effects.contains(&EngineEffect::StatusChanged {
            agent: "main".to_string(),
            status: AgentStatus::Running,
        }));

        let effects = engine.apply_event(
            &chat("delta", "r1", 2, json!({"role": "assistant", "content": "Hello"})),
            at(10),
        );
        assert_eq!(live_text(&effects).as_deref(), Some("Hello"));

        let effects = engine.apply_event(&chat("final", "r1", 3, reply("Hello world")), at(20));
        assert!(effects.contains(&EngineEffect::LiveCleared {
            agent: "main".to_string(),
            run_id: "r1".to_string(),
        }));
        assert!(effects.contains(&EngineEffect::StatusChanged {
            agent: "main".to_string(),
            status: AgentStatus::Idle,
        }));

        let assistants = entries_of(&engine, EntryKind::Assistant);
        assert_eq!(assistants.len(), 1);
        assert_eq!(assistants[0].text, "Hello world");
        assert_eq!(assistants[0].entry_id, "run:r1:assistant");
        assert_eq!(status_of(&engine), AgentStatus::Idle);
        assert!(engine.live("main").is_none());
    }

    #[test]
    fn any_delta_interleaving_settles_into_one_assistant_entry() {
        let orderings: [&[(&str, &str)]; 6] = [
            &[("chat", "Hel"), ("chat", "Hello"), ("chat", "Hello world")],
            &[("chat", "Hel"), ("agent", "lo"), ("agent", " world")],
            &[("agent", "Hello"), ("chat", "Hel"), ("chat", "Hello world")],
            &[("chat", "Hello world"), ("agent", "Hello world")],
            &[("agent", "Hello"), ("agent", "lo"), ("chat", " world")],
            &[("agent", "Hel"), ("chat", "Hello"), ("agent", " world")],
        ];
        for (case, deltas) in orderings.iter().enumerate() {
            let mut engine = ReconciliationEngine::default();
            let mut seq = 0;
            for (channel, text) in deltas.iter() {
                seq += 1;
                let event = if *channel == "chat" {
                    chat("delta", "r1", seq, json!({"role": "assistant", "content": text}))
                } else {
                    agent_event("assistant", "r1", seq, json!({"text": text}))
                };
                engine.apply_event(&event, at(seq as i64));
            }
            assert_eq!(
                engine.live("main").map(|live| live.assistant).as_deref(),
                Some("Hello world"),
                "case {case}"
            );

            seq += 1;
            let terminal = if case % 2 == 0 {
                chat("final", "r1", seq, reply("Hello world"))
            } else {
                agent_event("lifecycle", "r1", seq, json!({"phase": "end"}))
            };
            engine.apply_event(&terminal, at(100));
            engine.apply_event(&terminal, at(200));

            let assistants = entries_of(&engine, EntryKind::Assistant);
            assert_eq!(assistants.len(), 1, "case {case}");
            assert_eq!(assistants[0].text, "Hello world", "case {case}");
            assert_eq!(status_of(&engine), AgentStatus::Idle, "case {case}");
            assert!(engine.live("main").is_none(), "case {case}");
        }
    }

    #[test]
    fn replayed_terminal_is_a_no_op() {
        let mut engine = ReconciliationEngine::default();
        engine.apply_event(&start("r1", 1), at(0));
        engine.apply_event(&chat("final", "r1", 5, reply("done")), at(10));
        let before = engine.agent("main").expect("agent").transcript().clone();

        let effects = engine.apply_event(&chat("final", "r1", 5, reply("done")), at(20));
        assert!(effects.is_empty());
        assert_eq!(engine.agent("main").expect("agent").transcript(), &before);
        assert_eq!(engine.observations().len(), 1);
        assert_eq!(engine.observations()[0].kind, ObservationKind::Stale);
    }

    #[test]
    fn higher_seq_final_supersedes_and_lower_is_stale() {
        let mut engine = ReconciliationEngine::default();
        engine.apply_event(&chat("final", "r1", 3, reply("first")), at(0));
        engine.apply_event(&chat("final", "r1", 4, reply("second")), at(10));
        engine.apply_event(&chat("final", "r1", 3, reply("first")), at(20));

        let assistants = entries_of(&engine, EntryKind::Assistant);
        assert_eq!(assistants.len(), 1);
        assert_eq!(assistants[0].text, "second");
        assert_eq!(assistants[0].meta.terminal_seq, Some(4));

        let observed = engine
            .observations()
            .iter()
            .map(|observation| (observation.kind, observation.seq))
            .collect::<Vec<_>>();
        assert_eq!(
            observed,
            vec![(ObservationKind::Superseded, 3), (ObservationKind::Stale, 3)]
        );
    }

    #[test]
    fn chat_final_replaces_lifecycle_fallback() {
        let mut engine = ReconciliationEngine::default();
        engine.apply_event(&start("r1", 1), at(0));
        engine.apply_event(&agent_event("assistant", "r1", 2, json!({"text": "provisional"})), at(5));
        engine.apply_event(&agent_event("lifecycle", "r1", 3, json!({"phase": "end"})), at(10));

        let provisional = entries_of(&engine, EntryKind::Assistant);
        assert_eq!(provisional.len(), 1);
        assert_eq!(provisional[0].meta.source, Some(EntrySource::Lifecycle));

        let effects = engine.apply_event(&chat("final", "r1", 1, reply("canonical")), at(20));
        assert!(effects.contains(&EngineEffect::TranscriptChanged {
            agent: "main".to_string()
        }));
        let assistants = entries_of(&engine, EntryKind::Assistant);
        assert_eq!(assistants.len(), 1);
        assert_eq!(assistants[0].text, "canonical");
        assert_eq!(assistants[0].entry_id, "run:r1:assistant");
        assert_eq!(assistants[0].meta.source, Some(EntrySource::Chat));
        assert!(engine.observations().is_empty());
    }

    #[test]
    fn lifecycle_terminal_after_chat_final_is_shadowed() {
        let mut engine = ReconciliationEngine::default();
        engine.apply_event(&start("r1", 1), at(0));
        engine.apply_event(&chat("final", "r1", 2, reply("answer")), at(10));
        let effects =
            engine.apply_event(&agent_event("lifecycle", "r1", 3, json!({"phase": "end"})), at(20));

        assert!(effects.is_empty());
        assert_eq!(entries_of(&engine, EntryKind::Assistant)[0].text, "answer");
        assert_eq!(engine.observations()[0].kind, ObservationKind::Shadowed);
    }

    #[test]
    fn competing_run_is_discarded_and_requests_resync() {
        let mut engine = ReconciliationEngine::default();
        engine.apply_event(&start("r1", 1), at(0));
        let effects = engine.apply_event(&start("r2", 2), at(10));
        assert_eq!(
            effects,
            vec![EngineEffect::ResyncRequested {
                agent: "main".to_string(),
                reason: ResyncReason::CompetingRun,
            }]
        );

        let effects = engine.apply_event(
            &chat("delta", "r2", 3, json!({"role": "assistant", "content": "intruder"})),
            at(20),
        );
        assert!(effects.is_empty());
        assert_eq!(engine.agent("main").expect("agent").active_run_id(), Some("r1"));
    }

    #[test]
    fn tool_lines_are_deduplicated_per_run() {
        let mut engine = ReconciliationEngine::default();
        engine.apply_event(&start("r1", 1), at(0));
        let call = agent_event(
            "tool",
            "r1",
            2,
            json!({"phase": "start", "name": "read", "toolCallId": "t1", "args": {"path": "a"}}),
        );
        let result = agent_event(
            "tool",
            "r1",
            3,
            json!({"phase": "result", "name": "read", "toolCallId": "t1", "result": "body"}),
        );
        engine.apply_event(&call, at(1));
        assert!(engine.apply_event(&call, at(2)).is_empty());
        engine.apply_event(&result, at(3));
        engine.apply_event(&result, at(4));

        let tools = entries_of(&engine, EntryKind::Tool);
        let lines = tools.iter().map(|entry| entry.text.as_str()).collect::<Vec<_>>();
        assert_eq!(lines, vec![r#"read({"path":"a"})"#, "read result: body"]);
    }

    #[test]
    fn tool_event_without_open_run_is_discarded() {
        let mut engine = ReconciliationEngine::default();
        engine.track_agent("main");
        let effects = engine.apply_event(
            &agent_event("tool", "r9", 1, json!({"phase": "start", "name": "ls"})),
            at(0),
        );
        assert!(effects.is_empty());
        assert!(engine.agent("main").expect("agent").transcript().is_empty());
        assert_eq!(status_of(&engine), AgentStatus::Idle);
    }

    #[test]
    fn final_without_reasoning_requests_resync() {
        let mut engine = ReconciliationEngine::default();
        let effects = engine.apply_event(
            &chat("final", "r1", 1, json!({"role": "assistant", "content": "plain"})),
            at(0),
        );
        assert!(effects.contains(&EngineEffect::ResyncRequested {
            agent: "main".to_string(),
            reason: ResyncReason::MissingReasoning,
        }));

        let effects = engine.apply_event(&chat("final", "r2", 1, reply("reasoned")), at(10));
        assert!(!effects
            .iter()
            .any(|effect| matches!(effect, EngineEffect::ResyncRequested { .. })));
    }

    #[test]
    fn lifecycle_end_with_only_streamed_text_requests_resync() {
        let mut engine = ReconciliationEngine::default();
        engine.apply_event(&start("r1", 1), at(0));
        engine.apply_event(&agent_event("assistant", "r1", 2, json!({"text": "provisional"})), at(5));
        let effects =
            engine.apply_event(&agent_event("lifecycle", "r1", 3, json!({"phase": "end"})), at(10));
        assert!(effects.contains(&EngineEffect::ResyncRequested {
            agent: "main".to_string(),
            reason: ResyncReason::MissingReasoning,
        }));
        assert_eq!(entries_of(&engine, EntryKind::Assistant)[0].text, "provisional");

        engine.apply_event(&start("r2", 4), at(20));
        engine.apply_event(&agent_event("reasoning", "r2", 5, json!({"text": "hmm"})), at(25));
        engine.apply_event(&agent_event("assistant", "r2", 6, json!({"text": "thought"})), at(30));
        let effects =
            engine.apply_event(&agent_event("lifecycle", "r2", 7, json!({"phase": "end"})), at(40));
        assert!(!effects
            .iter()
            .any(|effect| matches!(effect, EngineEffect::ResyncRequested { .. })));
    }

    #[test]
    fn late_chat_error_after_lifecycle_end_is_stale() {
        let mut engine = ReconciliationEngine::default();
        engine.apply_event(&start("r1", 1), at(0));
        engine.apply_event(&agent_event("assistant", "r1", 2, json!({"text": "done"})), at(5));
        engine.apply_event(&agent_event("lifecycle", "r1", 3, json!({"phase": "end"})), at(10));

        let late = decode_chat_event(
            &json!({"runId": "r1", "sessionKey": "main", "state": "error", "seq": 4, "errorMessage": "boom"}),
            None,
        )
        .expect("chat error");
        let effects = engine.apply_event(&late, at(20));
        assert!(effects.is_empty());
        assert_eq!(status_of(&engine), AgentStatus::Idle);
        assert!(entries_of(&engine, EntryKind::Meta).is_empty());
        assert_eq!(entries_of(&engine, EntryKind::Assistant)[0].text, "done");
        let last = engine.observations().back().expect("observation");
        assert_eq!((last.kind, last.seq), (ObservationKind::Stale, 4));
    }

    #[test]
    fn reasoning_duration_is_attached_to_the_assistant_entry() {
        let mut engine = ReconciliationEngine::default();
        engine.apply_event(&start("r1", 1), at(0));
        engine.apply_event(&agent_event("reasoning", "r1", 2, json!({"text": "hmm"})), at(100));
        engine.apply_event(&agent_event("assistant", "r1", 3, json!({"text": "ok"})), at(500));
        engine.apply_event(&agent_event("lifecycle", "r1", 4, json!({"phase": "end"})), at(1_600));

        let thinking = entries_of(&engine, EntryKind::Thinking);
        assert_eq!(thinking.len(), 1);
        assert_eq!(thinking[0].text, "hmm");
        assert_eq!(thinking[0].entry_id, "run:r1:thinking");
        let assistant = entries_of(&engine, EntryKind::Assistant);
        assert_eq!(assistant[0].meta.thinking_duration_ms, Some(1_500));
    }

    #[test]
    fn error_terminal_sets_error_status_and_next_run_recovers() {
        let mut engine = ReconciliationEngine::default();
        engine.apply_event(&start("r1", 1), at(0));
        engine.apply_event(
            &agent_event("lifecycle", "r1", 2, json!({"phase": "error", "error": "boom"})),
            at(10),
        );
        assert_eq!(status_of(&engine), AgentStatus::Error);
        let errors = entries_of(&engine, EntryKind::Meta);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].text, "error: boom");
        assert_eq!(errors[0].entry_id, "run:r1:error");

        engine.apply_event(&start("r2", 3), at(20));
        assert_eq!(status_of(&engine), AgentStatus::Running);
    }

    #[test]
    fn closed_run_never_reopens() {
        let mut engine = ReconciliationEngine::default();
        engine.apply_event(&chat("final", "r1", 2, reply("done")), at(0));
        let effects = engine.apply_event(
            &chat("delta", "r1", 1, json!({"role": "assistant", "content": "late"})),
            at(10),
        );
        assert!(effects.is_empty());
        assert_eq!(status_of(&engine), AgentStatus::Idle);
        assert!(engine.live("main").is_none());
    }

    #[test]
    fn history_heals_a_run_whose_terminal_was_missed() {
        let mut engine = ReconciliationEngine::default();
        engine.apply_event(&start("r1", 1), at(1_000));
        let messages = vec![
            history_message(json!({"role": "user", "content": "q", "timestamp": BASE_MS + 900})),
            history_message(json!({"role": "assistant", "content": "answer", "timestamp": BASE_MS + 2_000})),
        ];
        let effects = engine.apply_history("main", &messages, at(3_000));
        assert!(effects.contains(&EngineEffect::StatusChanged {
            agent: "main".to_string(),
            status: AgentStatus::Idle,
        }));
        assert!(effects.contains(&EngineEffect::LiveCleared {
            agent: "main".to_string(),
            run_id: "r1".to_string(),
        }));
        assert_eq!(entries_of(&engine, EntryKind::Assistant)[0].text, "answer");

        let late = engine.apply_event(&chat("final", "r1", 4, reply("answer")), at(3_100));
        assert!(late.is_empty());
        assert_eq!(entries_of(&engine, EntryKind::Assistant).len(), 1);
    }

    #[test]
    fn unchanged_history_only_moves_sync_time() {
        let mut engine = ReconciliationEngine::default();
        let messages = vec![
            history_message(json!({"role": "user", "content": "q"})),
            history_message(json!({"role": "assistant", "content": "a"})),
        ];
        assert_eq!(engine.apply_history("main", &messages, at(0)).len(), 1);
        let effects = engine.apply_history("main", &messages, at(500));
        assert!(effects.is_empty());
        assert_eq!(
            engine.agent("main").expect("agent").last_history_sync_at(),
            Some(at(500))
        );
    }

    #[test]
    fn local_message_is_confirmed_by_history() {
        let mut engine = ReconciliationEngine::default();
        let (entry_id, effects) = engine.record_local_user_message("main", "hi there", at(0));
        assert!(entry_id.starts_with("local:"));
        assert_eq!(effects.len(), 1);
        let pending = entries_of(&engine, EntryKind::User);
        assert!(!pending[0].confirmed);

        engine.apply_history(
            "main",
            &[history_message(json!({"role": "user", "content": "hi\n  there"}))],
            at(100),
        );
        let users = entries_of(&engine, EntryKind::User);
        assert_eq!(users.len(), 1);
        assert!(users[0].confirmed);
    }

    #[test]
    fn summary_mismatch_requests_resync() {
        let mut engine = ReconciliationEngine::default();
        engine.apply_history("main", &[], at(0));
        engine.track_agent("other");

        let summary = |key: &str, updated: i64, running: Option<bool>| SessionSummary {
            key: key.to_string(),
            updated_at_ms: Some(BASE_MS + updated),
            running,
        };
        assert!(engine.apply_summary(&[summary("main", -10, Some(false))]).is_empty());
        assert_eq!(engine.apply_summary(&[summary("main", 10, None)]).len(), 1);
        assert_eq!(engine.apply_summary(&[summary("main", -10, Some(true))]).len(), 1);
        // never synced
        assert_eq!(engine.apply_summary(&[summary("other", -10, None)]).len(), 1);
        assert!(engine.apply_summary(&[summary("unknown", 10, None)]).is_empty());
    }
}
