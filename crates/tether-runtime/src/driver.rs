//! Async owner of the reconciliation engine.
//!
//! One task consumes the client's event, gap and status channels together
//! with handle commands and fetch completions, so the engine only ever sees
//! one input at a time. Fetches run on their own tasks and report back
//! through a channel.

use crate::classifier::{classify, EventClass};
use crate::engine::{
    AgentStatus, EngineConfig, EngineEffect, LiveStream, ReconciliationEngine, ResyncReason,
};
use crate::history::parse_history;
use crate::refresh::{parse_session_summaries, Debouncer, DEFAULT_REFRESH_DEBOUNCE};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Duration;
use tether_client::{ClientError, ConnectionStatus, GatewayClient, SequenceGap};
use tether_core::{EventFrame, TranscriptEntry};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_HISTORY_METHOD: &str = "chat.history";
pub const DEFAULT_HISTORY_LIMIT: usize = 200;
pub const DEFAULT_SUMMARY_METHOD: &str = "sessions.list";
pub const DEFAULT_SEND_METHOD: &str = "chat.send";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub history_method: String,
    pub history_limit: usize,
    pub summary_method: String,
    pub send_method: String,
    pub refresh_debounce: Duration,
    pub update_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            history_method: DEFAULT_HISTORY_METHOD.to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            summary_method: DEFAULT_SUMMARY_METHOD.to_string(),
            send_method: DEFAULT_SEND_METHOD.to_string(),
            refresh_debounce: DEFAULT_REFRESH_DEBOUNCE,
            update_buffer: 256,
        }
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("runtime stopped")]
    Stopped,
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("message is empty")]
    EmptyMessage,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeUpdate {
    Transcript {
        agent: String,
        entries: Vec<TranscriptEntry>,
    },
    Status {
        agent: String,
        status: AgentStatus,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentSnapshot {
    pub status: AgentStatus,
    pub active_run_id: Option<String>,
    pub entries: Vec<TranscriptEntry>,
}

enum Command {
    Track {
        agent: String,
    },
    Resync {
        agent: String,
    },
    SendMessage {
        agent: String,
        text: String,
        reply: oneshot::Sender<Result<String, RuntimeError>>,
    },
    Snapshot {
        agent: String,
        reply: oneshot::Sender<Option<AgentSnapshot>>,
    },
    Shutdown,
}

enum FetchResult {
    History {
        agent: String,
        result: Result<Value, ClientError>,
    },
    Summary(Result<Value, ClientError>),
}

pub struct ReconcilerRuntime;

impl ReconcilerRuntime {
    /// Subscribes to `client` and starts the runtime task. The client does
    /// not need to be connected yet; every transition to connected triggers
    /// a resync of all tracked agents.
    pub fn spawn(
        client: GatewayClient,
        engine_config: EngineConfig,
        config: RuntimeConfig,
    ) -> RuntimeHandle {
        let events = client.subscribe_events();
        let gaps = client.subscribe_gaps();
        let status = client.subscribe_status();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(config.update_buffer.max(1));
        let (live_tx, live_rx) = watch::channel(BTreeMap::new());

        let runtime = Runtime {
            client,
            engine: ReconciliationEngine::new(engine_config),
            summary_refresh: Debouncer::new(config.refresh_debounce),
            config,
            updates: updates.clone(),
            live: live_tx,
            fetch_tx,
            in_flight: HashSet::new(),
            resync_again: HashSet::new(),
        };
        let task = tokio::spawn(runtime.run(events, gaps, status, command_rx, fetch_rx));
        RuntimeHandle {
            commands: command_tx,
            updates,
            live: live_rx,
            task: Some(task),
        }
    }
}

pub struct RuntimeHandle {
    commands: mpsc::UnboundedSender<Command>,
    updates: broadcast::Sender<RuntimeUpdate>,
    live: watch::Receiver<BTreeMap<String, LiveStream>>,
    task: Option<JoinHandle<()>>,
}

impl RuntimeHandle {
    /// Starts following `agent` and fetches its history.
    pub fn track(&self, agent: &str) -> Result<(), RuntimeError> {
        self.send(Command::Track {
            agent: agent.to_string(),
        })
    }

    pub fn resync(&self, agent: &str) -> Result<(), RuntimeError> {
        self.send(Command::Resync {
            agent: agent.to_string(),
        })
    }

    /// Records an optimistic user line, then sends it. Resolves to the local
    /// entry id once the gateway accepts the message.
    pub async fn send_message(&self, agent: &str, text: &str) -> Result<String, RuntimeError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::SendMessage {
            agent: agent.to_string(),
            text: text.to_string(),
            reply,
        })?;
        response.await.map_err(|_| RuntimeError::Stopped)?
    }

    pub async fn snapshot(&self, agent: &str) -> Result<AgentSnapshot, RuntimeError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Snapshot {
            agent: agent.to_string(),
            reply,
        })?;
        response
            .await
            .map_err(|_| RuntimeError::Stopped)?
            .ok_or_else(|| RuntimeError::UnknownAgent(agent.to_string()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeUpdate> {
        self.updates.subscribe()
    }

    /// Live streams keyed by agent; only the latest value is kept.
    pub fn live(&self) -> watch::Receiver<BTreeMap<String, LiveStream>> {
        self.live.clone()
    }

    pub async fn shutdown(mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn send(&self, command: Command) -> Result<(), RuntimeError> {
        self.commands
            .send(command)
            .map_err(|_| RuntimeError::Stopped)
    }
}

struct Runtime {
    client: GatewayClient,
    config: RuntimeConfig,
    engine: ReconciliationEngine,
    updates: broadcast::Sender<RuntimeUpdate>,
    live: watch::Sender<BTreeMap<String, LiveStream>>,
    fetch_tx: mpsc::UnboundedSender<FetchResult>,
    in_flight: HashSet<String>,
    resync_again: HashSet<String>,
    summary_refresh: Debouncer,
}

impl Runtime {
    async fn run(
        mut self,
        mut events: broadcast::Receiver<EventFrame>,
        mut gaps: broadcast::Receiver<SequenceGap>,
        mut status: watch::Receiver<ConnectionStatus>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut fetches: mpsc::UnboundedReceiver<FetchResult>,
    ) {
        let mut connected = *status.borrow_and_update() == ConnectionStatus::Connected;
        info!(event = "runtime_started", connected);
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(frame) => self.handle_frame(&frame),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(event = "runtime_events_lagged", skipped);
                        self.resync_all(ResyncReason::SequenceGap);
                    }
                    Err(RecvError::Closed) => break,
                },
                gap = gaps.recv() => match gap {
                    Ok(gap) => {
                        debug!(
                            event = "runtime_sequence_gap",
                            expected = gap.expected,
                            received = gap.received
                        );
                        self.resync_all(ResyncReason::SequenceGap);
                    }
                    Err(RecvError::Lagged(_)) => self.resync_all(ResyncReason::SequenceGap),
                    Err(RecvError::Closed) => break,
                },
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let now_connected = *status.borrow_and_update() == ConnectionStatus::Connected;
                    if now_connected && !connected {
                        info!(event = "runtime_reconnected");
                        self.resync_all(ResyncReason::Reconnected);
                        self.schedule_summary_refresh();
                    }
                    connected = now_connected;
                }
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(result) = fetches.recv() => self.handle_fetch(result),
            }
        }
        self.summary_refresh.cancel();
        info!(event = "runtime_stopped");
    }

    fn handle_frame(&mut self, frame: &EventFrame) {
        match classify(frame) {
            EventClass::Run(event) => {
                let effects = self.engine.apply_event(&event, Utc::now());
                self.apply_effects(effects);
            }
            EventClass::SummaryRefresh => self.schedule_summary_refresh(),
            EventClass::Ignore => {}
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Track { agent } => {
                if self.engine.track_agent(&agent) {
                    info!(event = "runtime_agent_tracked", agent = %agent);
                    self.fetch_history(agent, ResyncReason::Requested);
                }
            }
            Command::Resync { agent } => self.fetch_history(agent, ResyncReason::Requested),
            Command::SendMessage { agent, text, reply } => self.send_message(agent, text, reply),
            Command::Snapshot { agent, reply } => {
                let snapshot = self.engine.agent(&agent).map(|state| AgentSnapshot {
                    status: state.status(),
                    active_run_id: state.active_run_id().map(str::to_string),
                    entries: state.transcript().entries().to_vec(),
                });
                let _ = reply.send(snapshot);
            }
            Command::Shutdown => {}
        }
    }

    fn send_message(
        &mut self,
        agent: String,
        text: String,
        reply: oneshot::Sender<Result<String, RuntimeError>>,
    ) {
        let text = text.trim().to_string();
        if text.is_empty() {
            let _ = reply.send(Err(RuntimeError::EmptyMessage));
            return;
        }
        let (entry_id, effects) = self
            .engine
            .record_local_user_message(&agent, &text, Utc::now());
        self.apply_effects(effects);

        let client = self.client.clone();
        let method = self.config.send_method.clone();
        let params = json!({"sessionKey": agent, "message": text, "idempotencyKey": entry_id});
        tokio::spawn(async move {
            let result = client
                .request_value(&method, params)
                .await
                .map(|_| entry_id)
                .map_err(RuntimeError::from);
            if let Err(err) = &result {
                warn!(event = "runtime_send_failed", agent = %agent, error = %err);
            }
            let _ = reply.send(result);
        });
    }

    fn handle_fetch(&mut self, result: FetchResult) {
        match result {
            FetchResult::History { agent, result } => {
                self.in_flight.remove(&agent);
                match result {
                    Ok(payload) => {
                        let messages = parse_history(&payload);
                        debug!(
                            event = "runtime_history_applied",
                            agent = %agent,
                            messages = messages.len()
                        );
                        let effects = self.engine.apply_history(&agent, &messages, Utc::now());
                        self.apply_effects(effects);
                    }
                    Err(ClientError::NotConnected) => {
                        debug!(event = "runtime_history_deferred", agent = %agent);
                    }
                    Err(err) => {
                        warn!(event = "runtime_history_fetch_failed", agent = %agent, error = %err);
                    }
                }
                if self.resync_again.remove(&agent) {
                    self.fetch_history(agent, ResyncReason::Requested);
                }
            }
            FetchResult::Summary(result) => match result {
                Ok(payload) => {
                    let summaries = parse_session_summaries(&payload);
                    let effects = self.engine.apply_summary(&summaries);
                    self.apply_effects(effects);
                }
                Err(err) => debug!(event = "runtime_summary_fetch_failed", error = %err),
            },
        }
    }

    fn apply_effects(&mut self, effects: Vec<EngineEffect>) {
        let mut changed = BTreeSet::new();
        for effect in effects {
            match effect {
                EngineEffect::Live(stream) => {
                    self.live.send_modify(|live| {
                        live.insert(stream.agent.clone(), stream);
                    });
                }
                EngineEffect::LiveCleared { agent, run_id } => {
                    self.live.send_if_modified(|live| {
                        let current = live.get(&agent).is_some_and(|stream| stream.run_id == run_id);
                        if current {
                            live.remove(&agent);
                        }
                        current
                    });
                }
                EngineEffect::TranscriptChanged { agent } => {
                    changed.insert(agent);
                }
                EngineEffect::StatusChanged { agent, status } => {
                    let _ = self.updates.send(RuntimeUpdate::Status { agent, status });
                }
                EngineEffect::ResyncRequested { agent, reason } => self.fetch_history(agent, reason),
            }
        }
        for agent in changed {
            let Some(state) = self.engine.agent(&agent) else {
                continue;
            };
            let _ = self.updates.send(RuntimeUpdate::Transcript {
                entries: state.transcript().entries().to_vec(),
                agent,
            });
        }
    }

    fn resync_all(&mut self, reason: ResyncReason) {
        let effects = self.engine.resync_all(reason);
        self.apply_effects(effects);
    }

    /// At most one history fetch per agent is in flight; a request that
    /// arrives meanwhile schedules one more fetch after it completes.
    fn fetch_history(&mut self, agent: String, reason: ResyncReason) {
        if !self.in_flight.insert(agent.clone()) {
            self.resync_again.insert(agent);
            return;
        }
        debug!(event = "runtime_history_fetch", agent = %agent, reason = reason.as_str());
        let client = self.client.clone();
        let fetch_tx = self.fetch_tx.clone();
        let method = self.config.history_method.clone();
        let params = json!({"sessionKey": agent, "limit": self.config.history_limit});
        tokio::spawn(async move {
            let result = client.request_value(&method, params).await;
            let _ = fetch_tx.send(FetchResult::History { agent, result });
        });
    }

    fn schedule_summary_refresh(&mut self) {
        let client = self.client.clone();
        let fetch_tx = self.fetch_tx.clone();
        let method = self.config.summary_method.clone();
        self.summary_refresh.trigger(async move {
            let result = client.request_value(&method, json!({})).await;
            let _ = fetch_tx.send(FetchResult::Summary(result));
        });
    }
}
