//! Connection supervisor.
//!
//! One background task owns the websocket for its whole life: it dials,
//! negotiates, pumps frames, and reconnects with backoff. Every physical
//! attempt gets a fresh [`ConnectionSession`]; only the backoff schedule and
//! callers waiting for a hello survive across attempts.

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::negotiator::Negotiator;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tether_core::frames::{
    decode_frame, encode_frame, ConnectChallenge, EventFrame, GatewayFrame, HelloOk, RequestFrame,
    CHALLENGE_EVENT, CONNECT_METHOD,
};
use tether_core::text::close_reason;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub(crate) type HelloWaiter = oneshot::Sender<Result<HelloOk, ClientError>>;
type PendingReply = oneshot::Sender<Result<Value, ClientError>>;

pub const DISCONNECT_REASON: &str = "client disconnect";
pub const TICK_TIMEOUT_REASON: &str = "tick timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        }
    }
}

/// Events between `expected` and `received` were never seen on this
/// connection. There is no replay; consumers resync from history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    pub expected: u64,
    pub received: u64,
}

pub(crate) enum Command {
    AwaitHello(HelloWaiter),
    Request {
        method: String,
        params: Value,
        reply: PendingReply,
    },
    Disconnect(oneshot::Sender<()>),
}

pub(crate) struct Shared {
    pub config: ClientConfig,
    pub negotiator: Negotiator,
    pub status: watch::Sender<ConnectionStatus>,
    pub hello: watch::Sender<Option<HelloOk>>,
    pub events: broadcast::Sender<EventFrame>,
    pub gaps: broadcast::Sender<SequenceGap>,
}

impl Shared {
    fn publish_status(&self, next: ConnectionStatus) {
        let changed = self.status.send_if_modified(|status| {
            if *status == next {
                return false;
            }
            *status = next;
            true
        });
        if changed {
            debug!(event = "gateway_status", status = next.as_str());
        }
    }
}

/// Per-attempt state. Never reused after the socket closes.
#[derive(Default)]
struct ConnectionSession {
    last_seq: Option<u64>,
    pending: HashMap<String, PendingReply>,
}

impl ConnectionSession {
    fn observe_seq(&mut self, seq: u64) -> Option<SequenceGap> {
        let gap = match self.last_seq {
            Some(last) if seq > last.saturating_add(1) => Some(SequenceGap {
                expected: last + 1,
                received: seq,
            }),
            _ => None,
        };
        if self.last_seq.map_or(true, |last| seq > last) {
            self.last_seq = Some(seq);
        }
        gap
    }

    fn deliver(&mut self, shared: &Shared, frame: EventFrame) {
        if let Some(seq) = frame.seq {
            if let Some(gap) = self.observe_seq(seq) {
                warn!(
                    event = "gateway_seq_gap",
                    expected = gap.expected,
                    received = gap.received
                );
                let _ = shared.gaps.send(gap);
            }
        }
        let _ = shared.events.send(frame);
    }

    fn reject_all(&mut self, err: &ClientError) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(err.clone()));
        }
    }
}

enum AttemptOutcome {
    Stopped(Option<oneshot::Sender<()>>),
    Failed(ClientError),
}

enum IdleAction {
    Continue,
    Stop(Option<oneshot::Sender<()>>),
}

enum Inbound {
    Frame(GatewayFrame),
    Skip,
    Closed(ClientError),
}

pub(crate) async fn supervise(shared: Arc<Shared>, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut backoff = Backoff::new(shared.config.backoff.clone());
    let mut waiters: Vec<HelloWaiter> = Vec::new();

    loop {
        shared.publish_status(ConnectionStatus::Connecting);
        let outcome = run_attempt(&shared, &mut commands, &mut waiters, &mut backoff).await;
        shared.hello.send_replace(None);
        shared.publish_status(ConnectionStatus::Disconnected);

        let error = match outcome {
            AttemptOutcome::Stopped(reply) => {
                finish(&mut waiters, reply);
                info!(event = "gateway_disconnected");
                return;
            }
            AttemptOutcome::Failed(error) => error,
        };

        drain_waiters(&mut waiters, Err(error.clone()));
        if !error.is_retryable() {
            warn!(event = "gateway_reconnect_stopped", error = %error);
            return;
        }

        let delay = backoff.next_delay();
        info!(
            event = "gateway_reconnect_scheduled",
            delay_ms = delay.as_millis() as u64,
            error = %error
        );
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                command = commands.recv() => {
                    if let IdleAction::Stop(reply) = handle_idle_command(command, &mut waiters) {
                        finish(&mut waiters, reply);
                        return;
                    }
                }
            }
        }
    }
}

async fn run_attempt(
    shared: &Shared,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    waiters: &mut Vec<HelloWaiter>,
    backoff: &mut Backoff,
) -> AttemptOutcome {
    let connect = connect_async(shared.config.url.as_str());
    tokio::pin!(connect);
    let mut socket = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok((socket, _)) => break socket,
                Err(err) => {
                    warn!(event = "gateway_connect_error", url = %shared.config.url, error = %err);
                    return AttemptOutcome::Failed(ClientError::Connection(err.to_string()));
                }
            },
            command = commands.recv() => {
                if let IdleAction::Stop(reply) = handle_idle_command(command, waiters) {
                    return AttemptOutcome::Stopped(reply);
                }
            }
        }
    };

    let hello = match handshake(shared, &mut socket, commands, waiters).await {
        Ok(hello) => hello,
        Err(outcome) => return outcome,
    };

    backoff.reset();
    let tick_interval = hello
        .policy
        .and_then(|policy| policy.tick_interval_ms)
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(shared.config.default_tick_interval);
    shared.hello.send_replace(Some(hello.clone()));
    shared.publish_status(ConnectionStatus::Connected);
    info!(
        event = "gateway_connected",
        protocol = hello.protocol,
        tick_interval_ms = tick_interval.as_millis() as u64
    );
    drain_waiters(waiters, Ok(hello.clone()));

    let mut session = ConnectionSession::default();
    let mut last_frame_at = Instant::now();
    loop {
        let watchdog = tokio::time::sleep_until(last_frame_at + tick_interval * 2);
        tokio::select! {
            item = socket.next() => {
                last_frame_at = Instant::now();
                match inbound(shared, item) {
                    Inbound::Closed(err) => {
                        warn!(event = "gateway_connection_lost", error = %err);
                        session.reject_all(&err);
                        return AttemptOutcome::Failed(err);
                    }
                    Inbound::Skip => {}
                    Inbound::Frame(GatewayFrame::Res(res)) => match session.pending.remove(&res.id) {
                        Some(reply) => {
                            let _ = reply.send(res.into_result().map_err(ClientError::Response));
                        }
                        None => debug!(event = "gateway_unmatched_response", id = %res.id),
                    },
                    Inbound::Frame(GatewayFrame::Event(frame)) => session.deliver(shared, frame),
                    Inbound::Frame(GatewayFrame::Req(req)) => {
                        debug!(event = "gateway_unexpected_request", method = %req.method);
                    }
                }
            }
            command = commands.recv() => match command {
                None => {
                    close_socket(&mut socket, CloseCode::Normal, DISCONNECT_REASON).await;
                    session.reject_all(&ClientError::Disconnected);
                    return AttemptOutcome::Stopped(None);
                }
                Some(Command::Disconnect(reply)) => {
                    close_socket(&mut socket, CloseCode::Normal, DISCONNECT_REASON).await;
                    session.reject_all(&ClientError::Disconnected);
                    return AttemptOutcome::Stopped(Some(reply));
                }
                Some(Command::AwaitHello(waiter)) => {
                    let _ = waiter.send(Ok(hello.clone()));
                }
                Some(Command::Request { method, params, reply }) => {
                    let id = Uuid::new_v4().to_string();
                    let frame = GatewayFrame::Req(RequestFrame {
                        id: id.clone(),
                        method,
                        params,
                    });
                    let text = match encode_frame(&frame, shared.config.max_frame_bytes) {
                        Ok(text) => text,
                        Err(err) => {
                            let _ = reply.send(Err(err.into()));
                            continue;
                        }
                    };
                    session.pending.insert(id, reply);
                    if let Err(err) = socket.send(Message::Text(text)).await {
                        let err = ClientError::Connection(err.to_string());
                        warn!(event = "gateway_send_error", error = %err);
                        session.reject_all(&err);
                        return AttemptOutcome::Failed(err);
                    }
                }
            },
            _ = watchdog => {
                warn!(
                    event = "gateway_tick_timeout",
                    tick_interval_ms = tick_interval.as_millis() as u64
                );
                close_socket(&mut socket, CloseCode::Away, TICK_TIMEOUT_REASON).await;
                let err = ClientError::Connection(TICK_TIMEOUT_REASON.to_string());
                session.reject_all(&err);
                return AttemptOutcome::Failed(err);
            }
        }
    }
}

/// Waits briefly for a challenge, then sends the signed connect request and
/// waits for its response. There is no deadline once the request is sent.
async fn handshake(
    shared: &Shared,
    socket: &mut Socket,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    waiters: &mut Vec<HelloWaiter>,
) -> Result<HelloOk, AttemptOutcome> {
    let grace = tokio::time::sleep(shared.config.challenge_grace);
    tokio::pin!(grace);
    let nonce = loop {
        tokio::select! {
            _ = &mut grace => {
                debug!(event = "gateway_challenge_missing");
                break None;
            }
            item = socket.next() => match inbound(shared, item) {
                Inbound::Closed(err) => return Err(AttemptOutcome::Failed(err)),
                Inbound::Frame(GatewayFrame::Event(frame)) if frame.event == CHALLENGE_EVENT => {
                    match serde_json::from_value::<ConnectChallenge>(frame.payload) {
                        Ok(challenge) => break Some(challenge.nonce),
                        Err(err) => {
                            warn!(event = "gateway_challenge_invalid", error = %err);
                            break None;
                        }
                    }
                }
                Inbound::Frame(_) | Inbound::Skip => {}
            },
            command = commands.recv() => {
                if let IdleAction::Stop(reply) = handle_idle_command(command, waiters) {
                    close_socket(socket, CloseCode::Normal, DISCONNECT_REASON).await;
                    return Err(AttemptOutcome::Stopped(reply));
                }
            }
        }
    };

    let prepared = shared.negotiator.prepare(nonce.as_deref());
    let params = serde_json::to_value(&prepared.params)
        .map_err(|err| AttemptOutcome::Failed(ClientError::Protocol(err.to_string())))?;
    let connect_id = Uuid::new_v4().to_string();
    let frame = GatewayFrame::Req(RequestFrame {
        id: connect_id.clone(),
        method: CONNECT_METHOD.to_string(),
        params,
    });
    let text = encode_frame(&frame, shared.config.max_frame_bytes)
        .map_err(|err| AttemptOutcome::Failed(err.into()))?;
    socket
        .send(Message::Text(text))
        .await
        .map_err(|err| AttemptOutcome::Failed(ClientError::Connection(err.to_string())))?;
    debug!(
        event = "gateway_connect_sent",
        with_nonce = nonce.is_some(),
        cached_token = prepared.sent_cached_token()
    );

    loop {
        tokio::select! {
            item = socket.next() => match inbound(shared, item) {
                Inbound::Closed(err) => return Err(AttemptOutcome::Failed(err)),
                Inbound::Frame(GatewayFrame::Res(res)) if res.id == connect_id => {
                    return match shared.negotiator.complete(&prepared, res.into_result()) {
                        Ok(hello) => Ok(hello),
                        Err(err) => {
                            warn!(event = "gateway_handshake_rejected", error = %err);
                            close_socket(socket, CloseCode::Policy, &err.to_string()).await;
                            Err(AttemptOutcome::Failed(err))
                        }
                    };
                }
                Inbound::Frame(_) | Inbound::Skip => {}
            },
            command = commands.recv() => {
                if let IdleAction::Stop(reply) = handle_idle_command(command, waiters) {
                    close_socket(socket, CloseCode::Normal, DISCONNECT_REASON).await;
                    return Err(AttemptOutcome::Stopped(reply));
                }
            }
        }
    }
}

fn inbound(shared: &Shared, item: Option<Result<Message, WsError>>) -> Inbound {
    let text = match item {
        None => return Inbound::Closed(ClientError::Connection("connection closed".to_string())),
        Some(Err(err)) => return Inbound::Closed(ClientError::Connection(err.to_string())),
        Some(Ok(Message::Text(text))) => text,
        Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                warn!(event = "gateway_binary_frame_dropped");
                return Inbound::Skip;
            }
        },
        Some(Ok(Message::Close(frame))) => {
            let reason = frame
                .map(|frame| format!("{} {}", u16::from(frame.code), frame.reason))
                .unwrap_or_else(|| "no reason".to_string());
            return Inbound::Closed(ClientError::Connection(format!("closed by gateway: {reason}")));
        }
        Some(Ok(_)) => return Inbound::Skip,
    };
    match decode_frame(&text, shared.config.max_frame_bytes) {
        Ok(frame) => Inbound::Frame(frame),
        Err(err) => {
            warn!(event = "gateway_decode_error", error = %err);
            Inbound::Skip
        }
    }
}

fn handle_idle_command(command: Option<Command>, waiters: &mut Vec<HelloWaiter>) -> IdleAction {
    match command {
        None => IdleAction::Stop(None),
        Some(Command::Disconnect(reply)) => IdleAction::Stop(Some(reply)),
        Some(Command::AwaitHello(waiter)) => {
            waiters.push(waiter);
            IdleAction::Continue
        }
        Some(Command::Request { method, reply, .. }) => {
            debug!(event = "gateway_request_rejected", method = %method, reason = "not_connected");
            let _ = reply.send(Err(ClientError::NotConnected));
            IdleAction::Continue
        }
    }
}

fn drain_waiters(waiters: &mut Vec<HelloWaiter>, result: Result<HelloOk, ClientError>) {
    for waiter in waiters.drain(..) {
        let _ = waiter.send(result.clone());
    }
}

fn finish(waiters: &mut Vec<HelloWaiter>, reply: Option<oneshot::Sender<()>>) {
    drain_waiters(waiters, Err(ClientError::Disconnected));
    if let Some(reply) = reply {
        let _ = reply.send(());
    }
}

async fn close_socket(socket: &mut Socket, code: CloseCode, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: close_reason(reason).into(),
    };
    if let Err(err) = socket.close(Some(frame)).await {
        debug!(event = "gateway_close_error", error = %err);
    }
}
