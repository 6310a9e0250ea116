//! Typed gateway events.
//!
//! Raw `chat` and `agent` payloads are decoded exactly once into
//! [`GatewayEvent`]; everything downstream pattern-matches on the enum and never
//! touches untyped JSON.

use crate::message::{normalize_tool_args, value_to_text, ChatMessage};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CHAT_EVENT: &str = "chat";
pub const AGENT_EVENT: &str = "agent";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Assistant,
    Reasoning,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEvent {
    pub run_id: String,
    pub session_key: String,
    pub seq: u64,
    pub message: Option<ChatMessage>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamDelta {
    pub run_id: String,
    pub session_key: Option<String>,
    pub seq: u64,
    pub stream: StreamKind,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolEvent {
    pub run_id: String,
    pub session_key: Option<String>,
    pub seq: u64,
    pub tool_call_id: Option<String>,
    pub name: String,
    pub arguments: Value,
    pub result: Option<String>,
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub run_id: String,
    pub session_key: Option<String>,
    pub seq: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    ChatDelta(ChatEvent),
    ChatFinal(ChatEvent),
    ChatAborted(ChatEvent),
    ChatError(ChatEvent),
    AgentStreamDelta(StreamDelta),
    AgentToolCall(ToolEvent),
    AgentToolResult(ToolEvent),
    LifecycleStart(LifecycleEvent),
    LifecycleEnd(LifecycleEvent),
    LifecycleError(LifecycleEvent),
}

impl GatewayEvent {
    pub fn run_id(&self) -> &str {
        match self {
            GatewayEvent::ChatDelta(event)
            | GatewayEvent::ChatFinal(event)
            | GatewayEvent::ChatAborted(event)
            | GatewayEvent::ChatError(event) => &event.run_id,
            GatewayEvent::AgentStreamDelta(event) => &event.run_id,
            GatewayEvent::AgentToolCall(event) | GatewayEvent::AgentToolResult(event) => {
                &event.run_id
            }
            GatewayEvent::LifecycleStart(event)
            | GatewayEvent::LifecycleEnd(event)
            | GatewayEvent::LifecycleError(event) => &event.run_id,
        }
    }

    pub fn session_key(&self) -> Option<&str> {
        match self {
            GatewayEvent::ChatDelta(event)
            | GatewayEvent::ChatFinal(event)
            | GatewayEvent::ChatAborted(event)
            | GatewayEvent::ChatError(event) => Some(&event.session_key),
            GatewayEvent::AgentStreamDelta(event) => event.session_key.as_deref(),
            GatewayEvent::AgentToolCall(event) | GatewayEvent::AgentToolResult(event) => {
                event.session_key.as_deref()
            }
            GatewayEvent::LifecycleStart(event)
            | GatewayEvent::LifecycleEnd(event)
            | GatewayEvent::LifecycleError(event) => event.session_key.as_deref(),
        }
    }

    pub fn seq(&self) -> u64 {
        match self {
            GatewayEvent::ChatDelta(event)
            | GatewayEvent::ChatFinal(event)
            | GatewayEvent::ChatAborted(event)
            | GatewayEvent::ChatError(event) => event.seq,
            GatewayEvent::AgentStreamDelta(event) => event.seq,
            GatewayEvent::AgentToolCall(event) | GatewayEvent::AgentToolResult(event) => {
                event.seq
            }
            GatewayEvent::LifecycleStart(event)
            | GatewayEvent::LifecycleEnd(event)
            | GatewayEvent::LifecycleError(event) => event.seq,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GatewayEvent::ChatFinal(_)
                | GatewayEvent::ChatAborted(_)
                | GatewayEvent::ChatError(_)
                | GatewayEvent::LifecycleEnd(_)
                | GatewayEvent::LifecycleError(_)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            GatewayEvent::ChatDelta(_) => "chat_delta",
            GatewayEvent::ChatFinal(_) => "chat_final",
            GatewayEvent::ChatAborted(_) => "chat_aborted",
            GatewayEvent::ChatError(_) => "chat_error",
            GatewayEvent::AgentStreamDelta(_) => "agent_stream_delta",
            GatewayEvent::AgentToolCall(_) => "agent_tool_call",
            GatewayEvent::AgentToolResult(_) => "agent_tool_result",
            GatewayEvent::LifecycleStart(_) => "lifecycle_start",
            GatewayEvent::LifecycleEnd(_) => "lifecycle_end",
            GatewayEvent::LifecycleError(_) => "lifecycle_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventDecodeError {
    #[error("payload is not an object")]
    NotAnObject,
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("unknown chat state: {0}")]
    UnknownState(String),
    #[error("unknown agent stream: {0}")]
    UnknownStream(String),
    #[error("unknown phase: {0}")]
    UnknownPhase(String),
}

pub fn decode_chat_event(
    payload: &Value,
    frame_seq: Option<u64>,
) -> Result<GatewayEvent, EventDecodeError> {
    let object = payload.as_object().ok_or(EventDecodeError::NotAnObject)?;
    let event = ChatEvent {
        run_id: required_string(object, &["runId", "run_id"], "runId")?,
        session_key: required_string(object, &["sessionKey", "session_key"], "sessionKey")?,
        seq: event_seq(object, frame_seq),
        message: object.get("message").and_then(ChatMessage::from_value),
        error_message: string_field(object, &["errorMessage", "error_message", "error"]),
    };
    let state = required_string(object, &["state"], "state")?;
    match state.as_str() {
        "delta" => Ok(GatewayEvent::ChatDelta(event)),
        "final" => Ok(GatewayEvent::ChatFinal(event)),
        "aborted" => Ok(GatewayEvent::ChatAborted(event)),
        "error" => Ok(GatewayEvent::ChatError(event)),
        _ => Err(EventDecodeError::UnknownState(state)),
    }
}

pub fn decode_agent_event(
    payload: &Value,
    frame_seq: Option<u64>,
) -> Result<GatewayEvent, EventDecodeError> {
    let object = payload.as_object().ok_or(EventDecodeError::NotAnObject)?;
    let run_id = required_string(object, &["runId", "run_id"], "runId")?;
    let session_key = string_field(object, &["sessionKey", "session_key"]);
    let seq = event_seq(object, frame_seq);
    let stream = required_string(object, &["stream"], "stream")?;
    let empty = Map::new();
    let data = object
        .get("data")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    match stream.as_str() {
        "assistant" | "reasoning" | "thinking" => {
            let text = string_field(data, &["text", "delta"]).unwrap_or_default();
            let kind = if stream == "assistant" {
                StreamKind::Assistant
            } else {
                StreamKind::Reasoning
            };
            Ok(GatewayEvent::AgentStreamDelta(StreamDelta {
                run_id,
                session_key,
                seq,
                stream: kind,
                text,
            }))
        }
        "tool" => {
            let phase = string_field(data, &["phase"]).unwrap_or_else(|| "start".to_string());
            let tool = ToolEvent {
                run_id,
                session_key,
                seq,
                tool_call_id: string_field(data, &["toolCallId", "tool_call_id", "id"]),
                name: string_field(data, &["name", "toolName"]).unwrap_or_else(|| "tool".to_string()),
                arguments: normalize_tool_args(
                    data.get("args")
                        .or_else(|| data.get("arguments"))
                        .cloned()
                        .unwrap_or(Value::Null),
                ),
                result: data
                    .get("result")
                    .or_else(|| data.get("partialResult"))
                    .map(value_to_text),
                is_error: data
                    .get("isError")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            };
            match phase.as_str() {
                "start" | "call" => Ok(GatewayEvent::AgentToolCall(tool)),
                "result" | "end" => Ok(GatewayEvent::AgentToolResult(tool)),
                _ => Err(EventDecodeError::UnknownPhase(phase)),
            }
        }
        "lifecycle" => {
            let phase = required_string(data, &["phase"], "data.phase")?;
            let lifecycle = LifecycleEvent {
                run_id,
                session_key,
                seq,
                error: string_field(data, &["error", "message"]),
            };
            match phase.as_str() {
                "start" => Ok(GatewayEvent::LifecycleStart(lifecycle)),
                "end" => Ok(GatewayEvent::LifecycleEnd(lifecycle)),
                "error" => Ok(GatewayEvent::LifecycleError(lifecycle)),
                _ => Err(EventDecodeError::UnknownPhase(phase)),
            }
        }
        _ => Err(EventDecodeError::UnknownStream(stream)),
    }
}

fn event_seq(object: &Map<String, Value>, frame_seq: Option<u64>) -> u64 {
    object
        .get("seq")
        .and_then(Value::as_u64)
        .or(frame_seq)
        .unwrap_or(0)
}

fn string_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find_map(|value| value.as_str())
        .map(str::to_string)
}

fn required_string(
    object: &Map<String, Value>,
    keys: &[&str],
    label: &'static str,
) -> Result<String, EventDecodeError> {
    string_field(object, keys)
        .filter(|value| !value.trim().is_empty())
        .ok_or(EventDecodeError::MissingField(label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_states_map_to_variants() {
        for (state, expected) in [
            ("delta", "chat_delta"),
            ("final", "chat_final"),
            ("aborted", "chat_aborted"),
            ("error", "chat_error"),
        ] {
            let event = decode_chat_event(
                &json!({"runId": "r1", "sessionKey": "main", "state": state, "seq": 4}),
                Some(99),
            )
            .expect("decode");
            assert_eq!(event.name(), expected);
            assert_eq!(event.seq(), 4);
            assert_eq!(event.session_key(), Some("main"));
        }
    }

    #[test]
    fn chat_seq_falls_back_to_frame_seq() {
        let event = decode_chat_event(
            &json!({
                "runId": "r1",
                "sessionKey": "main",
                "state": "final",
                "message": {"role": "assistant", "content": [{"type": "text", "text": "done"}]}
            }),
            Some(12),
        )
        .expect("decode");
        let GatewayEvent::ChatFinal(chat) = event else {
            panic!("expected final");
        };
        assert_eq!(chat.seq, 12);
        assert_eq!(chat.message.expect("message").text(), "done");
    }

    #[test]
    fn agent_streams_decode() {
        let assistant = decode_agent_event(
            &json!({"runId": "r1", "stream": "assistant", "data": {"text": "Hel", "delta": "l"}}),
            None,
        )
        .expect("assistant");
        assert_eq!(
            assistant,
            GatewayEvent::AgentStreamDelta(StreamDelta {
                run_id: "r1".to_string(),
                session_key: None,
                seq: 0,
                stream: StreamKind::Assistant,
                text: "Hel".to_string(),
            })
        );

        let reasoning = decode_agent_event(
            &json!({"runId": "r1", "stream": "reasoning", "data": {"delta": "hmm"}}),
            None,
        )
        .expect("reasoning");
        assert!(matches!(
            reasoning,
            GatewayEvent::AgentStreamDelta(StreamDelta { stream: StreamKind::Reasoning, .. })
        ));
    }

    #[test]
    fn tool_and_lifecycle_phases_decode() {
        let call = decode_agent_event(
            &json!({"runId": "r1", "sessionKey": "main", "stream": "tool",
                "data": {"phase": "start", "name": "read", "toolCallId": "c1", "args": "{\"path\":\"x\"}"}}),
            None,
        )
        .expect("tool call");
        let GatewayEvent::AgentToolCall(tool) = call else {
            panic!("expected tool call");
        };
        assert_eq!(tool.arguments, json!({"path": "x"}));

        let result = decode_agent_event(
            &json!({"runId": "r1", "stream": "tool",
                "data": {"phase": "result", "name": "read", "result": {"content": "ok"}}}),
            None,
        )
        .expect("tool result");
        assert!(matches!(result, GatewayEvent::AgentToolResult(_)));

        let end = decode_agent_event(
            &json!({"runId": "r1", "stream": "lifecycle", "data": {"phase": "error", "error": "boom"}}),
            Some(3),
        )
        .expect("lifecycle");
        assert!(end.is_terminal());
        let GatewayEvent::LifecycleError(lifecycle) = end else {
            panic!("expected lifecycle error");
        };
        assert_eq!(lifecycle.error.as_deref(), Some("boom"));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        assert_eq!(
            decode_chat_event(&json!({"sessionKey": "main", "state": "final"}), None),
            Err(EventDecodeError::MissingField("runId"))
        );
        assert_eq!(
            decode_chat_event(&json!({"runId": "r", "sessionKey": "main", "state": "weird"}), None),
            Err(EventDecodeError::UnknownState("weird".to_string()))
        );
        assert!(matches!(
            decode_agent_event(&json!({"runId": "r", "stream": "compaction"}), None),
            Err(EventDecodeError::UnknownStream(_))
        ));
        assert_eq!(
            decode_agent_event(&json!([1, 2]), None),
            Err(EventDecodeError::NotAnObject)
        );
    }
}
