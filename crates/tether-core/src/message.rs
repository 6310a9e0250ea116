use chrono::DateTime;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum MessagePart {
    Text(String),
    Thinking(String),
    ToolCall {
        id: Option<String>,
        name: String,
        arguments: Value,
    },
    ToolResult {
        id: Option<String>,
        name: Option<String>,
        text: String,
    },
}

/// A chat message as carried by `chat` events and `chat.history` responses.
///
/// Backends disagree on shape (string content vs. typed part arrays, top-level
/// `thinking`/`reasoning` fields, OpenAI-style `tool_calls`), so parsing is
/// lenient and everything is normalized into [`MessagePart`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub parts: Vec<MessagePart>,
    pub timestamp_ms: Option<i64>,
    pub stop_reason: Option<String>,
    pub error_message: Option<String>,
}

impl ChatMessage {
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let role = first_string(object, &["role"])
            .map(|role| role.to_lowercase())
            .unwrap_or_else(|| "assistant".to_string());

        let mut parts = Vec::new();
        if let Some(thinking) = first_string(object, &["thinking", "reasoning"]) {
            parts.push(MessagePart::Thinking(thinking));
        }

        match object.get("content") {
            Some(Value::String(text)) => parts.push(MessagePart::Text(text.clone())),
            Some(Value::Array(items)) => {
                for item in items {
                    if let Some(part) = parse_part(item) {
                        parts.push(part);
                    }
                }
            }
            _ => {
                if let Some(text) = first_string(object, &["text"]) {
                    parts.push(MessagePart::Text(text));
                }
            }
        }

        for key in ["toolCalls", "tool_calls"] {
            if let Some(Value::Array(calls)) = object.get(key) {
                for call in calls {
                    if let Some(part) = parse_tool_call(call) {
                        parts.push(part);
                    }
                }
            }
        }

        if is_tool_result_role(&role) {
            let name = first_string(object, &["toolName", "tool_name", "name"]);
            let id = first_string(object, &["toolCallId", "tool_call_id"]);
            let text = joined(&parts, |part| match part {
                MessagePart::Text(text) => Some(text.as_str()),
                MessagePart::ToolResult { text, .. } => Some(text.as_str()),
                _ => None,
            });
            parts = vec![MessagePart::ToolResult { id, name, text }];
        }

        Some(Self {
            role,
            parts,
            timestamp_ms: parse_timestamp(object.get("timestamp").or_else(|| object.get("ts"))),
            stop_reason: first_string(object, &["stopReason", "stop_reason"]),
            error_message: first_string(object, &["errorMessage", "error_message"]),
        })
    }

    pub fn text(&self) -> String {
        joined(&self.parts, |part| match part {
            MessagePart::Text(text) => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn thinking(&self) -> String {
        joined(&self.parts, |part| match part {
            MessagePart::Thinking(text) => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn has_thinking(&self) -> bool {
        !self.thinking().trim().is_empty()
    }

    pub fn is_error(&self) -> bool {
        self.stop_reason.as_deref() == Some("error") || self.error_message.is_some()
    }
}

pub fn is_tool_result_role(role: &str) -> bool {
    matches!(role, "toolresult" | "tool_result" | "tool")
}

/// Tool arguments sometimes arrive as a JSON-encoded string.
pub fn normalize_tool_args(arguments: Value) -> Value {
    match arguments {
        Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        other => other,
    }
}

pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                item.get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| item.as_str().map(str::to_string))
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

fn parse_part(item: &Value) -> Option<MessagePart> {
    if let Some(text) = item.as_str() {
        return Some(MessagePart::Text(text.to_string()));
    }
    let object = item.as_object()?;
    let kind = first_string(object, &["type"]).unwrap_or_else(|| "text".to_string());
    match kind.as_str() {
        "text" | "output_text" => first_string(object, &["text"]).map(MessagePart::Text),
        "thinking" | "reasoning" => {
            first_string(object, &["thinking", "reasoning", "text"]).map(MessagePart::Thinking)
        }
        "toolCall" | "tool_call" | "tool_use" | "toolUse" => parse_tool_call(item),
        "toolResult" | "tool_result" => Some(MessagePart::ToolResult {
            id: first_string(object, &["toolCallId", "tool_use_id", "id"]),
            name: first_string(object, &["toolName", "name"]),
            text: object
                .get("content")
                .or_else(|| object.get("text"))
                .map(value_to_text)
                .unwrap_or_default(),
        }),
        _ => None,
    }
}

fn parse_tool_call(item: &Value) -> Option<MessagePart> {
    let object = item.as_object()?;
    let function = object.get("function").and_then(Value::as_object);
    let name = first_string(object, &["name", "toolName"])
        .or_else(|| function.and_then(|function| first_string(function, &["name"])))?;
    let arguments = object
        .get("arguments")
        .or_else(|| object.get("input"))
        .or_else(|| object.get("args"))
        .or_else(|| function.and_then(|function| function.get("arguments")))
        .cloned()
        .unwrap_or(Value::Null);
    Some(MessagePart::ToolCall {
        id: first_string(object, &["id", "toolCallId"]),
        name,
        arguments: normalize_tool_args(arguments),
    })
}

fn parse_timestamp(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(number) => number.as_i64().or_else(|| number.as_f64().map(|f| f as i64)),
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| ts.timestamp_millis())
            .or_else(|| raw.trim().parse::<i64>().ok()),
        _ => None,
    }
}

fn first_string(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| object.get(*key))
        .find_map(|value| value.as_str())
        .map(str::to_string)
}

fn joined<'a>(parts: &'a [MessagePart], pick: impl Fn(&'a MessagePart) -> Option<&'a str>) -> String {
    parts
        .iter()
        .filter_map(pick)
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_typed_content_parts() {
        let message = ChatMessage::from_value(&json!({
            "role": "assistant",
            "content": [
                {"type": "thinking", "thinking": "let me check"},
                {"type": "text", "text": "Hello"},
                {"type": "toolCall", "id": "call-1", "name": "read", "arguments": "{\"path\":\"a.txt\"}"},
                {"type": "text", "text": "world"}
            ],
            "timestamp": 1_700_000_000_123_i64,
            "stopReason": "stop"
        }))
        .expect("message");
        assert_eq!(message.text(), "Hello\nworld");
        assert_eq!(message.thinking(), "let me check");
        assert_eq!(message.timestamp_ms, Some(1_700_000_000_123));
        assert_eq!(message.stop_reason.as_deref(), Some("stop"));
        assert!(message.parts.contains(&MessagePart::ToolCall {
            id: Some("call-1".to_string()),
            name: "read".to_string(),
            arguments: json!({"path": "a.txt"}),
        }));
    }

    #[test]
    fn plain_string_content_and_text_fallback() {
        let from_content = ChatMessage::from_value(&json!({"role": "User", "content": "hi"}))
            .expect("content string");
        assert_eq!(from_content.role, "user");
        assert_eq!(from_content.text(), "hi");

        let from_text = ChatMessage::from_value(&json!({"text": "fallback", "reasoning": "why"}))
            .expect("text field");
        assert_eq!(from_text.role, "assistant");
        assert_eq!(from_text.text(), "fallback");
        assert!(from_text.has_thinking());
    }

    #[test]
    fn tool_result_messages_collapse_to_one_part() {
        let message = ChatMessage::from_value(&json!({
            "role": "toolResult",
            "toolName": "read",
            "toolCallId": "call-1",
            "content": [{"type": "text", "text": "file body"}],
            "timestamp": "2026-02-07T21:00:00Z"
        }))
        .expect("tool result");
        assert_eq!(
            message.parts,
            vec![MessagePart::ToolResult {
                id: Some("call-1".to_string()),
                name: Some("read".to_string()),
                text: "file body".to_string(),
            }]
        );
        assert!(message.timestamp_ms.is_some());
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(ChatMessage::from_value(&json!("text")).is_none());
    }
}
