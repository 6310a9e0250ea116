use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
pub const PROTOCOL_VERSION: u32 = 3;
pub const CONNECT_METHOD: &str = "connect";
pub const CHALLENGE_EVENT: &str = "connect.challenge";
pub const TICK_EVENT: &str = "tick";

/// One websocket text message on the gateway connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GatewayFrame {
    Req(RequestFrame),
    Res(ResponseFrame),
    Event(EventFrame),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }

    /// Splits the response into its payload or the server-reported error.
    /// A failed response without an error body still yields an error.
    pub fn into_result(self) -> Result<Value, ErrorShape> {
        if self.ok {
            return Ok(self.payload.unwrap_or(Value::Null));
        }
        Err(self.error.unwrap_or_else(|| ErrorShape::new("UNKNOWN", "request failed")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventFrame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectChallenge {
    pub nonce: String,
    #[serde(default)]
    pub ts: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub version: String,
    pub platform: String,
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceBlock {
    pub id: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ConnectAuth {
    pub fn is_empty(&self) -> bool {
        self.token.is_none() && self.password.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    #[serde(default)]
    pub protocol: u32,
    #[serde(default)]
    pub features: Value,
    #[serde(default)]
    pub snapshot: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<HelloAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<HelloPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HelloAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HelloPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tick_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame(frame: &GatewayFrame, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(frame).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame(text: &str, max_frame_bytes: usize) -> Result<GatewayFrame, FrameError> {
    if text.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: text.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(text).map_err(|err| FrameError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_event_frame_with_and_without_seq() {
        let with_seq = decode_frame(
            r#"{"type":"event","event":"chat","payload":{"runId":"r1"},"seq":7}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode event");
        match with_seq {
            GatewayFrame::Event(event) => {
                assert_eq!(event.event, "chat");
                assert_eq!(event.seq, Some(7));
                assert_eq!(event.payload["runId"], "r1");
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let without_seq = decode_frame(
            r#"{"type":"event","event":"tick"}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode tick");
        assert_eq!(
            without_seq,
            GatewayFrame::Event(EventFrame {
                event: "tick".to_string(),
                payload: Value::Null,
                seq: None,
            })
        );
    }

    #[test]
    fn error_response_carries_structured_detail() {
        let frame = decode_frame(
            r#"{"type":"res","id":"42","ok":false,"error":{"code":"RATE_LIMITED","message":"slow down","retryable":true,"retryAfterMs":1500}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode res");
        let GatewayFrame::Res(res) = frame else {
            panic!("expected response frame");
        };
        let err = res.into_result().expect_err("error response");
        assert_eq!(err.code, "RATE_LIMITED");
        assert_eq!(err.retryable, Some(true));
        assert_eq!(err.retry_after_ms, Some(1500));
    }

    #[test]
    fn failed_response_without_error_body_still_fails() {
        let res = ResponseFrame {
            id: "1".to_string(),
            ok: false,
            payload: None,
            error: None,
        };
        assert_eq!(res.into_result().expect_err("must fail").code, "UNKNOWN");
    }

    #[test]
    fn connect_request_serializes_camel_case_fields() {
        let params = ConnectParams {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo {
                id: "tether-cli".to_string(),
                version: "0.1.0".to_string(),
                platform: "linux".to_string(),
                mode: "cli".to_string(),
                instance_id: Some("inst-1".to_string()),
            },
            role: "operator".to_string(),
            scopes: vec!["operator.read".to_string()],
            device: Some(DeviceBlock {
                id: "abc".to_string(),
                public_key: "pk".to_string(),
                signature: "sig".to_string(),
                signed_at: 1_700_000_000_000,
                nonce: Some("n-1".to_string()),
            }),
            auth: Some(ConnectAuth {
                token: Some("shared".to_string()),
                password: None,
            }),
            caps: Vec::new(),
            user_agent: None,
            locale: None,
        };
        let frame = GatewayFrame::Req(RequestFrame {
            id: "req-1".to_string(),
            method: CONNECT_METHOD.to_string(),
            params: serde_json::to_value(&params).expect("params"),
        });
        let text = encode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["type"], "req");
        assert_eq!(value["params"]["minProtocol"], json!(PROTOCOL_VERSION));
        assert_eq!(value["params"]["client"]["instanceId"], "inst-1");
        assert_eq!(value["params"]["device"]["signedAt"], json!(1_700_000_000_000_i64));
        assert_eq!(value["params"]["auth"]["token"], "shared");
        assert!(value["params"]["auth"].get("deviceToken").is_none());
    }

    #[test]
    fn hello_ok_tolerates_missing_optional_blocks() {
        let hello: HelloOk = serde_json::from_value(json!({
            "protocol": 3,
            "auth": {"deviceToken": "dt-1", "role": "operator", "scopes": ["operator.read"], "issuedAt": 5}
        }))
        .expect("hello");
        assert_eq!(hello.protocol, 3);
        assert!(hello.policy.is_none());
        let auth = hello.auth.expect("auth block");
        assert_eq!(auth.device_token.as_deref(), Some("dt-1"));
        assert_eq!(auth.issued_at, Some(5));
    }

    #[test]
    fn rejects_oversized_frames_both_ways() {
        let frame = GatewayFrame::Event(EventFrame {
            event: "blob".to_string(),
            payload: json!({"data": "x".repeat(256)}),
            seq: None,
        });
        assert!(matches!(
            encode_frame(&frame, 64),
            Err(FrameError::OversizedFrame { .. })
        ));
        let text = format!(r#"{{"type":"event","event":"{}"}}"#, "x".repeat(128));
        assert!(matches!(
            decode_frame(&text, 32),
            Err(FrameError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn malformed_json_is_a_decode_error() {
        assert!(matches!(
            decode_frame("{\"type\":\"event\"", DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::Decode(_))
        ));
        assert!(matches!(
            decode_frame(r#"{"type":"bogus","id":"1"}"#, DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::Decode(_))
        ));
    }
}
