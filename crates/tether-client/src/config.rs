use crate::error::ClientError;
use std::time::Duration;
use tether_core::frames::DEFAULT_MAX_FRAME_BYTES;
use url::Url;

pub const DEFAULT_GATEWAY_URL: &str = "ws://127.0.0.1:18789";
pub const DEFAULT_ROLE: &str = "operator";
pub const DEFAULT_CHALLENGE_GRACE: Duration = Duration::from_millis(750);
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(800),
            factor: 1.7,
            max: Duration::from_secs(15),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub url: String,
    pub client_id: String,
    pub client_version: String,
    pub platform: String,
    pub mode: String,
    pub instance_id: String,
    pub role: String,
    pub scopes: Vec<String>,
    /// Key under which issued device tokens are cached. Defaults to the
    /// gateway origin.
    pub scope_key: Option<String>,
    pub token: Option<String>,
    pub password: Option<String>,
    pub caps: Vec<String>,
    pub user_agent: Option<String>,
    pub locale: Option<String>,
    pub challenge_grace: Duration,
    pub backoff: BackoffPolicy,
    pub default_tick_interval: Duration,
    pub max_frame_bytes: usize,
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_GATEWAY_URL.to_string(),
            client_id: "tether".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            platform: std::env::consts::OS.to_string(),
            mode: "cli".to_string(),
            instance_id: uuid::Uuid::new_v4().to_string(),
            role: DEFAULT_ROLE.to_string(),
            scopes: vec!["operator.read".to_string(), "operator.write".to_string()],
            scope_key: None,
            token: None,
            password: None,
            caps: Vec::new(),
            user_agent: Some(format!("tether/{}", env!("CARGO_PKG_VERSION"))),
            locale: None,
            challenge_grace: DEFAULT_CHALLENGE_GRACE,
            backoff: BackoffPolicy::default(),
            default_tick_interval: DEFAULT_TICK_INTERVAL,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            event_buffer: 1024,
        }
    }
}

impl ClientConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<Url, ClientError> {
        let url = Url::parse(&self.url)
            .map_err(|err| ClientError::Config(format!("invalid gateway url {}: {err}", self.url)))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(ClientError::Config(format!(
                    "gateway url must use ws or wss, got {other}"
                )))
            }
        }
        if self.role.trim().is_empty() {
            return Err(ClientError::Config("role must not be empty".to_string()));
        }
        Ok(url)
    }

    /// Scope component of the token cache key.
    pub fn connection_scope(&self) -> String {
        if let Some(scope) = self
            .scope_key
            .as_deref()
            .map(str::trim)
            .filter(|scope| !scope.is_empty())
        {
            return scope.to_string();
        }
        match Url::parse(&self.url) {
            Ok(url) => url.origin().ascii_serialization(),
            Err(_) => self.url.clone(),
        }
    }

    pub(crate) fn has_fallback_credential(&self) -> bool {
        non_empty(self.token.as_deref()).is_some() || non_empty(self.password.as_deref()).is_some()
    }
}

pub(crate) fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_scope_defaults_to_origin() {
        let config = ClientConfig::with_url("ws://gw.local:18789/socket?x=1");
        assert_eq!(config.connection_scope(), "ws://gw.local:18789");

        let explicit = ClientConfig {
            scope_key: Some("team-a".to_string()),
            ..config
        };
        assert_eq!(explicit.connection_scope(), "team-a");
    }

    #[test]
    fn validate_rejects_non_websocket_urls() {
        assert!(ClientConfig::with_url("http://gw.local").validate().is_err());
        assert!(ClientConfig::with_url("not a url").validate().is_err());
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn fallback_credential_ignores_blank_values() {
        let mut config = ClientConfig::default();
        assert!(!config.has_fallback_credential());
        config.token = Some("  ".to_string());
        assert!(!config.has_fallback_credential());
        config.password = Some("pw".to_string());
        assert!(config.has_fallback_credential());
    }
}
