use crate::config::{non_empty, ClientConfig};
use crate::error::ClientError;
use crate::identity::{build_signing_payload, DeviceIdentity, SigningPayload};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tether_core::frames::{
    ClientInfo, ConnectAuth, ConnectParams, DeviceBlock, ErrorShape, HelloOk, PROTOCOL_VERSION,
};
use tether_storage::{AuthTokenStore, StoredAuthToken, TokenKey};
use tracing::{info, warn};

/// A connect request ready to send, plus what the negotiator needs to
/// interpret the gateway's answer.
#[derive(Debug, Clone)]
pub struct PreparedConnect {
    pub params: ConnectParams,
    token_key: TokenKey,
    sent_cached_token: bool,
    // Shared token or password configured, usable once the cached token is gone.
    sent_fallback: bool,
}

impl PreparedConnect {
    pub fn sent_cached_token(&self) -> bool {
        self.sent_cached_token
    }
}

/// Builds signed connect requests and applies handshake outcomes to the
/// device token cache.
pub struct Negotiator {
    config: ClientConfig,
    identity: DeviceIdentity,
    tokens: Arc<dyn AuthTokenStore>,
}

impl Negotiator {
    pub fn new(config: ClientConfig, identity: DeviceIdentity, tokens: Arc<dyn AuthTokenStore>) -> Self {
        Self {
            config,
            identity,
            tokens,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn token_key(&self) -> TokenKey {
        TokenKey::new(
            self.identity.device_id(),
            self.config.connection_scope(),
            self.config.role.clone(),
        )
    }

    pub fn prepare(&self, nonce: Option<&str>) -> PreparedConnect {
        self.prepare_at(nonce, Utc::now().timestamp_millis())
    }

    pub fn prepare_at(&self, nonce: Option<&str>, signed_at_ms: i64) -> PreparedConnect {
        let token_key = self.token_key();
        let cached = match self.tokens.load_token(&token_key) {
            Ok(cached) => cached.filter(|cached| !cached.token.trim().is_empty()),
            Err(err) => {
                warn!(event = "device_token_load_error", error = %err);
                None
            }
        };

        // `auth.token` is the cached device token, else the shared token.
        // The signature covers exactly that value.
        let token = cached
            .as_ref()
            .map(|cached| cached.token.clone())
            .or_else(|| non_empty(self.config.token.as_deref()).map(str::to_string));
        let auth = ConnectAuth {
            token: token.clone(),
            password: non_empty(self.config.password.as_deref()).map(str::to_string),
        };
        let signature_input = build_signing_payload(&SigningPayload {
            device_id: self.identity.device_id(),
            client_id: &self.config.client_id,
            client_mode: &self.config.mode,
            role: &self.config.role,
            scopes: &self.config.scopes,
            signed_at_ms,
            token: token.as_deref().unwrap_or_default(),
            nonce,
        });

        let params = ConnectParams {
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            client: ClientInfo {
                id: self.config.client_id.clone(),
                version: self.config.client_version.clone(),
                platform: self.config.platform.clone(),
                mode: self.config.mode.clone(),
                instance_id: Some(self.config.instance_id.clone()),
            },
            role: self.config.role.clone(),
            scopes: self.config.scopes.clone(),
            device: Some(DeviceBlock {
                id: self.identity.device_id().to_string(),
                public_key: self.identity.public_key_base64(),
                signature: self.identity.sign(&signature_input),
                signed_at: signed_at_ms,
                nonce: nonce.map(str::to_string),
            }),
            auth: (!auth.is_empty()).then_some(auth),
            caps: self.config.caps.clone(),
            user_agent: self.config.user_agent.clone(),
            locale: self.config.locale.clone(),
        };

        PreparedConnect {
            params,
            token_key,
            sent_cached_token: cached.is_some(),
            sent_fallback: self.config.has_fallback_credential(),
        }
    }

    pub fn complete(
        &self,
        prepared: &PreparedConnect,
        response: Result<Value, ErrorShape>,
    ) -> Result<HelloOk, ClientError> {
        match response {
            Ok(payload) => {
                let hello: HelloOk = serde_json::from_value(payload)
                    .map_err(|err| ClientError::Protocol(format!("invalid hello payload: {err}")))?;
                self.store_issued_token(prepared, &hello);
                Ok(hello)
            }
            Err(error) => {
                let evict = prepared.sent_cached_token && prepared.sent_fallback;
                if evict {
                    match self.tokens.clear_token(&prepared.token_key) {
                        Ok(_) => warn!(
                            event = "device_token_evicted",
                            scope = %prepared.token_key.scope,
                            role = %prepared.token_key.role,
                            code = %error.code
                        ),
                        Err(err) => warn!(event = "device_token_evict_error", error = %err),
                    }
                }
                Err(ClientError::Auth {
                    code: error.code,
                    message: error.message,
                    retryable: evict,
                })
            }
        }
    }

    fn store_issued_token(&self, prepared: &PreparedConnect, hello: &HelloOk) {
        let Some(auth) = hello.auth.as_ref() else {
            return;
        };
        let Some(token) = non_empty(auth.device_token.as_deref()) else {
            return;
        };
        let scopes = if auth.scopes.is_empty() {
            self.config.scopes.clone()
        } else {
            auth.scopes.clone()
        };
        let record = StoredAuthToken {
            token: token.to_string(),
            scopes,
            updated_at_ms: auth
                .issued_at
                .unwrap_or_else(|| Utc::now().timestamp_millis()),
        };
        match self.tokens.store_token(&prepared.token_key, &record) {
            Ok(()) => info!(
                event = "device_token_stored",
                scope = %prepared.token_key.scope,
                role = %prepared.token_key.role
            ),
            Err(err) => warn!(event = "device_token_store_error", error = %err),
        }
    }
}
