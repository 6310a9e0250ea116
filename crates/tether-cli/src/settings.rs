use anyhow::{bail, Result};
use std::path::PathBuf;
use tether_client::config::DEFAULT_GATEWAY_URL;
use tether_client::ClientConfig;

pub const ENV_GATEWAY_URL: &str = "TETHER_GATEWAY_URL";
pub const ENV_GATEWAY_TOKEN: &str = "TETHER_GATEWAY_TOKEN";
pub const ENV_GATEWAY_PASSWORD: &str = "TETHER_GATEWAY_PASSWORD";
pub const ENV_STATE_DIR: &str = "TETHER_STATE_DIR";
pub const ENV_LOG_DIR: &str = "TETHER_LOG_DIR";
pub const ENV_LOG_LEVEL: &str = "TETHER_LOG_LEVEL";
pub const ENV_LOG_STDOUT: &str = "TETHER_LOG_STDOUT";

const STORE_FILE: &str = "device.sqlite3";

/// Values given on the command line; each wins over its environment variable.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub url: Option<String>,
    pub token: Option<String>,
    pub password: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub log_stdout: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub gateway_url: String,
    pub token: Option<String>,
    pub password: Option<String>,
    pub state_dir: PathBuf,
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
    pub log_stdout: bool,
}

impl Settings {
    pub fn resolve<F>(overrides: Overrides, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |flag: Option<String>, key: &str| {
            flag.filter(|value| !value.trim().is_empty())
                .or_else(|| env(key).filter(|value| !value.trim().is_empty()))
        };
        let gateway_url = lookup(overrides.url, ENV_GATEWAY_URL)
            .unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string());
        if !(gateway_url.starts_with("ws://") || gateway_url.starts_with("wss://")) {
            bail!("gateway url must use ws:// or wss://, got {gateway_url}");
        }
        let state_dir = overrides
            .state_dir
            .or_else(|| lookup(None, ENV_STATE_DIR).map(PathBuf::from))
            .unwrap_or_else(default_state_dir);
        let log_dir = overrides
            .log_dir
            .or_else(|| lookup(None, ENV_LOG_DIR).map(PathBuf::from));
        let log_stdout = overrides.log_stdout
            || lookup(None, ENV_LOG_STDOUT).is_some_and(|value| is_truthy(&value));
        Ok(Self {
            gateway_url,
            token: lookup(overrides.token, ENV_GATEWAY_TOKEN),
            password: lookup(overrides.password, ENV_GATEWAY_PASSWORD),
            state_dir,
            log_dir,
            log_level: lookup(None, ENV_LOG_LEVEL).unwrap_or_else(|| "info".to_string()),
            log_stdout,
        })
    }

    pub fn store_path(&self) -> PathBuf {
        self.state_dir.join(STORE_FILE)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            token: self.token.clone(),
            password: self.password.clone(),
            client_id: "tether-cli".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            ..ClientConfig::with_url(self.gateway_url.clone())
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("tether"))
        .unwrap_or_else(|| PathBuf::from(".tether"))
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_flags_or_env() {
        let settings = Settings::resolve(Overrides::default(), env_from(&[])).expect("settings");
        assert_eq!(settings.gateway_url, DEFAULT_GATEWAY_URL);
        assert_eq!(settings.token, None);
        assert_eq!(settings.log_level, "info");
        assert!(!settings.log_stdout);
        assert!(settings.store_path().ends_with(STORE_FILE));
    }

    #[test]
    fn flags_win_over_environment() {
        let env = env_from(&[
            (ENV_GATEWAY_URL, "wss://env.example"),
            (ENV_GATEWAY_TOKEN, "env-token"),
            (ENV_STATE_DIR, "/tmp/env-state"),
            (ENV_LOG_STDOUT, "yes"),
            (ENV_LOG_LEVEL, "debug"),
        ]);
        let overrides = Overrides {
            url: Some("ws://flag.example:1".to_string()),
            state_dir: Some(PathBuf::from("/tmp/flag-state")),
            ..Overrides::default()
        };
        let settings = Settings::resolve(overrides, env).expect("settings");
        assert_eq!(settings.gateway_url, "ws://flag.example:1");
        assert_eq!(settings.token.as_deref(), Some("env-token"));
        assert_eq!(settings.state_dir, PathBuf::from("/tmp/flag-state"));
        assert!(settings.log_stdout);
        assert_eq!(settings.log_level, "debug");

        let config = settings.client_config();
        assert_eq!(config.url, "ws://flag.example:1");
        assert_eq!(config.token.as_deref(), Some("env-token"));
    }

    #[test]
    fn blank_values_fall_through_and_bad_schemes_fail() {
        let env = env_from(&[(ENV_GATEWAY_TOKEN, "  ")]);
        let settings = Settings::resolve(Overrides::default(), env).expect("settings");
        assert_eq!(settings.token, None);

        let overrides = Overrides {
            url: Some("http://gateway".to_string()),
            ..Overrides::default()
        };
        assert!(Settings::resolve(overrides, env_from(&[])).is_err());
    }
}
