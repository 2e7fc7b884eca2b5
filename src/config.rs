//! Configuration for the realtime voice client
//!
//! Loaded from TOML (default: the platform config dir, e.g.
//! `~/.config/realtime-voice/config.toml` on Linux), then overridden by
//! `REALTIME_*` environment variables.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::voice::protocol::SessionConfig;
use crate::voice::vad::VadConfig;

/// Config file name inside the project config directory
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Client configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transport and reconnect policy
    pub connection: ConnectionConfig,

    /// Session draft sent with `session.update`
    pub session: SessionConfig,

    /// Voice activity pipeline tuning
    pub vad: VadConfig,
}

/// Connection lifecycle configuration
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Endpoint scheme and host (e.g. `wss://open.bigmodel.cn`)
    pub endpoint: String,

    /// Realtime path appended to the endpoint
    pub path: String,

    /// Opaque auth token, sent as the `Authorization` query parameter
    pub api_key: String,

    /// Reconnect attempts per failure episode before giving up
    pub max_reconnect_attempts: u32,

    /// Linear backoff unit: attempt `n` waits `n * reconnect_base_delay_ms`
    pub reconnect_base_delay_ms: u64,

    /// Heartbeat period while open
    pub heartbeat_interval_secs: u64,

    /// Delay between `session.created` and the automatic `session.update`
    pub session_update_delay_ms: u64,

    /// Handshake timeout for a single dial
    pub connect_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://open.bigmodel.cn".into(),
            path: "/api/paas/v4/realtime".into(),
            api_key: String::new(),
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 2000,
            heartbeat_interval_secs: 30,
            session_update_delay_ms: 100,
            connect_timeout_secs: 10,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("endpoint", &self.endpoint)
            .field("path", &self.path)
            .field("api_key", &redact(&self.api_key))
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("reconnect_base_delay_ms", &self.reconnect_base_delay_ms)
            .field("heartbeat_interval_secs", &self.heartbeat_interval_secs)
            .field("session_update_delay_ms", &self.session_update_delay_ms)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl ConnectionConfig {
    /// Full connection URL with the auth token as a query parameter
    pub fn url(&self) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        let path = if self.path.starts_with('/') || self.path.is_empty() {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!(
            "{endpoint}{path}?Authorization={}",
            urlencoding::encode(&self.api_key)
        )
    }

    /// Same as [`Self::url`] with the token masked, for logs
    pub fn redacted_url(&self) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        format!("{endpoint}{}?Authorization=***", self.path)
    }

    /// Backoff before reconnect attempt `attempt` (1-based)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn session_update_delay(&self) -> Duration {
        Duration::from_millis(self.session_update_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Checks that must hold before dialing
    pub fn validate_for_connect(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(Error::Config(
                "missing api key (set REALTIME_API_KEY or connection.api_key)".into(),
            ));
        }
        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "endpoint must use ws:// or wss://, got {}",
                self.endpoint
            )));
        }
        Ok(())
    }
}

fn redact(secret: &str) -> &'static str {
    if secret.is_empty() {
        "<unset>"
    } else {
        "***"
    }
}

impl Config {
    /// Load configuration from `path`, or from the default location.
    ///
    /// An explicit path must exist. A missing default file yields defaults.
    /// Environment overrides are applied afterwards.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "Loaded config file");
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// `<config dir>/config.toml` for this project, if a home directory exists
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "realtime-voice", "realtime-voice")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Apply `REALTIME_*` overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup; empty values are ignored
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(key) = get("REALTIME_API_KEY") {
            self.connection.api_key = key;
        }
        if let Some(endpoint) = get("REALTIME_ENDPOINT") {
            self.connection.endpoint = endpoint;
        }
        if let Some(path) = get("REALTIME_PATH") {
            self.connection.path = path;
        }
        if let Some(model) = get("REALTIME_MODEL") {
            self.session.model = model;
        }
        if let Some(voice) = get("REALTIME_VOICE") {
            self.session.voice = voice;
        }
    }

    /// Structural checks; the api key is checked at connect time
    pub fn validate(&self) -> Result<()> {
        if self.connection.max_reconnect_attempts == 0 {
            return Err(Error::Config(
                "connection.max_reconnect_attempts must be at least 1".into(),
            ));
        }
        if self.connection.heartbeat_interval_secs == 0 {
            return Err(Error::Config(
                "connection.heartbeat_interval_secs must be at least 1".into(),
            ));
        }
        self.vad.validate()
    }

    /// TOML rendering with the api key masked
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if !shown.connection.api_key.is_empty() {
            shown.connection.api_key = "***".into();
        }
        toml::to_string_pretty(&shown).map_err(|e| Error::Config(e.to_string()))
    }
}
