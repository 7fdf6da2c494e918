//! Transport and collaboration configuration.
//!
//! Both configs deserialize from camelCase JSON with durations in
//! milliseconds, matching the options the web client passes around.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::presence::color_for_user;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Transport client configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    /// WebSocket endpoint (`ws://` or `wss://`)
    pub url: String,
    /// Base delay for exponential reconnect backoff
    #[serde(with = "millis")]
    pub reconnect_interval: Duration,
    /// Automatic attempts before the client gives up (`failed`)
    pub max_reconnect_attempts: u32,
    #[serde(with = "millis")]
    pub heartbeat_interval: Duration,
    /// Envelopes retained while disconnected (oldest evicted first)
    pub message_queue_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".to_string(),
            reconnect_interval: Duration::from_millis(1000),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(30),
            message_queue_size: 100,
        }
    }
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(ConfigError::Invalid("url must use ws:// or wss://"));
        }
        if self.reconnect_interval.is_zero() {
            return Err(ConfigError::Invalid("reconnectInterval must be positive"));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid("heartbeatInterval must be positive"));
        }
        if self.message_queue_size == 0 {
            return Err(ConfigError::Invalid("messageQueueSize must be positive"));
        }
        Ok(())
    }
}

/// Strategy hint for concurrent document edits.
///
/// Only `OperationalTransform` rewrites incoming operations; the other
/// strategies forward them as received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    LatestWins,
    Manual,
    OperationalTransform,
}

/// Per-project collaboration session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollabConfig {
    pub project_id: String,
    pub user_id: String,
    pub user_name: String,
    #[serde(default)]
    pub user_color: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default = "default_conflict_resolution")]
    pub conflict_resolution: ConflictResolution,
    #[serde(default = "enabled")]
    pub enable_cursor_tracking: bool,
    #[serde(default = "enabled")]
    pub enable_typing_indicators: bool,
    #[serde(default = "enabled")]
    pub enable_operational_transform: bool,
    #[serde(default = "default_operations_buffer")]
    pub max_operations_buffer: usize,
    /// Reserved for periodic resync
    #[serde(default = "default_sync_interval", with = "millis")]
    pub sync_interval: Duration,
}

fn default_conflict_resolution() -> ConflictResolution {
    ConflictResolution::OperationalTransform
}

fn enabled() -> bool {
    true
}

fn default_operations_buffer() -> usize {
    100
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(30)
}

impl CollabConfig {
    /// Config with defaults; the color is derived from the user id.
    pub fn new(
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
    ) -> Self {
        let user_id = user_id.into();
        Self {
            project_id: project_id.into(),
            user_color: color_for_user(&user_id),
            user_id,
            user_name: user_name.into(),
            avatar: None,
            conflict_resolution: default_conflict_resolution(),
            enable_cursor_tracking: true,
            enable_typing_indicators: true,
            enable_operational_transform: true,
            max_operations_buffer: default_operations_buffer(),
            sync_interval: default_sync_interval(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let mut config: Self =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        if config.user_color.is_empty() {
            config.user_color = color_for_user(&config.user_id);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_id.is_empty() {
            return Err(ConfigError::Invalid("projectId must not be empty"));
        }
        if self.user_id.is_empty() {
            return Err(ConfigError::Invalid("userId must not be empty"));
        }
        if self.max_operations_buffer == 0 {
            return Err(ConfigError::Invalid("maxOperationsBuffer must be positive"));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
