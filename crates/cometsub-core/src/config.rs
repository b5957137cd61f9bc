//! Subscriber configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Options recognised by the connection and subscription layers.
///
/// Keys are camelCase on the wire so a config file reads
/// `{"address": "ws://localhost:26657/websocket", "autoReconnect": true}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberConfig {
    /// Node endpoint, e.g. `ws://localhost:26657/websocket`.
    #[serde(default)]
    pub address: String,
    /// Reconnect after transport failures and liveness timeouts.
    #[serde(default)]
    pub auto_reconnect: bool,
    /// Fixed delay before a reconnect attempt.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Period between heartbeat probes while connected.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// How long after a probe some activity must be seen.
    #[serde(default = "default_heartbeat_ack_timeout_ms")]
    pub heartbeat_ack_timeout_ms: u64,
    /// Maximum gap between two received frames/acks.
    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,
    /// Upper bound on waiting for a subscribe/unsubscribe response.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_reconnect_delay_ms() -> u64 { 5_000 }
fn default_heartbeat_interval_ms() -> u64 { 30_000 }
fn default_heartbeat_ack_timeout_ms() -> u64 { 10_000 }
fn default_silence_timeout_ms() -> u64 { 120_000 }
fn default_request_timeout_ms() -> u64 { 30_000 }

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            auto_reconnect: false,
            reconnect_delay_ms: default_reconnect_delay_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_ack_timeout_ms: default_heartbeat_ack_timeout_ms(),
            silence_timeout_ms: default_silence_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl SubscriberConfig {
    /// Default options for the given node address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON config document. Missing keys take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Read and parse a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json_str(&text)
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = millis(delay);
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, ack_timeout: Duration) -> Self {
        self.heartbeat_interval_ms = millis(interval);
        self.heartbeat_ack_timeout_ms = millis(ack_timeout);
        self
    }

    pub fn with_silence_timeout(mut self, timeout: Duration) -> Self {
        self.silence_timeout_ms = millis(timeout);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = millis(timeout);
        self
    }

    /// Reject configs the connection manager cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::MissingAddress);
        }
        let timers = [
            ("reconnectDelayMs", self.reconnect_delay_ms),
            ("heartbeatIntervalMs", self.heartbeat_interval_ms),
            ("heartbeatAckTimeoutMs", self.heartbeat_ack_timeout_ms),
            ("silenceTimeoutMs", self.silence_timeout_ms),
            ("requestTimeoutMs", self.request_timeout_ms),
        ];
        for (field, value) in timers {
            if value == 0 {
                return Err(ConfigError::ZeroDuration { field });
            }
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ack_timeout_ms)
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
