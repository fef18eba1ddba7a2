//! RPC layer configuration with validation.
//!
//! Every section has defaults, so an empty TOML document is a valid
//! configuration. Durations are written as `"5s"`, `"250ms"` or `"2m"`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main RPC configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Call and connect timeouts
    pub timeouts: TimeoutConfig,
    /// Correlation registry housekeeping
    pub registry: RegistryConfig,
    /// Message-queue transport
    pub queue: QueueConfig,
    /// WebSocket transport
    pub socket: SocketConfig,
    /// Inbound dispatch
    pub dispatcher: DispatcherConfig,
}

impl RpcConfig {
    /// Parse from a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeouts.default_call.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "default_call timeout cannot be 0".into(),
            ));
        }

        if self.timeouts.connect.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "connect timeout cannot be 0".into(),
            ));
        }

        if self.registry.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "registry sweep_interval cannot be 0".into(),
            ));
        }

        if self.queue.result_queue.trim().is_empty() {
            return Err(ConfigError::Invalid("queue.result_queue is empty".into()));
        }

        if self.socket.path.is_empty() || !self.socket.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "socket.path must start with '/': {:?}",
                self.socket.path
            )));
        }

        if self.socket.scheme != "ws" && self.socket.scheme != "wss" {
            return Err(ConfigError::Invalid(format!(
                "socket.scheme must be ws or wss, got {}",
                self.socket.scheme
            )));
        }

        if self.socket.ping_interval.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "socket.ping_interval cannot be 0".into(),
            ));
        }

        if self.socket.max_message_size == 0 {
            return Err(ConfigError::InvalidLimit(
                "socket.max_message_size cannot be 0".into(),
            ));
        }

        if self.dispatcher.event_buffer == 0 {
            return Err(ConfigError::InvalidLimit(
                "dispatcher.event_buffer cannot be 0".into(),
            ));
        }

        self.queue.reconnect.validate()?;
        self.socket.reconnect.validate()?;

        Ok(())
    }
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Timeout used by `call_default`
    #[serde(with = "humantime_serde")]
    pub default_call: Duration,
    /// Upper bound on establishing one connection
    #[serde(with = "humantime_serde")]
    pub connect: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_call: Duration::from_secs(30),
            connect: Duration::from_secs(10),
        }
    }
}

/// Correlation registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// How often overdue entries are swept
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
        }
    }
}

/// Message-queue transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Durable queue this process consumes replies from
    pub result_queue: String,
    /// Request queues declared up front on every (re)connect
    pub request_queues: Vec<String>,
    /// Reconnection after an unexpected close
    pub reconnect: ReconnectPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            result_queue: "km.rpc.results".to_string(),
            request_queues: Vec::new(),
            reconnect: ReconnectPolicy::default_backoff(),
        }
    }
}

/// WebSocket transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// `ws` or `wss`
    pub scheme: String,
    /// Port every agent listens on
    pub agent_port: u16,
    /// Request path on the agent
    pub path: String,
    /// Try one connect from `send` when no connection is live
    pub lazy_connect: bool,
    /// Keepalive ping period
    #[serde(with = "humantime_serde")]
    pub ping_interval: Duration,
    /// Largest accepted inbound message in bytes
    pub max_message_size: usize,
    /// Reconnection after an unexpected close
    pub reconnect: ReconnectPolicy,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            scheme: "ws".to_string(),
            agent_port: 8765,
            path: "/ws".to_string(),
            lazy_connect: false,
            ping_interval: Duration::from_secs(20),
            max_message_size: 4 * 1024 * 1024,
            reconnect: ReconnectPolicy::Manual,
        }
    }
}

/// Inbound dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Capacity of channel-backed event handlers
    pub event_buffer: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { event_buffer: 256 }
    }
}

/// What a transport does after a connection closes unexpectedly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Reconnect automatically, doubling the delay up to `max`.
    Backoff {
        #[serde(with = "humantime_serde", default = "default_initial_delay")]
        initial: Duration,
        #[serde(with = "humantime_serde", default = "default_max_delay")]
        max: Duration,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        /// 0 retries forever
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
    },
    /// Stay disconnected until the owner asks for a reconnect.
    Manual,
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u32 {
    10
}

impl ReconnectPolicy {
    pub fn default_backoff() -> Self {
        Self::Backoff {
            initial: default_initial_delay(),
            max: default_max_delay(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, Self::Manual)
    }

    /// Delay before reconnect attempt `attempt` (0-based), or `None` once
    /// the attempts are exhausted or the policy is manual.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match *self {
            Self::Manual => None,
            Self::Backoff {
                initial,
                max,
                multiplier,
                max_attempts,
            } => {
                if max_attempts != 0 && attempt >= max_attempts {
                    return None;
                }
                let factor = multiplier.powi(attempt.min(32) as i32);
                let delay = initial.as_secs_f64() * factor;
                Some(Duration::from_secs_f64(delay.min(max.as_secs_f64())))
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Self::Backoff {
            initial,
            max,
            multiplier,
            ..
        } = self
        {
            if initial.is_zero() || max < initial {
                return Err(ConfigError::InvalidTimeout(
                    "reconnect delays must satisfy 0 < initial <= max".into(),
                ));
            }
            if !multiplier.is_finite() || *multiplier < 1.0 {
                return Err(ConfigError::Invalid(
                    "reconnect multiplier must be >= 1.0".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Document could not be parsed
    #[error("parse error: {0}")]
    Parse(String),
    /// Invalid size or count limit
    #[error("invalid limit: {0}")]
    InvalidLimit(String),
    /// Invalid timeout value
    #[error("invalid timeout: {0}")]
    InvalidTimeout(String),
    /// General configuration error
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Humantime serde module for Duration serialization
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse_duration(s: &str) -> Result<Duration, &'static str> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| "invalid milliseconds")
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid seconds")
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.trim()
                .parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(|_| "invalid minutes")
        } else {
            // Plain number is seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| "invalid duration format")
        }
    }
}
