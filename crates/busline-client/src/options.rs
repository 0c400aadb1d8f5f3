//! Client configuration.
//!
//! [`ClientOptions`] bundles the retry and connection settings every busline
//! facade takes. It can be built in code or loaded from a TOML file:
//!
//! ```toml
//! [retry]
//! mode = "exponential"
//! max_retries = 3
//! delay_ms = 800
//! max_delay_ms = 60000
//! try_timeout_ms = 60000
//! jitter = 0.08
//!
//! [connection]
//! transport_type = "amqp_web_sockets"
//! proxy = "http://proxy.internal:3128"
//! ```
//!
//! Durations are written in milliseconds. Missing keys fall back to defaults.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How the delay between retries grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    Fixed,
    Exponential,
}

/// Retry configuration consumed by [`crate::retry::BasicRetryPolicy`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    pub mode: RetryMode,

    /// Retries after the first attempt; 0 disables retrying.
    pub max_retries: u32,

    /// Fixed delay, or the base of the exponential curve.
    #[serde(rename = "delay_ms", with = "duration_ms")]
    pub delay: Duration,

    /// Upper bound on any single delay.
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,

    /// Deadline for one attempt.
    #[serde(rename = "try_timeout_ms", with = "duration_ms")]
    pub try_timeout: Duration,

    /// Random spread applied to each delay, as a fraction in `[0, 1]`.
    pub jitter: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            mode: RetryMode::Exponential,
            max_retries: 3,
            delay: Duration::from_millis(800),
            max_delay: Duration::from_secs(60),
            try_timeout: Duration::from_secs(60),
            jitter: 0.08,
        }
    }
}

/// Framing of the underlying connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    /// Direct TCP connection.
    #[default]
    AmqpTcp,
    /// Tunnelled over web sockets, optionally through a proxy.
    AmqpWebSockets,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub transport_type: TransportType,
    pub proxy: Option<String>,
}

/// Options shared by connections, senders and receivers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    pub retry: RetryOptions,
    pub connection: ConnectionOptions,
}

impl ClientOptions {
    /// Parse options from TOML text and validate them.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let options: ClientOptions =
            toml::from_str(contents).map_err(|e| ClientError::ConfigError(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a TOML file, or defaults if the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(ClientOptions::default());
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ClientError::ConfigError(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ClientError::ConfigError(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let retry = &self.retry;
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(ClientError::ConfigError(format!(
                "retry.jitter must be within [0, 1], got {}",
                retry.jitter
            )));
        }
        if retry.try_timeout.is_zero() {
            return Err(ClientError::ConfigError(
                "retry.try_timeout must be greater than zero".to_string(),
            ));
        }
        if retry.max_delay < retry.delay {
            return Err(ClientError::ConfigError(format!(
                "retry.max_delay ({:?}) is shorter than retry.delay ({:?})",
                retry.max_delay, retry.delay
            )));
        }
        if self.connection.proxy.is_some()
            && self.connection.transport_type != TransportType::AmqpWebSockets
        {
            return Err(ClientError::ConfigError(
                "a proxy requires the amqp_web_sockets transport".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
