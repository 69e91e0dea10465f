//! Session configuration.
//!
//! Configuration can be built in code or read from a JSON document:
//!
//! ```
//! use topicwire_client::session::SessionConfig;
//!
//! let config = SessionConfig::from_json(r#"{
//!     "reconnection": { "enabled": true, "interval_ms": 2000, "timeout_ms": 30000 },
//!     "max_outbound_queue": 256
//! }"#).unwrap();
//! assert_eq!(config.max_outbound_queue, 256);
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SessionError};
use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;

/// Default delay between reconnection attempts.
pub const DEFAULT_RECONNECTION_INTERVAL: Duration = Duration::from_secs(5);

/// Default time allowed for reconnection before the session closes.
pub const DEFAULT_RECONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of frames held while recovering.
pub const DEFAULT_MAX_OUTBOUND_QUEUE: usize = 1024;

/// Reconnection policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    /// Recover lost connections instead of closing the session.
    pub enabled: bool,

    /// Delay between attempts.
    #[serde(with = "duration_ms", rename = "interval_ms")]
    pub interval: Duration,

    /// Give up once this much time has passed since the connection was lost.
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_RECONNECTION_INTERVAL,
            timeout: DEFAULT_RECONNECTION_TIMEOUT,
        }
    }
}

impl ReconnectionConfig {
    /// No reconnection: a lost connection closes the session.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Builder: set the delay between attempts.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Builder: set the overall reconnection timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.interval.is_zero() {
            return Err(SessionError::InvalidArgument(
                "reconnection interval must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings for one session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub reconnection: ReconnectionConfig,

    /// Frames held while recovering before further sends fail with
    /// `QueueFull`.
    pub max_outbound_queue: usize,

    /// Inbound envelopes declaring a larger payload are protocol errors.
    pub max_payload_size: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnection: ReconnectionConfig::default(),
            max_outbound_queue: DEFAULT_MAX_OUTBOUND_QUEUE,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

impl SessionConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SessionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        self.reconnection.validate()?;
        if self.max_outbound_queue == 0 {
            return Err(SessionError::InvalidArgument(
                "max_outbound_queue must be > 0".to_string(),
            ));
        }
        if self.max_payload_size == 0 {
            return Err(SessionError::InvalidArgument(
                "max_payload_size must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Durations written as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
