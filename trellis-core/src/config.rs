//! Runtime configuration.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default pause between two values pulled from a producer (one display frame).
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 16;

/// Error type for configuration parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Malformed configuration document.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Tunables for a [`Runtime`](crate::reactive::Runtime).
///
/// Missing fields take their defaults, so `{}` is a valid document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Milliseconds a producer driver waits after publishing a value before
    /// requesting the next one. `0` only yields to the executor.
    pub frame_interval_ms: u64,
}

impl RuntimeConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(source: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(source)?)
    }

    /// Set the producer frame interval.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// The producer frame interval as a [`Duration`].
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: DEFAULT_FRAME_INTERVAL_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = RuntimeConfig::from_json("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.frame_interval(), Duration::from_millis(16));
    }

    #[test]
    fn frame_interval_is_read() {
        let config = RuntimeConfig::from_json(r#"{"frame_interval_ms": 0}"#).unwrap();
        assert_eq!(config.frame_interval(), Duration::ZERO);
    }

    #[test]
    fn malformed_document_is_rejected() {
        let err = RuntimeConfig::from_json(r#"{"frame_interval_ms": "fast"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Serde(_)));
    }

    #[test]
    fn builder_overrides_interval() {
        let config = RuntimeConfig::default().with_frame_interval(Duration::from_millis(5));
        assert_eq!(config.frame_interval_ms, 5);
    }
}
