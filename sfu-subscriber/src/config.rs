//! Subscriber configuration

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::MediaKind;

/// Subscriber configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriberConfig {
    pub signaling: SignalingConfig,
    pub consume: ConsumeConfig,
    pub playback: PlaybackConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// How long `connect` waits for the server's welcome message
    pub handshake_timeout_ms: u64,
    /// Upper bound on a single request/acknowledgement round trip
    pub request_timeout_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl SignalingConfig {
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumeConfig {
    /// Media kinds requested on every `subscribe`
    pub kinds: Vec<MediaKind>,
}

impl Default for ConsumeConfig {
    fn default() -> Self {
        Self {
            kinds: vec![MediaKind::Audio],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Output level applied once playback has started (0.0 - 1.0)
    pub volume: f32,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self { volume: 1.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl SubscriberConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // SFU_SUBSCRIBER_SIGNALING__REQUEST_TIMEOUT_MS, etc.
        builder = builder.add_source(
            Environment::with_prefix("SFU_SUBSCRIBER")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("consume.kinds")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Check the configuration for values the subscriber cannot run with.
    ///
    /// Returns every problem found rather than stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.signaling.handshake_timeout_ms == 0 {
            errors.push("signaling.handshake_timeout_ms must be greater than 0".to_string());
        }
        if self.signaling.request_timeout_ms == 0 {
            errors.push("signaling.request_timeout_ms must be greater than 0".to_string());
        }
        if self.consume.kinds.is_empty() {
            errors.push("consume.kinds must name at least one media kind".to_string());
        }
        if !(0.0..=1.0).contains(&self.playback.volume) {
            errors.push(format!(
                "playback.volume must be within 0.0..=1.0, got {}",
                self.playback.volume
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
