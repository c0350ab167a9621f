//! Configuration for the voice client
//!
//! Provides centralized configuration for all components. Every field has a
//! default matching the tuned values of the ordering kiosk, so an empty TOML
//! file (or no file at all) yields a working client.
//!
//! Sources are layered: defaults, then an optional TOML file, then the
//! `ORDERVOICE_WS_URL` environment variable for the agent endpoint.

use crate::audio::level::LevelConfig;
use crate::controller::ListenConfig;
use crate::recorder::RecorderConfig;
use crate::transport::TransportConfig;
use crate::vad::VadConfig;
use crate::{Result, VoiceError};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Environment variable overriding the agent WebSocket endpoint
pub const WS_URL_ENV: &str = "ORDERVOICE_WS_URL";

/// Configuration for the complete client
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Agent connection settings
    pub transport: TransportConfig,

    /// Loudness analyser settings
    pub level: LevelConfig,

    /// Voice activity detection settings
    pub vad: VadConfig,

    /// Utterance validation settings
    pub recorder: RecorderConfig,

    /// Listen/re-arm timing
    pub listen: ListenConfig,

    /// Control loop tick in milliseconds (level polling cadence)
    pub poll_interval_ms: u64,

    /// Buffer size for the snapshot stream
    pub channel_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            level: LevelConfig::default(),
            vad: VadConfig::default(),
            recorder: RecorderConfig::default(),
            listen: ListenConfig::default(),
            poll_interval_ms: 16,
            channel_buffer_size: 100,
        }
    }
}

impl ClientConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            VoiceError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config = Self::from_toml_str(&content)?.with_env_overrides();
        config.validate()?;

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| VoiceError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Apply overrides from the process environment
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(WS_URL_ENV) {
            if !url.trim().is_empty() {
                debug!("Using {} from environment", WS_URL_ENV);
                self.transport.url = url.trim().to_string();
            }
        }
        self
    }

    /// Set the agent endpoint
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.transport.url = url.into();
        self
    }

    /// Set the VAD configuration
    pub fn with_vad(mut self, vad: VadConfig) -> Self {
        self.vad = vad;
        self
    }

    /// Set the analyser configuration
    pub fn with_level(mut self, level: LevelConfig) -> Self {
        self.level = level;
        self
    }

    /// Set the recorder configuration
    pub fn with_recorder(mut self, recorder: RecorderConfig) -> Self {
        self.recorder = recorder;
        self
    }

    /// Set listen/re-arm timing
    pub fn with_listen(mut self, listen: ListenConfig) -> Self {
        self.listen = listen;
        self
    }

    /// Set the control loop tick
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let url = self.transport.url.as_str();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(VoiceError::ConfigError(format!(
                "Agent URL must use ws:// or wss://, got {:?}",
                url
            )));
        }

        if self.poll_interval_ms == 0 {
            return Err(VoiceError::ConfigError(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }

        if self.channel_buffer_size == 0 {
            return Err(VoiceError::ConfigError(
                "channel_buffer_size must be greater than zero".to_string(),
            ));
        }

        self.level.validate()?;
        self.vad.validate()?;
        Ok(())
    }
}
