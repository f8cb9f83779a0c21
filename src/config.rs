//! Configuration system for the pump bridge
//!
//! Broker endpoint, topic names and store defaults come from a TOML file.
//! Credentials never live in the file: only the names of the environment
//! variables holding them do.

use crate::protocol::topics::{validate_publish_topic, DEFAULT_AUTO_MODE_TOPIC};
use crate::protocol::topics::{DEFAULT_PUMP_CONTROL_TOPIC, DEFAULT_WATER_LEVEL_TOPIC};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use url::Url;

/// Top-level bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    pub mqtt: MqttSection,
    #[serde(default)]
    pub topics: TopicsSection,
    #[serde(default)]
    pub store: StoreSection,
}

/// MQTT section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL: mqtt://, mqtts://, ws:// or wss://
    pub broker_url: String,
    /// Client id prefix; a unique suffix is appended per connection
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Keep-alive interval in seconds (default: 60)
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Reconnection policy
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

fn default_client_id() -> String {
    "pump-bridge".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

/// Reconnection policy: bounded exponential backoff with jitter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Maximum reconnection attempts (absent = unlimited)
    pub max_attempts: Option<u32>,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fraction of the delay randomized away, 0.0 to 1.0
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_initial_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// Topic names used by the sensor store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicsSection {
    #[serde(default = "default_water_level_topic")]
    pub water_level: String,
    #[serde(default = "default_pump_control_topic")]
    pub pump_control: String,
    #[serde(default = "default_auto_mode_topic")]
    pub auto_mode: String,
}

fn default_water_level_topic() -> String {
    DEFAULT_WATER_LEVEL_TOPIC.to_string()
}

fn default_pump_control_topic() -> String {
    DEFAULT_PUMP_CONTROL_TOPIC.to_string()
}

fn default_auto_mode_topic() -> String {
    DEFAULT_AUTO_MODE_TOPIC.to_string()
}

impl Default for TopicsSection {
    fn default() -> Self {
        Self {
            water_level: default_water_level_topic(),
            pump_control: default_pump_control_topic(),
            auto_mode: default_auto_mode_topic(),
        }
    }
}

/// Store section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreSection {
    /// Initial auto-mode threshold, percent
    #[serde(default = "default_auto_level")]
    pub auto_level: f64,
    #[serde(default)]
    pub control_policy: ControlPolicy,
}

fn default_auto_level() -> f64 {
    50.0
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            auto_level: default_auto_level(),
            control_policy: ControlPolicy::default(),
        }
    }
}

/// When the auto-mode threshold rule is evaluated
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ControlPolicy {
    /// Only when the threshold is written
    #[default]
    OnThresholdWrite,
    /// Also on every water level update
    Continuous,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

const SUPPORTED_SCHEMES: [&str; 4] = ["mqtt", "mqtts", "ws", "wss"];
const MIN_KEEP_ALIVE_SECS: u64 = 5;

impl BridgeConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mqtt.validate()?;
        self.topics.validate()?;

        let level = self.store.auto_level;
        if !level.is_finite() || !(0.0..=100.0).contains(&level) {
            return Err(ConfigError::InvalidConfig(format!(
                "store.auto_level must be within 0..=100, got {level}"
            )));
        }
        Ok(())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

impl MqttSection {
    /// Local broker section with defaults, mostly useful in tests
    pub fn local(broker_url: &str) -> Self {
        Self {
            broker_url: broker_url.to_string(),
            client_id: default_client_id(),
            username_env: None,
            password_env: None,
            keep_alive_secs: default_keep_alive(),
            reconnect: ReconnectSection::default(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.broker_url).map_err(|e| {
            ConfigError::InvalidConfig(format!("invalid broker_url '{}': {e}", self.broker_url))
        })?;
        if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
            return Err(ConfigError::InvalidConfig(format!(
                "unsupported broker scheme '{}', expected one of {SUPPORTED_SCHEMES:?}",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(ConfigError::InvalidConfig(format!(
                "broker_url '{}' has no host",
                self.broker_url
            )));
        }

        if self.client_id.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.client_id must not be empty".to_string(),
            ));
        }
        if self.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.keep_alive_secs must be at least {MIN_KEEP_ALIVE_SECS}"
            )));
        }

        self.reconnect.validate()
    }

    /// Resolve the username from the configured environment variable
    pub fn username(&self) -> Option<String> {
        self.username_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }

    /// Resolve the password from the configured environment variable
    pub fn password(&self) -> Option<String> {
        self.password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }

    /// Like [`Self::username`], but an unset variable is an error
    pub fn require_username(&self) -> Result<Option<String>, ConfigError> {
        match &self.username_env {
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.clone())),
            None => Ok(None),
        }
    }
}

impl ReconnectSection {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_attempts must be greater than 0 or absent for unlimited"
                    .to_string(),
            ));
        }
        if self.initial_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.initial_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_delay_ms must be >= initial_delay_ms".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.multiplier must be >= 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidConfig(
                "reconnect.jitter must be within 0.0..=1.0".to_string(),
            ));
        }
        Ok(())
    }
}

impl TopicsSection {
    fn validate(&self) -> Result<(), ConfigError> {
        let topics = [
            ("water_level", &self.water_level),
            ("pump_control", &self.pump_control),
            ("auto_mode", &self.auto_mode),
        ];

        for (name, topic) in topics {
            validate_publish_topic(topic)
                .map_err(|e| ConfigError::InvalidConfig(format!("topics.{name}: {e}")))?;
        }

        if self.water_level == self.pump_control
            || self.water_level == self.auto_mode
            || self.pump_control == self.auto_mode
        {
            return Err(ConfigError::InvalidConfig(
                "topics must be distinct".to_string(),
            ));
        }
        Ok(())
    }
}
