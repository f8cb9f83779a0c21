//! Broker URLs, client options, connection states and reconnect backoff

use crate::config::{MqttSection, ReconnectSection};
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Connection state for MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - attempting to connect
    Connecting,
    /// Successfully connected and ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Permanently disconnected - max reconnection attempts exceeded
    PermanentlyDisconnected(String),
}

/// Broker transport selected by the URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerScheme {
    /// `mqtt://`
    Tcp,
    /// `mqtts://`
    Tls,
    /// `ws://`
    WebSocket,
    /// `wss://`
    SecureWebSocket,
}

impl BrokerScheme {
    pub fn from_url(url: &Url) -> Option<Self> {
        match url.scheme() {
            "mqtt" => Some(BrokerScheme::Tcp),
            "mqtts" => Some(BrokerScheme::Tls),
            "ws" => Some(BrokerScheme::WebSocket),
            "wss" => Some(BrokerScheme::SecureWebSocket),
            _ => None,
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            BrokerScheme::Tcp => 1883,
            BrokerScheme::Tls => 8883,
            BrokerScheme::WebSocket => 80,
            BrokerScheme::SecureWebSocket => 443,
        }
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, BrokerScheme::WebSocket | BrokerScheme::SecureWebSocket)
    }
}

/// Reconnection configuration: exponential backoff capped at `max_delay_ms`
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Delay before the first attempt
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay
    pub max_delay_ms: u64,
    /// Growth factor between attempts
    pub multiplier: f64,
    /// Fraction of each delay that is randomized away (0.0 = none)
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::from(&ReconnectSection::default())
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            initial_delay_ms: section.initial_delay_ms,
            max_delay_ms: section.max_delay_ms,
            multiplier: section.multiplier,
            jitter: section.jitter,
        }
    }
}

impl ReconnectConfig {
    /// Calculate the maximum total time for all reconnection attempts
    /// Returns None if unlimited retries are configured
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Backoff delay for the given attempt (1-based), before jitter
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let delay = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        if !delay.is_finite() || delay >= self.max_delay_ms as f64 {
            self.max_delay_ms
        } else {
            delay as u64
        }
    }

    /// Backoff delay with jitter applied; `sample` must be in `[0, 1)`
    pub fn jittered_delay(&self, attempt: u32, sample: f64) -> u64 {
        let base = self.calculate_backoff_delay(attempt);
        let spread = base as f64 * self.jitter.clamp(0.0, 1.0) * sample.clamp(0.0, 1.0);
        base.saturating_sub(spread as u64)
    }

    /// Uniform sample in `[0, 1)` drawn from a v4 UUID
    pub fn sample_jitter() -> f64 {
        // Low 53 bits sit below the version and variant fields
        let bits = Uuid::new_v4().as_u128() as u64 & ((1u64 << 53) - 1);
        bits as f64 / (1u64 << 53) as f64
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

/// Build a client id that is unique per connection attempt so a
/// reconnecting client never collides with its own stale session
pub fn unique_client_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &suffix[..12])
}

/// Build `MqttOptions` from the `[mqtt]` section
pub fn configure_mqtt_options(config: &MqttSection) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let scheme = BrokerScheme::from_url(&url)
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let port = url.port().unwrap_or(scheme.default_port());

    let client_id = unique_client_id(&config.client_id);

    // Websocket transports take the full URL as the broker address
    let mut mqtt_options = if scheme.is_websocket() {
        MqttOptions::new(client_id, config.broker_url.clone(), port)
    } else {
        MqttOptions::new(client_id, host, port)
    };

    match scheme {
        BrokerScheme::Tcp => {}
        BrokerScheme::Tls => {
            mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
        }
        BrokerScheme::WebSocket => {
            mqtt_options.set_transport(RumqttcTransport::Ws);
        }
        BrokerScheme::SecureWebSocket => {
            mqtt_options.set_transport(RumqttcTransport::wss_with_default_config());
        }
    }

    if let Some(username) = config.username() {
        let password = config.password().unwrap_or_default();
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limited_config() -> ReconnectConfig {
        ReconnectConfig {
            max_attempts: Some(4),
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            multiplier: 2.0,
            jitter: 0.5,
        }
    }

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.initial_delay_ms, 250);
        assert_eq!(config.max_delay_ms, 30_000);
        assert_eq!(config.multiplier, 2.0);
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let config = limited_config();

        assert_eq!(config.calculate_backoff_delay(1), 100);
        assert_eq!(config.calculate_backoff_delay(2), 200);
        assert_eq!(config.calculate_backoff_delay(3), 400);
        assert_eq!(config.calculate_backoff_delay(4), 800);

        // Capped at max_delay_ms
        assert_eq!(config.calculate_backoff_delay(5), 1000);
        assert_eq!(config.calculate_backoff_delay(100), 1000);
        assert_eq!(config.calculate_backoff_delay(u32::MAX), 1000);
    }

    #[test]
    fn test_jittered_delay_bounds() {
        let config = limited_config();

        assert_eq!(config.jittered_delay(2, 0.0), 200);
        assert_eq!(config.jittered_delay(2, 0.5), 150);
        // Never below (1 - jitter) of the base delay
        assert!(config.jittered_delay(2, 0.999_999) >= 100);

        let no_jitter = ReconnectConfig {
            jitter: 0.0,
            ..limited_config()
        };
        assert_eq!(no_jitter.jittered_delay(3, 0.9), 400);
    }

    #[test]
    fn test_sample_jitter_is_unit_interval() {
        for _ in 0..1000 {
            let sample = ReconnectConfig::sample_jitter();
            assert!((0.0..1.0).contains(&sample), "sample out of range: {sample}");
        }
    }

    #[test]
    fn test_calculate_max_total_time() {
        assert_eq!(limited_config().calculate_max_total_time(), Some(1500));
        assert_eq!(ReconnectConfig::default().calculate_max_total_time(), None);
    }

    #[test]
    fn test_broker_scheme_detection() {
        let parse = |s: &str| BrokerScheme::from_url(&Url::parse(s).unwrap());

        assert_eq!(parse("mqtt://localhost"), Some(BrokerScheme::Tcp));
        assert_eq!(parse("mqtts://localhost"), Some(BrokerScheme::Tls));
        assert_eq!(parse("ws://localhost/mqtt"), Some(BrokerScheme::WebSocket));
        assert_eq!(
            parse("wss://broker.example.com:8884/mqtt"),
            Some(BrokerScheme::SecureWebSocket)
        );
        assert_eq!(parse("http://localhost"), None);
        assert_eq!(BrokerScheme::SecureWebSocket.default_port(), 443);
        assert_eq!(BrokerScheme::Tls.default_port(), 8883);
    }

    #[test]
    fn test_unique_client_id() {
        let first = unique_client_id("pump-bridge");
        let second = unique_client_id("pump-bridge");
        assert!(first.starts_with("pump-bridge-"));
        assert_eq!(first.len(), "pump-bridge-".len() + 12);
        assert_ne!(first, second);
    }

    #[test]
    fn test_connection_state_equality() {
        assert_eq!(ConnectionState::Connected, ConnectionState::Connected);
        assert_ne!(
            ConnectionState::Connected,
            ConnectionState::Disconnected("test".to_string())
        );
    }

    #[test]
    fn test_configure_mqtt_options() {
        let config = MqttSection::local("mqtt://localhost:1883");
        let options = configure_mqtt_options(&config).unwrap();
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn test_configure_websocket_options_keep_full_url() {
        let config = MqttSection::local("wss://broker.example.com:8884/mqtt");
        let options = configure_mqtt_options(&config).unwrap();
        let (address, port) = options.broker_address();
        assert_eq!(address, "wss://broker.example.com:8884/mqtt");
        assert_eq!(port, 8884);
    }

    #[test]
    fn test_invalid_broker_url() {
        let config = MqttSection::local("invalid-url");
        let result = configure_mqtt_options(&config);
        assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));

        let config = MqttSection::local("http://localhost:1883");
        let result = configure_mqtt_options(&config);
        assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_mqtt_error_display() {
        let errors = vec![
            MqttError::ConnectionFailed("test".to_string().into()),
            MqttError::PublishFailed("test".to_string().into()),
            MqttError::SubscriptionFailed("test".to_string().into()),
            MqttError::InvalidBrokerUrl("test".to_string()),
            MqttError::NotConnected {
                state: ConnectionState::Disconnected("test".to_string()),
            },
            MqttError::ConnectionFailedStr("test".to_string()),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
