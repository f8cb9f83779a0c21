//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.

use pump_bridge::config::{BridgeConfig, ConfigError, ControlPolicy};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "wss://broker.example.com:8884/mqtt"
client_id = "greenhouse"
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"
keep_alive_secs = 30

[mqtt.reconnect]
max_attempts = 10
initial_delay_ms = 100
max_delay_ms = 5000
multiplier = 1.5
jitter = 0.1

[topics]
water_level = "tank/level"
pump_control = "tank/pump"
auto_mode = "tank/auto"

[store]
auto_level = 35.0
control_policy = "continuous"
"#,
    );

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt.broker_url, "wss://broker.example.com:8884/mqtt");
    assert_eq!(config.mqtt.client_id, "greenhouse");
    assert_eq!(config.mqtt.keep_alive_secs, 30);
    assert_eq!(config.mqtt.reconnect.max_attempts, Some(10));
    assert_eq!(config.mqtt.reconnect.multiplier, 1.5);
    assert_eq!(config.topics.water_level, "tank/level");
    assert_eq!(config.topics.pump_control, "tank/pump");
    assert_eq!(config.topics.auto_mode, "tank/auto");
    assert_eq!(config.store.auto_level, 35.0);
    assert_eq!(config.store.control_policy, ControlPolicy::Continuous);
}

#[test]
fn test_minimal_config_gets_defaults() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
"#,
    );

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt.client_id, "pump-bridge");
    assert_eq!(config.mqtt.reconnect.max_attempts, None);
    assert_eq!(config.topics.water_level, "water/level");
    assert_eq!(config.topics.pump_control, "water/control");
    assert_eq!(config.topics.auto_mode, "auto-mode");
    assert_eq!(config.store.auto_level, 50.0);
    assert_eq!(config.store.control_policy, ControlPolicy::OnThresholdWrite);
}

#[test]
fn test_missing_file_is_read_error() {
    let result = BridgeConfig::load_from_file(std::path::Path::new("/nonexistent/pump-bridge.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let temp_file = write_config("[mqtt\nbroker_url = ");
    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_missing_broker_url_is_parse_error() {
    let temp_file = write_config("[mqtt]\nclient_id = \"x\"\n");
    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_invalid_values_are_rejected() {
    let cases = [
        (
            "[mqtt]\nbroker_url = \"http://localhost\"\n",
            "unsupported broker scheme",
        ),
        (
            "[mqtt]\nbroker_url = \"mqtt://localhost\"\nkeep_alive_secs = 1\n",
            "keep_alive_secs",
        ),
        (
            "[mqtt]\nbroker_url = \"mqtt://localhost\"\n[topics]\nwater_level = \"water/+\"\n",
            "topics.water_level",
        ),
        (
            "[mqtt]\nbroker_url = \"mqtt://localhost\"\n[store]\nauto_level = 150.0\n",
            "auto_level",
        ),
        (
            "[mqtt]\nbroker_url = \"mqtt://localhost\"\n[mqtt.reconnect]\njitter = 2.0\n",
            "jitter",
        ),
    ];

    for (content, expected) in cases {
        let temp_file = write_config(content);
        match BridgeConfig::load_from_file(temp_file.path()) {
            Err(ConfigError::InvalidConfig(message)) => assert!(
                message.contains(expected),
                "expected '{expected}' in '{message}'"
            ),
            other => panic!("expected InvalidConfig for {content:?}, got {other:?}"),
        }
    }
}

#[test]
fn test_unknown_control_policy_is_parse_error() {
    let temp_file = write_config(
        "[mqtt]\nbroker_url = \"mqtt://localhost\"\n[store]\ncontrol_policy = \"sometimes\"\n",
    );
    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_round_trips_through_toml() {
    let temp_file = write_config(
        r#"
[mqtt]
broker_url = "mqtts://broker.example.com"

[store]
control_policy = "continuous"
"#,
    );
    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = BridgeConfig::from_toml_str(&rendered).unwrap();
    assert_eq!(config, reparsed);
}
