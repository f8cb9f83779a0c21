//! Connection state transitions and the reconnect decision
//!
//! Nothing here touches the network; the supervisor feeds events in and
//! acts on what comes back.

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::Duration;
use tracing::{error, info};

pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether the supervisor retries and after how long
    /// (`max_attempts: None` retries forever)
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
        jitter_sample: f64,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.jittered_delay(attempt, jitter_sample),
        }
    }

    /// How long `connect` waits for the first ConnAck
    /// (one minute when retries are unlimited)
    pub fn calculate_connection_timeout(config: &ReconnectConfig) -> Duration {
        match config.calculate_max_total_time() {
            Some(max_total_time) => Duration::from_millis(max_total_time + 30000),
            None => Duration::from_secs(60),
        }
    }

    /// State the client moves to after an event
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => {
                info!("MQTT client connected");
                ConnectionState::Connected
            }
            ConnectionEvent::DisconnectedByBroker => {
                info!("MQTT broker closed the connection");
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => {
                error!("MQTT error: {}", error);
                ConnectionState::Disconnected(error)
            }
            ConnectionEvent::ReconnectionStarted(attempt) => {
                info!("Starting reconnection attempt {}", attempt);
                ConnectionState::Reconnecting(attempt)
            }
            ConnectionEvent::PermanentFailure(reason) => {
                error!("Permanent connection failure: {}", reason);
                ConnectionState::PermanentlyDisconnected(reason)
            }
        }
    }

    /// Publishing is allowed only while connected
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Subscribe requests go out only while connected
    pub fn can_subscribe(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// ConnAck received from broker
    ConnAckReceived,
    /// Broker initiated disconnect
    DisconnectedByBroker,
    /// Network or protocol error
    NetworkError(String),
    /// Reconnection attempt started
    ReconnectionStarted(u32),
    /// Permanent failure - no more retries
    PermanentFailure(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_attempts: Option<u32>) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts,
            initial_delay_ms: 100,
            max_delay_ms: 1000,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_should_attempt_reconnection() {
        let unlimited = config(None);

        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &unlimited, false, 0.0),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 100
            }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(2, &unlimited, false, 0.0),
            ReconnectionDecision::Proceed {
                attempt: 3,
                delay_ms: 400
            }
        );
        // Unlimited retries stay at the cap
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(50, &unlimited, false, 0.0),
            ReconnectionDecision::Proceed {
                attempt: 51,
                delay_ms: 1000
            }
        );

        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &unlimited, true, 0.0),
            ReconnectionDecision::AbortShutdownRequested
        );

        let limited = config(Some(5));
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(5, &limited, false, 0.0),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
    }

    #[test]
    fn test_reconnection_applies_jitter() {
        let jittered = ReconnectConfig {
            jitter: 0.5,
            ..config(None)
        };
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(1, &jittered, false, 0.5),
            ReconnectionDecision::Proceed {
                attempt: 2,
                delay_ms: 150
            }
        );
    }

    #[test]
    fn test_calculate_connection_timeout() {
        assert_eq!(
            HealthMonitor::calculate_connection_timeout(&config(None)),
            Duration::from_secs(60)
        );

        // 100 + 200 + 400 + 800
        assert_eq!(
            HealthMonitor::calculate_connection_timeout(&config(Some(4))),
            Duration::from_millis(1500 + 30000)
        );
    }

    #[test]
    fn test_determine_next_state() {
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived),
            ConnectionState::Connected
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::DisconnectedByBroker),
            ConnectionState::Disconnected("Broker disconnected".to_string())
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::NetworkError(
                "timeout".to_string()
            )),
            ConnectionState::Disconnected("timeout".to_string())
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ReconnectionStarted(1)),
            ConnectionState::Reconnecting(1)
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::PermanentFailure(
                "max attempts".to_string()
            )),
            ConnectionState::PermanentlyDisconnected("max attempts".to_string())
        );
    }

    #[test]
    fn test_can_publish_and_subscribe() {
        let states = [
            (ConnectionState::Connected, true),
            (ConnectionState::Connecting, false),
            (ConnectionState::Disconnected("test".to_string()), false),
            (ConnectionState::Reconnecting(1), false),
            (
                ConnectionState::PermanentlyDisconnected("test".to_string()),
                false,
            ),
        ];

        for (state, expected) in states {
            assert_eq!(HealthMonitor::can_publish(&state), expected, "{state:?}");
            assert_eq!(HealthMonitor::can_subscribe(&state), expected, "{state:?}");
        }
    }
}
