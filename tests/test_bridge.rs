//! Broker bridge tests over the mock transport
//!
//! Inbound messages go through the real path: mock transport sender,
//! dispatcher task, registry, handler.

use pump_bridge::bridge::BrokerBridge;
use pump_bridge::error::BridgeError;
use pump_bridge::protocol::SwitchState;
use pump_bridge::testing::MockTransport;
use pump_bridge::transport::mqtt::ConnectionState;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn connected_bridge() -> (BrokerBridge<MockTransport>, MockTransport) {
    let transport = MockTransport::new();
    let bridge = BrokerBridge::new();
    bridge.init(transport.clone()).await.unwrap();
    (bridge, transport)
}

#[tokio::test]
async fn test_typed_handler_receives_inbound_level() {
    // Arrange
    let (bridge, transport) = connected_bridge().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    bridge
        .subscribe_as("water/level", move |level: f64| {
            let _ = tx.send(level);
        })
        .await
        .unwrap();

    // Act
    assert!(transport.inject("water/level", "73.5").await);

    // Assert
    let received = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert_eq!(received, Some(73.5_f64));
}

#[tokio::test]
async fn test_undecodable_payload_does_not_reach_typed_handler() {
    let (bridge, transport) = connected_bridge().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    bridge
        .subscribe_as("water/level", move |level: f64| {
            let _ = tx.send(level);
        })
        .await
        .unwrap();

    transport.inject("water/level", "full").await;
    transport.inject("water/level", "NaN").await;
    transport.inject("water/level", "12").await;

    let received = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert_eq!(received, Some(12.0));
}

#[tokio::test]
async fn test_handlers_run_in_registration_order() {
    let (bridge, transport) = connected_bridge().await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    let first_log = log.clone();
    bridge
        .subscribe_fn("water/control", move |payload| {
            first_log.lock().unwrap().push(format!("first:{payload}"));
        })
        .await
        .unwrap();
    let second_log = log.clone();
    bridge
        .subscribe_fn("water/control", move |payload| {
            second_log.lock().unwrap().push(format!("second:{payload}"));
            let _ = done_tx.send(());
        })
        .await
        .unwrap();

    transport.inject("water/control", "ON").await;
    timeout(Duration::from_secs(1), done_rx.recv())
        .await
        .unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["first:ON", "second:ON"]);
    assert_eq!(transport.subscriptions(), vec!["water/control"]);
}

#[tokio::test]
async fn test_duplicate_registration_runs_once() {
    let (bridge, transport) = connected_bridge().await;
    let count = Arc::new(Mutex::new(0));
    let seen = count.clone();
    let handler: pump_bridge::Handler = Arc::new(move |_: &str| *seen.lock().unwrap() += 1);

    bridge.subscribe("auto-mode", handler.clone()).await.unwrap();
    bridge.subscribe("auto-mode", handler).await.unwrap();

    assert_eq!(bridge.dispatch("auto-mode", "ON"), 1);
    assert_eq!(*count.lock().unwrap(), 1);
    assert_eq!(transport.subscriptions(), vec!["auto-mode"]);
}

#[tokio::test]
async fn test_messages_on_other_topics_are_ignored() {
    let (bridge, _) = connected_bridge().await;
    bridge.subscribe_fn("water/level", |_| {}).await.unwrap();

    assert_eq!(bridge.dispatch("water/levels", "1"), 0);
    assert_eq!(bridge.dispatch("water", "1"), 0);
}

#[tokio::test]
async fn test_operations_before_init_have_no_broker_interaction() {
    let transport = MockTransport::new();
    let bridge: BrokerBridge<MockTransport> = BrokerBridge::new();

    assert!(matches!(
        bridge.subscribe_fn("water/level", |_| {}).await,
        Err(BridgeError::NotInitialized)
    ));
    assert!(matches!(
        bridge.publish_as("water/control", &SwitchState::On).await,
        Err(BridgeError::NotInitialized)
    ));
    assert!(matches!(
        bridge.disconnect().await,
        Err(BridgeError::NotInitialized)
    ));

    assert!(transport.subscriptions().is_empty());
    assert!(transport.published().is_empty());
    assert_eq!(transport.connect_count(), 0);
}

#[tokio::test]
async fn test_publish_failure_is_reported() {
    let (bridge, transport) = connected_bridge().await;
    transport.set_failing(true);

    let result = bridge.publish("water/control", "ON").await;
    assert!(matches!(result, Err(BridgeError::Transport(_))));
    assert!(transport.published().is_empty());
}

#[tokio::test]
async fn test_connection_state_follows_lifecycle() {
    let (bridge, _) = connected_bridge().await;
    assert_eq!(
        bridge.connection_state().await,
        Some(ConnectionState::Connected)
    );
    assert!(!bridge.is_permanently_disconnected().await);

    bridge.disconnect().await.unwrap();
    assert_eq!(bridge.connection_state().await, None);
}

#[tokio::test]
async fn test_inbound_after_disconnect_is_not_delivered() {
    let (bridge, transport) = connected_bridge().await;
    let count = Arc::new(Mutex::new(0));
    let seen = count.clone();
    bridge
        .subscribe_fn("water/level", move |_| *seen.lock().unwrap() += 1)
        .await
        .unwrap();

    bridge.disconnect().await.unwrap();

    assert!(!transport.inject("water/level", "10").await);
    assert_eq!(*count.lock().unwrap(), 0);
}
