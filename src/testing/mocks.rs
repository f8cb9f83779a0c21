//! Mock implementations for testing
//!
//! Provides a mock Transport that records every broker interaction and can
//! inject inbound messages, so the bridge and store run without a broker.

use crate::transport::{mqtt::ConnectionState, InboundMessage, Transport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub type PublishedMessage = (String, String);

/// Errors produced by [`MockTransport`] in failure mode
#[derive(Debug, Error, PartialEq)]
pub enum MockError {
    #[error("Mock connection failure")]
    ConnectFailed,
    #[error("Mock {0} failure")]
    OperationFailed(&'static str),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock transport for testing
///
/// Clones share their recordings, so a test keeps one clone while the
/// bridge owns another.
#[derive(Debug, Default, Clone)]
pub struct MockTransport {
    pub subscriptions: Arc<Mutex<Vec<String>>>,
    pub unsubscriptions: Arc<Mutex<Vec<String>>>,
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub connects: Arc<AtomicUsize>,
    pub disconnects: Arc<AtomicUsize>,
    pub should_fail: Arc<AtomicBool>,
    pub fail_connect: Arc<AtomicBool>,
    broker_latency: Arc<Mutex<Option<Duration>>>,
    state: Arc<Mutex<Option<ConnectionState>>>,
    message_sender: Arc<Mutex<Option<mpsc::Sender<InboundMessage>>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation fails
    pub fn with_failure() -> Self {
        let mock = Self::default();
        mock.set_failing(true);
        mock.fail_connect.store(true, Ordering::SeqCst);
        mock
    }

    /// Only `connect` fails
    pub fn with_connect_failure(self) -> Self {
        self.fail_connect.store(true, Ordering::SeqCst);
        self
    }

    /// Subscribe and unsubscribe take this long before answering
    pub fn with_broker_latency(self, latency: Duration) -> Self {
        *lock(&self.broker_latency) = Some(latency);
        self
    }

    /// Toggle failure of subscribe, unsubscribe and publish
    pub fn set_failing(&self, failing: bool) {
        self.should_fail.store(failing, Ordering::SeqCst);
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).clone()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        lock(&self.unsubscriptions).clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published_messages).clone()
    }

    /// Payloads published on one topic, in order
    pub fn published_on(&self, topic: &str) -> Vec<String> {
        lock(&self.published_messages)
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn clear_history(&self) {
        lock(&self.subscriptions).clear();
        lock(&self.unsubscriptions).clear();
        lock(&self.published_messages).clear();
    }

    /// Push a message through the sender the bridge installed, as if the
    /// broker had delivered it. Returns false when nothing is listening.
    pub async fn inject(&self, topic: &str, payload: &str) -> bool {
        let sender = lock(&self.message_sender).clone();
        match sender {
            Some(sender) => sender
                .send(InboundMessage::new(topic, payload))
                .await
                .is_ok(),
            None => false,
        }
    }

    async fn broker_round_trip(&self) {
        let latency = *lock(&self.broker_latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_failure(&self, operation: &'static str) -> Result<(), MockError> {
        if self.should_fail.load(Ordering::SeqCst) {
            Err(MockError::OperationFailed(operation))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            *lock(&self.state) = Some(ConnectionState::Disconnected(
                "Mock connection failure".to_string(),
            ));
            return Err(MockError::ConnectFailed);
        }
        *lock(&self.state) = Some(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        *lock(&self.state) = Some(ConnectionState::Disconnected(
            "Client disconnected".to_string(),
        ));
        lock(&self.message_sender).take();
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), Self::Error> {
        self.broker_round_trip().await;
        self.check_failure("subscribe")?;
        lock(&self.subscriptions).push(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), Self::Error> {
        self.broker_round_trip().await;
        self.check_failure("unsubscribe")?;
        lock(&self.unsubscriptions).push(topic.to_string());
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        _retain: bool,
    ) -> Result<(), Self::Error> {
        self.check_failure("publish")?;
        lock(&self.published_messages).push((
            topic.to_string(),
            String::from_utf8_lossy(&payload).into_owned(),
        ));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        matches!(*lock(&self.state), Some(ConnectionState::Connected))
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        lock(&self.state).clone()
    }

    fn is_permanently_disconnected(&self) -> bool {
        matches!(
            *lock(&self.state),
            Some(ConnectionState::PermanentlyDisconnected(_))
        )
    }

    fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        *lock(&self.message_sender) = Some(sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_interactions() {
        let mut mock = MockTransport::new();
        let observer = mock.clone();

        assert!(mock.connection_state().is_none());
        mock.connect().await.unwrap();
        mock.subscribe("water/level").await.unwrap();
        mock.publish("water/control", b"ON".to_vec(), false)
            .await
            .unwrap();
        mock.unsubscribe("water/level").await.unwrap();

        assert!(observer.is_connected());
        assert_eq!(observer.connect_count(), 1);
        assert_eq!(observer.subscriptions(), vec!["water/level"]);
        assert_eq!(observer.unsubscriptions(), vec!["water/level"]);
        assert_eq!(observer.published_on("water/control"), vec!["ON"]);

        mock.disconnect().await.unwrap();
        assert!(!observer.is_connected());
        assert_eq!(observer.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_failure_modes() {
        let mut mock = MockTransport::with_failure();
        assert_eq!(mock.connect().await, Err(MockError::ConnectFailed));
        assert_eq!(
            mock.publish("water/control", b"ON".to_vec(), false).await,
            Err(MockError::OperationFailed("publish"))
        );

        mock.set_failing(false);
        assert!(mock.subscribe("water/level").await.is_ok());
    }

    #[tokio::test]
    async fn test_inject_uses_installed_sender() {
        let mock = MockTransport::new();
        assert!(!mock.inject("water/level", "10").await);

        let (tx, mut rx) = mpsc::channel(1);
        mock.set_message_sender(tx);
        assert!(mock.inject("water/level", "10").await);
        assert_eq!(
            rx.recv().await.unwrap(),
            InboundMessage::new("water/level", "10")
        );
    }
}
