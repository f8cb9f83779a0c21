//! rumqttc-backed transport
//!
//! [`MqttClient`] keeps the `AsyncClient` handle used for publish and
//! subscribe. `connect` hands the `EventLoop` to a [`Supervisor`] task that
//! polls it, forwards inbound publishes to the bridge, replays tracked
//! topics on every ConnAck and rebuilds the connection after a drop.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectConfig};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageForwarder, MessageHandler};
use crate::config::MqttSection;
use crate::transport::{InboundMessage, Transport};
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, ConnectionError, Event, EventLoop};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Requests buffered between `AsyncClient` and its `EventLoop`
const REQUEST_CAPACITY: usize = 10;

/// How long `disconnect` waits for the supervisor to exit
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type SharedClient = Arc<Mutex<AsyncClient>>;
type SharedTopics = Arc<Mutex<Vec<String>>>;
type SharedForwarder = Arc<std::sync::Mutex<MessageForwarder>>;

fn open_session(config: &MqttSection) -> Result<(AsyncClient, EventLoop), MqttError> {
    let options = configure_mqtt_options(config)?;
    Ok(AsyncClient::new(options, REQUEST_CAPACITY))
}

/// MQTT transport client
pub struct MqttClient {
    config: MqttSection,
    client: SharedClient,
    pending_event_loop: std::sync::Mutex<Option<EventLoop>>,
    supervisor: Option<JoinHandle<()>>,
    state_rx: Option<watch::Receiver<ConnectionState>>,
    state_tx: Option<watch::Sender<ConnectionState>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    reconnect: ReconnectConfig,
    topics: SharedTopics,
    forwarder: SharedForwarder,
}

impl MqttClient {
    /// Build the client without touching the network
    pub fn new(config: MqttSection) -> Result<Self, MqttError> {
        let (client, event_loop) = open_session(&config)?;
        let reconnect = ReconnectConfig::from(&config.reconnect);

        Ok(Self {
            config,
            client: Arc::new(Mutex::new(client)),
            pending_event_loop: std::sync::Mutex::new(Some(event_loop)),
            supervisor: None,
            state_rx: None,
            state_tx: None,
            shutdown_tx: None,
            reconnect,
            topics: Arc::new(Mutex::new(Vec::new())),
            forwarder: Arc::new(std::sync::Mutex::new(MessageForwarder::new())),
        })
    }

    /// Start the supervisor and wait for the first ConnAck
    ///
    /// On failure the supervisor stays up and keeps retrying per the
    /// reconnect policy; the error only reports the first attempt.
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        let event_loop = self
            .pending_event_loop
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Event loop already started".to_string())
        })?;

        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let supervisor = Supervisor {
            config: self.config.clone(),
            reconnect: self.reconnect.clone(),
            client: self.client.clone(),
            event_loop: std::sync::Mutex::new(event_loop),
            topics: self.topics.clone(),
            forwarder: self.forwarder.clone(),
            state_tx: state_tx.clone(),
            shutdown_rx,
            attempts: 0,
        };
        self.supervisor = Some(tokio::spawn(supervisor.run()));
        self.state_rx = Some(state_rx.clone());
        self.state_tx = Some(state_tx);
        self.shutdown_tx = Some(shutdown_tx);

        let timeout = HealthMonitor::calculate_connection_timeout(&self.reconnect);
        Self::await_connack(state_rx, timeout).await
    }

    async fn await_connack(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "Supervisor stopped before connecting".to_string(),
                    ));
                }
                match &*state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(reason) => {
                        return Err(MqttError::ConnectionFailedStr(reason.clone()));
                    }
                    ConnectionState::PermanentlyDisconnected(reason) => {
                        return Err(MqttError::ConnectionFailedStr(format!(
                            "Permanently disconnected: {reason}"
                        )));
                    }
                    ConnectionState::Connecting | ConnectionState::Reconnecting(_) => {}
                }
            }
        })
        .await;

        outcome.unwrap_or_else(|_| {
            Err(MqttError::ConnectionFailedStr(format!(
                "No ConnAck within {}ms",
                timeout.as_millis()
            )))
        })
    }

    /// Stop the supervisor and send an MQTT DISCONNECT
    ///
    /// Publishes still queued in the client are not drained.
    pub async fn disconnect(&mut self) -> Result<(), MqttError> {
        let Some(handle) = self.supervisor.take() else {
            debug!("Disconnect before connect, nothing to stop");
            return Ok(());
        };

        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }

        let result = self.client.lock().await.disconnect().await;

        if let Some(state_tx) = &self.state_tx {
            let _ = state_tx.send(ConnectionState::Disconnected(
                "Client disconnected".to_string(),
            ));
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(Ok(())) => debug!("Supervisor exited"),
            Ok(Err(e)) if !e.is_cancelled() => warn!(error = %e, "Supervisor task failed"),
            Ok(Err(_)) => {}
            Err(_) => warn!("Supervisor still running after grace period, dropping it"),
        }

        self.forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear_sender();

        info!(broker = %self.config.broker_url, "MQTT client disconnected");
        result.map_err(|e| MqttError::ConnectionFailed(Box::new(e)))
    }

    /// `None` until `connect` has been called
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.state_rx.as_ref().map(|rx| rx.borrow().clone())
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.connection_state(),
            Some(ConnectionState::PermanentlyDisconnected(_))
        )
    }

    fn ensure_publishable(&self) -> Result<(), MqttError> {
        let state = self
            .connection_state()
            .ok_or_else(|| MqttError::ConnectionFailedStr("Client never connected".to_string()))?;

        if HealthMonitor::can_publish(&state) {
            Ok(())
        } else {
            Err(MqttError::NotConnected { state })
        }
    }

    fn can_subscribe_now(&self) -> bool {
        self.connection_state()
            .is_some_and(|state| HealthMonitor::can_subscribe(&state))
    }

    /// Track a topic and subscribe now if the connection is up
    ///
    /// While not connected the topic is only recorded; the supervisor
    /// subscribes it on the next ConnAck.
    pub async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
        {
            let mut topics = self.topics.lock().await;
            if !topics.iter().any(|t| t == topic) {
                topics.push(topic.to_string());
            }
        }

        if !self.can_subscribe_now() {
            debug!(topic, "Subscription deferred until connected");
            return Ok(());
        }

        self.client
            .lock()
            .await
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| {
                MqttError::SubscriptionFailed(format!("subscribe {topic}: {e}").into())
            })?;

        info!(topic, "Subscription requested");
        Ok(())
    }

    /// Stop tracking a topic and unsubscribe if connected
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.topics.lock().await.retain(|t| t != topic);

        if !self.can_subscribe_now() {
            return Ok(());
        }

        self.client
            .lock()
            .await
            .unsubscribe(topic)
            .await
            .map_err(|e| {
                MqttError::SubscriptionFailed(format!("unsubscribe {topic}: {e}").into())
            })?;

        info!(topic, "Unsubscribed");
        Ok(())
    }

    /// Topics replayed on reconnection
    pub async fn subscribed_topics(&self) -> Vec<String> {
        self.topics.lock().await.clone()
    }

    /// Queue a QoS 1 publish
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), MqttError> {
        self.ensure_publishable()?;

        self.client
            .lock()
            .await
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;

        debug!(topic, retain, "Publish queued");
        Ok(())
    }
}

/// What woke the supervisor
enum Wake {
    Shutdown { sender_gone: bool },
    Polled(Result<Event, ConnectionError>),
}

/// Background task driving one broker session at a time
struct Supervisor {
    config: MqttSection,
    reconnect: ReconnectConfig,
    client: SharedClient,
    event_loop: std::sync::Mutex<EventLoop>,
    topics: SharedTopics,
    forwarder: SharedForwarder,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    attempts: u32,
}

impl Supervisor {
    async fn run(mut self) {
        info!(broker = %self.config.broker_url, "MQTT supervisor started");

        loop {
            let wake = tokio::select! {
                biased;
                changed = self.shutdown_rx.changed() => Wake::Shutdown {
                    sender_gone: changed.is_err(),
                },
                polled = self.event_loop.get_mut().unwrap_or_else(PoisonError::into_inner).poll() => Wake::Polled(polled),
            };

            let keep_running = match wake {
                Wake::Shutdown { sender_gone } => !(sender_gone || self.shutdown_requested()),
                Wake::Polled(Ok(event)) => {
                    self.on_route(MessageHandler::route_mqtt_event(&event)).await
                }
                Wake::Polled(Err(e)) => {
                    self.transition(ConnectionEvent::NetworkError(e.to_string()));
                    self.reconnect().await
                }
            };

            if !keep_running {
                break;
            }
        }

        info!("MQTT supervisor stopped");
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn transition(&self, event: ConnectionEvent) {
        let _ = self
            .state_tx
            .send(HealthMonitor::determine_next_state(event));
    }

    /// Returns false when the supervisor should stop
    async fn on_route(&mut self, route: EventRoute) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                self.transition(ConnectionEvent::ConnAckReceived);
                self.attempts = 0;
                self.replay_subscriptions().await;
                true
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                forward_inbound(&self.forwarder, topic, &payload, retain).await;
                true
            }
            EventRoute::Disconnected => {
                self.transition(ConnectionEvent::DisconnectedByBroker);
                self.reconnect().await
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                return_codes,
            } => {
                if let Err(e) = MessageHandler::validate_subscription_success(&return_codes) {
                    warn!(target: "mqtt_transport", packet_id, error = %e, "Broker refused subscription");
                } else {
                    debug!(target: "mqtt_transport", packet_id, "Subscription confirmed");
                }
                true
            }
            EventRoute::InfrastructureEvent(packet) => {
                debug!(target: "mqtt_transport", packet = %packet, "Broker packet");
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    async fn replay_subscriptions(&self) {
        let topics = self.topics.lock().await.clone();
        let client = self.client.lock().await;
        for topic in topics {
            match client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
                Ok(()) => debug!(target: "mqtt_transport", topic = %topic, "Resubscribed"),
                Err(e) => error!(topic = %topic, error = %e, "Resubscribe failed"),
            }
        }
    }

    /// Back off, then open a fresh session. Returns false when the policy
    /// gives up or shutdown arrives first.
    async fn reconnect(&mut self) -> bool {
        let decision = HealthMonitor::should_attempt_reconnection(
            self.attempts,
            &self.reconnect,
            self.shutdown_requested(),
            ReconnectConfig::sample_jitter(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                self.attempts = attempt;
                self.transition(ConnectionEvent::ReconnectionStarted(attempt));
                info!(
                    attempt,
                    max_attempts = ?self.reconnect.max_attempts,
                    delay_ms,
                    "Reconnecting to broker"
                );

                let delay = Duration::from_millis(delay_ms);
                if !sleep_unless_shutdown(&mut self.shutdown_rx, delay).await {
                    info!("Shutdown during reconnect backoff");
                    return false;
                }

                self.swap_session().await;
                true
            }
            ReconnectionDecision::AbortShutdownRequested => {
                info!("Shutdown requested, not reconnecting");
                false
            }
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                let reason = format!(
                    "Gave up after {} reconnection attempts",
                    self.reconnect.max_attempts.unwrap_or_default()
                );
                error!(broker = %self.config.broker_url, "{reason}");
                self.transition(ConnectionEvent::PermanentFailure(reason));
                false
            }
        }
    }

    /// Replace the client and event loop; callers holding the shared client
    /// publish through the new session from here on
    async fn swap_session(&mut self) {
        match open_session(&self.config) {
            Ok((client, event_loop)) => {
                self.event_loop = std::sync::Mutex::new(event_loop);
                *self.client.lock().await = client;
                debug!("Opened new broker session");
            }
            Err(e) => error!(error = %e, "Could not open new broker session"),
        }
    }
}

/// Sleep for `delay`; false if shutdown was signalled meanwhile
async fn sleep_unless_shutdown(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return !*shutdown_rx.borrow(),
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return false;
                }
            }
        }
    }
}

async fn forward_inbound(forwarder: &SharedForwarder, topic: String, payload: &[u8], retain: bool) {
    debug!(target: "mqtt_transport", topic = %topic, bytes = payload.len(), "Inbound publish");

    let message = InboundMessage {
        topic,
        payload: MessageHandler::payload_text(payload),
        retain,
    };

    let forwarder = forwarder
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if let Err(e) = forwarder.forward(message).await {
        debug!(target: "mqtt_transport", error = %e, "Inbound publish not forwarded");
    }
}

#[async_trait]
impl Transport for MqttClient {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        MqttClient::connect(self).await
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        MqttClient::disconnect(self).await
    }

    async fn subscribe(&self, topic: &str) -> Result<(), Self::Error> {
        MqttClient::subscribe(self, topic).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), Self::Error> {
        MqttClient::unsubscribe(self, topic).await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), Self::Error> {
        MqttClient::publish(self, topic, payload, retain).await
    }

    fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    fn connection_state(&self) -> Option<ConnectionState> {
        MqttClient::connection_state(self)
    }

    fn is_permanently_disconnected(&self) -> bool {
        MqttClient::is_permanently_disconnected(self)
    }

    fn set_message_sender(&self, sender: mpsc::Sender<InboundMessage>) {
        self.forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_sender(sender);
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = &self.shutdown_tx {
            let _ = shutdown_tx.send(true);
        }
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
    }
}
