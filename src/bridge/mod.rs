//! Broker bridge
//!
//! Owns one transport connection and fans inbound messages out to handlers
//! registered per exact topic. Every operation takes `&self`, so the bridge
//! is shared behind an `Arc` between the store, its handlers and tasks.
//!
//! Inbound publishes travel from the transport over an mpsc channel to a
//! single dispatcher task, which runs the handlers of each message to
//! completion before taking the next one.

pub mod registry;

pub use registry::{Handler, HandlerId, HandlerRegistry, Registration, Removed};

use crate::error::{BridgeError, BridgeResult};
use crate::mqtt_span;
use crate::protocol::{validate_publish_topic, TopicPayload};
use crate::transport::mqtt::ConnectionState;
use crate::transport::{InboundMessage, Transport};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Inbound messages buffered between the transport and the dispatcher
const INBOUND_CHANNEL_CAPACITY: usize = 64;

/// Bridge between a broker transport and topic handlers
pub struct BrokerBridge<T: Transport> {
    transport: RwLock<Option<T>>,
    registry: HandlerRegistry,
    /// Held across a registry change and the broker call it implies
    membership: tokio::sync::Mutex<()>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport + 'static> Default for BrokerBridge<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport + 'static> BrokerBridge<T> {
    /// Create an uninitialized bridge
    pub fn new() -> Self {
        Self {
            transport: RwLock::new(None),
            registry: HandlerRegistry::new(),
            membership: tokio::sync::Mutex::new(()),
            dispatcher: Mutex::new(None),
        }
    }

    /// Install the transport, start the dispatcher and connect
    ///
    /// A connection failure is returned but leaves the bridge initialized:
    /// the transport keeps reconnecting and replays subscriptions once the
    /// broker acknowledges.
    pub async fn init(&self, mut transport: T) -> BridgeResult<()> {
        let mut slot = self.transport.write().await;
        if slot.is_some() {
            warn!("Bridge init called while already initialized");
            return Err(BridgeError::AlreadyInitialized);
        }

        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        transport.set_message_sender(tx);
        self.start_dispatcher(rx);

        let result = transport.connect().await;
        *slot = Some(transport);

        match result {
            Ok(()) => {
                info!("Broker bridge connected");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Broker connection failed, transport will keep retrying");
                Err(BridgeError::ConnectionFailed(e.to_string()))
            }
        }
    }

    fn start_dispatcher(&self, mut rx: mpsc::Receiver<InboundMessage>) {
        let registry = self.registry.clone();
        let handle = tokio::spawn(async move {
            debug!("Dispatcher started");
            while let Some(message) = rx.recv().await {
                dispatch_to(&registry, &message.topic, &message.payload);
            }
            debug!("Inbound channel closed, dispatcher stopped");
        });

        let previous = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn stop_dispatcher(&self) {
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Register a handler for an exact topic
    ///
    /// The broker subscribe is issued only for the first handler on a topic.
    /// Registering the same `Arc` again returns the existing id. If the
    /// broker rejects the subscribe the registration is rolled back.
    ///
    /// Subscribes and unsubscribes are serialized, so a caller registering
    /// on a topic whose broker subscribe is still in flight waits for its
    /// outcome instead of joining a subscription that may never exist.
    pub async fn subscribe(&self, topic: &str, handler: Handler) -> BridgeResult<HandlerId> {
        let guard = self.transport.read().await;
        let Some(transport) = guard.as_ref() else {
            warn!(topic, "Subscribe called before init");
            return Err(BridgeError::NotInitialized);
        };

        validate_publish_topic(topic).inspect_err(|e| {
            warn!(topic, error = %e, "Rejected subscription topic");
        })?;

        let _membership = self.membership.lock().await;
        match self.registry.register(topic, handler) {
            Registration::Duplicate(id) => Ok(id),
            Registration::Added {
                id,
                first_for_topic: false,
            } => Ok(id),
            Registration::Added {
                id,
                first_for_topic: true,
            } => match transport
                .subscribe(topic)
                .instrument(mqtt_span!(operation = "subscribe", topic))
                .await
            {
                Ok(()) => {
                    info!(topic, "Subscribed");
                    Ok(id)
                }
                Err(e) => {
                    self.registry.remove(id);
                    error!(topic, error = %e, "Broker subscribe failed");
                    Err(BridgeError::Transport(e.to_string()))
                }
            },
        }
    }

    /// Register a closure; each call registers a distinct handler
    pub async fn subscribe_fn<F>(&self, topic: &str, handler: F) -> BridgeResult<HandlerId>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.subscribe(topic, Arc::new(handler)).await
    }

    /// Register a typed handler; payloads that fail to decode are logged
    /// and dropped
    pub async fn subscribe_as<P, F>(&self, topic: &str, handler: F) -> BridgeResult<HandlerId>
    where
        P: TopicPayload,
        F: Fn(P) + Send + Sync + 'static,
    {
        let owned_topic = topic.to_string();
        self.subscribe_fn(topic, move |payload: &str| match P::decode(payload) {
            Ok(value) => handler(value),
            Err(e) => warn!(topic = %owned_topic, error = %e, "Dropping undecodable payload"),
        })
        .await
    }

    /// Remove one registration; the broker subscription goes with the last
    /// handler on its topic. Returns false for an unknown id.
    pub async fn unsubscribe(&self, id: HandlerId) -> BridgeResult<bool> {
        let guard = self.transport.read().await;
        let Some(transport) = guard.as_ref() else {
            warn!(%id, "Unsubscribe called before init");
            return Err(BridgeError::NotInitialized);
        };

        let _membership = self.membership.lock().await;
        let Some(removed) = self.registry.remove(id) else {
            debug!(%id, "Unsubscribe for unknown handler");
            return Ok(false);
        };

        if removed.topic_empty {
            transport.unsubscribe(&removed.topic).await.map_err(|e| {
                error!(topic = %removed.topic, error = %e, "Broker unsubscribe failed");
                BridgeError::Transport(e.to_string())
            })?;
            info!(topic = %removed.topic, "Unsubscribed");
        }

        Ok(true)
    }

    /// Publish a text payload with QoS 1, not retained
    pub async fn publish(&self, topic: &str, message: &str) -> BridgeResult<()> {
        let guard = self.transport.read().await;
        let Some(transport) = guard.as_ref() else {
            warn!(topic, "Publish called before init");
            return Err(BridgeError::NotInitialized);
        };

        validate_publish_topic(topic)?;

        match transport
            .publish(topic, message.as_bytes().to_vec(), false)
            .instrument(mqtt_span!(operation = "publish", topic))
            .await
        {
            Ok(()) => {
                info!(topic, message, "Published");
                Ok(())
            }
            Err(e) => {
                error!(topic, error = %e, "Publish failed");
                Err(BridgeError::Transport(e.to_string()))
            }
        }
    }

    /// Publish a typed value
    pub async fn publish_as<P: TopicPayload>(&self, topic: &str, value: &P) -> BridgeResult<()> {
        self.publish(topic, &value.encode()).await
    }

    /// Close the connection and return to the uninitialized state
    ///
    /// All registrations are dropped. Queued publishes are not drained.
    pub async fn disconnect(&self) -> BridgeResult<()> {
        let Some(mut transport) = self.transport.write().await.take() else {
            warn!("Disconnect called before init");
            return Err(BridgeError::NotInitialized);
        };

        self.stop_dispatcher();
        self.registry.clear();

        match transport.disconnect().await {
            Ok(()) => {
                info!("Broker bridge disconnected");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Transport disconnect reported an error");
                Err(BridgeError::Transport(e.to_string()))
            }
        }
    }

    /// Deliver one message to every handler on its exact topic, in
    /// registration order. Returns how many handlers ran.
    pub fn dispatch(&self, topic: &str, payload: &str) -> usize {
        dispatch_to(&self.registry, topic, payload)
    }

    pub async fn is_initialized(&self) -> bool {
        self.transport.read().await.is_some()
    }

    /// Transport connection state; `None` before init
    pub async fn connection_state(&self) -> Option<ConnectionState> {
        self.transport
            .read()
            .await
            .as_ref()
            .and_then(|t| t.connection_state())
    }

    pub async fn is_permanently_disconnected(&self) -> bool {
        self.transport
            .read()
            .await
            .as_ref()
            .is_some_and(|t| t.is_permanently_disconnected())
    }

    /// Number of handlers registered on a topic
    pub fn handler_count(&self, topic: &str) -> usize {
        self.registry.handler_count(topic)
    }

    /// Topics with at least one handler
    pub fn topics(&self) -> Vec<String> {
        self.registry.topics()
    }
}

impl<T: Transport> Drop for BrokerBridge<T> {
    fn drop(&mut self) {
        if let Some(handle) = self
            .dispatcher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

fn dispatch_to(registry: &HandlerRegistry, topic: &str, payload: &str) -> usize {
    let handlers = registry.handlers_for(topic);
    if handlers.is_empty() {
        debug!(topic, "No handler for inbound message");
        return 0;
    }

    debug!(topic, handlers = handlers.len(), "Dispatching inbound message");
    for handler in &handlers {
        handler(payload);
    }
    handlers.len()
}
