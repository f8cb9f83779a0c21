//! Reactive sensor store
//!
//! Holds the pump domain state in a `watch` channel and keeps it in sync
//! with the broker: inbound messages are decoded into fields by handlers
//! registered on the bridge, and actions publish the commands they imply.

use super::state::{SensorState, SwitchField};
use super::StoreError;
use crate::bridge::BrokerBridge;
use crate::config::{BridgeConfig, ControlPolicy, StoreSection, TopicsSection};
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::SwitchState;
use crate::store_span;
use crate::transport::Transport;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Commands handed from synchronous handlers to the control task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlCommand {
    StartPump,
}

#[derive(Debug, Clone, Copy)]
enum Switch {
    Pump,
    AutoMode,
}

impl Switch {
    fn field(self, state: &mut SensorState) -> &mut SwitchField {
        match self {
            Switch::Pump => &mut state.pump,
            Switch::AutoMode => &mut state.auto_mode,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Switch::Pump => "pump",
            Switch::AutoMode => "auto_mode",
        }
    }
}

struct StoreInner<T: Transport + 'static> {
    bridge: BrokerBridge<T>,
    state: Arc<watch::Sender<SensorState>>,
    topics: TopicsSection,
    policy: ControlPolicy,
    control_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport + 'static> Drop for StoreInner<T> {
    fn drop(&mut self) {
        if let Some(handle) = self
            .control_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

/// Pump state store bound to a broker bridge
///
/// Cloning is cheap and every clone drives the same state and connection.
pub struct SensorStore<T: Transport + 'static> {
    inner: Arc<StoreInner<T>>,
}

impl<T: Transport + 'static> Clone for SensorStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport + 'static> Default for SensorStore<T> {
    fn default() -> Self {
        Self::new(TopicsSection::default(), &StoreSection::default())
    }
}

impl<T: Transport + 'static> SensorStore<T> {
    pub fn new(topics: TopicsSection, store: &StoreSection) -> Self {
        let (state, _) = watch::channel(SensorState::with_auto_level(store.auto_level));
        Self {
            inner: Arc::new(StoreInner {
                bridge: BrokerBridge::new(),
                state: Arc::new(state),
                topics,
                policy: store.control_policy,
                control_task: Mutex::new(None),
            }),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.topics.clone(), &config.store)
    }

    pub fn bridge(&self) -> &BrokerBridge<T> {
        &self.inner.bridge
    }

    pub fn topics(&self) -> &TopicsSection {
        &self.inner.topics
    }

    pub fn policy(&self) -> ControlPolicy {
        self.inner.policy
    }

    /// Current state
    pub fn snapshot(&self) -> SensorState {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn watch(&self) -> watch::Receiver<SensorState> {
        self.inner.state.subscribe()
    }

    /// Connect the bridge and register the three topic handlers
    ///
    /// Errors are logged, never returned: a failed connection keeps
    /// retrying in the transport and the handlers start working once it
    /// comes up.
    pub async fn setup_mqtt(&self, transport: T) {
        async {
            match self.inner.bridge.init(transport).await {
                Ok(()) => {}
                Err(BridgeError::AlreadyInitialized) => {
                    warn!("Store already set up, ignoring");
                    return;
                }
                Err(e) => warn!(error = %e, "Continuing setup without a confirmed connection"),
            }

            let control_tx = match self.inner.policy {
                ControlPolicy::Continuous => Some(self.start_control_task()),
                ControlPolicy::OnThresholdWrite => None,
            };

            let topics = &self.inner.topics;

            let state = self.inner.state.clone();
            let result = self
                .inner
                .bridge
                .subscribe_as(&topics.water_level, move |level: f64| {
                    let mut start_pump = false;
                    state.send_modify(|s| {
                        s.water_level = level;
                        s.touch();
                        start_pump = s.should_start_pump();
                    });
                    if let (true, Some(tx)) = (start_pump, &control_tx) {
                        let _ = tx.send(ControlCommand::StartPump);
                    }
                })
                .await;
            log_subscription(&topics.water_level, result);

            let state = self.inner.state.clone();
            let result = self
                .inner
                .bridge
                .subscribe_as(&topics.pump_control, move |pump: SwitchState| {
                    state.send_modify(|s| {
                        s.pump.confirm(pump);
                        s.touch();
                    });
                })
                .await;
            log_subscription(&topics.pump_control, result);

            let state = self.inner.state.clone();
            let result = self
                .inner
                .bridge
                .subscribe_as(&topics.auto_mode, move |auto_mode: SwitchState| {
                    state.send_modify(|s| {
                        s.auto_mode.confirm(auto_mode);
                        s.touch();
                    });
                })
                .await;
            log_subscription(&topics.auto_mode, result);
        }
        .instrument(store_span!(action = "setup_mqtt", policy = ?self.inner.policy))
        .await
    }

    fn start_control_task(&self) -> mpsc::UnboundedSender<ControlCommand> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let weak: Weak<StoreInner<T>> = Arc::downgrade(&self.inner);

        let handle = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let store = SensorStore { inner };
                match command {
                    ControlCommand::StartPump => store.start_pump_if_needed().await,
                }
            }
            debug!("Control task stopped");
        });

        let previous = self
            .inner
            .control_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        tx
    }

    /// Re-checks the rule against current state, so queued commands from
    /// a burst of level updates start the pump once
    async fn start_pump_if_needed(&self) {
        let mut before = SwitchField::default();
        let mut after = before;
        let changed = self.inner.state.send_if_modified(|s| {
            if !s.should_start_pump() {
                return false;
            }
            before = s.pump;
            s.pump.request(SwitchState::On);
            after = s.pump;
            s.touch();
            true
        });

        if changed {
            let water_level = self.inner.state.borrow().water_level;
            info!(water_level, "Water level at or below threshold, starting pump");
            self.publish_request(Switch::Pump, before, after).await;
        }
    }

    /// Flip the pump locally and publish the command. Returns the pump value
    /// afterwards; a failed publish withdraws the local change.
    pub async fn toggle_pump(&self) -> SwitchState {
        self.request(Switch::Pump, None)
            .instrument(store_span!(action = "toggle_pump"))
            .await
            .0
    }

    /// Flip auto-mode locally and publish it
    pub async fn toggle_auto_mode(&self) -> SwitchState {
        self.request(Switch::AutoMode, None)
            .instrument(store_span!(action = "toggle_auto_mode"))
            .await
            .0
    }

    /// Command an explicit pump state. Published even when it matches the
    /// current value.
    pub async fn set_pump(&self, target: SwitchState) -> SwitchState {
        self.request(Switch::Pump, Some(target))
            .instrument(store_span!(action = "set_pump", %target))
            .await
            .0
    }

    /// Command an explicit auto-mode state
    pub async fn set_auto_mode(&self, target: SwitchState) -> SwitchState {
        self.request(Switch::AutoMode, Some(target))
            .instrument(store_span!(action = "set_auto_mode", %target))
            .await
            .0
    }

    /// Set the threshold; if auto-mode is on and the level is at or below
    /// it, toggle the pump once. Returns whether a pump toggle went out:
    /// false when the rule did not fire or its publish failed.
    pub async fn set_auto_level(&self, level: f64) -> Result<bool, StoreError> {
        if !level.is_finite() {
            return Err(StoreError::InvalidThreshold(level));
        }

        let mut reached = false;
        self.inner.state.send_modify(|s| {
            s.auto_level = level;
            s.touch();
            reached = s.threshold_reached();
        });

        if !reached {
            return Ok(false);
        }

        info!(auto_level = level, "Threshold reached in auto mode, toggling pump");
        let (_, published) = self
            .request(Switch::Pump, None)
            .instrument(store_span!(action = "toggle_pump", auto_level = level))
            .await;
        Ok(published)
    }

    /// Request `target`, or the opposite of the current value when `None`.
    /// Returns the resulting value and whether the publish went out.
    async fn request(&self, switch: Switch, target: Option<SwitchState>) -> (SwitchState, bool) {
        let mut before = SwitchField::default();
        let mut after = before;
        self.inner.state.send_modify(|s| {
            let field = switch.field(s);
            before = *field;
            match target {
                Some(state) => field.request(state),
                None => {
                    field.request_toggle();
                }
            }
            after = *field;
            s.touch();
        });

        debug!(switch = switch.name(), value = %after.current(), "Requested switch change");
        let published = self.publish_request(switch, before, after).await;

        let mut state = self.inner.state.borrow().clone();
        (switch.field(&mut state).current(), published)
    }

    async fn publish_request(&self, switch: Switch, before: SwitchField, after: SwitchField) -> bool {
        let topic = match switch {
            Switch::Pump => &self.inner.topics.pump_control,
            Switch::AutoMode => &self.inner.topics.auto_mode,
        };

        let Err(e) = self.inner.bridge.publish_as(topic, &after.current()).await else {
            return true;
        };

        warn!(topic = %topic, error = %e, "Publish failed, withdrawing local change");
        // Leave the field alone if an echo or another action moved it
        self.inner.state.send_if_modified(|s| {
            let field = switch.field(s);
            if *field == after {
                *field = before;
                true
            } else {
                false
            }
        });
        false
    }

    /// Stop the control task and disconnect the bridge
    pub async fn teardown(&self) {
        let handle = self
            .inner
            .control_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }

        match self.inner.bridge.disconnect().await {
            Ok(()) => info!("Store torn down"),
            Err(BridgeError::NotInitialized) => debug!("Teardown of a store that was never set up"),
            Err(e) => warn!(error = %e, "Bridge disconnect failed during teardown"),
        }
    }
}

fn log_subscription<I: std::fmt::Display>(topic: &str, result: BridgeResult<I>) {
    match result {
        Ok(id) => debug!(topic, %id, "Store handler registered"),
        Err(e) => warn!(topic, error = %e, "Store handler not registered"),
    }
}
