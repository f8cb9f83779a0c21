//! Domain state held by the sensor store

use crate::protocol::SwitchState;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Default auto-mode threshold, percent
pub const DEFAULT_AUTO_LEVEL: f64 = 50.0;

/// An on/off field with an explicit optimistic window
///
/// A local toggle records a `requested` value that wins until the broker
/// echoes a value back, which becomes `confirmed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SwitchField {
    confirmed: SwitchState,
    requested: Option<SwitchState>,
}

impl SwitchField {
    pub fn new(confirmed: SwitchState) -> Self {
        Self {
            confirmed,
            requested: None,
        }
    }

    /// Requested value if one is pending, else the confirmed one
    pub fn current(&self) -> SwitchState {
        self.requested.unwrap_or(self.confirmed)
    }

    pub fn is_on(&self) -> bool {
        self.current().is_on()
    }

    pub fn confirmed(&self) -> SwitchState {
        self.confirmed
    }

    pub fn requested(&self) -> Option<SwitchState> {
        self.requested
    }

    pub fn is_pending(&self) -> bool {
        self.requested.is_some()
    }

    pub fn request(&mut self, state: SwitchState) {
        self.requested = Some(state);
    }

    /// Request the opposite of the current value and return it
    pub fn request_toggle(&mut self) -> SwitchState {
        let next = self.current().toggled();
        self.request(next);
        next
    }

    /// Apply a value received from the broker
    pub fn confirm(&mut self, state: SwitchState) {
        self.confirmed = state;
        self.requested = None;
    }
}

/// Snapshot of everything the store tracks
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorState {
    /// Water level, percent
    pub water_level: f64,
    pub pump: SwitchField,
    pub auto_mode: SwitchField,
    /// Auto-mode threshold, percent
    pub auto_level: f64,
    /// Time of the last mutation, local or inbound
    pub last_updated: Option<DateTime<Utc>>,
}

impl Default for SensorState {
    fn default() -> Self {
        Self::with_auto_level(DEFAULT_AUTO_LEVEL)
    }
}

impl SensorState {
    pub fn with_auto_level(auto_level: f64) -> Self {
        Self {
            water_level: 0.0,
            pump: SwitchField::default(),
            auto_mode: SwitchField::default(),
            auto_level,
            last_updated: None,
        }
    }

    pub fn pump_on(&self) -> bool {
        self.pump.is_on()
    }

    pub fn auto_mode_on(&self) -> bool {
        self.auto_mode.is_on()
    }

    /// Auto-mode is on and the level is at or below the threshold
    pub fn threshold_reached(&self) -> bool {
        self.auto_mode_on() && self.water_level <= self.auto_level
    }

    /// Continuous control rule: switch on only an idle pump
    pub fn should_start_pump(&self) -> bool {
        self.threshold_reached() && !self.pump_on() && !self.pump.is_pending()
    }

    pub(crate) fn touch(&mut self) {
        self.last_updated = Some(Utc::now());
    }
}
