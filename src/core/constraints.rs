//! Job constraints and the device signals they are evaluated against.
//!
//! Evaluation is a pure function of a [`ConstraintSet`] and a
//! [`DeviceSignals`] snapshot. The host pushes new snapshots through a
//! [`SignalFeed`]; the scheduler re-evaluates on every change.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use super::state::StopReason;

/// Network requirement of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    /// No network needed.
    #[default]
    NotRequired,
    /// Any working connection.
    Connected,
    /// A connection that is not metered.
    Unmetered,
    /// A metered connection.
    Metered,
    /// A connection that is not roaming.
    NotRoaming,
}

/// Preconditions that must hold for a job to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintSet {
    pub required_network: NetworkType,
    pub requires_charging: bool,
    pub requires_battery_not_low: bool,
    pub requires_storage_not_low: bool,
    pub requires_device_idle: bool,
}

/// Current network connection, as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub metered: bool,
    pub roaming: bool,
}

/// Snapshot of the device state constraints are evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSignals {
    /// `None` when there is no connection.
    pub network: Option<NetworkStatus>,
    pub charging: bool,
    pub battery_low: bool,
    pub storage_low: bool,
    pub device_idle: bool,
}

impl Default for DeviceSignals {
    /// Unmetered connection, not charging, nothing low, not idle.
    fn default() -> Self {
        Self {
            network: Some(NetworkStatus {
                metered: false,
                roaming: false,
            }),
            charging: false,
            battery_low: false,
            storage_low: false,
            device_idle: false,
        }
    }
}

impl DeviceSignals {
    /// Signals under which every constraint holds.
    pub fn all_met() -> Self {
        Self {
            charging: true,
            device_idle: true,
            ..Self::default()
        }
    }

    /// Builder: set the network status.
    pub fn with_network(mut self, network: Option<NetworkStatus>) -> Self {
        self.network = network;
        self
    }

    /// Builder: set the charging state.
    pub fn with_charging(mut self, charging: bool) -> Self {
        self.charging = charging;
        self
    }

    /// Builder: set the battery-low state.
    pub fn with_battery_low(mut self, low: bool) -> Self {
        self.battery_low = low;
        self
    }

    /// Builder: set the storage-low state.
    pub fn with_storage_low(mut self, low: bool) -> Self {
        self.storage_low = low;
        self
    }

    /// Builder: set the idle state.
    pub fn with_device_idle(mut self, idle: bool) -> Self {
        self.device_idle = idle;
        self
    }
}

impl NetworkType {
    fn is_satisfied(self, network: Option<NetworkStatus>) -> bool {
        match (self, network) {
            (NetworkType::NotRequired, _) => true,
            (_, None) => false,
            (NetworkType::Connected, Some(_)) => true,
            (NetworkType::Unmetered, Some(n)) => !n.metered,
            (NetworkType::Metered, Some(n)) => n.metered,
            (NetworkType::NotRoaming, Some(n)) => !n.roaming,
        }
    }
}

impl ConstraintSet {
    /// A set with no requirements.
    pub fn none() -> Self {
        Self::default()
    }

    /// Builder: require a network type.
    pub fn with_network(mut self, network: NetworkType) -> Self {
        self.required_network = network;
        self
    }

    /// Builder: require the device to be charging.
    pub fn with_charging(mut self, required: bool) -> Self {
        self.requires_charging = required;
        self
    }

    /// Builder: require the battery not to be low.
    pub fn with_battery_not_low(mut self, required: bool) -> Self {
        self.requires_battery_not_low = required;
        self
    }

    /// Builder: require storage not to be low.
    pub fn with_storage_not_low(mut self, required: bool) -> Self {
        self.requires_storage_not_low = required;
        self
    }

    /// Builder: require the device to be idle.
    pub fn with_device_idle(mut self, required: bool) -> Self {
        self.requires_device_idle = required;
        self
    }

    /// Whether the set imposes no requirement at all.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Whether every predicate holds for the given signals.
    pub fn is_satisfied(&self, signals: &DeviceSignals) -> bool {
        self.unmet(signals).is_none()
    }

    /// Stop reason for the first predicate that does not hold.
    pub fn unmet(&self, signals: &DeviceSignals) -> Option<StopReason> {
        if !self.required_network.is_satisfied(signals.network) {
            return Some(StopReason::ConstraintConnectivity);
        }
        if self.requires_charging && !signals.charging {
            return Some(StopReason::ConstraintCharging);
        }
        if self.requires_battery_not_low && signals.battery_low {
            return Some(StopReason::ConstraintBatteryNotLow);
        }
        if self.requires_storage_not_low && signals.storage_low {
            return Some(StopReason::ConstraintStorageNotLow);
        }
        if self.requires_device_idle && !signals.device_idle {
            return Some(StopReason::ConstraintDeviceIdle);
        }
        None
    }
}

/// Push-based source of [`DeviceSignals`].
///
/// Cloning shares the same channel. Publishing identical signals does not
/// wake subscribers.
#[derive(Clone)]
pub struct SignalFeed {
    tx: Arc<watch::Sender<DeviceSignals>>,
}

impl SignalFeed {
    /// Create a feed with initial signals.
    pub fn new(initial: DeviceSignals) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Replace the current signals.
    pub fn set(&self, signals: DeviceSignals) {
        self.tx.send_if_modified(|current| {
            if *current == signals {
                false
            } else {
                *current = signals;
                true
            }
        });
    }

    /// Modify the current signals in place.
    pub fn update(&self, f: impl FnOnce(&mut DeviceSignals)) {
        let mut next = *self.tx.borrow();
        f(&mut next);
        self.set(next);
    }

    /// Current signals.
    pub fn current(&self) -> DeviceSignals {
        *self.tx.borrow()
    }

    /// Subscribe to changes.
    pub fn subscribe(&self) -> watch::Receiver<DeviceSignals> {
        self.tx.subscribe()
    }
}

impl Default for SignalFeed {
    fn default() -> Self {
        Self::new(DeviceSignals::default())
    }
}
