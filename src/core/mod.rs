//! Core module - device state model, alert engine and the owning tick loop

mod engine;
mod scheduler;
mod event_bus;
mod runtime;

pub use engine::{DeviceStateEngine, EngineConfig};
pub use scheduler::BroadcastScheduler;
pub use event_bus::{ConnectivityChange, EventBus, LoopEvent, StateSnapshot};
pub use runtime::Runtime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::geo::GeoPoint;

/// Security state of the lock unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    #[default]
    Unknown,
    Locked,
    Unlocked,
    Alert,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Unknown => "unknown",
            DeviceState::Locked => "locked",
            DeviceState::Unlocked => "unlocked",
            DeviceState::Alert => "alert",
        }
    }

    /// Mode label published on the mode channel
    pub fn mode(&self) -> &'static str {
        match self {
            DeviceState::Unknown => "idle",
            DeviceState::Locked => "armed",
            DeviceState::Unlocked => "disarmed",
            DeviceState::Alert => "tracking",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(DeviceState::Unknown),
            "locked" => Some(DeviceState::Locked),
            "unlocked" => Some(DeviceState::Unlocked),
            "alert" => Some(DeviceState::Alert),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the engine raised (or last raised) an alert.
///
/// Serialized with the vocabulary the mobile client understands:
/// `gps` for a geofence breach and `wire` for a cut cord.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AlertReason {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "timeout")]
    Timeout,
    #[serde(rename = "gps")]
    Geofence,
    #[serde(rename = "wire")]
    Tamper,
}

impl AlertReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertReason::None => "none",
            AlertReason::Timeout => "timeout",
            AlertReason::Geofence => "gps",
            AlertReason::Tamper => "wire",
        }
    }

    /// Parse a stored label or a device-side hint
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "" => Some(AlertReason::None),
            "timeout" => Some(AlertReason::Timeout),
            "gps" | "geofence" => Some(AlertReason::Geofence),
            "wire" | "tamper" => Some(AlertReason::Tamper),
            _ => None,
        }
    }
}

impl fmt::Display for AlertReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Battery level placeholder when the device did not report one
pub const BATTERY_UNKNOWN: &str = "unknown";

/// One diagnostic report, as persisted and broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticSample {
    pub timestamp: DateTime<Utc>,
    pub state: DeviceState,
    pub point: Option<GeoPoint>,
    pub battery: String,
    pub reason: AlertReason,
    pub source_id: String,
}
