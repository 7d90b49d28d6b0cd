//! Outbound messages and their wire encoding

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TopicConfig;
use crate::core::{AlertReason, DeviceState, DiagnosticSample, BATTERY_UNKNOWN};
use crate::geo::GeoPoint;

/// Message produced by the engine for publication
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Plain `ON`/`OFF` for the device's command input
    DeviceCommand(&'static str),
    State(StateMessage),
    Mode(ModeMessage),
    Gps(GpsMessage),
    Statistics(Statistics),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    pub state: DeviceState,
    pub client_id: String,
    pub reason: AlertReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeMessage {
    pub mode: String,
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpsMessage {
    pub lat: f64,
    pub lon: f64,
    pub client_id: String,
}

impl GpsMessage {
    pub fn new(point: GeoPoint, client_id: &str) -> Self {
        Self {
            lat: point.lat,
            lon: point.lon,
            client_id: client_id.to_string(),
        }
    }
}

/// Statistics record read by the mobile app
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub timestamp: Option<DateTime<Utc>>,
    pub state: DeviceState,
    pub gps_lat: Option<f64>,
    pub gps_lon: Option<f64>,
    pub battery_level: String,
    pub reason: AlertReason,
    pub client_id: Option<String>,
}

impl Statistics {
    /// Latest sample overlaid with the engine's current state
    pub fn from_sample(sample: &DiagnosticSample, state: DeviceState, reason: AlertReason) -> Self {
        Self {
            timestamp: Some(sample.timestamp),
            state,
            gps_lat: sample.point.map(|p| p.lat),
            gps_lon: sample.point.map(|p| p.lon),
            battery_level: sample.battery.clone(),
            reason,
            client_id: Some(sample.source_id.clone()),
        }
    }

    /// Record published when no sample can be read
    pub fn no_data(state: DeviceState, reason: AlertReason) -> Self {
        Self {
            timestamp: None,
            state,
            gps_lat: None,
            gps_lon: None,
            battery_level: BATTERY_UNKNOWN.to_string(),
            reason,
            client_id: None,
        }
    }

    pub fn has_data(&self) -> bool {
        self.timestamp.is_some()
    }
}

impl Outbound {
    /// Channel this message goes out on
    pub fn topic<'a>(&self, topics: &'a TopicConfig) -> &'a str {
        match self {
            Outbound::DeviceCommand(_) => &topics.device_command,
            Outbound::State(_) => &topics.device_state,
            Outbound::Mode(_) => &topics.device_mode,
            Outbound::Gps(_) => &topics.device_gps,
            Outbound::Statistics(_) => &topics.statistics,
        }
    }

    /// Payload bytes; JSON for everything except the plain device command
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Outbound::DeviceCommand(cmd) => Ok(cmd.as_bytes().to_vec()),
            Outbound::State(m) => serde_json::to_vec(m),
            Outbound::Mode(m) => serde_json::to_vec(m),
            Outbound::Gps(m) => serde_json::to_vec(m),
            Outbound::Statistics(m) => serde_json::to_vec(m),
        }
    }
}
