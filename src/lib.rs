// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! BantayBike - telemetry relay and theft-alert engine
//!
//! Relays MQTT traffic between a bicycle lock unit and its companion app,
//! and watches the unit for silence, movement and tamper signals while it
//! is locked.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────┐   ┌──────────────────────────┐
//! │ MQTT session │ → │           │   │        Tick loop         │
//! │ (supervised) │   │ Event Bus │ → │ Router → DeviceState     │
//! ├──────────────┤   │  (mpsc)   │   │          Engine          │
//! │ HTTP ingress │ → │           │   │            ↓             │
//! └──────────────┘   └───────────┘   │ Database   Outbound      │
//!        ↑                           └────────────┬─────────────┘
//!        └──────── StateSnapshot (watch) ─────────┘
//! ```

pub mod core;
pub mod geo;
pub mod router;
pub mod streaming;
pub mod config;
pub mod db;
pub mod error;

// Re-exports for convenience
pub use config::Config;
pub use crate::core::{AlertReason, DeviceState, DeviceStateEngine, EventBus, Runtime};
pub use db::Database;
pub use geo::GeoPoint;
pub use router::MessageRouter;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Display name
pub const NAME: &str = "BantayBike";

/// Build info
pub fn build_info() -> BuildInfo {
    BuildInfo {
        version: VERSION.to_string(),
        target: std::env::consts::ARCH.to_string(),
        os: std::env::consts::OS.to_string(),
        features: enabled_features(),
    }
}

/// Build information
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub version: String,
    pub target: String,
    pub os: String,
    pub features: Vec<String>,
}

fn enabled_features() -> Vec<String> {
    let mut features = vec![];

    #[cfg(feature = "http")]
    features.push("http".to_string());

    features
}
