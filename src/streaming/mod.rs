//! Streaming module - broker transport, outbound messages and HTTP ingress

mod mqtt;
mod outbound;
mod signal_log;
mod supervisor;

#[cfg(feature = "http")]
pub mod http;

pub use mqtt::{mqtt_options, MqttLink};
pub use outbound::{GpsMessage, ModeMessage, Outbound, StateMessage, Statistics};
pub use signal_log::SignalLog;
pub use supervisor::{ConnectionSupervisor, DisconnectFlag, LinkState, RetryDecision, RetryPolicy};
