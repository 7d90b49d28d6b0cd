// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Event bus - channels between ingress tasks and the owning loop
//!
//! The loop is the only owner of engine state. Transport and HTTP tasks
//! hand events over through the bounded queue; readers observe the engine
//! only through the published [`StateSnapshot`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};

use super::{AlertReason, DeviceState};
use crate::router::InboundEvent;

/// Work item for the owning loop
#[derive(Debug, Clone)]
pub enum LoopEvent {
    /// Raw broker message, routed inside the loop
    Transport { topic: String, payload: Vec<u8> },
    /// Event already decoded by the HTTP ingress
    Ingress(InboundEvent),
    Connectivity(ConnectivityChange),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityChange {
    Connected,
    Lost(String),
    Exhausted { attempts: u32 },
}

/// Read-only view of the engine published after every tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: DeviceState,
    pub reason: AlertReason,
    pub client_id: Option<String>,
    pub broker_connected: bool,
    pub last_diagnostic_at: Option<DateTime<Utc>>,
}

/// Handles shared by every task of the relay
#[derive(Clone)]
pub struct EventBus {
    event_tx: mpsc::Sender<LoopEvent>,
    snapshot_tx: watch::Sender<StateSnapshot>,
    shutdown_tx: broadcast::Sender<()>,
}

impl EventBus {
    /// Create the bus and the loop's receiving end
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<LoopEvent>) {
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (snapshot_tx, _) = watch::channel(StateSnapshot::default());
        let (shutdown_tx, _) = broadcast::channel(4);

        let bus = Self {
            event_tx,
            snapshot_tx,
            shutdown_tx,
        };
        (bus, event_rx)
    }

    pub fn events(&self) -> mpsc::Sender<LoopEvent> {
        self.event_tx.clone()
    }

    pub fn publish_snapshot(&self, snapshot: StateSnapshot) {
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<StateSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal every task to stop
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
