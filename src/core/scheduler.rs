// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Statistics broadcast cadence

use std::time::{Duration, Instant};
use tracing::debug;

use super::DeviceState;

/// Pull-based timer deciding when the next statistics record goes out
pub struct BroadcastScheduler {
    alert_cadence: Duration,
    idle_cadence: Duration,
    last_broadcast: Instant,
}

impl BroadcastScheduler {
    pub fn new(alert_cadence: Duration, idle_cadence: Duration, start: Instant) -> Self {
        Self {
            alert_cadence,
            idle_cadence,
            last_broadcast: start,
        }
    }

    /// Broadcast interval for the given state
    pub fn cadence(&self, state: DeviceState) -> Duration {
        if state == DeviceState::Alert {
            self.alert_cadence
        } else {
            self.idle_cadence
        }
    }

    /// True when a broadcast is due; marks it as sent
    pub fn on_tick(&mut self, now: Instant, state: DeviceState) -> bool {
        let cadence = self.cadence(state);
        if now.saturating_duration_since(self.last_broadcast) > cadence {
            debug!("Statistics broadcast due (cadence {:?}, state {})", cadence, state);
            self.last_broadcast = now;
            true
        } else {
            false
        }
    }
}
