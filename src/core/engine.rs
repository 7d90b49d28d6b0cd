//! Device state engine - security state machine and theft watchdogs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{AlertReason, BroadcastScheduler, DeviceState, DiagnosticSample, BATTERY_UNKNOWN};
use crate::db::DiagnosticStore;
use crate::geo::GeoPoint;
use crate::router::{CommandEvent, DiagnosticEvent, InboundEvent, RequestedState, UNKNOWN_SOURCE};
use crate::streaming::{GpsMessage, ModeMessage, Outbound, StateMessage, Statistics};

/// Watchdog thresholds, cooldowns and cadences (seconds / meters)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Owning loop period in milliseconds
    pub tick_ms: u64,

    /// Silence longer than this raises a timeout alert
    pub silence_timeout_secs: f64,

    /// Distance from the lock point that counts as movement
    pub geofence_m: f64,

    pub timeout_cooldown_secs: f64,
    pub geofence_cooldown_secs: f64,
    pub tamper_cooldown_secs: f64,

    /// Statistics cadence while in alert
    pub alert_cadence_secs: f64,

    /// Statistics cadence otherwise
    pub idle_cadence_secs: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            silence_timeout_secs: 30.0,
            geofence_m: 10.0,
            timeout_cooldown_secs: 30.0,
            geofence_cooldown_secs: 30.0,
            tamper_cooldown_secs: 5.0,
            alert_cadence_secs: 4.0,
            idle_cadence_secs: 10.0,
        }
    }
}

impl EngineConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    fn cooldown(&self, reason: AlertReason) -> Duration {
        let secs = match reason {
            AlertReason::Timeout => self.timeout_cooldown_secs,
            AlertReason::Geofence => self.geofence_cooldown_secs,
            AlertReason::Tamper => self.tamper_cooldown_secs,
            AlertReason::None => 0.0,
        };
        secs_to_duration(secs)
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    Duration::from_secs_f64(secs.max(0.0))
}

/// Per-reason alert timestamps plus the silence clock started at lock
#[derive(Debug, Default, Clone)]
struct WatchdogTimers {
    watch_started_at: Option<Instant>,
    last_timeout_alert_at: Option<Instant>,
    last_geofence_alert_at: Option<Instant>,
    last_tamper_alert_at: Option<Instant>,
}

impl WatchdogTimers {
    fn last_alert(&self, reason: AlertReason) -> Option<Instant> {
        match reason {
            AlertReason::Timeout => self.last_timeout_alert_at,
            AlertReason::Geofence => self.last_geofence_alert_at,
            AlertReason::Tamper => self.last_tamper_alert_at,
            AlertReason::None => None,
        }
    }

    fn mark(&mut self, reason: AlertReason, now: Instant) {
        match reason {
            AlertReason::Timeout => self.last_timeout_alert_at = Some(now),
            AlertReason::Geofence => self.last_geofence_alert_at = Some(now),
            AlertReason::Tamper => self.last_tamper_alert_at = Some(now),
            AlertReason::None => {}
        }
    }
}

/// State owned exclusively by the engine
#[derive(Debug, Default)]
struct EngineContext {
    state: DeviceState,
    reason: AlertReason,
    source_id: Option<String>,
    last_diagnostic_at: Option<Instant>,
    last_diagnostic_wall: Option<DateTime<Utc>>,
    last_sample: Option<DiagnosticSample>,
    last_point: Option<GeoPoint>,
    /// Only set while locked (persists into alert, cleared on unlock)
    reference_point: Option<GeoPoint>,
    timers: WatchdogTimers,
}

/// Security state machine for one lock unit
pub struct DeviceStateEngine {
    config: EngineConfig,
    ctx: EngineContext,
    store: Option<Box<dyn DiagnosticStore>>,
    scheduler: BroadcastScheduler,
}

impl DeviceStateEngine {
    pub fn new(config: EngineConfig, store: Option<Box<dyn DiagnosticStore>>, now: Instant) -> Self {
        let scheduler = BroadcastScheduler::new(
            secs_to_duration(config.alert_cadence_secs),
            secs_to_duration(config.idle_cadence_secs),
            now,
        );

        Self {
            config,
            ctx: EngineContext::default(),
            store,
            scheduler,
        }
    }

    pub fn state(&self) -> DeviceState {
        self.ctx.state
    }

    /// Reason of the current alert; `None` outside of alert
    pub fn reason(&self) -> AlertReason {
        self.ctx.reason
    }

    pub fn reference_point(&self) -> Option<GeoPoint> {
        self.ctx.reference_point
    }

    pub fn last_sample(&self) -> Option<&DiagnosticSample> {
        self.ctx.last_sample.as_ref()
    }

    pub fn source_id(&self) -> Option<&str> {
        self.ctx.source_id.as_deref()
    }

    pub fn last_diagnostic_at(&self) -> Option<DateTime<Utc>> {
        self.ctx.last_diagnostic_wall
    }

    /// True when no watchdog has fired or been armed since the last reset
    #[cfg(test)]
    pub(crate) fn timers_cleared(&self) -> bool {
        let t = &self.ctx.timers;
        t.watch_started_at.is_none()
            && t.last_timeout_alert_at.is_none()
            && t.last_geofence_alert_at.is_none()
            && t.last_tamper_alert_at.is_none()
    }

    /// Apply one routed event
    pub fn handle(&mut self, event: InboundEvent, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        match event {
            InboundEvent::Diagnostic(d) => self.on_diagnostic(d, now, &mut out),
            InboundEvent::Command(c) => self.on_command(c, now, &mut out),
            InboundEvent::Test(t) => {
                let command = t.command();
                info!("Echo value {} -> {}", t.value, command);
                out.push(Outbound::DeviceCommand(command));
            }
        }
        out
    }

    /// Periodic evaluation: watchdogs, then the statistics cadence
    pub fn on_tick(&mut self, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();

        if self.ctx.state != DeviceState::Unlocked {
            self.check_silence(now, &mut out);
            self.check_geofence(now, &mut out);
        }

        if self.scheduler.on_tick(now, self.ctx.state) {
            out.push(Outbound::Statistics(self.statistics()));
        }

        out
    }

    /// Statistics record from the latest persisted sample
    pub fn statistics(&self) -> Statistics {
        let (state, reason) = (self.ctx.state, self.ctx.reason);

        let latest = match &self.store {
            Some(store) => match store.latest() {
                Ok(latest) => latest,
                Err(e) => {
                    warn!("Statistics without data, store read failed: {}", e);
                    None
                }
            },
            None => self.ctx.last_sample.clone(),
        };

        match latest {
            Some(sample) => Statistics::from_sample(&sample, state, reason),
            None => Statistics::no_data(state, reason),
        }
    }

    fn on_diagnostic(&mut self, event: DiagnosticEvent, now: Instant, out: &mut Vec<Outbound>) {
        let was_alert = self.ctx.state == DeviceState::Alert;

        self.ctx.last_diagnostic_at = Some(now);
        self.ctx.last_diagnostic_wall = Some(Utc::now());
        self.ctx.source_id = Some(event.source_id.clone());

        if let Some(point) = event.point {
            self.ctx.last_point = Some(point);

            // Lock arrived before any fix: the first fix becomes the anchor
            if self.ctx.state == DeviceState::Locked && self.ctx.reference_point.is_none() {
                info!("Geofence anchored at ({:.6}, {:.6})", point.lat, point.lon);
                self.ctx.reference_point = Some(point);
            }

            if was_alert {
                out.push(Outbound::Gps(GpsMessage::new(point, &event.source_id)));
            }
        }

        if event.reason_hint == Some(AlertReason::Tamper) {
            if self.cooldown_elapsed(AlertReason::Tamper, now) {
                self.raise_alert(AlertReason::Tamper, now, out);
            } else {
                debug!("Tamper signal within cooldown, suppressed");
            }
        }

        let sample = DiagnosticSample {
            timestamp: Utc::now(),
            state: self.ctx.state,
            point: event.point,
            battery: event.battery.unwrap_or_else(|| BATTERY_UNKNOWN.to_string()),
            reason: self.ctx.reason,
            source_id: event.source_id,
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.append(&sample) {
                warn!("Diagnostic not persisted: {}", e);
            }
        }

        self.ctx.last_sample = Some(sample);
    }

    fn on_command(&mut self, command: CommandEvent, now: Instant, out: &mut Vec<Outbound>) {
        self.ctx.source_id.get_or_insert_with(|| command.source_id.clone());

        match command.requested {
            RequestedState::Unlock => {
                self.ctx.reference_point = None;
                self.ctx.timers = WatchdogTimers::default();
                self.transition(DeviceState::Unlocked, AlertReason::None, out);
            }
            RequestedState::Lock => {
                self.ctx.reference_point = match &self.ctx.last_sample {
                    Some(_) => self.ctx.last_point,
                    None => None,
                };
                if self.ctx.reference_point.is_none() {
                    info!("Locked without a fix, geofence waits for the next diagnostic");
                }
                self.ctx.timers.watch_started_at = Some(now);
                self.transition(DeviceState::Locked, AlertReason::None, out);
            }
        }
    }

    fn check_silence(&mut self, now: Instant, out: &mut Vec<Outbound>) {
        let since = match (self.ctx.last_diagnostic_at, self.ctx.timers.watch_started_at) {
            (Some(a), Some(b)) => a.max(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return,
        };

        let silence = now.saturating_duration_since(since);
        if silence > secs_to_duration(self.config.silence_timeout_secs)
            && self.cooldown_elapsed(AlertReason::Timeout, now)
        {
            warn!("No diagnostics for {:.1}s", silence.as_secs_f64());
            self.raise_alert(AlertReason::Timeout, now, out);
        }
    }

    fn check_geofence(&mut self, now: Instant, out: &mut Vec<Outbound>) {
        let (reference, current) = match (self.ctx.reference_point, self.ctx.last_point) {
            (Some(r), Some(c)) => (r, c),
            _ => return,
        };

        let distance = reference.distance_m(&current);
        if distance > self.config.geofence_m && self.cooldown_elapsed(AlertReason::Geofence, now) {
            warn!("Device moved {:.1}m from the lock point", distance);
            self.raise_alert(AlertReason::Geofence, now, out);
        }
    }

    fn cooldown_elapsed(&self, reason: AlertReason, now: Instant) -> bool {
        match self.ctx.timers.last_alert(reason) {
            Some(at) => now.saturating_duration_since(at) >= self.config.cooldown(reason),
            None => true,
        }
    }

    fn raise_alert(&mut self, reason: AlertReason, now: Instant, out: &mut Vec<Outbound>) {
        self.ctx.timers.mark(reason, now);
        let entering = self.ctx.state != DeviceState::Alert;
        self.transition(DeviceState::Alert, reason, out);

        if entering {
            if let Some(point) = self.ctx.last_point {
                out.push(Outbound::Gps(GpsMessage::new(point, self.client_id())));
            }
        }
    }

    fn transition(&mut self, next: DeviceState, reason: AlertReason, out: &mut Vec<Outbound>) {
        let previous = self.ctx.state;
        self.ctx.state = next;
        self.ctx.reason = reason;

        if next == DeviceState::Alert {
            warn!("ALERT ({}) from {}", reason, self.client_id());
        } else {
            info!("State {} -> {}", previous, next);
        }

        out.push(Outbound::State(StateMessage {
            state: next,
            client_id: self.client_id().to_string(),
            reason,
        }));

        if previous != next {
            out.push(Outbound::Mode(ModeMessage {
                mode: next.mode().to_string(),
                client_id: self.client_id().to_string(),
            }));
        }
    }

    fn client_id(&self) -> &str {
        self.ctx.source_id.as_deref().unwrap_or(UNKNOWN_SOURCE)
    }
}
