// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! Runtime - owns the engine and drives it from a fixed-period tick

use anyhow::{Context, Result};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{ConnectivityChange, DeviceStateEngine, EventBus, LoopEvent, StateSnapshot};
use crate::config::{Config, DatabaseConfig};
use crate::db::{Database, DiagnosticStore};
use crate::error::ConnectivityError;
use crate::router::MessageRouter;
use crate::streaming::{DisconnectFlag, MqttLink, Outbound, SignalLog};

const EVENT_QUEUE: usize = 256;
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything the tick loop mutates. Kept free of I/O handles other than
/// the store so it can be exercised without a broker.
struct Pipeline {
    engine: DeviceStateEngine,
    router: MessageRouter,
    signal_log: Option<SignalLog>,
    broker_connected: bool,
}

impl Pipeline {
    fn new(engine: DeviceStateEngine, router: MessageRouter, signal_log: Option<SignalLog>) -> Self {
        Self {
            engine,
            router,
            signal_log,
            broker_connected: false,
        }
    }

    /// Apply one queued event. Only connectivity exhaustion is an error.
    fn process(&mut self, event: LoopEvent, now: Instant) -> Result<Vec<Outbound>, ConnectivityError> {
        match event {
            LoopEvent::Transport { topic, payload } => {
                if let Some(log) = &self.signal_log {
                    log.record(&topic, &payload);
                }

                match self.router.route(&topic, &payload) {
                    Ok(Some(inbound)) => Ok(self.engine.handle(inbound, now)),
                    Ok(None) => {
                        debug!("No route for topic {}", topic);
                        Ok(Vec::new())
                    }
                    Err(e) => {
                        warn!("Dropped message: {}", e);
                        Ok(Vec::new())
                    }
                }
            }
            LoopEvent::Ingress(inbound) => Ok(self.engine.handle(inbound, now)),
            LoopEvent::Connectivity(change) => match change {
                ConnectivityChange::Connected => {
                    self.broker_connected = true;
                    Ok(Vec::new())
                }
                ConnectivityChange::Lost(cause) => {
                    warn!("Broker connection lost: {}", cause);
                    self.broker_connected = false;
                    Ok(Vec::new())
                }
                ConnectivityChange::Exhausted { attempts } => {
                    self.broker_connected = false;
                    Err(ConnectivityError::Exhausted { attempts })
                }
            },
        }
    }

    /// Drain everything queued since the last tick, then evaluate watchdogs
    fn step(
        &mut self,
        rx: &mut mpsc::Receiver<LoopEvent>,
        now: Instant,
    ) -> Result<Vec<Outbound>, ConnectivityError> {
        let mut out = Vec::new();

        loop {
            match rx.try_recv() {
                Ok(event) => out.extend(self.process(event, now)?),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        out.extend(self.engine.on_tick(now));
        Ok(out)
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state: self.engine.state(),
            reason: self.engine.reason(),
            client_id: self.engine.source_id().map(str::to_string),
            broker_connected: self.broker_connected,
            last_diagnostic_at: self.engine.last_diagnostic_at(),
        }
    }

    fn close(&self) {
        if let Some(log) = &self.signal_log {
            if let Err(e) = log.close() {
                warn!("Failed to close signal log: {}", e);
            }
        }
    }
}

/// Relay process: broker session, HTTP ingress and the owning tick loop
pub struct Runtime {
    config: Config,
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run until a termination signal or reconnect exhaustion.
    ///
    /// Both exits release the broker session, signal log and database
    /// before returning; exhaustion is returned as an error.
    pub async fn run(self) -> Result<()> {
        let config = self.config;

        let store = open_store(&config.database)?;
        let engine = DeviceStateEngine::new(config.engine.clone(), store, Instant::now());

        let router = MessageRouter::new(config.topics.clone());
        let signal_log = if config.signal_log.enabled {
            match SignalLog::new(&config.signal_log.path) {
                Ok(log) => Some(log),
                Err(e) => {
                    warn!("Signal log disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let (bus, mut rx) = EventBus::new(EVENT_QUEUE);
        let flag = DisconnectFlag::new();

        #[cfg(feature = "http")]
        let http = if config.http.enabled {
            Some(crate::streaming::http::serve(&config.http, router.clone(), &bus).await?)
        } else {
            None
        };
        #[cfg(not(feature = "http"))]
        let http: Option<tokio::task::JoinHandle<()>> = None;

        let started = MqttLink::start(
            &config.broker,
            config.topics.clone(),
            router.subscriptions(),
            flag.clone(),
            bus.events(),
            bus.subscribe_shutdown(),
        );
        let (link, transport) = match started {
            Ok(started) => started,
            Err(e) => {
                bus.shutdown();
                return Err(e);
            }
        };

        let mut pipeline = Pipeline::new(engine, router, signal_log);

        let mut ticker = tokio::time::interval(config.engine.tick());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let signal = shutdown_signal();
        tokio::pin!(signal);

        info!("Engine running, tick every {:?}", config.engine.tick());

        let outcome = loop {
            tokio::select! {
                _ = ticker.tick() => {}
                name = &mut signal => {
                    info!("Received {}, shutting down", name);
                    break Ok(());
                }
            }

            match pipeline.step(&mut rx, Instant::now()) {
                Ok(out) => {
                    for message in &out {
                        if let Err(e) = link.publish(message) {
                            warn!("{}", e);
                        }
                    }
                }
                Err(e) => {
                    error!("{}, shutting down", e);
                    break Err(e);
                }
            }

            bus.publish_snapshot(pipeline.snapshot());
        };

        // Release path shared by both exits
        flag.request();
        if let Err(e) = link.disconnect() {
            debug!("{}", e);
        }
        bus.shutdown();

        if tokio::time::timeout(TASK_JOIN_TIMEOUT, transport).await.is_err() {
            warn!("MQTT task did not stop in time");
        }

        if let Some(handle) = http {
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("HTTP server did not stop in time");
            }
        }

        pipeline.close();
        drop(pipeline);
        info!("Shutdown complete");

        outcome.map_err(Into::into)
    }
}

fn open_store(config: &DatabaseConfig) -> Result<Option<Box<dyn DiagnosticStore>>> {
    if !config.enabled {
        warn!("Persistence disabled, statistics use the in-memory sample");
        return Ok(None);
    }

    let db = Database::open(config)
        .with_context(|| format!("failed to open diagnostics database at {:?}", config.path))?;

    if config.retention_days > 0 {
        if let Err(e) = db.cleanup(config.retention_days) {
            warn!("Retention cleanup failed: {}", e);
        }
    }

    match db.get_stats() {
        Ok(stats) => info!(
            "{} stored diagnostics ({} bytes)",
            stats.sample_count, stats.size_bytes
        ),
        Err(e) => warn!("Could not read database stats: {}", e),
    }

    Ok(Some(Box::new(db)))
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        },
        Err(e) => {
            warn!("SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "Ctrl-C"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TopicConfig;
    use crate::core::{AlertReason, DeviceState, EngineConfig};

    fn pipeline(signal_log: Option<SignalLog>) -> Pipeline {
        let db = Database::open_in_memory().unwrap();
        let engine = DeviceStateEngine::new(EngineConfig::default(), Some(Box::new(db)), Instant::now());
        Pipeline::new(engine, MessageRouter::new(TopicConfig::default()), signal_log)
    }

    fn transport(topic: &str, payload: &str) -> LoopEvent {
        LoopEvent::Transport {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_commands_flow_through_router() {
        let mut p = pipeline(None);
        let now = Instant::now();

        p.process(transport("diagnostics/device", r#"{"client_id":"esp32-01","gps":{"lat":14.6,"lon":121.0}}"#), now)
            .unwrap();
        let out = p.process(transport("command/lock-unlock", r#"{"state":"Lock"}"#), now).unwrap();

        assert_eq!(p.engine.state(), DeviceState::Locked);
        assert!(out.iter().any(|m| matches!(m, Outbound::State(_))));

        let snapshot = p.snapshot();
        assert_eq!(snapshot.state, DeviceState::Locked);
        assert_eq!(snapshot.client_id.as_deref(), Some("esp32-01"));
        assert!(snapshot.last_diagnostic_at.is_some());
    }

    #[test]
    fn test_malformed_and_unrouted_are_dropped() {
        let mut p = pipeline(None);
        let now = Instant::now();

        assert!(p.process(transport("diagnostics/device", "{not json"), now).unwrap().is_empty());
        assert!(p.process(transport("command/lock-unlock", r#"{"state":"open"}"#), now).unwrap().is_empty());
        assert!(p.process(transport("somewhere/else", "{}"), now).unwrap().is_empty());
        assert_eq!(p.engine.state(), DeviceState::Unknown);
    }

    #[test]
    fn test_echo_reaches_outbound() {
        let mut p = pipeline(None);
        let out = p.process(transport("test/echo", r#"{"value":70}"#), Instant::now()).unwrap();
        assert!(matches!(out.as_slice(), [Outbound::DeviceCommand("ON")]));
    }

    #[test]
    fn test_connectivity_tracking_and_exhaustion() {
        let mut p = pipeline(None);
        let now = Instant::now();

        p.process(LoopEvent::Connectivity(ConnectivityChange::Connected), now).unwrap();
        assert!(p.snapshot().broker_connected);

        p.process(LoopEvent::Connectivity(ConnectivityChange::Lost("eof".into())), now).unwrap();
        assert!(!p.snapshot().broker_connected);

        let err = p
            .process(LoopEvent::Connectivity(ConnectivityChange::Exhausted { attempts: 12 }), now)
            .unwrap_err();
        assert_eq!(err, ConnectivityError::Exhausted { attempts: 12 });
    }

    #[tokio::test]
    async fn test_step_drains_queue_then_ticks() {
        let mut p = pipeline(None);
        let (bus, mut rx) = EventBus::new(8);
        let tx = bus.events();
        let start = Instant::now();

        tx.send(transport("command/lock-unlock", r#"{"state":"lock"}"#)).await.unwrap();
        let out = p.step(&mut rx, start).unwrap();
        assert!(out.iter().any(|m| matches!(m, Outbound::State(_))));
        assert_eq!(p.engine.state(), DeviceState::Locked);

        // Nothing heard since the lock
        let out = p.step(&mut rx, start + Duration::from_millis(30_100)).unwrap();
        assert_eq!(p.engine.state(), DeviceState::Alert);
        assert_eq!(p.engine.reason(), AlertReason::Timeout);
        assert!(out.iter().any(|m| matches!(m, Outbound::State(_))));
    }

    #[tokio::test]
    async fn test_step_stops_on_exhaustion() {
        let mut p = pipeline(None);
        let (bus, mut rx) = EventBus::new(8);
        bus.events()
            .send(LoopEvent::Connectivity(ConnectivityChange::Exhausted { attempts: 12 }))
            .await
            .unwrap();

        assert!(p.step(&mut rx, Instant::now()).is_err());
    }

    #[test]
    fn test_transport_messages_are_logged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signals.log");
        let mut p = pipeline(Some(SignalLog::new(&path).unwrap()));

        p.process(transport("test/echo", r#"{"value":10}"#), Instant::now()).unwrap();
        p.process(transport("diagnostics/device", "garbage"), Instant::now()).unwrap();
        p.close();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.starts_with(r#"test/echo: {"value":10}"#));
    }

    #[test]
    fn test_disabled_store() {
        let config = DatabaseConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(open_store(&config).unwrap().is_none());
    }
}
