// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! MQTT transport - broker session, inbound pump and outbound publishing

use anyhow::{anyhow, bail, Result};
use rand::Rng;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, TlsConfiguration, Transport,
};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::supervisor::{ConnectionSupervisor, DisconnectFlag, RetryDecision, RetryPolicy};
use super::Outbound;
use crate::config::{BrokerConfig, TopicConfig};
use crate::core::{ConnectivityChange, LoopEvent};

/// Outbound side of the broker session
pub struct MqttLink {
    client: AsyncClient,
    topics: TopicConfig,
}

/// Build client options from configuration
pub fn mqtt_options(config: &BrokerConfig) -> Result<MqttOptions> {
    let client_id = config.client_id.clone().unwrap_or_else(|| {
        format!("bantaybike-server-{}", rand::thread_rng().gen_range(0..=1000))
    });

    let mut options = MqttOptions::new(client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username, password);
    }

    if config.use_tls {
        let ca_path = config
            .ca_cert
            .as_ref()
            .ok_or_else(|| anyhow!("TLS enabled but broker.ca_cert is not set"))?;
        if !ca_path.exists() {
            bail!("CA certificate file not found: {:?}", ca_path);
        }
        let ca = std::fs::read(ca_path)?;
        options.set_transport(Transport::Tls(TlsConfiguration::Simple {
            ca,
            alpn: None,
            client_auth: None,
        }));
    }

    Ok(options)
}

impl MqttLink {
    /// Open the session and spawn the task that drives it
    pub fn start(
        config: &BrokerConfig,
        topics: TopicConfig,
        subscriptions: Vec<String>,
        flag: DisconnectFlag,
        events: mpsc::Sender<LoopEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(Self, JoinHandle<()>)> {
        let options = mqtt_options(config)?;
        info!("Connecting to {}:{}", config.host, config.port);

        let (client, eventloop) = AsyncClient::new(options, 100);
        let supervisor = ConnectionSupervisor::new(RetryPolicy::from_config(&config.retry), flag);

        let handle = tokio::spawn(drive(
            eventloop,
            client.clone(),
            subscriptions,
            supervisor,
            events,
            shutdown,
        ));

        Ok((Self { client, topics }, handle))
    }

    /// Queue a message without waiting on the network
    pub fn publish(&self, message: &Outbound) -> Result<()> {
        let topic = message.topic(&self.topics);
        let payload = message.encode()?;

        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| anyhow!("MQTT publish to {} failed: {}", topic, e))?;

        debug!("Queued message for {}", topic);
        Ok(())
    }

    /// Send DISCONNECT; the driver stops without reconnecting
    pub fn disconnect(&self) -> Result<()> {
        self.client
            .try_disconnect()
            .map_err(|e| anyhow!("MQTT disconnect failed: {}", e))
    }
}

async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Vec<String>,
    mut supervisor: ConnectionSupervisor,
    events: mpsc::Sender<LoopEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.recv() => {
                supervisor.shutdown();
                flush_disconnect(&mut eventloop).await;
                break;
            }
            event = eventloop.poll() => event,
        };

        let change = match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                supervisor.on_connected();

                // Re-subscribe on every (re)connect
                for topic in &subscriptions {
                    match client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        Ok(()) => info!("Subscribed to {}", topic),
                        Err(e) => error!("Subscribe to {} failed: {}", topic, e),
                    }
                }
                Some(ConnectivityChange::Connected)
            }
            Ok(Event::Incoming(Packet::Publish(msg))) => {
                debug!("MQTT received on {}", msg.topic);
                let forwarded = LoopEvent::Transport {
                    topic: msg.topic.clone(),
                    payload: msg.payload.to_vec(),
                };
                if events.send(forwarded).await.is_err() {
                    break;
                }
                None
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent");
                None
            }
            Ok(_) => None,
            Err(e) => {
                let was_connected = supervisor.is_connected();
                match supervisor.on_failure(&e.to_string()) {
                    RetryDecision::Retry { delay, .. } => {
                        if was_connected {
                            let lost = ConnectivityChange::Lost(e.to_string());
                            if events.send(LoopEvent::Connectivity(lost)).await.is_err() {
                                break;
                            }
                        }
                        tokio::select! {
                            _ = shutdown.recv() => {
                                supervisor.shutdown();
                                break;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        None
                    }
                    RetryDecision::Stop => break,
                    RetryDecision::Exhausted(err) => {
                        error!("{}", err);
                        let attempts = supervisor.policy().max_attempts;
                        Some(ConnectivityChange::Exhausted { attempts })
                    }
                }
            }
        };

        if let Some(change) = change {
            let fatal = matches!(change, ConnectivityChange::Exhausted { .. });
            if events.send(LoopEvent::Connectivity(change)).await.is_err() || fatal {
                break;
            }
        }
    }

    info!("MQTT client stopped");
}

/// Poll until the queued DISCONNECT is written, bounded by a short timeout
async fn flush_disconnect(eventloop: &mut EventLoop) {
    let flushed = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;

    if flushed.is_err() {
        warn!("Timed out flushing MQTT disconnect");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn plain() -> BrokerConfig {
        BrokerConfig {
            host: "broker.local".to_string(),
            port: 1883,
            use_tls: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_generated_client_id() {
        let options = mqtt_options(&plain()).unwrap();
        assert!(options.client_id().starts_with("bantaybike-server-"));
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn test_explicit_client_id() {
        let mut config = plain();
        config.client_id = Some("relay-1".to_string());
        assert_eq!(mqtt_options(&config).unwrap().client_id(), "relay-1");
    }

    /// Spawn the driver against a port nothing listens on
    fn unreachable(
        max_attempts: u32,
        first_delay_secs: u64,
    ) -> (JoinHandle<()>, mpsc::Receiver<LoopEvent>, broadcast::Sender<()>) {
        let mut config = plain();
        config.host = "127.0.0.1".to_string();
        config.port = 1;
        config.retry.max_attempts = max_attempts;
        config.retry.first_delay_secs = first_delay_secs;

        let (client, eventloop) = AsyncClient::new(mqtt_options(&config).unwrap(), 10);
        let supervisor =
            ConnectionSupervisor::new(RetryPolicy::from_config(&config.retry), DisconnectFlag::new());
        let (events_tx, events_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(drive(eventloop, client, Vec::new(), supervisor, events_tx, shutdown_rx));
        (handle, events_rx, shutdown_tx)
    }

    #[tokio::test]
    async fn test_unreachable_broker_exhausts() {
        let (handle, mut events, _shutdown) = unreachable(2, 1);

        // Attempt 1 after 1s, attempt 2 after 2s, then give up
        let event = tokio::time::timeout(Duration::from_secs(20), events.recv())
            .await
            .unwrap();
        assert!(matches!(
            event,
            Some(LoopEvent::Connectivity(ConnectivityChange::Exhausted { attempts: 2 }))
        ));

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let (handle, mut events, shutdown) = unreachable(12, 30);

        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_missing_ca_is_rejected() {
        let mut config = plain();
        config.use_tls = true;
        config.ca_cert = Some(PathBuf::from("/nonexistent/emqxsl-ca.crt"));
        assert!(mqtt_options(&config).is_err());

        config.ca_cert = None;
        assert!(mqtt_options(&config).is_err());
    }
}
