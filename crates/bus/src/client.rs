//! MQTT transport: connection ownership, reconnect with backoff, and
//! ConnAck-driven resubscription.
//!
//! The `rumqttc` event loop is owned entirely by a background task; the
//! rest of the process talks to it through [`MqttTransport`] handles.
//! Incoming publishes are forwarded over a bounded channel in broker
//! delivery order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use alicia_core::MqttConfig;

use crate::envelope::Envelope;
use crate::error::BusError;
use crate::topics;

/// QoS levels used on the bus: heartbeats are fire-and-forget, everything
/// else is at-least-once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
}

impl QosLevel {
    fn to_mqtt(self) -> QoS {
        match self {
            Self::AtMostOnce => QoS::AtMostOnce,
            Self::AtLeastOnce => QoS::AtLeastOnce,
        }
    }
}

/// Reconnect backoff: 1 s doubling to a 60 s cap, with jitter.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Bound on the broker→service delivery channel. Messages beyond this are
/// dropped and counted rather than ballooning memory.
const INCOMING_CHANNEL_CAPACITY: usize = 256;

/// A raw publish received from the broker: (topic, payload bytes).
pub type IncomingMessage = (String, Vec<u8>);

pub struct MqttTransport {
    client: AsyncClient,
    connected_rx: watch::Receiver<bool>,
    filters: Arc<Mutex<Vec<(String, QosLevel)>>>,
    dropped: Arc<AtomicU64>,
    shutdown_tx: watch::Sender<bool>,
}

impl MqttTransport {
    /// Dial the broker and spawn the event-loop task.
    ///
    /// The last will publishes the given envelope to the unregister topic so
    /// abrupt disconnects are observable by discovery. Returns the transport
    /// handle plus the incoming-message receiver.
    pub fn connect(
        config: &MqttConfig,
        service_name: &str,
        will: &Envelope,
    ) -> Result<(Self, mpsc::Receiver<IncomingMessage>), BusError> {
        let client_id = format!("{}_{}", service_name, &Uuid::new_v4().simple().to_string()[..8]);
        let mut options = MqttOptions::new(client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_secs));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user.clone(), pass.clone());
        }
        options.set_last_will(LastWill::new(
            topics::DISCOVERY_UNREGISTER,
            will.to_bytes()?,
            QoS::AtLeastOnce,
            false,
        ));

        let (client, event_loop) = AsyncClient::new(options, 64);
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_CHANNEL_CAPACITY);
        let (connected_tx, connected_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let filters: Arc<Mutex<Vec<(String, QosLevel)>>> = Arc::new(Mutex::new(Vec::new()));
        let dropped = Arc::new(AtomicU64::new(0));

        tokio::spawn(event_loop_task(
            event_loop,
            client.clone(),
            incoming_tx,
            connected_tx,
            shutdown_rx,
            Arc::clone(&filters),
            Arc::clone(&dropped),
            config.host.clone(),
            config.port,
        ));

        Ok((
            Self {
                client,
                connected_rx,
                filters,
                dropped,
                shutdown_tx,
            },
            incoming_rx,
        ))
    }

    /// Register a topic filter. The subscription is issued immediately when
    /// connected and re-issued on every reconnect.
    pub async fn subscribe(&self, filter: &str, qos: QosLevel) -> Result<(), BusError> {
        {
            let mut filters = self.filters.lock().await;
            if !filters.iter().any(|(f, _)| f == filter) {
                filters.push((filter.to_string(), qos));
            }
        }
        if self.is_connected() {
            self.client.subscribe(filter, qos.to_mqtt()).await?;
        }
        Ok(())
    }

    /// Publish raw bytes. Fails fast when the broker connection is down —
    /// callers decide whether to retry, never the transport.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
    ) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        self.client
            .publish(topic, qos.to_mqtt(), false, payload)
            .await?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        *self.connected_rx.borrow()
    }

    /// Watch channel tracking broker connectivity.
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected_rx.clone()
    }

    /// Count of inbound messages dropped on channel overflow.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop the event loop and close the connection.
    pub async fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.client.disconnect().await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn event_loop_task(
    mut event_loop: rumqttc::EventLoop,
    client: AsyncClient,
    incoming_tx: mpsc::Sender<IncomingMessage>,
    connected_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
    filters: Arc<Mutex<Vec<(String, QosLevel)>>>,
    dropped: Arc<AtomicU64>,
    host: String,
    port: u16,
) {
    let mut backoff = BACKOFF_INITIAL;

    loop {
        let event = tokio::select! {
            ev = event_loop.poll() => ev,
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(host = %host, port, "connected to broker");
                backoff = BACKOFF_INITIAL;
                let _ = connected_tx.send(true);

                // Re-subscribe on every (re)connect — the broker may have
                // dropped session state while we were away.
                let current = filters.lock().await.clone();
                for (filter, qos) in current {
                    if let Err(e) = client.subscribe(&filter, qos.to_mqtt()).await {
                        warn!(filter = %filter, error = %e, "re-subscribe failed");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let topic = publish.topic.clone();
                match incoming_tx.try_send((publish.topic, publish.payload.to_vec())) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(topic = %topic, "incoming channel full, dropping message");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("broker sent disconnect");
                let _ = connected_tx.send(false);
            }
            Ok(_) => {}
            Err(e) => {
                if *shutdown_rx.borrow() {
                    break;
                }
                let _ = connected_tx.send(false);
                let delay = jittered(backoff);
                debug!(error = %e, delay_ms = delay.as_millis() as u64, "connection error, backing off");
                tokio::time::sleep(delay).await;
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }
    }

    let _ = connected_tx.send(false);
    info!("mqtt event loop stopped");
}

/// Apply ±25% jitter so a fleet of services does not reconnect in lockstep.
fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_mapping() {
        assert_eq!(QosLevel::AtMostOnce.to_mqtt(), QoS::AtMostOnce);
        assert_eq!(QosLevel::AtLeastOnce.to_mqtt(), QoS::AtLeastOnce);
    }

    #[test]
    fn jitter_stays_in_band() {
        for _ in 0..100 {
            let d = jittered(Duration::from_secs(4));
            assert!(d >= Duration::from_secs(3));
            assert!(d <= Duration::from_secs(5));
        }
    }

    #[tokio::test]
    async fn publish_fails_fast_when_disconnected() {
        let config = MqttConfig {
            host: "127.0.0.1".into(),
            port: 41883, // nothing listening
            username: None,
            password: None,
            keepalive_secs: 60,
        };
        let will = Envelope::event("test_service", serde_json::json!({"status": "offline"}));
        let (transport, _rx) = MqttTransport::connect(&config, "test_service", &will).unwrap();

        let result = transport
            .publish("alicia/test", b"{}".to_vec(), QosLevel::AtLeastOnce)
            .await;
        assert!(matches!(result, Err(BusError::NotConnected)));

        transport.disconnect().await;
    }
}
