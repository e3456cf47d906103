//! Service runtime embedded by every bus component.
//!
//! Owns the single broker connection and provides envelope publish,
//! ordered per-topic subscription dispatch, duplicate/TTL filtering,
//! discovery registration, periodic health publishing, and graceful
//! shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use alicia_core::{env_u64, epoch_secs, BusConfig};

use crate::client::{IncomingMessage, MqttTransport, QosLevel};
use crate::envelope::{Envelope, MessageType, Priority};
use crate::error::BusError;
use crate::topics;
use crate::traits::{BusPublisher, MessageHandler};

/// Per-subscription channel bound. Full channels exert backpressure on the
/// dispatch task rather than dropping.
const SUBSCRIPTION_CHANNEL_CAPACITY: usize = 64;

/// Prune the duplicate-suppression set once it grows past this.
const SEEN_PRUNE_THRESHOLD: usize = 4096;

// ── Lifecycle ────────────────────────────────────────────────────────

/// Runtime lifecycle: `Init → Connecting → Online ⇄ Reconnecting → Shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Init,
    Connecting,
    Online,
    Reconnecting,
    Shutdown,
}

// ── Publish options ──────────────────────────────────────────────────

/// Options for [`ServiceRuntime::publish`]; defaults match the bus-wide
/// conventions (broadcast event, QoS 1, normal priority, 300 s TTL).
#[derive(Debug, Clone)]
pub struct PublishOpts {
    pub qos: QosLevel,
    pub destination: String,
    pub message_type: MessageType,
    pub priority: Priority,
    pub ttl_seconds: f64,
}

impl Default for PublishOpts {
    fn default() -> Self {
        Self {
            qos: QosLevel::AtLeastOnce,
            destination: "broadcast".into(),
            message_type: MessageType::Event,
            priority: Priority::Normal,
            ttl_seconds: 300.0,
        }
    }
}

impl PublishOpts {
    pub fn request(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            message_type: MessageType::Request,
            ..Self::default()
        }
    }

    pub fn command(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            message_type: MessageType::Command,
            ..Self::default()
        }
    }
}

// ── Health snapshot ──────────────────────────────────────────────────

/// Snapshot served at `GET /health` and published on the heartbeat topic.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub service_name: String,
    pub instance_id: String,
    pub status: &'static str,
    pub state: ServiceState,
    pub uptime_seconds: f64,
    pub messages_processed: u64,
    pub errors: u64,
    pub mqtt_connected: bool,
    pub timestamp: f64,
}

// ── Runtime ──────────────────────────────────────────────────────────

struct Subscription {
    filter: String,
    tx: mpsc::Sender<(String, Envelope)>,
}

pub struct ServiceRuntime {
    config: BusConfig,
    transport: MqttTransport,
    instance_id: String,
    capabilities: Vec<String>,
    version: String,
    started_at: Instant,
    message_count: AtomicU64,
    error_count: AtomicU64,
    state_tx: watch::Sender<ServiceState>,
    state_rx: watch::Receiver<ServiceState>,
    subscriptions: Mutex<Vec<Subscription>>,
    /// message_id → expiry time, for at-most-once delivery.
    seen: Mutex<HashMap<String, f64>>,
    /// Live configuration pushed by the config service.
    config_tx: tokio::sync::broadcast::Sender<Value>,
}

impl ServiceRuntime {
    /// Connect to the broker and start the runtime's background tasks:
    /// dispatch, lifecycle tracking, and the periodic health loop.
    pub async fn connect(
        config: BusConfig,
        capabilities: Vec<String>,
        version: &str,
    ) -> Result<Arc<Self>, BusError> {
        let instance_id = format!(
            "{}_{}",
            config.service_name,
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );

        let will = Envelope::event(
            config.service_name.clone(),
            serde_json::json!({
                "service_name": config.service_name,
                "instance_id": instance_id,
                "status": "offline",
            }),
        );

        let (state_tx, state_rx) = watch::channel(ServiceState::Init);
        let _ = state_tx.send(ServiceState::Connecting);

        let (transport, incoming_rx) =
            MqttTransport::connect(&config.mqtt, &config.service_name, &will)?;

        let (config_tx, _) = tokio::sync::broadcast::channel(8);

        let runtime = Arc::new(Self {
            config,
            transport,
            instance_id,
            capabilities,
            version: version.to_string(),
            started_at: Instant::now(),
            message_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            state_tx,
            state_rx,
            subscriptions: Mutex::new(Vec::new()),
            seen: Mutex::new(HashMap::new()),
            config_tx,
        });

        tokio::spawn(dispatch_task(Arc::clone(&runtime), incoming_rx));
        tokio::spawn(lifecycle_task(Arc::clone(&runtime)));
        tokio::spawn(health_loop(Arc::clone(&runtime)));

        // Answer health-check solicitations with an immediate heartbeat.
        let rt = Arc::clone(&runtime);
        runtime
            .subscribe(
                topics::HEALTH_CHECK,
                QosLevel::AtLeastOnce,
                crate::traits::handler(move |_topic, _env| {
                    let rt = Arc::clone(&rt);
                    async move {
                        rt.publish_health().await;
                        Ok(())
                    }
                }),
            )
            .await?;

        // Pushed configuration (service-scoped and global) lands on the
        // runtime's config channel; components apply it as it arrives.
        for topic in [
            topics::config_update(&runtime.config.service_name),
            topics::CONFIG_GLOBAL_UPDATE.to_string(),
        ] {
            let rt = Arc::clone(&runtime);
            runtime
                .subscribe(
                    &topic,
                    QosLevel::AtLeastOnce,
                    crate::traits::handler(move |_topic, envelope| {
                        let rt = Arc::clone(&rt);
                        async move {
                            if let Some(config) = envelope.payload.get("config") {
                                let _ = rt.config_tx.send(config.clone());
                                info!(service = %rt.config.service_name, "configuration update received");
                            }
                            Ok(())
                        }
                    }),
                )
                .await?;
        }

        Ok(runtime)
    }

    /// Subscribe to configuration pushed from the config service.
    pub fn config_updates(&self) -> tokio::sync::broadcast::Receiver<Value> {
        self.config_tx.subscribe()
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ServiceState> {
        self.state_rx.clone()
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Subscribe with a handler. Envelopes on the same topic reach the
    /// handler in broker delivery order; different subscriptions interleave.
    pub async fn subscribe(
        &self,
        filter: &str,
        qos: QosLevel,
        handler: MessageHandler,
    ) -> Result<(), BusError> {
        let (tx, mut rx) = mpsc::channel::<(String, Envelope)>(SUBSCRIPTION_CHANNEL_CAPACITY);

        {
            let mut subs = self.subscriptions.lock().await;
            subs.push(Subscription {
                filter: filter.to_string(),
                tx,
            });
        }
        self.transport.subscribe(filter, qos).await?;

        // One drain task per subscription keeps per-topic ordering without
        // spawning a task per message.
        let filter_owned = filter.to_string();
        tokio::spawn(async move {
            while let Some((topic, envelope)) = rx.recv().await {
                if let Err(e) = handler(topic.clone(), envelope).await {
                    warn!(filter = %filter_owned, topic = %topic, error = %e, "handler failed");
                }
            }
        });

        info!(filter = %filter, "subscribed");
        Ok(())
    }

    /// Wrap a payload in a fresh envelope and publish it. Returns the
    /// envelope so callers can correlate on its `message_id`.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Value,
        opts: PublishOpts,
    ) -> Result<Envelope, BusError> {
        let envelope = Envelope::new(
            self.config.service_name.clone(),
            opts.destination,
            opts.message_type,
            payload,
        )
        .with_priority(opts.priority)
        .with_ttl(opts.ttl_seconds);

        self.publish_envelope(topic, &envelope, opts.qos).await?;
        Ok(envelope)
    }

    /// Publish a pre-built envelope (replies, relays).
    pub async fn publish_envelope(
        &self,
        topic: &str,
        envelope: &Envelope,
        qos: QosLevel,
    ) -> Result<(), BusError> {
        let bytes = envelope.to_bytes()?;
        self.transport.publish(topic, bytes, qos).await?;
        debug!(topic = %topic, message_id = %envelope.message_id, "published");
        Ok(())
    }

    /// Publish the periodic heartbeat (QoS 0).
    pub async fn publish_health(&self) {
        let snapshot = self.health_snapshot();
        let payload = match serde_json::to_value(&snapshot) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to serialize health snapshot");
                return;
            }
        };
        let envelope = Envelope::event(self.config.service_name.clone(), payload);
        if let Err(e) = self
            .publish_envelope(
                &topics::health(&self.config.service_name),
                &envelope,
                QosLevel::AtMostOnce,
            )
            .await
        {
            debug!(error = %e, "health publish skipped");
        }
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        let connected = self.transport.is_connected();
        HealthSnapshot {
            service_name: self.config.service_name.clone(),
            instance_id: self.instance_id.clone(),
            status: if connected { "healthy" } else { "unhealthy" },
            state: self.state(),
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
            messages_processed: self.message_count.load(Ordering::Relaxed),
            errors: self.error_count.load(Ordering::Relaxed),
            mqtt_connected: connected,
            timestamp: epoch_secs(),
        }
    }

    /// Publish unregister, stop subscriptions, close the connection.
    pub async fn shutdown(&self) {
        info!(service = %self.config.service_name, "shutting down");
        let _ = self.state_tx.send(ServiceState::Shutdown);

        let unregister = Envelope::event(
            self.config.service_name.clone(),
            serde_json::json!({
                "service_name": self.config.service_name,
                "instance_id": self.instance_id,
                "status": "offline",
                "timestamp": epoch_secs(),
            }),
        );
        if let Err(e) = self
            .publish_envelope(topics::DISCOVERY_UNREGISTER, &unregister, QosLevel::AtLeastOnce)
            .await
        {
            warn!(error = %e, "failed to publish unregister");
        }

        self.subscriptions.lock().await.clear();
        self.transport.disconnect().await;
        info!(service = %self.config.service_name, "shutdown complete");
    }

    /// Publish the discovery registration announcing this instance.
    async fn publish_registration(&self) {
        let registration = Envelope::event(
            self.config.service_name.clone(),
            serde_json::json!({
                "service_name": self.config.service_name,
                "instance_id": self.instance_id,
                "host": self.config.http.advertise_host,
                "port": self.config.http.port,
                "capabilities": self.capabilities,
                "version": self.version,
                "status": "online",
                "timestamp": epoch_secs(),
            }),
        );
        if let Err(e) = self
            .publish_envelope(topics::DISCOVERY_REGISTER, &registration, QosLevel::AtLeastOnce)
            .await
        {
            warn!(error = %e, "failed to publish registration");
        }
    }

    /// Decide whether an incoming envelope reaches handlers: drops expired,
    /// duplicate, and over-hopped messages.
    async fn admit(&self, envelope: &Envelope) -> bool {
        let now = epoch_secs();

        if envelope.is_expired(now) {
            debug!(message_id = %envelope.message_id, "dropping expired message");
            return false;
        }

        if envelope.routing.hops > envelope.routing.max_hops {
            debug!(message_id = %envelope.message_id, hops = envelope.routing.hops, "dropping over-hopped message");
            return false;
        }

        let mut seen = self.seen.lock().await;
        if let Some(expiry) = seen.get(&envelope.message_id) {
            if *expiry > now {
                debug!(message_id = %envelope.message_id, "dropping duplicate message");
                return false;
            }
        }
        seen.insert(
            envelope.message_id.clone(),
            envelope.timestamp + envelope.ttl_seconds,
        );
        if seen.len() > SEEN_PRUNE_THRESHOLD {
            seen.retain(|_, expiry| *expiry > now);
        }
        true
    }
}

#[async_trait]
impl BusPublisher for ServiceRuntime {
    async fn publish(
        &self,
        topic: &str,
        envelope: &Envelope,
        qos: QosLevel,
    ) -> Result<(), BusError> {
        self.publish_envelope(topic, envelope, qos).await
    }
}

// ── Background tasks ─────────────────────────────────────────────────

/// Route incoming raw messages to matching subscription channels.
async fn dispatch_task(runtime: Arc<ServiceRuntime>, mut incoming_rx: mpsc::Receiver<IncomingMessage>) {
    while let Some((topic, bytes)) = incoming_rx.recv().await {
        let envelope = match Envelope::from_bytes(&bytes) {
            Ok(env) => env,
            Err(e) => {
                runtime.record_error();
                debug!(topic = %topic, error = %e, "dropping malformed envelope");
                continue;
            }
        };

        if !runtime.admit(&envelope).await {
            continue;
        }

        runtime.message_count.fetch_add(1, Ordering::Relaxed);

        // Snapshot matching senders, then send without holding the lock —
        // a handler may itself subscribe while we are backpressured.
        let targets: Vec<mpsc::Sender<(String, Envelope)>> = {
            let subs = runtime.subscriptions.lock().await;
            subs.iter()
                .filter(|sub| topics::topic_matches(&sub.filter, &topic))
                .map(|sub| sub.tx.clone())
                .collect()
        };
        for tx in targets {
            // Bounded send: backpressure on a slow handler instead of
            // unbounded buffering.
            if tx.send((topic.clone(), envelope.clone())).await.is_err() {
                debug!(topic = %topic, "subscription channel closed");
            }
        }
    }
}

/// Track broker connectivity and drive the lifecycle state machine.
async fn lifecycle_task(runtime: Arc<ServiceRuntime>) {
    let mut connected = runtime.transport.connected_watch();
    let mut was_online = false;

    loop {
        if connected.changed().await.is_err() {
            break;
        }
        if runtime.state() == ServiceState::Shutdown {
            break;
        }

        if *connected.borrow() {
            let _ = runtime.state_tx.send(ServiceState::Online);
            runtime.publish_registration().await;
            runtime.publish_health().await;
            was_online = true;
        } else if was_online {
            let _ = runtime.state_tx.send(ServiceState::Reconnecting);
        }
    }
}

/// Periodic heartbeat, default every 30 s (`HEALTH_CHECK_INTERVAL`).
async fn health_loop(runtime: Arc<ServiceRuntime>) {
    let interval_secs = env_u64("HEALTH_CHECK_INTERVAL", 30);
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut state = runtime.state_watch();
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if runtime.state() == ServiceState::Shutdown {
                    break;
                }
                runtime.publish_health().await;
            }
            result = state.changed() => {
                if result.is_err() || *state.borrow() == ServiceState::Shutdown {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_envelope(id: &str, timestamp: f64, ttl: f64) -> Envelope {
        let mut env = Envelope::event("test", serde_json::json!({}));
        env.message_id = id.to_string();
        env.timestamp = timestamp;
        env.ttl_seconds = ttl;
        env
    }

    async fn test_runtime() -> Arc<ServiceRuntime> {
        let config = BusConfig {
            service_name: "test_service".into(),
            environment: "test".into(),
            mqtt: alicia_core::MqttConfig {
                host: "127.0.0.1".into(),
                port: 41884, // nothing listening; transport stays disconnected
                username: None,
                password: None,
                keepalive_secs: 60,
            },
            http: alicia_core::HttpConfig {
                host: "0.0.0.0".into(),
                port: 8000,
                advertise_host: "localhost".into(),
            },
        };
        ServiceRuntime::connect(config, vec!["testing".into()], "1.0.0")
            .await
            .expect("runtime should construct without a live broker")
    }

    #[tokio::test]
    async fn fresh_message_admitted_once() {
        let runtime = test_runtime().await;
        let env = test_envelope("m-1", epoch_secs(), 300.0);

        assert!(runtime.admit(&env).await);
        // Same message_id within the TTL window is a duplicate.
        assert!(!runtime.admit(&env).await);
    }

    #[tokio::test]
    async fn expired_message_rejected() {
        let runtime = test_runtime().await;
        let env = test_envelope("m-2", epoch_secs() - 400.0, 300.0);
        assert!(!runtime.admit(&env).await);
    }

    #[tokio::test]
    async fn over_hopped_message_rejected() {
        let runtime = test_runtime().await;
        let mut env = test_envelope("m-3", epoch_secs(), 300.0);
        env.routing.hops = 11;
        env.routing.max_hops = 10;
        assert!(!runtime.admit(&env).await);
    }

    #[tokio::test]
    async fn health_snapshot_reflects_disconnected_broker() {
        let runtime = test_runtime().await;
        let snap = runtime.health_snapshot();
        assert_eq!(snap.service_name, "test_service");
        assert_eq!(snap.status, "unhealthy");
        assert!(!snap.mqtt_connected);
        assert_eq!(snap.errors, 0);
    }

    #[tokio::test]
    async fn publish_opts_defaults() {
        let opts = PublishOpts::default();
        assert_eq!(opts.destination, "broadcast");
        assert_eq!(opts.message_type, MessageType::Event);
        assert_eq!(opts.ttl_seconds, 300.0);

        let req = PublishOpts::request("config_service");
        assert_eq!(req.destination, "config_service");
        assert_eq!(req.message_type, MessageType::Request);
    }
}
