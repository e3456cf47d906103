//! The device manager service: registration intake, capability routing,
//! command dispatch, and response correlation over the bus.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use alicia_bus::runtime::ServiceRuntime;
use alicia_bus::traits::handler;
use alicia_bus::{topics, Envelope, MessageType, Priority, QosLevel};
use alicia_core::config::{env_u64, env_usize};
use alicia_core::AliciaError;

use crate::commands::{Command, CommandQueue, CommandTracker};
use crate::registry::DeviceRegistry;

/// How often the queue processor polls for work.
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct DeviceManager {
    runtime: Arc<ServiceRuntime>,
    registry: Mutex<DeviceRegistry>,
    queue: Mutex<CommandQueue>,
    tracker: Mutex<CommandTracker>,
    subscribed_capabilities: Mutex<HashSet<String>>,
    command_timeout: Duration,
    max_concurrent: usize,
    status_update_interval: Duration,
}

impl DeviceManager {
    /// Build the manager, subscribe its topics, and start the queue
    /// processor and liveness sweep.
    pub async fn start(runtime: Arc<ServiceRuntime>) -> Result<Arc<Self>, AliciaError> {
        let manager = Arc::new(Self {
            runtime: Arc::clone(&runtime),
            registry: Mutex::new(DeviceRegistry::new()),
            queue: Mutex::new(CommandQueue::new(env_usize("MAX_QUEUED_COMMANDS", 100))),
            tracker: Mutex::new(CommandTracker::new()),
            subscribed_capabilities: Mutex::new(HashSet::new()),
            command_timeout: Duration::from_secs(env_u64("COMMAND_TIMEOUT", 30)),
            max_concurrent: env_usize("MAX_CONCURRENT_COMMANDS", 10),
            status_update_interval: Duration::from_secs(env_u64("STATUS_UPDATE_INTERVAL", 60)),
        });

        let mgr = Arc::clone(&manager);
        runtime
            .subscribe(
                topics::DISCOVERY_REGISTER,
                QosLevel::AtLeastOnce,
                handler(move |_topic, envelope| {
                    let mgr = Arc::clone(&mgr);
                    async move {
                        handle_registration(&mgr, envelope).await;
                        Ok(())
                    }
                }),
            )
            .await
            .map_err(transport)?;

        let mgr = Arc::clone(&manager);
        runtime
            .subscribe(
                topics::DISCOVERY_UNREGISTER,
                QosLevel::AtLeastOnce,
                handler(move |_topic, envelope| {
                    let mgr = Arc::clone(&mgr);
                    async move {
                        if let Some(device_id) =
                            envelope.payload.get("device_id").and_then(Value::as_str)
                        {
                            mgr.registry.lock().await.unregister(device_id);
                        }
                        Ok(())
                    }
                }),
            )
            .await
            .map_err(transport)?;

        let mgr = Arc::clone(&manager);
        runtime
            .subscribe(
                topics::DEVICE_STATUS_FILTER,
                QosLevel::AtLeastOnce,
                handler(move |topic, envelope| {
                    let mgr = Arc::clone(&mgr);
                    async move {
                        if let Some(device_id) = topics::device_id_from_topic(&topic) {
                            mgr.registry
                                .lock()
                                .await
                                .update_status(device_id, &envelope.payload);
                        }
                        Ok(())
                    }
                }),
            )
            .await
            .map_err(transport)?;

        let mgr = Arc::clone(&manager);
        runtime
            .subscribe(
                topics::DEVICE_RESPONSE_FILTER,
                QosLevel::AtLeastOnce,
                handler(move |topic, envelope| {
                    let mgr = Arc::clone(&mgr);
                    async move {
                        mgr.handle_response(&topic, envelope).await;
                        Ok(())
                    }
                }),
            )
            .await
            .map_err(transport)?;

        tokio::spawn(queue_processor(Arc::clone(&manager)));
        tokio::spawn(liveness_sweep(Arc::clone(&manager)));

        Ok(manager)
    }

    pub fn runtime(&self) -> &Arc<ServiceRuntime> {
        &self.runtime
    }

    // ── Public operations ────────────────────────────────────────────

    /// Queue a command for one or more devices. Returns its `command_id`.
    pub async fn send_command(
        &self,
        device_ids: Vec<String>,
        command: String,
        parameters: Value,
        priority: Priority,
    ) -> Result<String, AliciaError> {
        if device_ids.is_empty() {
            return Err(AliciaError::Validation("device_ids are required".into()));
        }
        if command.is_empty() {
            return Err(AliciaError::Validation("command is required".into()));
        }
        self.enqueue(Command::new(device_ids, command, parameters, priority))
            .await
    }

    async fn enqueue(&self, command: Command) -> Result<String, AliciaError> {
        let command_id = command.command_id.clone();
        self.queue.lock().await.push(command)?;
        debug!(command = %command_id, "command queued");
        Ok(command_id)
    }

    pub async fn device_views(&self) -> Vec<Value> {
        let registry = self.registry.lock().await;
        registry
            .list()
            .into_iter()
            .map(|d| {
                serde_json::json!({
                    "device_id": d.device_id,
                    "device_type": d.device_type,
                    "status": d.status,
                    "capabilities": d.capability_names(),
                    "last_seen": d.last_seen,
                    "metadata": d.metadata,
                })
            })
            .collect()
    }

    pub async fn device_detail(&self, device_id: &str) -> Option<Value> {
        let registry = self.registry.lock().await;
        registry.get(device_id).map(|d| {
            serde_json::json!({
                "device_id": d.device_id,
                "device_type": d.device_type,
                "status": d.status,
                "capabilities": d.capabilities,
                "endpoints": d.endpoints,
                "metadata": d.metadata,
                "last_seen": d.last_seen,
                "last_status": d.last_status,
                "registered_at": d.registered_at,
            })
        })
    }

    pub async fn capability_table(&self) -> Value {
        let table = self.registry.lock().await.capability_table();
        serde_json::to_value(table).unwrap_or(Value::Null)
    }

    pub async fn command_view(&self, command_id: &str) -> Option<Value> {
        let tracker = self.tracker.lock().await;
        tracker
            .get(command_id)
            .and_then(|c| serde_json::to_value(c).ok())
    }

    pub async fn queue_depth(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn active_commands(&self) -> usize {
        self.tracker.lock().await.active_count()
    }

    pub async fn device_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    // ── Bus handlers ─────────────────────────────────────────────────

    /// Capability-addressed call: the target set is the capability's member
    /// set at enqueue time.
    async fn handle_capability_call(&self, topic: &str, envelope: Envelope) {
        let Some(capability) = topics::capability_from_topic(topic) else {
            return;
        };
        let members = self.registry.lock().await.members_of(capability);

        let payload = &envelope.payload;
        let command = payload
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or(capability)
            .to_string();
        let parameters = payload.get("parameters").cloned().unwrap_or(Value::Null);
        let priority = match payload.get("priority").and_then(Value::as_str) {
            Some("high") => Priority::High,
            Some("low") => Priority::Low,
            _ => Priority::Normal,
        };

        info!(
            capability = %capability,
            devices = members.len(),
            command = %command,
            "capability call"
        );

        // Queue overflow on the bus path: drop with a logged warning.
        let cmd = Command::new(members, command, parameters, priority);
        if let Err(e) = self.enqueue(cmd).await {
            warn!(capability = %capability, error = %e, "capability command dropped");
            self.runtime.record_error();
        }
    }

    /// Correlate a device's command response.
    async fn handle_response(&self, topic: &str, envelope: Envelope) {
        let Some(device_id) = topics::device_id_from_topic(topic) else {
            return;
        };
        let Some(command_id) = envelope
            .payload
            .get("command_id")
            .and_then(Value::as_str)
            .map(String::from)
        else {
            debug!(device = %device_id, "response without command_id ignored");
            return;
        };

        self.tracker
            .lock()
            .await
            .record_response(&command_id, device_id, envelope.payload);
    }

}

fn transport(e: alicia_bus::BusError) -> AliciaError {
    AliciaError::Transport(e.to_string())
}

/// Device registration via the discovery topic. Service registrations
/// (no `device_id`) are not ours to track.
async fn handle_registration(manager: &Arc<DeviceManager>, envelope: Envelope) {
    if envelope.payload.get("device_id").is_none() {
        return;
    }
    let new_capabilities = manager.registry.lock().await.register(&envelope.payload);

    // Capability topics are flat (`capability:<name>`), so each new
    // capability needs its own subscription.
    for capability in new_capabilities {
        let mut subscribed = manager.subscribed_capabilities.lock().await;
        if !subscribed.insert(capability.clone()) {
            continue;
        }
        drop(subscribed);

        let mgr = Arc::clone(manager);
        let result = manager
            .runtime
            .subscribe(
                &topics::capability(&capability),
                QosLevel::AtLeastOnce,
                handler(move |topic, envelope| {
                    let mgr = Arc::clone(&mgr);
                    async move {
                        mgr.handle_capability_call(&topic, envelope).await;
                        Ok(())
                    }
                }),
            )
            .await;
        if let Err(e) = result {
            warn!(capability = %capability, error = %e, "capability subscribe failed");
            manager.subscribed_capabilities.lock().await.remove(&capability);
        }
    }
}

/// Publish a queued command to each target device's control endpoint and
/// start tracking it.
async fn dispatch(manager: &Arc<DeviceManager>, command: Command) {
    // Collect publish work under the registry lock, publish after.
    let mut outgoing: Vec<(String, String, Envelope)> = Vec::new();
    {
        let registry = manager.registry.lock().await;
        for device_id in &command.device_ids {
            let Some(device) = registry.get(device_id) else {
                warn!(device = %device_id, command = %command.command_id, "target device not found");
                continue;
            };
            let Some(control_topic) = device.control_topic() else {
                warn!(device = %device_id, "device has no control endpoint");
                continue;
            };

            let mut envelope = Envelope::new(
                manager.runtime.service_name(),
                device_id.clone(),
                MessageType::Command,
                serde_json::json!({
                    "command_id": command.command_id,
                    "command": command.command,
                    "parameters": command.parameters,
                }),
            )
            .with_priority(command.priority);
            // Per-device correlation id.
            envelope.message_id = format!(
                "{}_{}_{}",
                command.command_id,
                device_id,
                &uuid::Uuid::new_v4().simple().to_string()[..8]
            );

            outgoing.push((device_id.clone(), control_topic.to_string(), envelope));
        }
    }

    let mut dispatched = HashSet::new();
    for (device_id, topic, envelope) in outgoing {
        match manager
            .runtime
            .publish_envelope(&topic, &envelope, QosLevel::AtLeastOnce)
            .await
        {
            Ok(()) => {
                dispatched.insert(device_id);
            }
            Err(e) => {
                warn!(device = %device_id, error = %e, "command publish failed");
                manager.runtime.record_error();
            }
        }
    }

    let command_id = command.command_id.clone();
    let executing = !dispatched.is_empty();
    manager.tracker.lock().await.start(command, dispatched);

    if executing {
        let mgr = Arc::clone(manager);
        let timeout = manager.command_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            mgr.tracker.lock().await.timeout(&command_id);
        });
    }
}

/// Drain the queue, keeping at most `max_concurrent` commands in flight.
async fn queue_processor(manager: Arc<DeviceManager>) {
    loop {
        let next = {
            if manager.tracker.lock().await.active_count() >= manager.max_concurrent {
                None
            } else {
                manager.queue.lock().await.pop()
            }
        };

        match next {
            Some(command) => dispatch(&manager, command).await,
            None => tokio::time::sleep(QUEUE_POLL_INTERVAL).await,
        }
    }
}

/// Periodic device liveness sweep.
async fn liveness_sweep(manager: Arc<DeviceManager>) {
    let mut ticker = tokio::time::interval(manager.status_update_interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let swept = manager.registry.lock().await.sweep_offline();
        if !swept.is_empty() {
            info!(count = swept.len(), "devices marked offline");
        }
    }
}
