//! Bus-facing side of the configuration service: answers pull requests and
//! pushes update notifications.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{info, warn};

use alicia_bus::runtime::{PublishOpts, ServiceRuntime};
use alicia_bus::traits::handler;
use alicia_bus::{topics, Envelope, MessageType, QosLevel};
use alicia_core::{AliciaError, ErrorKind};

use crate::store::ConfigStore;

/// How often the history purge task runs (daily).
const HISTORY_PURGE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(24 * 3600);

pub struct ConfigService {
    runtime: Arc<ServiceRuntime>,
    store: Arc<RwLock<ConfigStore>>,
}

impl ConfigService {
    /// Wire the store to the bus: subscribe to the request topics and start
    /// the history purge task.
    pub async fn start(
        runtime: Arc<ServiceRuntime>,
        store: Arc<RwLock<ConfigStore>>,
    ) -> Result<Arc<Self>, AliciaError> {
        let service = Arc::new(Self {
            runtime: Arc::clone(&runtime),
            store: Arc::clone(&store),
        });

        let svc = Arc::clone(&service);
        runtime
            .subscribe(
                topics::CONFIG_REQUEST,
                QosLevel::AtLeastOnce,
                handler(move |_topic, envelope| {
                    let svc = Arc::clone(&svc);
                    async move { svc.handle_config_request(envelope).await }
                }),
            )
            .await
            .map_err(|e| AliciaError::Transport(e.to_string()))?;

        let svc = Arc::clone(&service);
        runtime
            .subscribe(
                topics::CONFIG_GLOBAL_REQUEST,
                QosLevel::AtLeastOnce,
                handler(move |_topic, envelope| {
                    let svc = Arc::clone(&svc);
                    async move { svc.handle_global_request(envelope).await }
                }),
            )
            .await
            .map_err(|e| AliciaError::Transport(e.to_string()))?;

        // Daily purge of history past the retention window.
        let purge_store = Arc::clone(&store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HISTORY_PURGE_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let purged = purge_store.write().await.purge_old_history();
                if purged > 0 {
                    info!(purged, "purged old config history entries");
                }
            }
        });

        Ok(service)
    }

    /// Answer a per-service pull on `alicia/config/{requester}/response`.
    async fn handle_config_request(&self, envelope: Envelope) -> Result<(), AliciaError> {
        let requester = requester_of(&envelope);
        let service = envelope
            .payload
            .get("service")
            .and_then(Value::as_str)
            .map(String::from);

        let Some(service) = service else {
            self.reply_error(&envelope, &requester, ErrorKind::Validation, "missing 'service'")
                .await;
            return Ok(());
        };

        let store = self.store.read().await;
        if !store.has_service(&service) {
            drop(store);
            self.reply_error(
                &envelope,
                &requester,
                ErrorKind::NotFound,
                format!("service '{service}' not found"),
            )
            .await;
            return Ok(());
        }

        let payload = serde_json::json!({
            "service": service,
            "config": store.merged(Some(&service)),
            "environment": store.environment(),
        });
        drop(store);

        let reply = envelope.reply(self.runtime.service_name(), payload);
        self.publish(&topics::config_response(&requester), &reply).await;
        Ok(())
    }

    /// Answer a global pull on `alicia/config/{requester}/global/response`.
    async fn handle_global_request(&self, envelope: Envelope) -> Result<(), AliciaError> {
        let requester = requester_of(&envelope);

        let store = self.store.read().await;
        let payload = serde_json::json!({
            "config": store.merged(None),
            "environment": store.environment(),
            "services": store.list_services(),
        });
        drop(store);

        let reply = envelope.reply(self.runtime.service_name(), payload);
        self.publish(&topics::config_global_response(&requester), &reply)
            .await;
        Ok(())
    }

    /// Push a service-scoped update to `alicia/config/{service}/update`.
    pub async fn notify_service_update(&self, service: &str, config: &Value) {
        let environment = self.store.read().await.environment().to_string();
        let result = self
            .runtime
            .publish(
                &topics::config_update(service),
                serde_json::json!({
                    "service": service,
                    "config": config,
                    "environment": environment,
                }),
                PublishOpts {
                    destination: service.to_string(),
                    message_type: MessageType::Event,
                    ..PublishOpts::default()
                },
            )
            .await;
        match result {
            Ok(_) => info!(service = %service, "config update published"),
            Err(e) => warn!(service = %service, error = %e, "config update publish failed"),
        }
    }

    /// Push a global update to `alicia/config/global/update`.
    pub async fn notify_global_update(&self) {
        let store = self.store.read().await;
        let payload = serde_json::json!({
            "config": store.merged(None),
            "environment": store.environment(),
        });
        drop(store);

        if let Err(e) = self
            .runtime
            .publish(topics::CONFIG_GLOBAL_UPDATE, payload, PublishOpts::default())
            .await
        {
            warn!(error = %e, "global config update publish failed");
        }
    }

    async fn reply_error(
        &self,
        envelope: &Envelope,
        requester: &str,
        kind: ErrorKind,
        message: impl Into<String>,
    ) {
        let reply = envelope.error_reply(self.runtime.service_name(), kind, message);
        self.publish(&topics::config_response(requester), &reply).await;
    }

    async fn publish(&self, topic: &str, envelope: &Envelope) {
        if let Err(e) = self
            .runtime
            .publish_envelope(topic, envelope, QosLevel::AtLeastOnce)
            .await
        {
            warn!(topic = %topic, error = %e, "config response publish failed");
            self.runtime.record_error();
        }
    }
}

/// Requests name their reply target explicitly; the envelope source is the
/// fallback.
fn requester_of(envelope: &Envelope) -> String {
    envelope
        .payload
        .get("requester")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(&envelope.source)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requester_falls_back_to_source() {
        let envelope = Envelope::new(
            "stt_service",
            "config_service",
            MessageType::Request,
            serde_json::json!({"service": "whisper"}),
        );
        assert_eq!(requester_of(&envelope), "stt_service");

        let envelope = Envelope::new(
            "stt_service",
            "config_service",
            MessageType::Request,
            serde_json::json!({"service": "whisper", "requester": "gateway"}),
        );
        assert_eq!(requester_of(&envelope), "gateway");
    }
}
