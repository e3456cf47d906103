//! Discovery: the live service directory.
//!
//! Consumes register/unregister announcements and maintains the service
//! inventory. Emits nothing — other components (load balancer, health
//! monitor) read from it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

use alicia_core::epoch_secs;

use crate::envelope::Envelope;

/// A service is `online` iff its record exists and its last announcement
/// is fresher than this (seconds).
pub const DEFAULT_STALENESS_THRESHOLD: f64 = 300.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Online,
    Offline,
    Degraded,
    Unknown,
}

/// Directory entry for one announced service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub version: String,
    pub capabilities: Vec<String>,
    /// Role → topic, e.g. control/status endpoints published by devices.
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
    pub status: ServiceStatus,
    pub last_seen: f64,
    #[serde(default)]
    pub metadata: Value,
}

struct Inner {
    services: HashMap<String, ServiceDescriptor>,
}

/// Thread-safe service directory.
#[derive(Clone)]
pub struct ServiceRegistry {
    inner: Arc<Mutex<Inner>>,
    staleness_threshold: f64,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::with_staleness(DEFAULT_STALENESS_THRESHOLD)
    }

    pub fn with_staleness(staleness_threshold: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                services: HashMap::new(),
            })),
            staleness_threshold,
        }
    }

    /// Apply a registration announcement. Re-registering refreshes the
    /// existing record (idempotent).
    pub async fn apply_register(&self, envelope: &Envelope) {
        let payload = &envelope.payload;
        let Some(name) = payload
            .get("service_name")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        else {
            debug!("registration without service_name ignored");
            return;
        };

        let descriptor = ServiceDescriptor {
            name: name.to_string(),
            version: payload
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            capabilities: payload
                .get("capabilities")
                .and_then(Value::as_array)
                .map(|caps| {
                    caps.iter()
                        .filter_map(|c| c.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default(),
            endpoints: payload
                .get("endpoints")
                .and_then(Value::as_object)
                .map(|map| {
                    map.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default(),
            status: ServiceStatus::Online,
            last_seen: epoch_secs(),
            metadata: payload.get("metadata").cloned().unwrap_or(Value::Null),
        };

        let mut inner = self.inner.lock().await;
        let existed = inner.services.insert(name.to_string(), descriptor).is_some();
        if existed {
            debug!(service = %name, "refreshed registration");
        } else {
            info!(service = %name, "service registered");
        }
    }

    /// Apply an unregister announcement (or a broker last-will).
    pub async fn apply_unregister(&self, envelope: &Envelope) {
        let Some(name) = envelope.payload.get("service_name").and_then(Value::as_str) else {
            return;
        };
        let mut inner = self.inner.lock().await;
        if inner.services.remove(name).is_some() {
            info!(service = %name, "service unregistered");
        }
    }

    /// Refresh `last_seen` from a heartbeat.
    pub async fn touch(&self, service_name: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(descriptor) = inner.services.get_mut(service_name) {
            descriptor.last_seen = epoch_secs();
            descriptor.status = ServiceStatus::Online;
        }
    }

    /// Mark services offline once their announcements go stale. Returns the
    /// names that were reaped this pass.
    pub async fn reap_stale(&self) -> Vec<String> {
        let now = epoch_secs();
        let mut reaped = Vec::new();
        let mut inner = self.inner.lock().await;
        for (name, descriptor) in inner.services.iter_mut() {
            if descriptor.status == ServiceStatus::Online
                && now - descriptor.last_seen > self.staleness_threshold
            {
                descriptor.status = ServiceStatus::Offline;
                reaped.push(name.clone());
            }
        }
        for name in &reaped {
            info!(service = %name, "service marked offline (stale)");
        }
        reaped
    }

    pub async fn get(&self, service_name: &str) -> Option<ServiceDescriptor> {
        self.inner.lock().await.services.get(service_name).cloned()
    }

    pub async fn list(&self) -> Vec<ServiceDescriptor> {
        let mut services: Vec<_> = self.inner.lock().await.services.values().cloned().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    /// Whether a service is currently online per the staleness rule.
    pub async fn is_online(&self, service_name: &str) -> bool {
        let now = epoch_secs();
        self.inner
            .lock()
            .await
            .services
            .get(service_name)
            .map(|d| d.status == ServiceStatus::Online && now - d.last_seen <= self.staleness_threshold)
            .unwrap_or(false)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.services.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.services.is_empty()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register_envelope(name: &str) -> Envelope {
        Envelope::event(
            name.to_string(),
            serde_json::json!({
                "service_name": name,
                "version": "1.0.0",
                "capabilities": ["text_to_speech"],
                "status": "online",
            }),
        )
    }

    fn unregister_envelope(name: &str) -> Envelope {
        Envelope::event(
            name.to_string(),
            serde_json::json!({"service_name": name, "status": "offline"}),
        )
    }

    #[tokio::test]
    async fn register_then_unregister_restores_membership() {
        let registry = ServiceRegistry::new();
        assert!(registry.is_empty().await);

        registry.apply_register(&register_envelope("tts_service")).await;
        assert_eq!(registry.len().await, 1);
        assert!(registry.is_online("tts_service").await);

        registry.apply_unregister(&unregister_envelope("tts_service")).await;
        assert!(registry.is_empty().await);

        // Repeating the unregister is a no-op.
        registry.apply_unregister(&unregister_envelope("tts_service")).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn reregistration_is_idempotent() {
        let registry = ServiceRegistry::new();
        registry.apply_register(&register_envelope("stt_service")).await;
        registry.apply_register(&register_envelope("stt_service")).await;
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn stale_services_are_reaped() {
        let registry = ServiceRegistry::with_staleness(0.0);
        registry.apply_register(&register_envelope("ai_service")).await;

        // Zero threshold: anything already announced is stale.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let reaped = registry.reap_stale().await;
        assert_eq!(reaped, vec!["ai_service".to_string()]);

        let descriptor = registry.get("ai_service").await.unwrap();
        assert_eq!(descriptor.status, ServiceStatus::Offline);
        assert!(!registry.is_online("ai_service").await);
    }

    #[tokio::test]
    async fn registration_without_name_is_ignored() {
        let registry = ServiceRegistry::new();
        let envelope = Envelope::event("x", serde_json::json!({"status": "online"}));
        registry.apply_register(&envelope).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn capabilities_are_recorded() {
        let registry = ServiceRegistry::new();
        registry.apply_register(&register_envelope("tts_service")).await;
        let descriptor = registry.get("tts_service").await.unwrap();
        assert_eq!(descriptor.capabilities, vec!["text_to_speech".to_string()]);
    }
}
