//! Instance registry and selection core.
//!
//! Fed by discovery register/unregister events and health heartbeats;
//! consulted by the routing API. All state lives behind one mutex, and no
//! network work ever happens while it is held.

use std::collections::HashMap;

use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use alicia_core::{epoch_secs, AliciaError};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::instance::{Algorithm, HealthStatus, ServiceInstance};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_TIMEOUT: f64 = 60.0;

/// The routing result handed to callers (and published on the decision
/// topic). Advisory: the balancer does not proxy traffic.
#[derive(Debug, Clone, Serialize)]
pub struct RouteDecision {
    pub service_name: String,
    pub instance_id: String,
    pub instance_host: String,
    pub instance_port: u16,
    pub algorithm: Algorithm,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub total_requests: u64,
    pub active_connections: u32,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    pub average_response_time: f64,
    pub algorithm: Algorithm,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    #[serde(flatten)]
    pub instance: ServiceInstance,
    pub breaker: CircuitBreaker,
}

struct InstanceEntry {
    instance: ServiceInstance,
    breaker: CircuitBreaker,
}

struct ServiceEntry {
    instances: Vec<InstanceEntry>,
    cursor: usize,
    algorithm: Option<Algorithm>,
}

struct Inner {
    services: HashMap<String, ServiceEntry>,
}

pub struct LoadBalancer {
    inner: Mutex<Inner>,
    default_algorithm: Algorithm,
    failure_threshold: u32,
    recovery_timeout: f64,
}

impl LoadBalancer {
    pub fn new(failure_threshold: u32, recovery_timeout: f64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                services: HashMap::new(),
            }),
            default_algorithm: Algorithm::RoundRobin,
            failure_threshold,
            recovery_timeout,
        }
    }

    // ── Discovery input ──────────────────────────────────────────────

    /// Register an instance from a discovery announcement. Re-registering
    /// the same `instance_id` refreshes its address.
    pub async fn apply_register(&self, payload: &Value) {
        let Some(service_name) = payload.get("service_name").and_then(Value::as_str) else {
            return;
        };
        let instance_id = payload
            .get("instance_id")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| format!("{}_{}", service_name, epoch_secs() as u64));
        let host = payload
            .get("host")
            .and_then(Value::as_str)
            .unwrap_or("localhost");
        let port = payload.get("port").and_then(Value::as_u64).unwrap_or(8000) as u16;

        let mut inner = self.inner.lock().await;
        let entry = inner
            .services
            .entry(service_name.to_string())
            .or_insert_with(|| ServiceEntry {
                instances: Vec::new(),
                cursor: 0,
                algorithm: None,
            });

        if let Some(existing) = entry
            .instances
            .iter_mut()
            .find(|e| e.instance.instance_id == instance_id)
        {
            existing.instance.host = host.to_string();
            existing.instance.port = port;
            existing.instance.last_health_check = epoch_secs();
        } else {
            entry.instances.push(InstanceEntry {
                instance: ServiceInstance::new(&instance_id, service_name, host, port, epoch_secs()),
                breaker: CircuitBreaker::new(),
            });
            info!(service = %service_name, instance = %instance_id, "instance registered");
        }
    }

    /// Remove an instance; drops the service entry once empty.
    pub async fn apply_unregister(&self, payload: &Value) {
        let Some(service_name) = payload.get("service_name").and_then(Value::as_str) else {
            return;
        };
        let instance_id = payload.get("instance_id").and_then(Value::as_str);

        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.services.get_mut(service_name) else {
            return;
        };
        match instance_id {
            Some(id) => entry.instances.retain(|e| e.instance.instance_id != id),
            // Unregister without an instance id drops every instance.
            None => entry.instances.clear(),
        }
        if entry.instances.is_empty() {
            inner.services.remove(service_name);
            info!(service = %service_name, "service removed (no instances)");
        }
    }

    /// Update instance health from a heartbeat payload.
    pub async fn apply_health(&self, payload: &Value) {
        let Some(service_name) = payload.get("service_name").and_then(Value::as_str) else {
            return;
        };
        let instance_id = payload.get("instance_id").and_then(Value::as_str);
        let status = match payload.get("status").and_then(Value::as_str) {
            Some("healthy") => HealthStatus::Healthy,
            Some("unhealthy") => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        };
        let response_time = payload
            .get("response_time_ms")
            .and_then(Value::as_f64)
            .or_else(|| payload.get("response_time").and_then(Value::as_f64));

        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.services.get_mut(service_name) else {
            return;
        };
        let now = epoch_secs();
        for e in entry.instances.iter_mut() {
            if instance_id.map(|id| e.instance.instance_id == id).unwrap_or(true) {
                // An open breaker owns the instance's health until it probes.
                if e.breaker.state == BreakerState::Closed {
                    e.instance.health_status = status;
                }
                e.instance.last_health_check = now;
                if let Some(rt) = response_time {
                    e.instance.response_time_ms = rt;
                }
            }
        }
    }

    // ── Routing ──────────────────────────────────────────────────────

    /// Pick an instance for a request. On success the instance's
    /// `active_connections` and `total_requests` move; the caller MUST
    /// report completion via [`complete`](Self::complete).
    pub async fn route(&self, service_name: &str) -> Result<RouteDecision, AliciaError> {
        let now = epoch_secs();
        let mut inner = self.inner.lock().await;
        let default_algorithm = self.default_algorithm;
        let entry = inner
            .services
            .get_mut(service_name)
            .ok_or_else(|| AliciaError::NotFound(format!("service '{service_name}' not found")))?;

        // Open breakers whose recovery deadline has passed get one probe.
        for e in entry.instances.iter_mut() {
            if e.breaker.try_half_open(now) {
                e.instance.health_status = HealthStatus::Unknown;
                info!(instance = %e.instance.instance_id, "circuit breaker half-open");
            }
        }

        let selectable: Vec<usize> = entry
            .instances
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.breaker.allows_traffic()
                    && (e.instance.health_status == HealthStatus::Healthy
                        || e.breaker.state == BreakerState::HalfOpen)
            })
            .map(|(i, _)| i)
            .collect();

        if selectable.is_empty() {
            return Err(AliciaError::Overload("no_healthy_instances".into()));
        }

        let algorithm = entry.algorithm.unwrap_or(default_algorithm);
        let chosen = match algorithm {
            Algorithm::RoundRobin => {
                let idx = selectable[entry.cursor % selectable.len()];
                entry.cursor = (entry.cursor + 1) % selectable.len();
                idx
            }
            Algorithm::LeastConnections => *selectable
                .iter()
                .min_by(|&&a, &&b| {
                    let ia = &entry.instances[a].instance;
                    let ib = &entry.instances[b].instance;
                    ia.active_connections
                        .cmp(&ib.active_connections)
                        .then(ia.instance_id.cmp(&ib.instance_id))
                })
                .unwrap_or(&selectable[0]),
            Algorithm::WeightedRoundRobin => {
                let total_weight: u32 = selectable
                    .iter()
                    .map(|&i| entry.instances[i].instance.weight.max(1))
                    .sum();
                let target = ((entry.cursor as u32 + 1) % total_weight) as usize;
                entry.cursor = target;
                let mut cumulative = 0usize;
                let mut pick = selectable[0];
                for &i in &selectable {
                    cumulative += entry.instances[i].instance.weight.max(1) as usize;
                    if cumulative > target {
                        pick = i;
                        break;
                    }
                }
                pick
            }
            Algorithm::Random => selectable[rand::thread_rng().gen_range(0..selectable.len())],
        };

        let instance = &mut entry.instances[chosen].instance;
        instance.active_connections += 1;
        instance.total_requests += 1;

        Ok(RouteDecision {
            service_name: service_name.to_string(),
            instance_id: instance.instance_id.clone(),
            instance_host: instance.host.clone(),
            instance_port: instance.port,
            algorithm,
        })
    }

    /// Close the routing contract: decrement `active_connections` and feed
    /// the circuit breaker with the outcome.
    pub async fn complete(
        &self,
        service_name: &str,
        instance_id: &str,
        success: bool,
    ) -> Result<(), AliciaError> {
        let now = epoch_secs();
        let mut inner = self.inner.lock().await;
        let entry = inner
            .services
            .get_mut(service_name)
            .ok_or_else(|| AliciaError::NotFound(format!("service '{service_name}' not found")))?;
        let e = entry
            .instances
            .iter_mut()
            .find(|e| e.instance.instance_id == instance_id)
            .ok_or_else(|| {
                AliciaError::NotFound(format!("instance '{instance_id}' not found"))
            })?;

        e.instance.active_connections = e.instance.active_connections.saturating_sub(1);

        if success {
            if e.breaker.record_success() {
                e.instance.health_status = HealthStatus::Healthy;
                info!(instance = %instance_id, "circuit breaker closed");
            }
        } else {
            e.instance.failed_requests += 1;
            if e.breaker
                .record_failure(now, self.failure_threshold, self.recovery_timeout)
            {
                e.instance.health_status = HealthStatus::Unhealthy;
                warn!(instance = %instance_id, "circuit breaker opened");
            }
        }
        Ok(())
    }

    /// Set the selection algorithm for one service.
    pub async fn set_algorithm(&self, service_name: &str, algorithm: Algorithm) {
        let mut inner = self.inner.lock().await;
        inner
            .services
            .entry(service_name.to_string())
            .or_insert_with(|| ServiceEntry {
                instances: Vec::new(),
                cursor: 0,
                algorithm: None,
            })
            .algorithm = Some(algorithm);
    }

    /// Update instance weights (`update_weights` bus command). Weights are
    /// clamped to ≥ 1.
    pub async fn set_weights(&self, service_name: &str, weights: &Value) {
        let Some(weights) = weights.as_object() else {
            return;
        };
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.services.get_mut(service_name) else {
            return;
        };
        for e in entry.instances.iter_mut() {
            if let Some(w) = weights.get(&e.instance.instance_id).and_then(Value::as_u64) {
                e.instance.weight = (w as u32).max(1);
            }
        }
    }

    // ── Views ────────────────────────────────────────────────────────

    pub async fn service_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.lock().await.services.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn instances_of(&self, service_name: &str) -> Option<Vec<InstanceView>> {
        let inner = self.inner.lock().await;
        inner.services.get(service_name).map(|entry| {
            entry
                .instances
                .iter()
                .map(|e| InstanceView {
                    instance: e.instance.clone(),
                    breaker: e.breaker.clone(),
                })
                .collect()
        })
    }

    pub async fn stats_of(&self, service_name: &str) -> Option<ServiceStats> {
        let inner = self.inner.lock().await;
        let default_algorithm = self.default_algorithm;
        inner.services.get(service_name).map(|entry| {
            let instances: Vec<_> = entry.instances.iter().map(|e| &e.instance).collect();
            let count = instances.len().max(1);
            ServiceStats {
                total_requests: instances.iter().map(|i| i.total_requests).sum(),
                active_connections: instances.iter().map(|i| i.active_connections).sum(),
                healthy_instances: instances
                    .iter()
                    .filter(|i| i.health_status == HealthStatus::Healthy)
                    .count(),
                unhealthy_instances: instances
                    .iter()
                    .filter(|i| i.health_status == HealthStatus::Unhealthy)
                    .count(),
                average_response_time: instances.iter().map(|i| i.response_time_ms).sum::<f64>()
                    / count as f64,
                algorithm: entry.algorithm.unwrap_or(default_algorithm),
            }
        })
    }

    /// Aggregate totals for `GET /stats` and the status publication.
    pub async fn overall_stats(&self) -> Value {
        let inner = self.inner.lock().await;
        let mut total_instances = 0usize;
        let mut total_requests = 0u64;
        let mut active_connections = 0u32;
        let mut healthy = 0usize;
        let mut unhealthy = 0usize;
        for entry in inner.services.values() {
            for e in &entry.instances {
                total_instances += 1;
                total_requests += e.instance.total_requests;
                active_connections += e.instance.active_connections;
                match e.instance.health_status {
                    HealthStatus::Healthy => healthy += 1,
                    HealthStatus::Unhealthy => unhealthy += 1,
                    HealthStatus::Unknown => {}
                }
            }
        }
        serde_json::json!({
            "total_services": inner.services.len(),
            "total_instances": total_instances,
            "total_requests": total_requests,
            "active_connections": active_connections,
            "healthy_instances": healthy,
            "unhealthy_instances": unhealthy,
            "timestamp": epoch_secs(),
        })
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn register(service: &str, instance: &str) -> Value {
        json!({
            "service_name": service,
            "instance_id": instance,
            "host": format!("{instance}.local"),
            "port": 8000,
        })
    }

    async fn balancer_with_instances(instances: &[&str]) -> LoadBalancer {
        let lb = LoadBalancer::default();
        for id in instances {
            lb.apply_register(&register("s", id)).await;
        }
        lb
    }

    #[tokio::test]
    async fn round_robin_cycles_in_registration_order() {
        let lb = balancer_with_instances(&["a", "b", "c"]).await;
        let mut picks = Vec::new();
        for _ in 0..6 {
            let decision = lb.route("s").await.unwrap();
            picks.push(decision.instance_id.clone());
            lb.complete("s", &decision.instance_id, true).await.unwrap();
        }
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn round_robin_uniform_distribution() {
        let lb = balancer_with_instances(&["a", "b", "c"]).await;
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..12 {
            let decision = lb.route("s").await.unwrap();
            *counts.entry(decision.instance_id.clone()).or_default() += 1;
            lb.complete("s", &decision.instance_id, true).await.unwrap();
        }
        assert_eq!(counts["a"], 4);
        assert_eq!(counts["b"], 4);
        assert_eq!(counts["c"], 4);
    }

    #[tokio::test]
    async fn least_connections_prefers_idle_tie_breaks_on_id() {
        let lb = balancer_with_instances(&["b", "a"]).await;
        lb.set_algorithm("s", Algorithm::LeastConnections).await;

        // Tie: both idle → lowest instance_id wins.
        let first = lb.route("s").await.unwrap();
        assert_eq!(first.instance_id, "a");

        // "a" now has one active connection → "b" is picked.
        let second = lb.route("s").await.unwrap();
        assert_eq!(second.instance_id, "b");
    }

    #[tokio::test]
    async fn weighted_distribution_follows_weights() {
        let lb = balancer_with_instances(&["a", "b"]).await;
        lb.set_algorithm("s", Algorithm::WeightedRoundRobin).await;
        lb.set_weights("s", &json!({"a": 3, "b": 1})).await;

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..40 {
            let decision = lb.route("s").await.unwrap();
            *counts.entry(decision.instance_id.clone()).or_default() += 1;
            lb.complete("s", &decision.instance_id, true).await.unwrap();
        }
        assert_eq!(counts["a"], 30);
        assert_eq!(counts["b"], 10);
    }

    #[tokio::test]
    async fn unknown_service_is_not_found() {
        let lb = LoadBalancer::default();
        assert!(matches!(
            lb.route("missing").await,
            Err(AliciaError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn empty_healthy_set_moves_no_counters() {
        let lb = balancer_with_instances(&["a"]).await;
        lb.apply_health(&json!({
            "service_name": "s",
            "instance_id": "a",
            "status": "unhealthy",
        }))
        .await;

        let err = lb.route("s").await.unwrap_err();
        assert!(matches!(err, AliciaError::Overload(_)));
        assert!(err.to_string().contains("no_healthy_instances"));

        let views = lb.instances_of("s").await.unwrap();
        assert_eq!(views[0].instance.total_requests, 0);
        assert_eq!(views[0].instance.active_connections, 0);
    }

    #[tokio::test]
    async fn breaker_excludes_instance_then_probes_and_recovers() {
        // Zero recovery timeout so the next route immediately probes.
        let lb = LoadBalancer::new(5, 0.0);
        lb.apply_register(&register("s", "x")).await;
        lb.apply_register(&register("s", "y")).await;

        // Six failures on x: breaker opens, x goes unhealthy.
        for _ in 0..6 {
            let decision = loop {
                let d = lb.route("s").await.unwrap();
                if d.instance_id == "x" {
                    break d;
                }
                lb.complete("s", &d.instance_id, true).await.unwrap();
            };
            let _ = lb.complete("s", &decision.instance_id, false).await;
        }

        let views = lb.instances_of("s").await.unwrap();
        let x = views.iter().find(|v| v.instance.instance_id == "x").unwrap();
        assert_eq!(x.instance.health_status, HealthStatus::Unhealthy);

        // With recovery elapsed (0 s), a later route may probe x half-open.
        let mut probed = false;
        for _ in 0..4 {
            let decision = lb.route("s").await.unwrap();
            if decision.instance_id == "x" {
                probed = true;
                lb.complete("s", "x", true).await.unwrap();
                break;
            }
            lb.complete("s", &decision.instance_id, true).await.unwrap();
        }
        assert!(probed, "half-open instance should re-enter selection");

        let views = lb.instances_of("s").await.unwrap();
        let x = views.iter().find(|v| v.instance.instance_id == "x").unwrap();
        assert_eq!(x.breaker.state, BreakerState::Closed);
        assert_eq!(x.instance.health_status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn unregister_returns_registry_to_prior_membership() {
        let lb = balancer_with_instances(&["a"]).await;
        assert_eq!(lb.service_names().await, vec!["s".to_string()]);

        lb.apply_unregister(&json!({"service_name": "s", "instance_id": "a"}))
            .await;
        assert!(lb.service_names().await.is_empty());

        // Idempotent when repeated.
        lb.apply_unregister(&json!({"service_name": "s", "instance_id": "a"}))
            .await;
        assert!(lb.service_names().await.is_empty());
    }

    #[tokio::test]
    async fn reregistration_refreshes_instead_of_duplicating() {
        let lb = balancer_with_instances(&["a"]).await;
        lb.apply_register(&json!({
            "service_name": "s",
            "instance_id": "a",
            "host": "new-host",
            "port": 9000,
        }))
        .await;

        let views = lb.instances_of("s").await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].instance.host, "new-host");
        assert_eq!(views[0].instance.port, 9000);
    }

    #[tokio::test]
    async fn health_message_updates_status_and_latency() {
        let lb = balancer_with_instances(&["a"]).await;
        lb.apply_health(&json!({
            "service_name": "s",
            "instance_id": "a",
            "status": "healthy",
            "response_time_ms": 12.5,
        }))
        .await;

        let views = lb.instances_of("s").await.unwrap();
        assert_eq!(views[0].instance.response_time_ms, 12.5);

        let stats = lb.stats_of("s").await.unwrap();
        assert_eq!(stats.healthy_instances, 1);
        assert_eq!(stats.average_response_time, 12.5);
    }
}
