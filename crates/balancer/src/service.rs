//! Bus-facing side of the load balancer: discovery and health ingestion,
//! command handling, and periodic status publication.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use alicia_bus::runtime::{PublishOpts, ServiceRuntime};
use alicia_bus::traits::handler;
use alicia_bus::{topics, QosLevel};
use alicia_core::{env_u64, AliciaError};

use crate::instance::Algorithm;
use crate::registry::{LoadBalancer, RouteDecision};

pub struct LoadBalancerService {
    runtime: Arc<ServiceRuntime>,
    balancer: Arc<LoadBalancer>,
}

impl LoadBalancerService {
    /// Subscribe the registry to its event streams and start the status
    /// publication loop.
    pub async fn start(
        runtime: Arc<ServiceRuntime>,
        balancer: Arc<LoadBalancer>,
    ) -> Result<Arc<Self>, AliciaError> {
        let service = Arc::new(Self {
            runtime: Arc::clone(&runtime),
            balancer: Arc::clone(&balancer),
        });

        let lb = Arc::clone(&balancer);
        runtime
            .subscribe(
                topics::DISCOVERY_REGISTER,
                QosLevel::AtLeastOnce,
                handler(move |_topic, envelope| {
                    let lb = Arc::clone(&lb);
                    async move {
                        lb.apply_register(&envelope.payload).await;
                        Ok(())
                    }
                }),
            )
            .await
            .map_err(|e| AliciaError::Transport(e.to_string()))?;

        let lb = Arc::clone(&balancer);
        runtime
            .subscribe(
                topics::DISCOVERY_UNREGISTER,
                QosLevel::AtLeastOnce,
                handler(move |_topic, envelope| {
                    let lb = Arc::clone(&lb);
                    async move {
                        lb.apply_unregister(&envelope.payload).await;
                        Ok(())
                    }
                }),
            )
            .await
            .map_err(|e| AliciaError::Transport(e.to_string()))?;

        let lb = Arc::clone(&balancer);
        runtime
            .subscribe(
                topics::HEALTH_FILTER,
                QosLevel::AtMostOnce,
                handler(move |_topic, envelope| {
                    let lb = Arc::clone(&lb);
                    async move {
                        lb.apply_health(&envelope.payload).await;
                        Ok(())
                    }
                }),
            )
            .await
            .map_err(|e| AliciaError::Transport(e.to_string()))?;

        let svc = Arc::clone(&service);
        runtime
            .subscribe(
                topics::LB_COMMAND,
                QosLevel::AtLeastOnce,
                handler(move |_topic, envelope| {
                    let svc = Arc::clone(&svc);
                    async move {
                        svc.handle_command(&envelope.payload).await;
                        Ok(())
                    }
                }),
            )
            .await
            .map_err(|e| AliciaError::Transport(e.to_string()))?;

        tokio::spawn(status_loop(Arc::clone(&service)));
        Ok(service)
    }

    pub fn runtime(&self) -> &Arc<ServiceRuntime> {
        &self.runtime
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    /// Route and publish the (advisory) decision on the routing topic.
    pub async fn route_and_announce(
        &self,
        service_name: &str,
        request_data: Value,
    ) -> Result<RouteDecision, AliciaError> {
        let decision = self.balancer.route(service_name).await?;

        let payload = serde_json::json!({
            "service_name": decision.service_name,
            "instance_id": decision.instance_id,
            "instance_host": decision.instance_host,
            "instance_port": decision.instance_port,
            "algorithm": decision.algorithm,
            "request_data": request_data,
        });
        if let Err(e) = self
            .runtime
            .publish(&topics::lb_route(service_name), payload, PublishOpts::default())
            .await
        {
            warn!(service = %service_name, error = %e, "route decision publish failed");
        }

        Ok(decision)
    }

    /// `update_weights` / `set_algorithm` bus commands.
    async fn handle_command(&self, payload: &Value) {
        let Some(command) = payload.get("command").and_then(Value::as_str) else {
            return;
        };
        let Some(service_name) = payload.get("service_name").and_then(Value::as_str) else {
            return;
        };
        match command {
            "update_weights" => {
                if let Some(weights) = payload.get("weights") {
                    self.balancer.set_weights(service_name, weights).await;
                }
            }
            "set_algorithm" => {
                match payload
                    .get("algorithm")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .parse::<Algorithm>()
                {
                    Ok(algorithm) => self.balancer.set_algorithm(service_name, algorithm).await,
                    Err(e) => warn!(error = %e, "bad set_algorithm command"),
                }
            }
            other => warn!(command = %other, "unknown load balancer command"),
        }
    }
}

/// Publish aggregate status on `alicia/loadbalancer/status` each interval.
async fn status_loop(service: Arc<LoadBalancerService>) {
    let interval_secs = env_u64("HEALTH_CHECK_INTERVAL", 30);
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let stats = service.balancer.overall_stats().await;
        if let Err(e) = service
            .runtime
            .publish(topics::LB_STATUS, stats, PublishOpts::default())
            .await
        {
            warn!(error = %e, "status publish failed");
        }
    }
}
