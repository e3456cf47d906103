//! HTTP surface of the load balancer.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tower_http::cors::CorsLayer;

use alicia_bus::http::{ApiError, ApiResult};
use alicia_bus::{HealthMonitor, ServiceRegistry};
use alicia_core::{epoch_secs, AliciaError};

use crate::instance::Algorithm;
use crate::service::LoadBalancerService;

/// Router state: the balancer plus the cross-cutting service directory and
/// health monitor it feeds from.
#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<LoadBalancerService>,
    pub directory: ServiceRegistry,
    pub monitor: Arc<HealthMonitor>,
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/services", get(list_services))
        .route("/services/{name}", get(service_instances))
        .route("/route/{name}", post(route))
        .route("/complete/{name}/{instance}", post(complete))
        .route("/algorithm/{name}", post(set_algorithm))
        .route("/stats", get(stats))
        .route("/directory", get(directory))
        .route("/monitor", get(monitor))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    let snapshot = state.service.runtime().health_snapshot();
    Json(serde_json::json!({
        "service": snapshot.service_name,
        "status": snapshot.status,
        "uptime": snapshot.uptime_seconds,
        "messages_processed": snapshot.messages_processed,
        "errors": snapshot.errors,
        "mqtt_connected": snapshot.mqtt_connected,
    }))
}

async fn list_services(State(state): State<ApiState>) -> Json<Value> {
    let balancer = state.service.balancer();
    let mut services = serde_json::Map::new();
    for name in balancer.service_names().await {
        let instances = balancer.instances_of(&name).await.unwrap_or_default();
        let stats = balancer.stats_of(&name).await;
        services.insert(
            name,
            serde_json::json!({
                "instances": instances,
                "stats": stats,
            }),
        );
    }
    Json(serde_json::json!({"services": services}))
}

async fn service_instances(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let instances = state
        .service
        .balancer()
        .instances_of(&name)
        .await
        .ok_or_else(|| ApiError(AliciaError::NotFound(format!("service '{name}' not found"))))?;

    let healthy = instances
        .iter()
        .filter(|v| v.instance.health_status == crate::instance::HealthStatus::Healthy)
        .count();
    let total = instances.len();
    Ok(Json(serde_json::json!({
        "service_name": name,
        "instances": instances,
        "healthy_count": healthy,
        "total_count": total,
    })))
}

async fn route(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: axum::body::Bytes,
) -> ApiResult<Json<Value>> {
    // Request data is optional; an empty or non-JSON body routes fine.
    let request_data = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let decision = state.service.route_and_announce(&name, request_data).await?;
    Ok(Json(serde_json::json!({
        "service_name": decision.service_name,
        "instance_id": decision.instance_id,
        "instance_host": decision.instance_host,
        "instance_port": decision.instance_port,
        "algorithm": decision.algorithm,
    })))
}

#[derive(Deserialize)]
struct CompleteRequest {
    #[serde(default = "default_true")]
    success: bool,
}

fn default_true() -> bool {
    true
}

async fn complete(
    State(state): State<ApiState>,
    Path((name, instance)): Path<(String, String)>,
    body: axum::body::Bytes,
) -> ApiResult<Json<Value>> {
    // An empty body counts as success; failures must say so explicitly.
    let request: CompleteRequest =
        serde_json::from_slice(&body).unwrap_or(CompleteRequest { success: true });
    state
        .service
        .balancer()
        .complete(&name, &instance, request.success)
        .await?;
    Ok(Json(serde_json::json!({
        "service_name": name,
        "instance_id": instance,
        "recorded": if request.success { "success" } else { "failure" },
    })))
}

#[derive(Deserialize)]
struct AlgorithmRequest {
    algorithm: String,
}

async fn set_algorithm(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(request): Json<AlgorithmRequest>,
) -> ApiResult<Json<Value>> {
    let algorithm: Algorithm = request.algorithm.parse()?;
    state.service.balancer().set_algorithm(&name, algorithm).await;
    Ok(Json(serde_json::json!({
        "service_name": name,
        "algorithm": algorithm,
    })))
}

async fn stats(State(state): State<ApiState>) -> Json<Value> {
    let mut stats = state.service.balancer().overall_stats().await;
    if let Value::Object(map) = &mut stats {
        map.insert("timestamp".into(), serde_json::json!(epoch_secs()));
    }
    Json(stats)
}

async fn directory(State(state): State<ApiState>) -> Json<Value> {
    let services = state.directory.list().await;
    let count = services.len();
    Json(serde_json::json!({"services": services, "count": count}))
}

async fn monitor(State(state): State<ApiState>) -> Json<Value> {
    Json(serde_json::to_value(state.monitor.snapshot().await).unwrap_or(Value::Null))
}
