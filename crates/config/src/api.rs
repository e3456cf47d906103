//! HTTP surface of the configuration service.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::Value;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;

use alicia_bus::http::{ApiError, ApiResult};
use alicia_bus::runtime::ServiceRuntime;
use alicia_core::{epoch_secs, AliciaError};

use crate::service::ConfigService;
use crate::store::ConfigStore;

#[derive(Clone)]
pub struct ApiState {
    pub runtime: Arc<ServiceRuntime>,
    pub store: Arc<RwLock<ConfigStore>>,
    pub service: Arc<ConfigService>,
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/config", get(get_global_config))
        .route("/config/global", post(update_global_config))
        .route("/config/{service}", get(get_service_config).post(update_service_config))
        .route("/config/{service}/history", get(service_history))
        .route("/services", get(list_services))
        .route("/backup", post(create_backup))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    let snapshot = state.runtime.health_snapshot();
    let store = state.store.read().await;
    Json(serde_json::json!({
        "service": snapshot.service_name,
        "status": snapshot.status,
        "environment": store.environment(),
        "services_configured": store.list_services().len(),
        "uptime": snapshot.uptime_seconds,
        "mqtt_connected": snapshot.mqtt_connected,
    }))
}

async fn get_global_config(State(state): State<ApiState>) -> Json<Value> {
    let store = state.store.read().await;
    Json(serde_json::json!({
        "environment": store.environment(),
        "config": store.merged(None),
        "timestamp": epoch_secs(),
    }))
}

async fn get_service_config(
    State(state): State<ApiState>,
    Path(service): Path<String>,
) -> ApiResult<Json<Value>> {
    let store = state.store.read().await;
    if !store.has_service(&service) {
        return Err(ApiError(AliciaError::NotFound(format!(
            "service '{service}' not found"
        ))));
    }
    Ok(Json(serde_json::json!({
        "service": service,
        "config": store.merged(Some(&service)),
        "timestamp": epoch_secs(),
    })))
}

async fn update_service_config(
    State(state): State<ApiState>,
    Path(service): Path<String>,
    Json(config): Json<Value>,
) -> ApiResult<Json<Value>> {
    state.store.write().await.update_service(&service, config.clone())?;
    state.service.notify_service_update(&service, &config).await;
    Ok(Json(serde_json::json!({
        "service": service,
        "status": "updated",
        "timestamp": epoch_secs(),
    })))
}

async fn update_global_config(
    State(state): State<ApiState>,
    Json(config): Json<Value>,
) -> ApiResult<Json<Value>> {
    state.store.write().await.update_global(config)?;
    state.service.notify_global_update().await;
    Ok(Json(serde_json::json!({
        "status": "updated",
        "timestamp": epoch_secs(),
    })))
}

async fn list_services(State(state): State<ApiState>) -> Json<Value> {
    let store = state.store.read().await;
    let services = store.list_services();
    Json(serde_json::json!({
        "services": services,
        "count": services.len(),
        "timestamp": epoch_secs(),
    }))
}

async fn create_backup(State(state): State<ApiState>) -> ApiResult<Json<Value>> {
    let name = state.store.read().await.backup()?;
    Ok(Json(serde_json::json!({
        "backup_name": name,
        "timestamp": epoch_secs(),
    })))
}

async fn service_history(
    State(state): State<ApiState>,
    Path(service): Path<String>,
) -> Json<Value> {
    let history = state.store.read().await.history(Some(&service));
    let count = history.len();
    Json(serde_json::json!({
        "service": service,
        "history": history,
        "count": count,
    }))
}
