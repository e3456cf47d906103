//! HTTP surface of the device manager.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tower_http::cors::CorsLayer;

use alicia_bus::http::{ApiError, ApiResult};
use alicia_bus::Priority;
use alicia_core::AliciaError;

use crate::service::DeviceManager;

pub fn build_router(manager: Arc<DeviceManager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/command", post(send_command))
        .route("/devices", get(list_devices))
        .route("/devices/{id}", get(get_device))
        .route("/capabilities", get(list_capabilities))
        .route("/commands/{id}", get(get_command))
        .layer(CorsLayer::permissive())
        .with_state(manager)
}

async fn health(State(manager): State<Arc<DeviceManager>>) -> Json<Value> {
    let snapshot = manager.runtime().health_snapshot();
    Json(serde_json::json!({
        "service": snapshot.service_name,
        "status": snapshot.status,
        "managed_devices": manager.device_count().await,
        "active_commands": manager.active_commands().await,
        "pending_commands": manager.queue_depth().await,
        "uptime": snapshot.uptime_seconds,
        "mqtt_connected": snapshot.mqtt_connected,
    }))
}

#[derive(Deserialize)]
struct CommandRequest {
    #[serde(default)]
    device_ids: Vec<String>,
    command: Option<String>,
    #[serde(default)]
    parameters: Value,
    #[serde(default)]
    priority: Option<String>,
}

async fn send_command(
    State(manager): State<Arc<DeviceManager>>,
    Json(request): Json<CommandRequest>,
) -> ApiResult<Json<Value>> {
    let command = request
        .command
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError(AliciaError::Validation("command is required".into())))?;
    let priority = match request.priority.as_deref() {
        Some("high") => Priority::High,
        Some("low") => Priority::Low,
        _ => Priority::Normal,
    };

    let command_id = manager
        .send_command(
            request.device_ids.clone(),
            command.clone(),
            request.parameters,
            priority,
        )
        .await?;

    Ok(Json(serde_json::json!({
        "command_id": command_id,
        "status": "queued",
        "device_ids": request.device_ids,
        "command": command,
    })))
}

async fn list_devices(State(manager): State<Arc<DeviceManager>>) -> Json<Value> {
    let devices = manager.device_views().await;
    let count = devices.len();
    Json(serde_json::json!({"devices": devices, "count": count}))
}

async fn get_device(
    State(manager): State<Arc<DeviceManager>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    manager
        .device_detail(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError(AliciaError::NotFound(format!("device '{id}' not found"))))
}

async fn list_capabilities(State(manager): State<Arc<DeviceManager>>) -> Json<Value> {
    Json(serde_json::json!({"capabilities": manager.capability_table().await}))
}

async fn get_command(
    State(manager): State<Arc<DeviceManager>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    manager
        .command_view(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError(AliciaError::NotFound(format!("command '{id}' not found"))))
}
