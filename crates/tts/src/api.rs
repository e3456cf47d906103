//! HTTP surface of the TTS service.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tower_http::cors::CorsLayer;

use alicia_bus::http::ApiResult;

use crate::service::TtsService;

pub fn build_router(service: Arc<TtsService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/synthesize", post(synthesize))
        .route("/synthesize/base64", post(synthesize_base64))
        .route("/voices", get(voices))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

async fn health(State(service): State<Arc<TtsService>>) -> Json<Value> {
    let snapshot = service.runtime().health_snapshot();
    Json(serde_json::json!({
        "service": snapshot.service_name,
        "status": snapshot.status,
        "engine": service.engine_name(),
        "voice": service.active_voice(),
        "queue_size": service.queue_depth(),
        "uptime": snapshot.uptime_seconds,
        "mqtt_connected": snapshot.mqtt_connected,
    }))
}

#[derive(Deserialize)]
struct SynthesizeRequest {
    #[serde(default)]
    text: String,
    voice: Option<String>,
    session_id: Option<String>,
}

async fn synthesize(
    State(service): State<Arc<TtsService>>,
    Json(request): Json<SynthesizeRequest>,
) -> ApiResult<Json<Value>> {
    let result = service
        .submit(request.text, request.voice, request.session_id, false)
        .await?;
    Ok(Json(serde_json::to_value(result).unwrap_or(Value::Null)))
}

async fn synthesize_base64(
    State(service): State<Arc<TtsService>>,
    Json(request): Json<SynthesizeRequest>,
) -> ApiResult<Json<Value>> {
    let result = service
        .submit(request.text, request.voice, request.session_id, true)
        .await?;
    Ok(Json(serde_json::to_value(result).unwrap_or(Value::Null)))
}

async fn voices(State(service): State<Arc<TtsService>>) -> Json<Value> {
    Json(serde_json::json!({
        "voices": service.voices(),
        "active": service.active_voice(),
    }))
}
