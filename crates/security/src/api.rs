//! HTTP surface of the security gateway.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tower_http::cors::CorsLayer;

use alicia_bus::http::{ApiError, ApiResult};
use alicia_core::AliciaError;

use crate::gateway::{token_outcome_json, SecurityGateway};

pub fn build_router(gateway: Arc<SecurityGateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth/device", post(auth_device))
        .route("/auth/validate", post(auth_validate))
        .route("/encrypt", post(encrypt))
        .route("/decrypt", post(decrypt))
        .route("/certificates", get(certificates))
        .route("/events", get(events))
        .layer(CorsLayer::permissive())
        .with_state(gateway)
}

async fn health(State(gateway): State<Arc<SecurityGateway>>) -> Json<Value> {
    let snapshot = gateway.runtime().health_snapshot();
    Json(serde_json::json!({
        "service": snapshot.service_name,
        "status": snapshot.status,
        "active_tokens": gateway.active_token_count().await,
        "registered_certificates": gateway.certificate_ids().await.len(),
        "uptime": snapshot.uptime_seconds,
        "mqtt_connected": snapshot.mqtt_connected,
    }))
}

#[derive(Deserialize)]
struct AuthRequest {
    certificate: String,
}

async fn auth_device(
    State(gateway): State<Arc<SecurityGateway>>,
    Json(request): Json<AuthRequest>,
) -> ApiResult<Json<Value>> {
    let grant = gateway.authenticate_device(&request.certificate).await?;
    Ok(Json(serde_json::json!({
        "access_token": grant.access_token,
        "token_type": grant.token_type,
        "expires_in": grant.expires_in,
        "device_id": grant.device_id,
    })))
}

async fn auth_validate(
    State(gateway): State<Arc<SecurityGateway>>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError(AliciaError::Auth("missing bearer token".into())))?;

    let outcome = gateway.validate_token(token).await;
    Ok(Json(token_outcome_json(&outcome)))
}

async fn encrypt(
    State(gateway): State<Arc<SecurityGateway>>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Value>> {
    let encrypted = gateway.encrypt_payload(&payload).await?;
    Ok(Json(serde_json::json!({"encrypted_message": encrypted})))
}

#[derive(Deserialize)]
struct DecryptRequest {
    encrypted_message: String,
}

async fn decrypt(
    State(gateway): State<Arc<SecurityGateway>>,
    Json(request): Json<DecryptRequest>,
) -> ApiResult<Json<Value>> {
    let payload = gateway.decrypt_payload(&request.encrypted_message).await?;
    Ok(Json(serde_json::json!({"message": payload})))
}

async fn certificates(State(gateway): State<Arc<SecurityGateway>>) -> Json<Value> {
    Json(serde_json::json!({"certificates": gateway.certificate_ids().await}))
}

#[derive(Deserialize)]
struct EventsQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

async fn events(
    State(gateway): State<Arc<SecurityGateway>>,
    Query(query): Query<EventsQuery>,
) -> Json<Value> {
    Json(serde_json::json!({"events": gateway.recent_events(query.limit).await}))
}
