use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;
use tower_http::cors::CorsLayer;

use alicia_bus::runtime::ServiceRuntime;
use alicia_core::config::load_dotenv;
use alicia_core::BusConfig;
use alicia_stt::{create_engine, SttConfig, SttService};

async fn health(State(service): State<Arc<SttService>>) -> Json<Value> {
    let snapshot = service.runtime().health_snapshot();
    Json(serde_json::json!({
        "service": snapshot.service_name,
        "status": snapshot.status,
        "engine": service.engine_name(),
        "queue_size": service.queue_depth(),
        "uptime": snapshot.uptime_seconds,
        "mqtt_connected": snapshot.mqtt_connected,
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    load_dotenv();
    let config = BusConfig::from_env("stt_service", 8004);
    config.log_summary();

    let stt_config = SttConfig::from_env();
    let engine = create_engine(&stt_config)?;

    let bind_addr = config.http.bind_addr();
    let runtime = ServiceRuntime::connect(
        config,
        vec!["speech_to_text".into(), "voice_recognition".into()],
        "1.0.0",
    )
    .await?;

    let service = SttService::start(runtime.clone(), engine).await?;

    let router = Router::new()
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(service);
    alicia_bus::http::serve(router, &bind_addr).await?;
    runtime.shutdown().await;
    Ok(())
}
