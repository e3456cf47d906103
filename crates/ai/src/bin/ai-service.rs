use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;
use tower_http::cors::CorsLayer;

use alicia_ai::{AiConfig, AiService, OpenAiBackend};
use alicia_bus::runtime::ServiceRuntime;
use alicia_core::config::load_dotenv;
use alicia_core::BusConfig;
use alicia_voice::RateLimiter;

async fn health(State(service): State<Arc<AiService>>) -> Json<Value> {
    let snapshot = service.runtime().health_snapshot();
    Json(serde_json::json!({
        "service": snapshot.service_name,
        "status": snapshot.status,
        "model": service.model(),
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
    let config = BusConfig::from_env("ai_service", 8005);
    config.log_summary();

    let ai_config = AiConfig::from_env();
    let backend = Arc::new(OpenAiBackend::from_config(&ai_config)?);
    let limiter = Arc::new(RateLimiter::new(ai_config.rate_limits()));

    let bind_addr = config.http.bind_addr();
    let runtime = ServiceRuntime::connect(
        config,
        vec!["ai_reasoning".into(), "conversation".into()],
        "1.0.0",
    )
    .await?;

    let service = AiService::start(
        runtime.clone(),
        backend,
        limiter,
        ai_config.max_tokens,
    )
    .await?;

    let router = Router::new()
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(service);
    alicia_bus::http::serve(router, &bind_addr).await?;
    runtime.shutdown().await;
    Ok(())
}
