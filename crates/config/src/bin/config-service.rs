use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use alicia_bus::runtime::ServiceRuntime;
use alicia_config::api::{build_router, ApiState};
use alicia_config::{ConfigService, ConfigStore};
use alicia_core::config::{env_or, load_dotenv};
use alicia_core::BusConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    load_dotenv();
    let config = BusConfig::from_env("config_service", 8026);
    config.log_summary();

    let config_path = PathBuf::from(env_or("CONFIG_PATH", "config"));
    let store = ConfigStore::open(&config_path, &config.environment)?;
    let store = Arc::new(RwLock::new(store));
    info!(path = %config_path.display(), "config store ready");

    let bind_addr = config.http.bind_addr();
    let runtime = ServiceRuntime::connect(
        config,
        vec![
            "configuration_management".into(),
            "dynamic_updates".into(),
            "environment_handling".into(),
            "validation".into(),
            "backup_restore".into(),
        ],
        "1.0.0",
    )
    .await?;

    let service = ConfigService::start(Arc::clone(&runtime), Arc::clone(&store)).await?;

    let router = build_router(ApiState {
        runtime: Arc::clone(&runtime),
        store,
        service,
    });

    alicia_bus::http::serve(router, &bind_addr).await?;
    runtime.shutdown().await;
    Ok(())
}
