use alicia_bus::runtime::ServiceRuntime;
use alicia_core::config::load_dotenv;
use alicia_core::BusConfig;
use alicia_devices::api::build_router;
use alicia_devices::DeviceManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    load_dotenv();
    let config = BusConfig::from_env("device_manager", 8006);
    config.log_summary();

    let bind_addr = config.http.bind_addr();
    let runtime = ServiceRuntime::connect(
        config,
        vec![
            "device_management".into(),
            "command_routing".into(),
            "capability_abstraction".into(),
            "status_monitoring".into(),
            "device_discovery".into(),
        ],
        "1.0.0",
    )
    .await?;

    let manager = DeviceManager::start(runtime.clone()).await?;

    let router = build_router(manager);
    alicia_bus::http::serve(router, &bind_addr).await?;
    runtime.shutdown().await;
    Ok(())
}
