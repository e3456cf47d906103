use std::path::PathBuf;
use std::sync::Arc;

use alicia_bus::runtime::ServiceRuntime;
use alicia_core::config::{env_or, load_dotenv};
use alicia_core::BusConfig;
use alicia_security::api::build_router;
use alicia_security::SecurityGateway;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    load_dotenv();
    let config = BusConfig::from_env("security_gateway", 8009);
    config.log_summary();

    let keys_dir = PathBuf::from(env_or("ENCRYPTION_KEY_PATH", "keys"));
    let certs_dir = PathBuf::from(env_or("CERTIFICATE_PATH", "certs"));
    let token_secret = env_or("TOKEN_SECRET", "alicia_secret_key_2024");

    let bind_addr = config.http.bind_addr();
    let runtime = ServiceRuntime::connect(
        config,
        vec![
            "device_authentication".into(),
            "message_encryption".into(),
            "certificate_management".into(),
            "access_control".into(),
            "security_monitoring".into(),
        ],
        "1.0.0",
    )
    .await?;

    let gateway = SecurityGateway::new(runtime.clone(), &keys_dir, &certs_dir, &token_secret)?;
    Arc::clone(&gateway).start_bus().await?;

    let router = build_router(gateway);
    alicia_bus::http::serve(router, &bind_addr).await?;
    runtime.shutdown().await;
    Ok(())
}
