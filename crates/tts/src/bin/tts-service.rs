use alicia_bus::runtime::ServiceRuntime;
use alicia_core::config::load_dotenv;
use alicia_core::BusConfig;
use alicia_tts::api::build_router;
use alicia_tts::{create_engine, TtsConfig, TtsService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    load_dotenv();
    let config = BusConfig::from_env("tts_service", 8003);
    config.log_summary();

    let tts_config = TtsConfig::from_env();
    let engine = create_engine(&tts_config)?;

    let bind_addr = config.http.bind_addr();
    let runtime = ServiceRuntime::connect(
        config,
        vec![
            "text_to_speech".into(),
            "voice_synthesis".into(),
            "audio_generation".into(),
            "multi_voice_support".into(),
        ],
        "1.0.0",
    )
    .await?;

    let service = TtsService::start(runtime.clone(), tts_config, engine).await?;

    let router = build_router(service);
    alicia_bus::http::serve(router, &bind_addr).await?;
    runtime.shutdown().await;
    Ok(())
}
