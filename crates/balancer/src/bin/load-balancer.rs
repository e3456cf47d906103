use std::sync::Arc;
use std::time::Duration;

use alicia_balancer::api::{build_router, ApiState};
use alicia_balancer::registry::{DEFAULT_FAILURE_THRESHOLD, DEFAULT_RECOVERY_TIMEOUT};
use alicia_balancer::{LoadBalancer, LoadBalancerService};
use alicia_bus::monitor::ProbeTarget;
use alicia_bus::runtime::ServiceRuntime;
use alicia_bus::traits::handler;
use alicia_bus::{topics, HealthMonitor, QosLevel, ServiceRegistry};
use alicia_core::config::{env_opt, env_u32, env_u64, load_dotenv};
use alicia_core::BusConfig;

/// Parse `HEALTH_PROBE_TARGETS` ("name=url,name=url") into probe targets.
fn probe_targets() -> Vec<ProbeTarget> {
    env_opt("HEALTH_PROBE_TARGETS")
        .map(|raw| {
            raw.split(',')
                .filter_map(|pair| {
                    let (service, url) = pair.split_once('=')?;
                    Some(ProbeTarget {
                        service: service.trim().to_string(),
                        url: url.trim().to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    load_dotenv();
    let config = BusConfig::from_env("load_balancer", 8008);
    config.log_summary();

    let failure_threshold = env_u32("FAILURE_THRESHOLD", DEFAULT_FAILURE_THRESHOLD);
    let recovery_timeout = env_u64("RECOVERY_TIMEOUT", DEFAULT_RECOVERY_TIMEOUT as u64) as f64;
    let balancer = Arc::new(LoadBalancer::new(failure_threshold, recovery_timeout));

    let bind_addr = config.http.bind_addr();
    let runtime = ServiceRuntime::connect(
        config,
        vec![
            "load_balancing".into(),
            "service_discovery".into(),
            "health_monitoring".into(),
            "circuit_breaker".into(),
            "performance_monitoring".into(),
        ],
        "1.0.0",
    )
    .await?;

    let service = LoadBalancerService::start(Arc::clone(&runtime), balancer).await?;

    // Cross-cutting service directory: same discovery stream, service-level
    // view (instances live in the balancer registry).
    let directory = ServiceRegistry::new();
    let dir = directory.clone();
    runtime
        .subscribe(
            topics::DISCOVERY_REGISTER,
            QosLevel::AtLeastOnce,
            handler(move |_topic, envelope| {
                let dir = dir.clone();
                async move {
                    dir.apply_register(&envelope).await;
                    Ok(())
                }
            }),
        )
        .await?;
    let dir = directory.clone();
    runtime
        .subscribe(
            topics::DISCOVERY_UNREGISTER,
            QosLevel::AtLeastOnce,
            handler(move |_topic, envelope| {
                let dir = dir.clone();
                async move {
                    dir.apply_unregister(&envelope).await;
                    Ok(())
                }
            }),
        )
        .await?;
    let dir = directory.clone();
    runtime
        .subscribe(
            topics::HEALTH_FILTER,
            QosLevel::AtMostOnce,
            handler(move |_topic, envelope| {
                let dir = dir.clone();
                async move {
                    if let Some(name) = envelope.payload.get("service_name").and_then(|v| v.as_str())
                    {
                        dir.touch(name).await;
                    }
                    Ok(())
                }
            }),
        )
        .await?;

    // Staleness reaper for the directory.
    let reaper = directory.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            reaper.reap_stale().await;
        }
    });

    // Active HTTP probes over the configured targets.
    let monitor = Arc::new(HealthMonitor::new(probe_targets()));
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let probe_interval = Duration::from_secs(env_u64("HEALTH_CHECK_INTERVAL", 30));
    tokio::spawn(Arc::clone(&monitor).run(probe_interval, shutdown_rx));

    let router = build_router(ApiState {
        service,
        directory,
        monitor,
    });
    alicia_bus::http::serve(router, &bind_addr).await?;
    runtime.shutdown().await;
    Ok(())
}
