//! Health monitor: active liveness probes over configured services.
//!
//! Each target is probed over HTTP on a fixed interval and tagged
//! `healthy | unhealthy | timeout | error`. A bounded history (24 h window)
//! backs metrics queries, and the aggregate derives the overall status.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use alicia_core::epoch_secs;

/// Probe timeout per the monitoring contract.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Probe results older than this are dropped from history.
const HISTORY_WINDOW_SECS: f64 = 24.0 * 3600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Healthy,
    Unhealthy,
    Timeout,
    Error,
}

/// Aggregate status: degraded iff any service is not healthy, critical iff
/// none are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Critical,
}

/// One service to probe: name plus its HTTP health URL.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub service: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub service: String,
    pub status: ProbeStatus,
    pub response_time_ms: f64,
    pub timestamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub overall: OverallStatus,
    pub services: Vec<ProbeResult>,
    pub history_len: usize,
}

struct Inner {
    latest: HashMap<String, ProbeResult>,
    history: VecDeque<ProbeResult>,
}

pub struct HealthMonitor {
    client: reqwest::Client,
    targets: Vec<ProbeTarget>,
    probe_timeout: Duration,
    inner: Arc<Mutex<Inner>>,
}

impl HealthMonitor {
    pub fn new(targets: Vec<ProbeTarget>) -> Self {
        Self::with_timeout(targets, DEFAULT_PROBE_TIMEOUT)
    }

    pub fn with_timeout(targets: Vec<ProbeTarget>, probe_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            targets,
            probe_timeout,
            inner: Arc::new(Mutex::new(Inner {
                latest: HashMap::new(),
                history: VecDeque::new(),
            })),
        }
    }

    /// Probe a single target and classify the outcome.
    pub async fn probe(&self, target: &ProbeTarget) -> ProbeResult {
        let start = std::time::Instant::now();
        let response = self
            .client
            .get(&target.url)
            .timeout(self.probe_timeout)
            .send()
            .await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let (status, detail) = match response {
            Ok(resp) if resp.status().is_success() => (ProbeStatus::Healthy, None),
            Ok(resp) => (
                ProbeStatus::Unhealthy,
                Some(format!("status {}", resp.status().as_u16())),
            ),
            Err(e) if e.is_timeout() => (ProbeStatus::Timeout, None),
            Err(e) => (ProbeStatus::Error, Some(e.to_string())),
        };

        ProbeResult {
            service: target.service.clone(),
            status,
            response_time_ms: elapsed_ms,
            timestamp: epoch_secs(),
            detail,
        }
    }

    /// Probe every configured target once and record the results.
    pub async fn probe_all(&self) {
        for target in &self.targets {
            let result = self.probe(target).await;
            if result.status != ProbeStatus::Healthy {
                warn!(
                    service = %result.service,
                    status = ?result.status,
                    detail = result.detail.as_deref().unwrap_or(""),
                    "probe failed"
                );
            } else {
                debug!(service = %result.service, ms = result.response_time_ms, "probe ok");
            }
            self.record(result).await;
        }
    }

    /// Record a probe result (also used directly by tests and by services
    /// that run protocol-specific checks).
    pub async fn record(&self, result: ProbeResult) {
        let mut inner = self.inner.lock().await;
        inner.latest.insert(result.service.clone(), result.clone());
        inner.history.push_back(result);

        let horizon = epoch_secs() - HISTORY_WINDOW_SECS;
        while inner
            .history
            .front()
            .map(|r| r.timestamp < horizon)
            .unwrap_or(false)
        {
            inner.history.pop_front();
        }
    }

    /// Derive the overall status from the latest result per service.
    pub async fn overall(&self) -> OverallStatus {
        let inner = self.inner.lock().await;
        if inner.latest.is_empty() {
            return OverallStatus::Healthy;
        }
        let healthy = inner
            .latest
            .values()
            .filter(|r| r.status == ProbeStatus::Healthy)
            .count();
        if healthy == 0 {
            OverallStatus::Critical
        } else if healthy < inner.latest.len() {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        }
    }

    pub async fn snapshot(&self) -> MonitorSnapshot {
        let overall = self.overall().await;
        let inner = self.inner.lock().await;
        let mut services: Vec<_> = inner.latest.values().cloned().collect();
        services.sort_by(|a, b| a.service.cmp(&b.service));
        MonitorSnapshot {
            overall,
            services,
            history_len: inner.history.len(),
        }
    }

    /// Probe results for one service since the given epoch time.
    pub async fn history_for(&self, service: &str, since: f64) -> Vec<ProbeResult> {
        self.inner
            .lock()
            .await
            .history
            .iter()
            .filter(|r| r.service == service && r.timestamp >= since)
            .cloned()
            .collect()
    }

    /// Probe loop. Runs until the shutdown watch flips.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(targets = self.targets.len(), "health monitor started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe_all().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn result(service: &str, status: ProbeStatus) -> ProbeResult {
        ProbeResult {
            service: service.into(),
            status,
            response_time_ms: 1.0,
            timestamp: epoch_secs(),
            detail: None,
        }
    }

    #[tokio::test]
    async fn overall_derivation() {
        let monitor = HealthMonitor::new(vec![]);
        assert_eq!(monitor.overall().await, OverallStatus::Healthy);

        monitor.record(result("a", ProbeStatus::Healthy)).await;
        monitor.record(result("b", ProbeStatus::Healthy)).await;
        assert_eq!(monitor.overall().await, OverallStatus::Healthy);

        monitor.record(result("b", ProbeStatus::Unhealthy)).await;
        assert_eq!(monitor.overall().await, OverallStatus::Degraded);

        monitor.record(result("a", ProbeStatus::Timeout)).await;
        assert_eq!(monitor.overall().await, OverallStatus::Critical);
    }

    #[tokio::test]
    async fn history_is_windowed() {
        let monitor = HealthMonitor::new(vec![]);
        let mut old = result("a", ProbeStatus::Healthy);
        old.timestamp = epoch_secs() - HISTORY_WINDOW_SECS - 60.0;
        monitor.record(old).await;
        monitor.record(result("a", ProbeStatus::Healthy)).await;

        // The stale entry is pruned as newer ones arrive.
        let snap = monitor.snapshot().await;
        assert_eq!(snap.history_len, 1);
    }

    #[tokio::test]
    async fn history_filter_by_service_and_time() {
        let monitor = HealthMonitor::new(vec![]);
        monitor.record(result("a", ProbeStatus::Healthy)).await;
        monitor.record(result("b", ProbeStatus::Unhealthy)).await;

        let a_history = monitor.history_for("a", 0.0).await;
        assert_eq!(a_history.len(), 1);
        assert_eq!(a_history[0].service, "a");

        let future = monitor.history_for("a", epoch_secs() + 100.0).await;
        assert!(future.is_empty());
    }

    /// Minimal one-shot HTTP server for probe tests.
    async fn serve_once(response: &'static str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        format!("http://{addr}/health")
    }

    #[tokio::test]
    async fn probe_classifies_success() {
        let url = serve_once("HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok").await;
        let monitor = HealthMonitor::new(vec![]);
        let target = ProbeTarget {
            service: "tts_service".into(),
            url,
        };
        let result = monitor.probe(&target).await;
        assert_eq!(result.status, ProbeStatus::Healthy);
        assert!(result.response_time_ms >= 0.0);
    }

    #[tokio::test]
    async fn probe_classifies_server_error() {
        let url =
            serve_once("HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                .await;
        let monitor = HealthMonitor::new(vec![]);
        let target = ProbeTarget {
            service: "stt_service".into(),
            url,
        };
        let result = monitor.probe(&target).await;
        assert_eq!(result.status, ProbeStatus::Unhealthy);
        assert_eq!(result.detail.as_deref(), Some("status 500"));
    }

    #[tokio::test]
    async fn probe_classifies_connection_error() {
        let monitor = HealthMonitor::new(vec![]);
        let target = ProbeTarget {
            service: "missing".into(),
            url: "http://127.0.0.1:1/health".into(),
        };
        let result = monitor.probe(&target).await;
        assert_eq!(result.status, ProbeStatus::Error);
    }
}
