use serde::{Deserialize, Serialize};

use alicia_core::AliciaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// One routable instance of a logical service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInstance {
    pub instance_id: String,
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub health_status: HealthStatus,
    pub active_connections: u32,
    /// Selection weight for weighted round robin, always ≥ 1.
    pub weight: u32,
    pub last_health_check: f64,
    pub response_time_ms: f64,
    pub total_requests: u64,
    pub failed_requests: u64,
}

impl ServiceInstance {
    pub fn new(instance_id: &str, service_name: &str, host: &str, port: u16, now: f64) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            service_name: service_name.to_string(),
            host: host.to_string(),
            port,
            health_status: HealthStatus::Healthy,
            active_connections: 0,
            weight: 1,
            last_health_check: now,
            response_time_ms: 0.0,
            total_requests: 0,
            failed_requests: 0,
        }
    }
}

/// Per-service selection algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    Random,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::Random => "random",
        }
    }
}

impl std::str::FromStr for Algorithm {
    type Err = AliciaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "least_connections" => Ok(Self::LeastConnections),
            "weighted_round_robin" => Ok(Self::WeightedRoundRobin),
            "random" => Ok(Self::Random),
            other => Err(AliciaError::Validation(format!(
                "invalid algorithm: {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_parse_roundtrip() {
        for name in [
            "round_robin",
            "least_connections",
            "weighted_round_robin",
            "random",
        ] {
            let algorithm: Algorithm = name.parse().unwrap();
            assert_eq!(algorithm.as_str(), name);
        }
        assert!("fastest_first".parse::<Algorithm>().is_err());
    }

    #[test]
    fn new_instance_starts_healthy() {
        let instance = ServiceInstance::new("i-1", "tts_service", "host-a", 8003, 0.0);
        assert_eq!(instance.health_status, HealthStatus::Healthy);
        assert_eq!(instance.weight, 1);
        assert_eq!(instance.active_connections, 0);
    }
}
