use serde::{Deserialize, Serialize};
use std::env;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

pub fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

pub fn env_u16(key: &str, default: u16) -> u16 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

pub fn env_u32(key: &str, default: u32) -> u32 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

pub fn env_u64(key: &str, default: u64) -> u64 {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

pub fn env_usize(key: &str, default: usize) -> usize {
    env_opt(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

/// Settings every bus service needs: broker credentials, its HTTP port,
/// and the deployment environment label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub service_name: String,
    pub environment: String,
    pub mqtt: MqttConfig,
    pub http: HttpConfig,
}

impl BusConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    pub fn from_env(service_name: &str, default_http_port: u16) -> Self {
        Self {
            service_name: service_name.to_string(),
            environment: env_or("ENVIRONMENT", "development"),
            mqtt: MqttConfig::from_env(service_name),
            http: HttpConfig::from_env(default_http_port),
        }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded for {}:", self.service_name);
        tracing::info!("  environment: {}", self.environment);
        tracing::info!("  mqtt:        {}:{}", self.mqtt.host, self.mqtt.port);
        tracing::info!("  http:        {}:{}", self.http.host, self.http.port);
    }
}

// ── MQTT broker ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keepalive interval in seconds (default 60).
    pub keepalive_secs: u64,
}

impl MqttConfig {
    pub fn from_env(service_name: &str) -> Self {
        Self {
            host: env_or("MQTT_HOST", "alicia_bus_core"),
            port: env_u16("MQTT_PORT", 1883),
            username: env_opt("MQTT_USERNAME").or_else(|| Some(service_name.to_string())),
            password: env_opt("MQTT_PASSWORD"),
            keepalive_secs: env_u64("MQTT_KEEPALIVE_SECS", 60),
        }
    }
}

// ── HTTP surface ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// Hostname other services use to reach this instance (registration,
    /// health probes). The bind host is usually 0.0.0.0 and useless for that.
    pub advertise_host: String,
}

impl HttpConfig {
    pub fn from_env(default_port: u16) -> Self {
        Self {
            host: env_or("HTTP_HOST", "0.0.0.0"),
            port: env_u16("HTTP_PORT", default_port),
            advertise_host: env_or("ADVERTISE_HOST", "localhost"),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        // Keys unlikely to be set in the test environment.
        assert_eq!(env_u16("ALICIA_TEST_UNSET_PORT", 8006), 8006);
        assert_eq!(env_or("ALICIA_TEST_UNSET_HOST", "fallback"), "fallback");
        assert!(env_opt("ALICIA_TEST_UNSET_OPT").is_none());
    }

    #[test]
    fn http_bind_addr_formats() {
        let http = HttpConfig {
            host: "0.0.0.0".into(),
            port: 8003,
            advertise_host: "localhost".into(),
        };
        assert_eq!(http.bind_addr(), "0.0.0.0:8003");
    }
}
