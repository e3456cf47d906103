use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A device goes offline after this many seconds without a status update.
pub const DEVICE_OFFLINE_AFTER_SECS: f64 = 300.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Registered,
    Online,
    Offline,
}

/// One managed device and everything the command router needs to reach it.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub device_id: String,
    pub device_type: String,
    /// Capability name → capability descriptor (capability-specific schema).
    pub capabilities: HashMap<String, Value>,
    /// Role → topic; commands go to `control`, acks come back on `response`.
    pub endpoints: HashMap<String, String>,
    pub status: DeviceStatus,
    pub metadata: Value,
    pub last_seen: f64,
    pub last_status: Value,
    pub registered_at: f64,
}

impl Device {
    /// The topic commands are published to, when the device announced one.
    pub fn control_topic(&self) -> Option<&str> {
        self.endpoints.get("control").map(String::as_str)
    }

    pub fn capability_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.capabilities.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_topic_lookup() {
        let mut endpoints = HashMap::new();
        endpoints.insert("control".to_string(), "alicia/devices/d1/command".to_string());
        let device = Device {
            device_id: "d1".into(),
            device_type: "speaker".into(),
            capabilities: HashMap::new(),
            endpoints,
            status: DeviceStatus::Registered,
            metadata: Value::Null,
            last_seen: 0.0,
            last_status: Value::Null,
            registered_at: 0.0,
        };
        assert_eq!(device.control_topic(), Some("alicia/devices/d1/command"));
    }
}
