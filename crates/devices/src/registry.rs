//! Device inventory and the capability inverse index.
//!
//! The index is maintained in lockstep with the device table: every
//! (device, capability) pair present in a device record appears in the
//! index exactly once, and vice versa.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;
use tracing::{debug, info};

use alicia_core::epoch_secs;

use crate::device::{Device, DeviceStatus, DEVICE_OFFLINE_AFTER_SECS};

#[derive(Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, Device>,
    /// capability name → device ids providing it.
    capability_index: HashMap<String, BTreeSet<String>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or re-register) a device from its announcement payload.
    /// Returns the capability names that are new to the registry, so the
    /// caller can subscribe their capability topics.
    pub fn register(&mut self, payload: &Value) -> Vec<String> {
        let Some(device_id) = payload
            .get("device_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        else {
            return Vec::new();
        };

        // Capabilities may arrive as a list of descriptors with `name`
        // fields, or as a name → descriptor map.
        let mut capabilities: HashMap<String, Value> = HashMap::new();
        match payload.get("capabilities") {
            Some(Value::Array(list)) => {
                for descriptor in list {
                    if let Some(name) = descriptor.get("name").and_then(Value::as_str) {
                        capabilities.insert(name.to_string(), descriptor.clone());
                    }
                }
            }
            Some(Value::Object(map)) => {
                for (name, descriptor) in map {
                    capabilities.insert(name.clone(), descriptor.clone());
                }
            }
            _ => {}
        }

        let endpoints = payload
            .get("endpoints")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        let now = epoch_secs();
        let registered_at = self
            .devices
            .get(device_id)
            .map(|d| d.registered_at)
            .unwrap_or(now);

        // Drop stale index entries before installing the new capability set.
        if self.devices.contains_key(device_id) {
            self.remove_from_index(device_id);
        }

        let mut new_capabilities = Vec::new();
        for name in capabilities.keys() {
            let members = self.capability_index.entry(name.clone()).or_default();
            if members.is_empty() && !members.contains(device_id) {
                new_capabilities.push(name.clone());
            }
            members.insert(device_id.to_string());
        }

        let device = Device {
            device_id: device_id.to_string(),
            device_type: payload
                .get("device_type")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            capabilities,
            endpoints,
            status: DeviceStatus::Registered,
            metadata: payload.get("metadata").cloned().unwrap_or(Value::Null),
            last_seen: now,
            last_status: Value::Null,
            registered_at,
        };

        info!(device = %device_id, device_type = %device.device_type, "device registered");
        self.devices.insert(device_id.to_string(), device);
        new_capabilities
    }

    /// Remove a device and its index entries.
    pub fn unregister(&mut self, device_id: &str) -> bool {
        if self.devices.contains_key(device_id) {
            self.remove_from_index(device_id);
            self.devices.remove(device_id);
            info!(device = %device_id, "device unregistered");
            true
        } else {
            false
        }
    }

    fn remove_from_index(&mut self, device_id: &str) {
        let Some(device) = self.devices.get(device_id) else {
            return;
        };
        let names: Vec<String> = device.capabilities.keys().cloned().collect();
        for name in names {
            if let Some(members) = self.capability_index.get_mut(&name) {
                members.remove(device_id);
                if members.is_empty() {
                    self.capability_index.remove(&name);
                }
            }
        }
    }

    /// Apply a status update from the device's status topic.
    pub fn update_status(&mut self, device_id: &str, payload: &Value) {
        let Some(device) = self.devices.get_mut(device_id) else {
            debug!(device = %device_id, "status for unknown device ignored");
            return;
        };
        device.last_status = payload.clone();
        device.last_seen = epoch_secs();
        device.status = match payload.get("status").and_then(Value::as_str) {
            Some("offline") => DeviceStatus::Offline,
            _ => DeviceStatus::Online,
        };
    }

    /// Liveness sweep: mark devices silent for too long as offline.
    /// Returns the ids swept this pass.
    pub fn sweep_offline(&mut self) -> Vec<String> {
        let now = epoch_secs();
        let mut swept = Vec::new();
        for (id, device) in self.devices.iter_mut() {
            if device.status != DeviceStatus::Offline
                && now - device.last_seen > DEVICE_OFFLINE_AFTER_SECS
            {
                device.status = DeviceStatus::Offline;
                swept.push(id.clone());
            }
        }
        for id in &swept {
            info!(device = %id, "device marked offline (no status updates)");
        }
        swept
    }

    /// Current members of a capability, in stable order.
    pub fn members_of(&self, capability: &str) -> Vec<String> {
        self.capability_index
            .get(capability)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id)
    }

    pub fn list(&self) -> Vec<&Device> {
        let mut devices: Vec<_> = self.devices.values().collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    /// capability → member ids, for the capabilities API.
    pub fn capability_table(&self) -> HashMap<String, Vec<String>> {
        self.capability_index
            .iter()
            .map(|(name, members)| (name.clone(), members.iter().cloned().collect()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Test/diagnostic helper: assert the table↔index lockstep invariant.
    pub fn index_consistent(&self) -> bool {
        for (id, device) in &self.devices {
            for name in device.capabilities.keys() {
                if !self
                    .capability_index
                    .get(name)
                    .map(|m| m.contains(id))
                    .unwrap_or(false)
                {
                    return false;
                }
            }
        }
        for (name, members) in &self.capability_index {
            for id in members {
                if !self
                    .devices
                    .get(id)
                    .map(|d| d.capabilities.contains_key(name))
                    .unwrap_or(false)
                {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registration(device_id: &str, capabilities: &[&str]) -> Value {
        json!({
            "device_id": device_id,
            "device_type": "speaker",
            "capabilities": capabilities
                .iter()
                .map(|name| json!({"name": name}))
                .collect::<Vec<_>>(),
            "endpoints": {
                "control": format!("alicia/devices/{device_id}/command"),
                "status": format!("alicia/devices/{device_id}/status"),
            },
        })
    }

    #[test]
    fn register_builds_capability_index() {
        let mut registry = DeviceRegistry::new();
        let new = registry.register(&registration("d1", &["light.on", "light.off"]));
        assert_eq!(new.len(), 2);

        registry.register(&registration("d2", &["light.on"]));
        assert_eq!(registry.members_of("light.on"), vec!["d1", "d2"]);
        assert_eq!(registry.members_of("light.off"), vec!["d1"]);
        assert!(registry.index_consistent());
    }

    #[test]
    fn new_capabilities_reported_once() {
        let mut registry = DeviceRegistry::new();
        let first = registry.register(&registration("d1", &["light.on"]));
        assert_eq!(first, vec!["light.on"]);

        // Second provider of an existing capability: nothing new.
        let second = registry.register(&registration("d2", &["light.on"]));
        assert!(second.is_empty());
    }

    #[test]
    fn reregistration_replaces_capability_set() {
        let mut registry = DeviceRegistry::new();
        registry.register(&registration("d1", &["light.on", "light.off"]));
        registry.register(&registration("d1", &["volume.set"]));

        assert!(registry.members_of("light.on").is_empty());
        assert_eq!(registry.members_of("volume.set"), vec!["d1"]);
        assert!(registry.index_consistent());
    }

    #[test]
    fn unregister_clears_index() {
        let mut registry = DeviceRegistry::new();
        registry.register(&registration("d1", &["light.on"]));
        registry.register(&registration("d2", &["light.on"]));

        assert!(registry.unregister("d1"));
        assert_eq!(registry.members_of("light.on"), vec!["d2"]);

        assert!(registry.unregister("d2"));
        assert!(registry.members_of("light.on").is_empty());
        assert!(registry.capability_table().is_empty());
        assert!(!registry.unregister("d2"));
        assert!(registry.index_consistent());
    }

    #[test]
    fn status_updates_track_liveness() {
        let mut registry = DeviceRegistry::new();
        registry.register(&registration("d1", &[]));

        registry.update_status("d1", &json!({"status": "online", "volume": 30}));
        let device = registry.get("d1").unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.last_status["volume"], 30);

        registry.update_status("d1", &json!({"status": "offline"}));
        assert_eq!(registry.get("d1").unwrap().status, DeviceStatus::Offline);
    }

    #[test]
    fn sweep_marks_silent_devices_offline() {
        let mut registry = DeviceRegistry::new();
        registry.register(&registration("d1", &[]));
        registry.register(&registration("d2", &[]));

        // Backdate d1 past the offline threshold.
        registry.devices.get_mut("d1").unwrap().last_seen =
            epoch_secs() - DEVICE_OFFLINE_AFTER_SECS - 1.0;

        let swept = registry.sweep_offline();
        assert_eq!(swept, vec!["d1"]);
        assert_eq!(registry.get("d1").unwrap().status, DeviceStatus::Offline);
        assert_eq!(registry.get("d2").unwrap().status, DeviceStatus::Registered);

        // Second sweep is a no-op.
        assert!(registry.sweep_offline().is_empty());
    }

    #[test]
    fn capability_map_form_accepted() {
        let mut registry = DeviceRegistry::new();
        registry.register(&json!({
            "device_id": "d1",
            "capabilities": {"light.on": {"name": "light.on", "dimmable": true}},
        }));
        assert_eq!(registry.members_of("light.on"), vec!["d1"]);
        assert_eq!(
            registry.get("d1").unwrap().capabilities["light.on"]["dimmable"],
            true
        );
    }
}
