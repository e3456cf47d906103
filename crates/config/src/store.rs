//! File-backed configuration store.
//!
//! Layout under the config root:
//!   global.json            — global configuration
//!   services/*.json        — per-service overlays
//!   environments/*.json    — per-environment overlays
//!   schemas/*.json         — validation schemas (required-field lists)
//!   backups/*.json         — timestamped snapshots
//!
//! Every mutation is validated first, persisted, then appended to the
//! in-memory history log; no partial update is ever committed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use alicia_core::{epoch_secs, AliciaError};

/// In-memory history cap.
const DEFAULT_MAX_HISTORY: usize = 100;

/// History entries older than this are purged (30 days).
const HISTORY_RETENTION_SECS: f64 = 30.0 * 24.0 * 3600.0;

/// One configuration change, oldest first in the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: f64,
    pub service: String,
    pub action: String,
    pub old: Value,
    pub new: Value,
}

pub struct ConfigStore {
    root: PathBuf,
    environment: String,
    global: Value,
    services: HashMap<String, Value>,
    schemas: HashMap<String, Value>,
    history: Vec<HistoryEntry>,
    max_history: usize,
}

impl ConfigStore {
    /// Open (or initialize) the store rooted at `root` for the given
    /// environment. Creates the directory layout and a default global
    /// config on first run, then loads everything from disk.
    pub fn open(root: impl Into<PathBuf>, environment: &str) -> Result<Self, AliciaError> {
        let root = root.into();
        for sub in ["services", "environments", "schemas", "backups"] {
            std::fs::create_dir_all(root.join(sub))?;
        }

        let mut store = Self {
            root,
            environment: environment.to_string(),
            global: Value::Null,
            services: HashMap::new(),
            schemas: HashMap::new(),
            history: Vec::new(),
            max_history: DEFAULT_MAX_HISTORY,
        };
        store.load()?;
        Ok(store)
    }

    fn load(&mut self) -> Result<(), AliciaError> {
        let global_path = self.root.join("global.json");
        self.global = if global_path.exists() {
            read_json(&global_path)?
        } else {
            let default = serde_json::json!({
                "environment": self.environment,
                "version": "1.0.0",
                "services": {},
                "features": {
                    "voice_processing": true,
                    "device_integration": true,
                },
            });
            write_json(&global_path, &default)?;
            default
        };

        // Environment overlay folds into the global view at load time.
        let env_path = self
            .root
            .join("environments")
            .join(format!("{}.json", self.environment));
        if env_path.exists() {
            let overlay: Value = read_json(&env_path)?;
            deep_merge(&mut self.global, &overlay);
        }

        for (dir, map) in [("services", true), ("schemas", false)] {
            let entries = std::fs::read_dir(self.root.join(dir))?;
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().map(|e| e == "json").unwrap_or(false) {
                    let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                        continue;
                    };
                    match read_json(&path) {
                        Ok(value) => {
                            if map {
                                self.services.insert(name.to_string(), value);
                            } else {
                                self.schemas.insert(name.to_string(), value);
                            }
                        }
                        Err(e) => warn!(file = %path.display(), error = %e, "skipping unreadable config file"),
                    }
                }
            }
        }

        info!(
            environment = %self.environment,
            services = self.services.len(),
            schemas = self.schemas.len(),
            "configuration loaded"
        );
        Ok(())
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Merged view: global (with environment overlay) plus the service
    /// overlay when one is named.
    pub fn merged(&self, service: Option<&str>) -> Value {
        let mut merged = self.global.clone();
        if let Some(name) = service {
            if let Some(overlay) = self.services.get(name) {
                deep_merge(&mut merged, overlay);
            }
        }
        merged
    }

    /// Raw per-service overlay, when present.
    pub fn service_overlay(&self, service: &str) -> Option<&Value> {
        self.services.get(service)
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.services.contains_key(service)
    }

    pub fn list_services(&self) -> Vec<String> {
        let mut names: Vec<_> = self.services.keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate and commit a per-service configuration. Returns the stored
    /// value. Nothing is written when validation fails.
    pub fn update_service(&mut self, service: &str, config: Value) -> Result<(), AliciaError> {
        if !config.is_object() {
            return Err(AliciaError::Validation(
                "service config must be a JSON object".into(),
            ));
        }
        if let Some(schema) = self.schemas.get(service) {
            validate_against(&config, schema)?;
        }

        let old = self.services.get(service).cloned().unwrap_or(Value::Null);
        write_json(
            &self.root.join("services").join(format!("{service}.json")),
            &config,
        )?;
        self.services.insert(service.to_string(), config.clone());
        self.push_history(service, "update", old, config);
        info!(service = %service, "service configuration updated");
        Ok(())
    }

    /// Deep-merge into the global configuration and persist.
    pub fn update_global(&mut self, config: Value) -> Result<(), AliciaError> {
        if !config.is_object() {
            return Err(AliciaError::Validation(
                "global config must be a JSON object".into(),
            ));
        }
        let old = self.global.clone();
        deep_merge(&mut self.global, &config);
        write_json(&self.root.join("global.json"), &self.global)?;
        let new = self.global.clone();
        self.push_history("global", "update", old, new);
        info!("global configuration updated");
        Ok(())
    }

    pub fn global(&self) -> &Value {
        &self.global
    }

    /// Snapshot everything into `backups/backup_{epoch}.json`. Returns the
    /// backup file name.
    pub fn backup(&self) -> Result<String, AliciaError> {
        let name = format!("backup_{}.json", epoch_secs() as u64);
        let snapshot = serde_json::json!({
            "timestamp": epoch_secs(),
            "environment": self.environment,
            "global_config": self.global,
            "service_configs": self.services,
        });
        write_json(&self.root.join("backups").join(&name), &snapshot)?;
        info!(backup = %name, "configuration backup written");
        Ok(name)
    }

    /// History entries, optionally filtered to one service, newest last.
    pub fn history(&self, service: Option<&str>) -> Vec<HistoryEntry> {
        self.history
            .iter()
            .filter(|e| service.map(|s| e.service == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Drop history entries past the 30-day retention window.
    pub fn purge_old_history(&mut self) -> usize {
        let cutoff = epoch_secs() - HISTORY_RETENTION_SECS;
        let before = self.history.len();
        self.history.retain(|e| e.timestamp > cutoff);
        before - self.history.len()
    }

    fn push_history(&mut self, service: &str, action: &str, old: Value, new: Value) {
        self.history.push(HistoryEntry {
            timestamp: epoch_secs(),
            service: service.to_string(),
            action: action.to_string(),
            old,
            new,
        });
        if self.history.len() > self.max_history {
            let excess = self.history.len() - self.max_history;
            self.history.drain(..excess);
        }
    }
}

/// Recursive merge: nested objects merge key-by-key, everything else
/// overwrites.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Schema check: every name in the schema's `required` list must be present.
fn validate_against(config: &Value, schema: &Value) -> Result<(), AliciaError> {
    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|a| a.as_slice())
        .unwrap_or(&[]);
    for field in required {
        if let Some(name) = field.as_str() {
            if config.get(name).is_none() {
                return Err(AliciaError::Validation(format!(
                    "required field '{name}' missing from configuration"
                )));
            }
        }
    }
    Ok(())
}

fn read_json(path: &Path) -> Result<Value, AliciaError> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

fn write_json(path: &Path, value: &Value) -> Result<(), AliciaError> {
    std::fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::open(dir.path(), "development").unwrap();
        (dir, store)
    }

    #[test]
    fn first_run_seeds_default_global() {
        let (_dir, store) = temp_store();
        assert_eq!(store.global()["environment"], "development");
        assert_eq!(store.global()["features"]["voice_processing"], true);
    }

    #[test]
    fn deep_merge_nests() {
        let mut base = json!({"mqtt": {"host": "a", "port": 1883}, "x": 1});
        deep_merge(&mut base, &json!({"mqtt": {"host": "b"}, "y": 2}));
        assert_eq!(base["mqtt"]["host"], "b");
        assert_eq!(base["mqtt"]["port"], 1883);
        assert_eq!(base["x"], 1);
        assert_eq!(base["y"], 2);
    }

    #[test]
    fn deep_merge_scalars_overwrite_objects() {
        let mut base = json!({"a": {"nested": true}});
        deep_merge(&mut base, &json!({"a": 5}));
        assert_eq!(base["a"], 5);
    }

    #[test]
    fn update_then_merged_returns_overlaid_config() {
        let (_dir, mut store) = temp_store();
        store
            .update_service("whisper", json!({"host": "h", "port": 10300}))
            .unwrap();

        let merged = store.merged(Some("whisper"));
        assert_eq!(merged["host"], "h");
        assert_eq!(merged["port"], 10300);
        // Global keys survive the merge.
        assert_eq!(merged["environment"], "development");
    }

    #[test]
    fn update_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = ConfigStore::open(dir.path(), "development").unwrap();
            store
                .update_service("tts_service", json!({"engine": "piper"}))
                .unwrap();
            store.update_global(json!({"features": {"metrics": false}})).unwrap();
        }
        let store = ConfigStore::open(dir.path(), "development").unwrap();
        assert_eq!(
            store.service_overlay("tts_service").unwrap()["engine"],
            "piper"
        );
        assert_eq!(store.global()["features"]["metrics"], false);
        assert_eq!(store.global()["features"]["voice_processing"], true);
    }

    #[test]
    fn environment_overlay_applied_at_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("environments")).unwrap();
        std::fs::write(
            dir.path().join("environments/production.json"),
            r#"{"features": {"voice_processing": false}}"#,
        )
        .unwrap();

        let store = ConfigStore::open(dir.path(), "production").unwrap();
        assert_eq!(store.global()["features"]["voice_processing"], false);
    }

    #[test]
    fn schema_validation_blocks_partial_update() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("schemas")).unwrap();
        std::fs::write(
            dir.path().join("schemas/whisper.json"),
            r#"{"required": ["host", "port"]}"#,
        )
        .unwrap();

        let mut store = ConfigStore::open(dir.path(), "development").unwrap();
        let err = store
            .update_service("whisper", json!({"host": "h"}))
            .unwrap_err();
        assert!(matches!(err, AliciaError::Validation(_)));

        // Nothing committed: no overlay, no file, no history.
        assert!(!store.has_service("whisper"));
        assert!(!dir.path().join("services/whisper.json").exists());
        assert!(store.history(Some("whisper")).is_empty());
    }

    #[test]
    fn history_records_old_and_new() {
        let (_dir, mut store) = temp_store();
        store.update_service("s", json!({"a": 1})).unwrap();
        store.update_service("s", json!({"a": 2})).unwrap();

        let history = store.history(Some("s"));
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].old, Value::Null);
        assert_eq!(history[0].new, json!({"a": 1}));
        assert_eq!(history[1].old, json!({"a": 1}));
        assert_eq!(history[1].new, json!({"a": 2}));
    }

    #[test]
    fn history_is_capped() {
        let (_dir, mut store) = temp_store();
        store.max_history = 5;
        for i in 0..10 {
            store.update_service("s", json!({ "i": i })).unwrap();
        }
        let history = store.history(None);
        assert_eq!(history.len(), 5);
        assert_eq!(history.last().unwrap().new, json!({"i": 9}));
    }

    #[test]
    fn purge_drops_only_old_entries() {
        let (_dir, mut store) = temp_store();
        store.update_service("s", json!({"a": 1})).unwrap();
        store.history[0].timestamp = epoch_secs() - HISTORY_RETENTION_SECS - 1.0;
        store.update_service("s", json!({"a": 2})).unwrap();

        assert_eq!(store.purge_old_history(), 1);
        assert_eq!(store.history(None).len(), 1);
    }

    #[test]
    fn backup_writes_snapshot_file() {
        let (dir, mut store) = temp_store();
        store.update_service("s", json!({"a": 1})).unwrap();
        let name = store.backup().unwrap();
        let path = dir.path().join("backups").join(&name);
        assert!(path.exists());

        let snapshot: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(snapshot["service_configs"]["s"]["a"], 1);
    }

    #[test]
    fn non_object_configs_rejected() {
        let (_dir, mut store) = temp_store();
        assert!(matches!(
            store.update_service("s", json!([1, 2])),
            Err(AliciaError::Validation(_))
        ));
        assert!(matches!(
            store.update_global(json!("nope")),
            Err(AliciaError::Validation(_))
        ));
    }
}
