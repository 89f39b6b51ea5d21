use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::{Result, SettingsError, SettingsStore, UpdatePolicy};

/// Settings kept in a JSON file shared with the rest of the app.
///
/// Every write re-reads the file and merges only the updater's keys, so fields
/// changed meanwhile by the settings panel are not clobbered.
pub struct JsonSettingsStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    write_lock: Mutex<()>,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store at `<config dir>/<app_name>/settings.json`.
    pub fn in_config_dir(app_name: &str) -> Result<Self> {
        let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
        Ok(Self::new(dir.join(app_name).join("settings.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let text = fs::read_to_string(&self.path)?;
        if text.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&text)? {
            Value::Object(map) => Ok(map),
            _ => Err(SettingsError::NotAnObject(self.path.clone())),
        }
    }

    fn write_document(&self, document: &Map<String, Value>) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        // Unique temp file per write, renamed over the target
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&serde_json::to_vec_pretty(document)?)?;
        tmp.flush()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Read the policy fields one by one so a single bad value does not reset the rest.
fn policy_from_document(document: &Map<String, Value>) -> UpdatePolicy {
    let defaults = UpdatePolicy::default();
    UpdatePolicy {
        auto_check_and_install: document
            .get(UpdatePolicy::AUTO_CHECK_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(defaults.auto_check_and_install),
        update_deferred: document
            .get(UpdatePolicy::DEFERRED_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(defaults.update_deferred),
        last_check_timestamp: document
            .get(UpdatePolicy::LAST_CHECK_KEY)
            .and_then(Value::as_i64)
            .unwrap_or(defaults.last_check_timestamp),
    }
}

fn merge_policy(document: &mut Map<String, Value>, policy: &UpdatePolicy) {
    document.insert(
        UpdatePolicy::AUTO_CHECK_KEY.to_string(),
        Value::Bool(policy.auto_check_and_install),
    );
    document.insert(
        UpdatePolicy::DEFERRED_KEY.to_string(),
        Value::Bool(policy.update_deferred),
    );
    document.insert(
        UpdatePolicy::LAST_CHECK_KEY.to_string(),
        Value::from(policy.last_check_timestamp),
    );
}

impl SettingsStore for JsonSettingsStore {
    fn policy(&self) -> Result<UpdatePolicy> {
        Ok(policy_from_document(&self.read_document()?))
    }

    fn update_policy(&self, update: &mut dyn FnMut(&mut UpdatePolicy)) -> Result<UpdatePolicy> {
        let _guard = self.write_lock.lock();
        let mut document = self.read_document()?;
        let mut policy = policy_from_document(&document);
        update(&mut policy);
        merge_policy(&mut document, &policy);
        self.write_document(&document)?;
        log::debug!("Saved update policy to {}", self.path.display());
        Ok(policy)
    }
}

/// In-process settings, for headless use and tests.
#[derive(Default)]
pub struct MemorySettingsStore {
    policy: Mutex<UpdatePolicy>,
}

impl MemorySettingsStore {
    pub fn new(policy: UpdatePolicy) -> Self {
        Self { policy: Mutex::new(policy) }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn policy(&self) -> Result<UpdatePolicy> {
        Ok(self.policy.lock().clone())
    }

    fn update_policy(&self, update: &mut dyn FnMut(&mut UpdatePolicy)) -> Result<UpdatePolicy> {
        let mut policy = self.policy.lock();
        update(&mut policy);
        Ok(policy.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSettingsStore::new(dir.path().join("settings.json"));
        assert_eq!(store.policy().unwrap(), UpdatePolicy::default());
    }

    #[test]
    fn test_update_preserves_unrelated_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{"shortcut":"Cmd+Shift+K","theme":"dark","updateDeferred":true}"#,
        )
        .unwrap();

        let store = JsonSettingsStore::new(&path);
        let saved = store
            .update_policy(&mut |p| p.last_check_timestamp = 42)
            .unwrap();
        assert!(saved.update_deferred);

        let on_disk: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["shortcut"], "Cmd+Shift+K");
        assert_eq!(on_disk["theme"], "dark");
        assert_eq!(on_disk["lastCheckTimestamp"], 42);
        assert_eq!(on_disk["updateDeferred"], true);
    }

    #[test]
    fn test_concurrent_external_edit_survives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let store = JsonSettingsStore::new(&path);
        store.update_policy(&mut |p| p.update_deferred = true).unwrap();

        // Settings panel writes a new field behind the store's back
        let mut doc: Map<String, Value> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        doc.insert("launchAtLogin".into(), Value::Bool(true));
        fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();

        store.update_policy(&mut |p| p.update_deferred = false).unwrap();
        let on_disk: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["launchAtLogin"], true);
        assert_eq!(on_disk["updateDeferred"], false);
    }

    #[test]
    fn test_bad_field_types_fall_back_individually() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"autoCheckAndInstall":"yes","lastCheckTimestamp":1234}"#).unwrap();
        let policy = JsonSettingsStore::new(&path).policy().unwrap();
        assert!(policy.auto_check_and_install);
        assert_eq!(policy.last_check_timestamp, 1234);
    }

    #[test]
    fn test_non_object_document_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "[1,2,3]").unwrap();
        let err = JsonSettingsStore::new(&path).policy().unwrap_err();
        assert!(matches!(err, SettingsError::NotAnObject(_)));
    }

    #[test]
    fn test_parallel_writers_on_one_file_never_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"theme":"dark"}"#).unwrap();

        let writers: Vec<_> = (0..2)
            .map(|n| {
                let store = JsonSettingsStore::new(&path);
                std::thread::spawn(move || {
                    for i in 0..300 {
                        store
                            .update_policy(&mut |p| p.last_check_timestamp = n * 1000 + i)
                            .unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let stamp = JsonSettingsStore::new(&path).policy().unwrap().last_check_timestamp;
        assert!(stamp == 299 || stamp == 1299, "unexpected final timestamp {}", stamp);
        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["theme"], "dark");
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1, "temp files left behind");
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemorySettingsStore::default();
        store.update_policy(&mut |p| p.update_deferred = true).unwrap();
        assert!(store.policy().unwrap().update_deferred);
    }

    #[test]
    fn test_save_policy_replaces_all_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"theme":"dark","updateDeferred":true}"#).unwrap();

        let store = JsonSettingsStore::new(&path);
        let policy = UpdatePolicy {
            auto_check_and_install: false,
            update_deferred: false,
            last_check_timestamp: 42,
        };
        store.save_policy(&policy).unwrap();

        assert_eq!(store.policy().unwrap(), policy);
        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["theme"], "dark");
    }
}
