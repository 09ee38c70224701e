//! Key-value settings storage

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;

/// Durable key-value settings table owned by the storage layer
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Load every stored setting
    async fn load(&self) -> Result<BTreeMap<String, String>>;

    /// Insert or overwrite the given settings, leaving other keys untouched
    async fn save(&self, entries: &BTreeMap<String, String>) -> Result<()>;
}

/// Settings held in memory
#[derive(Debug, Default)]
pub struct MemorySettings {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries<K, V, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: RwLock::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl SettingsStore for MemorySettings {
    async fn load(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.entries.read().clone())
    }

    async fn save(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let mut current = self.entries.write();
        for (key, value) in entries {
            current.insert(key.clone(), value.clone());
        }
        Ok(())
    }
}

/// Settings persisted as a flat JSON object on disk.
///
/// Non-string JSON values (numbers, booleans) are accepted on load and
/// stored back as strings.
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    lock: RwLock<()>,
}

impl JsonFileSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    fn read_file(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        let raw: BTreeMap<String, serde_json::Value> = serde_json::from_str(&content)?;
        Ok(raw
            .into_iter()
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect())
    }
}

#[async_trait]
impl SettingsStore for JsonFileSettings {
    async fn load(&self) -> Result<BTreeMap<String, String>> {
        let _guard = self.lock.read();
        self.read_file()
    }

    async fn save(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let _guard = self.lock.write();
        let mut current = self.read_file()?;
        for (key, value) in entries {
            current.insert(key.clone(), value.clone());
        }
        fs::write(&self.path, serde_json::to_string_pretty(&current)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_settings_merge() {
        let store = MemorySettings::with_entries(vec![("a", "1"), ("b", "2")]);
        let update = BTreeMap::from([("b".to_string(), "3".to_string())]);
        store.save(&update).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded["a"], "1");
        assert_eq!(loaded["b"], "3");
    }

    #[tokio::test]
    async fn test_json_file_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"container_expiration": 10, "docker_hostname": "ctf"}"#).unwrap();

        let store = JsonFileSettings::new(&path);
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded["container_expiration"], "10");
        assert_eq!(loaded["docker_hostname"], "ctf");

        let update = BTreeMap::from([("container_maxcpu".to_string(), "2".to_string())]);
        store.save(&update).await.unwrap();
        let reloaded = JsonFileSettings::new(&path).load().await.unwrap();
        assert_eq!(reloaded.len(), 3);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileSettings::new(dir.path().join("absent.json"));
        assert!(store.load().await.unwrap().is_empty());
    }
}
