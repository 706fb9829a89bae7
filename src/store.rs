use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode store contents: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("stored value under `{key}` is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOptions {
    pub expire_after_seconds: Option<i64>,
}

impl PutOptions {
    pub fn expiring_after(seconds: i64) -> Self {
        Self {
            expire_after_seconds: Some(seconds),
        }
    }
}

/// Keyed string storage with optional per-entry expiry.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn put(&self, key: &str, value: String, options: PutOptions) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Fetch and decode a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}

pub async fn put_json<T: Serialize>(
    store: &dyn StateStore,
    key: &str,
    value: &T,
    options: PutOptions,
) -> Result<(), StoreError> {
    let encoded = serde_json::to_string(value)?;
    store.put(key, encoded, options).await
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-memory store, optionally snapshotted to `<data_dir>/<name>.json` after
/// every mutation.
pub struct KvStore {
    name: String,
    entries: RwLock<HashMap<String, Entry>>,
    data_dir: Option<PathBuf>,
}

impl KvStore {
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
            data_dir: None,
        }
    }

    pub fn persistent(name: impl Into<String>, data_dir: PathBuf) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
            data_dir: Some(data_dir),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn snapshot_path(&self) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", self.name)))
    }

    /// Load a previous snapshot, dropping entries that expired meanwhile.
    pub async fn load(&self) -> Result<usize, StoreError> {
        let Some(path) = self.snapshot_path() else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.display().to_string(),
                source,
            })?;
        let loaded: HashMap<String, Entry> =
            serde_json::from_str(&content).map_err(|e| StoreError::Corrupt {
                key: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let now = Utc::now();
        let mut entries = self.entries.write().await;
        entries.extend(loaded.into_iter().filter(|(_, entry)| entry.is_live(now)));
        Ok(entries.len())
    }

    async fn save(&self, entries: &HashMap<String, Entry>) -> Result<(), StoreError> {
        let Some(path) = self.snapshot_path() else {
            return Ok(());
        };
        let io_err = |source| StoreError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
        }
        let content = serde_json::to_string_pretty(entries)?;
        tokio::fs::write(&path, content).await.map_err(io_err)
    }

    /// Live keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl StateStore for KvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Utc::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: purge lazily.
        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            entries.remove(key);
            self.save(&entries).await?;
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: String, options: PutOptions) -> Result<(), StoreError> {
        let expires_at = options
            .expire_after_seconds
            .map(|secs| Utc::now() + Duration::seconds(secs));
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), Entry { value, expires_at });
        self.save(&entries).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        if entries.remove(key).is_some() {
            self.save(&entries).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete() {
        let store = KvStore::in_memory("state");
        assert_eq!(store.get("k").await.unwrap(), None);

        store.put("k", "v".to_string(), PutOptions::default()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        store.put("k", "w".to_string(), PutOptions::default()).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("w".to_string()));

        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);

        // Deleting a missing key is not an error.
        store.delete("k").await.unwrap();
    }

    #[tokio::test]
    async fn expired_entries_are_invisible() {
        let store = KvStore::in_memory("state");
        store
            .put("gone", "v".to_string(), PutOptions::expiring_after(-1))
            .await
            .unwrap();
        store
            .put("kept", "v".to_string(), PutOptions::expiring_after(3600))
            .await
            .unwrap();

        assert_eq!(store.get("gone").await.unwrap(), None);
        assert_eq!(store.get("kept").await.unwrap(), Some("v".to_string()));
        assert_eq!(store.keys().await, vec!["kept".to_string()]);
    }

    #[tokio::test]
    async fn snapshot_survives_reload() {
        let dir = tempfile::tempdir().unwrap();

        let store = KvStore::persistent("state", dir.path().to_path_buf());
        store.put("a", "1".to_string(), PutOptions::default()).await.unwrap();
        store
            .put("b", "2".to_string(), PutOptions::expiring_after(3600))
            .await
            .unwrap();
        store
            .put("c", "3".to_string(), PutOptions::expiring_after(-1))
            .await
            .unwrap();
        assert!(dir.path().join("state.json").exists());

        let reloaded = KvStore::persistent("state", dir.path().to_path_buf());
        assert_eq!(reloaded.load().await.unwrap(), 2);
        assert_eq!(reloaded.get("a").await.unwrap(), Some("1".to_string()));
        assert_eq!(reloaded.get("b").await.unwrap(), Some("2".to_string()));
        assert_eq!(reloaded.get("c").await.unwrap(), None);
    }

    #[tokio::test]
    async fn load_without_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::persistent("missing", dir.path().to_path_buf());
        assert_eq!(store.load().await.unwrap(), 0);
        assert_eq!(KvStore::in_memory("mem").load().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn corrupt_json_is_reported_with_key() {
        let store = KvStore::in_memory("state");
        store.put("k", "{not json".to_string(), PutOptions::default()).await.unwrap();
        let err = get_json::<serde_json::Value>(&store, "k").await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { ref key, .. } if key == "k"));
    }

    #[tokio::test]
    async fn json_helpers_round_trip() {
        let store = KvStore::in_memory("state");
        put_json(&store, "k", &vec![1, 2, 3], PutOptions::default()).await.unwrap();
        let value: Option<Vec<u32>> = get_json(&store, "k").await.unwrap();
        assert_eq!(value, Some(vec![1, 2, 3]));
    }
}
