//! Local key-value persistence
//!
//! The engine keeps a handful of JSON documents between runs (device,
//! account and account-device attributes, last applied settings). Only
//! `get`/`set` by key is needed, so stores are deliberately small.

use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::debug;

/// Storage errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Key contains characters that cannot name a file
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    /// Underlying I/O failed
    #[error("Storage I/O failed for {key}: {reason}")]
    Io {
        /// Key being accessed
        key: String,
        /// OS error text
        reason: String,
    },

    /// Stored document is not valid JSON
    #[error("Corrupt value for {key}: {reason}")]
    Corrupt {
        /// Key being read
        key: String,
        /// Parser error text
        reason: String,
    },

    /// No home directory to derive the default location from
    #[error("Could not resolve a home directory")]
    NoHomeDir,
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// JSON documents by key
pub trait KeyValueStore: Send + Sync {
    /// Read a value; `None` when never written
    fn get(&self, key: &str) -> StorageResult<Option<Value>>;

    /// Write a value, replacing any previous one
    fn set(&self, key: &str, value: Value) -> StorageResult<()>;
}

/// Process-local store
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> StorageResult<()> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
        Ok(())
    }
}

/// One `<key>.json` file per key under a directory
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Store rooted at `dir`; created on first write
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileStore { dir: dir.into() }
    }

    /// Store under `~/.tether/state`
    pub fn default_location() -> StorageResult<Self> {
        let home = dirs::home_dir().ok_or(StorageError::NoHomeDir)?;
        Ok(Self::new(home.join(".tether").join("state")))
    }

    /// Root directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> StorageResult<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        let path = self.path(key)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StorageError::Io {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    fn set(&self, key: &str, value: Value) -> StorageResult<()> {
        let path = self.path(key)?;
        let io = |e: std::io::Error| StorageError::Io {
            key: key.to_string(),
            reason: e.to_string(),
        };

        fs::create_dir_all(&self.dir).map_err(io)?;
        let json = serde_json::to_vec_pretty(&value).map_err(|e| StorageError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        fs::write(&path, json).map_err(io)?;

        debug!(key, "persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert_eq!(store.get("device").unwrap(), None);

        store.set("device", json!({"address": "0x01"})).unwrap();
        assert_eq!(store.get("device").unwrap(), Some(json!({"address": "0x01"})));

        store.set("device", Value::Null).unwrap();
        assert_eq!(store.get("device").unwrap(), Some(Value::Null));
    }

    #[test]
    fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();

        FileStore::new(dir.path().join("state"))
            .set("settings", json!({"network": "mainnet"}))
            .unwrap();

        let reopened = FileStore::new(dir.path().join("state"));
        assert_eq!(
            reopened.get("settings").unwrap(),
            Some(json!({"network": "mainnet"}))
        );
        assert_eq!(reopened.get("account").unwrap(), None);
    }

    #[test]
    fn test_file_store_rejects_path_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        assert!(matches!(
            store.set("../escape", json!(1)),
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(store.get(""), Err(StorageError::InvalidKey(_))));
    }

    #[test]
    fn test_file_store_corrupt_value() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("account.json"), b"{not json").unwrap();

        let store = FileStore::new(dir.path());
        assert!(matches!(
            store.get("account"),
            Err(StorageError::Corrupt { .. })
        ));
    }
}
