//! Key-value storage backends for the script store.
//!
//! The store persists one serialized blob per key. [`FileStorage`] keeps each
//! key in its own JSON file inside the data directory; [`MemoryStorage`] keeps
//! everything in process memory.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid storage key '{0}'")]
    InvalidKey(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Minimal get/set storage the script store is written against.
pub trait KeyValueStore: Send + Sync {
    /// Read the value under `key`, `None` if it was never written.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Replace the value under `key` as a whole.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        (**self).set(key, value)
    }
}

/// Storage backed by `<dir>/<key>.json` files.
///
/// Writes go to a temporary file that is renamed over the target, so readers
/// see either the old or the new blob.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

impl KeyValueStore for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io { path, source }),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;

        fs::create_dir_all(&self.dir).map_err(|source| StorageError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, value).map_err(|source| StorageError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        fs::rename(&tmp_path, &path).map_err(|source| StorageError::Io {
            path: path.clone(),
            source,
        })?;

        Ok(())
    }
}

/// In-process storage. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_storage_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path());

        assert_eq!(storage.get("scripts").unwrap(), None);

        storage.set("scripts", "[1,2,3]").unwrap();
        assert_eq!(storage.get("scripts").unwrap().as_deref(), Some("[1,2,3]"));
        assert!(temp_dir.path().join("scripts.json").exists());
        assert!(!temp_dir.path().join("scripts.json.tmp").exists());

        storage.set("scripts", "[]").unwrap();
        assert_eq!(storage.get("scripts").unwrap().as_deref(), Some("[]"));
    }

    #[test]
    fn test_file_storage_creates_missing_dir() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path().join("nested").join("data"));

        storage.set("scripts", "{}").unwrap();
        assert_eq!(storage.get("scripts").unwrap().as_deref(), Some("{}"));
    }

    #[test]
    fn test_file_storage_persistence() {
        let temp_dir = TempDir::new().unwrap();
        FileStorage::new(temp_dir.path()).set("k", "v").unwrap();

        let reopened = FileStorage::new(temp_dir.path());
        assert_eq!(reopened.get("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_file_storage_rejects_path_keys() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path());

        for key in ["", "../escape", "a/b", ".hidden"] {
            assert!(matches!(
                storage.set(key, "x"),
                Err(StorageError::InvalidKey(_))
            ));
        }
    }

    #[test]
    fn test_memory_storage_shared_through_arc() {
        let storage = Arc::new(MemoryStorage::new());
        let other = Arc::clone(&storage);

        storage.set("k", "v").unwrap();
        assert_eq!(other.get("k").unwrap().as_deref(), Some("v"));
        assert_eq!(other.get("missing").unwrap(), None);
    }
}
