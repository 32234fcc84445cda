mod keys;
mod preferences;

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
};

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

pub use keys::{active_version_key, install_tracked_key, model_key, SESSION_KEY};
pub use preferences::Preferences;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored value could not be parsed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Durable key to string storage shared by every component of the SDK.
///
/// Writers always hand over complete records. `put_all` commits several keys
/// together so readers never observe half of a multi-key update.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn put_all(&self, entries: &[(String, String)]) -> Result<(), StoreError> {
        for (key, value) in entries {
            self.put(key, value)?;
        }
        Ok(())
    }

    fn delete_all(&self) -> Result<(), StoreError>;
}

/// Process-local store, lost at exit.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.data.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn put_all(&self, entries: &[(String, String)]) -> Result<(), StoreError> {
        let mut guard = self.data.write();
        for (key, value) in entries {
            guard.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn delete_all(&self) -> Result<(), StoreError> {
        self.data.write().clear();
        Ok(())
    }
}

/// Single JSON document on disk. Every write rewrites the whole document
/// through a sibling temp file and a rename.
pub struct FileStore {
    path: PathBuf,
    data: RwLock<BTreeMap<String, String>>,
}

impl FileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = if path.exists() {
            let bytes = fs::read(&path)?;
            if bytes.is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_slice(&bytes)?
            }
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), entries = data.len(), "opened file store");
        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    fn persist(&self, data: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let serialized = serde_json::to_vec_pretty(data)?;
        let staging = self.path.with_extension("tmp");
        fs::write(&staging, serialized)?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut guard = self.data.write();
        let previous = guard.insert(key.to_string(), value.to_string());
        if let Err(error) = self.persist(&guard) {
            match previous {
                Some(previous) => guard.insert(key.to_string(), previous),
                None => guard.remove(key),
            };
            return Err(error);
        }
        Ok(())
    }

    fn put_all(&self, entries: &[(String, String)]) -> Result<(), StoreError> {
        let mut guard = self.data.write();
        let mut next = guard.clone();
        for (key, value) in entries {
            next.insert(key.clone(), value.clone());
        }
        self.persist(&next)?;
        *guard = next;
        Ok(())
    }

    fn delete_all(&self) -> Result<(), StoreError> {
        let mut guard = self.data.write();
        self.persist(&BTreeMap::new())?;
        guard.clear();
        Ok(())
    }
}
