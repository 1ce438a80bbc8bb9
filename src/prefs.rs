//! Persisted preferences
//!
//! The host supplies a plain string key-value store. On top of it this module
//! keeps the per-type activation pointers, the migration history and the
//! current storage root.
//!
//! Keys:
//! - `active-package:<type>` / `active-unpacked:<type>`
//! - `migration-history` (JSON array of paths, oldest first)
//! - `storage-root-path`

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

use crate::error::{ContentError, Result};

const PREFS_TREE: &str = "preferences";
const MIGRATION_HISTORY_KEY: &str = "migration-history";
const STORAGE_ROOT_KEY: &str = "storage-root-path";

/// String map collaborator
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn put(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Preferences kept in a named tree of a sled database
pub struct SledKeyValueStore {
    tree: sled::Tree,
}

impl SledKeyValueStore {
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(PREFS_TREE)?,
        })
    }
}

impl KeyValueStore for SledKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.tree.get(key.as_bytes())? {
            Some(value) => String::from_utf8(value.to_vec())
                .map(Some)
                .map_err(|e| ContentError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.tree.insert(key.as_bytes(), value.as_bytes())?;
        self.tree.flush()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.tree.remove(key.as_bytes())?;
        self.tree.flush()?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryKeyValueStore {
    values: RwLock<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.write().remove(key);
        Ok(())
    }
}

/// Which unpacked dataset is live for a content type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationPointer {
    pub package: PathBuf,
    pub unpacked: PathBuf,
}

/// Typed view over the preference store
#[derive(Clone)]
pub struct Preferences {
    store: Arc<dyn KeyValueStore>,
}

impl Preferences {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn activation(&self, content_type: &str) -> Result<Option<ActivationPointer>> {
        let unpacked = self.store.get(&unpacked_key(content_type))?;
        let package = self.store.get(&package_key(content_type))?;

        match (package, unpacked) {
            (Some(package), Some(unpacked)) => Ok(Some(ActivationPointer {
                package: PathBuf::from(package),
                unpacked: PathBuf::from(unpacked),
            })),
            (None, None) => Ok(None),
            _ => {
                warn!(content_type, "Half-written activation pointer, ignoring");
                Ok(None)
            }
        }
    }

    pub fn set_activation(&self, content_type: &str, pointer: &ActivationPointer) -> Result<()> {
        self.store.put(
            &package_key(content_type),
            &pointer.package.to_string_lossy(),
        )?;
        self.store.put(
            &unpacked_key(content_type),
            &pointer.unpacked.to_string_lossy(),
        )
    }

    pub fn clear_activation(&self, content_type: &str) -> Result<()> {
        self.store.remove(&unpacked_key(content_type))?;
        self.store.remove(&package_key(content_type))
    }

    pub fn migration_history(&self) -> Result<Vec<PathBuf>> {
        match self.store.get(MIGRATION_HISTORY_KEY)? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn set_migration_history(&self, history: &[PathBuf]) -> Result<()> {
        let json = serde_json::to_string(history)?;
        self.store.put(MIGRATION_HISTORY_KEY, &json)
    }

    /// Append `old_root` and drop `new_root`, keeping the order of the rest
    pub fn record_migration(&self, old_root: &Path, new_root: &Path) -> Result<Vec<PathBuf>> {
        let mut history = self.migration_history()?;
        history.retain(|p| p != old_root && p != new_root);
        history.push(old_root.to_path_buf());
        self.set_migration_history(&history)?;
        Ok(history)
    }

    pub fn storage_root(&self) -> Result<Option<PathBuf>> {
        Ok(self.store.get(STORAGE_ROOT_KEY)?.map(PathBuf::from))
    }

    pub fn set_storage_root(&self, root: &Path) -> Result<()> {
        self.store.put(STORAGE_ROOT_KEY, &root.to_string_lossy())
    }
}

fn package_key(content_type: &str) -> String {
    format!("active-package:{content_type}")
}

fn unpacked_key(content_type: &str) -> String {
    format!("active-unpacked:{content_type}")
}
