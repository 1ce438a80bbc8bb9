//! Content storages
//!
//! Handles:
//! - Read-only package directories (`DirectoryStorage`)
//! - The content-addressed download target (`WritableDirectoryStorage`)
//! - Remote catalogs (`NetworkStorage`)
//!
//! Every storage publishes its item list as an immutable snapshot. A refresh
//! builds a complete new list and swaps it in; readers keep whatever snapshot
//! they already hold.

pub mod directory;
pub mod network;
pub mod writable;

pub use directory::DirectoryStorage;
pub use network::NetworkStorage;
pub use writable::WritableDirectoryStorage;

use parking_lot::RwLock;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::item::ContentItem;

/// Suffix of the marker that flags a stored package for teardown
pub const OBSOLETE_SUFFIX: &str = ".obsolete";
/// Suffix of the sidecar metadata record of a stored package
pub const METADATA_SUFFIX: &str = ".meta.json";
/// Suffix of in-flight download files
pub const DOWNLOAD_SUFFIX: &str = ".download";

pub trait ContentStorage: Send + Sync {
    fn name(&self) -> &str;

    /// Rebuild the item list from the underlying source
    fn refresh(&self) -> Result<()>;

    /// Latest published snapshot
    fn list(&self) -> Arc<Vec<ContentItem>>;
}

/// Atomically replaced, shared item list
pub struct Snapshot<T> {
    current: RwLock<Arc<Vec<T>>>,
}

impl<T> Default for Snapshot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Snapshot<T> {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn load(&self) -> Arc<Vec<T>> {
        self.current.read().clone()
    }

    pub fn publish(&self, items: Vec<T>) {
        *self.current.write() = Arc::new(items);
    }

    /// Publish a list derived from the current one. The write lock is held
    /// across `f`, so concurrent updates are not lost.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&[T]) -> Vec<T>,
    {
        let mut current = self.current.write();
        let next = f(current.as_slice());
        *current = Arc::new(next);
    }
}

pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

pub fn obsolete_marker(package: &Path) -> PathBuf {
    with_suffix(package, OBSOLETE_SUFFIX)
}

pub fn metadata_path(package: &Path) -> PathBuf {
    with_suffix(package, METADATA_SUFFIX)
}
