//! Directory-backed, read-only storage
//!
//! Scans one directory (non-recursively). A file is a package when its
//! extension belongs to a registered content type. Attributes come from the
//! sidecar record when there is one, otherwise the content type describes the
//! file itself. Packages flagged obsolete are hidden.

use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{metadata_path, obsolete_marker, ContentStorage, Snapshot};
use crate::content_type::ContentTypeRegistry;
use crate::digest::DigestStore;
use crate::error::Result;
use crate::item::{ContentItem, ItemMetadata};

pub struct DirectoryStorage {
    path: RwLock<PathBuf>,
    digests: DigestStore,
    registry: Arc<ContentTypeRegistry>,
    items: Snapshot<ContentItem>,
}

impl DirectoryStorage {
    pub fn new(path: PathBuf, digests: DigestStore, registry: Arc<ContentTypeRegistry>) -> Self {
        Self {
            path: RwLock::new(path),
            digests,
            registry,
            items: Snapshot::new(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.path.read().clone()
    }

    pub(crate) fn set_path(&self, path: PathBuf) {
        *self.path.write() = path;
    }

    pub(crate) fn digests(&self) -> &DigestStore {
        &self.digests
    }

    pub(crate) fn registry(&self) -> &ContentTypeRegistry {
        &self.registry
    }

    pub(crate) fn snapshot(&self) -> &Snapshot<ContentItem> {
        &self.items
    }

    fn scan(&self, dir: &Path) -> Result<Vec<ContentItem>> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        files.sort();

        let mut items = Vec::new();
        for path in files {
            if let Some(item) = self.read_package(&path) {
                items.push(item);
            }
        }

        debug!(path = %dir.display(), count = items.len(), "Scanned directory storage");
        Ok(items)
    }

    /// Build an item for one file; `None` when the file is not a usable package
    fn read_package(&self, path: &Path) -> Option<ContentItem> {
        let content_type = self.registry.for_path(path)?;

        if obsolete_marker(path).exists() {
            return None;
        }

        let hash = match self.digests.hash_file(path) {
            Ok(hash) => hash,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Can't hash package, skipping");
                return None;
            }
        };

        let metadata = match read_metadata(path) {
            Some(meta) if self.registry.contains(&meta.content_type) => meta,
            Some(meta) => {
                warn!(
                    path = %path.display(),
                    content_type = %meta.content_type,
                    "Package sidecar names an unknown content type, skipping"
                );
                return None;
            }
            None => content_type.describe(path, &hash)?,
        };

        Some(metadata.into_local_item(path.to_path_buf(), hash))
    }
}

fn read_metadata(package: &Path) -> Option<ItemMetadata> {
    let sidecar = metadata_path(package);
    let json = fs::read_to_string(&sidecar).ok()?;
    match serde_json::from_str(&json) {
        Ok(meta) => Some(meta),
        Err(e) => {
            warn!(path = %sidecar.display(), error = %e, "Ignoring malformed package sidecar");
            None
        }
    }
}

impl ContentStorage for DirectoryStorage {
    fn name(&self) -> &str {
        "directory-storage"
    }

    fn refresh(&self) -> Result<()> {
        let dir = self.path();
        let items = self.scan(&dir)?;
        self.items.publish(items);
        Ok(())
    }

    fn list(&self) -> Arc<Vec<ContentItem>> {
        self.items.load()
    }
}
