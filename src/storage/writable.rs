//! Writable, content-addressed download target
//!
//! Directory structure:
//!   <root>/storage/
//!     ├── <hash>.ghz                    # Stored package
//!     ├── <hash>.ghz.meta.json          # Catalog attributes of the package
//!     ├── <hash>.ghz.obsolete           # Teardown flag set by delete
//!     └── <hash>.ghz.<uuid>.download    # In-flight download
//!
//! A package only ever appears under its final name through a rename of a
//! fully written and verified temporary file.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::{
    metadata_path, obsolete_marker, ContentStorage, DirectoryStorage, DOWNLOAD_SUFFIX,
    METADATA_SUFFIX, OBSOLETE_SUFFIX,
};
use crate::content_type::ContentTypeRegistry;
use crate::digest::DigestStore;
use crate::error::{ContentError, Result};
use crate::fs_util::{self, DeletionGuard};
use crate::item::{ContentItem, ItemMetadata};

pub struct WritableDirectoryStorage {
    inner: DirectoryStorage,
}

impl WritableDirectoryStorage {
    pub fn new(
        path: PathBuf,
        digests: DigestStore,
        registry: Arc<ContentTypeRegistry>,
    ) -> Result<Self> {
        fs::create_dir_all(&path)?;
        remove_stale_downloads(&path);

        Ok(Self {
            inner: DirectoryStorage::new(path, digests, registry),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.inner.path()
    }

    /// Stream a remote package into the storage.
    ///
    /// The reader is expected to verify itself (see `DigestReader`); any read
    /// error aborts the store and removes the temporary file.
    pub fn store(&self, remote: &ContentItem, input: &mut dyn Read) -> Result<ContentItem> {
        let content_type = self
            .inner
            .registry()
            .get(&remote.content_type)
            .ok_or_else(|| ContentError::UnknownContentType(remote.content_type.clone()))?;

        let hash = remote.hash.to_lowercase();
        let dir = self.path();
        fs::create_dir_all(&dir)?;

        let file_name = format!("{}{}", hash, content_type.extension());
        let target = dir.join(&file_name);
        let temp = dir.join(format!(
            "{}.{}{}",
            file_name,
            uuid::Uuid::new_v4(),
            DOWNLOAD_SUFFIX
        ));

        if let Err(e) = write_stream(&temp, input) {
            fs::remove_file(&temp).ok();
            return Err(ContentError::from_pipeline(e));
        }

        let metadata = ItemMetadata::from_item(remote);
        if let Err(e) = write_metadata(&target, &metadata).and_then(|_| {
            fs::rename(&temp, &target)?;
            Ok(())
        }) {
            fs::remove_file(&temp).ok();
            return Err(e);
        }

        // A re-download revives a package that was deleted but not yet reclaimed
        fs::remove_file(obsolete_marker(&target)).ok();
        self.inner.digests().record(&target, &hash)?;

        let local = metadata.into_local_item(target.clone(), hash);
        let stored = local.clone();
        self.inner.snapshot().update(|items| {
            let mut next: Vec<ContentItem> = items
                .iter()
                .filter(|i| i.local_path() != Some(target.as_path()))
                .cloned()
                .collect();
            next.push(stored);
            next
        });

        info!(name = %local.name, path = %target.display(), "Stored content item");
        Ok(local)
    }

    /// Flag a stored package for teardown at the next garbage collection
    pub fn mark_obsolete(&self, item: &ContentItem) -> Result<()> {
        let package = self.owned_package(item)?;
        fs::write(obsolete_marker(&package), b"")?;

        self.inner.snapshot().update(|items| {
            items
                .iter()
                .filter(|i| i.local_path() != Some(package.as_path()))
                .cloned()
                .collect()
        });

        info!(name = %item.name, "Marked content item obsolete");
        Ok(())
    }

    /// Remove a stored package and its companions right away
    pub fn delete(&self, item: &ContentItem, guard: &DeletionGuard) -> Result<()> {
        let package = self.owned_package(item)?;
        self.remove_package(&package, guard)?;

        self.inner.snapshot().update(|items| {
            items
                .iter()
                .filter(|i| i.local_path() != Some(package.as_path()))
                .cloned()
                .collect()
        });
        Ok(())
    }

    /// Reclaim packages flagged obsolete unless they are listed in `keep`,
    /// plus companion files whose package is gone. Returns the number of
    /// packages removed.
    pub fn purge_obsolete(&self, keep: &[PathBuf], guard: &DeletionGuard) -> Result<usize> {
        let dir = self.path();
        let mut removed = 0;

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if let Some(package_name) = name.strip_suffix(OBSOLETE_SUFFIX) {
                let package = dir.join(package_name);
                if keep.iter().any(|k| fs_util::is_ancestor(k, &package)) {
                    continue;
                }
                if package.exists() {
                    self.remove_package(&package, guard)?;
                    removed += 1;
                } else {
                    guard.remove_file(&path)?;
                }
            } else if let Some(package_name) = name.strip_suffix(METADATA_SUFFIX) {
                if !dir.join(package_name).exists() {
                    guard.remove_file(&path)?;
                }
            }
        }

        if removed > 0 {
            info!(removed, "Purged obsolete packages");
        }
        Ok(removed)
    }

    /// Point the storage at a new directory (after the tree was copied there)
    pub fn migrate(&self, new_path: PathBuf) -> Result<()> {
        fs::create_dir_all(&new_path)?;
        info!(path = %new_path.display(), "Writable storage relocated");
        self.inner.set_path(new_path);
        Ok(())
    }

    fn owned_package(&self, item: &ContentItem) -> Result<PathBuf> {
        let package = item
            .local_path()
            .ok_or_else(|| ContentError::NotFound(item.name.clone()))?;

        if !fs_util::is_ancestor(&self.path(), package) {
            return Err(ContentError::NotFound(item.name.clone()));
        }
        Ok(package.to_path_buf())
    }

    fn remove_package(&self, package: &Path, guard: &DeletionGuard) -> Result<()> {
        guard.remove_file(package)?;
        guard.remove_file(&metadata_path(package))?;
        guard.remove_file(&obsolete_marker(package))?;
        self.inner.digests().forget(package)?;
        info!(path = %package.display(), "Removed stored package");
        Ok(())
    }
}

impl ContentStorage for WritableDirectoryStorage {
    fn name(&self) -> &str {
        "writable-directory-storage"
    }

    fn refresh(&self) -> Result<()> {
        self.inner.refresh()
    }

    fn list(&self) -> Arc<Vec<ContentItem>> {
        self.inner.list()
    }
}

fn write_stream(temp: &Path, input: &mut dyn Read) -> io::Result<()> {
    let mut output = fs::File::create(temp)?;
    io::copy(input, &mut output)?;
    output.flush()?;
    output.sync_all()
}

fn write_metadata(package: &Path, metadata: &ItemMetadata) -> Result<()> {
    let sidecar = metadata_path(package);
    let temp = super::with_suffix(&sidecar, DOWNLOAD_SUFFIX);
    fs::write(&temp, serde_json::to_vec_pretty(metadata)?)?;
    fs::rename(&temp, &sidecar)?;
    Ok(())
}

/// Leftovers of downloads interrupted by a crash. Only safe before any
/// download of this process has started.
fn remove_stale_downloads(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(DOWNLOAD_SUFFIX))
        {
            warn!(path = %path.display(), "Removing stale download");
            fs::remove_file(&path).ok();
        }
    }
}
