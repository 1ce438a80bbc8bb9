//! Content manager
//!
//! Composes the storages, the content type registry, the region cache and
//! the preference store into the package lifecycle:
//!
//! ```text
//! remote --download--> stored --unpack--> unpacked --activate--> active
//!                        |                                         |
//!                        +--delete--> obsolete <-------------------+
//!                                        |
//!                                        +--garbage_collect--> reclaimed
//! ```
//!
//! All calls block. Activation, unpacking, garbage collection and migration
//! share one critical section; downloads and list refreshes run concurrently
//! with each other and with readers. A migration additionally waits for
//! in-flight downloads and holds off new ones until the root has moved.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{self, Config};
use crate::content_type::{ContentType, ContentTypeRegistry};
use crate::digest::{DigestAlgorithm, DigestReader, DigestStore};
use crate::error::{ContentError, Result};
use crate::fs_util::{self, DeletionGuard};
use crate::item::{Compression, ContentItem, ItemSource};
use crate::prefs::{ActivationPointer, KeyValueStore, Preferences, SledKeyValueStore};
use crate::progress::{ProgressListener, ProgressReader};
use crate::region::{GeoPoint, Region, RegionCache};
use crate::storage::{
    obsolete_marker, ContentStorage, DirectoryStorage, NetworkStorage, Snapshot,
    WritableDirectoryStorage,
};
use crate::transport::{HttpTransport, Transport};
use crate::unpack::UnpackedDir;

/// Everything the manager needs from its host
pub struct Collaborators {
    pub registry: ContentTypeRegistry,
    pub preferences: Arc<dyn KeyValueStore>,
    pub digests: DigestStore,
    pub transport: Arc<dyn Transport>,
}

impl Collaborators {
    /// Production wiring: sled-backed state, HTTP transport, shipped types
    pub fn open(config: &Config) -> Result<Self> {
        if let Some(parent) = config.state_db.parent() {
            fs::create_dir_all(parent)?;
        }
        let db = sled::open(&config.state_db)?;

        Ok(Self {
            registry: ContentTypeRegistry::with_defaults(),
            preferences: Arc::new(SledKeyValueStore::open(&db)?),
            digests: DigestStore::open(&db, config.digest_algorithm)?,
            transport: Arc::new(HttpTransport::new(Duration::from_secs(
                config.http_timeout_secs,
            ))?),
        })
    }
}

/// What a garbage collection pass reclaimed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcReport {
    /// Content types whose activation was torn down
    pub deactivated: Vec<String>,
    /// Former storage roots deleted
    pub removed_roots: Vec<PathBuf>,
    /// Unpacked directories deleted
    pub removed_unpacked: usize,
    /// Stored packages deleted
    pub removed_packages: usize,
}

pub struct ContentManager {
    config: Config,
    registry: Arc<ContentTypeRegistry>,
    regions: Arc<RegionCache>,
    prefs: Preferences,
    transport: Arc<dyn Transport>,
    root: RwLock<PathBuf>,
    writable: WritableDirectoryStorage,
    additional: Vec<DirectoryStorage>,
    network: NetworkStorage,
    local_items: Snapshot<ContentItem>,
    digest_algorithm: DigestAlgorithm,
    lifecycle: Mutex<()>,
    /// Shared by downloads while they write into the root, exclusive for migration
    relocation: RwLock<()>,
}

impl ContentManager {
    pub fn open(config: Config) -> Result<Self> {
        let collaborators = Collaborators::open(&config)?;
        Self::new(config, collaborators)
    }

    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        let Collaborators {
            registry,
            preferences,
            digests,
            transport,
        } = collaborators;

        let registry = Arc::new(registry);
        let regions = Arc::new(RegionCache::new());
        let prefs = Preferences::new(preferences);

        let configured = prefs
            .storage_root()?
            .unwrap_or_else(|| config.storage_root.clone());
        let root = absolute(&configured)?;
        prefs.set_storage_root(&root)?;

        let mut history = prefs.migration_history()?;
        let before = history.len();
        history.retain(|p| p != &root);
        if history.len() != before {
            warn!(root = %root.display(), "Current root found in migration history, dropping it");
            prefs.set_migration_history(&history)?;
        }

        let digest_algorithm = digests.algorithm();
        if digest_algorithm != config.digest_algorithm {
            warn!(
                configured = ?config.digest_algorithm,
                store = ?digest_algorithm,
                "Digest store algorithm differs from the configured one, using the store's"
            );
        }

        let writable = WritableDirectoryStorage::new(
            config::storage_dir(&root),
            digests.clone(),
            registry.clone(),
        )?;

        let additional = config
            .additional_storage_dirs
            .iter()
            .map(|dir| DirectoryStorage::new(dir.clone(), digests.clone(), registry.clone()))
            .collect();

        let network = NetworkStorage::new(
            config.catalog_urls.clone(),
            transport.clone(),
            registry.clone(),
            regions.clone(),
            config.max_catalog_depth,
        );

        let manager = Self {
            config,
            registry,
            regions,
            prefs,
            transport,
            root: RwLock::new(root),
            writable,
            additional,
            network,
            local_items: Snapshot::new(),
            digest_algorithm,
            lifecycle: Mutex::new(()),
            relocation: RwLock::new(()),
        };

        info!(root = %manager.storage_root().display(), "Content manager ready");

        manager.refresh_local_items()?;
        if manager.config.load_region_bundles {
            manager.load_active_region_bundles();
        }

        Ok(manager)
    }

    pub fn storage_root(&self) -> PathBuf {
        self.root.read().clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &ContentTypeRegistry {
        &self.registry
    }

    pub fn regions(&self) -> &RegionCache {
        &self.regions
    }

    fn unpack_root(&self) -> PathBuf {
        config::unpacked_dir(&self.storage_root())
    }

    // ========================================================================
    // Lists
    // ========================================================================

    pub fn local_items(&self) -> Arc<Vec<ContentItem>> {
        self.local_items.load()
    }

    pub fn remote_items(&self) -> Arc<Vec<ContentItem>> {
        self.network.list()
    }

    /// Rescan the writable storage (failure surfaced) and every additional
    /// storage (failures logged and skipped), then publish the merged list.
    pub fn refresh_local_items(&self) -> Result<Arc<Vec<ContentItem>>> {
        if let Err(e) = self.writable.refresh() {
            error!(storage = self.writable.name(), error = %e, "Failed to refresh storage");
            return Err(e);
        }

        let mut items: Vec<ContentItem> = (*self.writable.list()).clone();
        for storage in &self.additional {
            match storage.refresh() {
                Ok(()) => items.extend(storage.list().iter().cloned()),
                Err(e) => warn!(
                    storage = storage.name(),
                    path = %storage.path().display(),
                    error = %e,
                    "Failed to refresh additional storage, skipping"
                ),
            }
        }

        debug!(count = items.len(), "Local content list refreshed");
        self.local_items.publish(items);
        Ok(self.local_items.load())
    }

    /// Refresh the remote snapshot from `roots`. Only items of known content
    /// types are kept.
    pub fn refresh_remote_content_list(&self, roots: &[String]) -> Result<Arc<Vec<ContentItem>>> {
        self.network.refresh_roots(roots.to_vec())?;
        let items = self.network.list();
        info!(
            storage = self.network.name(),
            count = items.len(),
            "Remote content list refreshed"
        );
        Ok(items)
    }

    /// Whether some item exists both locally and remotely with a different hash
    pub fn check_updates(&self) -> bool {
        let local = self.local_items();
        let remote = self.remote_items();

        let by_name: HashMap<&str, &ContentItem> =
            local.iter().map(|i| (i.name.as_str(), i)).collect();

        remote.iter().any(|remote_item| {
            by_name
                .get(remote_item.name.as_str())
                .is_some_and(|local_item| !local_item.hash_matches(remote_item))
        })
    }

    // ========================================================================
    // Region lookup
    // ========================================================================

    /// Local items whose coverage contains `point`
    pub fn find_content_items_by_region(&self, point: GeoPoint) -> Vec<ContentItem> {
        self.local_items()
            .iter()
            .filter(|item| self.local_item_covers(item, point))
            .cloned()
            .collect()
    }

    /// Remote items whose cached region contains `point`
    pub fn find_suggested_items(&self, point: GeoPoint) -> Vec<ContentItem> {
        self.remote_items()
            .iter()
            .filter(|item| {
                item.region_id
                    .as_deref()
                    .and_then(|id| self.regions.get_region(id))
                    .is_some_and(|region| region.test_hit(point))
            })
            .cloned()
            .collect()
    }

    fn local_item_covers(&self, item: &ContentItem, point: GeoPoint) -> bool {
        let (Some(content_type), Some(package)) =
            (self.registry.get(&item.content_type), item.local_path())
        else {
            return false;
        };

        match self.resolve_region(item, package) {
            Some(region) => region.test_hit(point),
            None => content_type.check_region(item, package, point),
        }
    }

    fn resolve_region(&self, item: &ContentItem, package: &Path) -> Option<Arc<Region>> {
        let region_id = item.region_id.as_deref().unwrap_or(&item.name);
        if let Some(region) = self.regions.get_region(region_id) {
            return Some(region);
        }

        let region = self
            .registry
            .get(&item.content_type)?
            .extract_region(item, package)?;
        Some(self.regions.put_region(region_id, region))
    }

    // ========================================================================
    // Download
    // ========================================================================

    /// Fetch, verify and store a remote item.
    ///
    /// transport -> progress/cancel -> optional gunzip -> digest check -> store
    pub fn download_content_item(
        &self,
        remote: &ContentItem,
        listener: Option<ProgressListener>,
        cancel: CancellationToken,
    ) -> Result<ContentItem> {
        let ItemSource::Remote {
            url,
            size,
            compression,
        } = &remote.source
        else {
            return Err(ContentError::NotFound(format!(
                "{} is not a remote item",
                remote.name
            )));
        };

        if let Some(existing) = self.stored_copy(remote) {
            info!(name = %remote.name, "Content item already downloaded and verified");
            return Ok(existing);
        }

        let stored = {
            let _root = self.relocation.read();
            info!(name = %remote.name, url = %url, "Downloading content item");

            self.transport.open(url).and_then(|connection| {
                let metered = ProgressReader::new(
                    connection,
                    *size,
                    self.config.progress_step_bytes,
                    listener,
                    cancel,
                );
                let decoded: Box<dyn Read + Send> = match compression {
                    Compression::Gzip => {
                        debug!(name = %remote.name, "Using gzip compression");
                        Box::new(flate2::read::GzDecoder::new(metered))
                    }
                    Compression::None => Box::new(metered),
                };
                let mut verified =
                    DigestReader::new(decoded, &remote.hash, self.digest_algorithm);
                self.writable.store(remote, &mut verified)
            })
        };

        let local = match stored {
            Ok(local) => local,
            Err(e) => {
                warn!(name = %remote.name, error = %e, "Download failed");
                return Err(e);
            }
        };

        self.refresh_local_items()?;
        Ok(local)
    }

    fn stored_copy(&self, remote: &ContentItem) -> Option<ContentItem> {
        self.writable
            .list()
            .iter()
            .find(|local| {
                local.content_type == remote.content_type && local.hash_matches(remote)
            })
            .cloned()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Extract a stored package; a no-op when it already is. Returns the
    /// unpacked directory.
    pub fn unpack_content_item(&self, item: &ContentItem) -> Result<PathBuf> {
        let _lock = self.lifecycle.lock();
        let (content_type, package) = self.local_package(item)?;

        let unpacked = UnpackedDir::for_item(&self.unpack_root(), item);
        if unpacked.is_unpacked() {
            debug!(name = %item.name, "Content item already unpacked");
            return Ok(unpacked.path().to_path_buf());
        }

        fs::create_dir_all(unpacked.path())?;
        info!(name = %item.name, dest = %unpacked.path().display(), "Unpacking content item");

        if let Err(source) = content_type.unpack(item, &package, unpacked.path()) {
            error!(name = %item.name, error = %source, "Unpacking failed");
            return Err(ContentError::Extraction {
                name: item.name.clone(),
                source,
            });
        }
        unpacked.mark_unpacked(&item.hash)?;

        if self.config.load_region_bundles {
            if let Some(bundle) = content_type.region_bundle(unpacked.path()) {
                if let Err(e) = self.regions.bulk_load(&bundle) {
                    warn!(path = %bundle.display(), error = %e, "Failed to load region bundle");
                }
            }
        }

        Ok(unpacked.path().to_path_buf())
    }

    /// Make an unpacked item the live dataset of its type. `None` when the
    /// item has not been unpacked yet.
    pub fn activate_content_item(&self, item: &ContentItem) -> Result<Option<PathBuf>> {
        let _lock = self.lifecycle.lock();
        let (_, package) = self.local_package(item)?;

        let unpacked = UnpackedDir::for_item(&self.unpack_root(), item);
        if !unpacked.is_unpacked() {
            return Ok(None);
        }

        let pointer = ActivationPointer {
            package,
            unpacked: unpacked.path().to_path_buf(),
        };
        self.prefs.set_activation(&item.content_type, &pointer)?;

        info!(
            name = %item.name,
            content_type = %item.content_type,
            "Activated content item"
        );
        Ok(Some(pointer.unpacked))
    }

    pub fn active_package(&self, content_type: &str) -> Result<Option<PathBuf>> {
        Ok(self.prefs.activation(content_type)?.map(|p| p.package))
    }

    pub fn active_unpacked(&self, content_type: &str) -> Result<Option<PathBuf>> {
        Ok(self.prefs.activation(content_type)?.map(|p| p.unpacked))
    }

    /// Flag a stored item obsolete. Returns `false` (state unchanged) when
    /// the flag can't be written.
    pub fn delete_content_item(&self, item: &ContentItem) -> bool {
        if let Err(e) = self.writable.mark_obsolete(item) {
            warn!(name = %item.name, error = %e, "Failed to delete content item");
            return false;
        }

        if let Err(e) = self.refresh_local_items() {
            warn!(error = %e, "Failed to refresh local content list");
        }
        true
    }

    /// Reclaim everything no activation pointer or current root still needs
    pub fn garbage_collect(&self) -> Result<GcReport> {
        let _lock = self.lifecycle.lock();
        let root = self.storage_root();
        let mut history = self.prefs.migration_history()?;
        let guard = DeletionGuard::new(std::iter::once(&root).chain(history.iter()));
        let mut report = GcReport::default();

        // Tear down obsolete activations, collect the live ones
        let mut active_packages = Vec::new();
        let mut active_unpacked = Vec::new();
        for content_type in self.registry.names() {
            let Some(pointer) = self.prefs.activation(&content_type)? else {
                continue;
            };

            if obsolete_marker(&pointer.package).exists() {
                if guard.permits(&pointer.unpacked) {
                    guard.remove_dir(&pointer.unpacked)?;
                } else {
                    warn!(
                        path = %pointer.unpacked.display(),
                        "Active dataset lies outside the managed trees, leaving it on disk"
                    );
                }
                self.prefs.clear_activation(&content_type)?;
                info!(content_type = %content_type, "Deactivated obsolete content");
                report.deactivated.push(content_type);
            } else {
                active_packages.push(pointer.package);
                active_unpacked.push(pointer.unpacked);
            }
        }

        // Former roots nothing active lives in
        let live = |dir: &Path| {
            active_packages
                .iter()
                .chain(active_unpacked.iter())
                .any(|p| fs_util::is_ancestor(dir, p))
        };
        let before = history.clone();
        history.retain(|old_root| {
            if !old_root.exists() {
                return false;
            }
            if live(old_root.as_path()) {
                return true;
            }
            match remove_managed_tree(old_root, &guard) {
                Ok(()) => {
                    info!(root = %old_root.display(), "Reclaimed former storage root");
                    report.removed_roots.push(old_root.clone());
                    false
                }
                Err(e) => {
                    warn!(root = %old_root.display(), error = %e, "Failed to reclaim former root");
                    true
                }
            }
        });
        if history != before {
            self.prefs.set_migration_history(&history)?;
        }

        // Unpacked datasets that are not active
        let unpack_root = config::unpacked_dir(&root);
        if unpack_root.is_dir() {
            for entry in fs::read_dir(&unpack_root)? {
                let dir = entry?.path();
                if !dir.is_dir() || active_unpacked.iter().any(|a| same_path(a, &dir)) {
                    continue;
                }
                if guard.remove_dir(&dir)? {
                    report.removed_unpacked += 1;
                }
            }
        }

        // Obsolete packages
        report.removed_packages = self.writable.purge_obsolete(&active_packages, &guard)?;

        self.refresh_local_items()?;
        info!(
            deactivated = report.deactivated.len(),
            roots = report.removed_roots.len(),
            unpacked = report.removed_unpacked,
            packages = report.removed_packages,
            "Garbage collection finished"
        );
        Ok(report)
    }

    /// Copy the whole storage tree to `new_root` and switch to it, activation
    /// pointers included. On failure everything created under `new_root` is
    /// removed and nothing changes.
    pub fn migrate(&self, new_root: &Path) -> Result<()> {
        let _lock = self.lifecycle.lock();
        let _relocation = self.relocation.write();
        let old_root = self.storage_root();
        let new_root = absolute(new_root)?;

        if new_root == old_root {
            return Ok(());
        }
        if fs_util::is_ancestor(&old_root, &new_root) {
            return Err(ContentError::Migration(format!(
                "{} lies inside the current root",
                new_root.display()
            )));
        }

        info!(from = %old_root.display(), to = %new_root.display(), "Migrating storage root");

        let mut activations = Vec::new();
        for content_type in self.registry.names() {
            if let Some(pointer) = self.prefs.activation(&content_type)? {
                activations.push((content_type, pointer));
            }
        }

        let created_root = !new_root.exists();
        let fresh: Vec<PathBuf> = match fs::read_dir(&old_root) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| new_root.join(e.file_name()))
                .filter(|target| !target.exists())
                .collect(),
            Err(e) => return Err(ContentError::Migration(e.to_string())),
        };

        if let Err(e) = fs_util::copy_dir(&old_root, &new_root) {
            error!(error = %e, "Can't migrate storage root, rolling back");
            roll_back_copy(&new_root, &fresh, created_root);
            return Err(ContentError::Migration(e.to_string()));
        }

        self.writable.migrate(config::storage_dir(&new_root))?;
        for (content_type, pointer) in &activations {
            let moved = ActivationPointer {
                package: rebase(&pointer.package, &old_root, &new_root),
                unpacked: rebase(&pointer.unpacked, &old_root, &new_root),
            };
            if &moved != pointer {
                debug!(content_type = %content_type, "Moving activation to the new root");
                self.prefs.set_activation(content_type, &moved)?;
            }
        }
        self.prefs.record_migration(&old_root, &new_root)?;
        self.prefs.set_storage_root(&new_root)?;
        *self.root.write() = new_root;

        self.refresh_local_items()?;
        info!("Storage root migrated");
        Ok(())
    }

    fn local_package(
        &self,
        item: &ContentItem,
    ) -> Result<(Arc<dyn ContentType>, PathBuf)> {
        let content_type = self
            .registry
            .get(&item.content_type)
            .cloned()
            .ok_or_else(|| ContentError::UnknownContentType(item.content_type.clone()))?;
        let package = item
            .local_path()
            .ok_or_else(|| ContentError::NotFound(item.name.clone()))?;
        Ok((content_type, package.to_path_buf()))
    }

    fn load_active_region_bundles(&self) {
        for content_type in self.registry.iter() {
            let unpacked = match self.prefs.activation(content_type.name()) {
                Ok(Some(pointer)) => pointer.unpacked,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "Failed to read activation pointer");
                    continue;
                }
            };

            if let Some(bundle) = content_type.region_bundle(&unpacked) {
                if let Err(e) = self.regions.bulk_load(&bundle) {
                    warn!(path = %bundle.display(), error = %e, "Failed to load region bundle");
                }
            }
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    fs_util::normalize(path).ok_or_else(|| {
        ContentError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid storage root {}", path.display()),
        ))
    })
}

fn same_path(a: &Path, b: &Path) -> bool {
    fs_util::normalize(a) == fs_util::normalize(b)
}

/// `path` moved from below `from` to below `to`; paths elsewhere stay put
fn rebase(path: &Path, from: &Path, to: &Path) -> PathBuf {
    match path.strip_prefix(from) {
        Ok(relative) => to.join(relative),
        Err(_) => path.to_path_buf(),
    }
}

/// Remove what a failed migration created under `new_root`
fn roll_back_copy(new_root: &Path, created: &[PathBuf], created_root: bool) {
    let mut guard = DeletionGuard::default();
    guard.allow(new_root);

    for target in created {
        let removed = if target.is_dir() {
            guard.remove_dir(target).map(|_| ())
        } else if target.exists() {
            guard.remove_file(target).map(|_| ())
        } else {
            Ok(())
        };
        if let Err(e) = removed {
            warn!(path = %target.display(), error = %e, "Failed to roll back migration copy");
        }
    }

    if created_root {
        fs::remove_dir(new_root).ok();
    }
}

/// Remove the managed subtrees of a former root, then the root itself if
/// nothing else lives there
fn remove_managed_tree(root: &Path, guard: &DeletionGuard) -> std::io::Result<()> {
    guard.remove_dir(&config::storage_dir(root))?;
    guard.remove_dir(&config::unpacked_dir(root))?;
    if let Err(e) = fs::remove_dir(root) {
        debug!(root = %root.display(), error = %e, "Former root not empty, keeping it");
    }
    Ok(())
}
