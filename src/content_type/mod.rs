//! Pluggable content types
//!
//! Everything type-specific about a package (how to read its coverage, how
//! to unpack it, what its files are called) lives behind [`ContentType`].
//! The manager looks capabilities up by type key and never branches on the
//! key itself.

pub mod graphhopper;
pub mod mapsforge;

pub use graphhopper::GraphhopperContentType;
pub use mapsforge::MapsforgeContentType;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::item::{ContentItem, ItemMetadata};
use crate::region::{GeoPoint, Region};

pub const GRAPHHOPPER_MAP: &str = "graphhopper-map";
pub const MAPSFORGE_MAP: &str = "mapsforge-map";

pub trait ContentType: Send + Sync {
    /// Type key used by catalogs and activation pointers
    fn name(&self) -> &str;

    /// File extension of stored packages, including the dot
    fn extension(&self) -> &str;

    /// Coverage boundary of a package, if the type can expose one
    fn extract_region(&self, item: &ContentItem, package: &Path) -> Option<Region>;

    /// Direct containment test for types that cannot produce a reusable region
    fn check_region(&self, item: &ContentItem, package: &Path, point: GeoPoint) -> bool {
        self.extract_region(item, package)
            .is_some_and(|region| region.test_hit(point))
    }

    /// Extract a package into `dest`
    fn unpack(&self, item: &ContentItem, package: &Path, dest: &Path) -> io::Result<()>;

    /// Attributes of a package file found without a sidecar record
    fn describe(&self, package: &Path, hash: &str) -> Option<ItemMetadata> {
        let name = package.file_name()?.to_str()?.to_string();
        let stem = package.file_stem()?.to_str()?.to_string();
        Some(ItemMetadata {
            name,
            content_type: self.name().to_string(),
            hash: hash.to_string(),
            description: stem.clone(),
            region_id: Some(stem),
        })
    }

    /// Directory of precomputed region files inside an unpacked dataset
    fn region_bundle(&self, _unpacked: &Path) -> Option<PathBuf> {
        None
    }
}

/// Type key to capability lookup
#[derive(Clone, Default)]
pub struct ContentTypeRegistry {
    types: HashMap<String, Arc<dyn ContentType>>,
}

impl ContentTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every content type shipped in this crate
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(GraphhopperContentType::new()));
        registry.register(Arc::new(MapsforgeContentType::new()));
        registry
    }

    pub fn register(&mut self, content_type: Arc<dyn ContentType>) {
        self.types
            .insert(content_type.name().to_string(), content_type);
    }

    pub fn get(&self, key: &str) -> Option<&Arc<dyn ContentType>> {
        self.types.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.types.contains_key(key)
    }

    /// Content type whose package extension matches `path`
    pub fn for_path(&self, path: &Path) -> Option<&Arc<dyn ContentType>> {
        let file_name = path.file_name()?.to_str()?;
        self.types
            .values()
            .find(|t| file_name.ends_with(t.extension()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ContentType>> {
        self.types.values()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }
}
