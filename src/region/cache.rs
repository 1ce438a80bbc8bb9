//! Region cache
//!
//! Maps region ids to parsed boundaries. Entries come from three places:
//! regions extracted on demand from local packages, inline regions declared
//! by remote catalogs, and region bundles shipped inside unpacked datasets.
//! The cache only grows; its key space is bounded by the number of distinct
//! regions across all known items.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::Region;
use crate::error::Result;

/// File extension of region files inside a bundle directory
pub const REGION_FILE_EXTENSION: &str = "poly";

#[derive(Default)]
pub struct RegionCache {
    regions: RwLock<HashMap<String, Arc<Region>>>,
}

impl RegionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_region(&self, id: &str) -> Option<Arc<Region>> {
        self.regions.read().get(id).cloned()
    }

    pub fn put_region(&self, id: &str, region: Region) -> Arc<Region> {
        let region = Arc::new(region);
        self.regions.write().insert(id.to_string(), region.clone());
        region
    }

    pub fn len(&self) -> usize {
        self.regions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load every `<region-id>.poly` file in `dir`, replacing entries with the
    /// same id. Unparseable files are skipped. Returns the number loaded.
    pub fn bulk_load(&self, dir: &Path) -> Result<usize> {
        let mut loaded = HashMap::new();

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(REGION_FILE_EXTENSION)
            {
                continue;
            }

            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            match fs::File::open(&path).and_then(Region::parse) {
                Ok(region) => {
                    loaded.insert(id.to_string(), Arc::new(region));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable region file");
                }
            }
        }

        let count = loaded.len();
        self.regions.write().extend(loaded);

        info!(dir = %dir.display(), count, "Loaded region bundle");
        Ok(count)
    }
}
