//! Remote catalog storage
//!
//! A catalog is a JSON document listing items and further catalogs to
//! include:
//!
//! ```json
//! { "items": [ { "name": "karelia.ghz", "type": "graphhopper-map",
//!                "hash": "...", "url": "karelia.ghz", "size": 1234,
//!                "compression": "gzip", "region_id": "karelia",
//!                "region": "<polygon text>" } ],
//!   "includes": [ "more/root.json" ] }
//! ```
//!
//! Relative URLs resolve against the document that declares them. Configured
//! roots are tried in order; a root counts as failed only when no document in
//! its tree could be fetched. A malformed item is skipped on its own and does
//! not spoil the rest of its document.

use parking_lot::RwLock;
use serde::{Deserialize, Deserializer};
use std::collections::{HashSet, VecDeque};
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use super::{ContentStorage, Snapshot};
use crate::content_type::ContentTypeRegistry;
use crate::error::{ContentError, Result};
use crate::item::{Compression, ContentItem, ItemSource};
use crate::region::{Region, RegionCache};
use crate::transport::Transport;

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    items: Vec<serde_json::Value>,
    #[serde(default)]
    includes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    name: String,
    #[serde(rename = "type")]
    content_type: String,
    hash: String,
    #[serde(default)]
    description: String,
    #[serde(default, alias = "regionId")]
    region_id: Option<String>,
    url: String,
    #[serde(default)]
    size: u64,
    #[serde(default, deserialize_with = "lenient_compression")]
    compression: Compression,
    /// Inline polygon of the package coverage
    #[serde(default)]
    region: Option<String>,
}

/// Anything but `"gzip"` (an unknown scheme, `null`) is fetched as is
fn lenient_compression<'de, D>(deserializer: D) -> std::result::Result<Compression, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value.as_ref().and_then(|v| v.as_str()) {
        Some("gzip") => Compression::Gzip,
        _ => Compression::None,
    })
}

/// Outcome of walking the tree under one root
struct Traversal {
    documents: usize,
    items: Vec<ContentItem>,
}

pub struct NetworkStorage {
    roots: RwLock<Vec<String>>,
    transport: Arc<dyn Transport>,
    registry: Arc<ContentTypeRegistry>,
    regions: Arc<RegionCache>,
    max_depth: usize,
    items: Snapshot<ContentItem>,
}

impl NetworkStorage {
    pub fn new(
        roots: Vec<String>,
        transport: Arc<dyn Transport>,
        registry: Arc<ContentTypeRegistry>,
        regions: Arc<RegionCache>,
        max_depth: usize,
    ) -> Self {
        Self {
            roots: RwLock::new(roots),
            transport,
            registry,
            regions,
            max_depth,
            items: Snapshot::new(),
        }
    }

    pub fn roots(&self) -> Vec<String> {
        self.roots.read().clone()
    }

    /// Refresh from `roots` and keep them as the configured roots. On
    /// failure both the roots and the published list stay as they were.
    pub fn refresh_roots(&self, roots: Vec<String>) -> Result<()> {
        self.refresh_from(&roots)?;
        *self.roots.write() = roots;
        Ok(())
    }

    fn refresh_from(&self, roots: &[String]) -> Result<()> {
        if roots.is_empty() {
            self.items.publish(Vec::new());
            return Ok(());
        }

        let mut empty_root = None;
        for root in roots {
            let traversal = self.traverse(root);
            if traversal.documents == 0 {
                warn!(url = %root, "Catalog root unreachable");
                continue;
            }

            if traversal.items.is_empty() {
                empty_root.get_or_insert(root);
                continue;
            }

            info!(url = %root, count = traversal.items.len(), "Remote catalog loaded");
            self.items.publish(traversal.items);
            return Ok(());
        }

        match empty_root {
            Some(root) => {
                info!(url = %root, "Remote catalog is empty");
                self.items.publish(Vec::new());
                Ok(())
            }
            None => Err(ContentError::NetworkUnavailable),
        }
    }

    fn traverse(&self, root: &str) -> Traversal {
        let mut result = Traversal {
            documents: 0,
            items: Vec::new(),
        };

        let root = match Url::parse(root) {
            Ok(url) => url,
            Err(e) => {
                warn!(url = root, error = %e, "Invalid catalog root URL");
                return result;
            }
        };

        let mut visited: HashSet<String> = HashSet::new();
        let mut names: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(Url, usize)> = VecDeque::new();
        queue.push_back((root, 0));

        while let Some((url, depth)) = queue.pop_front() {
            if !visited.insert(url.as_str().to_string()) {
                debug!(url = %url, "Catalog already visited, skipping");
                continue;
            }

            let document = match self.fetch(&url) {
                Ok(document) => document,
                Err(e) => {
                    warn!(url = %url, error = %e, "Failed to load catalog, skipping");
                    continue;
                }
            };
            result.documents += 1;

            for value in document.items {
                let entry: CatalogEntry = match serde_json::from_value(value) {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(url = %url, error = %e, "Skipping malformed catalog item");
                        continue;
                    }
                };
                if !self.registry.contains(&entry.content_type) {
                    debug!(
                        name = %entry.name,
                        content_type = %entry.content_type,
                        "Ignoring item of unknown content type"
                    );
                    continue;
                }
                if !names.insert(entry.name.clone()) {
                    debug!(name = %entry.name, "Duplicate catalog item, keeping the first");
                    continue;
                }
                if let Some(item) = self.convert(&url, entry) {
                    result.items.push(item);
                }
            }

            if depth >= self.max_depth {
                if !document.includes.is_empty() {
                    warn!(url = %url, depth, "Catalog nesting too deep, ignoring includes");
                }
                continue;
            }

            for include in document.includes {
                match url.join(&include) {
                    Ok(next) => queue.push_back((next, depth + 1)),
                    Err(e) => warn!(url = %url, include, error = %e, "Invalid include URL"),
                }
            }
        }

        result
    }

    fn fetch(&self, url: &Url) -> Result<CatalogDocument> {
        let mut body = Vec::new();
        self.transport.open(url.as_str())?.read_to_end(&mut body)?;
        serde_json::from_slice(&body).map_err(|e| ContentError::InvalidCatalog(e.to_string()))
    }

    fn convert(&self, base: &Url, entry: CatalogEntry) -> Option<ContentItem> {
        let url = match base.join(&entry.url) {
            Ok(url) => url,
            Err(e) => {
                warn!(name = %entry.name, error = %e, "Invalid item URL, skipping");
                return None;
            }
        };

        let mut region_id = entry.region_id;
        if let Some(text) = &entry.region {
            match Region::parse_str(text) {
                Ok(region) => {
                    let id = region_id.get_or_insert_with(|| entry.name.clone());
                    self.regions.put_region(id, region);
                }
                Err(e) => warn!(name = %entry.name, error = %e, "Ignoring malformed inline region"),
            }
        }

        Some(ContentItem {
            name: entry.name,
            content_type: entry.content_type,
            hash: entry.hash,
            description: entry.description,
            region_id,
            source: ItemSource::Remote {
                url: url.to_string(),
                size: entry.size,
                compression: entry.compression,
            },
        })
    }
}

impl ContentStorage for NetworkStorage {
    fn name(&self) -> &str {
        "network-storage"
    }

    fn refresh(&self) -> Result<()> {
        self.refresh_from(&self.roots())
    }

    fn list(&self) -> Arc<Vec<ContentItem>> {
        self.items.load()
    }
}
