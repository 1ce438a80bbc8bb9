//! Content items
//!
//! A content item is a named, typed, hash-identified package. Items are
//! immutable; storages build fresh instances on every refresh.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Transfer compression declared by a catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

/// Where the bytes of an item live
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemSource {
    /// Package file on local disk
    Local { path: PathBuf },
    /// Package published by a remote catalog
    Remote {
        url: String,
        size: u64,
        compression: Compression,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentItem {
    pub name: String,
    pub content_type: String,
    pub hash: String,
    pub description: String,
    pub region_id: Option<String>,
    pub source: ItemSource,
}

impl ContentItem {
    /// Package path for local items
    pub fn local_path(&self) -> Option<&Path> {
        match &self.source {
            ItemSource::Local { path } => Some(path),
            ItemSource::Remote { .. } => None,
        }
    }

    /// Download URL for remote items
    pub fn url(&self) -> Option<&str> {
        match &self.source {
            ItemSource::Remote { url, .. } => Some(url),
            ItemSource::Local { .. } => None,
        }
    }

    pub fn hash_matches(&self, other: &ContentItem) -> bool {
        self.hash.eq_ignore_ascii_case(&other.hash)
    }
}

/// Sidecar record written next to a stored package so a rescan can recover
/// the catalog attributes that a content-addressed file name loses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub hash: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub region_id: Option<String>,
}

impl ItemMetadata {
    pub fn from_item(item: &ContentItem) -> Self {
        Self {
            name: item.name.clone(),
            content_type: item.content_type.clone(),
            hash: item.hash.to_lowercase(),
            description: item.description.clone(),
            region_id: item.region_id.clone(),
        }
    }

    pub fn into_local_item(self, path: PathBuf, hash: String) -> ContentItem {
        ContentItem {
            name: self.name,
            content_type: self.content_type,
            hash,
            description: self.description,
            region_id: self.region_id,
            source: ItemSource::Local { path },
        }
    }
}
