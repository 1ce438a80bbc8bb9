//! Configuration for mapcontent

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::digest::DigestAlgorithm;

/// Default storage root
pub fn default_storage_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mapcontent")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Storage root used until a migration records another one
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// Remote catalog roots, tried in order
    #[serde(default)]
    pub catalog_urls: Vec<String>,

    /// Extra read-only package directories
    #[serde(default)]
    pub additional_storage_dirs: Vec<PathBuf>,

    /// sled database holding the digest cache and preferences
    #[serde(default = "default_state_db")]
    pub state_db: PathBuf,

    /// Bytes between two download progress reports
    #[serde(default = "default_progress_step")]
    pub progress_step_bytes: u64,

    /// Maximum nesting of catalog includes
    #[serde(default = "default_max_catalog_depth")]
    pub max_catalog_depth: usize,

    /// Timeout of a single HTTP request in seconds
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// Bulk-load region bundles shipped inside unpacked datasets
    #[serde(default = "default_true")]
    pub load_region_bundles: bool,

    /// Hash function of catalog hashes (`sha1` or `sha256`)
    #[serde(default)]
    pub digest_algorithm: DigestAlgorithm,
}

fn default_state_db() -> PathBuf {
    default_storage_root().join("state.sled")
}

fn default_progress_step() -> u64 {
    100_000
}

fn default_max_catalog_depth() -> usize {
    16
}

fn default_http_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            catalog_urls: Vec::new(),
            additional_storage_dirs: Vec::new(),
            state_db: default_state_db(),
            progress_step_bytes: default_progress_step(),
            max_catalog_depth: default_max_catalog_depth(),
            http_timeout_secs: default_http_timeout(),
            load_region_bundles: true,
            digest_algorithm: DigestAlgorithm::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }
}

/// Packages directory under a storage root
pub fn storage_dir(root: &Path) -> PathBuf {
    root.join("storage")
}

/// Unpacked datasets directory under a storage root
pub fn unpacked_dir(root: &Path) -> PathBuf {
    root.join("unpacked")
}
