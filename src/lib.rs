//! mapcontent - Lifecycle engine for downloadable map packages
//!
//! Discovers packages in remote catalogs, downloads and verifies them into a
//! content-addressed store, unpacks and activates one dataset per content
//! type, finds packages covering a location, and reclaims what is no longer
//! needed.
//!
//! ## Storage Layout
//!
//! ```text
//! <storage root>/
//! ├── storage/                        # Content-addressed packages
//! │   ├── 3f2a...9c.ghz               # <sha1><extension>
//! │   ├── 3f2a...9c.ghz.meta.json     # Catalog attributes
//! │   └── 3f2a...9c.ghz.obsolete      # Teardown flag
//! └── unpacked/
//!     └── graphhopper-map-karelia.ghz-3f2a.../
//!         ├── .unpacked               # Completion marker
//!         └── regions6/*.poly         # Optional region bundle
//! ```
//!
//! The digest cache and the preferences (activation pointers, migration
//! history, current root) live in a sled database next to the config.

pub mod config;
pub mod content_type;
pub mod digest;
pub mod error;
pub mod fs_util;
pub mod item;
pub mod manager;
pub mod prefs;
pub mod progress;
pub mod region;
pub mod service;
pub mod storage;
pub mod transport;
pub mod unpack;

// Re-exports
pub use config::Config;
pub use content_type::{ContentType, ContentTypeRegistry, GRAPHHOPPER_MAP, MAPSFORGE_MAP};
pub use digest::{DigestAlgorithm, DigestStore};
pub use error::{ContentError, Result};
pub use item::{Compression, ContentItem, ItemSource};
pub use manager::{Collaborators, ContentManager, GcReport};
pub use prefs::{KeyValueStore, MemoryKeyValueStore, SledKeyValueStore};
pub use region::{GeoPoint, Region, RegionCache};
pub use service::{ContentEvent, ContentService, DownloadHandle};
pub use storage::ContentStorage;
pub use transport::{HttpTransport, MemoryTransport, Transport};
