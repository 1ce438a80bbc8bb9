//! Routing datasets packaged as zip archives (`.ghz`)
//!
//! The archive carries its coverage as a `polygon.poly` entry. Once unpacked,
//! a `regions6/` directory (older builds: `regions/`) holds finer-grained
//! region partitions that are bulk-loaded into the region cache.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{ContentType, GRAPHHOPPER_MAP};
use crate::item::ContentItem;
use crate::region::Region;

const POLYGON_ENTRY: &str = "polygon.poly";
const REGION_BUNDLE_DIRS: [&str; 2] = ["regions6", "regions"];

#[derive(Debug, Default)]
pub struct GraphhopperContentType;

impl GraphhopperContentType {
    pub fn new() -> Self {
        Self
    }
}

impl ContentType for GraphhopperContentType {
    fn name(&self) -> &str {
        GRAPHHOPPER_MAP
    }

    fn extension(&self) -> &str {
        ".ghz"
    }

    fn extract_region(&self, item: &ContentItem, package: &Path) -> Option<Region> {
        let file = fs::File::open(package).ok()?;
        let mut archive = zip::ZipArchive::new(file).ok()?;
        let entry = archive.by_name(POLYGON_ENTRY).ok()?;

        match Region::parse(entry) {
            Ok(region) => Some(region),
            Err(e) => {
                debug!(name = %item.name, error = %e, "Package polygon is unreadable");
                None
            }
        }
    }

    fn unpack(&self, item: &ContentItem, package: &Path, dest: &Path) -> io::Result<()> {
        info!(name = %item.name, dest = %dest.display(), "Extracting routing archive");
        unzip(package, dest)
    }

    fn region_bundle(&self, unpacked: &Path) -> Option<PathBuf> {
        REGION_BUNDLE_DIRS
            .iter()
            .map(|name| unpacked.join(name))
            .find(|dir| dir.is_dir())
    }
}

/// Extract every entry of a zip archive below `dest`
fn unzip(package: &Path, dest: &Path) -> io::Result<()> {
    let file = fs::File::open(package)?;
    let mut archive = zip::ZipArchive::new(file)?;
    fs::create_dir_all(dest)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let relative = entry.enclosed_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("archive entry escapes destination: {}", entry.name()),
            )
        })?;
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
    }

    Ok(())
}
