//! Mapsforge vector maps (`.map`)
//!
//! The binary header carries the bounding box, so the region is a rectangle.
//! A map file is used as-is; unpacking copies it into the dataset directory.

use std::fs;
use std::io::{self, Read};
use std::path::Path;
use tracing::{debug, info};

use super::{ContentType, MAPSFORGE_MAP};
use crate::item::ContentItem;
use crate::region::Region;

const MAGIC: &[u8; 20] = b"mapsforge binary OSM";
/// magic + header size + file version + file size + date + 4 bbox ints
const HEADER_PREFIX_LEN: usize = 20 + 4 + 4 + 8 + 8 + 16;
const BBOX_OFFSET: usize = 20 + 4 + 4 + 8 + 8;

#[derive(Debug, Default)]
pub struct MapsforgeContentType;

impl MapsforgeContentType {
    pub fn new() -> Self {
        Self
    }
}

/// Bounding box from a Mapsforge header, in degrees (min_lat, min_lon, max_lat, max_lon)
pub fn read_bounds(package: &Path) -> io::Result<(f64, f64, f64, f64)> {
    let mut header = [0u8; HEADER_PREFIX_LEN];
    fs::File::open(package)?.read_exact(&mut header)?;

    if &header[..MAGIC.len()] != MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "not a mapsforge map file",
        ));
    }

    let micro = |i: usize| {
        let at = BBOX_OFFSET + i * 4;
        let raw = i32::from_be_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
        f64::from(raw) / 1_000_000.0
    };

    Ok((micro(0), micro(1), micro(2), micro(3)))
}

impl ContentType for MapsforgeContentType {
    fn name(&self) -> &str {
        MAPSFORGE_MAP
    }

    fn extension(&self) -> &str {
        ".map"
    }

    fn extract_region(&self, item: &ContentItem, package: &Path) -> Option<Region> {
        match read_bounds(package) {
            Ok((min_lat, min_lon, max_lat, max_lon)) => Some(Region::from_bounds(
                &item.name, min_lat, min_lon, max_lat, max_lon,
            )),
            Err(e) => {
                debug!(name = %item.name, error = %e, "Map header is unreadable");
                None
            }
        }
    }

    fn unpack(&self, item: &ContentItem, package: &Path, dest: &Path) -> io::Result<()> {
        info!(name = %item.name, dest = %dest.display(), "Installing map file");
        fs::create_dir_all(dest)?;
        let file_name = package
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "package has no file name"))?;
        fs::copy(package, dest.join(file_name))?;
        Ok(())
    }
}
