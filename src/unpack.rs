//! Unpacked dataset locations
//!
//! Every stored package unpacks into its own directory under the unpack root.
//! The directory name is derived from the item's type, name and hash, so the
//! same package always maps to the same place. A marker file inside the
//! directory is written only after extraction finished; a directory without
//! it is treated as never unpacked.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::item::ContentItem;

/// Completion marker inside an unpacked directory
pub const UNPACKED_MARKER: &str = ".unpacked";

const HASH_PREFIX_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackedDir {
    path: PathBuf,
}

impl UnpackedDir {
    pub fn for_item(unpack_root: &Path, item: &ContentItem) -> Self {
        Self {
            path: unpack_root.join(unpacked_key(item)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_unpacked(&self) -> bool {
        self.path.join(UNPACKED_MARKER).is_file()
    }

    pub fn mark_unpacked(&self, hash: &str) -> io::Result<()> {
        fs::write(self.path.join(UNPACKED_MARKER), hash.as_bytes())
    }
}

/// `{type}-{name}-{hash prefix}` with everything outside `[A-Za-z0-9._-]`
/// replaced by `_`
pub fn unpacked_key(item: &ContentItem) -> String {
    let hash = item.hash.to_lowercase();
    let prefix = hash.get(..HASH_PREFIX_LEN).unwrap_or(&hash);
    format!(
        "{}-{}-{}",
        sanitize(&item.content_type),
        sanitize(&item.name),
        sanitize(prefix)
    )
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
