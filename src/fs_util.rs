//! Filesystem helpers for reclaiming and relocating the storage tree

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Recursive deletion restricted to an allow-list of directory trees.
///
/// Containment is checked on normalised path components, never on substrings.
/// Asking to delete anything outside the allow-list is a logic defect and
/// panics.
#[derive(Debug, Clone, Default)]
pub struct DeletionGuard {
    allowed: Vec<PathBuf>,
}

impl DeletionGuard {
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        Self {
            allowed: roots
                .into_iter()
                .filter_map(|r| normalize(r.as_ref()))
                .collect(),
        }
    }

    pub fn allow(&mut self, root: &Path) {
        if let Some(root) = normalize(root) {
            self.allowed.push(root);
        }
    }

    pub fn permits(&self, path: &Path) -> bool {
        match normalize(path) {
            Some(path) => self.allowed.iter().any(|root| path.starts_with(root)),
            None => false,
        }
    }

    /// Remove `dir` and everything below it. Returns `Ok(false)` when there
    /// is no such directory.
    pub fn remove_dir(&self, dir: &Path) -> io::Result<bool> {
        if !self.permits(dir) {
            panic!(
                "refusing to delete {} outside of the managed storage trees",
                dir.display()
            );
        }

        if !dir.is_dir() {
            return Ok(false);
        }

        debug!(path = %dir.display(), "Removing directory tree");
        fs::remove_dir_all(dir)?;
        Ok(true)
    }

    /// Remove a single file inside the allowed trees
    pub fn remove_file(&self, file: &Path) -> io::Result<bool> {
        if !self.permits(file) {
            panic!(
                "refusing to delete {} outside of the managed storage trees",
                file.display()
            );
        }

        match fs::remove_file(file) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Lexically normalised absolute path; `None` if it climbs with `..` above
/// its own root or cannot be made absolute.
pub fn normalize(path: &Path) -> Option<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    Some(out)
}

/// Whether `child` lies at or below `parent`
pub fn is_ancestor(parent: &Path, child: &Path) -> bool {
    match (normalize(parent), normalize(child)) {
        (Some(parent), Some(child)) => child.starts_with(parent),
        _ => false,
    }
}

/// Copy the contents of `from` into `to`, recursively. `to` is created.
pub fn copy_dir(from: &Path, to: &Path) -> io::Result<u64> {
    fs::create_dir_all(to)?;
    let mut copied = 0;

    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = to.join(entry.file_name());

        if file_type.is_dir() {
            copied += copy_dir(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    Ok(copied)
}
