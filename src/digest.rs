//! Digest store and verifying reader
//!
//! Package hashes are SHA-1 digests rendered as lowercase hex, the algorithm
//! catalogs publish. Deployments with their own catalogs may switch to SHA-256
//! through `DigestAlgorithm`.
//!
//! Hashing a multi-hundred-megabyte package on every directory scan is too
//! slow, so the store remembers the digest of each file together with the
//! size and modification time it had when hashed. A changed file gets
//! re-hashed and its record overwritten.

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::debug;

use crate::error::{ContentError, Result};

const DIGEST_TREE: &str = "digest-cache";

/// Hash function used for catalog hashes and the digest cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    #[default]
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    /// Digest of everything `reader` yields, as lowercase hex
    pub fn hash_reader<R: Read>(self, mut reader: R) -> io::Result<String> {
        let mut hasher = Hasher::new(self);
        io::copy(&mut reader, &mut hasher)?;
        Ok(hasher.hex())
    }

    pub fn hash_bytes(self, data: &[u8]) -> String {
        let mut hasher = Hasher::new(self);
        hasher.update(data);
        hasher.hex()
    }
}

#[derive(Clone)]
enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha1 => Self::Sha1(Sha1::new()),
            DigestAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    /// Hex digest of the bytes seen so far
    fn hex(&self) -> String {
        match self.clone() {
            Self::Sha1(h) => hex::encode(h.finalize()),
            Self::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

impl Write for Hasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Raised (inside an `io::Error`) when a verified stream ends with the wrong digest
#[derive(Debug, Clone, thiserror::Error)]
#[error("digest mismatch: expected {expected}, got {actual}")]
pub struct DigestMismatch {
    pub expected: String,
    pub actual: String,
}

/// Size and modification time of a file at the moment it was hashed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIdentity {
    pub size: u64,
    pub modified_secs: u64,
    pub modified_nanos: u32,
}

impl FileIdentity {
    pub fn of(path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        let modified = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        Ok(Self {
            size: metadata.len(),
            modified_secs: modified.as_secs(),
            modified_nanos: modified.subsec_nanos(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DigestRecord {
    algorithm: DigestAlgorithm,
    identity: FileIdentity,
    hash: String,
}

/// Persistent `path -> hash` cache
#[derive(Clone)]
pub struct DigestStore {
    tree: sled::Tree,
    algorithm: DigestAlgorithm,
}

impl DigestStore {
    /// Open the digest tree inside an existing database
    pub fn open(db: &sled::Db, algorithm: DigestAlgorithm) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(DIGEST_TREE)?,
            algorithm,
        })
    }

    /// SHA-1 store backed by a throwaway database (for tests and one-shot tools)
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::open(&db, DigestAlgorithm::default())
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Digest of the file at `path`, re-hashing only if the file changed
    pub fn hash_file(&self, path: &Path) -> Result<String> {
        let identity = FileIdentity::of(path)?;
        let key = path_key(path);

        if let Some(record) = self.lookup(&key)? {
            if record.identity == identity && record.algorithm == self.algorithm {
                return Ok(record.hash);
            }
            debug!(path = %path.display(), "Stale digest record, re-hashing");
        }

        let hash = self.algorithm.hash_reader(fs::File::open(path)?)?;
        self.put(
            &key,
            &DigestRecord {
                algorithm: self.algorithm,
                identity,
                hash: hash.clone(),
            },
        )?;
        Ok(hash)
    }

    /// Record an already verified digest for a freshly written file
    pub fn record(&self, path: &Path, hash: &str) -> Result<()> {
        let identity = FileIdentity::of(path)?;
        self.put(
            &path_key(path),
            &DigestRecord {
                algorithm: self.algorithm,
                identity,
                hash: hash.to_lowercase(),
            },
        )
    }

    pub fn forget(&self, path: &Path) -> Result<()> {
        self.tree.remove(path_key(path).as_bytes())?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn is_recorded(&self, path: &Path) -> bool {
        matches!(self.lookup(&path_key(path)), Ok(Some(_)))
    }

    fn lookup(&self, key: &str) -> Result<Option<DigestRecord>> {
        match self.tree.get(key.as_bytes())? {
            Some(value) => {
                let record = rmp_serde::from_slice(&value)
                    .map_err(|e| ContentError::Serialization(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, record: &DigestRecord) -> Result<()> {
        let value =
            rmp_serde::to_vec(record).map_err(|e| ContentError::Serialization(e.to_string()))?;
        self.tree.insert(key.as_bytes(), value)?;
        Ok(())
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub fn sha1_bytes(data: &[u8]) -> String {
    DigestAlgorithm::Sha1.hash_bytes(data)
}

/// Reader that hashes every byte passing through it and fails at end of
/// stream when the digest differs from `expected`.
///
/// Consumers that copy until EOF therefore never see a clean end of a
/// corrupted stream.
pub struct DigestReader<R> {
    inner: R,
    hasher: Hasher,
    expected: String,
    verified: bool,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R, expected: &str, algorithm: DigestAlgorithm) -> Self {
        Self {
            inner,
            hasher: Hasher::new(algorithm),
            expected: expected.to_lowercase(),
            verified: false,
        }
    }

    fn verify(&mut self) -> io::Result<()> {
        let actual = self.hasher.hex();
        if actual != self.expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                DigestMismatch {
                    expected: self.expected.clone(),
                    actual,
                },
            ));
        }
        self.verified = true;
        Ok(())
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            if !buf.is_empty() && !self.verified {
                self.verify()?;
            }
        } else {
            self.hasher.update(&buf[..n]);
        }
        Ok(n)
    }
}
