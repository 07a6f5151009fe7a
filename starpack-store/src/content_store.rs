//! Content store: write-once files named by the SHA-256 of their bytes.
//!
//! ## `put` protocol
//!
//! 1. SHA-256 hash the bytes.
//! 2. Derive the store name (64 lowercase hex chars).
//! 3. If a file with that name exists → done, nothing written.
//! 4. Write to a unique `<name>.<n>.tmp` sibling.
//! 5. Rename to the final name (atomic on POSIX).
//!
//! Identical names imply identical bytes, so the existence check in step 3
//! is the whole dedup story. Nothing here ever deletes content.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use sha2::{Digest, Sha256};

use starpack_core::ContentHash;

use crate::error::{io_err, StoreError};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Outcome of a [`ContentStore::put`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredContent {
    pub hash: ContentHash,
    pub path: PathBuf,
    /// `false` when the content was already present.
    pub written: bool,
}

/// Result of re-hashing a stored file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Intact,
    Missing,
    Corrupt { actual: ContentHash },
}

/// Content-addressed store rooted at a pack's `Files` area.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Digest of `bytes`, as used for store names.
    pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&Sha256::digest(bytes));
        ContentHash::from_digest(&digest)
    }

    /// Where content with `hash` lives (or would live). Pure, no I/O.
    pub fn path_for(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(hash.file_name())
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.path_for(hash).is_file()
    }

    /// Store `bytes` unless content with the same digest is already present.
    pub fn put(&self, bytes: &[u8]) -> Result<StoredContent, StoreError> {
        let hash = Self::hash_bytes(bytes);
        let path = self.path_for(&hash);
        if path.is_file() {
            tracing::debug!("content already stored: {}", hash);
            return Ok(StoredContent {
                hash,
                path,
                written: false,
            });
        }

        std::fs::create_dir_all(&self.root).map_err(|e| io_err(&self.root, e))?;
        let tmp = self.root.join(format!(
            "{}.{}-{}.tmp",
            hash.file_name(),
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&tmp, bytes).map_err(|e| io_err(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(&path, e));
        }

        tracing::debug!("stored content {} ({} bytes)", hash, bytes.len());
        Ok(StoredContent {
            hash,
            path,
            written: true,
        })
    }

    /// Read `source` and [`put`](Self::put) its bytes.
    pub fn put_file(&self, source: &Path) -> Result<StoredContent, StoreError> {
        let bytes = std::fs::read(source).map_err(|e| io_err(source, e))?;
        self.put(&bytes)
    }

    /// Path of stored content, or [`StoreError::NotFound`].
    pub fn resolve(&self, hash: &ContentHash) -> Result<PathBuf, StoreError> {
        let path = self.path_for(hash);
        if path.is_file() {
            Ok(path)
        } else {
            Err(StoreError::NotFound { hash: hash.clone() })
        }
    }

    /// Re-hash a stored file and compare with its name.
    pub fn verify(&self, hash: &ContentHash) -> Result<Verification, StoreError> {
        let path = self.path_for(hash);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Verification::Missing)
            }
            Err(err) => return Err(io_err(&path, err)),
        };
        let actual = Self::hash_bytes(&bytes);
        if &actual == hash {
            Ok(Verification::Intact)
        } else {
            Ok(Verification::Corrupt { actual })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
