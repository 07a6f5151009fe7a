//! Data pack layout.
//!
//! ```text
//! <packs_root>/
//!   <pack_id>/
//!     Data/    (one aggregate document per category)
//!     Files/   (content store, one file per SHA-256 digest)
//! ```
//!
//! The transport owns the directories; the core only resolves them.

use std::path::{Path, PathBuf};

use crate::types::PackId;

pub const DATA_DIR: &str = "Data";
pub const FILES_DIR: &str = "Files";

/// Resolved roots of one data pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackRoots {
    pub data: PathBuf,
    pub files: PathBuf,
}

impl PackRoots {
    /// Roots for a pack laid out directly under `pack_dir`.
    pub fn under(pack_dir: &Path) -> Self {
        Self {
            data: pack_dir.join(DATA_DIR),
            files: pack_dir.join(FILES_DIR),
        }
    }
}

/// Resolves a pack id to its `Data` and `Files` roots.
pub trait PathResolver: Send + Sync {
    /// `None` when the transport does not (yet) know the pack.
    fn resolve(&self, pack: &PackId) -> Option<PackRoots>;
}

/// Resolver for packs stored as sibling directories under one root.
#[derive(Debug, Clone)]
pub struct DirectoryResolver {
    root: PathBuf,
}

impl DirectoryResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn pack_dir(&self, pack: &PackId) -> PathBuf {
        self.root.join(&pack.0)
    }
}

impl PathResolver for DirectoryResolver {
    fn resolve(&self, pack: &PackId) -> Option<PackRoots> {
        let dir = self.pack_dir(pack);
        dir.is_dir().then(|| PackRoots::under(&dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn roots_are_data_and_files() {
        let roots = PackRoots::under(Path::new("/packs/alpha"));
        assert!(roots.data.ends_with("alpha/Data"));
        assert!(roots.files.ends_with("alpha/Files"));
    }

    #[test]
    fn directory_resolver_requires_existing_pack() {
        let tmp = TempDir::new().unwrap();
        let resolver = DirectoryResolver::new(tmp.path());
        assert!(resolver.resolve(&PackId::from("alpha")).is_none());

        std::fs::create_dir_all(tmp.path().join("alpha")).unwrap();
        let roots = resolver.resolve(&PackId::from("alpha")).expect("resolved");
        assert_eq!(roots.data, tmp.path().join("alpha").join(DATA_DIR));
    }
}
