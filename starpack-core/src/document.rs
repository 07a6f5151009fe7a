//! Aggregate document persistence.
//!
//! One JSON file per category inside a pack's `Data` area, named by
//! [`Category::file_name`].
//!
//! Write flow: serialize → `<name>.tmp` sibling → `chmod 0600` → `rename`.
//! The `.tmp` always sits next to the target, so the rename never crosses
//! filesystems and readers on other peers only ever see whole documents.

use std::path::{Path, PathBuf};

use crate::error::{io_err, DocumentError};
use crate::types::{AggregateDocument, Category};

/// `<data_root>/<category>.json`. Pure, no I/O.
pub fn document_path_at(data_root: &Path, category: Category) -> PathBuf {
    data_root.join(category.file_name())
}

/// Load the document for `category`.
///
/// Returns `DocumentError::NotFound` if absent and `DocumentError::Parse`
/// (with path) if malformed.
pub fn load_at(data_root: &Path, category: Category) -> Result<AggregateDocument, DocumentError> {
    let path = document_path_at(data_root, category);
    if !path.exists() {
        return Err(DocumentError::NotFound { path });
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    serde_json::from_str(&contents).map_err(|e| DocumentError::Parse { path, source: e })
}

/// Like [`load_at`], but a missing document is `Ok(None)`.
pub fn try_load_at(
    data_root: &Path,
    category: Category,
) -> Result<Option<AggregateDocument>, DocumentError> {
    match load_at(data_root, category) {
        Ok(doc) => Ok(Some(doc)),
        Err(DocumentError::NotFound { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Categories with a document present under `data_root`, sorted.
///
/// Unknown files (temporaries, foreign tools) are skipped.
pub fn list_categories_at(data_root: &Path) -> Result<Vec<Category>, DocumentError> {
    if !data_root.exists() {
        return Ok(vec![]);
    }
    let mut categories: Vec<Category> = std::fs::read_dir(data_root)
        .map_err(|e| io_err(data_root, e))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter_map(|e| Category::from_file_name(&e.file_name().to_string_lossy()))
        .collect();
    categories.sort();
    Ok(categories)
}

/// Atomically replace the document for `doc.category`.
pub fn save_at(data_root: &Path, doc: &AggregateDocument) -> Result<PathBuf, DocumentError> {
    std::fs::create_dir_all(data_root).map_err(|e| io_err(data_root, e))?;
    let path = document_path_at(data_root, doc.category);
    let tmp_path = path.with_file_name(format!("{}.tmp", doc.category.file_name()));

    let json = serde_json::to_string_pretty(doc)?;
    std::fs::write(&tmp_path, json).map_err(|e| io_err(&tmp_path, e))?;
    set_file_permissions(&tmp_path)?;
    if let Err(e) = std::fs::rename(&tmp_path, &path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(io_err(&path, e));
    }
    Ok(path)
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), DocumentError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), DocumentError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
