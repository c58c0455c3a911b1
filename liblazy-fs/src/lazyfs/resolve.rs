use std::fs::Metadata;
use std::path::{Path, PathBuf};

use crate::error::{LazyFsError, Result};

/// Outcome of resolving one path against the override layer and the
/// placeholder index.
///
/// Every consumer (attributes, open, listing, readlink) goes through
/// [`resolve`] and matches on this, so they all treat the same path the
/// same way.
#[derive(Debug)]
pub enum Resolved {
    /// Present in the override layer, which shadows the index.
    OverrideHit { path: PathBuf, meta: Metadata },
    /// Regular index file whose content is a hash of the real bytes.
    PlaceholderFile { path: PathBuf, meta: Metadata },
    /// Directory of the index tree.
    PlaceholderDir { path: PathBuf, meta: Metadata },
    /// Symlink of the index tree, target kept verbatim.
    PlaceholderSymlink { path: PathBuf, meta: Metadata },
    /// Fifo, socket or device node of the index tree.
    PlaceholderSpecial { path: PathBuf, meta: Metadata },
    /// Present in neither layer.
    Miss,
}

/// Resolve `rel` (relative to the layer root) against the override layer
/// first and the index tree second. Entries are never followed, a symlink
/// resolves to the link itself.
pub fn resolve(index_root: &Path, override_root: &Path, rel: &Path) -> Resolved {
    let upper = override_root.join(rel);
    if let Ok(meta) = upper.symlink_metadata() {
        return Resolved::OverrideHit { path: upper, meta };
    }

    let lower = index_root.join(rel);
    let meta = match lower.symlink_metadata() {
        Ok(meta) => meta,
        Err(_) => return Resolved::Miss,
    };

    let ft = meta.file_type();
    if ft.is_dir() {
        Resolved::PlaceholderDir { path: lower, meta }
    } else if ft.is_symlink() {
        Resolved::PlaceholderSymlink { path: lower, meta }
    } else if ft.is_file() {
        Resolved::PlaceholderFile { path: lower, meta }
    } else {
        Resolved::PlaceholderSpecial { path: lower, meta }
    }
}

/// Read the content hash stored in a placeholder file.
pub fn read_hash(path: &Path) -> Result<String> {
    let text = std::fs::read_to_string(path)?;
    let hash = text.trim().to_string();
    if !is_hash_like(&hash) {
        return Err(LazyFsError::BadPlaceholder(path.to_path_buf()));
    }
    Ok(hash)
}

/// Placeholder payloads are short hex digest strings; anything else is
/// treated as ordinary file content.
pub fn is_hash_like(s: &str) -> bool {
    (32..=64).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_hexdigit())
}
