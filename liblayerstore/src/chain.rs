//! Chain markers.
//!
//! Layers composed on top of a lazy image do not get their own
//! placeholder index. Instead every layer in the chain carries a
//! `lazy-parent` symlink pointing at the chain root's storage
//! directory, and the root alone holds the index, the override layer
//! and the mountpoint. Marker maintenance is plain symlink
//! manipulation; everything here is synchronous.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};
use crate::layout::{IMAGE_SENTINEL, PARENT_MARKER};

/// True when the layer directory carries a chain marker.
pub fn is_lazy(layer_dir: &Path) -> bool {
    layer_dir.join(PARENT_MARKER).symlink_metadata().is_ok()
}

/// Chain root the layer belongs to, read from its marker.
pub fn chain_root(layer_dir: &Path) -> Result<PathBuf> {
    let marker = layer_dir.join(PARENT_MARKER);
    fs::read_link(&marker).map_err(|source| StoreError::Marker {
        path: marker,
        source,
    })
}

/// Marks `layer_dir` as its own chain root.
pub fn mark_chain_root(layer_dir: &Path) -> Result<()> {
    symlink(layer_dir, layer_dir.join(PARENT_MARKER))?;
    Ok(())
}

/// Copies the parent's marker onto a freshly created child so the
/// whole chain keeps resolving to one root.
pub fn propagate_marker(parent_dir: &Path, child_dir: &Path) -> Result<()> {
    let root = chain_root(parent_dir)?;
    symlink(&root, child_dir.join(PARENT_MARKER))?;
    Ok(())
}

/// Image name recorded in an index tree. The sentinel is a symlink
/// whose target is the name itself, so no file content is read.
pub fn image_name(index_dir: &Path) -> Result<String> {
    let sentinel = index_dir.join(IMAGE_SENTINEL);
    let target = fs::read_link(&sentinel).map_err(|source| StoreError::Marker {
        path: sentinel,
        source,
    })?;
    Ok(target.to_string_lossy().into_owned())
}

/// Records the image name sentinel inside an index tree.
pub fn write_image_name(index_dir: &Path, image: &str) -> Result<()> {
    symlink(image, index_dir.join(IMAGE_SENTINEL))?;
    Ok(())
}
