//! On-disk layout of the store root.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};

/// Marker symlink tying a layer to its chain root.
pub const PARENT_MARKER: &str = "lazy-parent";
/// Canonical placeholder index of a chain root.
pub const INDEX_DIR: &str = "lazy-diff";
/// Symlink inside an index tree whose target names the image, and so
/// the private cache the chain materializes from.
pub const IMAGE_SENTINEL: &str = "lazy-image";
/// Content tree of a layer. On a chain root it doubles as the
/// mountpoint of the virtual filesystem.
pub const CONTENT_DIR: &str = "diff";
/// Override layer of a chain root.
pub const OVERRIDE_DIR: &str = "upper";

const ROOT_PATH: &str = "/var/lib/lazylayer";

/// Directories under the store root: `private/<image>` holds cache
/// blobs keyed by hash, `build/<image>/<tag>/files` holds placeholder
/// trees handed over by the build side, `push/<layer>` stages blobs
/// for upload during export.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    /// Uses `root` when given, `/var/lib/lazylayer` when running as
    /// root, the user data directory otherwise. The layout directories
    /// are created up front.
    pub fn new(root: Option<PathBuf>) -> Result<Self> {
        let root = match root {
            Some(root) => root,
            None if nix::unistd::getuid().is_root() => PathBuf::from(ROOT_PATH),
            None => dirs::data_dir()
                .ok_or_else(|| StoreError::Config("no user data directory".to_string()))?
                .join("lazylayer"),
        };
        let layout = StoreLayout { root };
        for dir in [
            layout.private_root(),
            layout.build_root(),
            layout.push_root(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(layout)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn private_root(&self) -> PathBuf {
        self.root.join("private")
    }

    pub fn build_root(&self) -> PathBuf {
        self.root.join("build")
    }

    pub fn push_root(&self) -> PathBuf {
        self.root.join("push")
    }

    /// Private cache of one image. Not created here: acquisition
    /// creates it on first use so an image that is never mounted
    /// leaves no trace.
    pub fn private_dir(&self, image: &str) -> PathBuf {
        self.private_root().join(image)
    }

    /// Placeholder tree delivered by the build side for `image:tag`.
    pub fn build_files(&self, image: &str, tag: &str) -> PathBuf {
        self.build_root().join(image).join(tag).join("files")
    }

    /// Export staging directory for one layer.
    pub fn push_dir(&self, layer: &str) -> PathBuf {
        self.push_root().join(layer)
    }
}
