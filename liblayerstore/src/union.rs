//! Union mount seam used while assembling an export archive.

use std::path::Path;

use async_trait::async_trait;
use nix::mount::{MntFlags, MsFlags, mount, umount2};

use crate::error::{Result, StoreError};

/// Composes a lower and an upper directory into a merged view. Export
/// packs the merged view, so the trait only needs mount and unmount.
#[async_trait]
pub trait UnionMount: Send + Sync {
    async fn mount(&self, lower: &Path, upper: &Path, work: &Path, merged: &Path) -> Result<()>;
    async fn unmount(&self, merged: &Path) -> Result<()>;
}

/// Kernel overlayfs. Requires mount privileges.
pub struct OverlayUnion;

#[async_trait]
impl UnionMount for OverlayUnion {
    async fn mount(&self, lower: &Path, upper: &Path, work: &Path, merged: &Path) -> Result<()> {
        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.display(),
            upper.display(),
            work.display()
        );
        mount::<str, Path, str, str>(
            Some("overlay"),
            merged,
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_str()),
        )
        .map_err(|err| {
            StoreError::Union(format!("overlay on {} failed: {err}", merged.display()))
        })
    }

    async fn unmount(&self, merged: &Path) -> Result<()> {
        umount2(merged, MntFlags::MNT_DETACH).map_err(|err| {
            StoreError::Union(format!("detach of {} failed: {err}", merged.display()))
        })
    }
}
