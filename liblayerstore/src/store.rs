//! The store front: decides which layers are lazy, runs their chain
//! mounts, recognizes lazy archives on apply, and drives the export
//! transform. Ordinary layers pass straight through to the wrapped
//! driver.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use liblazy_fs::LazyFs;
use liblazy_fs::fetch::{AccessMonitor, FetchAgent};
use liblazy_fs::lazyfs::Materializer;
use liblazy_fs::server::{detach_mount, mount_lazyfs};
use rfuse3::raw::MountHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::chain;
use crate::error::{Result, StoreError};
use crate::export;
use crate::layout::{CONTENT_DIR, IMAGE_SENTINEL, INDEX_DIR, OVERRIDE_DIR, StoreLayout};
use crate::registry::{MountRegistry, ReleaseOutcome};
use crate::union::UnionMount;
use crate::upload::RemoteBlobStore;

/// The wrapped layer driver. It owns plain layer storage under the
/// store home; the lazy store only steps in for layers that carry a
/// chain marker.
#[async_trait]
pub trait LayerDriver: Send + Sync {
    /// Creates storage for a read-only layer.
    async fn create(&self, id: &str, parent: Option<&str>) -> Result<()>;
    /// Creates storage for a writable layer on top of `parent`.
    async fn create_writable(&self, id: &str, parent: Option<&str>) -> Result<()>;
    async fn remove(&self, id: &str) -> Result<()>;
    /// Unpacks a layer archive into the layer's content tree and
    /// returns the applied size.
    async fn apply(&self, id: &str, archive: &Path) -> Result<u64>;
}

pub struct LazyLayerStore {
    home: PathBuf,
    layout: StoreLayout,
    driver: Arc<dyn LayerDriver>,
    registry: MountRegistry<MountHandle>,
    agent: Arc<dyn FetchAgent>,
    monitor: Option<Arc<dyn AccessMonitor>>,
    blobs: Arc<dyn RemoteBlobStore>,
    union: Arc<dyn UnionMount>,
}

impl LazyLayerStore {
    pub fn new(
        home: PathBuf,
        layout: StoreLayout,
        driver: Arc<dyn LayerDriver>,
        agent: Arc<dyn FetchAgent>,
        monitor: Option<Arc<dyn AccessMonitor>>,
        blobs: Arc<dyn RemoteBlobStore>,
        union: Arc<dyn UnionMount>,
    ) -> Result<Self> {
        fs::create_dir_all(&home)?;
        Ok(LazyLayerStore {
            home,
            layout,
            driver,
            registry: MountRegistry::new(),
            agent,
            monitor,
            blobs,
            union,
        })
    }

    fn layer_dir(&self, id: &str) -> PathBuf {
        self.home.join(id)
    }

    /// True when the layer belongs to a lazy chain.
    pub fn is_lazy(&self, id: &str) -> bool {
        chain::is_lazy(&self.layer_dir(id))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.layer_dir(id).exists()
    }

    /// Counts a consumer of the layer's chain and returns the path its
    /// content is served under. The first consumer of a chain starts
    /// the engine; the call returns only once the mount is live, so
    /// the caller may use the path immediately.
    pub async fn acquire(&self, id: &str) -> Result<PathBuf> {
        let layer_dir = self.layer_dir(id);
        if !chain::is_lazy(&layer_dir) {
            return Err(StoreError::NotLazy(id.to_string()));
        }
        let root = chain::chain_root(&layer_dir)?;
        let mountpoint = root.join(CONTENT_DIR);
        let index_dir = root.join(INDEX_DIR);
        let override_dir = root.join(OVERRIDE_DIR);

        let image = chain::image_name(&index_dir)?;
        let cache_dir = self.layout.private_dir(&image);
        fs::create_dir_all(&cache_dir)?;

        let count = self
            .registry
            .acquire(&mountpoint, || {
                let agent = Arc::clone(&self.agent);
                let monitor = self.monitor.clone();
                let index_dir = index_dir.clone();
                let override_dir = override_dir.clone();
                let cache_dir = cache_dir.clone();
                let mountpoint = mountpoint.clone();
                async move {
                    let materializer = Materializer::new(cache_dir, agent, monitor);
                    let engine = LazyFs::new(index_dir, override_dir, materializer)?;
                    fs::create_dir_all(&mountpoint)?;
                    mount_lazyfs(engine, mountpoint.as_os_str())
                        .await
                        .map_err(|err| StoreError::Mount(mountpoint.clone(), err))
                }
            })
            .await?;

        debug!(id, mountpoint = %mountpoint.display(), count, "chain acquired");
        Ok(mountpoint)
    }

    /// Drops one consumer of the layer's chain. The last release stops
    /// the engine and returns the chain's mountpoint and override
    /// layer to empty directories, ready for the next first acquire.
    pub async fn release(&self, id: &str) -> Result<()> {
        let layer_dir = self.layer_dir(id);
        if !chain::is_lazy(&layer_dir) {
            return Err(StoreError::NotLazy(id.to_string()));
        }
        let root = chain::chain_root(&layer_dir)?;
        let mountpoint = root.join(CONTENT_DIR);
        let override_dir = root.join(OVERRIDE_DIR);

        let outcome = self
            .registry
            .release(&mountpoint, |handle| {
                let mountpoint = mountpoint.clone();
                let override_dir = override_dir.clone();
                async move {
                    teardown_mount(handle, &mountpoint, &override_dir).await;
                }
            })
            .await;

        match outcome {
            ReleaseOutcome::NotMounted => {
                warn!(id, "release without a matching acquire");
            }
            ReleaseOutcome::StillMounted(count) => {
                debug!(id, count, "chain still in use");
            }
            ReleaseOutcome::Stopped => {
                info!(id, mountpoint = %mountpoint.display(), "chain torn down");
            }
        }
        Ok(())
    }

    /// Creates a read-only layer through the wrapped driver, then
    /// extends the parent's chain onto the child when the parent is
    /// lazy.
    pub async fn create(&self, id: &str, parent: Option<&str>) -> Result<()> {
        self.driver.create(id, parent).await?;
        self.extend_chain(id, parent)
    }

    /// Same as [`create`](Self::create) for writable layers. This is
    /// the path container creation takes, so a container on a lazy
    /// image ends up marked into the image's chain.
    pub async fn create_writable(&self, id: &str, parent: Option<&str>) -> Result<()> {
        self.driver.create_writable(id, parent).await?;
        self.extend_chain(id, parent)
    }

    fn extend_chain(&self, id: &str, parent: Option<&str>) -> Result<()> {
        let Some(parent) = parent else {
            return Ok(());
        };
        let parent_dir = self.layer_dir(parent);
        if !chain::is_lazy(&parent_dir) {
            return Ok(());
        }
        chain::propagate_marker(&parent_dir, &self.layer_dir(id))?;
        debug!(id, parent, "chain marker propagated");
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.driver.remove(id).await
    }

    /// Applies a pulled layer archive. The wrapped driver unpacks it
    /// first; when the unpacked tree turns out to carry the image
    /// sentinel, the layer is rebuilt as a chain root: the content
    /// tree is cleared back to a mountpoint and the archive is
    /// unpacked as the canonical index next to it.
    pub async fn apply_layer(&self, id: &str, archive: &Path) -> Result<u64> {
        let size = self.driver.apply(id, archive).await?;

        let layer_dir = self.layer_dir(id);
        let scratch = layer_dir.join(CONTENT_DIR);
        if scratch.join(IMAGE_SENTINEL).symlink_metadata().is_err() {
            return Ok(size);
        }
        info!(id, "archive carries a placeholder index, rebuilding as chain root");

        fs::remove_dir_all(&scratch)?;
        fs::create_dir_all(&scratch)?;
        let index_dir = layer_dir.join(INDEX_DIR);
        fs::create_dir_all(&index_dir)?;
        chain::mark_chain_root(&layer_dir)?;

        unpack_archive(archive, &index_dir).await?;

        // The wrapped driver's lower bookkeeping does not apply to a
        // chain root.
        let lower = layer_dir.join("lower");
        if lower.exists()
            && let Err(err) = fs::remove_file(&lower)
        {
            warn!(id, %err, "stale lower file left behind");
        }

        dir_size(&index_dir)
    }

    /// Inverts the layer's content tree to placeholders and packs the
    /// push archive. See [`export`] for the shape of the result. Must
    /// not run while the layer's chain is mounted.
    pub async fn export_transform(&self, id: &str) -> Result<File> {
        let layer_dir = self.layer_dir(id);
        if !chain::is_lazy(&layer_dir) {
            return Err(StoreError::NotLazy(id.to_string()));
        }
        let root = chain::chain_root(&layer_dir)?;

        export::export_layer(
            &layer_dir.join(CONTENT_DIR),
            &root.join(INDEX_DIR),
            &layer_dir,
            &self.layout.push_dir(id),
            self.blobs.as_ref(),
            self.union.as_ref(),
        )
        .await
    }
}

/// Stops a chain engine and returns its directories to the empty
/// state the next first-acquire expects. Unmount failures fall back
/// to a bounded number of external umount attempts; after that the
/// directory cleanup is attempted anyway and failures are logged
/// rather than surfaced, matching the best-effort nature of release.
async fn teardown_mount(handle: MountHandle, mountpoint: &Path, override_dir: &Path) {
    if let Err(err) = handle.unmount().await {
        warn!(mountpoint = %mountpoint.display(), %err, "session unmount failed, detaching");
        if !detach_mount(mountpoint, 3).await {
            warn!(mountpoint = %mountpoint.display(), "mountpoint still attached");
        }
    }
    for dir in [mountpoint, override_dir] {
        if let Err(err) = fs::remove_dir_all(dir)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            warn!(dir = %dir.display(), %err, "could not clear chain directory");
        }
        if let Err(err) = fs::create_dir_all(dir) {
            warn!(dir = %dir.display(), %err, "could not recreate chain directory");
        }
    }
}

async fn unpack_archive(archive: &Path, dest: &Path) -> Result<()> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = File::open(&archive)?;
        let mut reader = tar::Archive::new(file);
        reader.set_preserve_permissions(true);
        reader.unpack(&dest)?;
        Ok(())
    })
    .await
    .map_err(|err| StoreError::Archive(format!("unpack task failed: {err}")))?
}

/// Bytes held in regular files under `root`.
fn dir_size(root: &Path) -> Result<u64> {
    let mut total = 0;
    for entry_result in WalkDir::new(root).follow_links(false) {
        let entry = entry_result.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map(|meta| meta.len()).unwrap_or(0);
        }
    }
    Ok(total)
}
