use std::fs::Metadata;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::unistd::{Gid, Uid, chown};
use tracing::{debug, warn};

use crate::error::{LazyFsError, Result};
use crate::fetch::{AccessMonitor, FetchAgent};

use super::resolve::read_hash;

/// Turns placeholder entries into readable files of the private cache.
///
/// Concurrent callers racing on the same hash are tolerated: the agent
/// rewrites the blob with identical content, so the loser's fetch is
/// wasted but harmless. No lock is held across a fetch.
pub struct Materializer {
    cache_root: PathBuf,
    agent: Arc<dyn FetchAgent>,
    monitor: Option<Arc<dyn AccessMonitor>>,
}

impl Materializer {
    pub fn new(
        cache_root: PathBuf,
        agent: Arc<dyn FetchAgent>,
        monitor: Option<Arc<dyn AccessMonitor>>,
    ) -> Self {
        Materializer {
            cache_root,
            agent,
            monitor,
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Cache file a blob with this hash lives at.
    pub fn cache_path(&self, hash: &str) -> PathBuf {
        self.cache_root.join(hash)
    }

    /// Guarantee readable bytes for the placeholder at `index_path` and
    /// return the backing cache file. `meta` is the placeholder's own
    /// metadata, whose mode and ownership the cache file must end up with.
    pub async fn materialize(&self, index_path: &Path, meta: &Metadata) -> Result<PathBuf> {
        let hash = read_hash(index_path)?;

        if let Some(monitor) = &self.monitor {
            let monitor = Arc::clone(monitor);
            let origin = index_path.to_path_buf();
            let hash = hash.clone();
            tokio::spawn(async move {
                monitor.record(&origin, &hash).await;
            });
        }

        let cached = self.cache_path(&hash);
        if !cached.exists() {
            debug!(hash = %hash, "cache miss, asking fetch agent");
            self.agent
                .fetch(&hash, &self.cache_root, meta.mode() & 0o7777)
                .await?;
            if !cached.exists() {
                return Err(LazyFsError::FetchFailed {
                    hash,
                    reason: "agent reported success but the blob is missing".to_string(),
                });
            }

            // The agent is not trusted with metadata: reapply mode and
            // ownership from the index entry.
            let perms = std::fs::Permissions::from_mode(meta.mode() & 0o7777);
            if let Err(err) = std::fs::set_permissions(&cached, perms) {
                warn!(path = %cached.display(), %err, "failed to restore blob mode");
            }
            if let Err(err) = chown(
                &cached,
                Some(Uid::from_raw(meta.uid())),
                Some(Gid::from_raw(meta.gid())),
            ) {
                warn!(path = %cached.display(), %err, "failed to restore blob ownership");
            }
        }

        Ok(cached)
    }
}
