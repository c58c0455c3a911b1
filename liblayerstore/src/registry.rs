//! Reference-counted registry of running chain mounts.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::debug;

struct MountEntry<H> {
    count: u64,
    handle: H,
}

/// What a release did to the entry it named.
#[derive(Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// No entry existed. The count never goes negative; an unbalanced
    /// release is reported instead of being absorbed into the next
    /// acquisition.
    NotMounted,
    /// Other consumers remain, carrying the count that is left.
    StillMounted(u64),
    /// Last consumer gone, the stop action ran.
    Stopped,
}

/// Maps a mountpoint to its running engine handle plus a consumer
/// count. The map lock is held across the start and stop actions, so
/// racing consumers of one mountpoint observe exactly one start and
/// exactly one stop no matter how they interleave.
pub struct MountRegistry<H> {
    mounts: Mutex<HashMap<PathBuf, MountEntry<H>>>,
}

impl<H> MountRegistry<H> {
    pub fn new() -> Self {
        MountRegistry {
            mounts: Mutex::new(HashMap::new()),
        }
    }

    /// Counts a consumer of `mountpoint`, running `start` first when no
    /// engine is up yet. Returns the count after this acquisition, with
    /// the mount live. A failed start leaves no entry behind.
    pub async fn acquire<F, Fut, E>(&self, mountpoint: &Path, start: F) -> Result<u64, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<H, E>>,
    {
        let mut mounts = self.mounts.lock().await;
        if let Some(entry) = mounts.get_mut(mountpoint) {
            entry.count += 1;
            debug!(mountpoint = %mountpoint.display(), count = entry.count, "mount reused");
            return Ok(entry.count);
        }
        let handle = start().await?;
        mounts.insert(mountpoint.to_path_buf(), MountEntry { count: 1, handle });
        debug!(mountpoint = %mountpoint.display(), "mount started");
        Ok(1)
    }

    /// Drops one consumer of `mountpoint`. When the count reaches zero
    /// the entry is removed and `stop` runs with the stored handle.
    pub async fn release<F, Fut>(&self, mountpoint: &Path, stop: F) -> ReleaseOutcome
    where
        F: FnOnce(H) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut mounts = self.mounts.lock().await;
        let remaining = match mounts.get_mut(mountpoint) {
            None => return ReleaseOutcome::NotMounted,
            Some(entry) => {
                entry.count -= 1;
                entry.count
            }
        };
        if remaining > 0 {
            debug!(mountpoint = %mountpoint.display(), count = remaining, "mount still in use");
            return ReleaseOutcome::StillMounted(remaining);
        }
        let entry = match mounts.remove(mountpoint) {
            Some(entry) => entry,
            None => return ReleaseOutcome::NotMounted,
        };
        stop(entry.handle).await;
        debug!(mountpoint = %mountpoint.display(), "mount stopped");
        ReleaseOutcome::Stopped
    }

    /// Consumer count, zero when nothing is mounted there.
    pub async fn count(&self, mountpoint: &Path) -> u64 {
        self.mounts
            .lock()
            .await
            .get(mountpoint)
            .map(|entry| entry.count)
            .unwrap_or(0)
    }

    pub async fn is_mounted(&self, mountpoint: &Path) -> bool {
        self.mounts.lock().await.contains_key(mountpoint)
    }
}

impl<H> Default for MountRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn counts_balance_to_a_single_stop() {
        let registry: MountRegistry<u32> = MountRegistry::new();
        let starts = AtomicUsize::new(0);
        let stops = AtomicUsize::new(0);
        let target = Path::new("/tmp/lazylayer-registry-test");

        for expected in 1..=3u64 {
            let count = registry
                .acquire(target, || async {
                    starts.fetch_add(1, Ordering::SeqCst);
                    Ok::<u32, std::io::Error>(7)
                })
                .await
                .unwrap();
            assert_eq!(count, expected);
        }
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        for expected in [
            ReleaseOutcome::StillMounted(2),
            ReleaseOutcome::StillMounted(1),
            ReleaseOutcome::Stopped,
        ] {
            let outcome = registry
                .release(target, |handle| {
                    assert_eq!(handle, 7);
                    stops.fetch_add(1, Ordering::SeqCst);
                    async {}
                })
                .await;
            assert_eq!(outcome, expected);
        }
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(!registry.is_mounted(target).await);
    }

    #[tokio::test]
    async fn concurrent_first_acquires_start_once() {
        let registry: Arc<MountRegistry<u32>> = Arc::new(MountRegistry::new());
        let starts = Arc::new(AtomicUsize::new(0));
        let target = PathBuf::from("/tmp/lazylayer-registry-race");

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let registry = Arc::clone(&registry);
            let starts = Arc::clone(&starts);
            let target = target.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .acquire(&target, || async {
                        starts.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<u32, std::io::Error>(0)
                    })
                    .await
                    .unwrap()
            }));
        }
        let mut counts = Vec::new();
        for task in tasks {
            counts.push(task.await.unwrap());
        }
        counts.sort_unstable();

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(counts, vec![1, 2]);
        assert_eq!(registry.count(&target).await, 2);
    }

    #[tokio::test]
    async fn release_without_acquire_is_reported() {
        let registry: MountRegistry<u32> = MountRegistry::new();
        let outcome = registry
            .release(Path::new("/tmp/never-mounted"), |_| async {})
            .await;
        assert_eq!(outcome, ReleaseOutcome::NotMounted);
        assert_eq!(registry.count(Path::new("/tmp/never-mounted")).await, 0);
    }

    #[tokio::test]
    async fn failed_start_leaves_no_entry() {
        let registry: MountRegistry<u32> = MountRegistry::new();
        let target = Path::new("/tmp/lazylayer-registry-fail");

        let err = registry
            .acquire(target, || async {
                Err::<u32, _>(std::io::Error::other("no fuse"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no fuse");
        assert!(!registry.is_mounted(target).await);

        let count = registry
            .acquire(target, || async { Ok::<u32, std::io::Error>(1) })
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
