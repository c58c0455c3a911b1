//! The lazy filesystem engine.
//!
//! [`LazyFs`] serves one layer as a read-oriented mount composed of three
//! trees: a placeholder index (shape and metadata of the original layer,
//! regular files hold content hashes), a writable override layer that
//! shadows the index path-for-path, and a content-addressed private cache
//! the real bytes are pulled into on first use.

pub mod materialize;
pub mod resolve;

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::num::NonZeroU32;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::Iter;
use rfuse3::raw::prelude::*;
use rfuse3::raw::Filesystem;
use rfuse3::{Errno, Result};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::LazyFsError;
use crate::util::{attr_from_metadata, filetype_from_mode, zeroed_attr};

pub use materialize::Materializer;
pub use resolve::{Resolved, is_hash_like, read_hash, resolve};

const ROOT_INODE: u64 = 1;
const TTL: Duration = Duration::from_secs(1);

/// Inode space of one mount. Paths are relative to the layer root; the
/// root itself is inode 1 with the empty path.
struct InodeTable {
    next: u64,
    by_ino: HashMap<u64, InodeEntry>,
    by_path: HashMap<PathBuf, u64>,
}

struct InodeEntry {
    rel: PathBuf,
    lookups: u64,
}

impl InodeTable {
    fn new() -> Self {
        let mut table = InodeTable {
            next: ROOT_INODE + 1,
            by_ino: HashMap::new(),
            by_path: HashMap::new(),
        };
        table.by_ino.insert(
            ROOT_INODE,
            InodeEntry {
                rel: PathBuf::new(),
                lookups: 1,
            },
        );
        table.by_path.insert(PathBuf::new(), ROOT_INODE);
        table
    }

    fn rel_of(&self, ino: u64) -> Option<PathBuf> {
        self.by_ino.get(&ino).map(|entry| entry.rel.clone())
    }

    /// Inode for `rel`, allocated on first sight. `remember` counts a
    /// kernel reference that a later `forget` drops.
    fn assign(&mut self, rel: &Path, remember: bool) -> u64 {
        if let Some(&ino) = self.by_path.get(rel) {
            if remember && let Some(entry) = self.by_ino.get_mut(&ino) {
                entry.lookups += 1;
            }
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(
            ino,
            InodeEntry {
                rel: rel.to_path_buf(),
                lookups: u64::from(remember),
            },
        );
        self.by_path.insert(rel.to_path_buf(), ino);
        ino
    }

    fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == ROOT_INODE {
            return;
        }
        if let Some(entry) = self.by_ino.get_mut(&ino) {
            entry.lookups = entry.lookups.saturating_sub(nlookup);
            if entry.lookups == 0 {
                let rel = entry.rel.clone();
                self.by_ino.remove(&ino);
                self.by_path.remove(&rel);
            }
        }
    }
}

/// Open files. A handle is bound at open time to exactly one backing file
/// (override, cache or raw index entry) and keeps it for its lifetime.
#[derive(Default)]
struct HandleTable {
    next: u64,
    open: HashMap<u64, Arc<File>>,
}

impl HandleTable {
    fn insert(&mut self, file: File) -> u64 {
        self.next += 1;
        self.open.insert(self.next, Arc::new(file));
        self.next
    }

    fn get(&self, fh: u64) -> Option<Arc<File>> {
        self.open.get(&fh).cloned()
    }

    fn remove(&mut self, fh: u64) {
        self.open.remove(&fh);
    }
}

/// Filesystem engine over {placeholder index, override layer, private
/// cache}. Reads are position-based over the backing file fixed at open;
/// the engine itself never writes into any of the three trees except
/// through materialization into the cache.
pub struct LazyFs {
    index_root: PathBuf,
    override_root: PathBuf,
    materializer: Materializer,
    inodes: RwLock<InodeTable>,
    handles: Mutex<HandleTable>,
}

impl LazyFs {
    /// Build an engine over `index_root` (must be an existing directory)
    /// and `override_root` (created if absent), backed by the
    /// materializer's cache (also created if absent).
    pub fn new(
        index_root: PathBuf,
        override_root: PathBuf,
        materializer: Materializer,
    ) -> std::result::Result<Self, LazyFsError> {
        match std::fs::metadata(&index_root) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(LazyFsError::InvalidConfig(format!(
                    "index tree {} is not a directory",
                    index_root.display()
                )));
            }
            Err(err) => {
                return Err(LazyFsError::InvalidConfig(format!(
                    "index tree {} is unusable: {err}",
                    index_root.display()
                )));
            }
        }
        std::fs::create_dir_all(&override_root)?;
        std::fs::create_dir_all(materializer.cache_root())?;

        Ok(LazyFs {
            index_root,
            override_root,
            materializer,
            inodes: RwLock::new(InodeTable::new()),
            handles: Mutex::new(HandleTable::default()),
        })
    }

    async fn rel_of(&self, ino: u64) -> Result<PathBuf> {
        self.inodes
            .read()
            .await
            .rel_of(ino)
            .ok_or_else(|| Errno::from(libc::ENOENT))
    }

    fn resolve_rel(&self, rel: &Path) -> Resolved {
        resolve(&self.index_root, &self.override_root, rel)
    }

    /// Attributes of a resolved entry, plus whether it is a regular
    /// placeholder whose bytes are still remote (its reported size is the
    /// hash text, not the content).
    ///
    /// With `allow_fetch` the blob is materialized so size and blocks
    /// come from the cache file; without it the cache is only consulted.
    /// Metadata failures degrade to the index entry's own numbers.
    async fn resolved_attr(&self, resolved: &Resolved, allow_fetch: bool) -> (FileAttr, bool) {
        match resolved {
            Resolved::OverrideHit { meta, .. }
            | Resolved::PlaceholderDir { meta, .. }
            | Resolved::PlaceholderSymlink { meta, .. }
            | Resolved::PlaceholderSpecial { meta, .. } => (attr_from_metadata(meta), false),
            Resolved::PlaceholderFile { path, meta } => {
                let mut attr = attr_from_metadata(meta);
                if allow_fetch {
                    match self.materializer.materialize(path, meta).await {
                        Ok(cached) => match std::fs::metadata(&cached) {
                            Ok(cache_meta) => {
                                attr.size = cache_meta.size();
                                attr.blocks = cache_meta.blocks();
                                return (attr, false);
                            }
                            Err(err) => {
                                warn!(path = %cached.display(), %err, "materialized blob vanished");
                                return (attr, true);
                            }
                        },
                        Err(err) => {
                            warn!(
                                path = %path.display(), %err,
                                "materialization failed, serving placeholder metadata"
                            );
                            return (attr, true);
                        }
                    }
                }
                if let Ok(hash) = read_hash(path)
                    && let Ok(cache_meta) = std::fs::metadata(self.materializer.cache_path(&hash))
                {
                    attr.size = cache_meta.size();
                    attr.blocks = cache_meta.blocks();
                    return (attr, false);
                }
                (attr, true)
            }
            Resolved::Miss => (zeroed_attr(0, FileType::RegularFile), true),
        }
    }

    /// Names of the index entries under `rel`, sorted. Listing enumerates
    /// the index tree only; a directory present solely in the override
    /// layer lists empty.
    fn index_names(&self, rel: &Path) -> Result<Vec<OsString>> {
        let dir = self.index_root.join(rel);
        let iter = match std::fs::read_dir(&dir) {
            Ok(iter) => iter,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_errno(err)),
        };
        let mut names: Vec<OsString> = iter
            .filter_map(|entry| entry.ok().map(|entry| entry.file_name()))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Index-side classification of one child. Failures degrade to a
    /// regular file so one broken entry cannot abort the listing.
    fn index_kind(&self, rel: &Path) -> (FileType, u64) {
        let path = self.index_root.join(rel);
        match path.symlink_metadata() {
            Ok(meta) => (filetype_from_mode(meta.mode()), meta.ino()),
            Err(err) => {
                warn!(path = %path.display(), %err, "index entry not statable");
                (FileType::RegularFile, ROOT_INODE)
            }
        }
    }
}

impl Filesystem for LazyFs {
    type DirEntryStream<'a>
        = Iter<std::vec::IntoIter<Result<DirectoryEntry>>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Iter<std::vec::IntoIter<Result<DirectoryEntryPlus>>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> Result<ReplyInit> {
        info!(
            index = %self.index_root.display(),
            cache = %self.materializer.cache_root().display(),
            "lazy filesystem serving"
        );
        Ok(ReplyInit {
            max_write: NonZeroU32::new(1024 * 1024).unwrap(),
        })
    }

    async fn destroy(&self, _req: Request) {
        info!(index = %self.index_root.display(), "lazy filesystem stopped");
    }

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> Result<ReplyEntry> {
        let parent_rel = self.rel_of(parent).await?;
        let rel = parent_rel.join(name);
        debug!(rel = %rel.display(), "lookup");

        let resolved = self.resolve_rel(&rel);
        if matches!(resolved, Resolved::Miss) {
            return Err(libc::ENOENT.into());
        }
        let (mut attr, pending) = self.resolved_attr(&resolved, true).await;
        attr.ino = self.inodes.write().await.assign(&rel, true);
        Ok(ReplyEntry {
            ttl: if pending { Duration::ZERO } else { TTL },
            attr,
            generation: 0,
        })
    }

    async fn forget(&self, _req: Request, inode: u64, nlookup: u64) {
        self.inodes.write().await.forget(inode, nlookup);
    }

    async fn getattr(
        &self,
        _req: Request,
        inode: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> Result<ReplyAttr> {
        let rel = self.rel_of(inode).await?;
        debug!(rel = %rel.display(), "getattr");

        let resolved = self.resolve_rel(&rel);
        if matches!(resolved, Resolved::Miss) {
            return Err(libc::ENOENT.into());
        }
        let (mut attr, _) = self.resolved_attr(&resolved, true).await;
        attr.ino = inode;
        Ok(ReplyAttr { ttl: TTL, attr })
    }

    async fn readlink(&self, _req: Request, inode: u64) -> Result<ReplyData> {
        let rel = self.rel_of(inode).await?;
        debug!(rel = %rel.display(), "readlink");

        let target = match self.resolve_rel(&rel) {
            Resolved::OverrideHit { path, meta } if meta.file_type().is_symlink() => {
                std::fs::read_link(&path).map_err(io_errno)?
            }
            Resolved::PlaceholderSymlink { path, .. } => {
                std::fs::read_link(&path).map_err(io_errno)?
            }
            Resolved::Miss => return Err(libc::ENOENT.into()),
            _ => return Err(libc::EINVAL.into()),
        };
        Ok(ReplyData {
            data: target.as_os_str().as_bytes().to_vec().into(),
        })
    }

    async fn open(&self, _req: Request, inode: u64, flags: u32) -> Result<ReplyOpen> {
        let rel = self.rel_of(inode).await?;
        debug!(rel = %rel.display(), flags, "open");

        let file = match self.resolve_rel(&rel) {
            Resolved::OverrideHit { path, meta } => {
                if meta.is_dir() {
                    return Err(libc::EISDIR.into());
                }
                File::open(&path).map_err(io_errno)?
            }
            Resolved::PlaceholderFile { path, meta } => {
                let cached = self
                    .materializer
                    .materialize(&path, &meta)
                    .await
                    .map_err(|err| {
                        warn!(rel = %rel.display(), %err, "cannot materialize for open");
                        err.errno()
                    })?;
                File::open(&cached).map_err(io_errno)?
            }
            Resolved::PlaceholderDir { .. } => return Err(libc::EISDIR.into()),
            Resolved::PlaceholderSymlink { path, .. }
            | Resolved::PlaceholderSpecial { path, .. } => File::open(&path).map_err(io_errno)?,
            Resolved::Miss => return Err(libc::ENOENT.into()),
        };

        let fh = self.handles.lock().await.insert(file);
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        inode: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<ReplyData> {
        debug!(inode, fh, offset, size, "read");
        let file = self
            .handles
            .lock()
            .await
            .get(fh)
            .ok_or_else(|| Errno::from(libc::EBADF))?;

        let data = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; size as usize];
            let mut filled = 0usize;
            while filled < buf.len() {
                match file.read_at(&mut buf[filled..], offset + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(err) => return Err(err),
                }
            }
            buf.truncate(filled);
            Ok(buf)
        })
        .await
        .map_err(|_| Errno::from(libc::EIO))?
        .map_err(io_errno)?;

        Ok(ReplyData { data: data.into() })
    }

    async fn release(
        &self,
        _req: Request,
        inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> Result<()> {
        debug!(inode, fh, "release");
        self.handles.lock().await.remove(fh);
        Ok(())
    }

    async fn opendir(&self, _req: Request, inode: u64, _flags: u32) -> Result<ReplyOpen> {
        let rel = self.rel_of(inode).await?;
        match self.resolve_rel(&rel) {
            Resolved::OverrideHit { meta, .. } if meta.is_dir() => {}
            Resolved::PlaceholderDir { .. } => {}
            Resolved::Miss => return Err(libc::ENOENT.into()),
            _ => return Err(libc::ENOTDIR.into()),
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        parent: u64,
        _fh: u64,
        offset: i64,
    ) -> Result<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let rel = self.rel_of(parent).await?;
        debug!(rel = %rel.display(), offset, "readdir");

        let parent_ino = match rel.parent() {
            Some(up) => self.inodes.read().await.by_path.get(up).copied().unwrap_or(ROOT_INODE),
            None => ROOT_INODE,
        };

        let mut entries = vec![
            DirectoryEntry {
                inode: parent,
                offset: 1,
                kind: FileType::Directory,
                name: OsString::from("."),
            },
            DirectoryEntry {
                inode: parent_ino,
                offset: 2,
                kind: FileType::Directory,
                name: OsString::from(".."),
            },
        ];

        let mut next_offset = 3;
        for name in self.index_names(&rel)? {
            let child_rel = rel.join(&name);
            let (kind, backing_ino) = self.index_kind(&child_rel);
            entries.push(DirectoryEntry {
                inode: backing_ino,
                offset: next_offset,
                kind,
                name,
            });
            next_offset += 1;
        }

        let filtered: Vec<_> = entries
            .into_iter()
            .filter(|entry| entry.offset > offset)
            .map(Ok)
            .collect();
        Ok(ReplyDirectory {
            entries: futures_util::stream::iter(filtered),
        })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        parent: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let rel = self.rel_of(parent).await?;
        debug!(rel = %rel.display(), offset, "readdirplus");

        let self_resolved = self.resolve_rel(&rel);
        let (mut self_attr, _) = self.resolved_attr(&self_resolved, false).await;
        self_attr.ino = parent;

        let (parent_ino, mut up_attr) = match rel.parent() {
            Some(up) => {
                let ino = self
                    .inodes
                    .read()
                    .await
                    .by_path
                    .get(up)
                    .copied()
                    .unwrap_or(ROOT_INODE);
                let (attr, _) = self.resolved_attr(&self.resolve_rel(up), false).await;
                (ino, attr)
            }
            None => (ROOT_INODE, self_attr.clone()),
        };
        up_attr.ino = parent_ino;

        let mut entries = vec![
            DirectoryEntryPlus {
                inode: parent,
                generation: 0,
                kind: FileType::Directory,
                name: OsString::from("."),
                offset: 1,
                attr: self_attr,
                entry_ttl: TTL,
                attr_ttl: TTL,
            },
            DirectoryEntryPlus {
                inode: parent_ino,
                generation: 0,
                kind: FileType::Directory,
                name: OsString::from(".."),
                offset: 2,
                attr: up_attr,
                entry_ttl: TTL,
                attr_ttl: TTL,
            },
        ];

        let mut next_offset = 3;
        for name in self.index_names(&rel)? {
            let child_rel = rel.join(&name);
            // Classification comes from the index entry; the resolved
            // winner only shapes the attributes.
            let (kind, _) = self.index_kind(&child_rel);
            let resolved = self.resolve_rel(&child_rel);
            let ino = self.inodes.write().await.assign(&child_rel, true);
            let (mut attr, pending) = self.resolved_attr(&resolved, false).await;
            attr.ino = ino;
            entries.push(DirectoryEntryPlus {
                inode: ino,
                generation: 0,
                kind,
                name,
                offset: next_offset,
                attr,
                entry_ttl: TTL,
                // An unmaterialized placeholder reports the hash text
                // length as its size; zero ttl forces a getattr before
                // that number can mislead a reader.
                attr_ttl: if pending { Duration::ZERO } else { TTL },
            });
            next_offset += 1;
        }

        let filtered: Vec<_> = entries
            .into_iter()
            .filter(|entry| (entry.offset as u64) > offset)
            .map(Ok)
            .collect();
        Ok(ReplyDirectoryPlus {
            entries: futures_util::stream::iter(filtered),
        })
    }

    async fn releasedir(&self, _req: Request, _inode: u64, _fh: u64, _flags: u32) -> Result<()> {
        Ok(())
    }

    async fn statfs(&self, _req: Request, _inode: u64) -> Result<ReplyStatFs> {
        Ok(ReplyStatFs {
            blocks: 1 << 20,
            bfree: 1 << 19,
            bavail: 1 << 19,
            files: 1 << 16,
            ffree: 1 << 15,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    async fn access(&self, _req: Request, inode: u64, _mask: u32) -> Result<()> {
        if self.inodes.read().await.rel_of(inode).is_some() {
            Ok(())
        } else {
            Err(libc::ENOENT.into())
        }
    }

    async fn getxattr(
        &self,
        _req: Request,
        _inode: u64,
        _name: &OsStr,
        _size: u32,
    ) -> Result<ReplyXAttr> {
        Err(libc::ENODATA.into())
    }

    async fn listxattr(&self, _req: Request, _inode: u64, _size: u32) -> Result<ReplyXAttr> {
        Ok(ReplyXAttr::Data(Vec::new().into()))
    }
}

fn io_errno(err: std::io::Error) -> Errno {
    Errno::from(err.raw_os_error().unwrap_or(libc::EIO))
}
