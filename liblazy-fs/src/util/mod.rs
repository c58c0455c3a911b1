use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;

use rfuse3::{FileType, Timestamp, raw::reply::FileAttr};
use tracing::error;

/// Build a [`FileAttr`] from the metadata of a backing entry. The inode
/// number is the backing filesystem's one; callers serving their own inode
/// space overwrite `ino` afterwards.
pub fn attr_from_metadata(meta: &Metadata) -> FileAttr {
    FileAttr {
        ino: meta.ino(),
        size: meta.size(),
        blocks: meta.blocks(),
        atime: Timestamp::new(meta.atime(), meta.atime_nsec() as u32),
        mtime: Timestamp::new(meta.mtime(), meta.mtime_nsec() as u32),
        ctime: Timestamp::new(meta.ctime(), meta.ctime_nsec() as u32),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::new(0, 0),
        kind: filetype_from_mode(meta.mode()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: meta.blksize() as u32,
    }
}

pub fn filetype_from_mode(st_mode: u32) -> FileType {
    let st_mode = st_mode & (libc::S_IFMT as u32);
    if st_mode == (libc::S_IFIFO as u32) {
        return FileType::NamedPipe;
    }
    if st_mode == (libc::S_IFCHR as u32) {
        return FileType::CharDevice;
    }
    if st_mode == (libc::S_IFBLK as u32) {
        return FileType::BlockDevice;
    }
    if st_mode == (libc::S_IFDIR as u32) {
        return FileType::Directory;
    }
    if st_mode == (libc::S_IFREG as u32) {
        return FileType::RegularFile;
    }
    if st_mode == (libc::S_IFLNK as u32) {
        return FileType::Symlink;
    }
    if st_mode == (libc::S_IFSOCK as u32) {
        return FileType::Socket;
    }
    error!("unrecognized st_mode bits: {st_mode:o}");
    FileType::RegularFile
}

/// Best-effort attributes served when the backing entry cannot be
/// examined: every field a stat would fill is zeroed, only identity and
/// classification survive.
pub fn zeroed_attr(ino: u64, kind: FileType) -> FileAttr {
    FileAttr {
        ino,
        size: 0,
        blocks: 0,
        atime: Timestamp::new(0, 0),
        mtime: Timestamp::new(0, 0),
        ctime: Timestamp::new(0, 0),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::new(0, 0),
        kind,
        perm: 0,
        nlink: if kind == FileType::Directory { 2 } else { 1 },
        uid: 0,
        gid: 0,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_modes() {
        assert_eq!(filetype_from_mode(libc::S_IFDIR | 0o755), FileType::Directory);
        assert_eq!(
            filetype_from_mode(libc::S_IFREG | 0o644),
            FileType::RegularFile
        );
        assert_eq!(filetype_from_mode(libc::S_IFLNK | 0o777), FileType::Symlink);
        assert_eq!(filetype_from_mode(libc::S_IFIFO | 0o600), FileType::NamedPipe);
    }

    #[test]
    fn attr_tracks_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("probe");
        std::fs::write(&file, b"0123456789").unwrap();

        let meta = std::fs::symlink_metadata(&file).unwrap();
        let attr = attr_from_metadata(&meta);
        assert_eq!(attr.size, 10);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.uid, meta.uid());
    }
}
