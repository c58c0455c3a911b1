//! Export transform.
//!
//! Pushing a lazy layer must not ship materialized content. The
//! transform walks the layer's content tree, moves every regular
//! file's bytes into a staging directory keyed by content hash,
//! rewrites the file in place to hold the hash text, and hands the
//! staged blobs to the remote blob store. The archive is then packed
//! from a union view of the chain's canonical index below the
//! converted tree, so consumers receive a complete placeholder layer.
//!
//! There is no coordination with a live mount of the same chain;
//! exporting a mounted layer is unsupported.

use std::fs::{self, File, Metadata};
use std::io::{self, BufReader, Seek};
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;

use sha256::try_digest;
use tar::{Builder, Header};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Result, StoreError};
use crate::union::UnionMount;
use crate::upload::RemoteBlobStore;

/// Inverts `content_dir` to placeholders, uploads the staged blobs,
/// and returns the packed archive of the union of `index_dir` and the
/// converted tree. Scratch directories are created under `workspace`
/// and removed again.
pub(crate) async fn export_layer(
    content_dir: &Path,
    index_dir: &Path,
    workspace: &Path,
    staging: &Path,
    blobs: &dyn RemoteBlobStore,
    union: &dyn UnionMount,
) -> Result<File> {
    let converted = {
        let tree = content_dir.to_path_buf();
        let staging = staging.to_path_buf();
        tokio::task::spawn_blocking(move || placeholderize(&tree, &staging))
            .await
            .map_err(|err| StoreError::Archive(format!("placeholder task failed: {err}")))??
    };
    info!(tree = %content_dir.display(), converted, "content inverted to placeholders");

    blobs.upload_tree(staging).await?;
    fs::remove_dir_all(staging)?;

    let merged = workspace.join("merged");
    let work = workspace.join("work");
    fs::create_dir_all(&merged)?;
    fs::create_dir_all(&work)?;

    let archive = match union.mount(index_dir, content_dir, &work, &merged).await {
        Ok(()) => {
            let packed = {
                let merged = merged.clone();
                tokio::task::spawn_blocking(move || pack_tree(&merged))
                    .await
                    .map_err(|err| StoreError::Archive(format!("pack task failed: {err}")))?
            };
            if let Err(err) = union.unmount(&merged).await {
                warn!(merged = %merged.display(), %err, "union view did not unmount cleanly");
            }
            packed
        }
        Err(err) => Err(err),
    };

    for dir in [&merged, &work] {
        if let Err(err) = fs::remove_dir_all(dir) {
            warn!(dir = %dir.display(), %err, "left scratch directory behind");
        }
    }

    archive
}

/// Replaces every regular file under `tree` with its hash text,
/// copying the original bytes to `staging/<hash>` first. Permission
/// bits survive the rewrite; directories, symlinks and special files
/// pass through untouched. Aborts on the first walk error so a
/// half-converted tree is never silently shipped.
fn placeholderize(tree: &Path, staging: &Path) -> Result<usize> {
    fs::create_dir_all(staging)?;
    let mut converted = 0;
    for entry_result in WalkDir::new(tree).follow_links(false) {
        let entry = entry_result.map_err(io::Error::from)?;
        if entry.path() == tree {
            continue;
        }
        let metadata = entry.metadata().map_err(io::Error::from)?;
        if !metadata.is_file() {
            continue;
        }
        let path = entry.path();
        let hash = try_digest(path).map_err(|err| StoreError::Digest {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        fs::copy(path, staging.join(&hash))?;
        let permissions = metadata.permissions();
        fs::write(path, hash.as_bytes())?;
        fs::set_permissions(path, permissions)?;
        debug!(file = %path.display(), hash, "bytes moved to staging");
        converted += 1;
    }
    Ok(converted)
}

/// Packs `root` into an unnamed temporary tar file and returns it
/// rewound. Symlinks and special files keep their headers; walk
/// errors skip the entry, append errors abort.
fn pack_tree(root: &Path) -> Result<File> {
    let file = tempfile::tempfile()?;
    let mut builder = Builder::new(file);

    for entry_result in WalkDir::new(root).follow_links(false) {
        let entry = match entry_result {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%err, "walk error while packing, entry skipped");
                continue;
            }
        };
        let path = entry.path();
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(file = %path.display(), %err, "no metadata, entry skipped");
                continue;
            }
        };
        let relative = match path.strip_prefix(root) {
            Ok(relative) => relative.to_string_lossy(),
            Err(_) => continue,
        };
        if relative.is_empty() {
            continue;
        }

        if metadata.is_file() {
            append_file(&mut builder, path, &relative, &metadata)?;
        } else if metadata.is_dir() {
            append_dir(&mut builder, &relative, &metadata)?;
        } else if metadata.file_type().is_symlink() {
            append_symlink(&mut builder, path, &relative)?;
        } else {
            append_special(&mut builder, &relative, &metadata)?;
        }
    }

    let mut file = builder.into_inner()?;
    file.rewind()?;
    Ok(file)
}

fn append_file(
    builder: &mut Builder<File>,
    path: &Path,
    name: &str,
    metadata: &Metadata,
) -> Result<()> {
    let file = File::open(path)?;
    let mut file = BufReader::new(file);
    let mut header = Header::new_gnu();
    header.set_metadata(metadata);
    header.set_path(name)?;
    header.set_size(metadata.len());
    header.set_cksum();
    builder.append(&header, &mut file)?;
    Ok(())
}

fn append_dir(builder: &mut Builder<File>, name: &str, metadata: &Metadata) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_metadata(metadata);
    let dir_name = if name.ends_with('/') {
        name.to_string()
    } else {
        format!("{name}/")
    };
    header.set_path(&dir_name)?;
    header.set_size(0);
    header.set_entry_type(tar::EntryType::Directory);
    header.set_cksum();
    builder.append(&header, &mut io::empty())?;
    Ok(())
}

fn append_symlink(builder: &mut Builder<File>, path: &Path, name: &str) -> Result<()> {
    let target = fs::read_link(path)?;
    let metadata = fs::symlink_metadata(path)?;
    let mut header = Header::new_gnu();
    header.set_metadata(&metadata);
    header.set_path(name)?;
    header.set_link_name(target.to_string_lossy().as_ref())?;
    header.set_entry_type(tar::EntryType::Symlink);
    header.set_size(0);
    header.set_cksum();
    builder.append(&header, &mut io::empty())?;
    Ok(())
}

fn append_special(builder: &mut Builder<File>, name: &str, metadata: &Metadata) -> Result<()> {
    let file_type = metadata.file_type();
    let mut header = Header::new_gnu();
    header.set_metadata(metadata);
    header.set_path(name)?;
    header.set_size(0);
    if file_type.is_block_device() {
        header.set_entry_type(tar::EntryType::Block);
    } else if file_type.is_char_device() {
        header.set_entry_type(tar::EntryType::Char);
    } else if file_type.is_fifo() {
        header.set_entry_type(tar::EntryType::Fifo);
    } else {
        header.set_entry_type(tar::EntryType::Regular);
    }
    if file_type.is_block_device() || file_type.is_char_device() {
        let dev_major = (metadata.rdev() >> 8) & 0xFFF;
        let dev_minor = metadata.rdev() & 0xFF;
        header.set_device_major(dev_major as _)?;
        header.set_device_minor(dev_minor as _)?;
    }
    header.set_cksum();
    builder.append(&header, &mut io::empty())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn placeholderize_moves_bytes_and_rewrites_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let tree = tmp.path().join("tree");
        let staging = tmp.path().join("staging");
        fs::create_dir_all(tree.join("etc")).unwrap();
        fs::write(tree.join("etc/motd"), b"fresh paint").unwrap();
        fs::set_permissions(tree.join("etc/motd"), fs::Permissions::from_mode(0o640)).unwrap();

        let converted = placeholderize(&tree, &staging).unwrap();
        assert_eq!(converted, 1);

        let hash = fs::read_to_string(tree.join("etc/motd")).unwrap();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fs::read(staging.join(&hash)).unwrap(), b"fresh paint");
        let mode = fs::metadata(tree.join("etc/motd")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[test]
    fn placeholderize_dedupes_identical_content() {
        let tmp = tempfile::tempdir().unwrap();
        let tree = tmp.path().join("tree");
        let staging = tmp.path().join("staging");
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("a"), b"same").unwrap();
        fs::write(tree.join("b"), b"same").unwrap();

        let converted = placeholderize(&tree, &staging).unwrap();
        assert_eq!(converted, 2);
        assert_eq!(fs::read_dir(&staging).unwrap().count(), 1);
        assert_eq!(
            fs::read_to_string(tree.join("a")).unwrap(),
            fs::read_to_string(tree.join("b")).unwrap()
        );
    }

    #[test]
    fn placeholderize_leaves_symlinks_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let tree = tmp.path().join("tree");
        let staging = tmp.path().join("staging");
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("real"), b"data").unwrap();
        std::os::unix::fs::symlink("real", tree.join("link")).unwrap();

        placeholderize(&tree, &staging).unwrap();
        assert_eq!(fs::read_link(tree.join("link")).unwrap(), Path::new("real"));
    }

    #[test]
    fn pack_tree_round_trips_structure() {
        let tmp = tempfile::tempdir().unwrap();
        let tree = tmp.path().join("tree");
        fs::create_dir_all(tree.join("var/log")).unwrap();
        fs::write(tree.join("var/log/app"), b"0123456789abcdef").unwrap();
        std::os::unix::fs::symlink("var/log", tree.join("logs")).unwrap();

        let archive = pack_tree(&tree).unwrap();

        let out = tmp.path().join("out");
        let mut reader = tar::Archive::new(archive);
        reader.unpack(&out).unwrap();

        assert_eq!(fs::read(out.join("var/log/app")).unwrap(), b"0123456789abcdef");
        assert_eq!(
            fs::read_link(out.join("logs")).unwrap(),
            Path::new("var/log")
        );
    }
}
