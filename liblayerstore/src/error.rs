use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the layer store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("layer {0} carries no chain marker")]
    NotLazy(String),

    #[error("chain marker unreadable at {path}: {source}")]
    Marker { path: PathBuf, source: io::Error },

    #[error("mount of {0} failed: {1}")]
    Mount(PathBuf, io::Error),

    #[error("union mount: {0}")]
    Union(String),

    #[error("blob upload: {0}")]
    Upload(String),

    #[error("archive: {0}")]
    Archive(String),

    #[error("digest of {path} failed: {reason}")]
    Digest { path: PathBuf, reason: String },

    #[error("invalid store configuration: {0}")]
    Config(String),

    #[error(transparent)]
    LazyFs(#[from] liblazy_fs::LazyFsError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("http transport: {0}")]
    Transport(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
