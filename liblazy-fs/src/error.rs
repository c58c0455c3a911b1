use std::io;
use std::path::PathBuf;

use rfuse3::Errno;
use thiserror::Error;

/// Errors raised while serving or materializing a lazy layer tree.
#[derive(Error, Debug)]
pub enum LazyFsError {
    #[error("entry not found: {0}")]
    NotFound(PathBuf),

    #[error("placeholder at {0} does not hold a content hash")]
    BadPlaceholder(PathBuf),

    #[error("fetch agent failed for hash {hash}: {reason}")]
    FetchFailed { hash: String, reason: String },

    #[error("metadata unavailable for {path}: {source}")]
    Metadata { path: PathBuf, source: io::Error },

    #[error("invalid filesystem configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("http transport: {0}")]
    Transport(#[from] reqwest::Error),
}

impl LazyFsError {
    /// Errno reported to the kernel for this failure.
    pub fn errno(&self) -> Errno {
        match self {
            LazyFsError::NotFound(_) => libc::ENOENT.into(),
            LazyFsError::BadPlaceholder(_) => libc::EINVAL.into(),
            LazyFsError::FetchFailed { .. } | LazyFsError::Transport(_) => libc::EIO.into(),
            LazyFsError::Metadata { .. } => libc::EIO.into(),
            LazyFsError::InvalidConfig(_) => libc::EINVAL.into(),
            LazyFsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO).into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LazyFsError>;
