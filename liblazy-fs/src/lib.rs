//! On-demand filesystem for lazily distributed image layers.
//!
//! A layer is shipped as a *placeholder index*: the original directory
//! tree, with each regular file replaced by a small file holding the
//! content hash of the real bytes. [`lazyfs::LazyFs`] serves that tree
//! over FUSE,
//! pulling file content into a private content-addressed cache the first
//! time it is needed and giving priority to a writable override layer.

pub mod error;
pub mod fetch;
pub mod lazyfs;
pub mod server;
pub mod util;

pub use error::{LazyFsError, Result};
pub use lazyfs::LazyFs;
