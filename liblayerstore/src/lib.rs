//! Lazy layer composition for a container layer store.
//!
//! A layer chain built from lazy images keeps exactly one placeholder
//! index per chain, stored at the chain root next to an override layer
//! and a mountpoint. Every layer in the chain carries a marker symlink
//! back to that root, so any member resolves to the same virtual
//! filesystem. This crate runs the bookkeeping around the
//! [`liblazy_fs`] engine: chain markers, the reference-counted mount
//! registry, apply-time recognition of lazy archives, and the export
//! transform that turns materialized content back into placeholders.

pub mod chain;
pub mod error;
pub mod export;
pub mod layout;
pub mod registry;
pub mod store;
pub mod union;
pub mod upload;

pub use error::{Result, StoreError};
pub use layout::StoreLayout;
pub use registry::{MountRegistry, ReleaseOutcome};
pub use store::{LayerDriver, LazyLayerStore};
