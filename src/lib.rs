//! tarfs — mount a GNU tar archive as a read/write directory tree.
//!
//! The archive (plain, gzipped or bzip2'd) is parsed into an in-memory
//! node tree; modifications live in per-node copy-on-write block caches
//! until a sync pass rewrites the archive in place. The twelve-operation
//! [`Backend`] trait is the surface a host filesystem layer consumes.

pub mod backend;
pub mod cache;
pub mod cli;
pub mod error;
pub mod fs;
pub mod list;
pub mod names;
pub mod store;
pub mod tar;
pub mod tree;

pub use backend::Backend;
pub use error::{Error, Result};
pub use fs::{Filesystem, Options};
pub use store::Compression;
pub use tree::{Node, Stat};
