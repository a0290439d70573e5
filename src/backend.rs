//! The filesystem backend interface.
//!
//! A host (whatever dispatches user filesystem requests, marshals
//! directory entries and enforces credentials) drives a mounted archive
//! exclusively through this trait plus the mount/ingest constructors on
//! [`crate::fs::Filesystem`]. The host owns the per-node operation
//! serialisation; the backend owns everything below it.

use std::sync::Arc;

use crate::error::Result;
use crate::tree::{Node, Stat};

pub trait Backend {
    /// Case-sensitive lookup in `dir`'s entries; `.` and `..` resolve.
    fn lookup(&self, dir: &Arc<Node>, name: &str) -> Result<Arc<Node>>;

    /// Reads node contents through the cache. Directories refuse with
    /// [`crate::Error::IsDirectory`].
    fn read_node(&self, node: &Arc<Node>, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Writes node contents through the cache, growing the node as
    /// needed. Hardlink aliases write through to their target.
    fn write_node(&self, node: &Arc<Node>, offset: u64, data: &[u8]) -> Result<usize>;

    /// Replaces the node's stat; a size change resizes the cache. The
    /// node is marked dirty for the next sync.
    fn change_stat(&self, node: &Arc<Node>, stat: &Stat) -> Result<()>;

    /// Creates a node under `dir`. `name == None` creates an anonymous
    /// node that joins the archive only once [`Backend::link_node`] names
    /// it.
    fn create_node(&self, dir: &Arc<Node>, name: Option<&str>, mode: u32) -> Result<Arc<Node>>;

    /// Unlinks a node: [`crate::Error::NotEmpty`] for a directory with
    /// entries, [`crate::Error::Busy`] while hardlink aliases remain.
    fn unlink_node(&self, node: &Arc<Node>) -> Result<()>;

    /// Creates a hardlink to `target` named `name` in `dir`;
    /// [`crate::Error::Exists`] when `excl` and the name is taken.
    fn link_node(&self, dir: &Arc<Node>, target: &Arc<Node>, name: &str, excl: bool)
        -> Result<()>;

    /// Turns `node` into a symlink to `target`.
    fn symlink_node(&self, node: &Arc<Node>, target: &str) -> Result<()>;

    /// Device-node creation; this filesystem does not support it.
    fn mkdev_node(&self, node: &Arc<Node>, kind: u32, rdev: u64) -> Result<()>;

    /// Releases a node's resources once the host drops its last handle.
    fn free_node(&self, node: &Arc<Node>);

    /// Serialises the filesystem back into the archive.
    fn sync_fs(&self, wait: bool) -> Result<()>;

    /// Syncs (unless readonly or volatile) and releases the backing store.
    fn go_away(&self) -> Result<()>;
}
