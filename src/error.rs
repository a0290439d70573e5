//! Crate-wide error type.
//!
//! One enum covers every layer: the store, the codec, the cache, the tree
//! and the engine all speak the same errno-like vocabulary, so a single
//! type propagates cleanly through `?` from the backing file up to a
//! backend operation.

use std::io;

/// Errors surfaced by filesystem and store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An allocation inside a codec ran out of memory.
    #[error("out of memory")]
    OutOfMemory,

    /// An I/O error from the backing store or a corrupt compressed stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A mutating operation was attempted on a readonly mount.
    #[error("read-only filesystem")]
    ReadOnlyFs,

    /// Lookup target does not exist.
    #[error("no such entry")]
    NoEntry,

    /// An entry with that name already exists.
    #[error("entry exists")]
    Exists,

    /// Unlink of a non-empty directory.
    #[error("directory not empty")]
    NotEmpty,

    /// Unlink of a node that still has hardlink aliases.
    #[error("resource busy")]
    Busy,

    /// Content read/write addressed to a directory.
    #[error("is a directory")]
    IsDirectory,

    /// Directory operation addressed to a non-directory.
    #[error("not a directory")]
    NotDirectory,

    /// Malformed archive or compressed-stream framing.
    #[error("bad format")]
    BadFormat,

    /// A parameter or stream-sequencing error.
    #[error("invalid argument")]
    InvalidArgument,

    /// The operation is not implemented by this filesystem.
    #[error("not supported")]
    NotSupported,

    /// A created node's archive path would exceed the tar name field.
    #[error("name too long")]
    NameTooLong,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for wrapping a plain I/O error message.
    pub fn io(msg: impl Into<String>) -> Self {
        Error::Io(io::Error::other(msg.into()))
    }
}
