//! Bzip2 codec setup for the compressed store.
//!
//! Bzip2 needs no framing of our own — the library consumes and emits its
//! own container — so this module only constructs the stream pair and maps
//! bzlib's error space onto the crate's.

use crate::error::Error;

/// Block size passed to the encoder (×100 kB).
const BLOCK_SIZE: u32 = 4;

pub fn new_decompress() -> bzip2::Decompress {
    bzip2::Decompress::new(false)
}

pub fn new_compress() -> bzip2::Compress {
    // Work factor 0 selects the library default.
    bzip2::Compress::new(bzip2::Compression::new(BLOCK_SIZE), 0)
}

/// bzlib error → crate error: data corruption is an I/O problem,
/// mis-sequenced or mis-parameterised calls are argument errors.
pub fn map_error(err: bzip2::Error) -> Error {
    match err {
        bzip2::Error::Param | bzip2::Error::Sequence => Error::InvalidArgument,
        _ => Error::io("corrupt bzip2 stream"),
    }
}
