//! Backing stores for the archive bytes.
//!
//! A store is a byte-addressable file: `size`, positioned reads and
//! writes, and `set_size`. The archive engine is oblivious to whether the
//! bytes come from a plain file or through a compressed-stream veneer —
//! both variants of the closed [`Store`] enum present the same surface.
//! Compressed stores buffer writes in memory and commit them when the
//! store is closed.

pub mod bzip2;
pub mod gzip;
pub mod zip;

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;

use log::debug;

use crate::error::Result;

pub use zip::{Codec, ZipStore};

/// Compression applied to the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Bzip2,
}

// ─── Plain file store ────────────────────────────────────────────────────────

/// A byte-addressable view of a regular file.
#[derive(Debug)]
pub struct FileStore {
    file: std::fs::File,
}

impl FileStore {
    pub fn open(path: &Path, writable: bool, create: bool) -> Result<Self> {
        debug!(
            "opening {} ({})",
            path.display(),
            if writable { "read-write" } else { "read-only" }
        );
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(create && writable)
            .open(path)?;
        Ok(FileStore { file })
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Positioned read; short only at end of file.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let size = self.size()?;
        if offset >= size {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(size - offset) as usize;
        let mut done = 0;
        while done < want {
            let n = self.file.read_at(&mut buf[done..want], offset + done as u64)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    /// Positioned write; extends the file when writing past its end.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        self.file.write_all_at(data, offset)?;
        Ok(data.len())
    }

    pub fn set_size(&self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        Ok(())
    }
}

// ─── Store dispatch ──────────────────────────────────────────────────────────

/// The backing store of one mount: a plain tar file, or a compressed one
/// behind the random-access veneer.
#[derive(Debug)]
pub enum Store {
    Plain(FileStore),
    Zip(ZipStore),
}

impl Store {
    /// Opens the archive at `path` per the compression option. A created
    /// or empty file yields an empty store.
    pub fn open(path: &Path, writable: bool, create: bool, compression: Compression) -> Result<Self> {
        match compression {
            Compression::None => Ok(Store::Plain(FileStore::open(path, writable, create)?)),
            Compression::Gzip => Ok(Store::Zip(ZipStore::open(
                path,
                writable,
                create,
                Codec::Gzip,
            )?)),
            Compression::Bzip2 => Ok(Store::Zip(ZipStore::open(
                path,
                writable,
                create,
                Codec::Bzip2,
            )?)),
        }
    }

    /// Current store size in bytes — the uncompressed view for compressed
    /// stores.
    pub fn size(&self) -> Result<u64> {
        match self {
            Store::Plain(f) => f.size(),
            Store::Zip(z) => Ok(z.size()),
        }
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            Store::Plain(f) => f.read_at(offset, buf),
            Store::Zip(z) => z.read_at(offset, buf),
        }
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        match self {
            Store::Plain(f) => f.write_at(offset, data),
            Store::Zip(z) => z.write_at(offset, data),
        }
    }

    pub fn set_size(&self, size: u64) -> Result<()> {
        match self {
            Store::Plain(f) => f.set_size(size),
            Store::Zip(z) => z.set_size(size),
        }
    }

    /// Releases the store. Compressed stores flush their dirty cache back
    /// through the encoder here; a plain store has nothing pending.
    pub fn close(self) -> Result<()> {
        match self {
            Store::Plain(_) => Ok(()),
            Store::Zip(z) => z.close(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_store_read_write_set_size() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.bin");
        let store = FileStore::open(&path, true, true).unwrap();

        assert_eq!(store.size().unwrap(), 0);
        store.write_at(0, b"hello world").unwrap();
        assert_eq!(store.size().unwrap(), 11);

        let mut buf = [0u8; 5];
        assert_eq!(store.read_at(6, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");

        // Reads past the end are short, not errors.
        assert_eq!(store.read_at(100, &mut buf).unwrap(), 0);

        // Writes past the end extend the file.
        store.write_at(20, b"x").unwrap();
        assert_eq!(store.size().unwrap(), 21);

        store.set_size(4).unwrap();
        assert_eq!(store.size().unwrap(), 4);
        let mut buf = [0u8; 16];
        assert_eq!(store.read_at(0, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"hell");
    }
}
