//! Per-node contents cache.
//!
//! Every file node owns a copy-on-write array of fixed-size blocks over its
//! payload. A slot is either absent — the authoritative bytes live in the
//! archive (or are zeros for regions the archive never held) — or present,
//! holding the authoritative view of that block. Reads of absent blocks
//! pass through to the backing store without materialising anything; writes
//! materialise the touched blocks first (fetching them when the archive has
//! them, zeroing them otherwise) and then overlay the new bytes.
//!
//! The cache layer does not know about stores or archives: callers supply a
//! `fetch` closure that reads a payload-relative range from wherever the
//! node's bytes live.

use std::sync::Mutex;

use log::debug;

use crate::error::Result;

pub const BLOCK_SIZE_LOG2: u32 = 10;
pub const BLOCK_SIZE: usize = 1 << BLOCK_SIZE_LOG2;

/// Block index covering byte `offset`.
#[inline]
fn block_number(offset: u64) -> usize {
    (offset >> BLOCK_SIZE_LOG2) as usize
}

/// Number of blocks needed to cover `size` bytes.
#[inline]
fn blocks_for(size: u64) -> usize {
    if size == 0 {
        0
    } else {
        block_number(size - 1) + 1
    }
}

/// Offset of byte `offset` within its block.
#[inline]
fn block_offset(offset: u64) -> usize {
    (offset & (BLOCK_SIZE as u64 - 1)) as usize
}

/// Where a node's original payload lives in the archive.
///
/// `start` is the payload byte offset in the backing store; `orig_size` is
/// the payload length as originally parsed. Nodes created after mount have
/// no origin until a sync writes them out.
#[derive(Debug, Clone, Copy)]
pub struct Origin {
    pub start: u64,
    pub orig_size: u64,
}

/// Reads an exact payload-relative range into the supplied buffer.
pub type Fetch<'a> = &'a mut dyn FnMut(u64, &mut [u8]) -> Result<()>;

type Block = Box<[u8]>;

/// A node's copy-on-write block cache.
#[derive(Debug, Default)]
pub struct Cache {
    blocks: Mutex<Vec<Option<Block>>>,
}

fn alloc_block() -> Block {
    vec![0u8; BLOCK_SIZE].into_boxed_slice()
}

/// Materialises `block` from the archive. Only blocks that lie within the
/// original payload may be fetched; later blocks hold zeros until written.
fn fetch_block(
    blocks: &mut [Option<Block>],
    block: usize,
    origin: Origin,
    fetch: Fetch<'_>,
) -> Result<()> {
    debug_assert!(block < blocks_for(origin.orig_size));
    debug_assert!(blocks[block].is_none());

    let mut buf = alloc_block();
    let start = (block as u64) << BLOCK_SIZE_LOG2;
    let want = (origin.orig_size - start).min(BLOCK_SIZE as u64) as usize;
    fetch(start, &mut buf[..want])?;
    blocks[block] = Some(buf);
    Ok(())
}

/// Grows or shrinks the block vector for a new node size. Growth never
/// allocates blocks — the fresh slots stay absent (they read as zeros);
/// shrinking frees every slot past the new last block.
fn resize_blocks(blocks: &mut Vec<Option<Block>>, size: &mut u64, new_size: u64) {
    let new_len = blocks_for(new_size);
    if new_size > *size {
        if new_len > blocks.len() {
            blocks.resize_with(new_len, || None);
            debug!("cache grown to {} blocks", new_len);
        }
    } else {
        blocks.truncate(new_len);
    }
    *size = new_size;
}

impl Cache {
    pub fn new() -> Self {
        Cache::default()
    }

    /// Sizes the block vector for a freshly parsed node of `size` bytes.
    /// All slots start absent.
    pub fn create(&self, size: u64) {
        let mut blocks = self.blocks.lock().unwrap();
        let n = blocks_for(size).max(1);
        blocks.clear();
        blocks.resize_with(n, || None);
    }

    /// Drops every block and the vector itself. The next write re-sizes it.
    pub fn clear(&self) {
        self.blocks.lock().unwrap().clear();
    }

    /// True iff no block is materialised, i.e. the archive still holds the
    /// authoritative bytes for the whole node.
    pub fn synced(&self) -> bool {
        self.blocks.lock().unwrap().iter().all(Option::is_none)
    }

    /// Reads up to `buf.len()` bytes at `offset` from a node of `size`
    /// bytes. Present blocks are copied from cache; absent ranges are read
    /// straight from the archive when the node has an origin covering them,
    /// and zero-filled otherwise. Returns the number of bytes produced.
    pub fn read(
        &self,
        size: u64,
        origin: Option<Origin>,
        offset: u64,
        buf: &mut [u8],
        fetch: Fetch<'_>,
    ) -> Result<usize> {
        if offset >= size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(size - offset) as usize;

        let blocks = self.blocks.lock().unwrap();
        let mut block = block_number(offset);
        let mut rel = block_offset(offset);
        let mut pos = 0usize;

        while pos < len {
            let chunk = (BLOCK_SIZE - rel).min(len - pos);
            let dst = &mut buf[pos..pos + chunk];
            let abs = ((block as u64) << BLOCK_SIZE_LOG2) + rel as u64;

            match blocks.get(block).and_then(Option::as_ref) {
                Some(data) => dst.copy_from_slice(&data[rel..rel + chunk]),
                None => match origin {
                    // Only the original payload exists on disk; anything the
                    // node grew past it is zeros until written.
                    Some(o) if abs < o.orig_size => {
                        let on_disk = ((o.orig_size - abs) as usize).min(chunk);
                        fetch(abs, &mut dst[..on_disk])?;
                        dst[on_disk..].fill(0);
                    }
                    _ => dst.fill(0),
                },
            }

            block += 1;
            rel = 0;
            pos += chunk;
        }

        Ok(len)
    }

    /// Writes `data` at `offset`, materialising every touched block first
    /// (copy-on-write). Grows the node when writing past its end; an empty
    /// block vector (fresh node or just-synced cache) is re-sized to cover
    /// the node before any slot is touched. Returns the bytes accepted.
    pub fn write(
        &self,
        size: &mut u64,
        origin: Option<Origin>,
        offset: u64,
        data: &[u8],
        fetch: Fetch<'_>,
    ) -> Result<usize> {
        let mut blocks = self.blocks.lock().unwrap();

        let end = offset + data.len() as u64;
        if end > *size {
            resize_blocks(&mut blocks, size, end);
        } else if blocks.is_empty() {
            // Re-cover the current size without changing it.
            let n = blocks_for(*size).max(1);
            blocks.resize_with(n, || None);
        }

        let orig_blocks = origin.map_or(0, |o| blocks_for(o.orig_size));
        let mut block = block_number(offset);
        let mut rel = block_offset(offset);
        let mut pos = 0usize;

        while pos < data.len() {
            let chunk = (BLOCK_SIZE - rel).min(data.len() - pos);

            if blocks[block].is_none() {
                if block < orig_blocks {
                    let o = origin.expect("origin checked above");
                    fetch_block(&mut blocks, block, o, fetch)?;
                } else {
                    blocks[block] = Some(alloc_block());
                }
            }
            let dst = blocks[block].as_mut().expect("block just materialised");
            dst[rel..rel + chunk].copy_from_slice(&data[pos..pos + chunk]);

            block += 1;
            rel = 0;
            pos += chunk;
        }

        Ok(data.len())
    }

    /// Changes the node size, lazily growing or freeing the block vector.
    pub fn set_size(&self, size: &mut u64, new_size: u64) {
        let mut blocks = self.blocks.lock().unwrap();
        resize_blocks(&mut blocks, size, new_size);
    }

    /// Force-materialises every absent block covering `[0, amount)` so the
    /// corresponding archive region may be overwritten without losing data.
    /// Blocks past the original payload hold zeros and are left absent.
    pub fn cache_ahead(
        &self,
        size: u64,
        origin: Option<Origin>,
        amount: u64,
        fetch: Fetch<'_>,
    ) -> Result<()> {
        debug_assert!(amount <= size);
        let Some(o) = origin else { return Ok(()) };

        let mut blocks = self.blocks.lock().unwrap();
        let want = blocks_for(amount);
        if want > blocks.len() {
            blocks.resize_with(want, || None);
        }

        let fetchable = blocks_for(o.orig_size).min(want);
        for block in 0..fetchable {
            if blocks[block].is_none() {
                fetch_block(&mut blocks, block, o, fetch)?;
            }
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Fetch closure over a fixed byte pattern standing in for the archive.
    fn pattern_fetch(pattern: Vec<u8>) -> impl FnMut(u64, &mut [u8]) -> Result<()> {
        move |off, buf| {
            let off = off as usize;
            buf.copy_from_slice(&pattern[off..off + buf.len()]);
            Ok(())
        }
    }

    fn no_fetch(_: u64, _: &mut [u8]) -> Result<()> {
        panic!("fetch must not be called");
    }

    #[test]
    fn read_of_synthetic_node_yields_zeros() {
        let cache = Cache::new();
        cache.create(0);
        let mut size = 2000;
        // Grow without writing: the hole reads as zeros.
        cache.set_size(&mut size, 2000);
        let mut buf = [0xffu8; 100];
        let n = cache
            .read(size, None, 500, &mut buf, &mut no_fetch)
            .unwrap();
        assert_eq!(n, 100);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_then_read_returns_written_bytes() {
        let cache = Cache::new();
        cache.create(0);
        let mut size = 0u64;
        let data: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let n = cache
            .write(&mut size, None, 100, &data, &mut no_fetch)
            .unwrap();
        assert_eq!(n, data.len());
        assert_eq!(size, 3100);

        let mut out = vec![0u8; 3000];
        let n = cache.read(size, None, 100, &mut out, &mut no_fetch).unwrap();
        assert_eq!(n, 3000);
        assert_eq!(out, data);

        // The un-written prefix reads back as zeros.
        let mut head = [0xaau8; 100];
        cache.read(size, None, 0, &mut head, &mut no_fetch).unwrap();
        assert!(head.iter().all(|&b| b == 0));
    }

    #[test]
    fn partial_write_fetches_surrounding_block() {
        let pattern: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let cache = Cache::new();
        cache.create(4096);
        let mut size = 4096u64;
        let origin = Some(Origin { start: 0, orig_size: 4096 });

        // Overwrite 10 bytes in the middle of block 1.
        let mut fetch = pattern_fetch(pattern.clone());
        cache
            .write(&mut size, origin, 1500, b"XXXXXXXXXX", &mut fetch)
            .unwrap();

        // The rest of block 1 must still read as the original pattern.
        let mut out = vec![0u8; BLOCK_SIZE];
        cache
            .read(size, origin, 1024, &mut out, &mut no_fetch)
            .unwrap();
        assert_eq!(&out[..1500 - 1024], &pattern[1024..1500]);
        assert_eq!(&out[1500 - 1024..1510 - 1024], b"XXXXXXXXXX");
        assert_eq!(&out[1510 - 1024..], &pattern[1510..2048]);
    }

    #[test]
    fn clean_read_passes_through_without_materialising() {
        let pattern: Vec<u8> = (0..2048u32).map(|i| i as u8).collect();
        let cache = Cache::new();
        cache.create(2048);
        let origin = Some(Origin { start: 0, orig_size: 2048 });

        let mut fetch = pattern_fetch(pattern.clone());
        let mut out = vec![0u8; 600];
        cache.read(2048, origin, 700, &mut out, &mut fetch).unwrap();
        assert_eq!(out, &pattern[700..1300]);
        assert!(cache.synced());
    }

    #[test]
    fn shrink_frees_tail_blocks_and_clamps_reads() {
        let cache = Cache::new();
        cache.create(0);
        let mut size = 0u64;
        cache
            .write(&mut size, None, 0, &vec![7u8; 3000], &mut no_fetch)
            .unwrap();
        cache.set_size(&mut size, 1000);
        assert_eq!(size, 1000);

        let mut out = vec![0u8; 3000];
        let n = cache.read(size, None, 0, &mut out, &mut no_fetch).unwrap();
        assert_eq!(n, 1000);
    }

    #[test]
    fn cache_ahead_materialises_exactly_the_prefix() {
        let pattern: Vec<u8> = (0..4096u32).map(|i| (i / 7) as u8).collect();
        let cache = Cache::new();
        cache.create(4096);
        let origin = Some(Origin { start: 0, orig_size: 4096 });

        let mut fetch = pattern_fetch(pattern.clone());
        cache.cache_ahead(4096, origin, 1500, &mut fetch).unwrap();
        assert!(!cache.synced());

        // Cached prefix must read back without touching the archive.
        let mut out = vec![0u8; 2048];
        cache.read(4096, origin, 0, &mut out, &mut no_fetch).unwrap();
        assert_eq!(out, &pattern[..2048]);
    }

    #[test]
    fn write_after_clear_does_not_lose_the_tail() {
        let pattern: Vec<u8> = (0..2048u32).map(|i| i as u8).collect();
        let cache = Cache::new();
        cache.create(2048);
        let mut size = 2048u64;
        let origin = Some(Origin { start: 0, orig_size: 2048 });

        cache.clear();
        let mut fetch = pattern_fetch(pattern.clone());
        cache
            .write(&mut size, origin, 0, b"hello", &mut fetch)
            .unwrap();
        assert_eq!(size, 2048, "short write must not shrink the node");

        let mut out = vec![0u8; 2048];
        let mut fetch = pattern_fetch(pattern.clone());
        cache.read(size, origin, 0, &mut out, &mut fetch).unwrap();
        assert_eq!(&out[..5], b"hello");
        assert_eq!(&out[5..], &pattern[5..]);
    }
}
