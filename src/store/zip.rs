//! Random-access read/write veneer over a linear compressed stream.
//!
//! A [`ZipStore`] presents the uncompressed archive as a byte-addressable
//! store while the backing file holds a gzip or bzip2 stream. Three pieces
//! make that work:
//!
//! - a forward-only decoder with seek emulation: reading at an offset the
//!   decoder has passed means resetting to the payload start and consuming
//!   forward (forbidden during a write-back session, when the source bytes
//!   behind the decoder may already be overwritten);
//! - a copy-on-write block cache (8 KiB blocks) over the uncompressed
//!   view, absorbing every write;
//! - a write-back pass on close that re-encodes the whole uncompressed
//!   image, block by block, fetching still-absent blocks from the decoder
//!   and advancing it past any source region the encoder is about to
//!   clobber (the cache-ahead hook).
//!
//! Opening the store traverses the entire stream once to learn the
//! uncompressed size (neither container states it reliably up front) and,
//! for gzip, to verify the CRC-32/ISIZE suffix.

use std::path::Path;
use std::sync::Mutex;

use flate2::{Compress, Compression, Crc, Decompress, FlushCompress, FlushDecompress, Status};
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{bzip2 as bz, gzip, FileStore};

pub const BUF_SIZE_LOG2: u32 = 13;
/// Stream buffer and cache block size (8 KiB).
pub const BUF_SIZE: usize = 1 << BUF_SIZE_LOG2;

#[inline]
fn block_number(offset: u64) -> usize {
    (offset >> BUF_SIZE_LOG2) as usize
}

#[inline]
fn blocks_for(size: u64) -> usize {
    if size == 0 {
        0
    } else {
        block_number(size - 1) + 1
    }
}

#[inline]
fn block_offset(offset: u64) -> usize {
    (offset & (BUF_SIZE as u64 - 1)) as usize
}

/// The codec behind a compressed store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Gzip,
    Bzip2,
}

// ─── Codec streams ───────────────────────────────────────────────────────────

enum Inflater {
    /// Raw deflate; the gzip container is handled outside the codec.
    Gzip(Decompress),
    Bzip2(bzip2::Decompress),
}

impl Inflater {
    fn new(codec: Codec) -> Self {
        match codec {
            Codec::Gzip => Inflater::Gzip(Decompress::new(false)),
            Codec::Bzip2 => Inflater::Bzip2(bz::new_decompress()),
        }
    }

    /// One decode step. Returns `(consumed, produced, stream_end)`.
    fn inflate(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize, bool)> {
        match self {
            Inflater::Gzip(d) => {
                let (before_in, before_out) = (d.total_in(), d.total_out());
                let status = d
                    .decompress(input, output, FlushDecompress::None)
                    .map_err(|e| Error::io(format!("zlib: {e}")))?;
                let consumed = (d.total_in() - before_in) as usize;
                let produced = (d.total_out() - before_out) as usize;
                match status {
                    Status::StreamEnd => Ok((consumed, produced, true)),
                    Status::Ok => Ok((consumed, produced, false)),
                    // Unreachable as long as input or output space is
                    // always supplied; a truncated stream surfaces here.
                    Status::BufError => Err(Error::io("truncated deflate stream")),
                }
            }
            Inflater::Bzip2(d) => {
                let (before_in, before_out) = (d.total_in(), d.total_out());
                let status = d.decompress(input, output).map_err(bz::map_error)?;
                let consumed = (d.total_in() - before_in) as usize;
                let produced = (d.total_out() - before_out) as usize;
                match status {
                    bzip2::Status::StreamEnd => Ok((consumed, produced, true)),
                    bzip2::Status::MemNeeded => Err(Error::OutOfMemory),
                    _ => Ok((consumed, produced, false)),
                }
            }
        }
    }
}

enum Deflater {
    Gzip(Compress),
    Bzip2(bzip2::Compress),
}

impl Deflater {
    fn new(codec: Codec) -> Self {
        match codec {
            Codec::Gzip => Deflater::Gzip(Compress::new(Compression::default(), false)),
            Codec::Bzip2 => Deflater::Bzip2(bz::new_compress()),
        }
    }

    /// One encode step. Returns `(consumed, produced, stream_end)`;
    /// `stream_end` is only reachable with `finish`.
    fn deflate(
        &mut self,
        input: &[u8],
        output: &mut [u8],
        finish: bool,
    ) -> Result<(usize, usize, bool)> {
        match self {
            Deflater::Gzip(c) => {
                let flush = if finish {
                    FlushCompress::Finish
                } else {
                    FlushCompress::None
                };
                let (before_in, before_out) = (c.total_in(), c.total_out());
                let status = c
                    .compress(input, output, flush)
                    .map_err(|e| Error::io(format!("zlib: {e}")))?;
                let consumed = (c.total_in() - before_in) as usize;
                let produced = (c.total_out() - before_out) as usize;
                match status {
                    Status::StreamEnd => Ok((consumed, produced, true)),
                    Status::Ok => Ok((consumed, produced, false)),
                    Status::BufError => Err(Error::io("deflate made no progress")),
                }
            }
            Deflater::Bzip2(c) => {
                let action = if finish {
                    bzip2::Action::Finish
                } else {
                    bzip2::Action::Run
                };
                let (before_in, before_out) = (c.total_in(), c.total_out());
                let status = c.compress(input, output, action).map_err(bz::map_error)?;
                let consumed = (c.total_in() - before_in) as usize;
                let produced = (c.total_out() - before_out) as usize;
                match status {
                    bzip2::Status::StreamEnd => Ok((consumed, produced, true)),
                    bzip2::Status::MemNeeded => Err(Error::OutOfMemory),
                    _ => Ok((consumed, produced, false)),
                }
            }
        }
    }

    fn total_in(&self) -> u64 {
        match self {
            Deflater::Gzip(c) => c.total_in(),
            Deflater::Bzip2(c) => c.total_in(),
        }
    }
}

// ─── Stream states ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamStatus {
    Running,
    Eof,
}

/// Decoder state: the codec stream, its input buffer, and the twin
/// cursors over the compressed file and the uncompressed view.
struct ReadState {
    codec: Codec,
    inflater: Inflater,
    buf: Box<[u8]>,
    in_pos: usize,
    in_len: usize,
    /// First compressed payload byte (after any container header).
    start: u64,
    /// Consumed position in the compressed file.
    file_offs: u64,
    /// Produced position in the uncompressed stream.
    zip_offs: u64,
    file_status: StreamStatus,
    zip_status: StreamStatus,
    /// Running CRC of produced bytes (gzip only).
    crc: Crc,
}

impl ReadState {
    fn new(codec: Codec, start: u64) -> Self {
        ReadState {
            codec,
            inflater: Inflater::new(codec),
            buf: vec![0u8; BUF_SIZE].into_boxed_slice(),
            in_pos: 0,
            in_len: 0,
            start,
            file_offs: start,
            zip_offs: 0,
            file_status: StreamStatus::Running,
            zip_status: StreamStatus::Running,
            crc: Crc::new(),
        }
    }

    /// Resets the decoder to the payload start.
    fn reinit(&mut self, start: u64) {
        *self = ReadState::new(self.codec, start);
    }

    /// Decodes up to `out.len()` bytes at the current position. Short only
    /// at end of stream. Verifies the gzip suffix when the stream ends.
    fn read(&mut self, source: &FileStore, out: &mut [u8]) -> Result<usize> {
        if self.zip_status == StreamStatus::Eof {
            return Ok(0);
        }

        let src_size = source.size()?;

        // An empty underlying file is an empty stream.
        if src_size <= self.start {
            self.file_status = StreamStatus::Eof;
            self.zip_status = StreamStatus::Eof;
            return Ok(0);
        }

        let mut produced_total = 0usize;

        while produced_total < out.len() {
            if self.in_pos == self.in_len && self.file_status == StreamStatus::Running {
                // Refill the input buffer from the compressed file.
                if self.file_offs >= src_size {
                    self.file_status = StreamStatus::Eof;
                } else {
                    let want = ((src_size - self.file_offs) as usize).min(BUF_SIZE);
                    let got = source.read_at(self.file_offs, &mut self.buf[..want])?;
                    self.in_pos = 0;
                    self.in_len = got;
                    if got == 0 || self.file_offs + got as u64 >= src_size {
                        self.file_status = StreamStatus::Eof;
                    }
                }
            }

            // Input may be empty at file EOF: the decoder still drains
            // internally buffered output (bzip2 holds whole blocks).
            let (consumed, produced, end) = self
                .inflater
                .inflate(&self.buf[self.in_pos..self.in_len], &mut out[produced_total..])?;
            self.in_pos += consumed;
            self.file_offs += consumed as u64;
            self.zip_offs += produced as u64;
            produced_total += produced;

            if end {
                self.zip_status = StreamStatus::Eof;
                break;
            }
            if consumed == 0 && produced == 0 {
                return Err(Error::io("truncated compressed stream"));
            }
        }

        if self.codec == Codec::Gzip {
            self.crc.update(&out[..produced_total]);
            if self.zip_status == StreamStatus::Eof {
                gzip::verify_suffix(source, self.file_offs, self.crc.sum(), self.zip_offs)?;
            }
        }

        Ok(produced_total)
    }

    /// Positions the decoder at uncompressed offset `offs`. Backward moves
    /// reset to the stream start and consume forward; `allow_reset` is
    /// false during a write-back session, when the bytes behind the
    /// decoder may already be gone.
    fn seek(&mut self, source: &FileStore, start: u64, offs: u64, allow_reset: bool) -> Result<()> {
        if self.zip_offs > offs {
            if !allow_reset {
                return Err(Error::InvalidArgument);
            }
            self.reinit(start);
        }
        if self.zip_offs < offs {
            debug!("seeking compressed stream from {} to {}", self.zip_offs, offs);
            let mut scratch = vec![0u8; BUF_SIZE];
            while self.zip_offs < offs {
                let amount = ((offs - self.zip_offs) as usize).min(BUF_SIZE);
                let n = self.read(source, &mut scratch[..amount])?;
                if n < amount {
                    return Err(Error::io("seek past end of compressed stream"));
                }
            }
        }
        debug_assert_eq!(self.zip_offs, offs);
        Ok(())
    }
}

/// Encoder state for the write-back pass.
struct WriteState {
    deflater: Deflater,
    buf: Box<[u8]>,
    out_len: usize,
    /// Write position in the compressed file.
    file_offs: u64,
    crc: Crc,
}

impl WriteState {
    fn new(codec: Codec, start: u64) -> Self {
        WriteState {
            deflater: Deflater::new(codec),
            buf: vec![0u8; BUF_SIZE].into_boxed_slice(),
            out_len: 0,
            file_offs: start,
            crc: Crc::new(),
        }
    }
}

// ─── The store ───────────────────────────────────────────────────────────────

struct ZipCache {
    blocks: Vec<Option<Box<[u8]>>>,
    /// Size of the uncompressed view.
    size: u64,
}

/// A compressed backing store.
pub struct ZipStore {
    codec: Codec,
    writable: bool,
    source: FileStore,
    /// First byte of compressed payload (after any container header).
    start_file_offs: u64,
    /// Uncompressed size as of open.
    orig_size: u64,
    orig_blocks: usize,
    read: Mutex<ReadState>,
    cache: Mutex<ZipCache>,
}

impl std::fmt::Debug for ZipStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZipStore")
            .field("codec", &self.codec)
            .field("writable", &self.writable)
            .field("orig_size", &self.orig_size)
            .finish()
    }
}

fn alloc_block() -> Box<[u8]> {
    vec![0u8; BUF_SIZE].into_boxed_slice()
}

impl ZipStore {
    /// Opens a compressed store and traverses the stream to size it.
    pub fn open(path: &Path, writable: bool, create: bool, codec: Codec) -> Result<Self> {
        let source = FileStore::open(path, writable, create)?;
        let src_size = source.size()?;

        let start_file_offs = if codec == Codec::Gzip && src_size > 0 {
            gzip::read_header(&source)?
        } else {
            0
        };
        debug!("compressed payload starts at {}", start_file_offs);

        let mut read = ReadState::new(codec, start_file_offs);

        // One pass over the whole stream: discover the uncompressed size
        // and pre-size the block vector. The initial guess doubles the
        // compressed block count; it grows again if the data expands more.
        let mut blocks: Vec<Option<Box<[u8]>>> = Vec::new();
        blocks.resize_with((block_number(src_size) + 1) << 1, || None);

        let mut total: u64 = 0;
        let mut block = 0usize;
        let mut buf = vec![0u8; BUF_SIZE];
        loop {
            let n = read.read(&source, &mut buf)?;
            if n == 0 {
                break;
            }
            total += n as u64;
            block += 1;
            if block >= blocks.len() {
                let grown = blocks.len() << 1;
                blocks.resize_with(grown, || None);
            }
        }
        debug!("uncompressed stream size is {}", total);

        let orig_blocks = blocks_for(total);
        Ok(ZipStore {
            codec,
            writable,
            source,
            start_file_offs,
            orig_size: total,
            orig_blocks,
            read: Mutex::new(read),
            cache: Mutex::new(ZipCache {
                blocks,
                size: total,
            }),
        })
    }

    /// Size of the uncompressed view.
    pub fn size(&self) -> u64 {
        self.cache.lock().unwrap().size
    }

    /// Decodes `buf.len()` bytes at `offset` of the uncompressed view.
    /// Cache hits are copied; misses are decoded straight into the
    /// caller's buffer without materialising a block.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let cache = self.cache.lock().unwrap();
        if offset >= cache.size {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(cache.size - offset) as usize;

        let mut block = block_number(offset);
        let mut rel = block_offset(offset);
        let mut pos = 0usize;

        while pos < len {
            let chunk = (BUF_SIZE - rel).min(len - pos);
            let abs = ((block as u64) << BUF_SIZE_LOG2) + rel as u64;

            match cache.blocks.get(block).and_then(Option::as_ref) {
                Some(data) => buf[pos..pos + chunk].copy_from_slice(&data[rel..rel + chunk]),
                None => {
                    let mut read = self.read.lock().unwrap();
                    read.seek(&self.source, self.start_file_offs, abs, true)?;
                    let n = read.read(&self.source, &mut buf[pos..pos + chunk])?;
                    if n != chunk {
                        return Err(Error::io("short read from compressed stream"));
                    }
                }
            }

            block += 1;
            rel = 0;
            pos += chunk;
        }

        Ok(len)
    }

    /// Overlays `data` at `offset` in the cache (copy-on-write). Writing
    /// past the current size is refused — callers grow the store first.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let mut cache = self.cache.lock().unwrap();
        if offset >= cache.size {
            warn!(
                "write at {} beyond compressed store size {}",
                offset, cache.size
            );
            return Err(Error::io("write past end of compressed store"));
        }
        let len = (data.len() as u64).min(cache.size - offset) as usize;

        let mut block = block_number(offset);
        let mut rel = block_offset(offset);
        let mut pos = 0usize;

        while pos < len {
            let chunk = (BUF_SIZE - rel).min(len - pos);

            if cache.blocks[block].is_none() {
                if block < self.orig_blocks {
                    let buf = self.fetch_block(block)?;
                    cache.blocks[block] = Some(buf);
                } else {
                    cache.blocks[block] = Some(alloc_block());
                }
            }
            let dst = cache.blocks[block].as_mut().expect("block just materialised");
            dst[rel..rel + chunk].copy_from_slice(&data[pos..pos + chunk]);

            block += 1;
            rel = 0;
            pos += chunk;
        }

        Ok(len)
    }

    /// Materialises one block of the original stream via the decoder.
    fn fetch_block(&self, block: usize) -> Result<Box<[u8]>> {
        debug_assert!(block < self.orig_blocks);
        let start = (block as u64) << BUF_SIZE_LOG2;
        let want = ((self.orig_size - start) as usize).min(BUF_SIZE);

        let mut buf = alloc_block();
        let mut read = self.read.lock().unwrap();
        read.seek(&self.source, self.start_file_offs, start, true)?;
        let n = read.read(&self.source, &mut buf[..want])?;
        if n != want {
            return Err(Error::io("short read from compressed stream"));
        }
        Ok(buf)
    }

    /// Adjusts the uncompressed view's size: the block vector grows
    /// without allocating and sheds freed tail blocks on shrink.
    pub fn set_size(&self, size: u64) -> Result<()> {
        let mut cache = self.cache.lock().unwrap();
        let new_len = blocks_for(size);
        debug!("compressed store resized {} -> {}", cache.size, size);
        if size > cache.size {
            if new_len > cache.blocks.len() {
                cache.blocks.resize_with(new_len, || None);
            }
        } else {
            cache.blocks.truncate(new_len);
        }
        cache.size = size;
        Ok(())
    }

    /// Flushes the store: when writable and dirty, re-encodes the whole
    /// uncompressed image through a fresh encoder, truncating the backing
    /// file if the result shrank. Dirty means a resized view or any
    /// materialised block.
    pub fn close(mut self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }

        let cache = self.cache.get_mut().unwrap();
        let dirty = cache.size != self.orig_size || cache.blocks.iter().any(Option::is_some);
        if !dirty {
            return Ok(());
        }
        debug!("flushing compressed store ({} bytes)", cache.size);

        // A store created this session has no container header yet.
        if self.codec == Codec::Gzip && self.source.size()? == 0 {
            self.source.write_at(0, &gzip::header())?;
            self.start_file_offs = gzip::HEADER_SIZE;
        }

        let mut write = WriteState::new(self.codec, self.start_file_offs);
        let read = self.read.get_mut().unwrap();
        read.reinit(self.start_file_offs);

        let size = cache.size;
        let nblocks = blocks_for(size);
        for block in 0..nblocks {
            let start = (block as u64) << BUF_SIZE_LOG2;
            let amount = ((size - start) as usize).min(BUF_SIZE);

            // Take the block out of the cache (fetching or zeroing absent
            // slots) so the cache-ahead hook can materialise later blocks
            // while this one is being encoded.
            let data = match cache.blocks.get_mut(block).and_then(Option::take) {
                Some(data) => data,
                None if block < self.orig_blocks => {
                    let want = ((self.orig_size - start) as usize).min(BUF_SIZE);
                    let mut buf = alloc_block();
                    read.seek(&self.source, self.start_file_offs, start, false)?;
                    let n = read.read(&self.source, &mut buf[..want])?;
                    if n != want {
                        return Err(Error::io("short read from compressed stream"));
                    }
                    buf
                }
                None => alloc_block(),
            };

            let finish = block == nblocks - 1;
            stream_write(
                &self.source,
                self.codec,
                read,
                cache,
                self.orig_size,
                self.orig_blocks,
                &mut write,
                &data[..amount],
                finish,
            )?;
        }

        // An emptied store still needs its stream terminator.
        if nblocks == 0 {
            stream_write(
                &self.source,
                self.codec,
                read,
                cache,
                self.orig_size,
                self.orig_blocks,
                &mut write,
                &[],
                true,
            )?;
        }

        if self.source.size()? > write.file_offs {
            debug!("truncating compressed file to {}", write.file_offs);
            self.source.set_size(write.file_offs)?;
        }
        Ok(())
    }
}

// ─── Write-back helpers ──────────────────────────────────────────────────────

/// Encodes `input`, flushing full output buffers to the source. Before
/// every source write the decoder is advanced past the region about to be
/// overwritten, caching any of its blocks not yet materialised. With
/// `finish`, drains the encoder and writes the gzip suffix.
#[allow(clippy::too_many_arguments)]
fn stream_write(
    source: &FileStore,
    codec: Codec,
    read: &mut ReadState,
    cache: &mut ZipCache,
    orig_size: u64,
    orig_blocks: usize,
    write: &mut WriteState,
    input: &[u8],
    finish: bool,
) -> Result<()> {
    let mut in_pos = 0usize;

    loop {
        if write.out_len == BUF_SIZE {
            flush_output(source, read, cache, orig_size, orig_blocks, write)?;
        }

        let out_len = write.out_len;
        let (consumed, produced, end) =
            write
                .deflater
                .deflate(&input[in_pos..], &mut write.buf[out_len..], finish)?;
        in_pos += consumed;
        write.out_len += produced;

        if finish {
            if end {
                break;
            }
            continue;
        }
        if in_pos == input.len() {
            break;
        }
    }

    if codec == Codec::Gzip {
        write.crc.update(input);
    }

    if finish {
        flush_output(source, read, cache, orig_size, orig_blocks, write)?;
        if codec == Codec::Gzip {
            let suffix = gzip::suffix(write.crc.sum(), write.deflater.total_in());
            advance_decoder_past(
                source,
                read,
                cache,
                orig_size,
                orig_blocks,
                write.file_offs + suffix.len() as u64,
            )?;
            source.write_at(write.file_offs, &suffix)?;
            write.file_offs += suffix.len() as u64;
        }
        debug!("compressed stream finished at {}", write.file_offs);
    }

    Ok(())
}

/// Writes the pending output buffer at the write cursor, advancing the
/// decoder over the bytes about to be clobbered first.
fn flush_output(
    source: &FileStore,
    read: &mut ReadState,
    cache: &mut ZipCache,
    orig_size: u64,
    orig_blocks: usize,
    write: &mut WriteState,
) -> Result<()> {
    let amount = write.out_len;
    if amount == 0 {
        return Ok(());
    }
    advance_decoder_past(
        source,
        read,
        cache,
        orig_size,
        orig_blocks,
        write.file_offs + amount as u64,
    )?;
    source.write_at(write.file_offs, &write.buf[..amount])?;
    write.file_offs += amount as u64;
    write.out_len = 0;
    Ok(())
}

/// The cache-ahead hook of the write-back pass: consumes the decoder until
/// its source cursor reaches `upto`, materialising any uncompressed block
/// it passes that the cache does not hold yet. Once the decoder's input is
/// fully buffered (source at EOF) nothing on disk can be lost and the
/// advance stops.
fn advance_decoder_past(
    source: &FileStore,
    read: &mut ReadState,
    cache: &mut ZipCache,
    orig_size: u64,
    orig_blocks: usize,
    upto: u64,
) -> Result<()> {
    while read.file_status == StreamStatus::Running
        && read.zip_status == StreamStatus::Running
        && read.file_offs < upto
    {
        // Everything decodable has been produced; the bytes left on disk
        // (stream trailer, suffix) are not needed again.
        if read.zip_offs >= orig_size {
            break;
        }
        // The decoder only ever stops on block boundaries here.
        debug_assert_eq!(block_offset(read.zip_offs), 0);
        let block = block_number(read.zip_offs);
        if block >= orig_blocks {
            break;
        }
        let want = ((orig_size - read.zip_offs) as usize).min(BUF_SIZE);

        if block < cache.blocks.len() && cache.blocks[block].is_some() {
            // Already materialised: discard the decoder's copy.
            let mut scratch = vec![0u8; BUF_SIZE];
            read.read(source, &mut scratch[..want])?;
        } else {
            let mut buf = alloc_block();
            let n = read.read(source, &mut buf[..want])?;
            if n != want {
                return Err(Error::io("short read from compressed stream"));
            }
            if block >= cache.blocks.len() {
                cache.blocks.resize_with(block + 1, || None);
            }
            cache.blocks[block] = Some(buf);
        }
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn gzip_file(dir: &TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let f = std::fs::File::create(&path).unwrap();
        let mut enc = flate2::write::GzEncoder::new(f, flate2::Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap();
        path
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn open_discovers_uncompressed_size() {
        let dir = TempDir::new().unwrap();
        let data = pattern(3 * BUF_SIZE + 123);
        let path = gzip_file(&dir, "a.gz", &data);

        let store = ZipStore::open(&path, false, false, Codec::Gzip).unwrap();
        assert_eq!(store.size(), data.len() as u64);
    }

    #[test]
    fn reads_at_random_offsets_match_source() {
        let dir = TempDir::new().unwrap();
        let data = pattern(4 * BUF_SIZE);
        let path = gzip_file(&dir, "a.gz", &data);
        let store = ZipStore::open(&path, false, false, Codec::Gzip).unwrap();

        // Forward read, then a backward one forcing a decoder reset.
        let mut buf = vec![0u8; 1000];
        assert_eq!(store.read_at(2 * BUF_SIZE as u64, &mut buf).unwrap(), 1000);
        assert_eq!(buf, &data[2 * BUF_SIZE..2 * BUF_SIZE + 1000]);

        assert_eq!(store.read_at(17, &mut buf).unwrap(), 1000);
        assert_eq!(buf, &data[17..1017]);

        // Two sequential reads jointly covering a range equal one read.
        let mut a = vec![0u8; 600];
        let mut b = vec![0u8; 400];
        store.read_at(100, &mut a).unwrap();
        store.read_at(700, &mut b).unwrap();
        let mut joined = a.clone();
        joined.extend_from_slice(&b);
        assert_eq!(joined, &data[100..1100]);
    }

    #[test]
    fn write_then_close_produces_valid_gzip() {
        let dir = TempDir::new().unwrap();
        let data = pattern(2 * BUF_SIZE + 700);
        let path = gzip_file(&dir, "a.gz", &data);

        let store = ZipStore::open(&path, true, false, Codec::Gzip).unwrap();
        store.write_at(100, b"PATCHED").unwrap();
        store.close().unwrap();

        // Re-open and verify both the patch and the preserved remainder.
        let store = ZipStore::open(&path, false, false, Codec::Gzip).unwrap();
        assert_eq!(store.size(), data.len() as u64);
        let mut buf = vec![0u8; data.len()];
        store.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[100..107], b"PATCHED");
        assert_eq!(&buf[..100], &data[..100]);
        assert_eq!(&buf[107..], &data[107..]);
    }

    #[test]
    fn grow_write_close_roundtrip() {
        let dir = TempDir::new().unwrap();
        let data = pattern(BUF_SIZE);
        let path = gzip_file(&dir, "a.gz", &data);

        let store = ZipStore::open(&path, true, false, Codec::Gzip).unwrap();
        let grown = (BUF_SIZE + 5000) as u64;
        store.set_size(grown).unwrap();
        store.write_at(grown - 3, b"end").unwrap();
        store.close().unwrap();

        let store = ZipStore::open(&path, false, false, Codec::Gzip).unwrap();
        assert_eq!(store.size(), grown);
        let mut buf = vec![0u8; 3];
        store.read_at(grown - 3, &mut buf).unwrap();
        assert_eq!(&buf, b"end");
        // The hole between old end and the write reads as zeros.
        let mut hole = vec![0u8; 100];
        store.read_at(BUF_SIZE as u64 + 100, &mut hole).unwrap();
        assert!(hole.iter().all(|&b| b == 0));
    }

    #[test]
    fn clean_close_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let data = pattern(1000);
        let path = gzip_file(&dir, "a.gz", &data);
        let before = std::fs::read(&path).unwrap();

        let store = ZipStore::open(&path, true, false, Codec::Gzip).unwrap();
        let mut buf = vec![0u8; 500];
        store.read_at(200, &mut buf).unwrap();
        store.close().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn fresh_store_writes_a_new_gzip_container() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("new.gz");

        let store = ZipStore::open(&path, true, true, Codec::Gzip).unwrap();
        assert_eq!(store.size(), 0);
        store.set_size(5000).unwrap();
        let data = pattern(5000);
        store.write_at(0, &data).unwrap();
        store.close().unwrap();

        let store = ZipStore::open(&path, false, false, Codec::Gzip).unwrap();
        assert_eq!(store.size(), 5000);
        let mut buf = vec![0u8; 5000];
        store.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn bzip2_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.bz2");
        let data = pattern(2 * BUF_SIZE + 17);
        {
            let f = std::fs::File::create(&path).unwrap();
            let mut enc = bzip2::write::BzEncoder::new(f, bzip2::Compression::new(4));
            enc.write_all(&data).unwrap();
            enc.finish().unwrap();
        }

        let store = ZipStore::open(&path, true, false, Codec::Bzip2).unwrap();
        assert_eq!(store.size(), data.len() as u64);
        store.write_at(BUF_SIZE as u64, b"bz-patch").unwrap();
        store.close().unwrap();

        let store = ZipStore::open(&path, false, false, Codec::Bzip2).unwrap();
        let mut buf = vec![0u8; data.len()];
        store.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[BUF_SIZE..BUF_SIZE + 8], b"bz-patch");
        assert_eq!(&buf[..BUF_SIZE], &data[..BUF_SIZE]);
    }

    #[test]
    fn corrupt_crc_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = gzip_file(&dir, "a.gz", &pattern(1000));
        // Flip a bit in the stored CRC.
        let mut bytes = std::fs::read(&path).unwrap();
        let crc_pos = bytes.len() - 8;
        bytes[crc_pos] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        assert!(ZipStore::open(&path, false, false, Codec::Gzip).is_err());
    }
}
