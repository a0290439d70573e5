//! Gzip framing for the compressed store.
//!
//! The stream layer drives zlib in raw-deflate mode and handles the RFC
//! 1952 container here by hand: the 10-byte header (plus the optional
//! fields a foreign writer may have added), and the CRC-32 + ISIZE suffix.
//! Emitted headers carry no optional fields at all.

use log::{error, warn};

use crate::error::{Error, Result};
use crate::store::FileStore;

pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const METHOD_DEFLATE: u8 = 8;

/// Size of the mandatory header.
pub const HEADER_SIZE: u64 = 10;

// Gzip flag byte.
const FHCRC: u8 = 0x02;
const FEXTRA: u8 = 0x04;
const FNAME: u8 = 0x08;
const FCOMMENT: u8 = 0x10;
const RESERVED: u8 = 0xe0;

/// Scans forward from `pos` past a NUL-terminated field.
fn skip_string(source: &FileStore, mut pos: u64) -> Result<u64> {
    let mut buf = [0u8; 64];
    loop {
        let n = source.read_at(pos, &mut buf)?;
        if n == 0 {
            return Err(Error::BadFormat);
        }
        match buf[..n].iter().position(|&b| b == 0) {
            Some(i) => return Ok(pos + i as u64 + 1),
            None => pos += n as u64,
        }
    }
}

/// Validates the gzip header at the start of `source` and returns the
/// offset of the first deflate byte.
pub fn read_header(source: &FileStore) -> Result<u64> {
    let mut fixed = [0u8; HEADER_SIZE as usize];
    if source.read_at(0, &mut fixed)? != fixed.len() {
        error!("gzip header truncated");
        return Err(Error::BadFormat);
    }
    if fixed[..2] != GZIP_MAGIC {
        error!("invalid gzip magic");
        return Err(Error::BadFormat);
    }
    let flags = fixed[3];
    if fixed[2] != METHOD_DEFLATE || flags & RESERVED != 0 {
        error!("unsupported gzip compression method");
        return Err(Error::io("unsupported gzip compression method"));
    }

    let mut pos = HEADER_SIZE;
    if flags & FEXTRA != 0 {
        let mut len = [0u8; 2];
        if source.read_at(pos, &mut len)? != 2 {
            return Err(Error::BadFormat);
        }
        pos += 2 + u64::from(u16::from_le_bytes(len));
    }
    if flags & FNAME != 0 {
        pos = skip_string(source, pos)?;
    }
    if flags & FCOMMENT != 0 {
        pos = skip_string(source, pos)?;
    }
    if flags & FHCRC != 0 {
        pos += 2;
    }
    Ok(pos)
}

/// A minimal header: magic, deflate, no flags, zeroed mtime/xfl/os.
pub fn header() -> [u8; HEADER_SIZE as usize] {
    let mut hdr = [0u8; HEADER_SIZE as usize];
    hdr[..2].copy_from_slice(&GZIP_MAGIC);
    hdr[2] = METHOD_DEFLATE;
    hdr
}

/// CRC-32 and uncompressed-length-mod-2^32 suffix, little-endian.
pub fn suffix(crc: u32, total_in: u64) -> [u8; 8] {
    let mut suf = [0u8; 8];
    suf[..4].copy_from_slice(&crc.to_le_bytes());
    suf[4..].copy_from_slice(&((total_in & 0xffff_ffff) as u32).to_le_bytes());
    suf
}

/// Compares the stored suffix at `pos` (where the decoder stopped) with
/// the running CRC and output count.
pub fn verify_suffix(source: &FileStore, pos: u64, crc: u32, total_out: u64) -> Result<()> {
    let mut suf = [0u8; 8];
    if source.read_at(pos, &mut suf)? != 8 {
        error!("unexpected end of gzip file (missing CRC suffix)");
        return Err(Error::io("missing gzip suffix"));
    }
    let stored_crc = u32::from_le_bytes(suf[..4].try_into().expect("4 bytes"));
    let stored_len = u32::from_le_bytes(suf[4..].try_into().expect("4 bytes"));

    if stored_crc != crc {
        error!("invalid gzip CRC: {:#010x} instead of {:#010x}", stored_crc, crc);
        return Err(Error::io("gzip CRC mismatch"));
    }
    if u64::from(stored_len) != total_out & 0xffff_ffff {
        error!(
            "invalid gzip length: {} instead of {}",
            stored_len,
            total_out & 0xffff_ffff
        );
        return Err(Error::io("gzip length mismatch"));
    }
    if source.size()? > pos + 8 {
        warn!("trailing characters at end of gzip file");
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_with(bytes: &[u8]) -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.gz");
        std::fs::write(&path, bytes).unwrap();
        (dir, FileStore::open(&path, false, false).unwrap())
    }

    #[test]
    fn bare_header_parses_to_offset_ten() {
        let (_d, s) = store_with(&header());
        assert_eq!(read_header(&s).unwrap(), 10);
    }

    #[test]
    fn optional_name_field_is_skipped() {
        // FNAME flag with "a.tar\0" after the fixed part.
        let mut bytes = header().to_vec();
        bytes[3] = 0x08;
        bytes.extend_from_slice(b"a.tar\0");
        bytes.extend_from_slice(&[0xde, 0xad]);
        let (_d, s) = store_with(&bytes);
        assert_eq!(read_header(&s).unwrap(), 16);
    }

    #[test]
    fn extra_and_hcrc_fields_are_skipped() {
        let mut bytes = header().to_vec();
        bytes[3] = 0x04 | 0x02; // FEXTRA | FHCRC
        bytes.extend_from_slice(&3u16.to_le_bytes());
        bytes.extend_from_slice(&[1, 2, 3]); // extra payload
        bytes.extend_from_slice(&[0, 0]); // header crc
        let (_d, s) = store_with(&bytes);
        assert_eq!(read_header(&s).unwrap(), 10 + 2 + 3 + 2);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let (_d, s) = store_with(b"PK\x03\x04 not a gzip file");
        assert!(matches!(read_header(&s), Err(Error::BadFormat)));
    }

    #[test]
    fn suffix_layout_is_little_endian() {
        let suf = suffix(0xdead_beef, 0x1_0000_0042);
        assert_eq!(&suf[..4], &0xdead_beefu32.to_le_bytes());
        // ISIZE is the length modulo 2^32.
        assert_eq!(&suf[4..], &0x42u32.to_le_bytes());
    }
}
