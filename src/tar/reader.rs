//! Record streaming over a backing store.
//!
//! [`TarReader`] walks an archive record by record; [`open_archive`] wraps
//! it in the recovery state machine: a bad checksum on the first record is
//! fatal, one after good records is skipped past its declared payload with
//! a warning, two in a row terminate parsing. Two consecutive zero records
//! (or plain end of file) end the archive.
//!
//! GNU `L`/`K` extension records are consumed transparently: their payload
//! becomes the next real entry's name or link target.

use log::{error, warn};

use crate::error::{Error, Result};
use crate::store::Store;

use super::header::{LinkFlag, Record, RECORD_SIZE};
use super::round_records;

/// One successfully parsed archive entry.
#[derive(Debug)]
pub struct ParsedEntry {
    pub record: Record,
    /// Entry name with any long-name substitution applied and a trailing
    /// slash stripped.
    pub name: String,
    /// Link target with any long-link substitution applied.
    pub linkname: String,
    pub linkflag: LinkFlag,
    /// Archive offset of the payload (the header sits one record before).
    pub payload_offset: u64,
    /// Payload size in bytes.
    pub size: u64,
}

/// Outcome of one header read.
pub enum ReadStatus {
    Success(Box<ParsedEntry>),
    /// Invalid checksum; carries the size the record declared so recovery
    /// can skip its payload.
    BadChecksum { declared_size: u64 },
    /// A record of zeros.
    EofMark,
    /// End of backing store.
    Eof,
}

/// Streaming archive parser.
pub struct TarReader<'a> {
    store: &'a Store,
    pos: u64,
    next_long_name: Option<String>,
    next_long_link: Option<String>,
}

impl<'a> TarReader<'a> {
    pub fn new(store: &'a Store) -> Self {
        TarReader {
            store,
            pos: 0,
            next_long_name: None,
            next_long_link: None,
        }
    }

    /// Current archive offset.
    pub fn position(&self) -> u64 {
        self.pos
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        let mut rec = Record::default();
        let n = self.store.read_at(self.pos, &mut rec.0)?;
        if n != RECORD_SIZE {
            return Ok(None);
        }
        self.pos += RECORD_SIZE as u64;
        Ok(Some(rec))
    }

    /// Reads the NUL-terminated string payload of an `L`/`K` record.
    fn read_name_payload(&mut self, size: u64) -> Result<String> {
        let mut bytes = Vec::with_capacity(size as usize);
        let mut left = size;
        while left > 0 {
            let rec = self
                .next_record()?
                .ok_or_else(|| {
                    error!("unexpected end of archive in long-name record");
                    Error::BadFormat
                })?;
            let take = left.min(RECORD_SIZE as u64) as usize;
            bytes.extend_from_slice(&rec.0[..take]);
            left -= take as u64;
        }
        if let Some(nul) = bytes.iter().position(|&b| b == 0) {
            bytes.truncate(nul);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Parses the next header. `L`/`K` records are absorbed here; callers
    /// only ever see real entries.
    pub fn read_header(&mut self) -> Result<ReadStatus> {
        loop {
            let Some(rec) = self.next_record()? else {
                return Ok(ReadStatus::Eof);
            };
            if rec.is_zero() {
                return Ok(ReadStatus::EofMark);
            }
            if !rec.checksum_ok() {
                return Ok(ReadStatus::BadChecksum {
                    declared_size: rec.payload_size(),
                });
            }

            let linkflag = rec.linkflag();
            let size = rec.payload_size();

            if matches!(linkflag, LinkFlag::LongName | LinkFlag::LongLink) {
                let value = self.read_name_payload(size)?;
                match linkflag {
                    LinkFlag::LongName => self.next_long_name = Some(value),
                    _ => self.next_long_link = Some(value),
                }
                continue;
            }

            let mut name = self.next_long_name.take().unwrap_or_else(|| rec.name());
            let mut linkname = self.next_long_link.take().unwrap_or_else(|| rec.linkname());

            // BSD pax writes directories as plain entries with a trailing
            // slash; strip it and promote the flag.
            let mut linkflag = linkflag;
            if name.ends_with('/') {
                name.pop();
                if matches!(linkflag, LinkFlag::OldNormal | LinkFlag::Normal) {
                    linkflag = LinkFlag::Dir;
                }
            }
            if linkname.ends_with('/') {
                linkname.pop();
            }

            let payload_offset = self.pos;

            // Old-GNU sparse continuation records: not supported, skipped.
            if rec.is_extended() {
                loop {
                    match self.next_record()? {
                        Some(ext) if ext.continuation_is_extended() => {}
                        _ => break,
                    }
                }
            }

            self.pos += round_records(size);

            return Ok(ReadStatus::Success(Box::new(ParsedEntry {
                record: rec,
                name,
                linkname,
                linkflag,
                payload_offset,
                size,
            })));
        }
    }
}

/// Parses a whole archive, feeding each entry to `handle`.
pub fn open_archive<F>(store: &Store, mut handle: F) -> Result<()>
where
    F: FnMut(ParsedEntry) -> Result<()>,
{
    #[derive(Clone, Copy, PartialEq)]
    enum Prev {
        Success,
        BadChecksum,
        EofMark,
    }

    let mut reader = TarReader::new(store);
    let mut status = Prev::EofMark;

    loop {
        let prev = status;
        match reader.read_header()? {
            ReadStatus::Success(entry) => {
                status = Prev::Success;
                handle(*entry)?;
            }
            ReadStatus::BadChecksum { declared_size } => match prev {
                Prev::EofMark => {
                    error!("bad checksum on first record");
                    return Err(Error::BadFormat);
                }
                Prev::BadChecksum => {
                    error!("bad checksum (offset={})", reader.position());
                    return Err(Error::BadFormat);
                }
                Prev::Success => {
                    warn!("skipping to next header (offset={})", reader.position());
                    reader.pos += round_records(declared_size);
                    status = Prev::BadChecksum;
                }
            },
            ReadStatus::EofMark => {
                if prev == Prev::EofMark {
                    break;
                }
                status = Prev::EofMark;
            }
            ReadStatus::Eof => break,
        }
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Compression, Store};
    use crate::tar::header::{make_header, NAME_SIZE};
    use crate::tree::{Stat, S_IFDIR, S_IFREG};
    use tempfile::TempDir;

    fn stat(mode: u32, size: u64) -> Stat {
        Stat {
            mode,
            size,
            mtime: 1_600_000_000,
            ..Stat::default()
        }
    }

    fn pad_records(out: &mut Vec<u8>, payload: &[u8]) {
        out.extend_from_slice(payload);
        let rem = payload.len() % RECORD_SIZE;
        if rem != 0 {
            out.extend(std::iter::repeat_n(0u8, RECORD_SIZE - rem));
        }
    }

    fn archive_store(dir: &TempDir, bytes: &[u8]) -> Store {
        let path = dir.path().join("t.tar");
        std::fs::write(&path, bytes).unwrap();
        Store::open(&path, false, false, Compression::None).unwrap()
    }

    fn parse_all(store: &Store) -> Vec<ParsedEntry> {
        let mut entries = Vec::new();
        open_archive(store, |e| {
            entries.push(e);
            Ok(())
        })
        .unwrap();
        entries
    }

    #[test]
    fn parses_files_and_directories_in_order() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&make_header(&stat(S_IFDIR | 0o755, 0), "d", None, None).unwrap().0);
        bytes.extend_from_slice(
            &make_header(&stat(S_IFREG | 0o644, 14), "d/hello.txt", None, None).unwrap().0,
        );
        pad_records(&mut bytes, b"hello, tarfs!\n");
        bytes.extend(std::iter::repeat_n(0u8, 2 * RECORD_SIZE));

        let dir = TempDir::new().unwrap();
        let store = archive_store(&dir, &bytes);
        let entries = parse_all(&store);

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "d");
        assert_eq!(entries[0].linkflag, LinkFlag::Dir);
        assert_eq!(entries[0].size, 0);
        assert_eq!(entries[1].name, "d/hello.txt");
        assert_eq!(entries[1].size, 14);
        assert_eq!(entries[1].payload_offset, 2 * RECORD_SIZE as u64);

        let mut payload = [0u8; 14];
        store
            .read_at(entries[1].payload_offset, &mut payload)
            .unwrap();
        assert_eq!(&payload, b"hello, tarfs!\n");
    }

    #[test]
    fn archive_without_trailing_zeros_still_ends() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&make_header(&stat(S_IFREG, 0), "f", None, None).unwrap().0);

        let dir = TempDir::new().unwrap();
        let store = archive_store(&dir, &bytes);
        assert_eq!(parse_all(&store).len(), 1);
    }

    #[test]
    fn long_name_records_rename_the_next_entry() {
        let long: String = std::iter::repeat_n('n', 140).collect();

        let mut bytes = Vec::new();
        // 'L' record whose payload is the long name (NUL-terminated).
        let mut l_stat = stat(S_IFREG, long.len() as u64 + 1);
        l_stat.mode = 0;
        let mut l_rec = make_header(&l_stat, "././@LongLink", None, None).unwrap();
        l_rec.0[156] = b'L';
        // Re-checksum after patching the flag.
        l_rec.0[148..156].fill(b' ');
        let (sum, _) = l_rec.compute_checksums();
        let digits = format!("{:06o}\0 ", sum);
        l_rec.0[148..156].copy_from_slice(digits.as_bytes());
        bytes.extend_from_slice(&l_rec.0);

        let mut payload = long.clone().into_bytes();
        payload.push(0);
        pad_records(&mut bytes, &payload);

        bytes.extend_from_slice(&make_header(&stat(S_IFREG, 3), "short", None, None).unwrap().0);
        pad_records(&mut bytes, b"abc");
        bytes.extend(std::iter::repeat_n(0u8, 2 * RECORD_SIZE));

        let dir = TempDir::new().unwrap();
        let store = archive_store(&dir, &bytes);
        let entries = parse_all(&store);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].name.len() > NAME_SIZE);
        assert_eq!(entries[0].name, long);
        assert_eq!(entries[0].size, 3);
    }

    #[test]
    fn single_bad_checksum_is_skipped() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&make_header(&stat(S_IFREG, 5), "good1", None, None).unwrap().0);
        pad_records(&mut bytes, b"11111");

        // A record with a corrupted checksum and a declared 600-byte
        // payload (rounds to two records of junk).
        let mut bad = make_header(&stat(S_IFREG, 600), "bad", None, None).unwrap();
        bad.0[148] = b'9';
        bad.0[149] = b'9';
        bytes.extend_from_slice(&bad.0);
        bytes.extend(std::iter::repeat_n(0xaau8, 2 * RECORD_SIZE));

        bytes.extend_from_slice(&make_header(&stat(S_IFREG, 4), "good2", None, None).unwrap().0);
        pad_records(&mut bytes, b"2222");
        bytes.extend(std::iter::repeat_n(0u8, 2 * RECORD_SIZE));

        let dir = TempDir::new().unwrap();
        let store = archive_store(&dir, &bytes);
        let entries = parse_all(&store);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["good1", "good2"]);
    }

    #[test]
    fn bad_first_record_is_fatal() {
        let dir = TempDir::new().unwrap();
        let store = archive_store(&dir, &[0x55u8; RECORD_SIZE]);
        assert!(matches!(
            open_archive(&store, |_| Ok(())),
            Err(Error::BadFormat)
        ));
    }

    #[test]
    fn all_zero_archive_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = archive_store(&dir, &vec![0u8; 4 * RECORD_SIZE]);
        assert!(parse_all(&store).is_empty());
    }

    #[test]
    fn symlink_entries_carry_their_target() {
        let mut bytes = Vec::new();
        let mut st = stat(crate::tree::S_IFLNK | 0o777, 6);
        st.size = 6;
        bytes.extend_from_slice(&make_header(&st, "ln", Some("target"), None).unwrap().0);
        bytes.extend(std::iter::repeat_n(0u8, 2 * RECORD_SIZE));

        let dir = TempDir::new().unwrap();
        let store = archive_store(&dir, &bytes);
        let entries = parse_all(&store);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].linkflag, LinkFlag::Symlink);
        assert_eq!(entries[0].linkname, "target");
    }
}
