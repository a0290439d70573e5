#![allow(dead_code)]
//! Shared helpers for the end-to-end suites.
//!
//! Archives are built byte-by-byte here, independently of the crate's own
//! header emitter, so round-trip tests exercise real parsing rather than
//! the emitter against itself.

use std::path::Path;
use std::sync::Arc;

use tarfs::{Backend, Compression, Filesystem, Node, Options};

pub const RECORD: usize = 512;

fn octal(field: &mut [u8], digits: usize, value: u64) {
    let s = format!("{:0width$o}", value, width = digits);
    field[..digits].copy_from_slice(s.as_bytes());
    field[digits] = 0;
}

fn raw_header(name: &str, mode: u64, size: u64, typeflag: u8, linkname: &str) -> [u8; RECORD] {
    let mut h = [0u8; RECORD];
    h[..name.len()].copy_from_slice(name.as_bytes());
    octal(&mut h[100..108], 7, mode);
    octal(&mut h[108..116], 7, 1000);
    octal(&mut h[116..124], 7, 1000);
    octal(&mut h[124..136], 11, size);
    octal(&mut h[136..148], 11, 1_600_000_000);
    h[156] = typeflag;
    h[157..157 + linkname.len()].copy_from_slice(linkname.as_bytes());
    h[257..265].copy_from_slice(b"ustar  \0");

    h[148..156].fill(b' ');
    let sum: u64 = h.iter().map(|&b| u64::from(b)).sum();
    let chk = format!("{:06o}\0 ", sum);
    h[148..156].copy_from_slice(chk.as_bytes());
    h
}

/// Builds GNU tar archive bytes entry by entry.
#[derive(Default)]
pub struct ArchiveBuilder {
    bytes: Vec<u8>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        ArchiveBuilder::default()
    }

    pub fn dir(mut self, name: &str) -> Self {
        let name = format!("{}/", name);
        self.bytes
            .extend_from_slice(&raw_header(&name, 0o755, 0, b'5', ""));
        self
    }

    pub fn file(mut self, name: &str, data: &[u8]) -> Self {
        self.bytes
            .extend_from_slice(&raw_header(name, 0o644, data.len() as u64, b'0', ""));
        self.bytes.extend_from_slice(data);
        let rem = data.len() % RECORD;
        if rem != 0 {
            self.bytes.extend(std::iter::repeat_n(0u8, RECORD - rem));
        }
        self
    }

    pub fn symlink(mut self, name: &str, target: &str) -> Self {
        // GNU tar stores links with a zero size field and no payload.
        self.bytes
            .extend_from_slice(&raw_header(name, 0o777, 0, b'2', target));
        self
    }

    pub fn hardlink(mut self, name: &str, target: &str) -> Self {
        self.bytes
            .extend_from_slice(&raw_header(name, 0o644, 0, b'1', target));
        self
    }

    /// Terminates the archive with two zero records.
    pub fn build(mut self) -> Vec<u8> {
        self.bytes.extend(std::iter::repeat_n(0u8, 2 * RECORD));
        self.bytes
    }

    pub fn write_to(self, path: &Path) {
        std::fs::write(path, self.build()).unwrap();
    }
}

// ─── Mount helpers ───────────────────────────────────────────────────────────

pub fn mount_with(path: &Path, configure: impl FnOnce(&mut Options)) -> Arc<Filesystem> {
    let mut opts = Options::new(path);
    configure(&mut opts);
    let fs = Arc::new(Filesystem::new(opts).expect("mount failed"));
    fs.init().expect("ingest failed");
    fs
}

pub fn mount(path: &Path) -> Arc<Filesystem> {
    mount_with(path, |_| {})
}

pub fn mount_compressed(path: &Path, compress: Compression) -> Arc<Filesystem> {
    mount_with(path, |o| o.compress = compress)
}

/// Resolves a `/`-separated path from the root.
pub fn lookup(fs: &Filesystem, path: &str) -> Arc<Node> {
    try_lookup(fs, path).unwrap_or_else(|| panic!("no such entry: {}", path))
}

pub fn try_lookup(fs: &Filesystem, path: &str) -> Option<Arc<Node>> {
    let mut node = fs.root().clone();
    for comp in path.split('/').filter(|c| !c.is_empty()) {
        node = fs.lookup(&node, comp).ok()?;
    }
    Some(node)
}

/// Reads a node's whole contents through the backend.
pub fn read_all(fs: &Filesystem, node: &Arc<Node>) -> Vec<u8> {
    let size = node.stat().size as usize;
    let mut out = vec![0u8; size];
    let mut pos = 0;
    while pos < size {
        let n = fs
            .read_node(node, pos as u64, &mut out[pos..])
            .expect("read failed");
        assert!(n > 0, "short read at {}", pos);
        pos += n;
    }
    out
}

/// Names of a directory's entries, in insertion order.
pub fn entry_names(dir: &Arc<Node>) -> Vec<String> {
    dir.state
        .lock()
        .unwrap()
        .children
        .iter()
        .filter_map(|c| c.name())
        .collect()
}

/// Deterministic pseudo-random bytes for content checks.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u64).wrapping_mul(31).wrapping_add(seed as u64) as u8)
        .collect()
}
