//! E2E: gzip and bzip2 backed mounts.

mod util;

use std::io::{Read, Write};

use tarfs::{Backend, Compression};
use tempfile::TempDir;
use util::*;

fn gzip_bytes(data: &[u8]) -> Vec<u8> {
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn gunzip_file(path: &std::path::Path) -> Vec<u8> {
    let file = std::fs::File::open(path).unwrap();
    let mut dec = flate2::read::GzDecoder::new(file);
    let mut out = Vec::new();
    dec.read_to_end(&mut out).expect("not a valid gzip file");
    out
}

#[test]
fn gzip_mount_equals_plain_mount() {
    let dir = TempDir::new().unwrap();
    let tar = ArchiveBuilder::new()
        .dir("d")
        .file("d/f", &pattern(10_000, 21))
        .file("g", b"small")
        .build();

    let plain_path = dir.path().join("a.tar");
    std::fs::write(&plain_path, &tar).unwrap();
    let gz_path = dir.path().join("a.tar.gz");
    std::fs::write(&gz_path, gzip_bytes(&tar)).unwrap();

    let plain = mount(&plain_path);
    let gz = mount_compressed(&gz_path, Compression::Gzip);

    assert_eq!(entry_names(plain.root()), entry_names(gz.root()));
    for path in ["d/f", "g"] {
        assert_eq!(
            read_all(&plain, &lookup(&plain, path)),
            read_all(&gz, &lookup(&gz, path)),
            "mismatch for {}",
            path
        );
    }
    plain.go_away().unwrap();
    gz.go_away().unwrap();
}

#[test]
fn gzip_sync_writes_a_valid_gzip_archive() {
    let dir = TempDir::new().unwrap();
    let tar = ArchiveBuilder::new().file("keep", b"keep me").build();
    let gz_path = dir.path().join("s.tar.gz");
    std::fs::write(&gz_path, gzip_bytes(&tar)).unwrap();

    let body = pattern(3 * 1024, 42);
    let fs = mount_compressed(&gz_path, Compression::Gzip);
    let new = fs
        .create_node(fs.root(), Some("new.txt"), tarfs::tree::S_IFREG | 0o644)
        .unwrap();
    fs.write_node(&new, 0, &body).unwrap();
    fs.sync_fs(false).unwrap();
    fs.go_away().unwrap();

    // The file on disk must still be a well-formed gzip stream whose
    // decompression is a readable tar archive.
    let decompressed = gunzip_file(&gz_path);
    let plain_path = dir.path().join("s.tar");
    std::fs::write(&plain_path, &decompressed).unwrap();

    let fs = mount(&plain_path);
    assert_eq!(read_all(&fs, &lookup(&fs, "keep")), b"keep me");
    let new = lookup(&fs, "new.txt");
    assert_eq!(new.stat().size, body.len() as u64);
    assert_eq!(read_all(&fs, &new), body);
    fs.go_away().unwrap();

    // And the compressed mount agrees with itself.
    let fs = mount_compressed(&gz_path, Compression::Gzip);
    assert_eq!(read_all(&fs, &lookup(&fs, "new.txt")), body);
    fs.go_away().unwrap();
}

#[test]
fn gzip_grow_spanning_many_blocks() {
    let dir = TempDir::new().unwrap();
    // Large enough that the uncompressed image spans several 8 KiB cache
    // blocks and the write-back exercises the cache-ahead hook.
    let tar = ArchiveBuilder::new()
        .file("big", &pattern(40_000, 3))
        .file("tail", b"after")
        .build();
    let gz_path = dir.path().join("big.tar.gz");
    std::fs::write(&gz_path, gzip_bytes(&tar)).unwrap();

    let fs = mount_compressed(&gz_path, Compression::Gzip);
    let big = lookup(&fs, "big");
    fs.write_node(&big, 40_000, &pattern(2_000, 4)).unwrap();
    fs.sync_fs(false).unwrap();
    fs.go_away().unwrap();

    let fs = mount_compressed(&gz_path, Compression::Gzip);
    let big = lookup(&fs, "big");
    assert_eq!(big.stat().size, 42_000);
    let data = read_all(&fs, &big);
    assert_eq!(&data[..40_000], &pattern(40_000, 3)[..]);
    assert_eq!(&data[40_000..], &pattern(2_000, 4)[..]);
    assert_eq!(read_all(&fs, &lookup(&fs, "tail")), b"after");
    fs.go_away().unwrap();
}

#[test]
fn bzip2_mount_and_sync() {
    let dir = TempDir::new().unwrap();
    let tar = ArchiveBuilder::new().file("f", &pattern(9000, 8)).build();
    let bz_path = dir.path().join("a.tar.bz2");
    {
        let file = std::fs::File::create(&bz_path).unwrap();
        let mut enc = bzip2::write::BzEncoder::new(file, bzip2::Compression::new(4));
        enc.write_all(&tar).unwrap();
        enc.finish().unwrap();
    }

    let fs = mount_compressed(&bz_path, Compression::Bzip2);
    let f = lookup(&fs, "f");
    assert_eq!(read_all(&fs, &f), pattern(9000, 8));
    fs.write_node(&f, 0, b"patched").unwrap();
    fs.go_away().unwrap();

    let fs = mount_compressed(&bz_path, Compression::Bzip2);
    let data = read_all(&fs, &lookup(&fs, "f"));
    assert_eq!(&data[..7], b"patched");
    assert_eq!(&data[7..], &pattern(9000, 8)[7..]);
    fs.go_away().unwrap();
}

#[test]
fn created_gzip_archive_from_scratch() {
    let dir = TempDir::new().unwrap();
    let gz_path = dir.path().join("fresh.tar.gz");

    let fs = mount_with(&gz_path, |o| {
        o.create = true;
        o.compress = Compression::Gzip;
    });
    let f = fs
        .create_node(fs.root(), Some("only"), tarfs::tree::S_IFREG | 0o644)
        .unwrap();
    fs.write_node(&f, 0, b"born compressed").unwrap();
    fs.go_away().unwrap();

    let decompressed = gunzip_file(&gz_path);
    // One header, one payload record, one trailing zero record.
    assert_eq!(decompressed.len(), 3 * RECORD);

    let fs = mount_compressed(&gz_path, Compression::Gzip);
    assert_eq!(read_all(&fs, &lookup(&fs, "only")), b"born compressed");
    fs.go_away().unwrap();
}
