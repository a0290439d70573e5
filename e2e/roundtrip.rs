//! E2E: mount/sync round-trips against plain archives.
//!
//! Archives are produced byte-by-byte by the shared builder, mounted,
//! mutated through the backend operations, synced, and re-mounted; the
//! resulting trees and archive sizes are checked against what a tar
//! reader must see.

mod util;

use tarfs::{Backend, Error};
use tempfile::TempDir;
use util::*;

#[test]
fn extract_round_trip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.tar");
    ArchiveBuilder::new()
        .dir("a")
        .file("a/b.txt", b"hello, tarfs!\n")
        .write_to(&path);

    let fs = mount(&path);
    fs.sync_fs(false).unwrap();
    fs.go_away().unwrap();

    let fs = mount(&path);
    let node = lookup(&fs, "a/b.txt");
    assert_eq!(node.stat().size, 14);
    assert_eq!(read_all(&fs, &node), b"hello, tarfs!\n");
    fs.go_away().unwrap();
}

#[test]
fn untouched_sync_preserves_every_entry() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("a.tar");
    ArchiveBuilder::new()
        .dir("top")
        .file("top/one", &pattern(700, 1))
        .dir("top/sub")
        .file("top/sub/two", &pattern(4000, 2))
        .symlink("top/ln", "sub/two")
        .file("three", b"3")
        .write_to(&path);

    let fs = mount(&path);
    fs.go_away().unwrap();

    let fs = mount(&path);
    assert_eq!(entry_names(fs.root()), ["top", "three"]);
    assert_eq!(entry_names(&lookup(&fs, "top")), ["one", "sub", "ln"]);
    assert_eq!(read_all(&fs, &lookup(&fs, "top/one")), pattern(700, 1));
    assert_eq!(read_all(&fs, &lookup(&fs, "top/sub/two")), pattern(4000, 2));

    let ln = lookup(&fs, "top/ln");
    let st = ln.state.lock().unwrap();
    assert_eq!(st.symlink.as_deref(), Some("sub/two"));
    drop(st);
    fs.go_away().unwrap();
}

#[test]
fn in_place_grow() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("grow.tar");
    ArchiveBuilder::new().file("f", &[0x41u8; 500]).write_to(&path);

    let fs = mount(&path);
    let f = lookup(&fs, "f");
    assert_eq!(fs.write_node(&f, 500, &[0x42u8; 100]).unwrap(), 100);
    fs.sync_fs(false).unwrap();
    fs.go_away().unwrap();

    // 600 bytes round to two payload records.
    assert_eq!(
        std::fs::metadata(&path).unwrap().len(),
        (RECORD + 2 * RECORD + RECORD) as u64
    );

    let fs = mount(&path);
    let f = lookup(&fs, "f");
    assert_eq!(f.stat().size, 600);
    let data = read_all(&fs, &f);
    assert!(data[..500].iter().all(|&b| b == 0x41));
    assert!(data[500..].iter().all(|&b| b == 0x42));
    fs.go_away().unwrap();
}

#[test]
fn unlink_then_sync_compacts_the_archive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("u.tar");
    ArchiveBuilder::new()
        .file("x", b"xxxxx")
        .file("y", b"yyyyy")
        .file("z", b"zzzzz")
        .write_to(&path);

    let fs = mount(&path);
    let y = lookup(&fs, "y");
    fs.unlink_node(&y).unwrap();
    drop(y);
    fs.sync_fs(false).unwrap();
    fs.go_away().unwrap();

    // Two entries of one record each, plus the trailing zero record.
    assert_eq!(
        std::fs::metadata(&path).unwrap().len(),
        (2 * (RECORD + RECORD) + RECORD) as u64
    );

    let fs = mount(&path);
    assert_eq!(entry_names(fs.root()), ["x", "z"]);
    assert_eq!(read_all(&fs, &lookup(&fs, "x")), b"xxxxx");
    assert_eq!(read_all(&fs, &lookup(&fs, "z")), b"zzzzz");
    fs.go_away().unwrap();
}

#[test]
fn write_read_law() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("w.tar");
    ArchiveBuilder::new().file("f", &pattern(3000, 7)).write_to(&path);

    let fs = mount(&path);
    let f = lookup(&fs, "f");

    for &(offset, len, seed) in &[(0u64, 100usize, 9u8), (1500, 2000, 11), (2999, 1, 13)] {
        let data = pattern(len, seed);
        assert_eq!(fs.write_node(&f, offset, &data).unwrap(), len);
        let mut back = vec![0u8; len];
        assert_eq!(fs.read_node(&f, offset, &mut back).unwrap(), len);
        assert_eq!(back, data, "write-read mismatch at {}+{}", offset, len);
    }

    // Reads at and past the end are empty.
    let mut buf = [0u8; 16];
    let size = f.stat().size;
    assert_eq!(fs.read_node(&f, size, &mut buf).unwrap(), 0);
    assert_eq!(fs.read_node(&f, size + 100, &mut buf).unwrap(), 0);
    fs.go_away().unwrap();
}

#[test]
fn hardlink_alias_shares_contents_and_stat() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("h.tar");
    ArchiveBuilder::new().write_to(&path);

    let fs = mount(&path);
    let a = fs
        .create_node(fs.root(), Some("a"), tarfs::tree::S_IFREG | 0o644)
        .unwrap();
    fs.write_node(&a, 0, b"0123456789").unwrap();
    fs.link_node(fs.root(), &a, "b", true).unwrap();

    let b = lookup(&fs, "b");
    assert_eq!(b.stat().size, 10);
    assert_eq!(b.stat().ino, a.stat().ino);
    assert_eq!(a.stat().nlink, 2);

    // Writes through the alias appear in the target.
    fs.write_node(&b, 10, b"ABC").unwrap();
    assert_eq!(read_all(&fs, &a), b"0123456789ABC");
    assert_eq!(b.stat().size, 13);

    // Exclusive re-link of a taken name is refused.
    assert!(matches!(
        fs.link_node(fs.root(), &a, "b", true),
        Err(Error::Exists)
    ));
    fs.go_away().unwrap();
}

#[test]
fn archive_hardlinks_resolve_on_mount() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("h2.tar");
    ArchiveBuilder::new()
        .file("orig", b"shared bytes")
        .hardlink("alias", "orig")
        .write_to(&path);

    let fs = mount(&path);
    let alias = lookup(&fs, "alias");
    assert_eq!(read_all(&fs, &alias), b"shared bytes");
    assert_eq!(lookup(&fs, "orig").stat().nlink, 2);

    // The target cannot be unlinked while the alias lives.
    assert!(matches!(
        fs.unlink_node(&lookup(&fs, "orig")),
        Err(Error::Busy)
    ));
    fs.go_away().unwrap();
}

#[test]
fn created_files_survive_sync_after_existing_subtrees() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("c.tar");
    ArchiveBuilder::new()
        .dir("d")
        .file("d/old", &pattern(1000, 3))
        .write_to(&path);

    let fs = mount(&path);
    let d = lookup(&fs, "d");
    let fresh = fs
        .create_node(&d, Some("fresh"), tarfs::tree::S_IFREG | 0o600)
        .unwrap();
    let body = pattern(2500, 4);
    fs.write_node(&fresh, 0, &body).unwrap();
    fs.sync_fs(false).unwrap();
    fs.go_away().unwrap();

    let fs = mount(&path);
    assert_eq!(entry_names(&lookup(&fs, "d")), ["old", "fresh"]);
    assert_eq!(read_all(&fs, &lookup(&fs, "d/old")), pattern(1000, 3));
    let fresh = lookup(&fs, "d/fresh");
    assert_eq!(fresh.stat().mode & 0o777, 0o600);
    assert_eq!(read_all(&fs, &fresh), body);
    fs.go_away().unwrap();
}

#[test]
fn stat_changes_persist() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("s.tar");
    ArchiveBuilder::new().file("f", b"contents").write_to(&path);

    let fs = mount(&path);
    let f = lookup(&fs, "f");
    let mut st = f.stat();
    st.mode = tarfs::tree::S_IFREG | 0o711;
    st.mtime = 1_234_567_890;
    fs.change_stat(&f, &st).unwrap();
    fs.go_away().unwrap();

    let fs = mount(&path);
    let st = lookup(&fs, "f").stat();
    assert_eq!(st.mode & 0o777, 0o711);
    assert_eq!(st.mtime, 1_234_567_890);
    assert_eq!(read_all(&fs, &lookup(&fs, "f")), b"contents");
    fs.go_away().unwrap();
}

#[test]
fn truncate_shrinks_the_node() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("t.tar");
    ArchiveBuilder::new().file("f", &pattern(2000, 5)).write_to(&path);

    let fs = mount(&path);
    let f = lookup(&fs, "f");
    let mut st = f.stat();
    st.size = 700;
    fs.change_stat(&f, &st).unwrap();
    fs.go_away().unwrap();

    let fs = mount(&path);
    let f = lookup(&fs, "f");
    assert_eq!(f.stat().size, 700);
    assert_eq!(read_all(&fs, &f), &pattern(2000, 5)[..700]);
    fs.go_away().unwrap();
}
