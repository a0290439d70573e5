//! E2E: mount modes (readonly, volatile, create), runtime option
//! switching, and the error surface of the mutating operations.

mod util;

use tarfs::tree::{S_IFDIR, S_IFREG};
use tarfs::{Backend, Error};
use tempfile::TempDir;
use util::*;

#[test]
fn readonly_mount_rejects_mutation_without_side_effects() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ro.tar");
    ArchiveBuilder::new().file("f", b"frozen").write_to(&path);
    let before = std::fs::read(&path).unwrap();

    let fs = mount_with(&path, |o| o.readonly = true);
    let f = lookup(&fs, "f");

    assert!(matches!(
        fs.write_node(&f, 0, b"melt"),
        Err(Error::ReadOnlyFs)
    ));
    assert!(matches!(fs.unlink_node(&f), Err(Error::ReadOnlyFs)));
    assert!(matches!(
        fs.create_node(fs.root(), Some("new"), S_IFREG),
        Err(Error::ReadOnlyFs)
    ));
    let st = f.stat();
    assert!(matches!(fs.change_stat(&f, &st), Err(Error::ReadOnlyFs)));

    // Reads still work, and teardown leaves the file byte-identical.
    assert_eq!(read_all(&fs, &f), b"frozen");
    fs.go_away().unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[test]
fn volatile_mount_accepts_writes_but_never_syncs() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("v.tar");
    ArchiveBuilder::new().file("f", b"stable").write_to(&path);
    let before = std::fs::read(&path).unwrap();

    let fs = mount_with(&path, |o| o.volatile = true);
    let f = lookup(&fs, "f");
    fs.write_node(&f, 0, b"SSSSSS").unwrap();
    assert_eq!(read_all(&fs, &f), b"SSSSSS");

    // Explicit sync is a no-op on a volatile mount.
    fs.sync_fs(false).unwrap();
    fs.go_away().unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[test]
fn create_mode_builds_a_new_archive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("new.tar");
    assert!(!path.exists());

    let fs = mount_with(&path, |o| o.create = true);
    assert!(entry_names(fs.root()).is_empty());

    let d = fs.create_node(fs.root(), Some("d"), S_IFDIR | 0o755).unwrap();
    let f = fs.create_node(&d, Some("f"), S_IFREG | 0o644).unwrap();
    fs.write_node(&f, 0, b"first bytes").unwrap();
    fs.go_away().unwrap();

    // dir header + file header + one payload record + trailing zero.
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * RECORD as u64);

    let fs = mount(&path);
    assert_eq!(read_all(&fs, &lookup(&fs, "d/f")), b"first bytes");
    fs.go_away().unwrap();
}

#[test]
fn runtime_option_switch_reopens_the_store() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sw.tar");
    ArchiveBuilder::new().file("f", b"hello").write_to(&path);

    let fs = mount_with(&path, |o| o.readonly = true);
    assert_eq!(
        fs.get_args(),
        vec!["--readonly".to_owned(), path.display().to_string()]
    );

    let f = lookup(&fs, "f");
    assert!(matches!(
        fs.write_node(&f, 0, b"x"),
        Err(Error::ReadOnlyFs)
    ));

    fs.set_options("-w").unwrap();
    assert_eq!(
        fs.get_args(),
        vec!["--writable".to_owned(), path.display().to_string()]
    );
    assert_eq!(fs.write_node(&f, 0, b"H").unwrap(), 1);

    fs.set_options("--readonly").unwrap();
    assert!(matches!(
        fs.write_node(&f, 0, b"x"),
        Err(Error::ReadOnlyFs)
    ));

    assert!(matches!(
        fs.set_options("--frobnicate"),
        Err(Error::InvalidArgument)
    ));
    fs.go_away().unwrap();
}

#[test]
fn create_rejects_names_deeper_than_the_name_field() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("long.tar");
    ArchiveBuilder::new().write_to(&path);

    let fs = mount(&path);
    let long = "x".repeat(100);
    assert!(matches!(
        fs.create_node(fs.root(), Some(&long), S_IFREG),
        Err(Error::NameTooLong)
    ));

    // 99 characters still fit (name + NUL-free field + room for a slash
    // is the writer's concern for directories only).
    let ok = "y".repeat(99);
    fs.create_node(fs.root(), Some(&ok), S_IFREG).unwrap();
    fs.go_away().unwrap();
}

#[test]
fn unlink_error_surface() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("err.tar");
    ArchiveBuilder::new()
        .dir("d")
        .file("d/f", b"x")
        .write_to(&path);

    let fs = mount(&path);
    assert!(matches!(
        fs.unlink_node(&lookup(&fs, "d")),
        Err(Error::NotEmpty)
    ));
    assert!(matches!(
        fs.lookup(fs.root(), "missing"),
        Err(Error::NoEntry)
    ));
    assert!(matches!(
        fs.read_node(&lookup(&fs, "d"), 0, &mut [0u8; 8]),
        Err(Error::IsDirectory)
    ));

    fs.unlink_node(&lookup(&fs, "d/f")).unwrap();
    fs.unlink_node(&lookup(&fs, "d")).unwrap();
    assert!(try_lookup(&fs, "d").is_none());
    fs.go_away().unwrap();
}

#[test]
fn anonymous_nodes_join_the_archive_when_named() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("anon.tar");
    ArchiveBuilder::new().file("existing", b"here").write_to(&path);

    let fs = mount(&path);
    let anon = fs.create_node(fs.root(), None, S_IFREG | 0o644).unwrap();
    fs.write_node(&anon, 0, b"anonymous no more").unwrap();

    // Nameless nodes are invisible to lookup and carry no archive item.
    assert!(try_lookup(&fs, "anon").is_none());
    assert!(anon.item().is_none());

    fs.link_node(fs.root(), &anon, "adopted", true).unwrap();
    assert!(anon.item().is_some());
    fs.go_away().unwrap();

    let fs = mount(&path);
    assert_eq!(entry_names(fs.root()), ["existing", "adopted"]);
    assert_eq!(
        read_all(&fs, &lookup(&fs, "adopted")),
        b"anonymous no more"
    );
    fs.go_away().unwrap();
}

#[test]
fn mkdev_is_unsupported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dev.tar");
    ArchiveBuilder::new().file("f", b"x").write_to(&path);

    let fs = mount(&path);
    let f = lookup(&fs, "f");
    assert!(matches!(
        fs.mkdev_node(&f, tarfs::tree::S_IFCHR, (5 << 8) | 1),
        Err(Error::NotSupported)
    ));
    fs.go_away().unwrap();
}
