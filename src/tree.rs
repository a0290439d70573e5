//! In-memory filesystem node graph.
//!
//! A [`Node`] is one filesystem object: name, stat, parent/children links,
//! optional symlink target, optional hardlink target. Ownership follows the
//! reference protocol of the host model: a directory owns its children
//! (strong `Arc`s in insertion order), a child points back with a `Weak`,
//! and a hardlink alias holds a strong reference on its target. Dropping
//! the last `Arc` releases the node's name, symlink string and cache.
//!
//! The [`Tree`] value carries the identity state (inode counter, mount
//! uid/gid, filesystem id) that a process would otherwise keep in globals.
//!
//! Functions that touch several nodes lock their states one at a time,
//! never nested, so no ordering between sibling node locks can deadlock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::list::TarItem;

// ─── Mode bits ───────────────────────────────────────────────────────────────

pub const S_IFMT: u32 = libc::S_IFMT as u32;
pub const S_IFREG: u32 = libc::S_IFREG as u32;
pub const S_IFDIR: u32 = libc::S_IFDIR as u32;
pub const S_IFLNK: u32 = libc::S_IFLNK as u32;
pub const S_IFCHR: u32 = libc::S_IFCHR as u32;
pub const S_IFBLK: u32 = libc::S_IFBLK as u32;
pub const S_IFIFO: u32 = libc::S_IFIFO as u32;

#[inline]
pub fn is_dir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

#[inline]
pub fn is_reg(mode: u32) -> bool {
    mode & S_IFMT == S_IFREG
}

#[inline]
pub fn is_lnk(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

/// Substitute for `/` in node names.
pub const SUBST_SLASH: char = '|';
/// Substitute for control bytes in node names.
pub const SUBST_LOWER: char = '.';

// ─── Stat ────────────────────────────────────────────────────────────────────

/// POSIX-like per-node attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
    pub ino: u64,
    pub nlink: u32,
    pub rdev: u64,
    pub fsid: u32,
}

// ─── Node ────────────────────────────────────────────────────────────────────

/// One filesystem object.
#[derive(Debug)]
pub struct Node {
    pub ino: u64,
    pub state: Mutex<NodeState>,
    pub cache: Cache,
}

/// The mutable half of a node, guarded by the per-node lock.
#[derive(Debug, Default)]
pub struct NodeState {
    /// Filtered name; `None` for the root and for anonymous nodes.
    pub name: Option<String>,
    pub stat: Stat,
    pub parent: Weak<Node>,
    /// Directory entries in insertion order.
    pub children: Vec<Arc<Node>>,
    /// Symlink target path.
    pub symlink: Option<String>,
    /// Hardlink target; never another alias.
    pub hardlink: Option<Arc<Node>>,
    /// Archive item backing this node, if any.
    pub item: Option<Arc<TarItem>>,
    /// Set when the stat diverged from the on-disk header.
    pub stat_changed: bool,
}

impl Node {
    /// Snapshot of the stat under the node lock.
    pub fn stat(&self) -> Stat {
        self.state.lock().unwrap().stat.clone()
    }

    pub fn name(&self) -> Option<String> {
        self.state.lock().unwrap().name.clone()
    }

    pub fn parent(&self) -> Option<Arc<Node>> {
        self.state.lock().unwrap().parent.upgrade()
    }

    pub fn is_dir(&self) -> bool {
        is_dir(self.state.lock().unwrap().stat.mode)
    }

    /// Hardlink target if this node is an alias.
    pub fn link_target(&self) -> Option<Arc<Node>> {
        self.state.lock().unwrap().hardlink.clone()
    }

    pub fn item(&self) -> Option<Arc<TarItem>> {
        self.state.lock().unwrap().item.clone()
    }
}

// ─── Name filtering ──────────────────────────────────────────────────────────

/// Rewrites `/` and control bytes in a prospective node name. Idempotent;
/// returns the input untouched (no allocation churn) when nothing needed
/// substituting.
pub fn filter_name(name: &str) -> String {
    if !name.chars().any(|c| c == '/' || (c as u32) < 32) {
        return name.to_owned();
    }
    name.chars()
        .map(|c| {
            if c == '/' {
                SUBST_SLASH
            } else if (c as u32) < 32 {
                SUBST_LOWER
            } else {
                c
            }
        })
        .collect()
}

// ─── Tree ────────────────────────────────────────────────────────────────────

/// Identity state shared by every node of one mount.
#[derive(Debug)]
pub struct Tree {
    next_ino: AtomicU64,
    pub uid: u32,
    pub gid: u32,
    pub fsid: u32,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Tree {
    pub fn new() -> Self {
        Tree {
            next_ino: AtomicU64::new(1),
            uid: nix::unistd::Uid::current().as_raw(),
            gid: nix::unistd::Gid::current().as_raw(),
            fsid: std::process::id(),
        }
    }

    /// Creates a node under `dir` (or the root when `dir` is `None`).
    /// `name` is filtered; `None` creates an anonymous node. Fails with
    /// [`Error::Exists`] when `dir` already has an entry of that name.
    pub fn make_node(
        &self,
        dir: Option<&Arc<Node>>,
        name: Option<&str>,
        mode: u32,
    ) -> Result<Arc<Node>> {
        if let (Some(dir), Some(name)) = (dir, name) {
            if find(dir, name).is_some() {
                return Err(Error::Exists);
            }
        }

        // Default the file-type bits to a regular file.
        let mode = if mode & S_IFMT != 0 { mode } else { mode | S_IFREG };
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        let time = now();

        let stat = Stat {
            mode,
            uid: self.uid,
            gid: self.gid,
            size: 0,
            mtime: time,
            atime: time,
            ctime: time,
            ino,
            nlink: if is_dir(mode) { 2 } else { 1 },
            rdev: 0,
            fsid: self.fsid,
        };

        let node = Arc::new(Node {
            ino,
            state: Mutex::new(NodeState {
                name: name.map(filter_name),
                stat,
                ..NodeState::default()
            }),
            cache: Cache::new(),
        });

        if let Some(dir) = dir {
            node.state.lock().unwrap().parent = Arc::downgrade(dir);
            let mut d = dir.state.lock().unwrap();
            d.children.push(node.clone());
            // A node with entries is a directory whatever its header said.
            d.stat.mode |= S_IFDIR;
            if is_dir(mode) {
                d.stat.nlink += 1;
            }
        }

        Ok(node)
    }

    /// Creates an alias of `target` named `name` under `dir`. The alias
    /// mirrors the target's stat except for `mode`, and holds a strong
    /// reference on the target; the target gains a link count.
    pub fn hard_link(
        &self,
        dir: &Arc<Node>,
        name: &str,
        mode: u32,
        target: &Arc<Node>,
    ) -> Result<Arc<Node>> {
        if find(dir, name).is_some() {
            return Err(Error::Exists);
        }

        let mut stat = {
            let mut t = target.state.lock().unwrap();
            t.stat.nlink += 1;
            t.stat.clone()
        };
        stat.mode = mode;
        let time = now();
        stat.atime = time;
        stat.ctime = time;

        let node = Arc::new(Node {
            ino: stat.ino,
            state: Mutex::new(NodeState {
                name: Some(filter_name(name)),
                stat,
                parent: Arc::downgrade(dir),
                hardlink: Some(target.clone()),
                ..NodeState::default()
            }),
            cache: Cache::new(),
        });

        let mut d = dir.state.lock().unwrap();
        d.children.push(node.clone());
        d.stat.mode |= S_IFDIR;
        Ok(node)
    }
}

impl Default for Tree {
    fn default() -> Self {
        Tree::new()
    }
}

// ─── Lookup ──────────────────────────────────────────────────────────────────

/// Linear name lookup in `dir`'s entries; `.` and `..` resolve to the
/// directory itself and its parent (the root is its own parent).
pub fn find(dir: &Arc<Node>, name: &str) -> Option<Arc<Node>> {
    match name {
        "." => return Some(dir.clone()),
        ".." => return Some(dir.parent().unwrap_or_else(|| dir.clone())),
        _ => {}
    }
    let d = dir.state.lock().unwrap();
    d.children
        .iter()
        .find(|c| {
            c.state
                .lock()
                .unwrap()
                .name
                .as_deref()
                .is_some_and(|n| n == name)
        })
        .cloned()
}

/// Result of walking a `/`-separated path.
#[derive(Debug)]
pub struct PathLookup {
    /// Deepest node that exists.
    pub node: Arc<Node>,
    /// First component that did not resolve (`None` when the path fully
    /// resolved).
    pub notfound: Option<String>,
    /// Path remainder after the missing component (`None` when the missing
    /// component was the last one, or nothing was missing).
    pub retry: Option<String>,
}

/// Walks `path` from `start`, stopping at the first missing component.
pub fn find_path(start: &Arc<Node>, path: &str) -> PathLookup {
    let mut node = start.clone();
    let mut comps = path.split('/').filter(|c| !c.is_empty());

    while let Some(comp) = comps.next() {
        match find(&node, comp) {
            Some(next) => node = next,
            None => {
                let rest: Vec<&str> = comps.collect();
                return PathLookup {
                    node,
                    notfound: Some(comp.to_owned()),
                    retry: if rest.is_empty() {
                        None
                    } else {
                        Some(rest.join("/"))
                    },
                };
            }
        }
    }
    PathLookup {
        node,
        notfound: None,
        retry: None,
    }
}

// ─── Symlinks ────────────────────────────────────────────────────────────────

/// Turns `node` into a symbolic link to the literal `target` path.
pub fn link_node_path(node: &Arc<Node>, target: &str) {
    let mut s = node.state.lock().unwrap();
    s.stat.mode |= S_IFLNK;
    s.stat.size = target.len() as u64;
    s.symlink = Some(target.to_owned());
}

/// Turns `node` into a symlink to `target`, expressed relative to their
/// first common ancestor (`../..`-style prefix plus the descent path).
pub fn link_node(root: &Arc<Node>, node: &Arc<Node>, target: &Arc<Node>) {
    let base = common_root(root, node, target);
    let up = path_to_root(&base, node);
    let down = path_from_root(&base, target);
    let rel = if up.is_empty() {
        down
    } else if down.is_empty() {
        up
    } else {
        format!("{}/{}", up, down)
    };
    link_node_path(node, &rel);
}

// ─── Unlink ──────────────────────────────────────────────────────────────────

/// Detaches `node` from its parent. Fails with [`Error::NotEmpty`] for a
/// directory that still has entries and [`Error::Busy`] for a node other
/// aliases still point at. Adjusts the parent's and the hardlink target's
/// link counts; the node itself is freed when its last handle drops.
pub fn unlink_node(node: &Arc<Node>) -> Result<()> {
    let (parent, target, node_is_dir) = {
        let s = node.state.lock().unwrap();
        if !s.children.is_empty() {
            return Err(Error::NotEmpty);
        }
        // An alias mirrors its target's link count; only the target's own
        // extant aliases make an unlink busy.
        let limit = if is_dir(s.stat.mode) { 2 } else { 1 };
        if s.hardlink.is_none() && s.stat.nlink > limit {
            return Err(Error::Busy);
        }
        (s.parent.upgrade(), s.hardlink.clone(), is_dir(s.stat.mode))
    };

    if let Some(parent) = &parent {
        let mut p = parent.state.lock().unwrap();
        if let Some(pos) = p.children.iter().position(|c| Arc::ptr_eq(c, node)) {
            p.children.remove(pos);
        }
        if node_is_dir {
            p.stat.nlink -= 1;
        }
    }

    if let Some(target) = target {
        target.state.lock().unwrap().stat.nlink -= 1;
    }

    Ok(())
}

// ─── Path reconstruction ─────────────────────────────────────────────────────

/// Returns `node`'s path relative to `root` (no leading slash; empty for
/// the root itself).
pub fn path_from_root(root: &Arc<Node>, node: &Arc<Node>) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut cur = node.clone();
    while !Arc::ptr_eq(&cur, root) {
        let (name, parent) = {
            let s = cur.state.lock().unwrap();
            (s.name.clone(), s.parent.upgrade())
        };
        if let Some(name) = name {
            parts.push(name);
        }
        match parent {
            Some(p) => cur = p,
            None => break,
        }
    }
    parts.reverse();
    parts.join("/")
}

/// Returns the `..`-chain leading from `node` up to `root` (empty when
/// `node` is the root). Non-directories count from their parent.
pub fn path_to_root(root: &Arc<Node>, node: &Arc<Node>) -> String {
    let mut cur = if node.is_dir() {
        node.clone()
    } else {
        match node.parent() {
            Some(p) => p,
            None => return String::new(),
        }
    };

    let mut hops = 0usize;
    while !Arc::ptr_eq(&cur, root) {
        match cur.parent() {
            Some(p) => {
                hops += 1;
                cur = p;
            }
            None => break,
        }
    }
    vec![".."; hops].join("/")
}

/// Deepest directory that is an ancestor of both nodes.
pub fn common_root(root: &Arc<Node>, a: &Arc<Node>, b: &Arc<Node>) -> Arc<Node> {
    if Arc::ptr_eq(a, b) {
        return a.clone();
    }

    let ancestors = |n: &Arc<Node>| {
        let mut stack = vec![];
        let mut cur = n.clone();
        while !Arc::ptr_eq(&cur, root) {
            match cur.parent() {
                Some(p) => {
                    stack.push(p.clone());
                    cur = p;
                }
                None => break,
            }
        }
        stack.reverse(); // root-first
        stack
    };

    let pa = ancestors(a);
    let pb = ancestors(b);
    let mut common = root.clone();
    for (x, y) in pa.iter().zip(pb.iter()) {
        if Arc::ptr_eq(x, y) {
            common = x.clone();
        } else {
            break;
        }
    }
    common
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn mkroot(tree: &Tree) -> Arc<Node> {
        tree.make_node(None, None, S_IFDIR | 0o755).unwrap()
    }

    #[test]
    fn filter_substitutes_slash_and_control_bytes() {
        assert_eq!(filter_name("a/b"), "a|b");
        assert_eq!(filter_name("ok-name"), "ok-name");
        assert_eq!(filter_name("bad\x01name"), "bad.name");
    }

    #[test]
    fn make_node_keeps_insertion_order_and_nlink() {
        let tree = Tree::new();
        let root = mkroot(&tree);
        tree.make_node(Some(&root), Some("b"), S_IFREG | 0o644).unwrap();
        tree.make_node(Some(&root), Some("a"), S_IFDIR | 0o755).unwrap();
        tree.make_node(Some(&root), Some("c"), S_IFREG | 0o644).unwrap();

        let names: Vec<String> = root
            .state
            .lock()
            .unwrap()
            .children
            .iter()
            .map(|c| c.name().unwrap())
            .collect();
        assert_eq!(names, ["b", "a", "c"]);
        // 2 + one subdirectory.
        assert_eq!(root.stat().nlink, 3);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let tree = Tree::new();
        let root = mkroot(&tree);
        tree.make_node(Some(&root), Some("x"), S_IFREG).unwrap();
        assert!(matches!(
            tree.make_node(Some(&root), Some("x"), S_IFREG),
            Err(Error::Exists)
        ));
    }

    #[test]
    fn find_resolves_dot_and_dotdot() {
        let tree = Tree::new();
        let root = mkroot(&tree);
        let dir = tree.make_node(Some(&root), Some("d"), S_IFDIR | 0o755).unwrap();

        assert!(Arc::ptr_eq(&find(&dir, ".").unwrap(), &dir));
        assert!(Arc::ptr_eq(&find(&dir, "..").unwrap(), &root));
        // The root is its own parent.
        assert!(Arc::ptr_eq(&find(&root, "..").unwrap(), &root));
    }

    #[test]
    fn find_path_reports_missing_component_and_remainder() {
        let tree = Tree::new();
        let root = mkroot(&tree);
        let foo = tree.make_node(Some(&root), Some("foo"), S_IFDIR | 0o755).unwrap();
        tree.make_node(Some(&foo), Some("bar"), S_IFREG).unwrap();

        let hit = find_path(&root, "foo/bar");
        assert!(hit.notfound.is_none() && hit.retry.is_none());
        assert_eq!(hit.node.name().as_deref(), Some("bar"));

        let partial = find_path(&root, "foo/baz");
        assert!(Arc::ptr_eq(&partial.node, &foo));
        assert_eq!(partial.notfound.as_deref(), Some("baz"));
        assert!(partial.retry.is_none());

        let miss = find_path(&root, "nope/deep/file");
        assert!(Arc::ptr_eq(&miss.node, &root));
        assert_eq!(miss.notfound.as_deref(), Some("nope"));
        assert_eq!(miss.retry.as_deref(), Some("deep/file"));
    }

    #[test]
    fn unlink_enforces_not_empty_and_busy() {
        let tree = Tree::new();
        let root = mkroot(&tree);
        let dir = tree.make_node(Some(&root), Some("d"), S_IFDIR | 0o755).unwrap();
        let file = tree.make_node(Some(&dir), Some("f"), S_IFREG).unwrap();

        assert!(matches!(unlink_node(&dir), Err(Error::NotEmpty)));

        let alias = tree.hard_link(&root, "link", S_IFREG | 0o644, &file).unwrap();
        assert!(matches!(unlink_node(&file), Err(Error::Busy)));

        unlink_node(&alias).unwrap();
        assert_eq!(file.stat().nlink, 1);
        unlink_node(&file).unwrap();
        unlink_node(&dir).unwrap();
        assert_eq!(root.stat().nlink, 2);
    }

    #[test]
    fn hard_link_mirrors_stat_except_mode() {
        let tree = Tree::new();
        let root = mkroot(&tree);
        let file = tree.make_node(Some(&root), Some("f"), S_IFREG | 0o600).unwrap();
        {
            let mut s = file.state.lock().unwrap();
            s.stat.size = 42;
        }
        let alias = tree.hard_link(&root, "l", S_IFREG | 0o644, &file).unwrap();

        let (fs, ls) = (file.stat(), alias.stat());
        assert_eq!(fs.nlink, 2);
        assert_eq!(ls.size, 42);
        assert_eq!(ls.ino, fs.ino);
        assert_eq!(ls.mode, S_IFREG | 0o644);
    }

    #[test]
    fn paths_reconstruct_through_parents() {
        let tree = Tree::new();
        let root = mkroot(&tree);
        let a = tree.make_node(Some(&root), Some("a"), S_IFDIR | 0o755).unwrap();
        let b = tree.make_node(Some(&a), Some("b"), S_IFDIR | 0o755).unwrap();
        let f = tree.make_node(Some(&b), Some("f"), S_IFREG).unwrap();

        assert_eq!(path_from_root(&root, &f), "a/b/f");
        assert_eq!(path_from_root(&root, &root), "");
        assert_eq!(path_to_root(&root, &b), "../..");
        assert_eq!(path_to_root(&root, &f), "../..");

        let g = tree.make_node(Some(&a), Some("g"), S_IFREG).unwrap();
        let common = common_root(&root, &f, &g);
        assert!(Arc::ptr_eq(&common, &a));
    }

    #[test]
    fn relative_symlink_goes_through_common_ancestor() {
        let tree = Tree::new();
        let root = mkroot(&tree);
        let a = tree.make_node(Some(&root), Some("a"), S_IFDIR | 0o755).unwrap();
        let b = tree.make_node(Some(&root), Some("b"), S_IFDIR | 0o755).unwrap();
        let link = tree.make_node(Some(&a), Some("ln"), S_IFREG).unwrap();
        let target = tree.make_node(Some(&b), Some("t"), S_IFREG).unwrap();

        link_node(&root, &link, &target);
        let s = link.state.lock().unwrap();
        assert_eq!(s.symlink.as_deref(), Some("../b/t"));
        assert_eq!(s.stat.size, "../b/t".len() as u64);
        assert!(is_lnk(s.stat.mode));
    }
}
