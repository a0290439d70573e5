//! The tar filesystem engine.
//!
//! [`Filesystem`] binds the pieces together: ingest streams archive
//! records into tree nodes, cache slots and list items; operations route
//! through the per-node caches; [`Filesystem::sync_fs`] walks the item
//! list and rewrites the archive in place, caching ahead whatever the
//! rewrite is about to destroy.
//!
//! Lock order, outermost first: item list, node state, node cache,
//! compressed-store internals, backing store, options. The one deliberate
//! exception is ingest, which holds the backing-store lock across the
//! whole parse — the filesystem is not serving operations yet.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, error, warn};

use crate::backend::Backend;
use crate::cache::Origin;
use crate::error::{Error, Result};
use crate::list::{ItemId, ListInner, TarList};
use crate::store::{Compression, Store};
use crate::tar::{self, make_header, LinkFlag, ParsedEntry, NAME_SIZE, RECORD_SIZE};
use crate::tree::{self, Node, Stat, Tree};

/// Mount options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Archive path.
    pub file_name: PathBuf,
    /// Create the archive when it does not exist (forces writable).
    pub create: bool,
    pub readonly: bool,
    /// Writable in memory but never synced back.
    pub volatile: bool,
    pub compress: Compression,
    /// Run ingest on a separate thread.
    pub threaded: bool,
    /// Periodic sync interval in seconds (driven by the binary).
    pub interval: Option<u64>,
}

impl Options {
    pub fn new(file_name: impl Into<PathBuf>) -> Self {
        Options {
            file_name: file_name.into(),
            create: false,
            readonly: false,
            volatile: false,
            compress: Compression::None,
            threaded: false,
            interval: None,
        }
    }
}

/// One mounted archive.
pub struct Filesystem {
    opts: Mutex<Options>,
    tree: Tree,
    root: Arc<Node>,
    list: TarList,
    /// The backing store; `None` between a committed sync and the next
    /// access (reopened lazily).
    store: Mutex<Option<Store>>,
}

impl Filesystem {
    /// Opens the backing store and builds the (still empty) root. Call
    /// [`Filesystem::init`] to ingest the archive.
    pub fn new(mut opts: Options) -> Result<Self> {
        if opts.file_name.as_os_str().is_empty() {
            return Err(Error::InvalidArgument);
        }
        if opts.create {
            opts.readonly = false;
        }

        let writable = opts.create || !(opts.readonly || opts.volatile);
        let store = Store::open(&opts.file_name, writable, opts.create, opts.compress)?;

        // The root mirrors the backing file's permission bits.
        use std::os::unix::fs::MetadataExt;
        let meta = std::fs::metadata(&opts.file_name)?;
        let mode = (meta.mode() & !tree::S_IFMT) | tree::S_IFDIR;

        let tree = Tree::new();
        let root = tree.make_node(None, None, mode)?;

        Ok(Filesystem {
            opts: Mutex::new(opts),
            tree,
            root,
            list: TarList::new(),
            store: Mutex::new(Some(store)),
        })
    }

    /// Parses the archive and builds the node tree, on this thread or —
    /// with the `threaded` option — on a worker so the caller can finish
    /// its mount handshake meanwhile.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        let threaded = self.opts.lock().unwrap().threaded;
        let size = self.with_store(|s| s.size())?;
        if size == 0 {
            return Ok(());
        }

        if threaded {
            let fs = Arc::clone(self);
            std::thread::spawn(move || {
                if let Err(e) = fs.read_archive() {
                    error!("invalid tar archive: {}", e);
                }
            });
            Ok(())
        } else {
            self.read_archive()
        }
    }

    pub fn root(&self) -> &Arc<Node> {
        &self.root
    }

    /// Snapshot of the mount options.
    pub fn options(&self) -> Options {
        self.opts.lock().unwrap().clone()
    }

    // ── Backing store access ────────────────────────────────────────────────

    fn with_store<R>(&self, f: impl FnOnce(&Store) -> Result<R>) -> Result<R> {
        let mut guard = self.store.lock().unwrap();
        if guard.is_none() {
            let (path, writable, compress) = {
                let o = self.opts.lock().unwrap();
                (
                    o.file_name.clone(),
                    !(o.readonly || o.volatile),
                    o.compress,
                )
            };
            debug!("reopening backing store");
            *guard = Some(Store::open(&path, writable, false, compress)?);
        }
        f(guard.as_ref().expect("store just opened"))
    }

    /// Reads an exact range from the archive.
    fn read_backing(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.with_store(|store| {
            let n = store.read_at(offset, buf)?;
            if n != buf.len() {
                return Err(Error::io("short read from archive"));
            }
            Ok(())
        })
    }

    /// Writes an exact range, growing the store first when needed.
    fn write_backing(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.with_store(|store| {
            let end = offset + data.len() as u64;
            if end > store.size()? {
                store.set_size(end)?;
            }
            let n = store.write_at(offset, data)?;
            if n != data.len() {
                return Err(Error::io("short write to archive"));
            }
            Ok(())
        })
    }

    /// Fetch callback for a node's cache: reads payload-relative ranges
    /// from the node's on-disk location.
    fn fetcher(&self, origin: Option<Origin>) -> impl FnMut(u64, &mut [u8]) -> Result<()> + '_ {
        move |off, buf| {
            let start = origin.map_or(0, |o| o.start);
            self.read_backing(start + off, buf)
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.opts.lock().unwrap().readonly {
            Err(Error::ReadOnlyFs)
        } else {
            Ok(())
        }
    }

    // ── Ingest ──────────────────────────────────────────────────────────────

    fn read_archive(&self) -> Result<()> {
        // Ingest holds the store for the whole parse; nothing else is
        // running against this filesystem yet.
        let mut guard = self.store.lock().unwrap();
        if guard.is_none() {
            let o = self.opts.lock().unwrap();
            let writable = !(o.readonly || o.volatile);
            let (path, compress) = (o.file_name.clone(), o.compress);
            drop(o);
            *guard = Some(Store::open(&path, writable, false, compress)?);
        }
        let store = guard.as_ref().expect("store just opened");

        let mut last: Option<ItemId> = None;
        tar::open_archive(store, |entry| {
            if let Some(id) = self.add_header(&entry, last)? {
                last = Some(id);
            }
            Ok(())
        })
    }

    /// Creates the node and item for one parsed archive entry, appending
    /// the item after the previous one. Returns the new item's id, or
    /// `None` when the entry was ignored.
    fn add_header(&self, entry: &ParsedEntry, last: Option<ItemId>) -> Result<Option<ItemId>> {
        debug!("ingesting {:?}", entry.name);

        // Resolve the parent, synthesising directories the archive lists
        // children of but never declared.
        let mut dir = self.root.clone();
        let mut name = entry.name.clone();
        let name = loop {
            let look = tree::find_path(&dir, &name);
            match (look.notfound, look.retry) {
                (None, _) => {
                    // The entry already exists. "tar cf x ." archives open
                    // with an entry for the root itself; stay quiet then.
                    if !Arc::ptr_eq(&look.node, &self.root) {
                        warn!("node {:?} already exists", entry.name);
                    }
                    return Ok(None);
                }
                (Some(notfound), Some(rest)) => {
                    warn!(
                        "inconsistent archive (directory {:?} not found)",
                        notfound
                    );
                    dir = self.create_with_item(&look.node, &notfound, tree::S_IFDIR | 0o755)?;
                    name = rest;
                }
                (Some(notfound), None) => {
                    dir = look.node;
                    break notfound;
                }
            }
        };

        if entry.linkflag == LinkFlag::Link {
            let look = tree::find_path(&self.root, &entry.linkname);
            if look.notfound.is_some() {
                warn!(
                    "hard link target not found ({} -> {})",
                    name, entry.linkname
                );
                return Ok(None);
            }
            let target = look.node;
            let mode = target.stat().mode;
            let node = self.tree.hard_link(&dir, &name, mode, &target)?;
            // Aliases carry no payload and need no cache.
            let item = self
                .list
                .insert_item(last, &node, 0, entry.payload_offset as i64);
            node.state.lock().unwrap().item = Some(item.clone());
            return Ok(Some(item.id));
        }

        let hs = entry.record.to_stat();
        let node = self.tree.make_node(Some(&dir), Some(&name), hs.mode)?;
        {
            let mut s = node.state.lock().unwrap();
            s.stat.mode = hs.mode;
            s.stat.uid = hs.uid;
            s.stat.gid = hs.gid;
            s.stat.size = hs.size;
            s.stat.mtime = hs.mtime;
            s.stat.atime = hs.atime;
            s.stat.ctime = hs.ctime;
            s.stat.rdev = hs.rdev;
        }
        node.cache.create(hs.size);

        let item = self
            .list
            .insert_item(last, &node, hs.size, entry.payload_offset as i64);
        node.state.lock().unwrap().item = Some(item.clone());

        if entry.linkflag == LinkFlag::Symlink {
            if entry.linkname.is_empty() {
                warn!("empty symlink target for node {:?}", name);
            }
            tree::link_node_path(&node, &entry.linkname);
        }

        Ok(Some(item.id))
    }

    /// Creates a named node with a fresh (never-written) item placed by
    /// the list's placement policy.
    fn create_with_item(&self, dir: &Arc<Node>, name: &str, mode: u32) -> Result<Arc<Node>> {
        let node = self.tree.make_node(Some(dir), Some(name), mode)?;
        node.cache.create(0);
        let prev = self.list.put_item(&self.root, &node);
        let item = self.list.insert_item(prev, &node, 0, -1);
        node.state.lock().unwrap().item = Some(item);
        Ok(node)
    }

    // ── Sync ────────────────────────────────────────────────────────────────

    /// Caches, for every item from `from` onward whose data lives in the
    /// region `[offs, offs + amount)` of the archive, the bytes the
    /// region covers — so overwriting it cannot destroy anything still
    /// unread. `current` carries the node whose state lock the sync pass
    /// already holds, with its size.
    fn cache_ahead(
        &self,
        list: &ListInner,
        from: ItemId,
        current: (&Arc<Node>, u64),
        offs: u64,
        amount: u64,
    ) -> Result<()> {
        debug_assert!(amount > 0);
        let mut cur = Some(from);
        while let Some(id) = cur {
            let item = list.get(id);
            let offset = item.offset();
            if offset >= 0 {
                if let Some(node) = item.node.upgrade() {
                    let node_offs = offset as u64;
                    // Items ahead keep ascending offsets; past the region
                    // nothing can be clobbered.
                    if node_offs >= offs + amount {
                        break;
                    }
                    let node_size = if Arc::ptr_eq(&node, current.0) {
                        current.1
                    } else {
                        node.state.lock().unwrap().stat.size
                    };
                    if offs < node_offs + node_size && offs + amount > node_offs {
                        let how_much = (offs + amount - node_offs).min(node_size);
                        debug!("caching {} bytes ahead", how_much);
                        let origin = item.origin();
                        let mut fetch = self.fetcher(origin);
                        node.cache.cache_ahead(node_size, origin, how_much, &mut fetch)?;
                    }
                }
            }
            cur = list.next(id);
        }
        Ok(())
    }

    /// Runtime option switch (`-r`, `-w`, `-v`). Readonly↔writable
    /// transitions reopen the store; a failed reopen rolls the flag back.
    pub fn set_options(&self, args: &str) -> Result<()> {
        match args {
            "-r" | "--readonly" => self.switch_store(true),
            "-w" | "--writable" => self.switch_store(false),
            "-v" | "--volatile" => {
                let mut o = self.opts.lock().unwrap();
                o.readonly = false;
                o.volatile = true;
                Ok(())
            }
            _ => Err(Error::InvalidArgument),
        }
    }

    fn switch_store(&self, readonly: bool) -> Result<()> {
        let mut guard = self.store.lock().unwrap();
        let mut o = self.opts.lock().unwrap();
        if o.readonly == readonly {
            return Ok(());
        }
        if let Some(store) = guard.take() {
            store.close()?;
        }
        o.readonly = readonly;
        match Store::open(&o.file_name, !readonly, false, o.compress) {
            Ok(store) => {
                *guard = Some(store);
                o.volatile = false;
                Ok(())
            }
            Err(e) => {
                o.readonly = !readonly;
                Err(e)
            }
        }
    }

    /// Reconstructs the effective argument vector.
    pub fn get_args(&self) -> Vec<String> {
        let o = self.opts.lock().unwrap();
        let mut args = Vec::new();
        if o.volatile {
            args.push("--volatile".to_owned());
        } else if o.readonly {
            args.push("--readonly".to_owned());
        } else {
            args.push("--writable".to_owned());
        }
        match o.compress {
            Compression::Gzip => args.push("--gzip".to_owned()),
            Compression::Bzip2 => args.push("--bzip2".to_owned()),
            Compression::None => {}
        }
        args.push(o.file_name.display().to_string());
        args
    }
}

// ─── Backend operations ──────────────────────────────────────────────────────

impl Backend for Filesystem {
    fn lookup(&self, dir: &Arc<Node>, name: &str) -> Result<Arc<Node>> {
        tree::find(dir, name).ok_or(Error::NoEntry)
    }

    fn read_node(&self, node: &Arc<Node>, offset: u64, buf: &mut [u8]) -> Result<usize> {
        // Aliases read through to their target; the alias cache stays
        // untouched.
        let node = node.link_target().unwrap_or_else(|| node.clone());

        let st = node.state.lock().unwrap();
        if tree::is_dir(st.stat.mode) {
            return Err(Error::IsDirectory);
        }
        if st.symlink.is_some() {
            // readlink is answered from the stored target by the host.
            return Err(Error::InvalidArgument);
        }
        let origin = st.item.as_ref().and_then(|i| i.origin());
        let size = st.stat.size;
        let mut fetch = self.fetcher(origin);
        node.cache.read(size, origin, offset, buf, &mut fetch)
    }

    fn write_node(&self, node: &Arc<Node>, offset: u64, data: &[u8]) -> Result<usize> {
        self.check_writable()?;
        if node.is_dir() {
            return Err(Error::IsDirectory);
        }

        let target = node.link_target();
        let what = target.clone().unwrap_or_else(|| node.clone());

        let new_size;
        let written;
        {
            let mut st = what.state.lock().unwrap();
            if st.symlink.is_some() {
                return Err(Error::InvalidArgument);
            }
            let origin = st.item.as_ref().and_then(|i| i.origin());
            let mut fetch = self.fetcher(origin);
            written = what
                .cache
                .write(&mut st.stat.size, origin, offset, data, &mut fetch)?;
            new_size = st.stat.size;
        }

        // Keep the alias's stat in step with its target.
        if target.is_some() {
            node.state.lock().unwrap().stat.size = new_size;
        }
        Ok(written)
    }

    fn change_stat(&self, node: &Arc<Node>, stat: &Stat) -> Result<()> {
        self.check_writable()?;

        let target = node.link_target();
        let what = target.clone().unwrap_or_else(|| node.clone());

        let snapshot = {
            let mut st = what.state.lock().unwrap();
            if stat.size != st.stat.size {
                what.cache.set_size(&mut st.stat.size, stat.size);
            }
            st.stat = stat.clone();
            st.stat_changed = true;
            st.stat.clone()
        };

        if target.is_some() {
            let mut st = node.state.lock().unwrap();
            st.stat = snapshot;
            st.stat_changed = true;
        }
        Ok(())
    }

    fn create_node(&self, dir: &Arc<Node>, name: Option<&str>, mode: u32) -> Result<Arc<Node>> {
        self.check_writable()?;
        match name {
            None => {
                debug!("creating anonymous node");
                // Anonymous nodes stay out of the archive until linked.
                let node = self.tree.make_node(Some(dir), None, mode)?;
                node.cache.create(0);
                Ok(node)
            }
            Some(name) => {
                let path = tree::path_from_root(&self.root, dir);
                if name.len() + path.len() + 1 > NAME_SIZE {
                    return Err(Error::NameTooLong);
                }
                debug!("creating node {:?}", name);
                self.create_with_item(dir, name, mode)
            }
        }
    }

    fn unlink_node(&self, node: &Arc<Node>) -> Result<()> {
        self.check_writable()?;
        debug!("unlinking {:?}", node.name());

        let item = node.item();
        tree::unlink_node(node)?;
        node.state.lock().unwrap().item = None;

        // Items that never made it into the archive are removed outright;
        // the rest linger (node-less) until the next sync reclaims them.
        if let Some(item) = item {
            if item.offset() == -1 {
                self.list.unlink_item(item.id);
            }
        }
        Ok(())
    }

    fn link_node(&self, dir: &Arc<Node>, target: &Arc<Node>, name: &str, excl: bool) -> Result<()> {
        self.check_writable()?;

        if tree::find(dir, name).is_some() {
            return if excl { Err(Error::Exists) } else { Ok(()) };
        }

        if target.name().is_none() {
            // Naming an anonymous node adopts it into the archive instead
            // of aliasing it.
            debug!("naming anonymous node {:?}", name);
            target.state.lock().unwrap().name = Some(tree::filter_name(name));
            let prev = self.list.put_item(&self.root, target);
            let item = self.list.insert_item(prev, target, 0, -1);
            target.state.lock().unwrap().item = Some(item);
            return Ok(());
        }

        let node = self.tree.hard_link(dir, name, target.stat().mode, target)?;
        let mut prev = self.list.put_item(&self.root, &node);

        // The alias must serialise after its target: a predecessor that
        // sits before the target's item is replaced by the target's item.
        if let Some(titem) = target.item() {
            let ordered = match prev {
                Some(p) => self.list.lock().follows(titem.id, p),
                None => false,
            };
            if !ordered {
                prev = Some(titem.id);
            }
        }

        let item = self.list.insert_item(prev, &node, 0, -1);
        node.state.lock().unwrap().item = Some(item);
        Ok(())
    }

    fn symlink_node(&self, node: &Arc<Node>, target: &str) -> Result<()> {
        self.check_writable()?;
        tree::link_node_path(node, target);
        Ok(())
    }

    fn mkdev_node(&self, _node: &Arc<Node>, _kind: u32, _rdev: u64) -> Result<()> {
        debug!("mkdev not implemented");
        Err(Error::NotSupported)
    }

    fn free_node(&self, node: &Arc<Node>) {
        node.cache.clear();
        node.state.lock().unwrap().item = None;
    }

    /// The serialisation pass: walk the item list in order, re-emitting
    /// headers and payloads that changed or moved, reclaiming items of
    /// removed nodes, then write the end-of-archive record and truncate.
    /// Before anything is written over a region, every item whose data
    /// still lives there is cached ahead.
    fn sync_fs(&self, _wait: bool) -> Result<()> {
        {
            let o = self.opts.lock().unwrap();
            if o.readonly || o.volatile {
                return Ok(());
            }
        }
        debug!("syncing filesystem");

        let mut list = self.list.lock();
        let mut file_offs: u64 = 0;
        let mut buf = [0u8; RECORD_SIZE];
        let mut cur = list.head();

        while let Some(id) = cur {
            let item = list.get(id);

            // A node that was unlinked (or fully released) leaves a dead
            // item behind; reclaim it now.
            let node = item.node.upgrade().filter(|n| {
                n.state
                    .lock()
                    .unwrap()
                    .item
                    .as_ref()
                    .is_some_and(|i| Arc::ptr_eq(i, &item))
            });
            let Some(node) = node else {
                let next = list.next(id);
                debug!("dropping item of removed node (size={})", item.orig_size());
                list.unlink(id);
                cur = next;
                continue;
            };

            // Paths walk parent links: compute them before taking the
            // node's lock.
            let path = tree::path_from_root(&self.root, &node);
            let hardlink_path = node
                .link_target()
                .map(|t| tree::path_from_root(&self.root, &t));

            let mut st = node.state.lock().unwrap();
            let size = st.stat.size;
            let needs_move = item.offset() != (file_offs + RECORD_SIZE as u64) as i64;

            if st.stat_changed || size != item.orig_size() || needs_move {
                debug!("{}: syncing header", path);
                // Preserve whatever still lives where the header lands.
                self.cache_ahead(&list, id, (&node, size), file_offs, RECORD_SIZE as u64)?;
                let rec = make_header(&st.stat, &path, st.symlink.as_deref(), hardlink_path.as_deref())?;
                self.write_backing(file_offs, &rec.0)?;
                st.stat_changed = false;
            }
            // The header slot is reserved whether or not it was rewritten.
            file_offs += RECORD_SIZE as u64;

            let plain_file =
                !tree::is_dir(st.stat.mode) && st.symlink.is_none() && st.hardlink.is_none();

            if plain_file && (!node.cache.synced() || needs_move) {
                let start = file_offs;
                // Within one record of the original location every record
                // write may clobber source bytes not yet read.
                let ahead = item.offset() - (start as i64) < RECORD_SIZE as i64;
                let rounded = tar::round_records(size);
                debug!("{}: syncing contents ({} bytes)", path, size);

                let origin = item.origin();
                let mut offs: u64 = 0;
                while offs < rounded {
                    if ahead {
                        self.cache_ahead(&list, id, (&node, size), file_offs, RECORD_SIZE as u64)?;
                    }
                    let n = {
                        let mut fetch = self.fetcher(origin);
                        node.cache.read(size, origin, offs, &mut buf, &mut fetch)?
                    };
                    // Zero-pad the final partial record.
                    buf[n..].fill(0);
                    self.write_backing(file_offs, &buf)?;
                    offs += RECORD_SIZE as u64;
                    file_offs += RECORD_SIZE as u64;
                }

                item.set_position(start as i64, size);
            } else {
                // Contents stay where they are (or there are none); the
                // cursor skips the payload records.
                let payload = if tree::is_dir(st.stat.mode) || st.hardlink.is_some() {
                    0
                } else {
                    size
                };
                item.set_position(file_offs as i64, item.orig_size());
                file_offs += tar::round_records(payload);
            }

            node.cache.clear();
            drop(st);
            cur = list.next(id);
        }

        if file_offs == 0 {
            warn!("archive is empty");
        }

        // End-of-archive marker.
        let zero = [0u8; RECORD_SIZE];
        self.write_backing(file_offs, &zero)?;
        file_offs += RECORD_SIZE as u64;

        let store_size = self.with_store(|s| s.size())?;
        if file_offs < store_size {
            debug!("truncating archive from {} to {} bytes", store_size, file_offs);
            self.with_store(|s| s.set_size(file_offs))?;
        }

        // Commit. Compressed stores write back on close; the store is
        // reopened lazily by the next operation.
        let store = self.store.lock().unwrap().take();
        if let Some(store) = store {
            store.close()?;
        }
        Ok(())
    }

    fn go_away(&self) -> Result<()> {
        let (readonly, volatile) = {
            let o = self.opts.lock().unwrap();
            (o.readonly, o.volatile)
        };

        let mut result = Ok(());
        if !readonly && !volatile {
            if let Err(e) = self.sync_fs(false) {
                error!("syncing failed: {}", e);
                result = Err(e);
            }
        }

        let store = self.store.lock().unwrap().take();
        if let Some(store) = store {
            store.close()?;
        }
        debug!("bye");
        result
    }
}
