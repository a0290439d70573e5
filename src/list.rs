//! The archive item list.
//!
//! One item per node that has — or will get — a record pair in the
//! archive, kept in the exact order the records appear (or should appear)
//! on disk. New nodes are placed by [`TarList::put_item`]; the sync pass
//! walks the list front to back and rewrites the archive in list order.
//!
//! Structure (head pointer, prev/next links, slot reuse) is guarded by one
//! mutex; the items themselves are shared `Arc`s whose position fields are
//! atomics. A node holds its own item handle, so operations serialised by
//! the per-node lock can read the item's archive position without touching
//! the list lock — the list lock sits above node locks in the ordering and
//! must never be taken while one is held.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::cache::Origin;
use crate::tree::Node;

/// Stable handle to one list slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemId(usize);

/// One archive entry: where its payload sits (or `-1` for a node that has
/// never been written), how big it originally was, and which node it
/// belongs to. The node reference is weak, so a destroyed node reads back
/// as gone and the slot is reclaimed by the next sync pass.
#[derive(Debug)]
pub struct TarItem {
    pub id: ItemId,
    /// Payload offset in the archive; `-1` for synthetic items. Written
    /// only under the owning node's lock (by ingest and sync).
    pub offset: AtomicI64,
    /// Payload size as originally parsed (header excluded).
    pub orig_size: AtomicU64,
    pub node: Weak<Node>,
}

impl TarItem {
    pub fn offset(&self) -> i64 {
        self.offset.load(Ordering::Acquire)
    }

    pub fn orig_size(&self) -> u64 {
        self.orig_size.load(Ordering::Acquire)
    }

    /// The node's on-disk payload location, if it has ever been written.
    pub fn origin(&self) -> Option<Origin> {
        let offset = self.offset();
        if offset < 0 {
            None
        } else {
            Some(Origin {
                start: offset as u64,
                orig_size: self.orig_size(),
            })
        }
    }

    pub fn set_position(&self, offset: i64, orig_size: u64) {
        self.offset.store(offset, Ordering::Release);
        self.orig_size.store(orig_size, Ordering::Release);
    }
}

#[derive(Debug)]
struct Slot {
    item: Arc<TarItem>,
    prev: Option<ItemId>,
    next: Option<ItemId>,
}

/// The arena and the head pointer, guarded together.
#[derive(Debug, Default)]
pub struct ListInner {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    head: Option<ItemId>,
}

#[derive(Debug, Default)]
pub struct TarList {
    inner: Mutex<ListInner>,
}

impl ListInner {
    pub fn head(&self) -> Option<ItemId> {
        self.head
    }

    fn slot(&self, id: ItemId) -> &Slot {
        self.slots[id.0].as_ref().expect("stale item id")
    }

    fn slot_mut(&mut self, id: ItemId) -> &mut Slot {
        self.slots[id.0].as_mut().expect("stale item id")
    }

    pub fn get(&self, id: ItemId) -> Arc<TarItem> {
        self.slot(id).item.clone()
    }

    pub fn next(&self, id: ItemId) -> Option<ItemId> {
        self.slot(id).next
    }

    /// Allocates an unlinked item. The caller records the handle in the
    /// node's state and links the item with [`ListInner::insert_after`].
    pub fn make_item(&mut self, node: &Arc<Node>, orig_size: u64, offset: i64) -> Arc<TarItem> {
        let idx = self.free.pop().unwrap_or(self.slots.len());
        let item = Arc::new(TarItem {
            id: ItemId(idx),
            offset: AtomicI64::new(offset),
            orig_size: AtomicU64::new(orig_size),
            node: Arc::downgrade(node),
        });
        let slot = Slot {
            item: item.clone(),
            prev: None,
            next: None,
        };
        if idx == self.slots.len() {
            self.slots.push(Some(slot));
        } else {
            self.slots[idx] = Some(slot);
        }
        item
    }

    /// Links `new` right after `prev`; `prev == None` links it at the head.
    pub fn insert_after(&mut self, prev: Option<ItemId>, new: ItemId) {
        debug_assert_ne!(prev, Some(new));
        let next = match prev {
            Some(prev) => {
                let next = self.slot(prev).next;
                self.slot_mut(prev).next = Some(new);
                next
            }
            None => {
                let next = self.head;
                self.head = Some(new);
                next
            }
        };
        {
            let slot = self.slot_mut(new);
            slot.prev = prev;
            slot.next = next;
        }
        if let Some(next) = next {
            self.slot_mut(next).prev = Some(new);
        }
    }

    /// Unlinks and frees the slot for `id`. The item `Arc` itself lives on
    /// until every handle drops.
    pub fn unlink(&mut self, id: ItemId) {
        let slot = self.slots[id.0].take().expect("stale item id");
        match slot.prev {
            Some(prev) => self.slot_mut(prev).next = slot.next,
            None => self.head = slot.next,
        }
        if let Some(next) = slot.next {
            self.slot_mut(next).prev = slot.prev;
        }
        self.free.push(id.0);
    }

    /// True when `candidate` appears at or after `from` in list order.
    pub fn follows(&self, from: ItemId, candidate: ItemId) -> bool {
        let mut cur = Some(from);
        while let Some(id) = cur {
            if id == candidate {
                return true;
            }
            cur = self.slot(id).next;
        }
        false
    }
}

impl TarList {
    pub fn new() -> Self {
        TarList::default()
    }

    /// Locks the list for a multi-item critical section (the sync pass
    /// holds this guard for its whole traversal).
    pub fn lock(&self) -> MutexGuard<'_, ListInner> {
        self.inner.lock().unwrap()
    }

    /// Allocates an item for `node` and links it right after `prev`.
    pub fn insert_item(
        &self,
        prev: Option<ItemId>,
        node: &Arc<Node>,
        orig_size: u64,
        offset: i64,
    ) -> Arc<TarItem> {
        let mut inner = self.lock();
        let item = inner.make_item(node, orig_size, offset);
        inner.insert_after(prev, item.id);
        item
    }

    /// Unlinks a dead or detached item.
    pub fn unlink_item(&self, id: ItemId) {
        self.lock().unlink(id);
    }

    /// Picks the list position for a freshly created `node`: the returned
    /// id is the item the new one must be linked after (`None` for the
    /// list head). The choice keeps the archive consistent and pushes new
    /// data past everything that already exists, so sync has the least
    /// possible cache-ahead work:
    ///
    /// 1. after the parent directory's item,
    /// 2. after every existing entry of that parent,
    /// 3. after the deepest last descendant of the parent's last entry.
    ///
    /// `node` itself is skipped while scanning the parent's entries;
    /// entries without items (anonymous nodes) are skipped too.
    pub fn put_item(&self, root: &Arc<Node>, node: &Arc<Node>) -> Option<ItemId> {
        let dir = node.parent()?;

        // Last entry of DIR, not counting NODE itself.
        let mut last_entry = {
            let d = dir.state.lock().unwrap();
            d.children
                .iter()
                .filter(|c| !Arc::ptr_eq(c, node) && c.item().is_some())
                .next_back()
                .cloned()
        };

        // Descend to the last entry of the deepest last subdirectory.
        while let Some(entry) = &last_entry {
            if !entry.is_dir() {
                break;
            }
            let next = {
                let s = entry.state.lock().unwrap();
                s.children
                    .iter()
                    .filter(|c| c.item().is_some())
                    .next_back()
                    .cloned()
            };
            match next {
                Some(next) => last_entry = Some(next),
                None => break,
            }
        }

        match last_entry {
            Some(entry) => entry.item().map(|i| i.id),
            None if Arc::ptr_eq(&dir, root) => None,
            None => node_item_id(&dir),
        }
    }
}

fn node_item_id(node: &Arc<Node>) -> Option<ItemId> {
    node.item().map(|i| i.id)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Tree, S_IFDIR, S_IFREG};

    fn collect(list: &TarList) -> Vec<ItemId> {
        let inner = list.lock();
        let mut out = Vec::new();
        let mut cur = inner.head();
        while let Some(id) = cur {
            out.push(id);
            cur = inner.next(id);
        }
        out
    }

    fn attach(node: &Arc<Node>, item: &Arc<TarItem>) {
        node.state.lock().unwrap().item = Some(item.clone());
    }

    #[test]
    fn insert_and_unlink_preserve_links() {
        let tree = Tree::new();
        let root = tree.make_node(None, None, S_IFDIR | 0o755).unwrap();
        let n1 = tree.make_node(Some(&root), Some("a"), S_IFREG).unwrap();
        let n2 = tree.make_node(Some(&root), Some("b"), S_IFREG).unwrap();
        let n3 = tree.make_node(Some(&root), Some("c"), S_IFREG).unwrap();

        let list = TarList::new();
        let i1 = list.insert_item(None, &n1, 0, 0);
        let i2 = list.insert_item(Some(i1.id), &n2, 0, 512);
        let i3 = list.insert_item(Some(i2.id), &n3, 0, 1024);
        assert_eq!(collect(&list), [i1.id, i2.id, i3.id]);

        // Dropping the node makes the item reclaimable.
        let dead = i2.id;
        drop(n2);
        {
            let mut inner = list.lock();
            assert!(inner.get(dead).node.upgrade().is_none());
            inner.unlink(dead);
        }
        assert_eq!(collect(&list), [i1.id, i3.id]);

        // Freed slots are reused without disturbing surviving ids.
        let n4 = tree.make_node(Some(&root), Some("d"), S_IFREG).unwrap();
        let i4 = list.insert_item(Some(i3.id), &n4, 0, -1);
        assert_eq!(collect(&list), [i1.id, i3.id, i4.id]);
        assert!(list.lock().follows(i1.id, i4.id));
        assert!(!list.lock().follows(i4.id, i1.id));
    }

    #[test]
    fn insert_at_head() {
        let tree = Tree::new();
        let root = tree.make_node(None, None, S_IFDIR | 0o755).unwrap();
        let n1 = tree.make_node(Some(&root), Some("a"), S_IFREG).unwrap();
        let n2 = tree.make_node(Some(&root), Some("b"), S_IFREG).unwrap();

        let list = TarList::new();
        let i1 = list.insert_item(None, &n1, 0, 0);
        let i2 = list.insert_item(None, &n2, 0, -1);
        assert_eq!(collect(&list), [i2.id, i1.id]);
    }

    /// Builds the layout from the placement policy's motivating example:
    ///   0: file   1: dir/   2: dir/file1   3: dir/file2
    /// and checks a new node of the root lands after the whole subtree.
    #[test]
    fn put_item_lands_past_existing_sibling_subtree() {
        let tree = Tree::new();
        let root = tree.make_node(None, None, S_IFDIR | 0o755).unwrap();
        let file = tree.make_node(Some(&root), Some("file"), S_IFREG).unwrap();
        let dir = tree.make_node(Some(&root), Some("dir"), S_IFDIR | 0o755).unwrap();
        let f1 = tree.make_node(Some(&dir), Some("file1"), S_IFREG).unwrap();
        let f2 = tree.make_node(Some(&dir), Some("file2"), S_IFREG).unwrap();

        let list = TarList::new();
        let i_file = list.insert_item(None, &file, 0, 512);
        attach(&file, &i_file);
        let i_dir = list.insert_item(Some(i_file.id), &dir, 0, 1024);
        attach(&dir, &i_dir);
        let i_f1 = list.insert_item(Some(i_dir.id), &f1, 0, 1536);
        attach(&f1, &i_f1);
        let i_f2 = list.insert_item(Some(i_f1.id), &f2, 0, 2048);
        attach(&f2, &i_f2);

        // A new root entry must follow dir/file2, not sit between dir and
        // its entries.
        let newnode = tree.make_node(Some(&root), Some("new"), S_IFREG).unwrap();
        assert_eq!(list.put_item(&root, &newnode), Some(i_f2.id));

        // A new entry of dir itself also lands after dir/file2.
        let newdeep = tree.make_node(Some(&dir), Some("file3"), S_IFREG).unwrap();
        assert_eq!(list.put_item(&root, &newdeep), Some(i_f2.id));
    }

    #[test]
    fn put_item_falls_back_to_parent_item() {
        let tree = Tree::new();
        let root = tree.make_node(None, None, S_IFDIR | 0o755).unwrap();
        let dir = tree.make_node(Some(&root), Some("dir"), S_IFDIR | 0o755).unwrap();

        let list = TarList::new();
        let i_dir = list.insert_item(None, &dir, 0, 512);
        attach(&dir, &i_dir);

        // Only entry of an empty dir: after the dir's own item.
        let inner = tree.make_node(Some(&dir), Some("x"), S_IFREG).unwrap();
        assert_eq!(list.put_item(&root, &inner), Some(i_dir.id));

        // Only entry of the root: the head position.
        let tree2 = Tree::new();
        let root2 = tree2.make_node(None, None, S_IFDIR | 0o755).unwrap();
        let solo = tree2.make_node(Some(&root2), Some("solo"), S_IFREG).unwrap();
        assert_eq!(list.put_item(&root2, &solo), None);
    }
}
