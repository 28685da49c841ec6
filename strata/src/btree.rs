//! A concurrent B+Tree clustered index over the buffer pool.
//!
//! Descents use latch crabbing: a child's latch is taken before the parent's
//! is dropped, and for writes the ancestors stay latched until the current
//! node is safe for the pending operation. Every latched page is tracked in
//! the transaction's page set and released in bulk on the operation's exit
//! path; pages emptied by a merge are queued in the deleted-page set and
//! dropped at the same point.

use std::cell::Cell;
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicI32, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::lock_api::RawRwLock as RawRwLockApi;
use parking_lot::RawRwLock;

use crate::btree_page as node;
pub use crate::btree_page::OpType;
use crate::buffer_pool::BufferPoolManager;
use crate::header_page::{ensure_header_page, lookup_root, HeaderPage};
use crate::page::Page;
use crate::transaction::Transaction;
use crate::{PageId, HEADER_PAGE_ID, INVALID_PAGE_ID};

thread_local! {
    // How many root-id latches this thread holds; recursive structure
    // modifications must not re-lock or over-release the root latch.
    static ROOT_LOCKED: Cell<i32> = const { Cell::new(0) };
}

/// A clustered index parameterized by key, value, and a three-way comparator.
/// Key and value are plain-data types stored inline in the page image.
pub struct BPlusTree<K, V, C> {
    index_name: String,
    bpm: Arc<BufferPoolManager>,
    comparator: C,
    root_page_id: AtomicI32,
    root_latch: RawRwLock,
    leaf_max_size: i32,
    internal_max_size: i32,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V, C> BPlusTree<K, V, C>
where
    K: Copy,
    V: Copy,
    C: Fn(&K, &K) -> Ordering,
{
    /// Opens the index named `index_name`, recovering its root from the
    /// header page when one was recorded.
    pub fn new(index_name: impl Into<String>, bpm: Arc<BufferPoolManager>, comparator: C) -> Self {
        let index_name = index_name.into();
        ensure_header_page(&bpm);
        let root = lookup_root(&bpm, &index_name).unwrap_or(INVALID_PAGE_ID);
        Self {
            index_name,
            bpm,
            comparator,
            root_page_id: AtomicI32::new(root),
            root_latch: RawRwLock::INIT,
            leaf_max_size: 0,
            internal_max_size: 0,
            _marker: PhantomData,
        }
    }

    /// Caps node fan-out below what PAGE_SIZE allows; small caps make
    /// structure changes reachable with a handful of keys.
    pub fn with_node_capacity(mut self, leaf_max_size: i32, internal_max_size: i32) -> Self {
        self.leaf_max_size = leaf_max_size;
        self.internal_max_size = internal_max_size;
        self
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id.load(AtomicOrdering::SeqCst)
    }

    fn set_root_page_id(&self, page_id: PageId) {
        self.root_page_id.store(page_id, AtomicOrdering::SeqCst);
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id() == INVALID_PAGE_ID
    }

    // ---- search --------------------------------------------------------

    pub fn get_value(&self, key: &K, txn: Option<&Transaction>) -> Option<V> {
        let leaf = self.find_leaf_page(Some(key), OpType::Read, txn)?;
        let result = node::leaf_lookup::<K, V, C>(&leaf, key, &self.comparator);
        self.free_pages_in_transaction(false, txn, Some(&leaf));
        result
    }

    // ---- insertion -----------------------------------------------------

    /// Keys are unique: inserting a present key returns false.
    pub fn insert(&self, key: K, value: V, txn: &Transaction) -> bool {
        self.lock_root(true);
        if self.is_empty() {
            self.start_new_tree(key, value);
            self.try_unlock_root(true);
            return true;
        }
        self.try_unlock_root(true);
        self.insert_into_leaf(key, value, txn)
    }

    fn start_new_tree(&self, key: K, value: V) {
        let (page_id, page) = self.bpm.new_page().expect("buffer pool out of memory");
        node::init_leaf::<K, V>(&page, page_id, INVALID_PAGE_ID, self.leaf_max_size);
        self.set_root_page_id(page_id);
        self.update_root_page_id(true);
        node::leaf_insert::<K, V, C>(&page, key, value, &self.comparator);
        self.bpm.unpin_page(page_id, true);
    }

    fn insert_into_leaf(&self, key: K, value: V, txn: &Transaction) -> bool {
        let Some(leaf) = self.find_leaf_page(Some(&key), OpType::Insert, Some(txn)) else {
            // The tree emptied out between the two root acquisitions; retry
            // from the top to take the new-tree path.
            return self.insert(key, value, txn);
        };
        if node::leaf_lookup::<K, V, C>(&leaf, &key, &self.comparator).is_some() {
            self.free_pages_in_transaction(true, Some(txn), None);
            return false;
        }
        node::leaf_insert::<K, V, C>(&leaf, key, value, &self.comparator);
        if node::size(&leaf) > node::max_size(&leaf) {
            let new_leaf = self.split_leaf(&leaf, txn);
            let separator = node::leaf_key_at::<K, V>(&new_leaf, 0);
            self.insert_into_parent(&leaf, separator, &new_leaf, txn);
        }
        self.free_pages_in_transaction(true, Some(txn), None);
        true
    }

    fn split_leaf(&self, old: &Arc<Page>, txn: &Transaction) -> Arc<Page> {
        let (new_page_id, new_page) = self.bpm.new_page().expect("buffer pool out of memory");
        new_page.wlatch();
        txn.add_into_page_set(Arc::clone(&new_page));
        node::init_leaf::<K, V>(
            &new_page,
            new_page_id,
            node::parent_page_id(old),
            self.leaf_max_size,
        );
        node::leaf_move_half_to::<K, V>(old, &new_page, new_page_id);
        new_page
    }

    fn split_internal(&self, old: &Arc<Page>, txn: &Transaction) -> Arc<Page> {
        let (new_page_id, new_page) = self.bpm.new_page().expect("buffer pool out of memory");
        new_page.wlatch();
        txn.add_into_page_set(Arc::clone(&new_page));
        node::init_internal::<K>(
            &new_page,
            new_page_id,
            node::parent_page_id(old),
            self.internal_max_size,
        );
        node::internal_move_half_to::<K>(old, &new_page);
        // Migrated subtrees hang off the new page now.
        for i in 0..node::size(&new_page) as usize {
            let child_id = node::internal_value_at::<K>(&new_page, i);
            let child = self.fetch_node(child_id);
            node::set_parent_page_id(&child, new_page_id);
            self.bpm.unpin_page(child_id, true);
        }
        new_page
    }

    fn insert_into_parent(&self, old: &Arc<Page>, key: K, new: &Arc<Page>, txn: &Transaction) {
        if node::is_root(old) {
            // Grow the tree by one level. The exclusive root-id latch is
            // still held here, no node below was safe.
            let (root_id, root_page) = self.bpm.new_page().expect("buffer pool out of memory");
            debug_assert_eq!(root_page.pin_count(), 1);
            node::init_internal::<K>(&root_page, root_id, INVALID_PAGE_ID, self.internal_max_size);
            node::internal_populate_new_root::<K>(
                &root_page,
                old.page_id(),
                key,
                new.page_id(),
            );
            node::set_parent_page_id(old, root_id);
            node::set_parent_page_id(new, root_id);
            self.set_root_page_id(root_id);
            self.update_root_page_id(false);
            self.bpm.unpin_page(root_id, true);
            return;
        }

        let parent_id = node::parent_page_id(old);
        let parent = self.fetch_node(parent_id);
        node::set_parent_page_id(new, parent_id);
        node::internal_insert_after::<K>(&parent, old.page_id(), key, new.page_id());
        if node::size(&parent) > node::max_size(&parent) {
            let new_internal = self.split_internal(&parent, txn);
            let separator = node::internal_key_at::<K>(&new_internal, 0);
            self.insert_into_parent(&parent, separator, &new_internal, txn);
        }
        self.bpm.unpin_page(parent_id, true);
    }

    // ---- removal -------------------------------------------------------

    /// Removing an absent key is a no-op.
    pub fn remove(&self, key: &K, txn: &Transaction) {
        let Some(leaf) = self.find_leaf_page(Some(key), OpType::Delete, Some(txn)) else {
            return;
        };
        let new_size = node::leaf_remove::<K, V, C>(&leaf, key, &self.comparator);
        if new_size < node::min_size(&leaf) {
            self.coalesce_or_redistribute(&leaf, txn);
        }
        self.free_pages_in_transaction(true, Some(txn), None);
    }

    fn coalesce_or_redistribute(&self, page: &Arc<Page>, txn: &Transaction) {
        if node::is_root(page) {
            if self.adjust_root(page) {
                txn.add_into_deleted_page_set(page.page_id());
            }
            return;
        }

        let (sibling, sibling_is_right) = self.find_sibling(page, txn);
        let parent = self.fetch_node(node::parent_page_id(page));

        if node::size(page) + node::size(&sibling) <= node::max_size(page) {
            // Coalesce into whichever of the two is on the left.
            let (neighbor, doomed) = if sibling_is_right {
                (page, &sibling)
            } else {
                (&sibling, page)
            };
            let index = node::internal_value_index::<K>(&parent, doomed.page_id())
                .expect("child recorded in parent");
            self.coalesce(neighbor, doomed, &parent, index, txn);
            self.bpm.unpin_page(parent.page_id(), true);
        } else {
            let index = node::internal_value_index::<K>(&parent, page.page_id())
                .expect("child recorded in parent");
            self.redistribute(&sibling, page, index);
            self.bpm.unpin_page(parent.page_id(), false);
        }
    }

    /// Latches the left sibling, or the right one for the leftmost child.
    /// Returns (sibling, true) when the sibling sits to the right.
    fn find_sibling(&self, page: &Arc<Page>, txn: &Transaction) -> (Arc<Page>, bool) {
        let parent = self.fetch_node(node::parent_page_id(page));
        let index = node::internal_value_index::<K>(&parent, page.page_id())
            .expect("child recorded in parent");
        let sibling_index = if index == 0 { 1 } else { index - 1 };
        let sibling_id = node::internal_value_at::<K>(&parent, sibling_index);
        let sibling = self.crab_fetch(sibling_id, OpType::Delete, None, Some(txn));
        self.bpm.unpin_page(parent.page_id(), false);
        (sibling, index == 0)
    }

    /// Moves all of `doomed` into its left sibling `neighbor`, drops the
    /// separator from the parent, and rebalances the parent if it underflows.
    fn coalesce(
        &self,
        neighbor: &Arc<Page>,
        doomed: &Arc<Page>,
        parent: &Arc<Page>,
        index: usize,
        txn: &Transaction,
    ) {
        debug_assert!(node::size(doomed) + node::size(neighbor) <= node::max_size(doomed));
        if node::is_leaf(doomed) {
            node::leaf_move_all_to::<K, V>(doomed, neighbor);
        } else {
            let moved = node::size(doomed);
            let separator = node::internal_key_at::<K>(parent, index);
            node::internal_move_all_to::<K>(doomed, neighbor, separator);
            let total = node::size(neighbor);
            for i in (total - moved) as usize..total as usize {
                let child_id = node::internal_value_at::<K>(neighbor, i);
                let child = self.fetch_node(child_id);
                node::set_parent_page_id(&child, neighbor.page_id());
                self.bpm.unpin_page(child_id, true);
            }
        }
        txn.add_into_deleted_page_set(doomed.page_id());
        node::internal_remove_at::<K>(parent, index);
        // Slot 0's key being unused makes an internal page of min_size
        // entries already as sparse as allowed, hence <= rather than <.
        if node::size(parent) <= node::min_size(parent) {
            self.coalesce_or_redistribute(parent, txn);
        }
    }

    /// Borrows one entry from `sibling` into `page`. `index` is `page`'s slot
    /// in the parent; 0 means the sibling is on the right.
    fn redistribute(&self, sibling: &Arc<Page>, page: &Arc<Page>, index: usize) {
        if index == 0 {
            // Sibling is right of page: its first entry moves to page's end
            // and the parent separator becomes the sibling's new first key.
            if node::is_leaf(page) {
                let (key, value) = node::leaf_pop_front::<K, V>(sibling);
                node::leaf_push_back::<K, V>(page, key, value);
            } else {
                let (key, child_id) = node::internal_pop_front::<K>(sibling);
                node::internal_push_back::<K>(page, key, child_id);
                let child = self.fetch_node(child_id);
                node::set_parent_page_id(&child, page.page_id());
                self.bpm.unpin_page(child_id, true);
            }
            let parent = self.fetch_node(node::parent_page_id(sibling));
            let sibling_slot = node::internal_value_index::<K>(&parent, sibling.page_id())
                .expect("sibling recorded in parent");
            let new_first = if node::is_leaf(sibling) {
                node::leaf_key_at::<K, V>(sibling, 0)
            } else {
                node::internal_key_at::<K>(sibling, 0)
            };
            node::set_internal_key_at::<K>(&parent, sibling_slot, new_first);
            self.bpm.unpin_page(parent.page_id(), true);
        } else {
            // Sibling is left of page: its last entry moves to page's front
            // and becomes the separator at page's slot.
            let moved_key = if node::is_leaf(page) {
                let (key, value) = node::leaf_pop_back::<K, V>(sibling);
                node::leaf_push_front::<K, V>(page, key, value);
                key
            } else {
                let (key, child_id) = node::internal_pop_back::<K>(sibling);
                node::internal_push_front::<K>(page, key, child_id);
                let child = self.fetch_node(child_id);
                node::set_parent_page_id(&child, page.page_id());
                self.bpm.unpin_page(child_id, true);
                key
            };
            let parent = self.fetch_node(node::parent_page_id(page));
            node::set_internal_key_at::<K>(&parent, index, moved_key);
            self.bpm.unpin_page(parent.page_id(), true);
        }
    }

    /// Shrinks the tree at the top: an empty root leaf empties the tree, a
    /// one-child root internal promotes its child. True when the old root
    /// page should be deleted.
    fn adjust_root(&self, old_root: &Arc<Page>) -> bool {
        if node::is_leaf(old_root) {
            if node::size(old_root) != 0 {
                return false;
            }
            self.set_root_page_id(INVALID_PAGE_ID);
            self.update_root_page_id(false);
            return true;
        }
        if node::size(old_root) == 1 {
            let new_root_id = node::internal_remove_and_return_only_child::<K>(old_root);
            self.set_root_page_id(new_root_id);
            self.update_root_page_id(false);
            let child = self.fetch_node(new_root_id);
            node::set_parent_page_id(&child, INVALID_PAGE_ID);
            self.bpm.unpin_page(new_root_id, true);
            return true;
        }
        false
    }

    // ---- iteration -----------------------------------------------------

    /// Iterates every entry in ascending key order.
    pub fn iter(&self) -> IndexIterator<K, V> {
        let leaf = self.find_leaf_page(None, OpType::Read, None);
        self.try_unlock_root(false);
        IndexIterator::new(Arc::clone(&self.bpm), leaf, 0)
    }

    /// Iterates entries with key >= `key` in ascending order.
    pub fn iter_from(&self, key: &K) -> IndexIterator<K, V> {
        let leaf = self.find_leaf_page(Some(key), OpType::Read, None);
        self.try_unlock_root(false);
        let index = leaf
            .as_ref()
            .map(|leaf| node::leaf_key_index::<K, V, C>(leaf, key, &self.comparator))
            .unwrap_or(0);
        IndexIterator::new(Arc::clone(&self.bpm), leaf, index)
    }

    // ---- descent machinery ---------------------------------------------

    /// Descends to the leaf for `key` (leftmost leaf when `key` is `None`),
    /// latching per `op` and crabbing ancestors off as safety allows. `None`
    /// on an empty tree. The returned leaf stays latched and pinned.
    fn find_leaf_page(
        &self,
        key: Option<&K>,
        op: OpType,
        txn: Option<&Transaction>,
    ) -> Option<Arc<Page>> {
        let exclusive = op != OpType::Read;
        self.lock_root(exclusive);
        if self.is_empty() {
            self.try_unlock_root(exclusive);
            return None;
        }
        let mut page = self.crab_fetch(self.root_page_id(), op, None, txn);
        while !node::is_leaf(&page) {
            let next = match key {
                Some(key) => node::internal_lookup::<K, C>(&page, key, &self.comparator),
                None => node::internal_value_at::<K>(&page, 0),
            };
            let previous = page;
            page = self.crab_fetch(next, op, Some(&previous), txn);
        }
        Some(page)
    }

    /// Fetches and latches one node. Once the node is proven safe (always,
    /// for reads) the ancestors held so far are released.
    fn crab_fetch(
        &self,
        page_id: PageId,
        op: OpType,
        previous: Option<&Arc<Page>>,
        txn: Option<&Transaction>,
    ) -> Arc<Page> {
        let exclusive = op != OpType::Read;
        let page = self.fetch_node(page_id);
        if exclusive {
            page.wlatch();
        } else {
            page.rlatch();
        }
        if previous.is_some() && (!exclusive || node::is_safe(&page, op)) {
            self.free_pages_in_transaction(exclusive, txn, previous);
        }
        if let Some(txn) = txn {
            txn.add_into_page_set(Arc::clone(&page));
        }
        page
    }

    /// Releases the root-id latch (if this thread holds it) and every page
    /// latched by the operation, unpinning and deleting as recorded. Without
    /// a transaction only `current` is released.
    fn free_pages_in_transaction(
        &self,
        exclusive: bool,
        txn: Option<&Transaction>,
        current: Option<&Arc<Page>>,
    ) {
        self.try_unlock_root(exclusive);
        let Some(txn) = txn else {
            debug_assert!(!exclusive);
            let page = current.expect("a latched page to release");
            page.runlatch();
            self.bpm.unpin_page(page.page_id(), false);
            return;
        };
        for page in txn.drain_page_set() {
            let page_id = page.page_id();
            if exclusive {
                page.wunlatch();
            } else {
                page.runlatch();
            }
            self.bpm.unpin_page(page_id, exclusive);
            if txn.deleted_page_set().remove(&page_id) {
                self.bpm.delete_page(page_id);
            }
        }
        debug_assert!(txn.deleted_page_set().is_empty());
    }

    fn fetch_node(&self, page_id: PageId) -> Arc<Page> {
        self.bpm
            .fetch_page(page_id)
            .expect("buffer pool out of memory")
    }

    fn lock_root(&self, exclusive: bool) {
        if exclusive {
            self.root_latch.lock_exclusive();
        } else {
            self.root_latch.lock_shared();
        }
        ROOT_LOCKED.with(|count| count.set(count.get() + 1));
    }

    fn try_unlock_root(&self, exclusive: bool) {
        ROOT_LOCKED.with(|count| {
            if count.get() > 0 {
                if exclusive {
                    // Safety: this thread holds the latch, per the counter.
                    unsafe { self.root_latch.unlock_exclusive() }
                } else {
                    unsafe { self.root_latch.unlock_shared() }
                }
                count.set(count.get() - 1);
            }
        });
    }

    /// Persists the (index name -> root page id) record on the header page.
    /// `insert_record` is set when the index first materializes.
    fn update_root_page_id(&self, insert_record: bool) {
        let page = self
            .bpm
            .fetch_page(HEADER_PAGE_ID)
            .expect("buffer pool out of memory");
        page.wlatch();
        let header = HeaderPage::new(&page);
        let updated = if insert_record {
            header.insert_record(&self.index_name, self.root_page_id())
                || header.update_record(&self.index_name, self.root_page_id())
        } else {
            header.update_record(&self.index_name, self.root_page_id())
        };
        debug_assert!(updated, "header page full or record missing");
        page.wunlatch();
        self.bpm.unpin_page(HEADER_PAGE_ID, true);
    }
}

/// Forward scan over the leaf chain. Holds a read latch and a pin on the
/// current leaf, trading them leaf to leaf as it advances.
pub struct IndexIterator<K, V> {
    bpm: Arc<BufferPoolManager>,
    leaf: Option<Arc<Page>>,
    index: usize,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> IndexIterator<K, V> {
    fn new(bpm: Arc<BufferPoolManager>, leaf: Option<Arc<Page>>, index: usize) -> Self {
        Self {
            bpm,
            leaf,
            index,
            _marker: PhantomData,
        }
    }

    fn release(&mut self) {
        if let Some(leaf) = self.leaf.take() {
            leaf.runlatch();
            self.bpm.unpin_page(leaf.page_id(), false);
        }
    }
}

impl<K: Copy, V: Copy> Iterator for IndexIterator<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<(K, V)> {
        loop {
            let leaf = self.leaf.as_ref()?;
            if (self.index as i32) < node::size(leaf) {
                let entry = (
                    node::leaf_key_at::<K, V>(leaf, self.index),
                    node::leaf_value_at::<K, V>(leaf, self.index),
                );
                self.index += 1;
                return Some(entry);
            }
            let next_id = node::next_page_id(leaf);
            self.release();
            self.index = 0;
            if next_id != INVALID_PAGE_ID {
                let next = self
                    .bpm
                    .fetch_page(next_id)
                    .expect("buffer pool out of memory");
                next.rlatch();
                self.leaf = Some(next);
            }
        }
    }
}

impl<K, V> Drop for IndexIterator<K, V> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DiskManager;
    use crate::Rid;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use tempfile::TempDir;

    type Cmp = fn(&i64, &i64) -> Ordering;
    type Tree = BPlusTree<i64, Rid, Cmp>;

    fn cmp(a: &i64, b: &i64) -> Ordering {
        a.cmp(b)
    }

    fn rid(key: i64) -> Rid {
        Rid::new(key as PageId, key as u32)
    }

    fn setup(pool_size: usize, leaf_max: i32, internal_max: i32) -> (TempDir, Arc<BufferPoolManager>, Tree) {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(DiskManager::new(dir.path().join("index.db")).unwrap());
        let bpm = Arc::new(BufferPoolManager::new(pool_size, disk, None));
        let tree = BPlusTree::new("primary", Arc::clone(&bpm), cmp as Cmp)
            .with_node_capacity(leaf_max, internal_max);
        (dir, bpm, tree)
    }

    impl Tree {
        /// Walks the whole tree verifying order, size bounds, parent links,
        /// and uniform leaf depth. Returns the entry count.
        fn check_integrity(&self) -> usize {
            if self.is_empty() {
                return 0;
            }
            let (count, _) =
                self.check_node(self.root_page_id(), INVALID_PAGE_ID, None, None);
            assert!(self.bpm.check_all_unpinned());
            count
        }

        fn check_node(
            &self,
            page_id: PageId,
            expected_parent: PageId,
            lower: Option<i64>,
            upper: Option<i64>,
        ) -> (usize, usize) {
            let page = self.fetch_node(page_id);
            assert_eq!(node::parent_page_id(&page), expected_parent);
            let size = node::size(&page);
            if expected_parent != INVALID_PAGE_ID {
                assert!(size >= node::min_size(&page), "page {page_id} underflowed");
            }
            assert!(size <= node::max_size(&page), "page {page_id} overflowed");

            let in_bounds = |key: i64| {
                lower.map_or(true, |low| key >= low) && upper.map_or(true, |up| key < up)
            };

            let result = if node::is_leaf(&page) {
                for i in 0..size as usize {
                    let key = node::leaf_key_at::<i64, Rid>(&page, i);
                    assert!(in_bounds(key), "leaf key {key} out of bounds");
                    if i > 0 {
                        assert!(node::leaf_key_at::<i64, Rid>(&page, i - 1) < key);
                    }
                }
                (size as usize, 1)
            } else {
                let mut total = 0;
                let mut depth = None;
                for i in 0..size as usize {
                    let child_lower = if i == 0 {
                        lower
                    } else {
                        let key = node::internal_key_at::<i64>(&page, i);
                        assert!(in_bounds(key), "separator {key} out of bounds");
                        if i > 1 {
                            assert!(node::internal_key_at::<i64>(&page, i - 1) < key);
                        }
                        Some(key)
                    };
                    let child_upper = if i + 1 < size as usize {
                        Some(node::internal_key_at::<i64>(&page, i + 1))
                    } else {
                        upper
                    };
                    let child_id = node::internal_value_at::<i64>(&page, i);
                    let (child_count, child_depth) =
                        self.check_node(child_id, page_id, child_lower, child_upper);
                    total += child_count;
                    match depth {
                        None => depth = Some(child_depth),
                        Some(d) => assert_eq!(d, child_depth, "leaves at differing depths"),
                    }
                }
                (total, depth.unwrap() + 1)
            };
            self.bpm.unpin_page(page_id, false);
            result
        }
    }

    #[test]
    fn empty_tree_behaviour() {
        let (_dir, _bpm, tree) = setup(16, 3, 3);
        let txn = Transaction::new(1);
        assert!(tree.is_empty());
        assert_eq!(tree.get_value(&1, Some(&txn)), None);
        tree.remove(&1, &txn);
        assert_eq!(tree.iter().count(), 0);
    }

    #[test]
    fn insert_then_get_round_trip() {
        let (_dir, bpm, tree) = setup(16, 3, 3);
        let txn = Transaction::new(1);

        assert!(tree.insert(10, rid(10), &txn));
        assert!(tree.insert(20, rid(20), &txn));
        assert!(!tree.insert(10, rid(10), &txn), "duplicate key");

        assert_eq!(tree.get_value(&10, Some(&txn)), Some(rid(10)));
        assert_eq!(tree.get_value(&20, Some(&txn)), Some(rid(20)));
        assert_eq!(tree.get_value(&30, Some(&txn)), None);
        assert!(bpm.check_all_unpinned());
    }

    #[test]
    fn leaf_split_grows_a_root() {
        let (_dir, bpm, tree) = setup(16, 3, 3);
        let txn = Transaction::new(1);
        for key in 1..=4 {
            assert!(tree.insert(key, rid(key), &txn));
        }

        // Root became internal with separator 3 over leaves [1,2] and [3,4].
        let root = tree.fetch_node(tree.root_page_id());
        assert!(!node::is_leaf(&root));
        assert_eq!(node::size(&root), 2);
        assert_eq!(node::internal_key_at::<i64>(&root, 1), 3);
        let left = tree.fetch_node(node::internal_value_at::<i64>(&root, 0));
        let right = tree.fetch_node(node::internal_value_at::<i64>(&root, 1));
        assert_eq!(node::size(&left), 2);
        assert_eq!(node::size(&right), 2);
        assert_eq!(node::next_page_id(&left), right.page_id());
        bpm.unpin_page(left.page_id(), false);
        bpm.unpin_page(right.page_id(), false);
        bpm.unpin_page(root.page_id(), false);

        assert_eq!(tree.get_value(&3, Some(&txn)), Some(rid(3)));
        assert_eq!(tree.check_integrity(), 4);
    }

    #[test]
    fn borrow_then_merge_then_collapse() {
        let (_dir, _bpm, tree) = setup(16, 3, 3);
        let txn = Transaction::new(1);
        for key in 1..=5 {
            assert!(tree.insert(key, rid(key), &txn));
        }

        // [1,2] | [3,4,5]: removing 1 underflows the left leaf, which borrows
        // from its right sibling; the separator becomes 4.
        tree.remove(&1, &txn);
        let root = tree.fetch_node(tree.root_page_id());
        assert_eq!(node::internal_key_at::<i64>(&root, 1), 4);
        tree.bpm.unpin_page(root.page_id(), false);
        assert_eq!(tree.check_integrity(), 4);

        // Draining the right leaf coalesces it away and the root collapses to
        // a single leaf.
        tree.remove(&4, &txn);
        tree.remove(&5, &txn);
        let root = tree.fetch_node(tree.root_page_id());
        assert!(node::is_leaf(&root));
        tree.bpm.unpin_page(root.page_id(), false);
        let keys: Vec<i64> = tree.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec![2, 3]);
        assert_eq!(tree.check_integrity(), 2);
    }

    #[test]
    fn removing_everything_empties_the_tree() {
        let (_dir, bpm, tree) = setup(16, 3, 3);
        let txn = Transaction::new(1);
        for key in 1..=10 {
            assert!(tree.insert(key, rid(key), &txn));
        }
        for key in 1..=10 {
            tree.remove(&key, &txn);
        }
        assert!(tree.is_empty());
        assert!(bpm.check_all_unpinned());

        // The index grows a fresh root on the next insert.
        assert!(tree.insert(42, rid(42), &txn));
        assert_eq!(tree.get_value(&42, Some(&txn)), Some(rid(42)));
    }

    #[test]
    fn iterator_walks_the_leaf_chain_in_order() {
        let (_dir, _bpm, tree) = setup(32, 4, 4);
        let txn = Transaction::new(1);
        for key in (1..=40).rev() {
            assert!(tree.insert(key, rid(key), &txn));
        }

        let keys: Vec<i64> = tree.iter().map(|(key, _)| key).collect();
        assert_eq!(keys, (1..=40).collect::<Vec<_>>());

        let tail: Vec<i64> = tree.iter_from(&35).map(|(key, _)| key).collect();
        assert_eq!(tail, (35..=40).collect::<Vec<_>>());

        assert_eq!(tree.iter_from(&41).count(), 0);
    }

    #[test]
    fn root_survives_reopen_through_header_page() {
        let (_dir, bpm, tree) = setup(32, 4, 4);
        let txn = Transaction::new(1);
        for key in 1..=20 {
            assert!(tree.insert(key, rid(key), &txn));
        }
        let root = tree.root_page_id();
        drop(tree);

        let reopened = BPlusTree::new("primary", Arc::clone(&bpm), cmp as Cmp)
            .with_node_capacity(4, 4);
        assert_eq!(reopened.root_page_id(), root);
        assert_eq!(reopened.get_value(&17, Some(&txn)), Some(rid(17)));
    }

    #[test]
    fn randomized_workload_keeps_invariants() {
        let (_dir, _bpm, tree) = setup(32, 4, 4);
        let txn = Transaction::new(1);
        let mut rng = rand::rngs::StdRng::seed_from_u64(0xB17EE);

        let mut keys: Vec<i64> = (0..200).collect();
        keys.shuffle(&mut rng);
        for &key in &keys {
            assert!(tree.insert(key, rid(key), &txn));
        }
        assert_eq!(tree.check_integrity(), 200);

        keys.shuffle(&mut rng);
        let (gone, kept) = keys.split_at(100);
        for key in gone {
            tree.remove(key, &txn);
        }
        assert_eq!(tree.check_integrity(), 100);

        for key in gone {
            assert_eq!(tree.get_value(key, Some(&txn)), None);
        }
        for key in kept {
            assert_eq!(tree.get_value(key, Some(&txn)), Some(rid(*key)));
        }

        let mut remaining: Vec<i64> = kept.to_vec();
        remaining.sort_unstable();
        let scanned: Vec<i64> = tree.iter().map(|(key, _)| key).collect();
        assert_eq!(scanned, remaining);
    }
}
