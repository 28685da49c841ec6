use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::disk::DiskManager;
use crate::page::Page;
use crate::replacer::LruReplacer;
use crate::wal::{logging_enabled, LogManager};
use crate::{PageId, INVALID_LSN, INVALID_PAGE_ID};

/// Pool structures guarded by the single pool latch.
struct PoolState {
    page_table: HashMap<PageId, usize>,
    free_list: VecDeque<usize>,
    replacer: LruReplacer<usize>,
}

/// A pin-counted cache of disk pages over a fixed set of frames. The page
/// table maps resident page ids to frame indices; unpinned frames sit in the
/// replacer, unused frames in the free list. Before a dirty frame is evicted
/// the log is forced up to that page's LSN (the WAL rule).
pub struct BufferPoolManager {
    frames: Vec<Arc<Page>>,
    latch: Mutex<PoolState>,
    disk: Arc<DiskManager>,
    log: Option<Arc<LogManager>>,
}

impl BufferPoolManager {
    /// `log` is `None` when logging is disabled (tests mostly run this way).
    pub fn new(pool_size: usize, disk: Arc<DiskManager>, log: Option<Arc<LogManager>>) -> Self {
        let frames = (0..pool_size).map(|_| Arc::new(Page::new())).collect();
        Self {
            frames,
            latch: Mutex::new(PoolState {
                page_table: HashMap::new(),
                free_list: (0..pool_size).collect(),
                replacer: LruReplacer::new(),
            }),
            disk,
            log,
        }
    }

    pub fn pool_size(&self) -> usize {
        self.frames.len()
    }

    pub fn disk(&self) -> &Arc<DiskManager> {
        &self.disk
    }

    /// Returns the frame holding `page_id`, pinned, reading it from disk if it
    /// is not resident. `None` means every frame is pinned.
    pub fn fetch_page(&self, page_id: PageId) -> Option<Arc<Page>> {
        let mut state = self.latch.lock();
        if let Some(&idx) = state.page_table.get(&page_id) {
            let page = Arc::clone(&self.frames[idx]);
            page.incr_pin();
            state.replacer.erase(idx);
            return Some(page);
        }

        let idx = self.victim(&mut state)?;
        let page = Arc::clone(&self.frames[idx]);
        self.write_back_if_dirty(&page);

        state.page_table.remove(&page.page_id());
        state.page_table.insert(page_id, idx);

        self.disk.read_page(page_id, page.data_mut());
        page.set_pin_count(1);
        page.set_dirty(false);
        page.set_page_id(page_id);
        page.set_lsn(INVALID_LSN);
        Some(page)
    }

    /// Allocates a fresh disk page and returns it pinned in a zeroed frame.
    /// `None` means every frame is pinned.
    pub fn new_page(&self) -> Option<(PageId, Arc<Page>)> {
        let mut state = self.latch.lock();
        let idx = self.victim(&mut state)?;
        let page = Arc::clone(&self.frames[idx]);

        let page_id = self.disk.allocate_page();
        self.write_back_if_dirty(&page);

        state.page_table.remove(&page.page_id());
        state.page_table.insert(page_id, idx);

        page.reset_memory();
        page.set_pin_count(1);
        page.set_dirty(false);
        page.set_page_id(page_id);
        page.set_lsn(INVALID_LSN);
        Some((page_id, page))
    }

    /// Drops one pin, ORing in the dirty flag. False when the page is not
    /// resident; unpinning below zero is a caller contract violation.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let state = self.latch.lock();
        let Some(&idx) = state.page_table.get(&page_id) else {
            return false;
        };
        let page = &self.frames[idx];
        page.or_dirty(is_dirty);
        if page.pin_count() <= 0 {
            debug_assert!(false, "unpinning page {page_id} with no pins");
            return false;
        }
        if page.decr_pin() == 0 {
            state.replacer.insert(idx);
        }
        true
    }

    /// Writes the page through if dirty. Does not force the log.
    pub fn flush_page(&self, page_id: PageId) -> bool {
        let state = self.latch.lock();
        let Some(&idx) = state.page_table.get(&page_id) else {
            return false;
        };
        let page = &self.frames[idx];
        if page.page_id() == INVALID_PAGE_ID {
            return false;
        }
        if page.is_dirty() {
            self.disk.write_page(page.page_id(), page.data());
            page.set_dirty(false);
        }
        true
    }

    /// Writes every dirty resident page through. Used at shutdown; crash
    /// consistency comes from the log, not from this.
    pub fn flush_all_pages(&self) {
        let state = self.latch.lock();
        for &idx in state.page_table.values() {
            let page = &self.frames[idx];
            if page.is_dirty() {
                self.disk.write_page(page.page_id(), page.data());
                page.set_dirty(false);
            }
        }
    }

    /// Drops a page from the cache and returns its frame to the free list.
    /// False while the page still has pins.
    pub fn delete_page(&self, page_id: PageId) -> bool {
        let mut state = self.latch.lock();
        if let Some(&idx) = state.page_table.get(&page_id) {
            let page = &self.frames[idx];
            if page.pin_count() > 0 {
                return false;
            }
            state.replacer.erase(idx);
            state.page_table.remove(&page_id);
            page.set_dirty(false);
            page.reset_memory();
            page.set_page_id(INVALID_PAGE_ID);
            page.set_lsn(INVALID_LSN);
            state.free_list.push_back(idx);
        }
        self.disk.deallocate_page(page_id);
        true
    }

    /// Free-list frames first, then the LRU replacer. A victim always has a
    /// zero pin count.
    fn victim(&self, state: &mut PoolState) -> Option<usize> {
        let idx = match state.free_list.pop_front() {
            Some(idx) => {
                debug_assert_eq!(self.frames[idx].page_id(), INVALID_PAGE_ID);
                idx
            }
            None => state.replacer.victim()?,
        };
        debug_assert_eq!(self.frames[idx].pin_count(), 0);
        Some(idx)
    }

    fn write_back_if_dirty(&self, page: &Page) {
        if !page.is_dirty() {
            return;
        }
        if logging_enabled() {
            if let Some(log) = &self.log {
                if log.persistent_lsn() < page.lsn() {
                    log.flush(true);
                }
            }
        }
        self.disk.write_page(page.page_id(), page.data());
    }

    /// Debug aid: true iff no frame holds a pin.
    pub fn check_all_unpinned(&self) -> bool {
        let mut all_unpinned = true;
        for page in &self.frames {
            let pins = page.pin_count();
            if pins != 0 {
                warn!(page_id = page.page_id(), pins, "page still pinned");
                all_unpinned = false;
            }
        }
        all_unpinned
    }
}
