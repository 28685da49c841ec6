use std::cell::UnsafeCell;

use parking_lot::lock_api::RawRwLock as RawRwLockApi;
use parking_lot::{Mutex, RawRwLock};

use crate::{Lsn, PageId, INVALID_LSN, INVALID_PAGE_ID, PAGE_SIZE};

#[derive(Debug, Clone, Copy)]
struct PageMeta {
    page_id: PageId,
    pin_count: i32,
    is_dirty: bool,
    lsn: Lsn,
}

/// An in-memory frame: a raw page buffer plus bookkeeping. The buffer is
/// guarded by a reader-writer latch that is taken and released explicitly,
/// because B+Tree crabbing holds latches across call boundaries and releases
/// them in bulk from the transaction's page set. Metadata lives behind its own
/// mutex and is mutated by the buffer pool under the pool latch.
pub struct Page {
    meta: Mutex<PageMeta>,
    latch: RawRwLock,
    data: UnsafeCell<[u8; PAGE_SIZE]>,
}

// The data buffer is only touched while holding the page latch (tree code) or
// while the frame is unpinned and owned by the buffer pool (load/evict), so
// sharing frames across threads is sound.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    pub fn new() -> Self {
        Self {
            meta: Mutex::new(PageMeta {
                page_id: INVALID_PAGE_ID,
                pin_count: 0,
                is_dirty: false,
                lsn: INVALID_LSN,
            }),
            latch: RawRwLock::INIT,
            data: UnsafeCell::new([0; PAGE_SIZE]),
        }
    }

    pub fn rlatch(&self) {
        self.latch.lock_shared();
    }

    pub fn runlatch(&self) {
        // Safety: paired with a prior rlatch by the same holder.
        unsafe { self.latch.unlock_shared() }
    }

    pub fn wlatch(&self) {
        self.latch.lock_exclusive();
    }

    pub fn wunlatch(&self) {
        // Safety: paired with a prior wlatch by the same holder.
        unsafe { self.latch.unlock_exclusive() }
    }

    /// Read access to the raw page bytes. Callers hold the read or write
    /// latch, or own the frame exclusively through the buffer pool.
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        unsafe { &*self.data.get() }
    }

    /// Write access to the raw page bytes. Callers hold the write latch, or
    /// own the frame exclusively through the buffer pool.
    #[allow(clippy::mut_from_ref)]
    pub fn data_mut(&self) -> &mut [u8; PAGE_SIZE] {
        unsafe { &mut *self.data.get() }
    }

    pub fn reset_memory(&self) {
        self.data_mut().fill(0);
    }

    pub fn page_id(&self) -> PageId {
        self.meta.lock().page_id
    }

    pub fn set_page_id(&self, page_id: PageId) {
        self.meta.lock().page_id = page_id;
    }

    pub fn pin_count(&self) -> i32 {
        self.meta.lock().pin_count
    }

    pub fn set_pin_count(&self, pin_count: i32) {
        self.meta.lock().pin_count = pin_count;
    }

    /// Bumps the pin count and returns the new value.
    pub fn incr_pin(&self) -> i32 {
        let mut meta = self.meta.lock();
        meta.pin_count += 1;
        meta.pin_count
    }

    /// Drops the pin count and returns the new value.
    pub fn decr_pin(&self) -> i32 {
        let mut meta = self.meta.lock();
        meta.pin_count -= 1;
        meta.pin_count
    }

    pub fn is_dirty(&self) -> bool {
        self.meta.lock().is_dirty
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.meta.lock().is_dirty = dirty;
    }

    /// ORs `dirty` into the flag; a clean unpin never clears earlier writes.
    pub fn or_dirty(&self, dirty: bool) {
        let mut meta = self.meta.lock();
        meta.is_dirty |= dirty;
    }

    /// LSN of the last log record applied to this page.
    pub fn lsn(&self) -> Lsn {
        self.meta.lock().lsn
    }

    pub fn set_lsn(&self, lsn: Lsn) {
        self.meta.lock().lsn = lsn;
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}
