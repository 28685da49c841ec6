//! The header page (page 0) persists a small table of
//! `(index name, root page id)` records so indexes can rediscover their roots
//! across restarts.
//!
//! Layout: `[record_count: i32]` followed by fixed-width records of a
//! 32-byte NUL-padded name and a little-endian i32 root page id.

use std::sync::Arc;

use crate::buffer_pool::BufferPoolManager;
use crate::page::Page;
use crate::{PageId, HEADER_PAGE_ID, PAGE_SIZE};

const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4;
const MAX_RECORDS: usize = (PAGE_SIZE - 4) / RECORD_SIZE;

/// A typed view over a pinned header page. Callers serialize access the same
/// way they do for any other page.
pub struct HeaderPage<'a> {
    page: &'a Page,
}

impl<'a> HeaderPage<'a> {
    pub fn new(page: &'a Page) -> Self {
        Self { page }
    }

    pub fn init(&self) {
        self.page.reset_memory();
    }

    pub fn record_count(&self) -> usize {
        read_i32(self.page, 0).max(0) as usize
    }

    fn set_record_count(&self, count: usize) {
        write_i32(self.page, 0, count as i32);
    }

    /// Appends a record; false if the name is taken, too long, or the page is
    /// full.
    pub fn insert_record(&self, name: &str, root_page_id: PageId) -> bool {
        if name.len() >= NAME_SIZE || self.find_record(name).is_some() {
            return false;
        }
        let count = self.record_count();
        if count >= MAX_RECORDS {
            return false;
        }
        self.write_record(count, name, root_page_id);
        self.set_record_count(count + 1);
        true
    }

    /// Rewrites the root id of an existing record; false if absent.
    pub fn update_record(&self, name: &str, root_page_id: PageId) -> bool {
        match self.find_record(name) {
            Some(slot) => {
                write_i32(self.page, record_offset(slot) + NAME_SIZE, root_page_id);
                true
            }
            None => false,
        }
    }

    /// Removes a record, compacting the tail; false if absent.
    pub fn delete_record(&self, name: &str) -> bool {
        let Some(slot) = self.find_record(name) else {
            return false;
        };
        let count = self.record_count();
        let data = self.page.data_mut();
        data.copy_within(record_offset(slot + 1)..record_offset(count), record_offset(slot));
        self.set_record_count(count - 1);
        true
    }

    pub fn root_page_id(&self, name: &str) -> Option<PageId> {
        self.find_record(name)
            .map(|slot| read_i32(self.page, record_offset(slot) + NAME_SIZE))
    }

    fn find_record(&self, name: &str) -> Option<usize> {
        (0..self.record_count()).find(|&slot| self.record_name(slot) == name.as_bytes())
    }

    fn record_name(&self, slot: usize) -> &[u8] {
        let offset = record_offset(slot);
        let raw = &self.page.data()[offset..offset + NAME_SIZE];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
        &raw[..end]
    }

    fn write_record(&self, slot: usize, name: &str, root_page_id: PageId) {
        let offset = record_offset(slot);
        let data = self.page.data_mut();
        data[offset..offset + NAME_SIZE].fill(0);
        data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        write_i32(self.page, offset + NAME_SIZE, root_page_id);
    }
}

fn record_offset(slot: usize) -> usize {
    4 + slot * RECORD_SIZE
}

fn read_i32(page: &Page, offset: usize) -> i32 {
    let bytes: [u8; 4] = page.data()[offset..offset + 4].try_into().unwrap();
    i32::from_le_bytes(bytes)
}

fn write_i32(page: &Page, offset: usize, value: i32) {
    page.data_mut()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Allocates and zeroes page 0 on a fresh database so later allocations never
/// collide with the header. A no-op when the file already has pages.
pub fn ensure_header_page(bpm: &Arc<BufferPoolManager>) {
    if bpm.disk().num_allocated_pages() > 0 {
        return;
    }
    let (page_id, page) = bpm
        .new_page()
        .expect("buffer pool exhausted while creating the header page");
    assert_eq!(page_id, HEADER_PAGE_ID);
    HeaderPage::new(&page).init();
    bpm.unpin_page(page_id, true);
}

/// Looks up an index root recorded on the header page.
pub fn lookup_root(bpm: &Arc<BufferPoolManager>, name: &str) -> Option<PageId> {
    let page = bpm.fetch_page(HEADER_PAGE_ID)?;
    let root = HeaderPage::new(&page).root_page_id(name);
    bpm.unpin_page(HEADER_PAGE_ID, false);
    root
}
