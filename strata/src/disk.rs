use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::{PageId, PAGE_SIZE};

/// Owns the two file handles of the engine: the paged data file and the
/// append-only log file. The log file name is derived from the data file stem
/// (`foo.db` -> `foo.log`).
pub struct DiskManager {
    db_io: Mutex<File>,
    log_io: Mutex<File>,
    log_path: PathBuf,
    next_page_id: AtomicI32,
    num_flushes: AtomicU32,
    flush_in_progress: AtomicBool,
}

impl DiskManager {
    pub fn new<P: AsRef<Path>>(db_path: P) -> io::Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            create_dir_all(parent)?;
        }
        let log_path = db_path.with_extension("log");

        let db_io = Self::open_rw(db_path)?;
        let log_io = Self::open_rw(&log_path)?;

        let file_size = db_io.metadata()?.len();
        let next_page_id = (file_size / PAGE_SIZE as u64) as PageId;
        debug!(?db_path, file_size, next_page_id, "opened database file");

        Ok(Self {
            db_io: Mutex::new(db_io),
            log_io: Mutex::new(log_io),
            log_path,
            next_page_id: AtomicI32::new(next_page_id),
            num_flushes: AtomicU32::new(0),
            flush_in_progress: AtomicBool::new(false),
        })
    }

    fn open_rw(path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
    }

    /// Writes one page at its offset and syncs. I/O errors are logged and
    /// swallowed; the caller has no meaningful retry for this engine.
    pub fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) {
        let offset = page_id as u64 * PAGE_SIZE as u64;
        let mut db_io = self.db_io.lock();
        let res = db_io
            .seek(SeekFrom::Start(offset))
            .and_then(|_| db_io.write_all(data))
            .and_then(|_| db_io.flush());
        if let Err(e) = res {
            error!(page_id, %e, "I/O error while writing page");
        }
    }

    /// Reads one page into `data`. Reading past end-of-file is not an error:
    /// whatever the file does not cover is zero-filled.
    pub fn read_page(&self, page_id: PageId, data: &mut [u8; PAGE_SIZE]) {
        let offset = page_id as u64 * PAGE_SIZE as u64;
        let mut db_io = self.db_io.lock();
        let file_size = db_io.metadata().map(|m| m.len()).unwrap_or(0);
        if offset >= file_size {
            data.fill(0);
            return;
        }
        let res = db_io
            .seek(SeekFrom::Start(offset))
            .and_then(|_| read_upto(&mut *db_io, data));
        match res {
            Ok(n) if n < PAGE_SIZE => {
                debug!(page_id, read = n, "read less than a page, zeroing rest");
                data[n..].fill(0);
            }
            Ok(_) => {}
            Err(e) => error!(page_id, %e, "I/O error while reading page"),
        }
    }

    /// Vends the next page id. Space is never reclaimed, so this is a bare
    /// counter seeded from the file length at open.
    pub fn allocate_page(&self) -> PageId {
        self.next_page_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn deallocate_page(&self, _page_id: PageId) {}

    /// Pages handed out so far (deallocation never shrinks this).
    pub fn num_allocated_pages(&self) -> PageId {
        self.next_page_id.load(Ordering::SeqCst)
    }

    /// Appends `log_data` to the log file and syncs before returning. A
    /// zero-length write is a no-op; anything else counts as one flush. The
    /// log manager serializes callers, so at most one flush is in flight.
    pub fn write_log(&self, log_data: &[u8]) {
        if log_data.is_empty() {
            return;
        }
        self.flush_in_progress.store(true, Ordering::SeqCst);
        self.num_flushes.fetch_add(1, Ordering::SeqCst);
        let mut log_io = self.log_io.lock();
        let res = log_io
            .seek(SeekFrom::End(0))
            .and_then(|_| log_io.write_all(log_data))
            .and_then(|_| log_io.flush());
        if let Err(e) = res {
            error!(%e, "I/O error while writing log");
        }
        self.flush_in_progress.store(false, Ordering::SeqCst);
    }

    /// Reads `buf.len()` bytes of log starting at `offset`. Returns false when
    /// `offset` is at or past end-of-file; short reads are zero-padded.
    pub fn read_log(&self, buf: &mut [u8], offset: u64) -> bool {
        let mut log_io = self.log_io.lock();
        let file_size = log_io.metadata().map(|m| m.len()).unwrap_or(0);
        if offset >= file_size {
            return false;
        }
        let res = log_io
            .seek(SeekFrom::Start(offset))
            .and_then(|_| read_upto(&mut *log_io, buf));
        match res {
            Ok(n) if n < buf.len() => buf[n..].fill(0),
            Ok(_) => {}
            Err(e) => error!(offset, %e, "I/O error while reading log"),
        }
        true
    }

    /// Number of completed non-empty log writes so far.
    pub fn num_flushes(&self) -> u32 {
        self.num_flushes.load(Ordering::SeqCst)
    }

    /// True while a log write is on its way to disk.
    pub fn flush_state(&self) -> bool {
        self.flush_in_progress.load(Ordering::SeqCst)
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

/// Reads until `buf` is full or EOF, returning the number of bytes read.
fn read_upto(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
