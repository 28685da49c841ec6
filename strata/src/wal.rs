//! The Write-Ahead Log: typed log records, their on-disk format, and the
//! double-buffered log manager with its background flusher.
//!
//! Appenders fill `log_buffer` while the flusher owns `flush_buffer`; the two
//! are swapped under the log mutex when the buffer fills, `LOG_TIMEOUT`
//! expires, or the buffer pool forces the log before evicting a dirty page.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;

use bytes::{Buf, BufMut};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::disk::DiskManager;
use crate::{Lsn, PageId, Rid, TxnId, INVALID_LSN, LOG_BUFFER_SIZE, LOG_TIMEOUT};

/// Process-wide switch; true only between `run_flush_thread` and the join in
/// `stop_flush_thread`.
pub static ENABLE_LOGGING: AtomicBool = AtomicBool::new(false);

pub fn logging_enabled() -> bool {
    ENABLE_LOGGING.load(Ordering::SeqCst)
}

/// Fixed header preceding every serialized record:
/// `[size, lsn, txn_id, prev_lsn, type]`, five little-endian i32 fields.
pub const LOG_HEADER_SIZE: usize = 20;

const RID_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LogRecordType {
    Invalid = 0,
    Insert = 1,
    MarkDelete = 2,
    ApplyDelete = 3,
    RollbackDelete = 4,
    Update = 5,
    NewPage = 6,
    Begin = 7,
    Commit = 8,
    Abort = 9,
}

impl LogRecordType {
    fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            0 => Self::Invalid,
            1 => Self::Insert,
            2 => Self::MarkDelete,
            3 => Self::ApplyDelete,
            4 => Self::RollbackDelete,
            5 => Self::Update,
            6 => Self::NewPage,
            7 => Self::Begin,
            8 => Self::Commit,
            9 => Self::Abort,
            _ => return None,
        })
    }
}

/// An opaque tuple image carried by data-modification records. On the wire:
/// `[length: i32, bytes]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tuple {
    pub data: Vec<u8>,
}

impl Tuple {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn serialized_size(&self) -> usize {
        4 + self.data.len()
    }

    fn serialize_to(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.data.len() as i32);
        buf.put_slice(&self.data);
    }

    fn deserialize_from(buf: &mut &[u8]) -> Option<Self> {
        if buf.remaining() < 4 {
            return None;
        }
        let len = buf.get_i32_le();
        if len < 0 || buf.remaining() < len as usize {
            return None;
        }
        let data = buf[..len as usize].to_vec();
        buf.advance(len as usize);
        Some(Self { data })
    }
}

fn serialize_rid(rid: Rid, buf: &mut impl BufMut) {
    buf.put_i32_le(rid.page_id);
    buf.put_u32_le(rid.slot);
}

fn deserialize_rid(buf: &mut &[u8]) -> Option<Rid> {
    if buf.remaining() < RID_SIZE {
        return None;
    }
    let page_id = buf.get_i32_le();
    let slot = buf.get_u32_le();
    Some(Rid { page_id, slot })
}

/// Type-specific body of a log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    /// BEGIN / COMMIT / ABORT carry no body.
    None,
    /// INSERT and the three delete variants log the affected rid and tuple.
    Tuple { rid: Rid, tuple: Tuple },
    /// UPDATE logs both images for redo and undo.
    Update {
        rid: Rid,
        old_tuple: Tuple,
        new_tuple: Tuple,
    },
    /// NEWPAGE links a freshly allocated page after its predecessor.
    NewPage {
        prev_page_id: PageId,
        page_id: PageId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub prev_lsn: Lsn,
    pub record_type: LogRecordType,
    pub payload: LogPayload,
}

impl LogRecord {
    fn new(txn_id: TxnId, prev_lsn: Lsn, record_type: LogRecordType, payload: LogPayload) -> Self {
        Self {
            lsn: INVALID_LSN,
            txn_id,
            prev_lsn,
            record_type,
            payload,
        }
    }

    pub fn begin(txn_id: TxnId) -> Self {
        Self::new(txn_id, INVALID_LSN, LogRecordType::Begin, LogPayload::None)
    }

    pub fn commit(txn_id: TxnId, prev_lsn: Lsn) -> Self {
        Self::new(txn_id, prev_lsn, LogRecordType::Commit, LogPayload::None)
    }

    pub fn abort(txn_id: TxnId, prev_lsn: Lsn) -> Self {
        Self::new(txn_id, prev_lsn, LogRecordType::Abort, LogPayload::None)
    }

    pub fn insert(txn_id: TxnId, prev_lsn: Lsn, rid: Rid, tuple: Tuple) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordType::Insert,
            LogPayload::Tuple { rid, tuple },
        )
    }

    pub fn mark_delete(txn_id: TxnId, prev_lsn: Lsn, rid: Rid, tuple: Tuple) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordType::MarkDelete,
            LogPayload::Tuple { rid, tuple },
        )
    }

    pub fn apply_delete(txn_id: TxnId, prev_lsn: Lsn, rid: Rid, tuple: Tuple) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordType::ApplyDelete,
            LogPayload::Tuple { rid, tuple },
        )
    }

    pub fn rollback_delete(txn_id: TxnId, prev_lsn: Lsn, rid: Rid, tuple: Tuple) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordType::RollbackDelete,
            LogPayload::Tuple { rid, tuple },
        )
    }

    pub fn update(
        txn_id: TxnId,
        prev_lsn: Lsn,
        rid: Rid,
        old_tuple: Tuple,
        new_tuple: Tuple,
    ) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordType::Update,
            LogPayload::Update {
                rid,
                old_tuple,
                new_tuple,
            },
        )
    }

    pub fn new_page(txn_id: TxnId, prev_lsn: Lsn, prev_page_id: PageId, page_id: PageId) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordType::NewPage,
            LogPayload::NewPage {
                prev_page_id,
                page_id,
            },
        )
    }

    /// Total serialized size, header included.
    pub fn size(&self) -> usize {
        LOG_HEADER_SIZE
            + match &self.payload {
                LogPayload::None => 0,
                LogPayload::Tuple { tuple, .. } => RID_SIZE + tuple.serialized_size(),
                LogPayload::Update {
                    old_tuple,
                    new_tuple,
                    ..
                } => RID_SIZE + old_tuple.serialized_size() + new_tuple.serialized_size(),
                LogPayload::NewPage { .. } => RID_SIZE,
            }
    }

    pub fn serialize_to(&self, mut buf: &mut [u8]) {
        debug_assert!(buf.len() >= self.size());
        buf.put_i32_le(self.size() as i32);
        buf.put_i32_le(self.lsn);
        buf.put_i32_le(self.txn_id);
        buf.put_i32_le(self.prev_lsn);
        buf.put_i32_le(self.record_type as i32);
        match &self.payload {
            LogPayload::None => {}
            LogPayload::Tuple { rid, tuple } => {
                serialize_rid(*rid, &mut buf);
                tuple.serialize_to(&mut buf);
            }
            LogPayload::Update {
                rid,
                old_tuple,
                new_tuple,
            } => {
                serialize_rid(*rid, &mut buf);
                old_tuple.serialize_to(&mut buf);
                new_tuple.serialize_to(&mut buf);
            }
            LogPayload::NewPage {
                prev_page_id,
                page_id,
            } => {
                buf.put_i32_le(*prev_page_id);
                buf.put_i32_le(*page_id);
            }
        }
    }

    /// Parses one record from the front of `data`. Returns `None` on a
    /// truncated or malformed prefix (the normal stop condition when the tail
    /// of a log buffer is zero padding).
    pub fn deserialize_from(data: &[u8]) -> Option<Self> {
        if data.len() < LOG_HEADER_SIZE {
            return None;
        }
        let mut buf = data;
        let size = buf.get_i32_le();
        let lsn = buf.get_i32_le();
        let txn_id = buf.get_i32_le();
        let prev_lsn = buf.get_i32_le();
        let record_type = LogRecordType::from_i32(buf.get_i32_le())?;
        if record_type == LogRecordType::Invalid
            || (size as usize) < LOG_HEADER_SIZE
            || data.len() < size as usize
        {
            return None;
        }

        let payload = match record_type {
            LogRecordType::Begin | LogRecordType::Commit | LogRecordType::Abort => {
                LogPayload::None
            }
            LogRecordType::Insert
            | LogRecordType::MarkDelete
            | LogRecordType::ApplyDelete
            | LogRecordType::RollbackDelete => {
                let rid = deserialize_rid(&mut buf)?;
                let tuple = Tuple::deserialize_from(&mut buf)?;
                LogPayload::Tuple { rid, tuple }
            }
            LogRecordType::Update => {
                let rid = deserialize_rid(&mut buf)?;
                let old_tuple = Tuple::deserialize_from(&mut buf)?;
                let new_tuple = Tuple::deserialize_from(&mut buf)?;
                LogPayload::Update {
                    rid,
                    old_tuple,
                    new_tuple,
                }
            }
            LogRecordType::NewPage => {
                if buf.remaining() < RID_SIZE {
                    return None;
                }
                let prev_page_id = buf.get_i32_le();
                let page_id = buf.get_i32_le();
                LogPayload::NewPage {
                    prev_page_id,
                    page_id,
                }
            }
            LogRecordType::Invalid => unreachable!(),
        };

        let record = Self {
            lsn,
            txn_id,
            prev_lsn,
            record_type,
            payload,
        };
        (record.size() == size as usize).then_some(record)
    }
}

struct LogBuffers {
    log_buffer: Box<[u8]>,
    log_offset: usize,
    flush_buffer: Box<[u8]>,
    flush_size: usize,
    last_lsn: Lsn,
}

impl LogBuffers {
    /// Hands the filled append buffer to the flusher and returns the span to
    /// write plus the LSN it makes durable.
    fn rotate(&mut self) -> (usize, Lsn) {
        mem::swap(&mut self.log_buffer, &mut self.flush_buffer);
        self.flush_size = self.log_offset;
        self.log_offset = 0;
        (self.flush_size, self.last_lsn)
    }
}

/// Double-buffered WAL manager. Appends go to the active buffer under the log
/// mutex; a background thread swaps buffers and writes the inactive one,
/// waking group-commit waiters once `persistent_lsn` advances.
pub struct LogManager {
    disk: Arc<DiskManager>,
    inner: Mutex<LogBuffers>,
    next_lsn: AtomicI32,
    persistent_lsn: AtomicI32,
    need_flush: AtomicBool,
    cv_flush: Condvar,
    cv_append: Condvar,
    flush_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl LogManager {
    pub fn new(disk: Arc<DiskManager>) -> Self {
        Self {
            disk,
            inner: Mutex::new(LogBuffers {
                log_buffer: vec![0; LOG_BUFFER_SIZE].into_boxed_slice(),
                log_offset: 0,
                flush_buffer: vec![0; LOG_BUFFER_SIZE].into_boxed_slice(),
                flush_size: 0,
                last_lsn: INVALID_LSN,
            }),
            next_lsn: AtomicI32::new(0),
            persistent_lsn: AtomicI32::new(INVALID_LSN),
            need_flush: AtomicBool::new(false),
            cv_flush: Condvar::new(),
            cv_append: Condvar::new(),
            flush_thread: Mutex::new(None),
        }
    }

    /// Largest LSN known to be on stable storage.
    pub fn persistent_lsn(&self) -> Lsn {
        self.persistent_lsn.load(Ordering::SeqCst)
    }

    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn.load(Ordering::SeqCst)
    }

    /// Serializes `record` into the active buffer, assigning its LSN. Blocks
    /// while the buffer lacks room, after kicking the flusher.
    pub fn append_log_record(&self, record: &mut LogRecord) -> Lsn {
        let size = record.size();
        assert!(size < LOG_BUFFER_SIZE, "log record larger than log buffer");

        let mut inner = self.inner.lock();
        while inner.log_offset + size >= LOG_BUFFER_SIZE {
            self.need_flush.store(true, Ordering::SeqCst);
            self.cv_flush.notify_one();
            self.cv_append.wait(&mut inner);
        }
        record.lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        let offset = inner.log_offset;
        record.serialize_to(&mut inner.log_buffer[offset..offset + size]);
        inner.log_offset = offset + size;
        inner.last_lsn = record.lsn;
        record.lsn
    }

    /// Starts the background flusher and enables logging. A no-op when the
    /// flusher is already running.
    pub fn run_flush_thread(self: &Arc<Self>) {
        if ENABLE_LOGGING.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = Arc::clone(self);
        let handle = thread::spawn(move || manager.flush_loop());
        *self.flush_thread.lock() = Some(handle);
    }

    fn flush_loop(&self) {
        while logging_enabled() {
            let mut inner = self.inner.lock();
            if !self.need_flush.load(Ordering::SeqCst) {
                let _ = self.cv_flush.wait_for(&mut inner, LOG_TIMEOUT);
            }
            debug_assert_eq!(inner.flush_size, 0);
            if inner.log_offset > 0 {
                self.write_out(&mut inner);
            }
            self.need_flush.store(false, Ordering::SeqCst);
            self.cv_append.notify_all();
        }
    }

    /// Rotates the buffers and writes the flush buffer out. Holding the log
    /// mutex across the write keeps at most one flush in flight.
    fn write_out(&self, inner: &mut LogBuffers) {
        let (size, last_lsn) = inner.rotate();
        self.disk.write_log(&inner.flush_buffer[..size]);
        inner.flush_size = 0;
        self.persistent_lsn.store(last_lsn, Ordering::SeqCst);
        debug!(last_lsn, bytes = size, "flushed log");
    }

    /// `force`: kick the flusher and wait until the pending request drains.
    /// Otherwise park until the next flush completes (group commit).
    pub fn flush(&self, force: bool) {
        let mut inner = self.inner.lock();
        if force {
            self.need_flush.store(true, Ordering::SeqCst);
            self.cv_flush.notify_one();
            if logging_enabled() {
                while self.need_flush.load(Ordering::SeqCst) {
                    self.cv_append.wait(&mut inner);
                }
            }
        } else {
            self.cv_append.wait(&mut inner);
        }
    }

    /// Disables logging, force-flushes, and joins the flusher. Both buffers
    /// are empty afterwards.
    pub fn stop_flush_thread(&self) {
        if !ENABLE_LOGGING.swap(false, Ordering::SeqCst) {
            return;
        }
        self.flush(true);
        if let Some(handle) = self.flush_thread.lock().take() {
            let _ = handle.join();
        }
        // The flusher may have observed the disabled flag before draining the
        // final records; write them out here.
        let mut inner = self.inner.lock();
        if inner.log_offset > 0 {
            self.write_out(&mut inner);
        }
        assert_eq!(inner.log_offset, 0);
        assert_eq!(inner.flush_size, 0);
    }
}
