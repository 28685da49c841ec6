use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::page::Page;
use crate::{Lsn, PageId, Rid, TxnId, INVALID_LSN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// A transaction handle. Ids double as wait-die timestamps: a smaller id is an
/// older transaction. The page set holds the frames a single tree operation
/// currently has latched, released in bulk on the operation's exit path; the
/// deleted-page set holds pages emptied by a merge, awaiting deallocation.
pub struct Transaction {
    id: TxnId,
    state: Mutex<TransactionState>,
    prev_lsn: Mutex<Lsn>,
    shared_lock_set: Mutex<HashSet<Rid>>,
    exclusive_lock_set: Mutex<HashSet<Rid>>,
    page_set: Mutex<VecDeque<Arc<Page>>>,
    deleted_page_set: Mutex<HashSet<PageId>>,
}

impl Transaction {
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            state: Mutex::new(TransactionState::Growing),
            prev_lsn: Mutex::new(INVALID_LSN),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
            page_set: Mutex::new(VecDeque::new()),
            deleted_page_set: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// LSN of this transaction's most recent log record.
    pub fn prev_lsn(&self) -> Lsn {
        *self.prev_lsn.lock()
    }

    pub fn set_prev_lsn(&self, lsn: Lsn) {
        *self.prev_lsn.lock() = lsn;
    }

    pub fn shared_lock_set(&self) -> MutexGuard<'_, HashSet<Rid>> {
        self.shared_lock_set.lock()
    }

    pub fn exclusive_lock_set(&self) -> MutexGuard<'_, HashSet<Rid>> {
        self.exclusive_lock_set.lock()
    }

    pub fn add_into_page_set(&self, page: Arc<Page>) {
        self.page_set.lock().push_back(page);
    }

    /// Removes and returns every latched page, oldest first.
    pub fn drain_page_set(&self) -> Vec<Arc<Page>> {
        self.page_set.lock().drain(..).collect()
    }

    pub fn add_into_deleted_page_set(&self, page_id: PageId) {
        self.deleted_page_set.lock().insert(page_id);
    }

    pub fn deleted_page_set(&self) -> MutexGuard<'_, HashSet<PageId>> {
        self.deleted_page_set.lock()
    }
}
