//! Tuple-level lock manager using wait-die to prevent deadlocks: a younger
//! requester never waits behind a younger-or-equal holder, it dies instead.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::transaction::{Transaction, TransactionState};
use crate::{Rid, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
    /// A shared holder waiting to become exclusive.
    Upgrading,
}

/// Every failure has already transitioned the transaction to `Aborted`; the
/// caller rolls back its own state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("transaction {0} is not in its growing phase")]
    NotGrowing(TxnId),
    #[error("transaction {0} aborted by wait-die")]
    WaitDie(TxnId),
    #[error("another transaction is already upgrading this record's lock")]
    UpgradeConflict,
    #[error("transaction {0} holds no granted shared lock to upgrade")]
    NoSharedLock(TxnId),
    #[error("unlock before commit or abort violates strict two-phase locking")]
    Strict2plViolation,
    #[error("transaction {0} holds no lock on this record")]
    NotHeld(TxnId),
}

struct TxItemState {
    mode: LockMode,
    granted: bool,
}

/// One queue entry. Waiters park on the item's own condition variable until a
/// release grants them.
struct TxItem {
    tid: TxnId,
    state: Mutex<TxItemState>,
    cv: Condvar,
}

impl TxItem {
    fn new(tid: TxnId, mode: LockMode, granted: bool) -> Self {
        Self {
            tid,
            state: Mutex::new(TxItemState { mode, granted }),
            cv: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut state = self.state.lock();
        while !state.granted {
            self.cv.wait(&mut state);
        }
    }

    fn granted(&self) -> bool {
        self.state.lock().granted
    }

    fn mode(&self) -> LockMode {
        self.state.lock().mode
    }

    fn is_granted_shared(&self) -> bool {
        let state = self.state.lock();
        state.granted && state.mode == LockMode::Shared
    }

    /// Grants the item, promoting an upgrader to exclusive. Returns the mode
    /// after promotion so the release walk knows whether to keep granting.
    fn grant(&self, has_upgrading: &mut bool) -> LockMode {
        let mut state = self.state.lock();
        state.granted = true;
        if state.mode == LockMode::Upgrading {
            *has_upgrading = false;
            state.mode = LockMode::Exclusive;
        }
        self.cv.notify_one();
        state.mode
    }
}

#[derive(Default)]
struct TxListInner {
    items: Vec<Arc<TxItem>>,
    has_upgrading: bool,
}

#[derive(Default)]
struct TxList {
    inner: Mutex<TxListInner>,
}

/// Per-record FIFO lock queues. The top-level mutex only locates or creates a
/// queue; each queue has its own mutex governing edits, so waits on one record
/// never block traffic on another.
pub struct LockManager {
    strict_2pl: bool,
    table: Mutex<HashMap<Rid, Arc<TxList>>>,
}

impl LockManager {
    pub fn new(strict_2pl: bool) -> Self {
        Self {
            strict_2pl,
            table: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_shared(&self, txn: &Transaction, rid: Rid) -> Result<(), LockError> {
        self.lock_template(txn, rid, LockMode::Shared)
    }

    pub fn lock_exclusive(&self, txn: &Transaction, rid: Rid) -> Result<(), LockError> {
        self.lock_template(txn, rid, LockMode::Exclusive)
    }

    /// Promotes the caller's granted shared lock to exclusive, waiting behind
    /// any older holders.
    pub fn lock_upgrade(&self, txn: &Transaction, rid: Rid) -> Result<(), LockError> {
        self.lock_template(txn, rid, LockMode::Upgrading)
    }

    fn lock_template(&self, txn: &Transaction, rid: Rid, mode: LockMode) -> Result<(), LockError> {
        if txn.state() != TransactionState::Growing {
            txn.set_state(TransactionState::Aborted);
            return Err(LockError::NotGrowing(txn.id()));
        }

        let list = {
            let mut table = self.table.lock();
            Arc::clone(table.entry(rid).or_default())
        };
        let mut inner = list.inner.lock();

        let upgrading = mode == LockMode::Upgrading;
        if upgrading {
            if inner.has_upgrading {
                txn.set_state(TransactionState::Aborted);
                return Err(LockError::UpgradeConflict);
            }
            // The shared entry is removed before requeueing as an upgrader.
            let pos = inner.items.iter().position(|item| item.tid == txn.id());
            match pos {
                Some(i) if inner.items[i].is_granted_shared() => {
                    inner.items.remove(i);
                    let removed = txn.shared_lock_set().remove(&rid);
                    debug_assert!(removed, "upgrade without a tracked shared lock");
                }
                _ => {
                    txn.set_state(TransactionState::Aborted);
                    return Err(LockError::NoSharedLock(txn.id()));
                }
            }
        }

        let can_grant = match inner.items.last() {
            None => true,
            Some(last) => mode == LockMode::Shared && last.is_granted_shared(),
        };

        if !can_grant {
            // Wait-die: only wait behind a younger tail if we are older.
            let tail = inner.items.last().expect("non-empty queue");
            if tail.tid < txn.id() {
                txn.set_state(TransactionState::Aborted);
                return Err(LockError::WaitDie(txn.id()));
            }
        }

        let effective_mode = if upgrading && can_grant {
            LockMode::Exclusive
        } else {
            mode
        };
        let item = Arc::new(TxItem::new(txn.id(), effective_mode, can_grant));
        inner.items.push(Arc::clone(&item));
        if !can_grant {
            inner.has_upgrading |= upgrading;
            drop(inner);
            item.wait();
        }

        if effective_mode == LockMode::Shared {
            txn.shared_lock_set().insert(rid);
        } else {
            txn.exclusive_lock_set().insert(rid);
        }
        Ok(())
    }

    /// Releases the caller's lock on `rid` and grants the longest FIFO prefix
    /// of waiters the released lock unblocks.
    pub fn unlock(&self, txn: &Transaction, rid: Rid) -> Result<(), LockError> {
        if self.strict_2pl {
            if !matches!(
                txn.state(),
                TransactionState::Committed | TransactionState::Aborted
            ) {
                txn.set_state(TransactionState::Aborted);
                return Err(LockError::Strict2plViolation);
            }
        } else if txn.state() == TransactionState::Growing {
            txn.set_state(TransactionState::Shrinking);
        }

        let mut table = self.table.lock();
        let Some(list) = table.get(&rid).cloned() else {
            txn.set_state(TransactionState::Aborted);
            return Err(LockError::NotHeld(txn.id()));
        };
        let mut inner = list.inner.lock();

        let Some(pos) = inner.items.iter().position(|item| item.tid == txn.id()) else {
            txn.set_state(TransactionState::Aborted);
            return Err(LockError::NotHeld(txn.id()));
        };
        let item = inner.items.remove(pos);
        let removed = if item.mode() == LockMode::Shared {
            txn.shared_lock_set().remove(&rid)
        } else {
            txn.exclusive_lock_set().remove(&rid)
        };
        debug_assert!(removed, "unlock without a tracked lock");

        if inner.items.is_empty() {
            table.remove(&rid);
            return Ok(());
        }
        drop(table);

        // Grant from the head: consecutive shared waiters all go, the first
        // exclusive (or promoted upgrader) goes alone.
        let TxListInner {
            items,
            has_upgrading,
        } = &mut *inner;
        for item in items.iter() {
            if item.granted() {
                break;
            }
            if item.grant(has_upgrading) != LockMode::Shared {
                break;
            }
        }
        Ok(())
    }
}
