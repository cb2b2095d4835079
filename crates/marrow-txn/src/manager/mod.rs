//! Transaction lifecycle: begin, commit, and undo-based abort.
//!
//! A transaction owns an append-only write set (the undo log) and the
//! set of locks it has acquired. Commit never fails: all work has
//! already been done, so it just discards the undo log and releases
//! locks. Abort replays the undo log in reverse, reversing both the
//! heap and every index through an [`UndoTarget`], then releases locks.
//!
//! ```text
//! ┌─────────┐ first lock ┌─────────┐ first unlock ┌───────────┐
//! │ Default │───────────▶│ Growing │─────────────▶│ Shrinking │
//! └─────────┘            └─────────┘              └───────────┘
//!       │                     │                         │
//!       └───────────┬─────────┴───────────┬─────────────┘
//!                commit()              abort()
//!                   │                     │
//!                   ▼                     ▼
//!             ┌───────────┐         ┌─────────┐
//!             │ Committed │         │ Aborted │
//!             └───────────┘         └─────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use marrow_common::{MarrowResult, Rid, TxnId};

use crate::lock::{LockDataId, LockManager};

/// Where a transaction sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Started, no lock taken yet.
    Default,
    /// Acquiring locks.
    Growing,
    /// Has released a lock; may not acquire new ones.
    Shrinking,
    /// Terminal: committed.
    Committed,
    /// Terminal: rolled back.
    Aborted,
}

impl TransactionState {
    /// Whether the transaction has reached a terminal state.
    pub fn is_ended(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Default => write!(f, "Default"),
            TransactionState::Growing => write!(f, "Growing"),
            TransactionState::Shrinking => write!(f, "Shrinking"),
            TransactionState::Committed => write!(f, "Committed"),
            TransactionState::Aborted => write!(f, "Aborted"),
        }
    }
}

/// What kind of mutation a write record reverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    /// A tuple was inserted; `record` is the inserted image.
    Insert,
    /// A tuple was deleted; `record` is the deleted image.
    Delete,
    /// A tuple was overwritten; `record` is the pre-update image.
    Update,
}

/// One entry of a transaction's undo log.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    /// The mutation kind.
    pub wtype: WriteType,
    /// Table the mutation hit.
    pub tab_name: String,
    /// Address of the tuple.
    pub rid: Rid,
    /// Tuple image needed to reverse the mutation.
    pub record: Bytes,
}

impl WriteRecord {
    /// Creates an undo-log entry.
    pub fn new(wtype: WriteType, tab_name: impl Into<String>, rid: Rid, record: Bytes) -> Self {
        Self {
            wtype,
            tab_name: tab_name.into(),
            rid,
            record,
        }
    }
}

struct TxnInner {
    state: TransactionState,
    write_set: Vec<WriteRecord>,
    lock_set: HashSet<LockDataId>,
    /// Reserved for redo logging; tracked but never consumed here.
    prev_lsn: u64,
}

/// A running transaction.
pub struct Transaction {
    id: TxnId,
    inner: Mutex<TxnInner>,
}

impl Transaction {
    /// Creates a transaction in the `Default` state.
    pub fn new(id: TxnId) -> Self {
        Self {
            id,
            inner: Mutex::new(TxnInner {
                state: TransactionState::Default,
                write_set: Vec::new(),
                lock_set: HashSet::new(),
                prev_lsn: 0,
            }),
        }
    }

    /// The transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// Moves the transaction to `state`.
    pub fn set_state(&self, state: TransactionState) {
        self.inner.lock().state = state;
    }

    /// Appends one undo-log entry.
    pub fn append_write_record(&self, record: WriteRecord) {
        self.inner.lock().write_set.push(record);
    }

    /// Number of undo-log entries.
    pub fn write_set_len(&self) -> usize {
        self.inner.lock().write_set.len()
    }

    /// Records an acquired lock.
    pub fn add_lock(&self, data_id: LockDataId) {
        self.inner.lock().lock_set.insert(data_id);
    }

    /// Whether the transaction holds a lock on `data_id`.
    pub fn holds_lock(&self, data_id: LockDataId) -> bool {
        self.inner.lock().lock_set.contains(&data_id)
    }

    /// Snapshot of the held locks.
    pub fn lock_set(&self) -> Vec<LockDataId> {
        self.inner.lock().lock_set.iter().copied().collect()
    }

    /// LSN of this transaction's latest log record (reserved for redo).
    pub fn prev_lsn(&self) -> u64 {
        self.inner.lock().prev_lsn
    }

    /// Updates the reserved LSN cursor.
    pub fn set_prev_lsn(&self, lsn: u64) {
        self.inner.lock().prev_lsn = lsn;
    }

    /// Drops every recorded lock after release.
    pub fn clear_lock_set(&self) {
        self.inner.lock().lock_set.clear();
    }

    fn take_write_set(&self) -> Vec<WriteRecord> {
        std::mem::take(&mut self.inner.lock().write_set)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("writes", &inner.write_set.len())
            .field("locks", &inner.lock_set.len())
            .finish()
    }
}

/// The storage-side operations abort needs to reverse a write.
///
/// Implemented by the system manager, which owns the heap files and
/// index handles; keeping it a trait seam keeps this crate free of any
/// dependency on the storage registries.
pub trait UndoTarget {
    /// Reverses an insert: delete the tuple at `rid` and remove the
    /// matching key from every index, built from `record`.
    fn undo_insert(&self, tab_name: &str, rid: Rid, record: &[u8]) -> MarrowResult<()>;

    /// Reverses a delete: re-insert `record` at its original `rid` and
    /// put the matching key back into every index.
    fn undo_delete(&self, tab_name: &str, rid: Rid, record: &[u8]) -> MarrowResult<()>;

    /// Reverses an update: restore the pre-image `record` at `rid`; for
    /// every index drop the post-update key and re-insert the pre-update
    /// key.
    fn undo_update(&self, tab_name: &str, rid: Rid, record: &[u8]) -> MarrowResult<()>;
}

/// Counters exposed by the transaction manager.
#[derive(Debug, Default)]
pub struct TransactionStats {
    /// Transactions begun.
    pub started: AtomicU64,
    /// Transactions committed.
    pub committed: AtomicU64,
    /// Transactions aborted.
    pub aborted: AtomicU64,
}

/// Allocates transaction ids and drives commit and abort.
pub struct TransactionManager {
    next_txn_id: AtomicU64,
    lock_mgr: Arc<LockManager>,
    txns: RwLock<HashMap<TxnId, Arc<Transaction>>>,
    stats: TransactionStats,
}

impl TransactionManager {
    /// Creates a transaction manager over a lock manager.
    pub fn new(lock_mgr: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU64::new(1),
            lock_mgr,
            txns: RwLock::new(HashMap::new()),
            stats: TransactionStats::default(),
        }
    }

    /// The lock manager transactions acquire from.
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_mgr
    }

    /// Transaction-manager counters.
    pub fn stats(&self) -> &TransactionStats {
        &self.stats
    }

    /// Starts a new transaction and registers it in the global table.
    pub fn begin(&self) -> Arc<Transaction> {
        let id = TxnId::new(self.next_txn_id.fetch_add(1, AtomicOrdering::SeqCst));
        let txn = Arc::new(Transaction::new(id));
        self.txns.write().insert(id, Arc::clone(&txn));
        self.stats.started.fetch_add(1, AtomicOrdering::Relaxed);
        tracing::debug!(txn = %id, "begin");
        txn
    }

    /// Looks up a registered transaction.
    pub fn get(&self, id: TxnId) -> Option<Arc<Transaction>> {
        self.txns.read().get(&id).cloned()
    }

    /// Commits: discard the undo log, release every lock, enter
    /// `Committed`. Idempotent on an already-committed transaction.
    pub fn commit(&self, txn: &Transaction) -> MarrowResult<()> {
        if txn.state().is_ended() {
            return Ok(());
        }
        txn.take_write_set();
        for data_id in txn.lock_set() {
            self.lock_mgr.unlock(txn, data_id)?;
        }
        txn.clear_lock_set();
        txn.set_state(TransactionState::Committed);
        self.stats.committed.fetch_add(1, AtomicOrdering::Relaxed);
        tracing::debug!(txn = %txn.id(), "commit");
        Ok(())
    }

    /// Aborts: replay the undo log in reverse through `target`, release
    /// every lock, enter `Aborted`. A second abort is a no-op.
    pub fn abort(&self, txn: &Transaction, target: &dyn UndoTarget) -> MarrowResult<()> {
        if txn.state().is_ended() {
            return Ok(());
        }
        let write_set = txn.take_write_set();
        for record in write_set.iter().rev() {
            match record.wtype {
                WriteType::Insert => {
                    target.undo_insert(&record.tab_name, record.rid, &record.record)?
                }
                WriteType::Delete => {
                    target.undo_delete(&record.tab_name, record.rid, &record.record)?
                }
                WriteType::Update => {
                    target.undo_update(&record.tab_name, record.rid, &record.record)?
                }
            }
        }
        for data_id in txn.lock_set() {
            self.lock_mgr.unlock(txn, data_id)?;
        }
        txn.clear_lock_set();
        txn.set_state(TransactionState::Aborted);
        self.stats.aborted.fetch_add(1, AtomicOrdering::Relaxed);
        tracing::debug!(txn = %txn.id(), undone = write_set.len(), "abort");
        Ok(())
    }
}
