//! Multi-granularity two-phase locking without waiting.
//!
//! Lockable resources form a two-level hierarchy: tables (keyed by heap
//! file descriptor) and records (keyed by file descriptor plus [`Rid`]).
//! Tables take the full IS / IX / S / SIX / X mode set; records only
//! ever take S and X.
//!
//! # Compatibility (rows acquire, columns hold)
//!
//! ```text
//!        │ IS │ IX │ S  │ SIX │ X
//! ───────┼────┼────┼────┼─────┼───
//!   IS   │ ✓  │ ✓  │ ✓  │ ✓   │ ✗
//!   IX   │ ✓  │ ✓  │ ✗  │ ✗   │ ✗
//!   S    │ ✓  │ ✗  │ ✓  │ ✗   │ ✗
//!   SIX  │ ✓  │ ✗  │ ✗  │ ✗   │ ✗
//!   X    │ ✗  │ ✗  │ ✗  │ ✗   │ ✗
//! ```
//!
//! There is no wait queue. A request that conflicts with a lock held by
//! another transaction aborts the *requesting* transaction immediately,
//! so no transaction ever waits and no deadlock cycle can form. Liveness
//! is traded for a higher abort rate under contention.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use parking_lot::Mutex;

use marrow_common::{AbortReason, MarrowError, MarrowResult, Rid, TxnId};

use crate::manager::{Transaction, TransactionState};

/// Lock mode held by a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Intention shared: record S locks will be taken below.
    IntentionShared,
    /// Intention exclusive: record X locks will be taken below.
    IntentionExclusive,
    /// Shared.
    Shared,
    /// Shared with intention exclusive.
    SharedIntentionExclusive,
    /// Exclusive.
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::IntentionShared => write!(f, "IS"),
            LockMode::IntentionExclusive => write!(f, "IX"),
            LockMode::Shared => write!(f, "S"),
            LockMode::SharedIntentionExclusive => write!(f, "SIX"),
            LockMode::Exclusive => write!(f, "X"),
        }
    }
}

/// Least upper bound of all granted modes on one data id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum GroupLockMode {
    NonLock,
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl GroupLockMode {
    /// Folds one more granted mode into the group mode.
    fn join(self, mode: LockMode) -> Self {
        use GroupLockMode as G;
        use LockMode as L;
        match (self, mode) {
            (_, L::Exclusive) | (G::Exclusive, _) => G::Exclusive,
            (G::SharedIntentionExclusive, _) | (_, L::SharedIntentionExclusive) => {
                G::SharedIntentionExclusive
            }
            (G::Shared, L::IntentionExclusive) | (G::IntentionExclusive, L::Shared) => {
                G::SharedIntentionExclusive
            }
            (G::Shared, _) | (_, L::Shared) => G::Shared,
            (G::IntentionExclusive, _) | (_, L::IntentionExclusive) => G::IntentionExclusive,
            _ => G::IntentionShared,
        }
    }
}

/// Identity of a lockable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockDataId {
    /// A whole table, keyed by its heap file descriptor.
    Table(i32),
    /// One record of a table.
    Record(i32, Rid),
}

impl fmt::Display for LockDataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockDataId::Table(fd) => write!(f, "table {fd}"),
            LockDataId::Record(fd, rid) => write!(f, "record {fd}:{rid}"),
        }
    }
}

/// One granted request in a data id's queue.
#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
}

/// Per-data-id lock bookkeeping.
#[derive(Debug, Default)]
struct LockQueue {
    requests: Vec<LockRequest>,
    group_mode: Option<GroupLockMode>,
}

impl LockQueue {
    fn recompute_group(&mut self) {
        self.group_mode = (!self.requests.is_empty()).then(|| {
            self.requests
                .iter()
                .fold(GroupLockMode::NonLock, |g, r| g.join(r.mode))
        });
    }

    fn own(&self, txn_id: TxnId) -> Option<usize> {
        self.requests.iter().position(|r| r.txn_id == txn_id)
    }

    fn conflicts_with_other(&self, txn_id: TxnId, incompatible: &[LockMode]) -> bool {
        self.requests
            .iter()
            .any(|r| r.txn_id != txn_id && incompatible.contains(&r.mode))
    }
}

/// Counters exposed by the lock manager.
#[derive(Debug, Default)]
pub struct LockStats {
    /// Locks granted (including upgrades).
    pub granted: AtomicU64,
    /// In-place mode upgrades.
    pub upgrades: AtomicU64,
    /// Requests refused by deadlock prevention.
    pub prevented: AtomicU64,
    /// Unlock calls that removed at least one request.
    pub released: AtomicU64,
}

/// The lock table. One global mutex guards all queues; it is held only
/// for the duration of one acquire or release.
pub struct LockManager {
    table: Mutex<HashMap<LockDataId, LockQueue>>,
    stats: LockStats,
}

/// Ambient per-operation context handed to executors: the transaction
/// doing the work and the lock manager it acquires locks from.
pub struct Context<'a> {
    /// The lock manager.
    pub lock_mgr: &'a LockManager,
    /// The running transaction.
    pub txn: &'a Transaction,
}

impl LockManager {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            stats: LockStats::default(),
        }
    }

    /// Lock-manager counters.
    pub fn stats(&self) -> &LockStats {
        &self.stats
    }

    /// Acquires a record-level S lock.
    pub fn lock_shared_on_record(
        &self,
        txn: &Transaction,
        rid: Rid,
        tab_fd: i32,
    ) -> MarrowResult<bool> {
        self.acquire(
            txn,
            LockDataId::Record(tab_fd, rid),
            LockMode::Shared,
            &[LockMode::Exclusive],
        )
    }

    /// Acquires a record-level X lock, upgrading an own S lock.
    pub fn lock_exclusive_on_record(
        &self,
        txn: &Transaction,
        rid: Rid,
        tab_fd: i32,
    ) -> MarrowResult<bool> {
        self.acquire(
            txn,
            LockDataId::Record(tab_fd, rid),
            LockMode::Exclusive,
            &[
                LockMode::IntentionShared,
                LockMode::IntentionExclusive,
                LockMode::Shared,
                LockMode::SharedIntentionExclusive,
                LockMode::Exclusive,
            ],
        )
    }

    /// Acquires a table-level S lock, upgrading own IS to S or IX to SIX.
    pub fn lock_shared_on_table(&self, txn: &Transaction, tab_fd: i32) -> MarrowResult<bool> {
        self.acquire(
            txn,
            LockDataId::Table(tab_fd),
            LockMode::Shared,
            &[
                LockMode::IntentionExclusive,
                LockMode::SharedIntentionExclusive,
                LockMode::Exclusive,
            ],
        )
    }

    /// Acquires a table-level X lock, upgrading any weaker own lock.
    pub fn lock_exclusive_on_table(&self, txn: &Transaction, tab_fd: i32) -> MarrowResult<bool> {
        self.acquire(
            txn,
            LockDataId::Table(tab_fd),
            LockMode::Exclusive,
            &[
                LockMode::IntentionShared,
                LockMode::IntentionExclusive,
                LockMode::Shared,
                LockMode::SharedIntentionExclusive,
                LockMode::Exclusive,
            ],
        )
    }

    /// Acquires a table-level IS lock.
    pub fn lock_is_on_table(&self, txn: &Transaction, tab_fd: i32) -> MarrowResult<bool> {
        self.acquire(
            txn,
            LockDataId::Table(tab_fd),
            LockMode::IntentionShared,
            &[LockMode::Exclusive],
        )
    }

    /// Acquires a table-level IX lock, upgrading own S to SIX or IS to IX.
    pub fn lock_ix_on_table(&self, txn: &Transaction, tab_fd: i32) -> MarrowResult<bool> {
        self.acquire(
            txn,
            LockDataId::Table(tab_fd),
            LockMode::IntentionExclusive,
            &[
                LockMode::Shared,
                LockMode::SharedIntentionExclusive,
                LockMode::Exclusive,
            ],
        )
    }

    /// Releases a transaction's lock on one data id, moving the
    /// transaction into its shrinking phase.
    pub fn unlock(&self, txn: &Transaction, data_id: LockDataId) -> MarrowResult<bool> {
        let mut table = self.table.lock();

        let state = txn.state();
        if state == TransactionState::Aborted || state == TransactionState::Committed {
            return Ok(false);
        }
        txn.set_state(TransactionState::Shrinking);

        if !txn.holds_lock(data_id) {
            return Ok(false);
        }
        let Some(queue) = table.get_mut(&data_id) else {
            return Ok(false);
        };
        queue.requests.retain(|r| r.txn_id != txn.id());
        queue.recompute_group();
        if queue.requests.is_empty() {
            table.remove(&data_id);
        }
        self.stats.released.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(true)
    }

    /// The shared acquire path.
    ///
    /// `incompatible` lists the modes that, held by another transaction,
    /// force the requester to abort. Requests never block: the outcome is
    /// granted, upgraded, already-held, or `DeadlockPrevention`.
    fn acquire(
        &self,
        txn: &Transaction,
        data_id: LockDataId,
        mode: LockMode,
        incompatible: &[LockMode],
    ) -> MarrowResult<bool> {
        let mut table = self.table.lock();

        if !self.check_state(txn)? {
            return Ok(false);
        }

        let queue = table.entry(data_id).or_default();
        if queue.conflicts_with_other(txn.id(), incompatible) {
            self.stats.prevented.fetch_add(1, AtomicOrdering::Relaxed);
            tracing::debug!(txn = %txn.id(), %data_id, %mode, "lock conflict, aborting requester");
            return Err(MarrowError::TransactionAborted {
                txn_id: txn.id(),
                reason: AbortReason::DeadlockPrevention,
            });
        }

        match queue.own(txn.id()) {
            Some(pos) => {
                let held = queue.requests[pos].mode;
                if let Some(upgraded) = Self::upgrade_mode(held, mode) {
                    if upgraded != held {
                        queue.requests[pos].mode = upgraded;
                        queue.recompute_group();
                        self.stats.upgrades.fetch_add(1, AtomicOrdering::Relaxed);
                    }
                    Ok(true)
                } else {
                    // The held mode already covers the request.
                    Ok(true)
                }
            }
            None => {
                queue.requests.push(LockRequest {
                    txn_id: txn.id(),
                    mode,
                });
                queue.recompute_group();
                txn.add_lock(data_id);
                self.stats.granted.fetch_add(1, AtomicOrdering::Relaxed);
                Ok(true)
            }
        }
    }

    /// The mode an own lock upgrades to when `requested` arrives, or
    /// `None` when the held mode already covers the request.
    fn upgrade_mode(held: LockMode, requested: LockMode) -> Option<LockMode> {
        use LockMode::*;
        match (held, requested) {
            // Anything weaker goes straight to X.
            (_, Exclusive) => Some(Exclusive),
            (IntentionShared, Shared) => Some(Shared),
            (IntentionShared, IntentionExclusive) => Some(IntentionExclusive),
            (IntentionExclusive, Shared) | (Shared, IntentionExclusive) => {
                Some(SharedIntentionExclusive)
            }
            _ => None,
        }
    }

    /// Applies the 2PL state rules on entry to every acquire. Growing is
    /// entered on the first lock; acquiring while shrinking aborts;
    /// terminal states fail silently.
    fn check_state(&self, txn: &Transaction) -> MarrowResult<bool> {
        match txn.state() {
            TransactionState::Shrinking => Err(MarrowError::TransactionAborted {
                txn_id: txn.id(),
                reason: AbortReason::LockOnShrinking,
            }),
            TransactionState::Aborted | TransactionState::Committed => Ok(false),
            _ => {
                txn.set_state(TransactionState::Growing);
                Ok(true)
            }
        }
    }

    /// The group mode currently recorded for a data id, for tests and
    /// introspection.
    pub fn group_mode_name(&self, data_id: LockDataId) -> Option<&'static str> {
        let table = self.table.lock();
        table.get(&data_id).and_then(|q| {
            q.group_mode.map(|g| match g {
                GroupLockMode::NonLock => "NL",
                GroupLockMode::IntentionShared => "IS",
                GroupLockMode::IntentionExclusive => "IX",
                GroupLockMode::Shared => "S",
                GroupLockMode::SharedIntentionExclusive => "SIX",
                GroupLockMode::Exclusive => "X",
            })
        })
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
