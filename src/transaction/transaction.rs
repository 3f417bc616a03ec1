use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use crate::storage::page::RecordId;
use crate::transaction::LockMode;

pub type TransactionId = u64;
pub type TableOid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// A transaction as the lock manager sees it: identity, isolation level,
/// two-phase-locking state, and the lock sets book-kept on every grant and
/// release. Larger ids belong to younger transactions.
///
/// State and lock sets sit behind mutexes because the deadlock detector
/// aborts victims from its own thread.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    lock_sets: Mutex<TransactionLockSets>,
}

#[derive(Debug, Default)]
struct TransactionLockSets {
    shared_table: HashSet<TableOid>,
    exclusive_table: HashSet<TableOid>,
    intention_shared_table: HashSet<TableOid>,
    intention_exclusive_table: HashSet<TableOid>,
    shared_intention_exclusive_table: HashSet<TableOid>,
    shared_rows: HashMap<TableOid, HashSet<RecordId>>,
    exclusive_rows: HashMap<TableOid, HashSet<RecordId>>,
}

impl Transaction {
    pub fn new(id: TransactionId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            lock_sets: Mutex::new(TransactionLockSets::default()),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    pub(crate) fn insert_table_lock(&self, mode: LockMode, oid: TableOid) {
        let mut sets = self.lock_sets.lock();
        sets.table_set_mut(mode).insert(oid);
    }

    pub(crate) fn remove_table_lock(&self, mode: LockMode, oid: TableOid) {
        let mut sets = self.lock_sets.lock();
        sets.table_set_mut(mode).remove(&oid);
    }

    pub(crate) fn insert_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut sets = self.lock_sets.lock();
        if let Some(rows) = sets.row_set_mut(mode) {
            rows.entry(oid).or_default().insert(rid);
        }
    }

    pub(crate) fn remove_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut sets = self.lock_sets.lock();
        if let Some(rows) = sets.row_set_mut(mode) {
            if let Some(rids) = rows.get_mut(&oid) {
                rids.remove(&rid);
            }
        }
    }

    /// True when the transaction holds any lock on the table, whatever the
    /// mode.
    pub fn is_table_locked(&self, oid: TableOid) -> bool {
        let sets = self.lock_sets.lock();
        sets.shared_table.contains(&oid)
            || sets.exclusive_table.contains(&oid)
            || sets.intention_shared_table.contains(&oid)
            || sets.intention_exclusive_table.contains(&oid)
            || sets.shared_intention_exclusive_table.contains(&oid)
    }

    pub fn is_table_exclusive_locked(&self, oid: TableOid) -> bool {
        self.lock_sets.lock().exclusive_table.contains(&oid)
    }

    pub fn is_table_intention_exclusive_locked(&self, oid: TableOid) -> bool {
        self.lock_sets.lock().intention_exclusive_table.contains(&oid)
    }

    pub fn is_table_shared_intention_exclusive_locked(&self, oid: TableOid) -> bool {
        self.lock_sets
            .lock()
            .shared_intention_exclusive_table
            .contains(&oid)
    }

    /// True while any row of the table is still locked; tables must not be
    /// unlocked underneath their rows.
    pub fn holds_row_locks_on(&self, oid: TableOid) -> bool {
        let sets = self.lock_sets.lock();
        sets.shared_rows.get(&oid).map_or(false, |r| !r.is_empty())
            || sets.exclusive_rows.get(&oid).map_or(false, |r| !r.is_empty())
    }

    pub fn shared_table_lock_set(&self) -> HashSet<TableOid> {
        self.lock_sets.lock().shared_table.clone()
    }

    pub fn exclusive_table_lock_set(&self) -> HashSet<TableOid> {
        self.lock_sets.lock().exclusive_table.clone()
    }

    pub fn intention_shared_table_lock_set(&self) -> HashSet<TableOid> {
        self.lock_sets.lock().intention_shared_table.clone()
    }

    pub fn intention_exclusive_table_lock_set(&self) -> HashSet<TableOid> {
        self.lock_sets.lock().intention_exclusive_table.clone()
    }

    pub fn shared_intention_exclusive_table_lock_set(&self) -> HashSet<TableOid> {
        self.lock_sets
            .lock()
            .shared_intention_exclusive_table
            .clone()
    }

    pub fn shared_row_lock_set(&self) -> HashMap<TableOid, HashSet<RecordId>> {
        self.lock_sets.lock().shared_rows.clone()
    }

    pub fn exclusive_row_lock_set(&self) -> HashMap<TableOid, HashSet<RecordId>> {
        self.lock_sets.lock().exclusive_rows.clone()
    }
}

impl TransactionLockSets {
    fn table_set_mut(&mut self, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::Shared => &mut self.shared_table,
            LockMode::Exclusive => &mut self.exclusive_table,
            LockMode::IntentionShared => &mut self.intention_shared_table,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_table,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_table,
        }
    }

    // intention modes never reach rows
    fn row_set_mut(&mut self, mode: LockMode) -> Option<&mut HashMap<TableOid, HashSet<RecordId>>> {
        match mode {
            LockMode::Shared => Some(&mut self.shared_rows),
            LockMode::Exclusive => Some(&mut self.exclusive_rows),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_set_bookkeeping() {
        let txn = Transaction::new(1, IsolationLevel::RepeatableRead);
        assert_eq!(txn.state(), TransactionState::Growing);
        assert!(!txn.is_table_locked(3));

        txn.insert_table_lock(LockMode::IntentionExclusive, 3);
        assert!(txn.is_table_locked(3));
        assert!(txn.is_table_intention_exclusive_locked(3));
        assert!(!txn.is_table_exclusive_locked(3));

        let rid = RecordId::new(1, 1);
        txn.insert_row_lock(LockMode::Exclusive, 3, rid);
        assert!(txn.holds_row_locks_on(3));
        txn.remove_row_lock(LockMode::Exclusive, 3, rid);
        assert!(!txn.holds_row_locks_on(3));

        txn.remove_table_lock(LockMode::IntentionExclusive, 3);
        assert!(!txn.is_table_locked(3));
    }
}
