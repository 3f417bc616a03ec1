use log::{trace, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::LockManagerConfig;
use crate::error::{AbortReason, ShaleDBError, ShaleDBResult};
use crate::storage::page::RecordId;
use crate::transaction::{IsolationLevel, TableOid, Transaction, TransactionId, TransactionState};

/// The five multi-granularity lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    /// The standard multi-granularity compatibility check: may a lock in
    /// `self` be granted alongside an already granted lock in `held`?
    fn compatible_with(self, held: LockMode) -> bool {
        use LockMode::*;
        match self {
            IntentionShared => !matches!(held, Exclusive),
            IntentionExclusive => matches!(held, IntentionShared | IntentionExclusive),
            Shared => matches!(held, IntentionShared | Shared),
            SharedIntentionExclusive => matches!(held, IntentionShared),
            Exclusive => false,
        }
    }

    /// Allowed upgrade edges: IS -> {S, X, IX, SIX}, S -> {X, SIX},
    /// IX -> {X, SIX}, SIX -> {X}.
    fn upgradable_to(self, requested: LockMode) -> bool {
        use LockMode::*;
        matches!(
            (self, requested),
            (
                IntentionShared,
                Shared | Exclusive | IntentionExclusive | SharedIntentionExclusive
            ) | (Shared, Exclusive | SharedIntentionExclusive)
                | (IntentionExclusive, Exclusive | SharedIntentionExclusive)
                | (SharedIntentionExclusive, Exclusive)
        )
    }

    fn is_intention(self) -> bool {
        use LockMode::*;
        matches!(
            self,
            IntentionShared | IntentionExclusive | SharedIntentionExclusive
        )
    }
}

#[derive(Debug, Clone)]
struct LockRequest {
    txn: Arc<Transaction>,
    mode: LockMode,
    oid: TableOid,
    rid: Option<RecordId>,
    granted: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    requests: VecDeque<LockRequest>,
    // txn currently upgrading its lock on this resource, if any
    upgrading: Option<TransactionId>,
}

#[derive(Debug, Default)]
struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

#[derive(Debug, Default)]
struct LockMaps {
    table_lock_map: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_lock_map: Mutex<HashMap<RecordId, Arc<LockRequestQueue>>>,
}

#[derive(Default)]
struct DetectorShutdown {
    stopped: Mutex<bool>,
    cv: Condvar,
}

/// Hierarchical table/row lock manager with strict two-phase locking.
///
/// Each resource keeps a FIFO queue of requests guarded by its own mutex
/// and condition variable; an upgrade slots in right behind the granted
/// prefix, ahead of the other waiters. A background thread periodically
/// rebuilds the waits-for graph from the queues and aborts the youngest
/// member of every cycle it finds.
pub struct LockManager {
    maps: Arc<LockMaps>,
    shutdown: Arc<DetectorShutdown>,
    detector: Option<JoinHandle<()>>,
}

impl LockManager {
    pub fn new(config: LockManagerConfig) -> Self {
        let maps = Arc::new(LockMaps::default());
        let shutdown = Arc::new(DetectorShutdown::default());
        let detector = {
            let maps = maps.clone();
            let shutdown = shutdown.clone();
            let interval = config.cycle_detection_interval;
            std::thread::spawn(move || Self::run_cycle_detection(maps, shutdown, interval))
        };
        Self {
            maps,
            shutdown,
            detector: Some(detector),
        }
    }

    /// Acquires (or upgrades to) a table lock in `mode`. Blocks until the
    /// lock is granted; returns `Ok(false)` when the transaction was
    /// aborted while waiting.
    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> ShaleDBResult<bool> {
        self.check_lock_permitted(txn, mode)?;
        let queue = {
            let mut map = self.maps.table_lock_map.lock();
            map.entry(oid).or_default().clone()
        };
        let request = LockRequest {
            txn: txn.clone(),
            mode,
            oid,
            rid: None,
            granted: false,
        };
        self.acquire(txn, &queue, request)
    }

    /// Releases the table lock held by `txn`. All of the transaction's row
    /// locks on the table must already be gone.
    pub fn unlock_table(&self, txn: &Arc<Transaction>, oid: TableOid) -> ShaleDBResult<bool> {
        let queue = {
            let map = self.maps.table_lock_map.lock();
            map.get(&oid).cloned()
        };
        let Some(queue) = queue else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        if txn.holds_row_locks_on(oid) {
            return Err(self.abort(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }
        self.release(txn, &queue, |request| request.rid.is_none())
    }

    /// Acquires (or upgrades to) a row lock. Intention modes are rejected
    /// outright, and the transaction must already hold an appropriate lock
    /// on the owning table.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: RecordId,
    ) -> ShaleDBResult<bool> {
        if mode.is_intention() {
            return Err(self.abort(txn, AbortReason::AttemptedIntentionLockOnRow));
        }
        self.check_lock_permitted(txn, mode)?;
        match mode {
            LockMode::Exclusive => {
                if !txn.is_table_exclusive_locked(oid)
                    && !txn.is_table_intention_exclusive_locked(oid)
                    && !txn.is_table_shared_intention_exclusive_locked(oid)
                {
                    return Err(self.abort(txn, AbortReason::TableLockNotPresent));
                }
            }
            _ => {
                if !txn.is_table_locked(oid) {
                    return Err(self.abort(txn, AbortReason::TableLockNotPresent));
                }
            }
        }
        let queue = {
            let mut map = self.maps.row_lock_map.lock();
            map.entry(rid).or_default().clone()
        };
        let request = LockRequest {
            txn: txn.clone(),
            mode,
            oid,
            rid: Some(rid),
            granted: false,
        };
        self.acquire(txn, &queue, request)
    }

    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: RecordId,
    ) -> ShaleDBResult<bool> {
        let queue = {
            let map = self.maps.row_lock_map.lock();
            map.get(&rid).cloned()
        };
        let Some(queue) = queue else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        self.release(txn, &queue, |request| {
            request.rid == Some(rid) && request.oid == oid
        })
    }

    /// Releases every lock the transaction still holds, rows before tables
    /// so the row-lock guard never trips. No state transitions and no abort
    /// errors: this is the commit/abort cleanup path, not a protocol
    /// operation.
    pub fn release_all_locks(&self, txn: &Arc<Transaction>) {
        let row_locks: Vec<RecordId> = txn
            .shared_row_lock_set()
            .into_values()
            .chain(txn.exclusive_row_lock_set().into_values())
            .flatten()
            .collect();
        for rid in row_locks {
            let queue = {
                let map = self.maps.row_lock_map.lock();
                map.get(&rid).cloned()
            };
            if let Some(queue) = queue {
                Self::force_release(&queue, txn.id());
            }
        }

        let table_locks: Vec<TableOid> = txn
            .shared_table_lock_set()
            .into_iter()
            .chain(txn.exclusive_table_lock_set())
            .chain(txn.intention_shared_table_lock_set())
            .chain(txn.intention_exclusive_table_lock_set())
            .chain(txn.shared_intention_exclusive_table_lock_set())
            .collect();
        for oid in table_locks {
            let queue = {
                let map = self.maps.table_lock_map.lock();
                map.get(&oid).cloned()
            };
            if let Some(queue) = queue {
                Self::force_release(&queue, txn.id());
            }
        }
    }

    fn force_release(queue: &Arc<LockRequestQueue>, txn_id: TransactionId) {
        let mut state = queue.state.lock();
        if let Some(pos) = state.requests.iter().position(|r| r.txn.id() == txn_id) {
            if let Some(request) = state.requests.remove(pos) {
                Self::remove_from_lock_sets(&request);
            }
            if state.upgrading == Some(txn_id) {
                state.upgrading = None;
            }
            queue.cv.notify_all();
        }
    }

    /// Isolation-level gate applied before any request is queued.
    ///
    /// REPEATABLE_READ allows nothing while shrinking; READ_COMMITTED still
    /// allows IS and S; READ_UNCOMMITTED never allows shared modes and
    /// takes X/IX only while growing.
    fn check_lock_permitted(&self, txn: &Arc<Transaction>, mode: LockMode) -> ShaleDBResult<()> {
        use LockMode::*;
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                if matches!(mode, Shared | IntentionShared | SharedIntentionExclusive) {
                    return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
                }
                if txn.state() == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if txn.state() == TransactionState::Shrinking
                    && !matches!(mode, IntentionShared | Shared)
                {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::RepeatableRead => {
                if txn.state() == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    /// Queues the request (or turns it into an upgrade) and waits on the
    /// queue's condition variable until it can be granted. A waiter that
    /// notices its transaction was aborted cleans itself up and reports
    /// failure.
    fn acquire(
        &self,
        txn: &Arc<Transaction>,
        queue: &Arc<LockRequestQueue>,
        request: LockRequest,
    ) -> ShaleDBResult<bool> {
        let txn_id = txn.id();
        let mode = request.mode;
        let mut state = queue.state.lock();

        let mut upgrade = false;
        if let Some(pos) = state
            .requests
            .iter()
            .position(|r| r.txn.id() == txn_id)
        {
            let held = state.requests[pos].mode;
            if held == mode {
                return Ok(true);
            }
            if state.upgrading.is_some() {
                drop(state);
                return Err(self.abort(txn, AbortReason::UpgradeConflict));
            }
            if !held.upgradable_to(mode) {
                drop(state);
                return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
            }
            // drop the old grant and its book-keeping, then slot the
            // upgrade in right before the first waiter
            if let Some(old) = state.requests.remove(pos) {
                Self::remove_from_lock_sets(&old);
            }
            let insert_at = state
                .requests
                .iter()
                .position(|r| !r.granted)
                .unwrap_or(state.requests.len());
            state.requests.insert(insert_at, request);
            state.upgrading = Some(txn_id);
            upgrade = true;
        } else {
            state.requests.push_back(request);
        }

        while !Self::grantable(&state, txn_id) {
            trace!("txn {} waiting for {:?} lock", txn_id, mode);
            queue.cv.wait(&mut state);
            if txn.state() == TransactionState::Aborted {
                if let Some(pos) = state.requests.iter().position(|r| r.txn.id() == txn_id) {
                    state.requests.remove(pos);
                }
                if state.upgrading == Some(txn_id) {
                    state.upgrading = None;
                }
                queue.cv.notify_all();
                return Ok(false);
            }
        }

        if upgrade {
            state.upgrading = None;
        }
        if let Some(request) = state
            .requests
            .iter_mut()
            .find(|r| r.txn.id() == txn_id)
        {
            request.granted = true;
            Self::insert_into_lock_sets(request);
        }
        trace!("txn {} granted {:?} lock", txn_id, mode);
        // anything weaker than X may admit further waiters
        if mode != LockMode::Exclusive {
            queue.cv.notify_all();
        }
        Ok(true)
    }

    /// Walks the queue front to back: every granted request ahead of ours
    /// must be compatible, and no other waiter may sit in front of us.
    fn grantable(state: &QueueState, txn_id: TransactionId) -> bool {
        let Some(request) = state.requests.iter().find(|r| r.txn.id() == txn_id) else {
            return false;
        };
        for other in &state.requests {
            if other.granted {
                if other.txn.id() != txn_id && !request.mode.compatible_with(other.mode) {
                    return false;
                }
            } else {
                return other.txn.id() == txn_id;
            }
        }
        false
    }

    fn release(
        &self,
        txn: &Arc<Transaction>,
        queue: &Arc<LockRequestQueue>,
        matches_resource: impl Fn(&LockRequest) -> bool,
    ) -> ShaleDBResult<bool> {
        let request = {
            let mut state = queue.state.lock();
            let Some(pos) = state
                .requests
                .iter()
                .position(|r| r.txn.id() == txn.id() && r.granted && matches_resource(r))
            else {
                drop(state);
                return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
            };
            let request = state.requests.remove(pos);
            queue.cv.notify_all();
            request
        };
        let Some(request) = request else {
            return Ok(false);
        };

        // strict 2PL: releasing a real read or write lock ends the growing
        // phase, except under READ_COMMITTED where S locks are transient
        let shrinks = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(request.mode, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                request.mode == LockMode::Exclusive
            }
        };
        if shrinks
            && !matches!(
                txn.state(),
                TransactionState::Committed | TransactionState::Aborted
            )
        {
            txn.set_state(TransactionState::Shrinking);
        }
        Self::remove_from_lock_sets(&request);
        Ok(true)
    }

    fn abort(&self, txn: &Arc<Transaction>, reason: AbortReason) -> ShaleDBError {
        txn.set_state(TransactionState::Aborted);
        ShaleDBError::TransactionAbort {
            txn_id: txn.id(),
            reason,
        }
    }

    fn insert_into_lock_sets(request: &LockRequest) {
        match request.rid {
            None => request.txn.insert_table_lock(request.mode, request.oid),
            Some(rid) => request.txn.insert_row_lock(request.mode, request.oid, rid),
        }
    }

    fn remove_from_lock_sets(request: &LockRequest) {
        match request.rid {
            None => request.txn.remove_table_lock(request.mode, request.oid),
            Some(rid) => request.txn.remove_row_lock(request.mode, request.oid, rid),
        }
    }

    fn run_cycle_detection(
        maps: Arc<LockMaps>,
        shutdown: Arc<DetectorShutdown>,
        interval: Duration,
    ) {
        loop {
            {
                let mut stopped = shutdown.stopped.lock();
                if !*stopped {
                    shutdown.cv.wait_for(&mut stopped, interval);
                }
                if *stopped {
                    break;
                }
            }
            Self::detect_deadlocks(&maps);
        }
    }

    /// One detector round: rebuild the waits-for graph from every queue,
    /// then abort the youngest member of each cycle and wake the queues it
    /// was waiting on so it can clean itself up. All detector state is
    /// rebuilt from scratch every round.
    fn detect_deadlocks(maps: &LockMaps) {
        let mut graph = WaitsForGraph::default();
        let mut waiters: HashMap<TransactionId, (Arc<Transaction>, Vec<Arc<LockRequestQueue>>)> =
            HashMap::new();

        {
            let table_map = maps.table_lock_map.lock();
            let row_map = maps.row_lock_map.lock();
            for queue in table_map.values().chain(row_map.values()) {
                let state = queue.state.lock();
                let granted: Vec<TransactionId> = state
                    .requests
                    .iter()
                    .filter(|r| r.granted)
                    .map(|r| r.txn.id())
                    .collect();
                for request in state.requests.iter().filter(|r| !r.granted) {
                    let waiter_id = request.txn.id();
                    let entry = waiters
                        .entry(waiter_id)
                        .or_insert_with(|| (request.txn.clone(), Vec::new()));
                    entry.1.push(queue.clone());
                    for &holder_id in &granted {
                        if holder_id != waiter_id {
                            graph.add_edge(waiter_id, holder_id);
                        }
                    }
                }
            }
        }

        while let Some(victim_id) = graph.find_victim() {
            warn!(
                "deadlock detected, aborting youngest transaction {}",
                victim_id
            );
            if let Some((txn, queues)) = waiters.get(&victim_id) {
                txn.set_state(TransactionState::Aborted);
                for queue in queues {
                    let _state = queue.state.lock();
                    queue.cv.notify_all();
                }
            }
            graph.remove_txn(victim_id);
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        *self.shutdown.stopped.lock() = true;
        self.shutdown.cv.notify_all();
        if let Some(detector) = self.detector.take() {
            if detector.join().is_err() {
                warn!("deadlock detector thread panicked");
            }
        }
    }
}

/// Directed waits-for graph over transaction ids. An edge `a -> b` means
/// `a` is blocked behind a lock `b` holds.
#[derive(Debug, Default)]
struct WaitsForGraph {
    edges: BTreeMap<TransactionId, Vec<TransactionId>>,
}

impl WaitsForGraph {
    fn add_edge(&mut self, from: TransactionId, to: TransactionId) {
        let targets = self.edges.entry(from).or_default();
        if !targets.contains(&to) {
            targets.push(to);
        }
    }

    #[allow(dead_code)]
    fn remove_edge(&mut self, from: TransactionId, to: TransactionId) {
        if let Some(targets) = self.edges.get_mut(&from) {
            targets.retain(|&t| t != to);
        }
    }

    fn remove_txn(&mut self, txn_id: TransactionId) {
        self.edges.remove(&txn_id);
        for targets in self.edges.values_mut() {
            targets.retain(|&t| t != txn_id);
        }
    }

    #[allow(dead_code)]
    fn edge_list(&self) -> Vec<(TransactionId, TransactionId)> {
        let mut edges = Vec::new();
        for (&from, targets) in &self.edges {
            for &to in targets {
                edges.push((from, to));
            }
        }
        edges
    }

    /// Deterministic cycle search: explore from every transaction in
    /// ascending id order, following edges in ascending id order. When a
    /// back edge closes a cycle, the victim is the youngest transaction
    /// (the largest id) on the DFS stack.
    fn find_victim(&self) -> Option<TransactionId> {
        let mut nodes: BTreeSet<TransactionId> = self.edges.keys().copied().collect();
        for targets in self.edges.values() {
            nodes.extend(targets.iter().copied());
        }

        let mut safe = HashSet::new();
        for &start in &nodes {
            let mut active = HashSet::new();
            if self.dfs(start, &mut safe, &mut active) {
                return active.iter().max().copied();
            }
        }
        None
    }

    fn dfs(
        &self,
        node: TransactionId,
        safe: &mut HashSet<TransactionId>,
        active: &mut HashSet<TransactionId>,
    ) -> bool {
        if safe.contains(&node) {
            return false;
        }
        active.insert(node);
        if let Some(targets) = self.edges.get(&node) {
            let mut targets = targets.clone();
            targets.sort_unstable();
            for next in targets {
                // the active set distinguishes a back edge from a cross
                // edge into an already explored region
                if active.contains(&next) {
                    return true;
                }
                if self.dfs(next, safe, active) {
                    return true;
                }
            }
        }
        active.remove(&node);
        safe.insert(node);
        false
    }
}
