//! Strict two-phase locking with deadlock detection.
//!
//! Rules:
//!   - Table-level granularity; the Row key variant is reserved for finer
//!     granularity and carried by the same code paths.
//!   - S/S is the only compatible pair; compatibility checks exclude the
//!     requesting transaction itself, which enables the upgrade path.
//!   - Strict FIFO wait queue per resource: a later request never bypasses
//!     an earlier incompatible one, even if it is compatible with the
//!     current holders.
//!   - Upgrade SHARED -> EXCLUSIVE is granted in place only for the sole
//!     holder; otherwise the request waits in the queue like any other.
//!   - Deadlock detection runs on every enqueue: DFS over the wait-for
//!     graph derived from (txn_waiting, grant_group). The victim is the
//!     transaction with the highest id (youngest) in the cycle.
//!   - Locks are released only by `release_all` at commit/abort time.
//!
//! All state lives under one mutex; waiting happens on a single condvar
//! with per-request granted/aborted flags.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::{MiniDbError, MiniDbResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    Timeout,
    Deadlock,
    Aborted,
}

impl LockOutcome {
    /// Translate a lock outcome into the error the executor propagates.
    pub fn into_result(self, txn_id: u32, resource: &ResourceKey) -> MiniDbResult<()> {
        match self {
            LockOutcome::Granted => Ok(()),
            LockOutcome::Timeout => Err(MiniDbError::LockTimeout(resource.to_string())),
            LockOutcome::Deadlock => Err(MiniDbError::Deadlock(txn_id)),
            LockOutcome::Aborted => Err(MiniDbError::LockAborted(txn_id)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKey {
    Table(String),
    /// Reserved for row-level granularity; no current caller grants these
    /// outside the lock manager tests.
    Row {
        table: String,
        page_id: u32,
        slot_id: u16,
    },
}

impl ResourceKey {
    pub fn table(name: &str) -> Self {
        ResourceKey::Table(name.to_string())
    }

    pub fn row(table: &str, page_id: u32, slot_id: u16) -> Self {
        ResourceKey::Row {
            table: table.to_string(),
            page_id,
            slot_id,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::Table(name) => write!(f, "table '{}'", name),
            ResourceKey::Row {
                table,
                page_id,
                slot_id,
            } => write!(f, "row {}:({}, {})", table, page_id, slot_id),
        }
    }
}

struct LockRequest {
    txn_id: u32,
    mode: LockMode,
    granted: AtomicBool,
    aborted: AtomicBool,
}

#[derive(Default)]
struct ResourceLock {
    grant_group: HashMap<u32, LockMode>,
    wait_queue: Vec<Arc<LockRequest>>,
}

impl ResourceLock {
    /// Compatibility against the grant group, excluding the requesting
    /// transaction itself.
    fn is_compatible(&self, mode: LockMode, requesting: u32) -> bool {
        for (&holder, &held) in &self.grant_group {
            if holder == requesting {
                continue;
            }
            if held == LockMode::Exclusive || mode == LockMode::Exclusive {
                return false;
            }
        }
        true
    }

    fn is_sole_holder(&self, txn_id: u32) -> bool {
        self.grant_group.len() == 1 && self.grant_group.contains_key(&txn_id)
    }
}

#[derive(Default)]
struct LockState {
    resources: HashMap<ResourceKey, ResourceLock>,
    txn_locks: HashMap<u32, HashSet<ResourceKey>>,
    txn_waiting: HashMap<u32, ResourceKey>,
}

pub struct LockManager {
    state: Mutex<LockState>,
    wakeup: Condvar,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        LockManager {
            state: Mutex::new(LockState::default()),
            wakeup: Condvar::new(),
        }
    }

    /// Acquire a lock, blocking up to `timeout` if an incompatible lock is
    /// held. The outcome is returned as a value; no error is raised here.
    pub fn acquire(
        &self,
        txn_id: u32,
        resource: ResourceKey,
        mode: LockMode,
        timeout: Duration,
    ) -> LockOutcome {
        let mut guard = self.state.lock().unwrap();

        {
            let st = &mut *guard;
            let res = st.resources.entry(resource.clone()).or_default();

            if let Some(&held) = res.grant_group.get(&txn_id) {
                if held == mode || held == LockMode::Exclusive {
                    return LockOutcome::Granted; // equal or stronger
                }
                if res.is_sole_holder(txn_id) {
                    // SHARED -> EXCLUSIVE upgrade in place.
                    res.grant_group.insert(txn_id, LockMode::Exclusive);
                    trace!(txn_id, %resource, "lock upgraded in place");
                    return LockOutcome::Granted;
                }
                // Not the sole holder: wait like everyone else.
            } else if res.wait_queue.is_empty() && res.is_compatible(mode, txn_id) {
                res.grant_group.insert(txn_id, mode);
                st.txn_locks.entry(txn_id).or_default().insert(resource.clone());
                trace!(txn_id, %resource, ?mode, "lock granted immediately");
                return LockOutcome::Granted;
            }
        }

        // Enqueue and run deadlock detection before blocking.
        let request = Arc::new(LockRequest {
            txn_id,
            mode,
            granted: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
        });
        {
            let st = &mut *guard;
            st.resources
                .get_mut(&resource)
                .expect("resource entry created above")
                .wait_queue
                .push(Arc::clone(&request));
            st.txn_waiting.insert(txn_id, resource.clone());
        }

        if let Some(victim) = Self::detect_deadlock(&guard, txn_id) {
            debug!(txn_id, victim, "deadlock cycle detected");
            if victim == txn_id {
                let st = &mut *guard;
                if let Some(res) = st.resources.get_mut(&resource) {
                    res.wait_queue.retain(|r| !Arc::ptr_eq(r, &request));
                }
                st.txn_waiting.remove(&txn_id);
                return LockOutcome::Deadlock;
            }
            Self::abort_waiting_locked(&mut guard, victim);
            self.wakeup.notify_all();
        }

        // Block outside the fast path, re-checking flags on every wake.
        let deadline = Instant::now() + timeout;
        loop {
            if request.granted.load(Ordering::SeqCst) {
                guard.txn_waiting.remove(&txn_id);
                return LockOutcome::Granted;
            }
            if request.aborted.load(Ordering::SeqCst) {
                guard.txn_waiting.remove(&txn_id);
                return LockOutcome::Aborted;
            }
            let now = Instant::now();
            if now >= deadline {
                let st = &mut *guard;
                if let Some(res) = st.resources.get_mut(&resource) {
                    res.wait_queue.retain(|r| !Arc::ptr_eq(r, &request));
                }
                st.txn_waiting.remove(&txn_id);
                debug!(txn_id, %resource, "lock wait timed out");
                return LockOutcome::Timeout;
            }
            let (g, _) = self.wakeup.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
        }
    }

    /// Release every lock a transaction holds, then grant queued waiters
    /// in FIFO order. Called at commit/abort time after the WAL is
    /// durable. Returns the number of locks released.
    pub fn release_all(&self, txn_id: u32) -> usize {
        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;
        let held = st.txn_locks.remove(&txn_id).unwrap_or_default();
        let mut count = 0;
        let mut woke = false;

        for resource in held {
            let Some(res) = st.resources.get_mut(&resource) else {
                continue;
            };
            if res.grant_group.remove(&txn_id).is_some() {
                count += 1;
            }
            woke |= Self::try_grant_waiters(res, &mut st.txn_locks, &resource);
            if res.grant_group.is_empty() && res.wait_queue.is_empty() {
                st.resources.remove(&resource);
            }
        }

        // A transaction aborted mid-wait also has a queued request to kill.
        if let Some(waiting) = st.txn_waiting.remove(&txn_id) {
            if let Some(res) = st.resources.get_mut(&waiting) {
                for req in &res.wait_queue {
                    if req.txn_id == txn_id {
                        req.aborted.store(true, Ordering::SeqCst);
                        woke = true;
                    }
                }
                res.wait_queue.retain(|r| r.txn_id != txn_id);
            }
        }

        if woke {
            self.wakeup.notify_all();
        }
        trace!(txn_id, count, "released all locks");
        count
    }

    /// Grant requests from the head of the FIFO queue while they are
    /// compatible; stop at the first incompatible one (no starvation).
    /// Returns true if any waiter must be woken.
    fn try_grant_waiters(
        res: &mut ResourceLock,
        txn_locks: &mut HashMap<u32, HashSet<ResourceKey>>,
        resource: &ResourceKey,
    ) -> bool {
        let mut woke = false;
        while let Some(head) = res.wait_queue.first().cloned() {
            if head.aborted.load(Ordering::SeqCst) {
                res.wait_queue.remove(0);
                continue;
            }
            if !res.is_compatible(head.mode, head.txn_id) {
                break;
            }
            res.grant_group.insert(head.txn_id, head.mode);
            txn_locks
                .entry(head.txn_id)
                .or_default()
                .insert(resource.clone());
            head.granted.store(true, Ordering::SeqCst);
            res.wait_queue.remove(0);
            woke = true;
            trace!(txn_id = head.txn_id, %resource, "queued lock granted");
        }
        woke
    }

    // ==================== Deadlock detection ====================

    fn wait_edges(st: &LockState, txn_id: u32) -> Vec<u32> {
        let Some(resource) = st.txn_waiting.get(&txn_id) else {
            return Vec::new();
        };
        let Some(res) = st.resources.get(resource) else {
            return Vec::new();
        };
        res.grant_group
            .keys()
            .filter(|&&h| h != txn_id)
            .copied()
            .collect()
    }

    fn reaches(st: &LockState, from: u32, target: u32) -> bool {
        let mut stack = Self::wait_edges(st, from);
        let mut visited = HashSet::new();
        while let Some(txn) = stack.pop() {
            if txn == target {
                return true;
            }
            if !visited.insert(txn) {
                continue;
            }
            stack.extend(Self::wait_edges(st, txn));
        }
        false
    }

    /// If enqueuing `start` closed a cycle, pick the victim: the highest
    /// (youngest) txn id among the cycle members.
    fn detect_deadlock(st: &LockState, start: u32) -> Option<u32> {
        if !Self::reaches(st, start, start) {
            return None;
        }
        // Cycle members: transactions reachable from start that can reach
        // start back.
        let mut members = vec![start];
        let mut stack = Self::wait_edges(st, start);
        let mut visited = HashSet::new();
        while let Some(txn) = stack.pop() {
            if !visited.insert(txn) {
                continue;
            }
            stack.extend(Self::wait_edges(st, txn));
            if txn != start && Self::reaches(st, txn, start) {
                members.push(txn);
            }
        }
        members.iter().max().copied()
    }

    fn abort_waiting_locked(guard: &mut LockState, victim: u32) {
        let Some(resource) = guard.txn_waiting.remove(&victim) else {
            return;
        };
        let Some(res) = guard.resources.get_mut(&resource) else {
            return;
        };
        for req in &res.wait_queue {
            if req.txn_id == victim {
                req.aborted.store(true, Ordering::SeqCst);
            }
        }
        res.wait_queue.retain(|r| r.txn_id != victim);
        debug!(victim, %resource, "deadlock victim woken with abort");
    }

    // ==================== Introspection (tests and diagnostics) ====================

    pub fn holders(&self, resource: &ResourceKey) -> HashMap<u32, LockMode> {
        let st = self.state.lock().unwrap();
        st.resources
            .get(resource)
            .map(|r| r.grant_group.clone())
            .unwrap_or_default()
    }

    pub fn locks_of(&self, txn_id: u32) -> Vec<ResourceKey> {
        let st = self.state.lock().unwrap();
        st.txn_locks
            .get(&txn_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn waiting_for(&self, txn_id: u32) -> Option<ResourceKey> {
        self.state.lock().unwrap().txn_waiting.get(&txn_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const T: Duration = Duration::from_secs(2);

    fn table_a() -> ResourceKey {
        ResourceKey::table("a")
    }

    #[test]
    fn test_shared_shared_compatible() {
        let lm = LockManager::new();
        assert_eq!(lm.acquire(1, table_a(), LockMode::Shared, T), LockOutcome::Granted);
        assert_eq!(lm.acquire(2, table_a(), LockMode::Shared, T), LockOutcome::Granted);
        let holders = lm.holders(&table_a());
        assert_eq!(holders.len(), 2);
        // Never S and X together.
        assert!(holders.values().all(|&m| m == LockMode::Shared));
    }

    #[test]
    fn test_reacquire_is_noop() {
        let lm = LockManager::new();
        assert_eq!(lm.acquire(1, table_a(), LockMode::Exclusive, T), LockOutcome::Granted);
        assert_eq!(lm.acquire(1, table_a(), LockMode::Exclusive, T), LockOutcome::Granted);
        // Shared after Exclusive: already stronger.
        assert_eq!(lm.acquire(1, table_a(), LockMode::Shared, T), LockOutcome::Granted);
        assert_eq!(lm.release_all(1), 1);
    }

    #[test]
    fn test_sole_holder_upgrade() {
        let lm = LockManager::new();
        assert_eq!(lm.acquire(1, table_a(), LockMode::Shared, T), LockOutcome::Granted);
        assert_eq!(lm.acquire(1, table_a(), LockMode::Exclusive, T), LockOutcome::Granted);
        assert_eq!(lm.holders(&table_a()).get(&1), Some(&LockMode::Exclusive));
    }

    #[test]
    fn test_exclusive_blocks_and_times_out() {
        let lm = LockManager::new();
        lm.acquire(1, table_a(), LockMode::Exclusive, T);
        let out = lm.acquire(2, table_a(), LockMode::Shared, Duration::from_millis(50));
        assert_eq!(out, LockOutcome::Timeout);
        // The timed-out request left no residue.
        assert!(lm.waiting_for(2).is_none());
    }

    #[test]
    fn test_release_grants_next_waiter() {
        let lm = Arc::new(LockManager::new());
        lm.acquire(1, table_a(), LockMode::Exclusive, T);

        let lm2 = Arc::clone(&lm);
        let waiter = thread::spawn(move || lm2.acquire(2, table_a(), LockMode::Exclusive, T));
        thread::sleep(Duration::from_millis(50));
        lm.release_all(1);
        assert_eq!(waiter.join().unwrap(), LockOutcome::Granted);
        assert_eq!(lm.holders(&table_a()).get(&2), Some(&LockMode::Exclusive));
    }

    /// Two-transaction deadlock: the youngest (highest id) is the victim.
    #[test]
    fn test_deadlock_youngest_victim() {
        let lm = Arc::new(LockManager::new());
        let a = ResourceKey::table("a");
        let b = ResourceKey::table("b");

        assert_eq!(lm.acquire(1, a.clone(), LockMode::Exclusive, T), LockOutcome::Granted);
        assert_eq!(lm.acquire(2, b.clone(), LockMode::Exclusive, T), LockOutcome::Granted);

        let lm1 = Arc::clone(&lm);
        let b1 = b.clone();
        let t1 = thread::spawn(move || lm1.acquire(1, b1, LockMode::Exclusive, T));
        thread::sleep(Duration::from_millis(100));

        // Txn 2 closes the cycle and is the youngest: it gets Deadlock.
        let out = lm.acquire(2, a.clone(), LockMode::Exclusive, T);
        assert_eq!(out, LockOutcome::Deadlock);

        // The survivor proceeds once the victim releases.
        lm.release_all(2);
        assert_eq!(t1.join().unwrap(), LockOutcome::Granted);
        assert!(lm.holders(&b).contains_key(&1));
        assert!(lm.locks_of(2).is_empty());
    }

    /// Deadlock where the requester is the oldest: the other transaction
    /// is woken with Aborted.
    #[test]
    fn test_deadlock_victim_is_other() {
        let lm = Arc::new(LockManager::new());
        let a = ResourceKey::table("a");
        let b = ResourceKey::table("b");

        lm.acquire(1, a.clone(), LockMode::Exclusive, T);
        lm.acquire(2, b.clone(), LockMode::Exclusive, T);

        let lm2 = Arc::clone(&lm);
        let a2 = a.clone();
        let t2 = thread::spawn(move || {
            let out = lm2.acquire(2, a2, LockMode::Exclusive, T);
            // The executor aborts a transaction that lost its wait.
            lm2.release_all(2);
            out
        });
        thread::sleep(Duration::from_millis(100));

        // Txn 1 closes the cycle; victim is txn 2, woken with Aborted.
        // Once the victim's locks are gone, txn 1 is granted b.
        let out = lm.acquire(1, b.clone(), LockMode::Exclusive, T);
        assert_eq!(out, LockOutcome::Granted);
        assert_eq!(t2.join().unwrap(), LockOutcome::Aborted);
    }

    /// FIFO starvation prevention: a later Shared request must not bypass
    /// an earlier queued Exclusive request.
    #[test]
    fn test_fifo_no_starvation() {
        let lm = Arc::new(LockManager::new());
        lm.acquire(1, table_a(), LockMode::Shared, T);

        let lm2 = Arc::clone(&lm);
        let t2 = thread::spawn(move || lm2.acquire(2, table_a(), LockMode::Exclusive, T));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(lm.waiting_for(2), Some(table_a()));

        let lm3 = Arc::clone(&lm);
        let t3 = thread::spawn(move || {
            let out = lm3.acquire(3, table_a(), LockMode::Shared, T);
            (out, std::time::Instant::now())
        });
        thread::sleep(Duration::from_millis(50));
        // Txn 3 is compatible with the holder but queued behind txn 2.
        assert!(lm.waiting_for(3).is_some());
        assert!(!lm.holders(&table_a()).contains_key(&3));

        lm.release_all(1);
        let granted_2_at = std::time::Instant::now();
        assert_eq!(t2.join().unwrap(), LockOutcome::Granted);

        lm.release_all(2);
        let (out3, granted_3_at) = t3.join().unwrap();
        assert_eq!(out3, LockOutcome::Granted);
        assert!(granted_3_at >= granted_2_at);
    }

    #[test]
    fn test_release_all_aborts_own_pending_wait() {
        let lm = Arc::new(LockManager::new());
        lm.acquire(1, table_a(), LockMode::Exclusive, T);

        let lm2 = Arc::clone(&lm);
        let t2 = thread::spawn(move || lm2.acquire(2, table_a(), LockMode::Exclusive, T));
        thread::sleep(Duration::from_millis(50));

        // Txn 2 is externally resolved while waiting.
        lm.release_all(2);
        assert_eq!(t2.join().unwrap(), LockOutcome::Aborted);

        lm.release_all(1);
        assert!(lm.holders(&table_a()).is_empty());
    }

    #[test]
    fn test_row_resource_keys() {
        let lm = LockManager::new();
        let r1 = ResourceKey::row("t", 1, 0);
        let r2 = ResourceKey::row("t", 1, 1);
        assert_eq!(lm.acquire(1, r1.clone(), LockMode::Exclusive, T), LockOutcome::Granted);
        // A different row of the same table does not conflict.
        assert_eq!(lm.acquire(2, r2, LockMode::Exclusive, T), LockOutcome::Granted);
        let out = lm.acquire(2, r1, LockMode::Shared, Duration::from_millis(50));
        assert_eq!(out, LockOutcome::Timeout);
    }
}
