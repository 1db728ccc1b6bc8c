//! Multi-granularity reader/writer lock table.
//!
//! Locks are keyed by [`LockSubject`] and attributed to per-node [`Locker`]
//! handles. A write request conflicts with any other owner; a read request
//! conflicts with a write owner, and queues behind already-waiting writers so
//! writers are not starved. Within one subject, waiters are served in arrival
//! order, except that upgrade requests go ahead of non-upgrade requests: an
//! upgrade is useless if a conflicting writer gets in first and costs the
//! waiter its read lock.
//!
//! Thread synchronization scheme:
//!
//! - The table is split into shards, each a map from subject to lock state
//!   guarded by its own mutex.
//! - Each queued request carries its own wait cell (mutex + condvar). A
//!   blocked thread sleeps on its request's cell, never on a shard.
//! - A releasing thread collects newly granted requests while holding the
//!   shard guard, drops the guard, and only then notifies the wait cells, so
//!   no thread ever holds a shard and a cell at once.
//! - Races between a grant and a timeout are settled under the shard guard in
//!   [`LockManager::wait_for_lock`]: if the request became an owner, the grant
//!   wins and the timeout is discarded.

use crate::coordinator::key::{LockSubject, NodeId};
use parking_lot::{Condvar, Mutex};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Why a lock attempt failed or is currently blocked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictKind {
    /// The request is queued behind a conflicting owner.
    Blocked,
    /// The wait exceeded the configured lock timeout.
    Timeout,
    /// The locker was shut down while waiting.
    Denied,
    /// Waiting would have closed a cycle among lockers.
    Deadlock,
}

/// A resolved lock conflict, naming one concrete conflicting locker for
/// diagnostics.
#[derive(Clone, Copy, Debug)]
pub struct LockConflict {
    pub kind: ConflictKind,
    pub conflicting: NodeId,
}

/// Per-node locker identity. Tracks the requests the node is currently
/// blocked on, for shutdown denial and deadlock detection.
pub struct Locker {
    node_id: NodeId,
    waiting: Mutex<Vec<Arc<NodeRequest>>>,
}

impl Locker {
    pub fn new(node_id: NodeId) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            waiting: Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }
}

/// A single lock request, granted or queued.
///
/// The `called_back` flag is a one-shot gate: however many conflicting
/// requesters pile up behind this owner, at most one eviction/downgrade
/// callback is ever issued against it.
pub struct NodeRequest {
    locker: Arc<Locker>,
    subject: LockSubject,
    for_write: bool,
    upgrade: bool,
    started: Instant,
    conflicting_hint: NodeId,
    called_back: AtomicBool,
    cell: WaitCell,
}

#[derive(Default)]
struct WaitCell {
    state: Mutex<WaitState>,
    cond: Condvar,
}

#[derive(Default)]
struct WaitState {
    granted: bool,
    conflict: Option<LockConflict>,
}

impl NodeRequest {
    fn new(
        locker: &Arc<Locker>,
        subject: &LockSubject,
        for_write: bool,
        upgrade: bool,
        conflicting_hint: NodeId,
    ) -> Arc<Self> {
        Arc::new(Self {
            locker: locker.clone(),
            subject: subject.clone(),
            for_write,
            upgrade,
            started: Instant::now(),
            conflicting_hint,
            called_back: AtomicBool::new(false),
            cell: WaitCell::default(),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.locker.node_id
    }

    pub fn subject(&self) -> &LockSubject {
        &self.subject
    }

    pub fn for_write(&self) -> bool {
        self.for_write
    }

    /// One-shot callback gate: `true` the first time, `false` afterwards.
    pub fn note_callback(&self) -> bool {
        !self.called_back.swap(true, Ordering::AcqRel)
    }

    fn grant(&self) {
        let mut state = self.cell.state.lock();
        state.granted = true;
        state.conflict = None;
        self.cell.cond.notify_all();
    }

    fn set_conflict(&self, conflict: LockConflict) {
        let mut state = self.cell.state.lock();
        if !state.granted && state.conflict.is_none() {
            state.conflict = Some(conflict);
            self.cell.cond.notify_all();
        }
    }

    fn has_conflict(&self) -> bool {
        self.cell.state.lock().conflict.is_some()
    }
}

/// Outcome of a non-blocking lock attempt.
pub enum LockOutcome {
    /// Granted immediately (or already held in a satisfying mode).
    Granted,
    /// Queued behind a conflicting owner; resolve with
    /// [`LockManager::wait_for_lock`].
    Blocked(Arc<NodeRequest>),
}

enum TryAcquire {
    /// Already owned in a satisfying mode.
    Held,
    Granted(Arc<NodeRequest>),
    Blocked {
        request: Arc<NodeRequest>,
        conflicting: NodeId,
    },
}

/// Per-subject owner and waiter lists. All methods require the shard guard.
#[derive(Default)]
struct LockState {
    owners: Vec<Arc<NodeRequest>>,
    waiters: Vec<Arc<NodeRequest>>,
}

impl LockState {
    fn try_acquire(
        &mut self,
        locker: &Arc<Locker>,
        subject: &LockSubject,
        for_write: bool,
        waiting: Option<&Arc<NodeRequest>>,
    ) -> TryAcquire {
        let mut conflicting: Option<NodeId> = None;
        let mut upgrade = false;
        if !self.owners.is_empty() {
            for owner in &self.owners {
                if owner.node_id() == locker.node_id {
                    if for_write && !owner.for_write {
                        upgrade = true;
                    } else {
                        return TryAcquire::Held;
                    }
                } else if for_write || owner.for_write {
                    conflicting = Some(owner.node_id());
                    break;
                } else if waiting.is_none() && !self.waiters.is_empty() {
                    // New reads wait behind already-queued requests; a
                    // queued request being re-granted does not queue behind
                    // itself.
                    conflicting = Some(self.waiters[0].node_id());
                    break;
                }
            }
            if conflicting.is_none() && upgrade {
                // Drop the read request being upgraded
                let pos = self
                    .owners
                    .iter()
                    .position(|o| o.node_id() == locker.node_id)
                    .expect("upgrading locker must own for read");
                debug_assert!(!self.owners[pos].for_write);
                self.owners.remove(pos);
            }
        }
        match conflicting {
            None => {
                let request = match waiting {
                    Some(req) => {
                        self.remove_waiter(req);
                        req.clone()
                    }
                    None => NodeRequest::new(locker, subject, for_write, upgrade, locker.node_id),
                };
                self.owners.push(request.clone());
                TryAcquire::Granted(request)
            }
            Some(conflicting) => match waiting {
                // An already queued request stays in place
                Some(req) => TryAcquire::Blocked {
                    request: req.clone(),
                    conflicting,
                },
                None => {
                    let request =
                        NodeRequest::new(locker, subject, for_write, upgrade, conflicting);
                    self.add_waiter(request.clone());
                    TryAcquire::Blocked {
                        request,
                        conflicting,
                    }
                }
            },
        }
    }

    /// Queue a request, putting upgrades after other upgrades but before
    /// plain requests.
    fn add_waiter(&mut self, request: Arc<NodeRequest>) {
        if self.waiters.is_empty() || !request.upgrade {
            self.waiters.push(request);
        } else {
            let pos = self
                .waiters
                .iter()
                .position(|w| !w.upgrade)
                .unwrap_or(self.waiters.len());
            self.waiters.insert(pos, request);
        }
    }

    fn remove_waiter(&mut self, request: &Arc<NodeRequest>) -> bool {
        if let Some(pos) = self.waiters.iter().position(|w| Arc::ptr_eq(w, request)) {
            self.waiters.remove(pos);
            true
        } else {
            false
        }
    }

    /// Is the lock owned in a mode that satisfies `request`?
    fn satisfies(&self, request: &NodeRequest) -> bool {
        self.owners
            .iter()
            .any(|o| o.node_id() == request.node_id() && (!request.for_write || o.for_write))
    }

    /// Release (or downgrade) the ownership of `node_id`, then hand the lock
    /// to as many waiters as now fit, in queue order. Returns the newly
    /// granted requests; the caller notifies them after dropping the shard
    /// guard.
    fn release(&mut self, node_id: NodeId, downgrade: bool) -> Vec<Arc<NodeRequest>> {
        let mut owned = false;
        if let Some(pos) = self.owners.iter().position(|o| o.node_id() == node_id) {
            if !downgrade || self.owners[pos].for_write {
                let old = self.owners.remove(pos);
                owned = true;
                if downgrade {
                    let read = NodeRequest::new(&old.locker, &old.subject, false, false, node_id);
                    self.owners.push(read);
                }
            }
        }
        let mut granted = Vec::new();
        if owned {
            // Serve the queue from the front; each granted waiter is removed
            // by try_acquire, so the head advances on its own. Stop at the
            // first waiter still blocked.
            while let Some(waiter) = self.waiters.first().cloned() {
                match self.try_acquire(
                    &waiter.locker,
                    &waiter.subject,
                    waiter.for_write,
                    Some(&waiter),
                ) {
                    TryAcquire::Granted(request) => granted.push(request),
                    TryAcquire::Held => {
                        debug_assert!(false, "queued waiter already owned the lock");
                        self.remove_waiter(&waiter);
                    }
                    TryAcquire::Blocked { .. } => break,
                }
            }
        }
        granted
    }

    fn in_use(&self) -> bool {
        !self.owners.is_empty() || !self.waiters.is_empty()
    }
}

/// The lock table.
pub struct LockManager {
    lock_timeout: Duration,
    detect_deadlocks: bool,
    shards: Vec<Mutex<HashMap<LockSubject, LockState>>>,
}

impl LockManager {
    pub fn new(lock_timeout: Duration, num_key_shards: usize, detect_deadlocks: bool) -> Self {
        assert!(num_key_shards >= 1, "num_key_shards must be at least 1");
        let shards = (0..num_key_shards)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            lock_timeout,
            detect_deadlocks,
            shards,
        }
    }

    fn shard(&self, subject: &LockSubject) -> &Mutex<HashMap<LockSubject, LockState>> {
        let mut hasher = DefaultHasher::new();
        subject.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    /// Attempt to acquire a lock without blocking. On conflict the request is
    /// queued and returned; the caller decides when to block on it.
    pub fn lock_no_wait(
        &self,
        locker: &Arc<Locker>,
        subject: &LockSubject,
        for_write: bool,
    ) -> LockOutcome {
        let attempt = {
            let mut map = self.shard(subject).lock();
            let state = map.entry(subject.clone()).or_default();
            state.try_acquire(locker, subject, for_write, None)
        };
        match attempt {
            TryAcquire::Held | TryAcquire::Granted(_) => {
                trace!(node = locker.node_id, %subject, for_write, "lock granted");
                LockOutcome::Granted
            }
            TryAcquire::Blocked {
                request,
                conflicting,
            } => {
                locker.waiting.lock().push(request.clone());
                if self.detect_deadlocks {
                    DeadlockChecker::new(self).check(locker);
                }
                trace!(
                    node = locker.node_id,
                    %subject,
                    for_write,
                    conflicting,
                    "lock blocked"
                );
                LockOutcome::Blocked(request)
            }
        }
    }

    /// Block until a queued request resolves. Returns `None` if the lock was
    /// granted, or the conflict that ended the wait.
    pub fn wait_for_lock(&self, request: &Arc<NodeRequest>) -> Option<LockConflict> {
        let deadline = Instant::now() + self.lock_timeout;
        let mut observed: Option<LockConflict> = None;
        {
            let mut state = request.cell.state.lock();
            loop {
                if state.granted {
                    break;
                }
                if let Some(conflict) = state.conflict {
                    observed = Some(conflict);
                    break;
                }
                if Instant::now() >= deadline {
                    let conflict = LockConflict {
                        kind: ConflictKind::Timeout,
                        conflicting: request.conflicting_hint,
                    };
                    state.conflict = Some(conflict);
                    observed = Some(conflict);
                    break;
                }
                request.cell.cond.wait_until(&mut state, deadline);
            }
        }
        // Settle any grant/conflict race under the shard guard: a request
        // that made it into the owners list holds the lock, whatever the
        // cell says.
        let granted = {
            let mut map = self.shard(&request.subject).lock();
            match map.get_mut(&request.subject) {
                Some(state) => {
                    if state.satisfies(request) {
                        true
                    } else {
                        state.remove_waiter(request);
                        if !state.in_use() {
                            map.remove(&request.subject);
                        }
                        false
                    }
                }
                None => false,
            }
        };
        request
            .locker
            .waiting
            .lock()
            .retain(|r| !Arc::ptr_eq(r, request));
        if granted {
            request.grant();
            trace!(node = request.node_id(), subject = %request.subject, "lock granted after wait");
            None
        } else {
            let conflict = observed.unwrap_or(LockConflict {
                kind: ConflictKind::Denied,
                conflicting: request.conflicting_hint,
            });
            trace!(
                node = request.node_id(),
                subject = %request.subject,
                kind = ?conflict.kind,
                "lock wait failed"
            );
            Some(conflict)
        }
    }

    /// Release a lock held by `locker`. Does nothing if the lock is not held.
    pub fn release_lock(&self, locker: &Arc<Locker>, subject: &LockSubject) {
        trace!(node = locker.node_id, %subject, "release");
        self.release_internal(locker.node_id, subject, false);
    }

    /// Downgrade a write lock held by `locker` to a read lock. Does nothing
    /// if the lock is not held for write.
    pub fn downgrade_lock(&self, locker: &Arc<Locker>, subject: &LockSubject) {
        trace!(node = locker.node_id, %subject, "downgrade");
        self.release_internal(locker.node_id, subject, true);
    }

    fn release_internal(&self, node_id: NodeId, subject: &LockSubject, downgrade: bool) {
        let granted = {
            let mut map = self.shard(subject).lock();
            match map.get_mut(subject) {
                Some(state) => {
                    let granted = state.release(node_id, downgrade);
                    if !state.in_use() {
                        map.remove(subject);
                    }
                    granted
                }
                None => Vec::new(),
            }
        };
        // Notify only after the shard guard is dropped
        for request in granted {
            request.grant();
        }
    }

    /// Snapshot of the current owners of a subject.
    pub fn get_owners(&self, subject: &LockSubject) -> Vec<Arc<NodeRequest>> {
        let map = self.shard(subject).lock();
        map.get(subject).map(|s| s.owners.clone()).unwrap_or_default()
    }

    /// Snapshot of the current waiters for a subject.
    pub fn get_waiters(&self, subject: &LockSubject) -> Vec<Arc<NodeRequest>> {
        let map = self.shard(subject).lock();
        map.get(subject)
            .map(|s| s.waiters.clone())
            .unwrap_or_default()
    }

    /// Deny every wait the locker currently has in flight, e.g. because its
    /// node was shut down. The blocked threads observe `ConflictKind::Denied`.
    pub fn deny_waiting(&self, locker: &Arc<Locker>) {
        let waiting: Vec<_> = locker.waiting.lock().clone();
        for request in waiting {
            let conflicting = self
                .get_owners(&request.subject)
                .iter()
                .find(|o| o.node_id() != locker.node_id)
                .map(|o| o.node_id())
                .unwrap_or(locker.node_id);
            request.set_conflict(LockConflict {
                kind: ConflictKind::Denied,
                conflicting,
            });
        }
    }
}

/// Cycle detection over blocked lockers.
///
/// The waits-for graph has an edge from a blocked locker to each owner of a
/// subject it waits on. When a cycle is found, the victim is the locker in
/// the cycle whose newest blocked request started last, and that request is
/// aborted with `ConflictKind::Deadlock`. Checking repeats until no cycle
/// through the root remains; cycles this pass cannot see are caught by the
/// next blocked request or by the lock timeout.
struct DeadlockChecker<'a> {
    manager: &'a LockManager,
    waiter_map: HashMap<NodeId, WaiterInfo>,
    pass: u32,
    cycle_boundary: Option<NodeId>,
    victim: Option<NodeId>,
    conflicting: Option<NodeId>,
}

struct WaiterInfo {
    /// Owner requests this locker currently waits behind, or `None` if it is
    /// not waiting (or was already aborted).
    waiting_for: Option<Vec<Arc<NodeRequest>>>,
    /// The locker's newest blocked request; the one aborted if it becomes
    /// the victim.
    newest: Option<Arc<NodeRequest>>,
    pass: u32,
}

impl<'a> DeadlockChecker<'a> {
    fn new(manager: &'a LockManager) -> Self {
        Self {
            manager,
            waiter_map: HashMap::new(),
            pass: 0,
            cycle_boundary: None,
            victim: None,
            conflicting: None,
        }
    }

    fn check(&mut self, root: &Arc<Locker>) {
        loop {
            self.pass += 1;
            self.cycle_boundary = None;
            self.victim = None;
            self.conflicting = None;
            self.ensure_info_for(root);
            if !self.check_internal(root.node_id) {
                return;
            }
            let victim = self.victim.expect("cycle implies a victim");
            let conflicting = self.conflicting.unwrap_or(root.node_id);
            trace!(victim, conflicting, "deadlock detected");
            let info = self.waiter_map.get_mut(&victim).expect("victim has info");
            if let Some(request) = info.newest.take() {
                request.set_conflict(LockConflict {
                    kind: ConflictKind::Deadlock,
                    conflicting,
                });
            }
            info.waiting_for = None;
            if victim == root.node_id {
                return;
            }
        }
    }

    /// Depth-first walk of the waits-for graph; `true` if a cycle was found.
    fn check_internal(&mut self, node_id: NodeId) -> bool {
        self.waiter_map
            .get_mut(&node_id)
            .expect("info present")
            .pass = self.pass;
        let waiting_for = match self
            .waiter_map
            .get(&node_id)
            .and_then(|i| i.waiting_for.clone())
        {
            Some(w) => w,
            None => return false,
        };
        for owner_request in waiting_for {
            let owner = owner_request.node_id();
            if owner == node_id {
                continue; // self-reference (e.g. pending upgrade)
            }
            self.ensure_info_for(&owner_request.locker);
            let owner_info = self.waiter_map.get(&owner).expect("info present");
            if owner_info.waiting_for.is_none() {
                continue;
            }
            if owner_info.pass == self.pass {
                // Found a cycle
                self.cycle_boundary = Some(owner);
                self.victim = Some(owner);
                return true;
            }
            if self.check_internal(owner) {
                self.maybe_update_victim(owner);
                return true;
            }
        }
        false
    }

    fn ensure_info_for(&mut self, locker: &Arc<Locker>) {
        if self.waiter_map.contains_key(&locker.node_id) {
            return;
        }
        let blocked: Vec<Arc<NodeRequest>> = locker
            .waiting
            .lock()
            .iter()
            .filter(|r| !r.has_conflict())
            .cloned()
            .collect();
        let info = if blocked.is_empty() {
            WaiterInfo {
                waiting_for: None,
                newest: None,
                pass: 0,
            }
        } else {
            let newest = blocked
                .iter()
                .max_by_key(|r| r.started)
                .cloned();
            let mut waiting_for = Vec::new();
            for request in &blocked {
                waiting_for.extend(self.manager.get_owners(&request.subject));
            }
            WaiterInfo {
                waiting_for: Some(waiting_for),
                newest,
                pass: 0,
            }
        };
        self.waiter_map.insert(locker.node_id, info);
    }

    /// Fold another cycle member into the victim choice, preferring the
    /// locker whose newest blocked request started last.
    fn maybe_update_victim(&mut self, node_id: NodeId) {
        if self.conflicting.is_none() {
            self.conflicting = Some(node_id);
        }
        if Some(node_id) == self.cycle_boundary {
            // Walked all the way around the cycle
            self.cycle_boundary = None;
            return;
        }
        if self.cycle_boundary.is_none() {
            return;
        }
        let newer = {
            let candidate = self.started_of(node_id);
            let current = self.victim.and_then(|v| self.started_of(v));
            match (candidate, current) {
                (Some(c), Some(v)) => c > v,
                (Some(_), None) => true,
                _ => false,
            }
        };
        if newer {
            if self.conflicting == Some(node_id) {
                self.conflicting = self.victim;
            }
            self.victim = Some(node_id);
        }
    }

    fn started_of(&self, node_id: NodeId) -> Option<Instant> {
        self.waiter_map
            .get(&node_id)
            .and_then(|i| i.newest.as_ref())
            .map(|r| r.started)
    }
}
