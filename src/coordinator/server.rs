//! The coordinator server.
//!
//! One [`CoordinatorServer`] arbitrates access to a shared [`DataStore`] for
//! a set of caching nodes. Every operation runs on the calling thread: it
//! takes the locks the operation needs (blocking, with coherence callbacks
//! to conflicting owners), consults the store, and reports back which kinds
//! of waiters the caller should expect callbacks for.
//!
//! Name bindings are range-locked: an operation on an unbound name locks
//! the next bound name (or the past-the-last sentinel) so the gap it
//! observed stays closed. Because the store is consulted before the lock is
//! taken, binding operations re-check their snapshot after acquiring and
//! retry from scratch when another node changed the neighborhood in
//! between.

use crate::common::config::CoordinatorConfig;
use crate::common::error::{Error, Result};
use crate::coordinator::callback::{CallbackClient, CallbackPool, CallbackRequest};
use crate::coordinator::key::{BindingKey, LockSubject, NodeId};
use crate::coordinator::lock::{ConflictKind, LockConflict, LockManager, LockOutcome};
use crate::coordinator::node::{NodeCall, NodeInfo, NodeRegistry};
use crate::coordinator::store::{DataStore, IdCounter, StoreTxn};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterNodeResult {
    pub node_id: NodeId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetObjectResult {
    /// `None` if no object with the requested id exists.
    pub data: Option<Vec<u8>>,
    /// Expect an eviction callback: a writer is already waiting.
    pub callback_evict: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetObjectForUpdateResult {
    pub data: Option<Vec<u8>>,
    pub callback_evict: bool,
    /// Expect a downgrade callback: readers are already waiting.
    pub callback_downgrade: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeObjectResult {
    pub callback_evict: bool,
    pub callback_downgrade: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextObjectResult {
    /// `None` when the scan ran off the end of the object space.
    pub oid: Option<u64>,
    pub data: Option<Vec<u8>>,
    pub callback_evict: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBindingResult {
    pub found: bool,
    /// When the name is unbound, the next bound name the server locked, or
    /// `None` for the past-the-last sentinel.
    pub next_name: Option<String>,
    /// Object id of the name if found, otherwise of `next_name`.
    pub oid: Option<u64>,
    pub callback_evict: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBindingForUpdateResult {
    pub found: bool,
    pub next_name: Option<String>,
    pub oid: Option<u64>,
    pub callback_evict: bool,
    pub callback_downgrade: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBindingForRemoveResult {
    pub found: bool,
    /// Object id bound to the name, when found.
    pub oid: Option<u64>,
    /// The next bound name after the requested one, or `None` for the
    /// past-the-last sentinel.
    pub next_name: Option<String>,
    pub next_oid: Option<u64>,
    pub callback_evict: bool,
    pub callback_downgrade: bool,
    pub next_callback_evict: bool,
    pub next_callback_downgrade: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextBoundNameResult {
    pub next_name: Option<String>,
    pub oid: Option<u64>,
    pub callback_evict: bool,
}

/// What kinds of requests are queued behind a lock the caller now owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Waiting {
    Nobody,
    Readers,
    Writers,
}

/// What the server observed about a name before locking it: whether it is
/// bound, and the first bound name after it. Binding operations retry until
/// this snapshot holds across the lock acquisition.
#[derive(Clone, Debug, PartialEq, Eq)]
struct BindingSnapshot {
    bound: Option<u64>,
    next: Option<(String, u64)>,
}

struct IdBlock {
    next: u64,
    last: u64,
}

/// Central coordinator for a set of caching nodes.
pub struct CoordinatorServer {
    config: CoordinatorConfig,
    store: Arc<dyn DataStore>,
    lock_manager: Arc<LockManager>,
    registry: Arc<NodeRegistry>,
    node_ids: Mutex<IdBlock>,
    callback_tx: Mutex<Option<Sender<CallbackRequest>>>,
    callback_pool: Mutex<Option<CallbackPool>>,
    shutdown: AtomicBool,
}

impl CoordinatorServer {
    pub fn new(config: CoordinatorConfig, store: Arc<dyn DataStore>) -> Result<Self> {
        config.validate()?;
        let lock_manager = Arc::new(LockManager::new(
            config.lock_timeout(),
            config.num_key_shards,
            config.detect_deadlocks,
        ));
        let registry = Arc::new(NodeRegistry::new());
        let (callback_tx, callback_pool) = CallbackPool::start(
            config.num_callback_threads,
            config.max_callback_retries,
            config.retry_wait(),
            lock_manager.clone(),
            registry.clone(),
        );
        info!(
            lock_timeout_ms = config.lock_timeout_ms,
            callback_threads = config.num_callback_threads,
            "coordinator started"
        );
        Ok(Self {
            config,
            store,
            lock_manager,
            registry,
            node_ids: Mutex::new(IdBlock { next: 1, last: 0 }),
            callback_tx: Mutex::new(Some(callback_tx)),
            callback_pool: Mutex::new(Some(callback_pool)),
            shutdown: AtomicBool::new(false),
        })
    }

    // -- node lifecycle ----------------------------------------------------

    /// Register a new node and assign it an id.
    pub fn register_node(&self, callback: Arc<dyn CallbackClient>) -> Result<RegisterNodeResult> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let node_id = self.allocate_node_id()?;
        self.registry.register(NodeInfo::new(node_id, callback));
        info!(node = node_id, "registered new node");
        Ok(RegisterNodeResult { node_id })
    }

    /// Shut a node down: refuse new calls, wait for in-flight calls to
    /// drain, then drop every lock it held. Idempotent.
    pub fn shutdown_node(&self, node_id: NodeId) -> Result<()> {
        let node = match self.registry.get(node_id) {
            Ok(node) => node,
            Err(_) => return Ok(()), // already gone
        };
        if !node.begin_shutdown() {
            return Ok(());
        }
        self.lock_manager.deny_waiting(node.locker());
        node.wait_drained();
        for subject in node.take_held() {
            self.lock_manager.release_lock(node.locker(), &subject);
        }
        self.registry.remove(node_id);
        info!(node = node_id, "node shut down");
        Ok(())
    }

    /// Stop the coordinator: refuse new calls and join the callback
    /// workers. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        drop(self.callback_tx.lock().take());
        if let Some(pool) = self.callback_pool.lock().take() {
            pool.shutdown();
        }
        info!("coordinator shut down");
    }

    // -- objects -----------------------------------------------------------

    /// Reserve `count` fresh object ids for the node; returns the first.
    /// The ids are not locked until the objects are created at commit.
    pub fn new_object_ids(&self, node_id: NodeId, count: u64) -> Result<u64> {
        let _call = self.begin_call(node_id)?;
        if count == 0 {
            return Err(Error::InvalidArgument("count must be positive".into()));
        }
        let mut txn = self.txn()?;
        let first = txn.allocate_ids(IdCounter::Object, count)?;
        txn.commit()?;
        debug!(node = node_id, first, count, "allocated object ids");
        Ok(first)
    }

    /// Read-lock an object and fetch its data.
    pub fn get_object(&self, node_id: NodeId, oid: u64) -> Result<GetObjectResult> {
        let call = self.begin_call(node_id)?;
        let subject = LockSubject::Object(oid);
        self.lock(&call, &subject, false, "get_object")?;
        let data = {
            let mut txn = self.txn()?;
            txn.get_object(oid)?
        };
        Ok(GetObjectResult {
            data,
            callback_evict: self.waiting(&subject) == Waiting::Writers,
        })
    }

    /// Write-lock an object and fetch its data.
    pub fn get_object_for_update(
        &self,
        node_id: NodeId,
        oid: u64,
    ) -> Result<GetObjectForUpdateResult> {
        let call = self.begin_call(node_id)?;
        let subject = LockSubject::Object(oid);
        self.lock(&call, &subject, true, "get_object_for_update")?;
        let data = {
            let mut txn = self.txn()?;
            txn.get_object(oid)?
        };
        let waiting = self.waiting(&subject);
        Ok(GetObjectForUpdateResult {
            data,
            callback_evict: waiting == Waiting::Writers,
            callback_downgrade: waiting == Waiting::Readers,
        })
    }

    /// Upgrade an object the node holds for read to a write lock. The node
    /// already has the data; no store access is needed.
    pub fn upgrade_object(&self, node_id: NodeId, oid: u64) -> Result<UpgradeObjectResult> {
        let call = self.begin_call(node_id)?;
        let subject = LockSubject::Object(oid);
        let owned = self
            .lock_manager
            .get_owners(&subject)
            .iter()
            .find(|o| o.node_id() == node_id)
            .map(|o| o.for_write());
        match owned {
            None => {
                warn!(node = node_id, oid, "upgrade of an unlocked object");
                return Err(Error::Consistency(format!(
                    "node {node_id} does not hold a lock on {subject}"
                )));
            }
            Some(true) => {} // already held for write
            Some(false) => self.lock(&call, &subject, true, "upgrade_object")?,
        }
        let waiting = self.waiting(&subject);
        Ok(UpgradeObjectResult {
            callback_evict: waiting == Waiting::Writers,
            callback_downgrade: waiting == Waiting::Readers,
        })
    }

    /// Find and read-lock the first existing object with id greater than
    /// `after` (or the first object overall). Objects deleted between the
    /// scan and the lock are skipped.
    pub fn next_object_id(&self, node_id: NodeId, after: Option<u64>) -> Result<NextObjectResult> {
        let call = self.begin_call(node_id)?;
        let end = NextObjectResult {
            oid: None,
            data: None,
            callback_evict: false,
        };
        let mut start = match after {
            None => 0,
            Some(a) => match a.checked_add(1) {
                Some(s) => s,
                None => return Ok(end),
            },
        };
        for _ in 0..self.config.max_range_retries {
            let found = {
                let mut txn = self.txn()?;
                txn.find_object(start)?
            };
            let oid = match found {
                Some(oid) => oid,
                None => return Ok(end),
            };
            let subject = LockSubject::Object(oid);
            self.lock(&call, &subject, false, "next_object_id")?;
            let data = {
                let mut txn = self.txn()?;
                txn.get_object(oid)?
            };
            match data {
                Some(data) => {
                    return Ok(NextObjectResult {
                        oid: Some(oid),
                        data: Some(data),
                        callback_evict: self.waiting(&subject) == Waiting::Writers,
                    });
                }
                None => {
                    // deleted between the scan and the lock
                    self.release_for_retry(&call, &subject);
                    start = match oid.checked_add(1) {
                        Some(s) => s,
                        None => return Ok(end),
                    };
                }
            }
        }
        Err(Error::RetriesExhausted(format!(
            "next_object_id after {after:?}"
        )))
    }

    // -- bindings ----------------------------------------------------------

    /// Look a name up, read-locking either the name (if bound) or the next
    /// bound name (if not), so the answer stays true until the node gives
    /// the lock up.
    pub fn get_binding(&self, node_id: NodeId, name: &str) -> Result<GetBindingResult> {
        let call = self.begin_call(node_id)?;
        for _ in 0..self.config.max_range_retries {
            let snap = self.binding_snapshot(name)?;
            let key = match snap.bound {
                Some(_) => BindingKey::for_name(name),
                None => BindingKey::allow_last(snap.next.as_ref().map(|(n, _)| n.as_str())),
            };
            let subject = LockSubject::Binding(key);
            self.lock(&call, &subject, false, "get_binding")?;
            if self.binding_snapshot(name)? != snap {
                self.release_for_retry(&call, &subject);
                continue;
            }
            let callback_evict = self.waiting(&subject) == Waiting::Writers;
            return Ok(match snap.bound {
                Some(oid) => GetBindingResult {
                    found: true,
                    next_name: None,
                    oid: Some(oid),
                    callback_evict,
                },
                None => GetBindingResult {
                    found: false,
                    next_name: snap.next.as_ref().map(|(n, _)| n.clone()),
                    oid: snap.next.map(|(_, oid)| oid),
                    callback_evict,
                },
            });
        }
        Err(Error::RetriesExhausted(format!("get_binding {name:?}")))
    }

    /// Like [`get_binding`](Self::get_binding), but write-locking, in
    /// preparation for binding or rebinding the name at commit.
    pub fn get_binding_for_update(
        &self,
        node_id: NodeId,
        name: &str,
    ) -> Result<GetBindingForUpdateResult> {
        let call = self.begin_call(node_id)?;
        for _ in 0..self.config.max_range_retries {
            let snap = self.binding_snapshot(name)?;
            let key = match snap.bound {
                Some(_) => BindingKey::for_name(name),
                None => BindingKey::allow_last(snap.next.as_ref().map(|(n, _)| n.as_str())),
            };
            let subject = LockSubject::Binding(key);
            self.lock(&call, &subject, true, "get_binding_for_update")?;
            if self.binding_snapshot(name)? != snap {
                self.release_for_retry(&call, &subject);
                continue;
            }
            let waiting = self.waiting(&subject);
            let callback_evict = waiting == Waiting::Writers;
            let callback_downgrade = waiting == Waiting::Readers;
            return Ok(match snap.bound {
                Some(oid) => GetBindingForUpdateResult {
                    found: true,
                    next_name: None,
                    oid: Some(oid),
                    callback_evict,
                    callback_downgrade,
                },
                None => GetBindingForUpdateResult {
                    found: false,
                    next_name: snap.next.as_ref().map(|(n, _)| n.clone()),
                    oid: snap.next.map(|(_, oid)| oid),
                    callback_evict,
                    callback_downgrade,
                },
            });
        }
        Err(Error::RetriesExhausted(format!(
            "get_binding_for_update {name:?}"
        )))
    }

    /// Prepare to remove a binding: write-lock the name and the next bound
    /// name, since removal widens the gap the next name's lock covers. For
    /// an unbound name only the next name is locked, for read.
    pub fn get_binding_for_remove(
        &self,
        node_id: NodeId,
        name: &str,
    ) -> Result<GetBindingForRemoveResult> {
        let call = self.begin_call(node_id)?;
        for _ in 0..self.config.max_range_retries {
            let snap = self.binding_snapshot(name)?;
            let boundary = LockSubject::Binding(BindingKey::allow_last(
                snap.next.as_ref().map(|(n, _)| n.as_str()),
            ));
            match snap.bound {
                Some(oid) => {
                    let name_subject = LockSubject::Binding(BindingKey::for_name(name));
                    self.lock(&call, &name_subject, true, "get_binding_for_remove")?;
                    if let Err(e) = self.lock(&call, &boundary, true, "get_binding_for_remove") {
                        self.release_for_retry(&call, &name_subject);
                        return Err(e);
                    }
                    if self.binding_snapshot(name)? != snap {
                        self.release_for_retry(&call, &boundary);
                        self.release_for_retry(&call, &name_subject);
                        continue;
                    }
                    let name_waiting = self.waiting(&name_subject);
                    let next_waiting = self.waiting(&boundary);
                    return Ok(GetBindingForRemoveResult {
                        found: true,
                        oid: Some(oid),
                        next_name: snap.next.as_ref().map(|(n, _)| n.clone()),
                        next_oid: snap.next.map(|(_, oid)| oid),
                        callback_evict: name_waiting == Waiting::Writers,
                        callback_downgrade: name_waiting == Waiting::Readers,
                        next_callback_evict: next_waiting == Waiting::Writers,
                        next_callback_downgrade: next_waiting == Waiting::Readers,
                    });
                }
                None => {
                    self.lock(&call, &boundary, false, "get_binding_for_remove")?;
                    if self.binding_snapshot(name)? != snap {
                        self.release_for_retry(&call, &boundary);
                        continue;
                    }
                    let next_waiting = self.waiting(&boundary);
                    return Ok(GetBindingForRemoveResult {
                        found: false,
                        oid: None,
                        next_name: snap.next.as_ref().map(|(n, _)| n.clone()),
                        next_oid: snap.next.map(|(_, oid)| oid),
                        callback_evict: false,
                        callback_downgrade: false,
                        next_callback_evict: next_waiting == Waiting::Writers,
                        next_callback_downgrade: next_waiting == Waiting::Readers,
                    });
                }
            }
        }
        Err(Error::RetriesExhausted(format!(
            "get_binding_for_remove {name:?}"
        )))
    }

    /// Find and read-lock the first bound name strictly after `after`
    /// (or the first bound name overall).
    pub fn next_bound_name(
        &self,
        node_id: NodeId,
        after: Option<&str>,
    ) -> Result<NextBoundNameResult> {
        let call = self.begin_call(node_id)?;
        let start = match after {
            Some(name) => successor(name),
            None => String::new(),
        };
        for _ in 0..self.config.max_range_retries {
            let next = {
                let mut txn = self.txn()?;
                txn.find_binding(&start)?
            };
            let subject = LockSubject::Binding(BindingKey::allow_last(
                next.as_ref().map(|(n, _)| n.as_str()),
            ));
            self.lock(&call, &subject, false, "next_bound_name")?;
            let check = {
                let mut txn = self.txn()?;
                txn.find_binding(&start)?
            };
            if check != next {
                self.release_for_retry(&call, &subject);
                continue;
            }
            return Ok(NextBoundNameResult {
                next_name: next.as_ref().map(|(n, _)| n.clone()),
                oid: next.map(|(_, oid)| oid),
                callback_evict: self.waiting(&subject) == Waiting::Writers,
            });
        }
        Err(Error::RetriesExhausted(format!(
            "next_bound_name after {after:?}"
        )))
    }

    // -- commit ------------------------------------------------------------

    /// Apply a node's transaction: object writes and deletes, plus binding
    /// sets (`Some(oid)`) and removals (`None`).
    ///
    /// The first `new_object_count` object updates create objects whose ids
    /// came from [`new_object_ids`](Self::new_object_ids); the server locks
    /// those here. Every other entry must already be write-locked by the
    /// node, or the commit fails without touching the store.
    pub fn commit(
        &self,
        node_id: NodeId,
        object_updates: &[(u64, Option<Vec<u8>>)],
        new_object_count: usize,
        binding_updates: &[(String, Option<u64>)],
    ) -> Result<()> {
        let call = self.begin_call(node_id)?;
        if new_object_count > object_updates.len() {
            return Err(Error::InvalidArgument(
                "new_object_count exceeds the number of object updates".into(),
            ));
        }
        let mut attempts = 0;
        loop {
            match self.commit_internal(&call, object_updates, new_object_count, binding_updates) {
                Ok(()) => return Ok(()),
                // Only a missed store acquisition is retried here. Lock-wait
                // failures abort the node's transaction and go to the caller.
                Err(e @ Error::StoreTimeout) => {
                    attempts += 1;
                    if attempts >= self.config.max_commit_retries {
                        return Err(Error::RetriesExhausted(format!(
                            "commit for node {node_id}: {e}"
                        )));
                    }
                    debug!(node = node_id, error = %e, "retrying commit");
                    thread::sleep(self.config.retry_wait());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn commit_internal(
        &self,
        call: &NodeCall,
        object_updates: &[(u64, Option<Vec<u8>>)],
        new_object_count: usize,
        binding_updates: &[(String, Option<u64>)],
    ) -> Result<()> {
        let mut txn = self.txn()?;
        // Binding locks for removed names are dead once the commit lands;
        // collected here and dropped after the store transaction succeeds.
        let mut release_after = Vec::new();
        for (i, (oid, data)) in object_updates.iter().enumerate() {
            let subject = LockSubject::Object(*oid);
            if i < new_object_count {
                self.lock(call, &subject, true, "commit")?;
            } else {
                self.check_locked(call, &subject, true)?;
            }
            match data {
                Some(bytes) => txn.put_object(*oid, bytes)?,
                None => txn.delete_object(*oid)?,
            }
        }
        for (name, value) in binding_updates {
            let hit = txn.find_binding(name)?;
            let exists = hit.as_ref().is_some_and(|(n, _)| n == name);
            // The key whose lock covers `name`: the name itself when bound,
            // otherwise the next bound name.
            let covering =
                LockSubject::Binding(BindingKey::allow_last(hit.as_ref().map(|(n, _)| n.as_str())));
            match value {
                Some(oid) => {
                    self.check_locked(call, &covering, true)?;
                    if !exists {
                        self.lock(call, &LockSubject::Binding(BindingKey::for_name(name)), true, "commit")?;
                    }
                    txn.put_binding(name, *oid)?;
                }
                None if !exists => {
                    // removing a name that is already gone: the covering
                    // lock proves the caller saw it gone
                    self.check_locked(call, &covering, false)?;
                }
                None => {
                    self.check_locked(call, &covering, true)?;
                    let following = txn.find_binding(&successor(name))?;
                    let following_key = LockSubject::Binding(BindingKey::allow_last(
                        following.as_ref().map(|(n, _)| n.as_str()),
                    ));
                    self.check_locked(call, &following_key, true)?;
                    txn.delete_binding(name)?;
                    release_after.push(covering.clone());
                }
            }
        }
        txn.commit()?;
        for subject in release_after {
            self.release_for_retry(call, &subject);
        }
        Ok(())
    }

    // -- node-driven lock transitions --------------------------------------

    /// The node has dropped an object from its cache; release its lock.
    pub fn evict_object(&self, node_id: NodeId, oid: u64) -> Result<()> {
        let call = self.begin_call(node_id)?;
        let subject = LockSubject::Object(oid);
        self.check_locked(&call, &subject, false)?;
        self.lock_manager.release_lock(call.node().locker(), &subject);
        call.note_unlocked(&subject);
        Ok(())
    }

    /// The node has marked a cached object read-only; downgrade its lock.
    pub fn downgrade_object(&self, node_id: NodeId, oid: u64) -> Result<()> {
        let call = self.begin_call(node_id)?;
        let subject = LockSubject::Object(oid);
        self.check_locked(&call, &subject, true)?;
        self.lock_manager
            .downgrade_lock(call.node().locker(), &subject);
        Ok(())
    }

    /// Release the node's lock on a binding key; `None` names the
    /// past-the-last sentinel.
    pub fn evict_binding(&self, node_id: NodeId, name: Option<&str>) -> Result<()> {
        let call = self.begin_call(node_id)?;
        let subject = LockSubject::Binding(BindingKey::allow_last(name));
        self.check_locked(&call, &subject, false)?;
        self.lock_manager.release_lock(call.node().locker(), &subject);
        call.note_unlocked(&subject);
        Ok(())
    }

    /// Downgrade the node's write lock on a binding key to a read lock.
    pub fn downgrade_binding(&self, node_id: NodeId, name: Option<&str>) -> Result<()> {
        let call = self.begin_call(node_id)?;
        let subject = LockSubject::Binding(BindingKey::allow_last(name));
        self.check_locked(&call, &subject, true)?;
        self.lock_manager
            .downgrade_lock(call.node().locker(), &subject);
        Ok(())
    }

    // -- class metadata ----------------------------------------------------

    /// Intern class metadata shared across nodes; equal bytes always map to
    /// the same id.
    pub fn get_class_id(&self, node_id: NodeId, info: &[u8]) -> Result<u32> {
        let _call = self.begin_call(node_id)?;
        if info.is_empty() {
            return Err(Error::InvalidArgument("class info must not be empty".into()));
        }
        let mut txn = self.txn()?;
        let id = txn.get_class_id(info)?;
        txn.commit()?;
        Ok(id)
    }

    pub fn get_class_info(&self, node_id: NodeId, class_id: u32) -> Result<Option<Vec<u8>>> {
        let _call = self.begin_call(node_id)?;
        let mut txn = self.txn()?;
        txn.get_class_info(class_id)
    }

    // -- helpers -----------------------------------------------------------

    fn begin_call(&self, node_id: NodeId) -> Result<NodeCall> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        NodeCall::begin(self.registry.get(node_id)?)
    }

    fn txn(&self) -> Result<Box<dyn StoreTxn + '_>> {
        self.store.transaction(self.config.txn_timeout())
    }

    fn allocate_node_id(&self) -> Result<NodeId> {
        let mut block = self.node_ids.lock();
        if block.next > block.last {
            let size = self.config.node_id_block_size;
            let mut txn = self.txn()?;
            let first = txn.allocate_ids(IdCounter::Node, size)?;
            txn.commit()?;
            block.next = first;
            block.last = first + size - 1;
        }
        let id = block.next;
        block.next += 1;
        Ok(id)
    }

    /// Acquire a lock on the node's behalf, asking conflicting owners to
    /// give the entry up while we wait.
    fn lock(&self, call: &NodeCall, subject: &LockSubject, for_write: bool, op: &str) -> Result<()> {
        match self
            .lock_manager
            .lock_no_wait(call.node().locker(), subject, for_write)
        {
            LockOutcome::Granted => {
                call.note_locked(subject);
                Ok(())
            }
            LockOutcome::Blocked(request) => {
                debug!(node = call.node_id(), %subject, for_write, op, "blocked; calling back owners");
                self.send_callback(call.node().clone(), subject.clone(), for_write);
                match self.lock_manager.wait_for_lock(&request) {
                    None => {
                        call.note_locked(subject);
                        Ok(())
                    }
                    Some(conflict) => Err(conflict_error(conflict, subject)),
                }
            }
        }
    }

    fn send_callback(&self, requester: Arc<NodeInfo>, subject: LockSubject, for_write: bool) {
        if let Some(tx) = self.callback_tx.lock().as_ref() {
            let _ = tx.send(CallbackRequest {
                requester,
                subject,
                for_write,
            });
        }
    }

    /// Verify the node holds a lock it claims to hold; a failure here means
    /// the node's cached state has diverged from the lock table.
    fn check_locked(&self, call: &NodeCall, subject: &LockSubject, for_write: bool) -> Result<()> {
        let owned = self
            .lock_manager
            .get_owners(subject)
            .iter()
            .any(|o| o.node_id() == call.node_id() && (!for_write || o.for_write()));
        if owned {
            Ok(())
        } else {
            let mode = if for_write { "write" } else { "read" };
            warn!(node = call.node_id(), %subject, mode, "operation on an unlocked entry");
            Err(Error::Consistency(format!(
                "node {} does not hold a {mode} lock on {subject}",
                call.node_id()
            )))
        }
    }

    fn release_for_retry(&self, call: &NodeCall, subject: &LockSubject) {
        self.lock_manager.release_lock(call.node().locker(), subject);
        call.note_unlocked(subject);
    }

    fn waiting(&self, subject: &LockSubject) -> Waiting {
        let waiters = self.lock_manager.get_waiters(subject);
        if waiters.is_empty() {
            Waiting::Nobody
        } else if waiters.iter().any(|w| w.for_write()) {
            Waiting::Writers
        } else {
            Waiting::Readers
        }
    }

    fn binding_snapshot(&self, name: &str) -> Result<BindingSnapshot> {
        let mut txn = self.txn()?;
        Ok(BindingSnapshot {
            bound: txn.get_binding(name)?,
            next: txn.find_binding(&successor(name))?,
        })
    }
}

impl Drop for CoordinatorServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The smallest string strictly greater than `name`.
fn successor(name: &str) -> String {
    let mut s = String::with_capacity(name.len() + 1);
    s.push_str(name);
    s.push('\0');
    s
}

fn conflict_error(conflict: LockConflict, subject: &LockSubject) -> Error {
    let subject = subject.to_string();
    let conflicting = conflict.conflicting;
    match conflict.kind {
        ConflictKind::Timeout => Error::LockTimeout {
            subject,
            conflicting,
        },
        ConflictKind::Deadlock => Error::Deadlock {
            subject,
            conflicting,
        },
        ConflictKind::Denied | ConflictKind::Blocked => Error::LockDenied {
            subject,
            conflicting,
        },
    }
}
