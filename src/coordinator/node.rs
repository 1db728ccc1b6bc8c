//! Per-node bookkeeping and the node registry.
//!
//! Each registered node tracks three things: the [`Locker`] identity its
//! lock requests are attributed to, the set of lock subjects it currently
//! holds, and a shutdown-aware count of its calls in flight. Shutdown flips
//! a flag that rejects new calls, then waits for the in-flight count to
//! drain before the node's locks are torn down.

use crate::common::error::{Error, Result};
use crate::coordinator::callback::CallbackClient;
use crate::coordinator::key::{LockSubject, NodeId};
use crate::coordinator::lock::Locker;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::Arc;
use tracing::debug;

/// State for one registered node.
pub struct NodeInfo {
    node_id: NodeId,
    locker: Arc<Locker>,
    callback: Arc<dyn CallbackClient>,
    held: Mutex<HashSet<LockSubject>>,
    calls: Mutex<CallState>,
    drained: Condvar,
}

impl std::fmt::Debug for NodeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeInfo")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct CallState {
    shutdown: bool,
    active_calls: usize,
}

impl NodeInfo {
    pub fn new(node_id: NodeId, callback: Arc<dyn CallbackClient>) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            locker: Locker::new(node_id),
            callback,
            held: Mutex::new(HashSet::new()),
            calls: Mutex::new(CallState::default()),
            drained: Condvar::new(),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn locker(&self) -> &Arc<Locker> {
        &self.locker
    }

    pub fn callback(&self) -> &Arc<dyn CallbackClient> {
        &self.callback
    }

    /// Record a call entering on this node's behalf; fails once shutdown
    /// has begun.
    pub fn call_started(&self) -> Result<()> {
        let mut calls = self.calls.lock();
        if calls.shutdown {
            return Err(Error::NodeShutdown(self.node_id));
        }
        calls.active_calls += 1;
        Ok(())
    }

    pub fn call_finished(&self) {
        let mut calls = self.calls.lock();
        debug_assert!(calls.active_calls > 0);
        calls.active_calls -= 1;
        if calls.shutdown && calls.active_calls == 0 {
            self.drained.notify_all();
        }
    }

    /// Start shutting the node down. Returns `false` if shutdown had
    /// already begun.
    pub fn begin_shutdown(&self) -> bool {
        let mut calls = self.calls.lock();
        if calls.shutdown {
            false
        } else {
            calls.shutdown = true;
            true
        }
    }

    /// Block until every in-flight call has finished. Only meaningful after
    /// [`begin_shutdown`](Self::begin_shutdown).
    pub fn wait_drained(&self) {
        let mut calls = self.calls.lock();
        debug_assert!(calls.shutdown);
        while calls.active_calls > 0 {
            self.drained.wait(&mut calls);
        }
    }

    pub fn note_locked(&self, subject: &LockSubject) {
        self.held.lock().insert(subject.clone());
    }

    pub fn note_unlocked(&self, subject: &LockSubject) {
        self.held.lock().remove(subject);
    }

    /// Drain the held-lock ledger, leaving it empty.
    pub fn take_held(&self) -> Vec<LockSubject> {
        self.held.lock().drain().collect()
    }
}

/// RAII guard pairing [`NodeInfo::call_started`] with
/// [`NodeInfo::call_finished`].
pub struct NodeCall {
    node: Arc<NodeInfo>,
}

impl NodeCall {
    pub fn begin(node: Arc<NodeInfo>) -> Result<Self> {
        node.call_started()?;
        Ok(Self { node })
    }

    pub fn node(&self) -> &Arc<NodeInfo> {
        &self.node
    }
}

impl Deref for NodeCall {
    type Target = NodeInfo;

    fn deref(&self) -> &NodeInfo {
        &self.node
    }
}

impl Drop for NodeCall {
    fn drop(&mut self) {
        self.node.call_finished();
    }
}

/// The set of currently registered nodes.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: Mutex<HashMap<NodeId, Arc<NodeInfo>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: Arc<NodeInfo>) {
        debug!(node = node.node_id(), "node registered");
        self.nodes.lock().insert(node.node_id(), node);
    }

    pub fn get(&self, node_id: NodeId) -> Result<Arc<NodeInfo>> {
        self.nodes
            .lock()
            .get(&node_id)
            .cloned()
            .ok_or(Error::UnknownNode(node_id))
    }

    pub fn remove(&self, node_id: NodeId) -> Option<Arc<NodeInfo>> {
        let removed = self.nodes.lock().remove(&node_id);
        if removed.is_some() {
            debug!(node = node_id, "node removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }
}
