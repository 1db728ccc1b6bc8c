//! Cache-coherence callbacks.
//!
//! When a lock request conflicts with owners on other nodes, the server
//! queues a [`CallbackRequest`]. A small pool of worker threads drains the
//! queue and asks each conflicting owner, through its [`CallbackClient`], to
//! evict the cached entry (the requester wants write access) or downgrade it
//! to read-only (the owner holds write access but the requester only reads).
//!
//! A client answering `Ok(true)` has already given the entry up, and the
//! worker releases or downgrades the owner's lock on the spot. `Ok(false)`
//! means the node is still using the entry and will give it up through a
//! later evict/downgrade call of its own. Transport errors are retried a
//! configured number of times, then dropped; the lock timeout is the
//! backstop when a client never answers.
//!
//! The one-shot flag on each owning request guarantees at most one callback
//! per owner per lock grant, no matter how many requesters pile up.

use crate::coordinator::key::{LockSubject, NodeId};
use crate::coordinator::lock::LockManager;
use crate::coordinator::node::{NodeCall, NodeInfo, NodeRegistry};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Client half of the coherence protocol, implemented by the transport layer
/// for each registered node.
///
/// Binding callbacks take `None` for the past-the-last-binding sentinel.
pub trait CallbackClient: Send + Sync {
    fn request_evict_object(&self, oid: u64, requester: NodeId) -> anyhow::Result<bool>;
    fn request_downgrade_object(&self, oid: u64, requester: NodeId) -> anyhow::Result<bool>;
    fn request_evict_binding(&self, name: Option<&str>, requester: NodeId) -> anyhow::Result<bool>;
    fn request_downgrade_binding(
        &self,
        name: Option<&str>,
        requester: NodeId,
    ) -> anyhow::Result<bool>;
}

/// Client that always gives entries up immediately. Useful for nodes that
/// keep no local cache, and for tests.
pub struct NoopCallbackClient;

impl CallbackClient for NoopCallbackClient {
    fn request_evict_object(&self, _oid: u64, _requester: NodeId) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn request_downgrade_object(&self, _oid: u64, _requester: NodeId) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn request_evict_binding(
        &self,
        _name: Option<&str>,
        _requester: NodeId,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn request_downgrade_binding(
        &self,
        _name: Option<&str>,
        _requester: NodeId,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// A blocked lock attempt whose conflicting owners should be called back.
pub struct CallbackRequest {
    pub requester: Arc<NodeInfo>,
    pub subject: LockSubject,
    pub for_write: bool,
}

/// Worker pool servicing [`CallbackRequest`]s.
pub struct CallbackPool {
    workers: Vec<thread::JoinHandle<()>>,
}

impl CallbackPool {
    pub fn start(
        num_threads: usize,
        max_retries: u32,
        retry_wait: Duration,
        lock_manager: Arc<LockManager>,
        registry: Arc<NodeRegistry>,
    ) -> (Sender<CallbackRequest>, Self) {
        assert!(num_threads >= 1, "num_callback_threads must be at least 1");
        let (tx, rx) = crossbeam_channel::unbounded::<CallbackRequest>();
        let workers = (0..num_threads)
            .map(|i| {
                let rx = rx.clone();
                let lock_manager = lock_manager.clone();
                let registry = registry.clone();
                thread::Builder::new()
                    .name(format!("callback-{i}"))
                    .spawn(move || {
                        worker_loop(rx, max_retries, retry_wait, lock_manager, registry)
                    })
                    .unwrap_or_else(|e| panic!("failed to spawn callback worker: {e}"))
            })
            .collect();
        (tx, Self { workers })
    }

    /// Join the workers. The caller must have dropped every sender first so
    /// the receive loops see the channel disconnect.
    pub fn shutdown(mut self) {
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    rx: Receiver<CallbackRequest>,
    max_retries: u32,
    retry_wait: Duration,
    lock_manager: Arc<LockManager>,
    registry: Arc<NodeRegistry>,
) {
    while let Ok(request) = rx.recv() {
        service(&request, max_retries, retry_wait, &lock_manager, &registry);
    }
}

fn service(
    request: &CallbackRequest,
    max_retries: u32,
    retry_wait: Duration,
    lock_manager: &LockManager,
    registry: &NodeRegistry,
) {
    // A requester already shutting down has no use for the lock
    let _call = match NodeCall::begin(request.requester.clone()) {
        Ok(call) => call,
        Err(_) => return,
    };
    let requester_id = request.requester.node_id();
    for owner in lock_manager.get_owners(&request.subject) {
        if owner.node_id() == requester_id {
            continue;
        }
        if !owner.note_callback() {
            continue; // a callback for this grant is already in flight
        }
        let owner_node = match registry.get(owner.node_id()) {
            Ok(node) => node,
            Err(_) => continue, // owner was shut down; its locks go with it
        };
        let downgrade = owner.for_write() && !request.for_write;
        let mut attempt = 0;
        loop {
            match issue(owner_node.callback(), &request.subject, downgrade, requester_id) {
                Ok(true) => {
                    debug!(
                        owner = owner.node_id(),
                        subject = %request.subject,
                        downgrade,
                        "callback released entry"
                    );
                    if downgrade {
                        lock_manager.downgrade_lock(owner_node.locker(), &request.subject);
                    } else {
                        lock_manager.release_lock(owner_node.locker(), &request.subject);
                        owner_node.note_unlocked(&request.subject);
                    }
                    break;
                }
                Ok(false) => break, // the node will give the entry up later
                Err(e) => {
                    attempt += 1;
                    if attempt > max_retries {
                        warn!(
                            owner = owner.node_id(),
                            subject = %request.subject,
                            error = %e,
                            "callback failed; giving up"
                        );
                        break;
                    }
                    thread::sleep(retry_wait);
                }
            }
        }
    }
}

fn issue(
    client: &Arc<dyn CallbackClient>,
    subject: &LockSubject,
    downgrade: bool,
    requester: NodeId,
) -> anyhow::Result<bool> {
    match subject {
        LockSubject::Object(oid) => {
            if downgrade {
                client.request_downgrade_object(*oid, requester)
            } else {
                client.request_evict_object(*oid, requester)
            }
        }
        LockSubject::Binding(key) => {
            if downgrade {
                client.request_downgrade_binding(key.name(), requester)
            } else {
                client.request_evict_binding(key.name(), requester)
            }
        }
    }
}
