//! Integration tests for cachecoord

use cachecoord::{
    CallbackClient, CoordinatorConfig, CoordinatorServer, Error, MemStore, NodeId,
    NoopCallbackClient, SledStore,
};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Client for a node that never gives cached entries up voluntarily; its
/// locks move only through explicit evict/downgrade calls or shutdown.
struct KeepClient;

impl CallbackClient for KeepClient {
    fn request_evict_object(&self, _oid: u64, _requester: NodeId) -> anyhow::Result<bool> {
        Ok(false)
    }

    fn request_downgrade_object(&self, _oid: u64, _requester: NodeId) -> anyhow::Result<bool> {
        Ok(false)
    }

    fn request_evict_binding(
        &self,
        _name: Option<&str>,
        _requester: NodeId,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }

    fn request_downgrade_binding(
        &self,
        _name: Option<&str>,
        _requester: NodeId,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Like [`KeepClient`], but raises a flag when the server first contacts it,
/// so a test can tell that another node is parked on one of its locks.
struct StallClient {
    contacted: Arc<AtomicBool>,
}

impl StallClient {
    fn keep(&self) -> anyhow::Result<bool> {
        self.contacted.store(true, Ordering::SeqCst);
        Ok(false)
    }
}

impl CallbackClient for StallClient {
    fn request_evict_object(&self, _oid: u64, _requester: NodeId) -> anyhow::Result<bool> {
        self.keep()
    }

    fn request_downgrade_object(&self, _oid: u64, _requester: NodeId) -> anyhow::Result<bool> {
        self.keep()
    }

    fn request_evict_binding(
        &self,
        _name: Option<&str>,
        _requester: NodeId,
    ) -> anyhow::Result<bool> {
        self.keep()
    }

    fn request_downgrade_binding(
        &self,
        _name: Option<&str>,
        _requester: NodeId,
    ) -> anyhow::Result<bool> {
        self.keep()
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached in time");
}

fn config(lock_timeout_ms: u64) -> CoordinatorConfig {
    CoordinatorConfig {
        lock_timeout_ms,
        ..CoordinatorConfig::default()
    }
}

fn mem_server(lock_timeout_ms: u64) -> Arc<CoordinatorServer> {
    init_tracing();
    Arc::new(CoordinatorServer::new(config(lock_timeout_ms), Arc::new(MemStore::new())).unwrap())
}

fn register(server: &CoordinatorServer) -> NodeId {
    server
        .register_node(Arc::new(NoopCallbackClient))
        .unwrap()
        .node_id
}

#[test]
fn test_concurrent_increments_are_serialized() {
    const NODES: usize = 4;
    const INCREMENTS: u64 = 25;

    let server = mem_server(5_000);
    let setup = register(&server);
    let oid = server.new_object_ids(setup, 1).unwrap();
    server
        .commit(setup, &[(oid, Some(0u64.to_be_bytes().to_vec()))], 1, &[])
        .unwrap();
    server.evict_object(setup, oid).unwrap();

    let mut handles = Vec::new();
    for _ in 0..NODES {
        let server = server.clone();
        handles.push(thread::spawn(move || {
            let node = register(&server);
            let mut rng = rand::thread_rng();
            let mut done = 0;
            while done < INCREMENTS {
                // Read-modify-write under the write lock. A coherence
                // callback may snatch the lock between the read and the
                // commit (every node here answers evictions immediately);
                // the commit then fails cleanly and the update is retried.
                let current = match server.get_object_for_update(node, oid) {
                    Ok(result) => result,
                    Err(e) if e.is_retryable() => continue,
                    Err(e) => panic!("unexpected lock error: {e}"),
                };
                let value = u64::from_be_bytes(current.data.unwrap()[..8].try_into().unwrap());
                let updated = (value + 1).to_be_bytes().to_vec();
                match server.commit(node, &[(oid, Some(updated))], 0, &[]) {
                    Ok(()) => done += 1,
                    Err(Error::Consistency(_)) => {}
                    Err(e) => panic!("unexpected commit error: {e}"),
                }
                thread::sleep(Duration::from_micros(rng.gen_range(0..200)));
            }
            node
        }));
    }
    let nodes: Vec<NodeId> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let reader = register(&server);
    let data = server.get_object(reader, oid).unwrap().data.unwrap();
    let value = u64::from_be_bytes(data[..8].try_into().unwrap());
    assert_eq!(value, NODES as u64 * INCREMENTS, "lost or phantom updates");
    for node in nodes {
        server.shutdown_node(node).unwrap();
    }
}

#[test]
fn test_read_request_downgrades_writer() {
    let server = mem_server(5_000);
    let writer = register(&server);
    let reader = register(&server);
    let oid = server.new_object_ids(writer, 1).unwrap();
    server
        .commit(writer, &[(oid, Some(b"shared".to_vec()))], 1, &[])
        .unwrap();

    // The writer still holds the write lock from commit; the read triggers
    // a downgrade callback and then proceeds.
    let result = server.get_object(reader, oid).unwrap();
    assert_eq!(result.data.as_deref(), Some(&b"shared"[..]));
    assert!(!result.callback_evict, "nobody is waiting on a read share");
    // Both nodes now read-share: the writer can still read without blocking.
    let shared = server.get_object(writer, oid).unwrap();
    assert!(shared.data.is_some());
    assert!(!shared.callback_evict);
}

#[test]
fn test_write_request_evicts_reader() {
    let server = mem_server(5_000);
    let a = register(&server);
    let b = register(&server);
    let oid = server.new_object_ids(a, 1).unwrap();
    server
        .commit(a, &[(oid, Some(b"v1".to_vec()))], 1, &[])
        .unwrap();
    server.evict_object(a, oid).unwrap();

    assert!(server.get_object(a, oid).unwrap().data.is_some());
    // b takes the write lock; a's read lock is called back and released
    let update = server.get_object_for_update(b, oid).unwrap();
    assert_eq!(update.data.as_deref(), Some(&b"v1"[..]));
    server
        .commit(b, &[(oid, Some(b"v2".to_vec()))], 0, &[])
        .unwrap();
    server.evict_object(b, oid).unwrap();

    let result = server.get_object(a, oid).unwrap();
    assert_eq!(result.data.as_deref(), Some(&b"v2"[..]));
}

#[test]
fn test_lock_timeout_against_stubborn_owner() {
    let server = mem_server(200);
    let keeper = server.register_node(Arc::new(KeepClient)).unwrap().node_id;
    let other = register(&server);
    let oid = server.new_object_ids(keeper, 1).unwrap();
    server
        .commit(keeper, &[(oid, Some(b"held".to_vec()))], 1, &[])
        .unwrap();

    match server.get_object_for_update(other, oid) {
        Err(Error::LockTimeout { conflicting, .. }) => assert_eq!(conflicting, keeper),
        other => panic!("expected a lock timeout, got {other:?}"),
    }
}

#[test]
fn test_commit_surfaces_lock_timeout_unretried() {
    init_tracing();
    let config = CoordinatorConfig {
        lock_timeout_ms: 100,
        max_commit_retries: 3,
        ..CoordinatorConfig::default()
    };
    let server = CoordinatorServer::new(config, Arc::new(MemStore::new())).unwrap();
    let keeper = server.register_node(Arc::new(KeepClient)).unwrap().node_id;
    let other = register(&server);

    // The keeper read-locks an id the other node allocated but has not yet
    // created, then sits on it. Committing the new object needs the write
    // lock, and that wait failing is a transaction abort, not something the
    // commit loop may quietly retry into a retries-exhausted error.
    let oid = server.new_object_ids(other, 1).unwrap();
    assert!(server.get_object(keeper, oid).unwrap().data.is_none());
    match server.commit(other, &[(oid, Some(b"new".to_vec()))], 1, &[]) {
        Err(Error::LockTimeout { conflicting, .. }) => assert_eq!(conflicting, keeper),
        other => panic!("expected a lock timeout, got {other:?}"),
    }
}

#[test]
fn test_shutdown_releases_locks_of_stubborn_owner() {
    let server = mem_server(5_000);
    let keeper = server.register_node(Arc::new(KeepClient)).unwrap().node_id;
    let other = register(&server);
    let oid = server.new_object_ids(keeper, 1).unwrap();
    server
        .commit(keeper, &[(oid, Some(b"held".to_vec()))], 1, &[])
        .unwrap();

    let server2 = server.clone();
    let waiter = thread::spawn(move || server2.get_object_for_update(other, oid));
    thread::sleep(Duration::from_millis(50));
    server.shutdown_node(keeper).unwrap();
    let result = waiter.join().unwrap().unwrap();
    assert_eq!(result.data.as_deref(), Some(&b"held"[..]));
}

#[test]
fn test_shutdown_denies_waiting_node() {
    let server = mem_server(5_000);
    let keeper = server.register_node(Arc::new(KeepClient)).unwrap().node_id;
    let blocked = register(&server);
    let oid = server.new_object_ids(keeper, 1).unwrap();
    server
        .commit(keeper, &[(oid, Some(b"held".to_vec()))], 1, &[])
        .unwrap();

    let server2 = server.clone();
    let waiter = thread::spawn(move || server2.get_object(blocked, oid));
    thread::sleep(Duration::from_millis(50));
    // shutting the waiting node down fails its wait instead of stranding it
    server.shutdown_node(blocked).unwrap();
    match waiter.join().unwrap() {
        Err(Error::LockDenied { conflicting, .. }) => assert_eq!(conflicting, keeper),
        other => panic!("expected a denied lock, got {other:?}"),
    }
}

#[test]
fn test_binding_namespace_across_nodes() {
    let server = mem_server(5_000);
    let a = register(&server);
    let b = register(&server);

    let first = server.new_object_ids(a, 2).unwrap();
    server
        .commit(
            a,
            &[
                (first, Some(b"apple".to_vec())),
                (first + 1, Some(b"cherry".to_vec())),
            ],
            2,
            &[],
        )
        .unwrap();
    for (name, oid) in [("apple", first), ("cherry", first + 1)] {
        let unbound = server.get_binding_for_update(a, name).unwrap();
        assert!(!unbound.found);
        server
            .commit(a, &[], 0, &[(name.to_owned(), Some(oid))])
            .unwrap();
    }
    // drop a's binding locks so b can range-lock freely
    server.evict_binding(a, Some("apple")).unwrap();
    server.evict_binding(a, Some("cherry")).unwrap();
    server.evict_binding(a, None).unwrap();

    // a miss between two bound names reports and locks the following name
    let miss = server.get_binding(b, "banana").unwrap();
    assert!(!miss.found);
    assert_eq!(miss.next_name.as_deref(), Some("cherry"));
    assert_eq!(miss.oid, Some(first + 1));
    server.evict_binding(b, Some("cherry")).unwrap();

    // removal locks the name and the next name so the gap stays closed
    let remove = server.get_binding_for_remove(b, "apple").unwrap();
    assert!(remove.found);
    assert_eq!(remove.oid, Some(first));
    assert_eq!(remove.next_name.as_deref(), Some("cherry"));
    server.commit(b, &[], 0, &[("apple".to_owned(), None)]).unwrap();

    let gone = server.get_binding(b, "apple").unwrap();
    assert!(!gone.found);
    assert_eq!(gone.next_name.as_deref(), Some("cherry"));
}

#[test]
fn test_binding_lookup_retries_after_concurrent_insert() {
    let server = mem_server(5_000);
    let contacted = Arc::new(AtomicBool::new(false));
    let writer = server
        .register_node(Arc::new(StallClient {
            contacted: contacted.clone(),
        }))
        .unwrap()
        .node_id;
    let scanner = register(&server);

    let oid = server.new_object_ids(writer, 2).unwrap();
    server
        .commit(
            writer,
            &[(oid, Some(b"c".to_vec())), (oid + 1, Some(b"b".to_vec()))],
            2,
            &[],
        )
        .unwrap();
    server.get_binding_for_update(writer, "carrot").unwrap();
    server
        .commit(writer, &[], 0, &[("carrot".to_owned(), Some(oid))])
        .unwrap();

    // The scanner misses on "banana" and goes to read-lock the next bound
    // name, "carrot" — which the writer still write-holds and will not give
    // up, so the scanner parks there after taking its snapshot.
    let server2 = server.clone();
    let handle = thread::spawn(move || server2.get_binding(scanner, "banana"));
    wait_until(|| contacted.load(Ordering::SeqCst));

    // With the scanner parked, slide "bat" into the gap it scanned, then
    // let go of the locks. The snapshot re-check must force a second pass;
    // answering "carrot" now would lock the wrong covering key.
    server
        .commit(writer, &[], 0, &[("bat".to_owned(), Some(oid + 1))])
        .unwrap();
    server.evict_binding(writer, Some("bat")).unwrap();
    server.evict_binding(writer, Some("carrot")).unwrap();

    let result = handle.join().unwrap().unwrap();
    assert!(!result.found);
    assert_eq!(result.next_name.as_deref(), Some("bat"));
    assert_eq!(result.oid, Some(oid + 1));
}

#[test]
fn test_remove_miss_reports_readers_waiting_on_next_name() {
    let server = mem_server(5_000);
    let contacted = Arc::new(AtomicBool::new(false));
    let holder = server
        .register_node(Arc::new(StallClient {
            contacted: contacted.clone(),
        }))
        .unwrap()
        .node_id;
    let reader = register(&server);

    let oid = server.new_object_ids(holder, 1).unwrap();
    server
        .commit(holder, &[(oid, Some(b"c".to_vec()))], 1, &[])
        .unwrap();
    server.get_binding_for_update(holder, "carrot").unwrap();
    server
        .commit(holder, &[], 0, &[("carrot".to_owned(), Some(oid))])
        .unwrap();

    // A reader queues up on "carrot" behind the holder's write lock.
    let server2 = server.clone();
    let handle = thread::spawn(move || server2.get_binding(reader, "banana"));
    wait_until(|| contacted.load(Ordering::SeqCst));

    // The holder already write-holds the boundary key, so its own removal
    // lookup of the unbound "banana" is granted at once and must report the
    // queued reader as a downgrade, not an eviction.
    let result = server.get_binding_for_remove(holder, "banana").unwrap();
    assert!(!result.found);
    assert_eq!(result.next_name.as_deref(), Some("carrot"));
    assert!(!result.next_callback_evict);
    assert!(result.next_callback_downgrade);

    server.downgrade_binding(holder, Some("carrot")).unwrap();
    let parked = handle.join().unwrap().unwrap();
    assert!(!parked.found);
    assert_eq!(parked.next_name.as_deref(), Some("carrot"));
}

#[test]
fn test_next_bound_name_scan_is_exhaustive() {
    let server = mem_server(5_000);
    let node = register(&server);
    let names = ["alfa", "bravo", "charlie", "delta", "echo"];
    let first = server.new_object_ids(node, names.len() as u64).unwrap();
    let objects: Vec<_> = (0..names.len() as u64)
        .map(|i| (first + i, Some(vec![1u8])))
        .collect();
    server.commit(node, &objects, names.len(), &[]).unwrap();
    for (i, name) in names.iter().enumerate() {
        server.get_binding_for_update(node, name).unwrap();
        server
            .commit(node, &[], 0, &[(name.to_string(), Some(first + i as u64))])
            .unwrap();
    }

    let mut walked = Vec::new();
    let mut cursor: Option<String> = None;
    while let Some(name) = server
        .next_bound_name(node, cursor.as_deref())
        .unwrap()
        .next_name
    {
        walked.push(name.clone());
        cursor = Some(name);
    }
    assert_eq!(walked, names);
}

#[test]
fn test_failed_commit_leaves_store_untouched() {
    let server = mem_server(200);
    let node = register(&server);
    let oid = server.new_object_ids(node, 1).unwrap();
    server
        .commit(node, &[(oid, Some(b"before".to_vec()))], 1, &[])
        .unwrap();
    server.get_binding_for_update(node, "bound").unwrap();
    server
        .commit(node, &[], 0, &[("bound".to_owned(), Some(oid))])
        .unwrap();

    // A mixed commit where the object entry was never write-locked by this
    // node must fail and must not apply the binding update either.
    let intruder = register(&server);
    let err = server
        .commit(
            intruder,
            &[(oid, Some(b"after".to_vec()))],
            0,
            &[("bound".to_owned(), None)],
        )
        .unwrap_err();
    assert!(matches!(err, Error::Consistency(_)), "{err:?}");
    assert_eq!(
        server.get_object(node, oid).unwrap().data.as_deref(),
        Some(&b"before"[..])
    );
    assert!(server.get_binding(node, "bound").unwrap().found);
}

#[test]
fn test_object_scan_visits_every_object() {
    let server = mem_server(5_000);
    let node = register(&server);
    let first = server.new_object_ids(node, 3).unwrap();
    let objects: Vec<_> = (0..3).map(|i| (first + i, Some(vec![i as u8]))).collect();
    server.commit(node, &objects, 3, &[]).unwrap();

    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let next = server.next_object_id(node, cursor).unwrap();
        match next.oid {
            Some(oid) => {
                assert!(next.data.is_some());
                seen.push(oid);
                cursor = Some(oid);
            }
            None => break,
        }
    }
    assert_eq!(seen, vec![first, first + 1, first + 2]);
}

#[test]
fn test_sled_store_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("coord");
    let oid;
    {
        let store = Arc::new(SledStore::open(&path).unwrap());
        let server = CoordinatorServer::new(config(1_000), store).unwrap();
        let node = register(&server);
        oid = server.new_object_ids(node, 1).unwrap();
        server
            .commit(node, &[(oid, Some(b"durable".to_vec()))], 1, &[])
            .unwrap();
        server.get_binding_for_update(node, "root").unwrap();
        server
            .commit(node, &[], 0, &[("root".to_owned(), Some(oid))])
            .unwrap();
        server.shutdown();
    }
    {
        let store = Arc::new(SledStore::open(&path).unwrap());
        let server = CoordinatorServer::new(config(1_000), store).unwrap();
        let node = register(&server);
        let binding = server.get_binding(node, "root").unwrap();
        assert!(binding.found);
        assert_eq!(binding.oid, Some(oid));
        assert_eq!(
            server.get_object(node, oid).unwrap().data.as_deref(),
            Some(&b"durable"[..])
        );
    }
}

#[test]
fn test_node_ids_unique_across_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("coord");
    let first_ids: Vec<NodeId>;
    {
        let store = Arc::new(SledStore::open(&path).unwrap());
        let server = CoordinatorServer::new(config(1_000), store).unwrap();
        first_ids = (0..3).map(|_| register(&server)).collect();
    }
    let store = Arc::new(SledStore::open(&path).unwrap());
    let server = CoordinatorServer::new(config(1_000), store).unwrap();
    let reborn = register(&server);
    assert!(
        !first_ids.contains(&reborn),
        "node id {reborn} reused after restart"
    );
}
