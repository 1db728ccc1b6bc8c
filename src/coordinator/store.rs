//! Persistent state behind the coordinator.
//!
//! A [`DataStore`] hands out short single-writer transactions over three
//! kinds of state: object blobs keyed by object id, name-to-object bindings
//! ordered by name, and interned class metadata. A transaction that is
//! dropped without [`StoreTxn::commit`] rolls back through its undo log.
//!
//! Two implementations: [`MemStore`] keeps everything in ordered maps and
//! is the fixture for tests; [`SledStore`] keeps the same layout in sled
//! trees with big-endian keys so range scans agree with the in-memory
//! ordering.

use crate::common::error::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Counters from which id blocks are allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdCounter {
    Object,
    Node,
}

/// A store transaction. All reads see the effects of earlier writes in the
/// same transaction. Dropping the transaction without committing undoes its
/// writes.
pub trait StoreTxn {
    fn get_object(&mut self, oid: u64) -> Result<Option<Vec<u8>>>;
    fn put_object(&mut self, oid: u64, data: &[u8]) -> Result<()>;
    fn delete_object(&mut self, oid: u64) -> Result<()>;
    /// First existing object id greater than or equal to `from`.
    fn find_object(&mut self, from: u64) -> Result<Option<u64>>;

    fn get_binding(&mut self, name: &str) -> Result<Option<u64>>;
    fn put_binding(&mut self, name: &str, oid: u64) -> Result<()>;
    /// Returns whether the binding existed.
    fn delete_binding(&mut self, name: &str) -> Result<bool>;
    /// First binding whose name is greater than or equal to `from`, in name
    /// order.
    fn find_binding(&mut self, from: &str) -> Result<Option<(String, u64)>>;

    /// Reserve `count` consecutive ids from a counter; returns the first.
    fn allocate_ids(&mut self, counter: IdCounter, count: u64) -> Result<u64>;

    /// Intern class metadata, returning its stable id.
    fn get_class_id(&mut self, info: &[u8]) -> Result<u32>;
    fn get_class_info(&mut self, class_id: u32) -> Result<Option<Vec<u8>>>;

    fn commit(self: Box<Self>) -> Result<()>;
}

/// Factory for store transactions.
pub trait DataStore: Send + Sync + 'static {
    /// Begin a transaction, waiting up to `timeout` for the store to become
    /// available.
    fn transaction(&self, timeout: Duration) -> Result<Box<dyn StoreTxn + '_>>;
}

#[derive(Debug)]
enum UndoOp {
    Object { oid: u64, prev: Option<Vec<u8>> },
    Binding { name: String, prev: Option<u64> },
    Counter { which: IdCounter, prev: u64 },
    Class { class_id: u32, info: Vec<u8> },
}

// ---------------------------------------------------------------------------
// In-memory store

struct MemInner {
    objects: BTreeMap<u64, Vec<u8>>,
    bindings: BTreeMap<String, u64>,
    classes: HashMap<u32, Vec<u8>>,
    class_ids: HashMap<Vec<u8>, u32>,
    next_object_id: u64,
    next_node_id: u64,
    next_class_id: u32,
}

/// Volatile [`DataStore`] over ordered maps.
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemInner {
                objects: BTreeMap::new(),
                bindings: BTreeMap::new(),
                classes: HashMap::new(),
                class_ids: HashMap::new(),
                next_object_id: 1,
                next_node_id: 1,
                next_class_id: 1,
            }),
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStore for MemStore {
    fn transaction(&self, timeout: Duration) -> Result<Box<dyn StoreTxn + '_>> {
        let guard = self
            .inner
            .try_lock_for(timeout)
            .ok_or(Error::StoreTimeout)?;
        Ok(Box::new(MemTxn {
            inner: guard,
            undo: Vec::new(),
            committed: false,
        }))
    }
}

struct MemTxn<'a> {
    inner: MutexGuard<'a, MemInner>,
    undo: Vec<UndoOp>,
    committed: bool,
}

impl StoreTxn for MemTxn<'_> {
    fn get_object(&mut self, oid: u64) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.objects.get(&oid).cloned())
    }

    fn put_object(&mut self, oid: u64, data: &[u8]) -> Result<()> {
        let prev = self.inner.objects.insert(oid, data.to_vec());
        self.undo.push(UndoOp::Object { oid, prev });
        Ok(())
    }

    fn delete_object(&mut self, oid: u64) -> Result<()> {
        if let Some(prev) = self.inner.objects.remove(&oid) {
            self.undo.push(UndoOp::Object {
                oid,
                prev: Some(prev),
            });
        }
        Ok(())
    }

    fn find_object(&mut self, from: u64) -> Result<Option<u64>> {
        Ok(self.inner.objects.range(from..).next().map(|(oid, _)| *oid))
    }

    fn get_binding(&mut self, name: &str) -> Result<Option<u64>> {
        Ok(self.inner.bindings.get(name).copied())
    }

    fn put_binding(&mut self, name: &str, oid: u64) -> Result<()> {
        let prev = self.inner.bindings.insert(name.to_owned(), oid);
        self.undo.push(UndoOp::Binding {
            name: name.to_owned(),
            prev,
        });
        Ok(())
    }

    fn delete_binding(&mut self, name: &str) -> Result<bool> {
        match self.inner.bindings.remove(name) {
            Some(prev) => {
                self.undo.push(UndoOp::Binding {
                    name: name.to_owned(),
                    prev: Some(prev),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn find_binding(&mut self, from: &str) -> Result<Option<(String, u64)>> {
        Ok(self
            .inner
            .bindings
            .range(from.to_owned()..)
            .next()
            .map(|(name, oid)| (name.clone(), *oid)))
    }

    fn allocate_ids(&mut self, counter: IdCounter, count: u64) -> Result<u64> {
        let slot = match counter {
            IdCounter::Object => &mut self.inner.next_object_id,
            IdCounter::Node => &mut self.inner.next_node_id,
        };
        let first = *slot;
        *slot = first
            .checked_add(count)
            .ok_or_else(|| Error::Consistency("id counter overflow".into()))?;
        self.undo.push(UndoOp::Counter {
            which: counter,
            prev: first,
        });
        Ok(first)
    }

    fn get_class_id(&mut self, info: &[u8]) -> Result<u32> {
        if let Some(id) = self.inner.class_ids.get(info) {
            return Ok(*id);
        }
        let id = self.inner.next_class_id;
        self.inner.next_class_id += 1;
        self.inner.class_ids.insert(info.to_vec(), id);
        self.inner.classes.insert(id, info.to_vec());
        self.undo.push(UndoOp::Class {
            class_id: id,
            info: info.to_vec(),
        });
        Ok(id)
    }

    fn get_class_info(&mut self, class_id: u32) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.classes.get(&class_id).cloned())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.committed = true;
        Ok(())
    }
}

impl Drop for MemTxn<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        while let Some(op) = self.undo.pop() {
            match op {
                UndoOp::Object { oid, prev } => match prev {
                    Some(data) => {
                        self.inner.objects.insert(oid, data);
                    }
                    None => {
                        self.inner.objects.remove(&oid);
                    }
                },
                UndoOp::Binding { name, prev } => match prev {
                    Some(oid) => {
                        self.inner.bindings.insert(name, oid);
                    }
                    None => {
                        self.inner.bindings.remove(&name);
                    }
                },
                UndoOp::Counter { which, prev } => match which {
                    IdCounter::Object => self.inner.next_object_id = prev,
                    IdCounter::Node => self.inner.next_node_id = prev,
                },
                UndoOp::Class { class_id, info } => {
                    self.inner.class_ids.remove(&info);
                    self.inner.classes.remove(&class_id);
                    self.inner.next_class_id = class_id;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Sled-backed store

const NEXT_OBJECT_ID: &[u8] = b"next_object_id";
const NEXT_NODE_ID: &[u8] = b"next_node_id";
const NEXT_CLASS_ID: &[u8] = b"next_class_id";

/// Durable [`DataStore`] over sled trees.
///
/// Object keys are big-endian ids and binding keys are raw name bytes, so
/// sled's lexicographic key order matches the scan order the coordinator
/// expects. Transactions are serialized by a store-wide mutex; with one
/// writer at a time, an in-memory undo log is enough for rollback.
pub struct SledStore {
    _db: sled::Db,
    objects: sled::Tree,
    bindings: sled::Tree,
    info: sled::Tree,
    classes: sled::Tree,
    txn_lock: Mutex<()>,
}

impl SledStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        let store = Self {
            objects: db.open_tree("objects")?,
            bindings: db.open_tree("bindings")?,
            info: db.open_tree("info")?,
            classes: db.open_tree("classes")?,
            _db: db,
            txn_lock: Mutex::new(()),
        };
        info!(path = %path.display(), "store opened");
        Ok(store)
    }

    fn counter_key(counter: IdCounter) -> &'static [u8] {
        match counter {
            IdCounter::Object => NEXT_OBJECT_ID,
            IdCounter::Node => NEXT_NODE_ID,
        }
    }

    fn read_counter(&self, key: &[u8]) -> Result<u64> {
        match self.info.get(key)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(1),
        }
    }
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Consistency("malformed counter value".into()))?;
    Ok(u64::from_be_bytes(array))
}

fn decode_u32(bytes: &[u8]) -> Result<u32> {
    let array: [u8; 4] = bytes
        .try_into()
        .map_err(|_| Error::Consistency("malformed class id".into()))?;
    Ok(u32::from_be_bytes(array))
}

fn class_id_key(class_id: u32) -> Vec<u8> {
    let mut key = b"id:".to_vec();
    key.extend_from_slice(&class_id.to_be_bytes());
    key
}

fn class_info_key(info: &[u8]) -> Vec<u8> {
    let mut key = b"info:".to_vec();
    key.extend_from_slice(info);
    key
}

impl DataStore for SledStore {
    fn transaction(&self, timeout: Duration) -> Result<Box<dyn StoreTxn + '_>> {
        let guard = self
            .txn_lock
            .try_lock_for(timeout)
            .ok_or(Error::StoreTimeout)?;
        Ok(Box::new(SledTxn {
            store: self,
            _guard: guard,
            undo: Vec::new(),
            committed: false,
        }))
    }
}

struct SledTxn<'a> {
    store: &'a SledStore,
    _guard: MutexGuard<'a, ()>,
    undo: Vec<UndoOp>,
    committed: bool,
}

impl StoreTxn for SledTxn<'_> {
    fn get_object(&mut self, oid: u64) -> Result<Option<Vec<u8>>> {
        Ok(self
            .store
            .objects
            .get(oid.to_be_bytes())?
            .map(|v| v.to_vec()))
    }

    fn put_object(&mut self, oid: u64, data: &[u8]) -> Result<()> {
        let prev = self.store.objects.insert(oid.to_be_bytes(), data)?;
        self.undo.push(UndoOp::Object {
            oid,
            prev: prev.map(|v| v.to_vec()),
        });
        Ok(())
    }

    fn delete_object(&mut self, oid: u64) -> Result<()> {
        if let Some(prev) = self.store.objects.remove(oid.to_be_bytes())? {
            self.undo.push(UndoOp::Object {
                oid,
                prev: Some(prev.to_vec()),
            });
        }
        Ok(())
    }

    fn find_object(&mut self, from: u64) -> Result<Option<u64>> {
        match self.store.objects.range(from.to_be_bytes()..).next() {
            Some(entry) => {
                let (key, _) = entry?;
                Ok(Some(decode_u64(&key)?))
            }
            None => Ok(None),
        }
    }

    fn get_binding(&mut self, name: &str) -> Result<Option<u64>> {
        match self.store.bindings.get(name.as_bytes())? {
            Some(bytes) => Ok(Some(decode_u64(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_binding(&mut self, name: &str, oid: u64) -> Result<()> {
        let prev = self
            .store
            .bindings
            .insert(name.as_bytes(), oid.to_be_bytes().to_vec())?;
        let prev = match prev {
            Some(bytes) => Some(decode_u64(&bytes)?),
            None => None,
        };
        self.undo.push(UndoOp::Binding {
            name: name.to_owned(),
            prev,
        });
        Ok(())
    }

    fn delete_binding(&mut self, name: &str) -> Result<bool> {
        match self.store.bindings.remove(name.as_bytes())? {
            Some(bytes) => {
                self.undo.push(UndoOp::Binding {
                    name: name.to_owned(),
                    prev: Some(decode_u64(&bytes)?),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn find_binding(&mut self, from: &str) -> Result<Option<(String, u64)>> {
        match self.store.bindings.range(from.as_bytes().to_vec()..).next() {
            Some(entry) => {
                let (key, value) = entry?;
                let name = String::from_utf8(key.to_vec())
                    .map_err(|_| Error::Consistency("binding name is not UTF-8".into()))?;
                Ok(Some((name, decode_u64(&value)?)))
            }
            None => Ok(None),
        }
    }

    fn allocate_ids(&mut self, counter: IdCounter, count: u64) -> Result<u64> {
        let key = SledStore::counter_key(counter);
        let first = self.store.read_counter(key)?;
        let next = first
            .checked_add(count)
            .ok_or_else(|| Error::Consistency("id counter overflow".into()))?;
        self.store.info.insert(key, next.to_be_bytes().to_vec())?;
        self.undo.push(UndoOp::Counter {
            which: counter,
            prev: first,
        });
        Ok(first)
    }

    fn get_class_id(&mut self, info: &[u8]) -> Result<u32> {
        if let Some(bytes) = self.store.classes.get(class_info_key(info))? {
            return decode_u32(&bytes);
        }
        let id = match self.store.info.get(NEXT_CLASS_ID)? {
            Some(bytes) => u32::try_from(decode_u64(&bytes)?)
                .map_err(|_| Error::Consistency("class id counter overflow".into()))?,
            None => 1,
        };
        self.store
            .info
            .insert(NEXT_CLASS_ID, (u64::from(id) + 1).to_be_bytes().to_vec())?;
        self.store
            .classes
            .insert(class_info_key(info), id.to_be_bytes().to_vec())?;
        self.store.classes.insert(class_id_key(id), info)?;
        self.undo.push(UndoOp::Class {
            class_id: id,
            info: info.to_vec(),
        });
        Ok(id)
    }

    fn get_class_info(&mut self, class_id: u32) -> Result<Option<Vec<u8>>> {
        Ok(self
            .store
            .classes
            .get(class_id_key(class_id))?
            .map(|v| v.to_vec()))
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.store.objects.flush()?;
        self.store.bindings.flush()?;
        self.store.info.flush()?;
        self.store.classes.flush()?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for SledTxn<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        while let Some(op) = self.undo.pop() {
            let result = match op {
                UndoOp::Object { oid, prev } => match prev {
                    Some(data) => self
                        .store
                        .objects
                        .insert(oid.to_be_bytes(), data)
                        .map(drop),
                    None => self.store.objects.remove(oid.to_be_bytes()).map(drop),
                },
                UndoOp::Binding { name, prev } => match prev {
                    Some(oid) => self
                        .store
                        .bindings
                        .insert(name.as_bytes(), oid.to_be_bytes().to_vec())
                        .map(drop),
                    None => self.store.bindings.remove(name.as_bytes()).map(drop),
                },
                UndoOp::Counter { which, prev } => self
                    .store
                    .info
                    .insert(SledStore::counter_key(which), prev.to_be_bytes().to_vec())
                    .map(drop),
                UndoOp::Class { class_id, info } => self
                    .store
                    .classes
                    .remove(class_info_key(&info))
                    .and_then(|_| self.store.classes.remove(class_id_key(class_id)))
                    .and_then(|_| {
                        self.store
                            .info
                            .insert(NEXT_CLASS_ID, u64::from(class_id).to_be_bytes().to_vec())
                    })
                    .map(drop),
            };
            if let Err(e) = result {
                warn!(error = %e, "store rollback write failed");
            }
        }
    }
}
