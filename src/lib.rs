//! # cachecoord
//!
//! The central coordinator for a distributed object cache:
//! - Multi-granularity reader/writer locks over objects and name bindings
//! - Callback-based cache coherence between nodes
//! - Retryable range scans over the binding namespace
//! - Pluggable persistence (in-memory or sled)
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌────────────┐
//! │  Node 1    │   │  Node 2    │   │  Node 3    │
//! │ (cache)    │   │ (cache)    │   │ (cache)    │
//! └─────┬──────┘   └─────┬──────┘   └─────┬──────┘
//!       │  calls +       │  coherence     │
//!       │  callbacks     │  callbacks     │
//!   ┌───┴────────────────┴────────────────┴───┐
//!   │           CoordinatorServer             │
//!   │   lock table ── callback pool           │
//!   │        │                                │
//!   │   ┌────▼──────┐                         │
//!   │   │ DataStore │  (objects, bindings,    │
//!   │   └───────────┘   class metadata)       │
//!   └─────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use cachecoord::{CoordinatorConfig, CoordinatorServer, NoopCallbackClient, SledStore};
//! use std::sync::Arc;
//!
//! # fn main() -> cachecoord::Result<()> {
//! let store = Arc::new(SledStore::open("./coord-data")?);
//! let server = CoordinatorServer::new(CoordinatorConfig::default(), store)?;
//!
//! let node = server.register_node(Arc::new(NoopCallbackClient))?.node_id;
//! let oid = server.new_object_ids(node, 1)?;
//! server.commit(node, &[(oid, Some(b"hello".to_vec()))], 1, &[])?;
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod coordinator;

// Re-export commonly used types
pub use common::{CoordinatorConfig, Error, Result};
pub use coordinator::{
    BindingKey, CallbackClient, CoordinatorServer, DataStore, LockSubject, MemStore,
    NodeId, NoopCallbackClient, SledStore,
};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
