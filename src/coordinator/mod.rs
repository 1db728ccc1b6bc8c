//! Coordinator for the distributed object cache
//!
//! The coordinator is responsible for:
//! - Node registration and shutdown
//! - Object and binding locks (multi-granularity, reader/writer)
//! - Coherence callbacks to nodes caching conflicting entries
//! - Retryable range scans over name bindings
//! - The authoritative data store behind all caches

pub mod callback;
pub mod key;
pub mod lock;
pub mod node;
pub mod server;
pub mod store;

pub use callback::{CallbackClient, NoopCallbackClient};
pub use key::{BindingKey, LockSubject, NodeId};
pub use server::CoordinatorServer;
pub use store::{DataStore, MemStore, SledStore};
