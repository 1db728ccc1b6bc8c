//! Error types for cachecoord

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Argument errors ===
    #[error("Node ID {0} is not registered")]
    UnknownNode(u64),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // === Protocol errors ===
    #[error("Cache consistency violation: {0}")]
    Consistency(String),

    #[error("Node {0} is shutting down")]
    NodeShutdown(u64),

    #[error("Coordinator is shutting down")]
    ShuttingDown,

    // === Lock-wait failures ===
    #[error("Lock request for {subject} timed out; conflicting node {conflicting}")]
    LockTimeout { subject: String, conflicting: u64 },

    #[error("Lock request for {subject} denied; conflicting node {conflicting}")]
    LockDenied { subject: String, conflicting: u64 },

    #[error("Lock request for {subject} deadlocked; conflicting node {conflicting}")]
    Deadlock { subject: String, conflicting: u64 },

    // === Resource exhaustion ===
    #[error("Too many retries: {0}")]
    RetriesExhausted(String),

    // === Store errors ===
    #[error("Store transaction timed out")]
    StoreTimeout,

    #[error("Store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Config errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Lock timeouts and deadlocks abort the caller's transaction but a fresh
    /// attempt may succeed; store timeouts and exhausted retry budgets are
    /// transient resource conditions.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout { .. }
                | Error::Deadlock { .. }
                | Error::StoreTimeout
                | Error::RetriesExhausted(_)
        )
    }

    /// Does this error indicate a coherence-protocol violation by a node?
    pub fn is_consistency(&self) -> bool {
        matches!(self, Error::Consistency(_))
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Error::Store(e.to_string())
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
