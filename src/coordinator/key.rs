//! Lock subjects: object IDs and name-binding keys.
//!
//! The lock table is keyed by [`LockSubject`], a tagged union of the two kinds
//! of item a node can cache. Subjects carry a total order so that operations
//! taking more than one lock can always acquire in ascending key order.

use std::cmp::Ordering;
use std::fmt;

/// Server-assigned node identifier. Never reused for the life of the store.
pub type NodeId = u64;

/// The lock subject for a name binding.
///
/// `PastLast` is the sentinel for "past the last bound name": it compares
/// greater than every real name, so the end of the name space can be locked
/// like any other key during range scans.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BindingKey {
    Name(String),
    PastLast,
}

impl BindingKey {
    /// Key for a real name.
    pub fn for_name(name: impl Into<String>) -> Self {
        BindingKey::Name(name.into())
    }

    /// Key for a scan boundary: `None` means the scan ran off the end of the
    /// name space and the sentinel is locked instead.
    pub fn allow_last(name: Option<&str>) -> Self {
        match name {
            Some(n) => BindingKey::Name(n.to_string()),
            None => BindingKey::PastLast,
        }
    }

    /// The wrapped name, or `None` for the sentinel.
    pub fn name(&self) -> Option<&str> {
        match self {
            BindingKey::Name(n) => Some(n),
            BindingKey::PastLast => None,
        }
    }
}

impl Ord for BindingKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (BindingKey::Name(a), BindingKey::Name(b)) => a.cmp(b),
            (BindingKey::Name(_), BindingKey::PastLast) => Ordering::Less,
            (BindingKey::PastLast, BindingKey::Name(_)) => Ordering::Greater,
            (BindingKey::PastLast, BindingKey::PastLast) => Ordering::Equal,
        }
    }
}

impl PartialOrd for BindingKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingKey::Name(n) => write!(f, "name:{:?}", n),
            BindingKey::PastLast => write!(f, "name:LAST"),
        }
    }
}

/// What a lock protects: a stored object or a binding boundary key.
///
/// The derived order (objects before bindings, each variant ordered
/// internally) is the acquisition order for multi-lock operations.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockSubject {
    Object(u64),
    Binding(BindingKey),
}

impl fmt::Display for LockSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockSubject::Object(oid) => write!(f, "oid:{}", oid),
            LockSubject::Binding(key) => write!(f, "{}", key),
        }
    }
}
