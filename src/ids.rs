//! Opaque entity identifiers shared across the runtime.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one top-level `complete()`/`stream()` invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompletionId(String);

/// Identifies one node in the recursive call tree. The root call always has
/// id `"root"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(String);

/// Identifies one outbound sandbox-to-host bridge call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BridgeRequestId(String);

macro_rules! opaque_id {
    ($ty:ident, $prefix:literal) => {
        impl $ty {
            /// Generate a fresh opaque id.
            pub fn new() -> Self {
                Self(format!("{}-{}", $prefix, uuid::Uuid::new_v4()))
            }

            /// Wrap an existing string as an id (used for the well-known
            /// `"root"` call id and for deserializing over the sandbox IPC
            /// boundary).
            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Borrow the underlying string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $ty {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $ty {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }
    };
}

opaque_id!(CompletionId, "completion");
opaque_id!(BridgeRequestId, "bridge");

impl CallId {
    /// The id of the root call of every completion tree.
    pub const ROOT: &'static str = "root";

    /// The well-known root call id.
    pub fn root() -> Self {
        Self("root".to_string())
    }

    /// Generate a fresh child call id scoped under `parent`.
    pub fn child_of(parent: &CallId) -> Self {
        Self(format!("{}/{}", parent.0, uuid::Uuid::new_v4()))
    }

    /// Wrap an existing string as a call id.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Borrow the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CallId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Monotonic counter used to allocate sandbox IPC request ids, scoped to a
/// single sandbox instance (these are transport-level ids, distinct from
/// [`BridgeRequestId`] which identifies a bridge call across the scheduler).
#[derive(Debug, Default)]
pub struct RequestIdAllocator(AtomicU64);

impl RequestIdAllocator {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_call_id_is_well_known() {
        assert_eq!(CallId::root().as_str(), "root");
    }

    #[test]
    fn fresh_ids_are_distinct() {
        assert_ne!(CompletionId::new(), CompletionId::new());
        assert_ne!(BridgeRequestId::new(), BridgeRequestId::new());
    }

    #[test]
    fn child_call_id_is_scoped_under_parent() {
        let parent = CallId::root();
        let child = CallId::child_of(&parent);
        assert!(child.as_str().starts_with("root/"));
    }

    #[test]
    fn request_id_allocator_is_monotonic() {
        let alloc = RequestIdAllocator::new();
        let a = alloc.next();
        let b = alloc.next();
        assert!(b > a);
    }

    #[test]
    fn ids_roundtrip_through_display_and_from_raw() {
        let id = CallId::from_raw("custom-id");
        assert_eq!(id.to_string(), "custom-id");
    }
}
