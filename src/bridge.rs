//! Bridge store: registry of outstanding sandbox→host bridge requests
//! correlated to suspended consumers.
//!
//! Grounded on the pending-operation map pattern in
//! `rlm-core::repl::ReplHandle` (`list_pending_operations` /
//! `resolve_operation`) and the oneshot-per-request idiom used by
//! `rlm-core::llm::batch::BatchExecutor` to fan results back to callers.

use crate::error::{Error, Result};
use crate::ids::BridgeRequestId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

/// The outcome delivered to a suspended bridge consumer.
pub type BridgeOutcome = std::result::Result<Value, String>;

/// A registry of outstanding bridge requests keyed by [`BridgeRequestId`].
///
/// Every operation here is linearizable with respect to the underlying
/// map: `resolve`/`fail`/`remove` all take the same mutex, so invariant 1
/// in spec §3 -- exactly one registered consumer per pending request,
/// removed atomically on completion -- holds under concurrent access.
pub struct BridgeStore {
    pending: Mutex<HashMap<BridgeRequestId, oneshot::Sender<BridgeOutcome>>>,
}

impl BridgeStore {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a fresh bridge request, returning the receiver half the
    /// caller should await.
    pub fn register(&self, id: BridgeRequestId) -> oneshot::Receiver<BridgeOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("bridge mutex poisoned").insert(id, tx);
        rx
    }

    /// Resolve a pending bridge request with a success value. Returns
    /// `false` if no consumer was registered (idempotent: resolving twice
    /// is a no-op the second time, per spec §8 round-trip property).
    pub fn resolve(&self, id: &BridgeRequestId, value: Value) -> bool {
        let sender = self.pending.lock().expect("bridge mutex poisoned").remove(id);
        match sender {
            Some(tx) => tx.send(Ok(value)).is_ok(),
            None => false,
        }
    }

    /// Fail a pending bridge request. Returns `false` if absent.
    pub fn fail(&self, id: &BridgeRequestId, reason: impl Into<String>) -> bool {
        let sender = self.pending.lock().expect("bridge mutex poisoned").remove(id);
        match sender {
            Some(tx) => tx.send(Err(reason.into())).is_ok(),
            None => false,
        }
    }

    /// Cancel a registration without resolving it (used on the originating
    /// call's teardown, when no answer will ever arrive).
    pub fn remove(&self, id: &BridgeRequestId) {
        self.pending.lock().expect("bridge mutex poisoned").remove(id);
    }

    /// Fail only the given ids, leaving every other consumer untouched.
    /// `BridgeStore` is a single tree-wide map, so closing one call's scope
    /// must not reach into a sibling or descendant call's still-pending
    /// requests the way `fail_all` would -- this is the call-scoped
    /// counterpart used by `CallRegistry`'s teardown path (spec §3/§4.6/§5:
    /// "outstanding bridge requests for that call are failed ... during
    /// teardown"). Ids already resolved or removed are silently skipped.
    pub fn fail_many(&self, ids: &[BridgeRequestId], reason: &str) {
        let mut pending = self.pending.lock().expect("bridge mutex poisoned");
        for id in ids {
            if let Some(tx) = pending.remove(id) {
                let _ = tx.send(Err(reason.to_string()));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().expect("bridge mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BridgeStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Await a bridge outcome, converting the oneshot error (sender dropped
/// without resolving) into a [`crate::error::Error::Sandbox`].
pub async fn await_bridge(rx: oneshot::Receiver<BridgeOutcome>) -> Result<Value> {
    match rx.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(message)) => Err(Error::sandbox(message)),
        Err(_) => Err(Error::sandbox("bridge consumer dropped without resolution")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_resolve_delivers_value() {
        let store = BridgeStore::new();
        let id = BridgeRequestId::new();
        let rx = store.register(id.clone());
        assert!(store.resolve(&id, serde_json::json!("Paris")));
        let value = await_bridge(rx).await.unwrap();
        assert_eq!(value, serde_json::json!("Paris"));
    }

    #[test]
    fn second_resolve_is_a_noop_returning_false() {
        let store = BridgeStore::new();
        let id = BridgeRequestId::new();
        let _rx = store.register(id.clone());
        assert!(store.resolve(&id, serde_json::json!(1)));
        assert!(!store.resolve(&id, serde_json::json!(2)));
    }

    #[test]
    fn resolve_without_registration_returns_false() {
        let store = BridgeStore::new();
        let id = BridgeRequestId::new();
        assert!(!store.resolve(&id, serde_json::json!(1)));
    }

    #[tokio::test]
    async fn fail_many_fails_only_the_given_ids() {
        let store = BridgeStore::new();
        let targeted = BridgeRequestId::new();
        let untouched = BridgeRequestId::new();
        let rx_targeted = store.register(targeted.clone());
        let rx_untouched = store.register(untouched.clone());

        store.fail_many(&[targeted], "call scope closed");

        assert_eq!(store.len(), 1, "only the targeted id should be removed");
        assert!(await_bridge(rx_targeted).await.is_err());
        assert!(store.resolve(&untouched, serde_json::json!("still alive")));
        assert_eq!(await_bridge(rx_untouched).await.unwrap(), serde_json::json!("still alive"));
    }

    #[tokio::test]
    async fn fail_many_skips_ids_already_resolved() {
        let store = BridgeStore::new();
        let id = BridgeRequestId::new();
        let rx = store.register(id.clone());
        store.resolve(&id, serde_json::json!(1));
        store.fail_many(&[id], "call scope closed");
        assert_eq!(await_bridge(rx).await.unwrap(), serde_json::json!(1));
    }

    #[test]
    fn remove_cancels_without_resolving() {
        let store = BridgeStore::new();
        let id = BridgeRequestId::new();
        let _rx = store.register(id.clone());
        store.remove(&id);
        assert!(store.is_empty());
        assert!(!store.fail(&id, "too late"));
    }
}
