//! Call Registry & Scope Manager (spec §4.6).
//!
//! Grounded on `rlm-core::context::SessionContext` ownership patterns and
//! `rlm-core::repl::ReplPool`'s acquire/release lifecycle, generalized to
//! own a sandbox handle, forked task handles, and bridge registrations per
//! call (spec §3 invariant 4: a `CallContext` is live iff registered iff
//! its scope is open).

use crate::bridge::BridgeStore;
use crate::error::{Error, Result};
use crate::ids::{BridgeRequestId, CallId};
use crate::sandbox::{SandboxHandle, VariableInfo};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// One REPL turn's record: the assistant's text, and the execution output
/// attached in-place once the corresponding code block runs (spec §3).
#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub assistant_response: String,
    pub execution_output: Option<String>,
}

impl TranscriptEntry {
    pub fn new(assistant_response: impl Into<String>) -> Self {
        Self {
            assistant_response: assistant_response.into(),
            execution_output: None,
        }
    }
}

/// Resource owner for one call: the sandbox handle and any forked task
/// handles (model calls, child-call subtrees) attached to it. Torn down
/// exactly once, regardless of whether termination was `Finalize`,
/// `FailCall`, or scheduler shutdown (spec §4.6).
pub struct CallScope {
    sandbox: Option<Arc<dyn SandboxHandle>>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl CallScope {
    pub fn new(sandbox: Arc<dyn SandboxHandle>) -> Self {
        Self {
            sandbox: Some(sandbox),
            tasks: Vec::new(),
            closed: false,
        }
    }

    /// Attach a forked fiber; aborted when the scope closes (spec §5
    /// "closing a callScope interrupts all attached fibers").
    pub fn attach_task(&mut self, handle: JoinHandle<()>) {
        self.tasks.push(handle);
    }

    /// Clone the handle out so a forked fiber can hold its own reference
    /// and `.execute(...)` concurrently with the scheduler loop, without
    /// tying its lifetime to the registry lock that produced this scope.
    pub fn sandbox(&self) -> Arc<dyn SandboxHandle> {
        Arc::clone(self.sandbox.as_ref().expect("sandbox used after scope closed"))
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Idempotent: a second `close` is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(sandbox) = self.sandbox.take() {
            sandbox.shutdown().await?;
        }
        Ok(())
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Per-call mutable record (spec §3).
pub struct CallContext {
    pub call_id: CallId,
    pub depth: u32,
    pub query: String,
    pub context: String,
    pub parent_bridge_request_id: Option<BridgeRequestId>,
    pub tools: Vec<String>,
    pub output_json_schema: Option<Value>,
    pub iteration: u32,
    pub transcript: Vec<TranscriptEntry>,
    /// Advisory cache of the last `listVariables()` read; not load-bearing,
    /// the sandbox's own variable map is the source of truth.
    pub variable_snapshot: Option<Vec<VariableInfo>>,
    /// Bridge requests this call registered into the tree-wide `BridgeStore`
    /// on its own behalf (`llm_query`/`llm_query_batched` dispatch). Failed
    /// with "call scope closed" when this call's scope tears down, so a
    /// suspended forwarding fiber is never left awaiting a reply that will
    /// now never arrive (spec §3/§4.6/§5).
    pub outstanding_bridge_ids: Vec<BridgeRequestId>,
    pub scope: CallScope,
}

impl CallContext {
    pub fn new(
        call_id: CallId,
        depth: u32,
        query: String,
        context: String,
        parent_bridge_request_id: Option<BridgeRequestId>,
        tools: Vec<String>,
        output_json_schema: Option<Value>,
        scope: CallScope,
    ) -> Self {
        Self {
            call_id,
            depth,
            query,
            context,
            parent_bridge_request_id,
            tools,
            output_json_schema,
            iteration: 0,
            transcript: Vec::new(),
            variable_snapshot: None,
            outstanding_bridge_ids: Vec::new(),
            scope,
        }
    }

    /// Attach execution output to the most recent transcript entry, per
    /// spec §3's "most recent entry may have its executionOutput attached
    /// in-place before the next model turn."
    pub fn attach_execution_output(&mut self, output: String) {
        if let Some(last) = self.transcript.last_mut() {
            last.execution_output = Some(output);
        }
    }

    /// Record a bridge request this call registered on its own behalf, so
    /// teardown can fail it if it's still outstanding.
    pub fn track_bridge_request(&mut self, id: BridgeRequestId) {
        self.outstanding_bridge_ids.push(id);
    }
}

/// `CallId -> CallContext` map plus the lifecycle operations in spec §4.6.
#[derive(Default)]
pub struct CallRegistry {
    calls: RwLock<HashMap<CallId, CallContext>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, ctx: CallContext) {
        self.calls.write().await.insert(ctx.call_id.clone(), ctx);
    }

    pub async fn contains(&self, call_id: &CallId) -> bool {
        self.calls.read().await.contains_key(call_id)
    }

    pub async fn len(&self) -> usize {
        self.calls.read().await.len()
    }

    /// Apply `f` to the context for `call_id`, or `CallStateMissingError`
    /// if it is not (or no longer) registered.
    pub async fn with_mut<F, T>(&self, call_id: &CallId, f: F) -> Result<T>
    where
        F: FnOnce(&mut CallContext) -> T,
    {
        let mut guard = self.calls.write().await;
        let ctx = guard.get_mut(call_id).ok_or_else(|| Error::call_state_missing(call_id.clone()))?;
        Ok(f(ctx))
    }

    /// Remove and close the scope, failing any bridge request this call
    /// registered on its own behalf that is still outstanding. A missing
    /// `call_id` is not an error: callers treat this as idempotent teardown
    /// (spec §4.6 "every resource ... torn down exactly once").
    pub async fn unregister(&self, call_id: &CallId, bridge_pending: &BridgeStore) -> Result<()> {
        let removed = self.calls.write().await.remove(call_id);
        if let Some(mut ctx) = removed {
            bridge_pending.fail_many(&ctx.outstanding_bridge_ids, "call scope closed");
            ctx.scope.close().await?;
        }
        Ok(())
    }

    /// Close `ancestor` (if still registered) and every call whose id
    /// descends from it, i.e. equals `ancestor` or starts with
    /// `"{ancestor}/"` -- `CallId::child_of` encodes ancestry as a
    /// `/`-separated path, so subtree membership is a prefix check with no
    /// separate parent-pointer bookkeeping needed.
    ///
    /// Used when the root call finalizes or fails: any descendant still
    /// registered at that point (an abandoned `llm_query_batched` sibling,
    /// say) would otherwise never have its scope closed, leaking its
    /// sandbox subprocess and leaving its bridge-forwarding fiber awaiting a
    /// reply forever (spec §5 "closes the root scope, which transitively
    /// tears down everything", §9 "closing the parent scope cancels the
    /// child").
    pub async fn close_subtree(&self, ancestor: &CallId, bridge_pending: &BridgeStore) -> Result<()> {
        let removed: Vec<CallContext> = {
            let mut guard = self.calls.write().await;
            let prefix = format!("{}/", ancestor.as_str());
            let descendant_ids: Vec<CallId> = guard
                .keys()
                .filter(|id| id.as_str() == ancestor.as_str() || id.as_str().starts_with(&prefix))
                .cloned()
                .collect();
            descendant_ids.into_iter().filter_map(|id| guard.remove(&id)).collect()
        };
        for mut ctx in removed {
            bridge_pending.fail_many(&ctx.outstanding_bridge_ids, "call scope closed");
            ctx.scope.close().await?;
        }
        Ok(())
    }
}
