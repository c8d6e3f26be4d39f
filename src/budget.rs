//! Budget manager: reservation and recording of iterations, LLM calls,
//! tokens, and depth across the entire completion tree.
//!
//! Grounded on `rlm-core::llm::CostTracker`/`TokenUsage` accounting and
//! `rlm-core::orchestrator::OrchestratorConfig`'s token/cost budget fields,
//! generalized to the atomic-reservation contract of spec §4.5/§8: a
//! reservation that would drive a counter negative fails without
//! decrementing, and all decrements are observed as single transitions.

use crate::error::{BudgetResource, Error, Result};
use crate::ids::CallId;
use std::sync::Mutex;
use tokio::sync::Semaphore;

/// Snapshot of the budget cell shared by every call in a completion tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetState {
    pub iterations_remaining: i64,
    pub llm_calls_remaining: i64,
    pub token_budget_remaining: Option<i64>,
}

impl BudgetState {
    fn new(max_iterations: u32, max_llm_calls: u32, max_total_tokens: Option<u64>) -> Self {
        Self {
            iterations_remaining: max_iterations as i64,
            llm_calls_remaining: max_llm_calls as i64,
            token_budget_remaining: max_total_tokens.map(|t| t as i64),
        }
    }
}

/// Shared, per-completion budget cell plus the LLM concurrency permit.
///
/// All mutation goes through `Mutex<BudgetState>` so that a reservation and
/// its decrement are one atomic transition, satisfying invariant 2 in
/// spec §3: counters never go negative, and a reservation that would
/// violate that fails without decrementing.
pub struct BudgetManager {
    state: Mutex<BudgetState>,
    max_depth: u32,
    permit: Semaphore,
}

impl BudgetManager {
    pub fn new(
        max_iterations: u32,
        max_llm_calls: u32,
        max_total_tokens: Option<u64>,
        max_depth: u32,
        concurrency: usize,
    ) -> Self {
        Self {
            state: Mutex::new(BudgetState::new(max_iterations, max_llm_calls, max_total_tokens)),
            max_depth,
            permit: Semaphore::new(concurrency.max(1)),
        }
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn snapshot(&self) -> BudgetState {
        self.state.lock().expect("budget mutex poisoned").clone()
    }

    /// Reserve depth beyond `max_depth`: fails without creating any state.
    /// Called before sandbox creation per spec §4.7 `StartCall` step 1.
    pub fn check_depth(&self, depth: u32, call_id: &CallId) -> Result<()> {
        if depth > self.max_depth {
            return Err(Error::budget_exhausted(
                BudgetResource::Depth,
                self.max_depth as i64 - depth as i64,
                call_id.clone(),
            ));
        }
        Ok(())
    }

    /// Reserve one iteration for `call_id`. Atomic: fails without
    /// decrementing if none remain.
    pub fn reserve_iteration(&self, call_id: &CallId) -> Result<()> {
        let mut state = self.state.lock().expect("budget mutex poisoned");
        if state.iterations_remaining <= 0 {
            return Err(Error::budget_exhausted(
                BudgetResource::Iterations,
                state.iterations_remaining,
                call_id.clone(),
            ));
        }
        state.iterations_remaining -= 1;
        Ok(())
    }

    /// Reserve one LLM call for `call_id`. Reservation occurs once per
    /// coordinator invocation, not once per retry attempt (spec §8
    /// scenario 6). Also the token budget's gate: spec §4.5 has no
    /// separate token reservation call, so the next LLM call after
    /// `record_tokens` has driven the remaining budget to or below zero
    /// is the thing that actually fails.
    pub fn reserve_llm_call(&self, call_id: &CallId) -> Result<()> {
        let mut state = self.state.lock().expect("budget mutex poisoned");
        if state.llm_calls_remaining <= 0 {
            return Err(Error::budget_exhausted(
                BudgetResource::LlmCalls,
                state.llm_calls_remaining,
                call_id.clone(),
            ));
        }
        if Self::is_tokens_exhausted(&state) {
            let remaining = state.token_budget_remaining.unwrap_or(0);
            return Err(Error::budget_exhausted(BudgetResource::Tokens, remaining, call_id.clone()));
        }
        state.llm_calls_remaining -= 1;
        Ok(())
    }

    fn is_tokens_exhausted(state: &BudgetState) -> bool {
        matches!(state.token_budget_remaining, Some(r) if r <= 0)
    }

    /// Record `n` tokens consumed. If the token budget is set and drops to
    /// or below zero, the budget is marked exhausted so the *next*
    /// reservation (there is no separate token reservation call in spec
    /// §4.5 -- recording is itself the gate) fails.
    pub fn record_tokens(&self, n: Option<u64>) {
        let Some(n) = n else { return };
        let mut state = self.state.lock().expect("budget mutex poisoned");
        if let Some(remaining) = state.token_budget_remaining.as_mut() {
            *remaining -= n as i64;
        }
    }

    /// Whether the token budget (if any) has been exhausted. Checked by
    /// `reserve_llm_call` before the next model call is allowed to start
    /// (spec §4.5: recording is itself the gate, there's no separate
    /// token reservation).
    pub fn tokens_exhausted(&self) -> bool {
        Self::is_tokens_exhausted(&self.state.lock().expect("budget mutex poisoned"))
    }

    /// Acquire the LLM concurrency permit for the duration of `effect`.
    pub async fn with_llm_permit<F, Fut, T>(&self, effect: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let _permit = self.permit.acquire().await.expect("semaphore closed");
        effect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservations_decrement_and_never_go_negative() {
        let mgr = BudgetManager::new(1, 1, None, 1, 4);
        let call = CallId::root();
        mgr.reserve_iteration(&call).unwrap();
        let err = mgr.reserve_iteration(&call).unwrap_err();
        assert!(matches!(err, Error::BudgetExhausted { resource: BudgetResource::Iterations, .. }));
        assert_eq!(mgr.snapshot().iterations_remaining, 0);
    }

    #[test]
    fn failed_reservation_does_not_decrement() {
        let mgr = BudgetManager::new(0, 5, None, 1, 4);
        let call = CallId::root();
        let before = mgr.snapshot().iterations_remaining;
        let _ = mgr.reserve_iteration(&call);
        assert_eq!(mgr.snapshot().iterations_remaining, before);
    }

    #[test]
    fn depth_check_allows_equal_and_rejects_beyond() {
        let mgr = BudgetManager::new(10, 10, None, 2, 4);
        let call = CallId::root();
        assert!(mgr.check_depth(2, &call).is_ok());
        let err = mgr.check_depth(3, &call).unwrap_err();
        assert!(matches!(err, Error::BudgetExhausted { resource: BudgetResource::Depth, .. }));
    }

    #[test]
    fn recording_tokens_below_zero_marks_exhausted() {
        let mgr = BudgetManager::new(10, 10, Some(100), 1, 4);
        assert!(!mgr.tokens_exhausted());
        mgr.record_tokens(Some(150));
        assert!(mgr.tokens_exhausted());
    }

    #[test]
    fn reserve_llm_call_fails_once_token_budget_is_exhausted() {
        let mgr = BudgetManager::new(10, 10, Some(100), 1, 4);
        let call = CallId::root();
        mgr.reserve_llm_call(&call).unwrap();
        mgr.record_tokens(Some(150));
        let err = mgr.reserve_llm_call(&call).unwrap_err();
        assert!(matches!(err, Error::BudgetExhausted { resource: BudgetResource::Tokens, .. }));
        assert_eq!(mgr.snapshot().llm_calls_remaining, 9, "the failed reservation must not decrement llmCalls");
    }

    #[test]
    fn no_token_budget_is_never_exhausted() {
        let mgr = BudgetManager::new(10, 10, None, 1, 4);
        mgr.record_tokens(Some(1_000_000));
        assert!(!mgr.tokens_exhausted());
    }

    #[tokio::test]
    async fn llm_permit_serializes_access_up_to_concurrency() {
        let mgr = BudgetManager::new(10, 10, None, 1, 1);
        let result = mgr.with_llm_permit(|| async { 42 }).await;
        assert_eq!(result, 42);
    }

    #[test]
    fn reservations_are_atomic_under_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let mgr = Arc::new(BudgetManager::new(1000, 1000, None, 1, 4));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let mgr = Arc::clone(&mgr);
            handles.push(thread::spawn(move || {
                let call = CallId::root();
                for _ in 0..100 {
                    let _ = mgr.reserve_iteration(&call);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(mgr.snapshot().iterations_remaining, 0);
    }
}
