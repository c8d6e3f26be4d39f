//! LLM Call Coordinator (spec §4.8): reserve → permit → call → record →
//! classify-and-retry.
//!
//! Grounded on the `LLMClient` trait shape in `rlm-core::llm::client` and
//! the tiered-model-selection idiom in `rlm-core::llm::router::SmartRouter`,
//! generalized here to depth-based sub-model delegation.

use super::client::{resolve_usage_tokens, GenerateTextRequest, GenerateTextResponse, LanguageModelClient};
use crate::budget::BudgetManager;
use crate::config::{ModelTarget, RuntimeConfig};
use crate::error::{Error, Result};
use crate::ids::CallId;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct LlmCoordinator {
    budget: Arc<BudgetManager>,
    client: Arc<dyn LanguageModelClient>,
    config: Arc<RuntimeConfig>,
}

impl LlmCoordinator {
    pub fn new(budget: Arc<BudgetManager>, client: Arc<dyn LanguageModelClient>, config: Arc<RuntimeConfig>) -> Self {
        Self { budget, client, config }
    }

    fn select_target(&self, depth: u32, is_sub_call: bool) -> &ModelTarget {
        let delegation = &self.config.sub_llm_delegation;
        if is_sub_call && delegation.enabled && depth >= delegation.depth_threshold {
            self.config.sub_target.as_ref().unwrap_or(&self.config.primary_target)
        } else {
            &self.config.primary_target
        }
    }

    /// Run one `GenerateStep`'s model invocation to completion, retrying
    /// retryable failures with jittered exponential backoff. Budget
    /// reservation happens exactly once regardless of retry attempts
    /// (spec §8 scenario 6).
    pub async fn generate(&self, call_id: &CallId, depth: u32, is_sub_call: bool, prompt: String) -> Result<GenerateTextResponse> {
        self.budget.reserve_llm_call(call_id)?;

        let target = self.select_target(depth, is_sub_call).clone();
        let max_attempts = self.config.llm_retry_count + 1;

        let mut attempt = 1u32;
        loop {
            let request = GenerateTextRequest::new(prompt.clone(), target.provider.clone(), target.model.clone());
            let client = Arc::clone(&self.client);
            let outcome = self.budget.with_llm_permit(|| async move { client.generate_text(request).await }).await;

            match outcome {
                Ok(response) => {
                    self.budget.record_tokens(resolve_usage_tokens(&response.usage));
                    return Ok(response);
                }
                Err(failure) if failure.retryable && attempt < max_attempts => {
                    let delay_ms = compute_retry_delay_ms(attempt, self.config.llm_retry_base_delay_ms, self.config.llm_retry_jitter);
                    warn!(call_id = %call_id, attempt, delay_ms, "retrying model call after retryable error");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
                Err(failure) => {
                    return Err(Error::ModelCall {
                        provider: target.provider.clone(),
                        model: target.model.clone(),
                        operation: "generateText".to_string(),
                        retryable: failure.retryable,
                        message: failure.message,
                    });
                }
            }
        }
    }
}

/// Exponential-doubling backoff, optionally replaced by uniform jitter in
/// `[0, delay]` (spec §4.8).
pub fn compute_retry_delay_ms(attempt: u32, base_ms: u64, jitter: bool) -> u64 {
    let shift = attempt.saturating_sub(1).min(32);
    let delay = base_ms.saturating_mul(1u64 << shift);
    if jitter {
        if delay == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=delay)
        }
    } else {
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::{ModelCallFailure, TokenUsage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles_without_jitter() {
        assert_eq!(compute_retry_delay_ms(1, 100, false), 100);
        assert_eq!(compute_retry_delay_ms(2, 100, false), 200);
        assert_eq!(compute_retry_delay_ms(3, 100, false), 400);
    }

    #[test]
    fn jittered_delay_never_exceeds_computed_bound() {
        for attempt in 1..=5 {
            let bound = compute_retry_delay_ms(attempt, 100, false);
            for _ in 0..20 {
                let jittered = compute_retry_delay_ms(attempt, 100, true);
                assert!(jittered <= bound);
            }
        }
    }

    struct FlakyClient {
        calls: AtomicU32,
        fail_times: u32,
    }

    #[async_trait]
    impl LanguageModelClient for FlakyClient {
        async fn generate_text(&self, _request: GenerateTextRequest) -> std::result::Result<GenerateTextResponse, ModelCallFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(ModelCallFailure::retryable("transient"))
            } else {
                Ok(GenerateTextResponse {
                    text: "ok".to_string(),
                    usage: TokenUsage {
                        total_tokens: Some(10),
                        ..Default::default()
                    },
                })
            }
        }
    }

    #[tokio::test]
    async fn succeeds_after_retryable_failures_reserving_exactly_one_call() {
        let budget = Arc::new(BudgetManager::new(10, 10, None, 1, 4));
        let client = Arc::new(FlakyClient {
            calls: AtomicU32::new(0),
            fail_times: 2,
        });
        let mut config = RuntimeConfig::default();
        config.llm_retry_count = 2;
        config.llm_retry_base_delay_ms = 1;
        let coordinator = LlmCoordinator::new(Arc::clone(&budget), client, Arc::new(config));

        let call = CallId::root();
        let response = coordinator.generate(&call, 0, false, "prompt".to_string()).await.unwrap();
        assert_eq!(response.text, "ok");
        assert_eq!(budget.snapshot().llm_calls_remaining, 9);
    }

    #[tokio::test]
    async fn surfaces_last_model_call_error_after_exhausting_retries() {
        let budget = Arc::new(BudgetManager::new(10, 10, None, 1, 4));
        let client = Arc::new(FlakyClient {
            calls: AtomicU32::new(0),
            fail_times: 100,
        });
        let mut config = RuntimeConfig::default();
        config.llm_retry_count = 1;
        config.llm_retry_base_delay_ms = 1;
        let coordinator = LlmCoordinator::new(budget, client, Arc::new(config));

        let call = CallId::root();
        let err = coordinator.generate(&call, 0, false, "prompt".to_string()).await.unwrap_err();
        assert!(matches!(err, Error::ModelCall { retryable: true, .. }));
    }

    #[tokio::test]
    async fn depth_threshold_selects_sub_target_for_sub_calls() {
        let budget = Arc::new(BudgetManager::new(10, 10, None, 5, 4));
        let client = Arc::new(FlakyClient {
            calls: AtomicU32::new(0),
            fail_times: 0,
        });
        let mut config = RuntimeConfig::default();
        config.sub_llm_delegation.enabled = true;
        config.sub_llm_delegation.depth_threshold = 1;
        config.sub_target = Some(ModelTarget::new("anthropic", "claude-haiku"));
        let coordinator = LlmCoordinator::new(budget, client, Arc::new(config));

        let target = coordinator.select_target(1, true).clone();
        assert_eq!(target.model, "claude-haiku");

        let primary = coordinator.select_target(0, true).clone();
        assert_eq!(primary.model, "claude-sonnet");
    }
}
