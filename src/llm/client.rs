//! The model-layer collaborator interface (spec §6). Grounded on the
//! `LLMClient` trait shape in `rlm-core::llm::client`, kept trait-only here
//! with no concrete provider wired in -- provider adapters that turn this
//! into an HTTP call are named in spec §1 as an out-of-scope collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Token accounting reported alongside a completion, mirroring the
/// optional fields a provider adapter may or may not populate.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub reasoning_tokens: Option<u64>,
    pub cached_input_tokens: Option<u64>,
}

/// `generateText` request parameters (spec §6).
#[derive(Debug, Clone)]
pub struct GenerateTextRequest {
    pub prompt: String,
    pub provider: String,
    pub model: String,
    pub toolkit: Option<Vec<String>>,
    pub tool_choice: Option<String>,
    pub disable_tool_call_resolution: bool,
    pub concurrency: Option<usize>,
}

impl GenerateTextRequest {
    pub fn new(prompt: impl Into<String>, provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            provider: provider.into(),
            model: model.into(),
            toolkit: None,
            tool_choice: None,
            disable_tool_call_resolution: false,
            concurrency: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateTextResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// A model-layer error, already classified by the provider adapter as
/// retryable or terminal (spec §9 "error classification": `retryable` is
/// opaque to the core).
#[derive(Debug, Clone)]
pub struct ModelCallFailure {
    pub retryable: bool,
    pub message: String,
}

impl ModelCallFailure {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

/// External collaborator: the core depends on this trait abstractly and
/// ships no concrete implementation (spec §6; a real `AnthropicClient`-like
/// adapter is out of this crate's scope per spec §1).
#[async_trait]
pub trait LanguageModelClient: Send + Sync {
    async fn generate_text(&self, request: GenerateTextRequest) -> Result<GenerateTextResponse, ModelCallFailure>;
}

/// `resolveUsageTokens` (spec §4.8): prefer `totalTokens` when non-zero,
/// else the sum of input+output when positive, else `None` (no decrement).
pub fn resolve_usage_tokens(usage: &TokenUsage) -> Option<u64> {
    if let Some(total) = usage.total_tokens {
        if total != 0 {
            return Some(total);
        }
    }
    match (usage.input_tokens, usage.output_tokens) {
        (Some(i), Some(o)) if i + o > 0 => Some(i + o),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_nonzero_total_tokens() {
        let usage = TokenUsage {
            total_tokens: Some(42),
            input_tokens: Some(1),
            output_tokens: Some(1),
            ..Default::default()
        };
        assert_eq!(resolve_usage_tokens(&usage), Some(42));
    }

    #[test]
    fn falls_back_to_input_plus_output_when_total_is_zero() {
        let usage = TokenUsage {
            total_tokens: Some(0),
            input_tokens: Some(10),
            output_tokens: Some(5),
            ..Default::default()
        };
        assert_eq!(resolve_usage_tokens(&usage), Some(15));
    }

    #[test]
    fn none_when_nothing_known() {
        let usage = TokenUsage::default();
        assert_eq!(resolve_usage_tokens(&usage), None);
    }

    #[test]
    fn none_when_input_plus_output_is_zero() {
        let usage = TokenUsage {
            input_tokens: Some(0),
            output_tokens: Some(0),
            ..Default::default()
        };
        assert_eq!(resolve_usage_tokens(&usage), None);
    }
}
