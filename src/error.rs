//! Error types for rlm-core.
//!
//! The taxonomy follows spec §7 exactly: every variant here is either
//! terminal for the call that produced it (propagated as `FailCall`) or a
//! retryable condition classified by the provider adapter.

use crate::ids::CallId;
use thiserror::Error;

/// Result type alias using rlm-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// A budget resource tracked by the [`crate::budget::BudgetManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BudgetResource {
    Iterations,
    LlmCalls,
    Tokens,
    Depth,
}

impl std::fmt::Display for BudgetResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Iterations => "iterations",
            Self::LlmCalls => "llmCalls",
            Self::Tokens => "tokens",
            Self::Depth => "depth",
        };
        write!(f, "{s}")
    }
}

/// Errors that can occur during RLM operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// A budget reservation would go negative. Terminal for the call.
    #[error("budget exhausted: {resource} (remaining {remaining}) for call {call_id}")]
    BudgetExhausted {
        resource: BudgetResource,
        remaining: i64,
        call_id: CallId,
    },

    /// A model-layer call failed. Retried by the coordinator when
    /// `retryable` is set and attempts remain; otherwise terminal.
    #[error("model call error: {provider}/{model} {operation} failed: {message}")]
    ModelCall {
        provider: String,
        model: String,
        operation: String,
        retryable: bool,
        message: String,
    },

    /// Sandbox worker or bridge failure. Terminal for the call unless the
    /// executing code catches the corresponding exception.
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// Iterations exhausted without a `FINAL(...)`.
    #[error("no final answer reached within {max_iterations} iterations for call {call_id}")]
    NoFinalAnswer { max_iterations: u32, call_id: CallId },

    /// Extraction/coercion against `outputJsonSchema` failed.
    #[error("output validation error: {message} (raw: {raw})")]
    OutputValidation { message: String, raw: String },

    /// Referenced call not in the registry. Always wrapped in a
    /// `SchedulerWarning`, never surfaced as a terminal failure of another
    /// call.
    #[error("call state missing: {0}")]
    CallStateMissing(CallId),

    /// Subprocess/IPC transport failure talking to the sandbox worker.
    #[error("subprocess communication error: {0}")]
    SubprocessComm(String),

    /// Serialization/deserialization error crossing the sandbox IPC
    /// boundary.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Catch-all for conditions with no more specific variant.
    #[error("internal rlm error: {0}")]
    Unknown(String),
}

impl Error {
    pub fn budget_exhausted(
        resource: BudgetResource,
        remaining: i64,
        call_id: CallId,
    ) -> Self {
        Self::BudgetExhausted {
            resource,
            remaining,
            call_id,
        }
    }

    pub fn sandbox(message: impl Into<String>) -> Self {
        Self::Sandbox(message.into())
    }

    pub fn no_final_answer(max_iterations: u32, call_id: CallId) -> Self {
        Self::NoFinalAnswer {
            max_iterations,
            call_id,
        }
    }

    pub fn call_state_missing(call_id: CallId) -> Self {
        Self::CallStateMissing(call_id)
    }

    pub fn subprocess_comm(message: impl Into<String>) -> Self {
        Self::SubprocessComm(message.into())
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown(message.into())
    }

    /// Whether this error, surfaced from the model coordinator, should be
    /// retried. Only `ModelCall { retryable: true, .. }` is retryable;
    /// budget errors always bypass retry per spec §4.8.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ModelCall { retryable: true, .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_call_retryable_flag_gates_retry() {
        let retryable = Error::ModelCall {
            provider: "test".into(),
            model: "m".into(),
            operation: "complete".into(),
            retryable: true,
            message: "timeout".into(),
        };
        assert!(retryable.is_retryable());

        let terminal = Error::ModelCall {
            provider: "test".into(),
            model: "m".into(),
            operation: "complete".into(),
            retryable: false,
            message: "bad request".into(),
        };
        assert!(!terminal.is_retryable());
    }

    #[test]
    fn budget_errors_are_never_retryable() {
        let err = Error::budget_exhausted(BudgetResource::LlmCalls, 0, CallId::root());
        assert!(!err.is_retryable());
    }

    #[test]
    fn display_includes_resource_and_call() {
        let err = Error::budget_exhausted(BudgetResource::Depth, 0, CallId::root());
        let msg = err.to_string();
        assert!(msg.contains("depth"));
        assert!(msg.contains("root"));
    }
}
