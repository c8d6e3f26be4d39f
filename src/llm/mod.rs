//! Model-layer collaborator trait and the coordinator that wraps calls to
//! it with budget/permit/retry bookkeeping (spec §4.8/§6).

pub mod client;
pub mod coordinator;

pub use client::{GenerateTextRequest, GenerateTextResponse, LanguageModelClient, ModelCallFailure, TokenUsage};
pub use coordinator::LlmCoordinator;
