//! Per-completion runtime container (spec §4.1).
//!
//! Grounded on `rlm-core::orchestrator`'s use of `tokio::sync` primitives
//! for shared orchestration state and `rlm-core::repl::ReplPool`'s
//! `Arc`-shared pooling pattern. Created fresh per `complete()`/`stream()`
//! and torn down when the scheduler loop exits.

use crate::bridge::BridgeStore;
use crate::budget::BudgetManager;
use crate::call_registry::CallRegistry;
use crate::config::RuntimeConfig;
use crate::events::EventBus;
use crate::ids::CompletionId;
use crate::llm::{LanguageModelClient, LlmCoordinator};
use crate::output_schema::OutputSchemaValidator;
use crate::prompt::PromptBuilder;
use crate::sandbox::SandboxFactory;
use crate::tools::ToolRegistry;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A unit of work enqueued on the single-writer command queue. Defined
/// here rather than in `scheduler` so `RuntimeState::enqueue` can be
/// called from any producer (forked fibers, the public API) without
/// depending on the scheduler module.
pub use crate::scheduler::Command;

/// Every field a running completion needs, shared by `Arc` between the
/// scheduler and the fibers it forks.
///
/// Field order matters: plain structs drop fields top-to-bottom, and
/// `events` is declared last so it is the last thing released when the
/// final `Arc<RuntimeState>` is dropped, matching spec §4.1's "shut down
/// the event bus last" teardown policy without a separate consuming step.
pub struct RuntimeState {
    pub completion_id: CompletionId,
    pub config: Arc<RuntimeConfig>,
    pub commands: mpsc::UnboundedSender<Command>,
    pub budget: Arc<BudgetManager>,
    pub calls: CallRegistry,
    pub bridge_pending: BridgeStore,
    pub sandbox_factory: Arc<dyn SandboxFactory>,
    pub llm: Arc<LlmCoordinator>,
    pub prompt_builder: Arc<dyn PromptBuilder>,
    pub tools: ToolRegistry,
    pub output_validator: Option<Arc<dyn OutputSchemaValidator>>,
    pub events: EventBus,
}

impl RuntimeState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RuntimeConfig,
        sandbox_factory: Arc<dyn SandboxFactory>,
        llm_client: Arc<dyn LanguageModelClient>,
        prompt_builder: Arc<dyn PromptBuilder>,
        tools: ToolRegistry,
        output_validator: Option<Arc<dyn OutputSchemaValidator>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Command>) {
        let config = Arc::new(config);
        let (commands, rx) = mpsc::unbounded_channel();
        let budget = Arc::new(BudgetManager::new(
            config.max_iterations,
            config.max_llm_calls,
            config.max_total_tokens,
            config.max_depth,
            config.concurrency,
        ));
        let llm = Arc::new(LlmCoordinator::new(Arc::clone(&budget), llm_client, Arc::clone(&config)));
        let events = EventBus::new(config.event_buffer_capacity);

        let state = Arc::new(Self {
            completion_id: CompletionId::new(),
            commands,
            budget,
            calls: CallRegistry::new(),
            bridge_pending: BridgeStore::new(),
            sandbox_factory,
            llm,
            prompt_builder,
            tools,
            output_validator,
            events,
            config,
        });
        (state, rx)
    }

    /// Enqueue a command. Silently dropped if the queue is already closed
    /// (the scheduler has exited) -- per spec §4.7, a closed queue is a
    /// completion-shutdown condition, not a panic.
    pub fn enqueue(&self, command: Command) {
        let _ = self.commands.send(command);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::{GenerateTextRequest, GenerateTextResponse, ModelCallFailure, TokenUsage};
    use crate::prompt::{ExtractPromptParams, OneShotPromptParams, Prompt, ReplPromptParams};
    use crate::sandbox::{BridgeCallEnvelope, SandboxHandle, VariableInfo};
    use async_trait::async_trait;
    use serde_json::Value;

    struct NoopClient;
    #[async_trait]
    impl LanguageModelClient for NoopClient {
        async fn generate_text(&self, _request: GenerateTextRequest) -> std::result::Result<GenerateTextResponse, ModelCallFailure> {
            Ok(GenerateTextResponse {
                text: String::new(),
                usage: TokenUsage::default(),
            })
        }
    }

    struct NoopPromptBuilder;
    impl PromptBuilder for NoopPromptBuilder {
        fn build_repl_prompt(&self, _params: ReplPromptParams<'_>) -> Prompt {
            Prompt(String::new())
        }
        fn build_one_shot_prompt(&self, _params: OneShotPromptParams<'_>) -> Prompt {
            Prompt(String::new())
        }
        fn build_extract_prompt(&self, _params: ExtractPromptParams<'_>) -> Prompt {
            Prompt(String::new())
        }
    }

    struct NoopSandboxFactory;
    struct NoopSandbox;

    #[async_trait]
    impl SandboxHandle for NoopSandbox {
        async fn execute(&self, _code: &str) -> crate::error::Result<String> {
            Ok(String::new())
        }
        async fn set_variable(&self, _name: &str, _value: Value) -> crate::error::Result<()> {
            Ok(())
        }
        async fn get_variable(&self, _name: &str) -> crate::error::Result<Value> {
            Ok(Value::Null)
        }
        async fn list_variables(&self) -> crate::error::Result<Vec<VariableInfo>> {
            Ok(Vec::new())
        }
        async fn deliver_bridge_result(&self, _id: &str, _result: Value) -> crate::error::Result<()> {
            Ok(())
        }
        async fn deliver_bridge_failure(&self, _id: &str, _message: String) -> crate::error::Result<()> {
            Ok(())
        }
        async fn shutdown(&self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl SandboxFactory for NoopSandboxFactory {
        async fn create(
            &self,
            _call_id: crate::ids::CallId,
            _depth: u32,
            _bridge_tx: mpsc::UnboundedSender<BridgeCallEnvelope>,
        ) -> crate::error::Result<Arc<dyn SandboxHandle>> {
            Ok(Arc::new(NoopSandbox))
        }
    }

    #[tokio::test]
    async fn construction_wires_budget_from_config() {
        let mut config = RuntimeConfig::default();
        config.max_llm_calls = 7;
        let (state, _rx) = RuntimeState::new(
            config,
            Arc::new(NoopSandboxFactory),
            Arc::new(NoopClient),
            Arc::new(NoopPromptBuilder),
            ToolRegistry::new(),
            None,
        );
        assert_eq!(state.budget.snapshot().llm_calls_remaining, 7);
    }

    #[tokio::test]
    async fn enqueue_after_receiver_drop_does_not_panic() {
        let (state, rx) = RuntimeState::new(
            RuntimeConfig::default(),
            Arc::new(NoopSandboxFactory),
            Arc::new(NoopClient),
            Arc::new(NoopPromptBuilder),
            ToolRegistry::new(),
            None,
        );
        drop(rx);
        state.enqueue(Command::Finalize {
            call_id: crate::ids::CallId::root(),
            answer: "x".into(),
        });
    }
}
