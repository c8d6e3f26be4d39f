//! rlm-core: recursive code-executing LLM agent runtime.
//!
//! Drives a model through an iterative read-eval-print loop inside an
//! isolated sandbox process, with recursive `llm_query` sub-calls up to a
//! configured depth. A [`Runtime`] bundles the collaborators (sandbox
//! factory, model client, prompt builder, tools, output validator) and
//! exposes the two entry points named in spec §6: [`Runtime::complete`] and
//! [`Runtime::stream`]. Grounded on `rlm-core::orchestrator::Orchestrator`
//! being the single trait external callers drive, and `OrchestratorBuilder`
//! for assembling one from its collaborators.

pub mod bridge;
pub mod budget;
pub mod call_registry;
pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod llm;
pub mod output_schema;
pub mod prompt;
pub mod runtime_state;
pub mod sandbox;
pub mod scheduler;
pub mod tools;

pub use config::{ModelTarget, RuntimeConfig, RuntimeConfigBuilder, SandboxMode, SubLlmDelegation};
pub use error::{Error, Result};
pub use events::{Event, EventKind, WarningCode};
pub use ids::{BridgeRequestId, CallId, CompletionId};

use crate::llm::LanguageModelClient;
use crate::output_schema::OutputSchemaValidator;
use crate::prompt::PromptBuilder;
use crate::runtime_state::RuntimeState;
use crate::sandbox::SandboxFactory;
use crate::scheduler::Scheduler;
use crate::tools::ToolRegistry;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;

/// Arguments to [`Runtime::complete`]/[`Runtime::stream`] (spec §6
/// `complete({query, context, depth?})`).
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub query: String,
    pub context: String,
    pub depth: u32,
    pub tools: Vec<String>,
    pub output_json_schema: Option<Value>,
}

impl CompletionRequest {
    pub fn new(query: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            context: context.into(),
            depth: 0,
            tools: Vec::new(),
            output_json_schema: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_output_json_schema(mut self, schema: Value) -> Self {
        self.output_json_schema = Some(schema);
        self
    }
}

/// A boxed stream of completion events (spec §6 `stream()`), mirroring the
/// teacher's `TrajectoryStream` type alias.
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// Bundles the external collaborators (spec §6) a completion needs and
/// exposes the two entry points external callers drive. One `Runtime` may
/// be reused across many `complete()`/`stream()` calls; each call builds a
/// fresh, independently-torn-down [`RuntimeState`] (spec §4.1, §9 "global
/// mutable state is per-completion, not process-wide").
pub struct Runtime {
    config: RuntimeConfig,
    sandbox_factory: Arc<dyn SandboxFactory>,
    llm_client: Arc<dyn LanguageModelClient>,
    prompt_builder: Arc<dyn PromptBuilder>,
    tools: ToolRegistry,
    output_validator: Option<Arc<dyn OutputSchemaValidator>>,
}

impl Runtime {
    /// Run a completion to termination, returning the root call's answer
    /// or its terminal error (spec §6).
    pub async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let (state, rx) = self.build_state();
        Self::enqueue_root_start(&state, request);
        Scheduler::new(state, rx).run().await
    }

    /// Stream events from the completion bus, finite, terminating as soon
    /// as the root call finalizes or fails (spec §6). The scheduler still
    /// runs to completion even if the returned stream is dropped early;
    /// dropping it only stops *observing* events, per spec §4.1's teardown
    /// being driven by scope closure, not subscriber presence.
    pub async fn stream(&self, request: CompletionRequest) -> Result<EventStream> {
        let (state, rx) = self.build_state();
        let events = state.events.subscribe();
        Self::enqueue_root_start(&state, request);

        tokio::spawn(async move {
            let _ = Scheduler::new(state, rx).run().await;
        });

        // `done` latches once a terminal event has been yielded, so the
        // unfold stops polling an already-terminated bus instead of
        // waiting on `Closed` (subscribers other than this one may still
        // be draining it).
        let stream = futures::stream::unfold((events, false), |(mut events, done)| async move {
            if done {
                return None;
            }
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let terminal = event.is_terminal();
                        return Some((event, (events, terminal)));
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }

    fn build_state(&self) -> (Arc<RuntimeState>, tokio::sync::mpsc::UnboundedReceiver<runtime_state::Command>) {
        RuntimeState::new(
            self.config.clone(),
            Arc::clone(&self.sandbox_factory),
            Arc::clone(&self.llm_client),
            Arc::clone(&self.prompt_builder),
            self.tools.clone(),
            self.output_validator.clone(),
        )
    }

    /// Enqueue the root `StartCall` (spec §4.7); the scheduler's own
    /// `handle_start_call` does the sandbox creation, bridge-forwarding
    /// task, and registry bookkeeping, so the API boundary need only
    /// translate a [`CompletionRequest`] into a `Command`.
    fn enqueue_root_start(state: &Arc<RuntimeState>, request: CompletionRequest) {
        state.enqueue(runtime_state::Command::StartCall {
            call_id: CallId::root(),
            depth: request.depth,
            query: request.query,
            context: request.context,
            parent_bridge_request_id: None,
            tools: request.tools,
            output_json_schema: request.output_json_schema,
        });
    }
}

/// Builder for [`Runtime`], following the teacher's `OrchestratorBuilder`
/// fluent-setter shape.
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    sandbox_factory: Arc<dyn SandboxFactory>,
    llm_client: Arc<dyn LanguageModelClient>,
    prompt_builder: Arc<dyn PromptBuilder>,
    tools: ToolRegistry,
    output_validator: Option<Arc<dyn OutputSchemaValidator>>,
}

impl RuntimeBuilder {
    pub fn new(
        sandbox_factory: Arc<dyn SandboxFactory>,
        llm_client: Arc<dyn LanguageModelClient>,
        prompt_builder: Arc<dyn PromptBuilder>,
    ) -> Self {
        Self {
            config: RuntimeConfig::default(),
            sandbox_factory,
            llm_client,
            prompt_builder,
            tools: ToolRegistry::new(),
            output_validator: None,
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn output_validator(mut self, validator: Arc<dyn OutputSchemaValidator>) -> Self {
        self.output_validator = Some(validator);
        self
    }

    pub fn build(self) -> Runtime {
        Runtime {
            config: self.config,
            sandbox_factory: self.sandbox_factory,
            llm_client: self.llm_client,
            prompt_builder: self.prompt_builder,
            tools: self.tools,
            output_validator: self.output_validator,
        }
    }
}
