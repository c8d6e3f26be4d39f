//! Scheduler Loop (spec §4.7): the single consumer of the command queue.
//!
//! Grounded on `rlm-core::orchestrator::Orchestrator::run`'s single-writer
//! event loop shape -- one task owns the command queue and either mutates
//! state inline or forks a cooperative fiber whose completion re-enqueues
//! the next command -- generalized here from a flat turn loop to the
//! recursive `StartCall`/`GenerateStep`/`ExecuteCode`/`HandleBridgeCall`
//! state machine spec'd for a tree of concurrent calls.

use crate::bridge::await_bridge;
use crate::call_registry::{CallContext, CallScope, TranscriptEntry};
use crate::error::{Error, Result};
use crate::events::{Event, EventKind, WarningCode};
use crate::ids::{BridgeRequestId, CallId};
use crate::llm::client::resolve_usage_tokens;
use crate::prompt::ReplPromptParams;
use crate::runtime_state::RuntimeState;
use crate::sandbox::{BridgeCallEnvelope, SandboxHandle};
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::sync::mpsc;
use tracing::warn;

/// A unit of work enqueued on the single-writer command queue (spec §4.7).
#[derive(Debug, Clone)]
pub enum Command {
    StartCall {
        call_id: CallId,
        depth: u32,
        query: String,
        context: String,
        parent_bridge_request_id: Option<BridgeRequestId>,
        tools: Vec<String>,
        output_json_schema: Option<Value>,
    },
    GenerateStep {
        call_id: CallId,
    },
    ExecuteCode {
        call_id: CallId,
        code: String,
    },
    CodeExecuted {
        call_id: CallId,
        output: String,
    },
    HandleBridgeCall {
        call_id: CallId,
        bridge_request_id: BridgeRequestId,
        method: String,
        args: Vec<Value>,
    },
    Finalize {
        call_id: CallId,
        answer: String,
    },
    FailCall {
        call_id: CallId,
        error: Error,
    },
}

impl Command {
    fn tag(&self) -> &'static str {
        match self {
            Self::StartCall { .. } => "StartCall",
            Self::GenerateStep { .. } => "GenerateStep",
            Self::ExecuteCode { .. } => "ExecuteCode",
            Self::CodeExecuted { .. } => "CodeExecuted",
            Self::HandleBridgeCall { .. } => "HandleBridgeCall",
            Self::Finalize { .. } => "Finalize",
            Self::FailCall { .. } => "FailCall",
        }
    }
}

fn final_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"FINAL\(\s*(?:"((?:[^"\\]|\\.)*)"|'((?:[^'\\]|\\.)*)'|`((?:[^`\\]|\\.)*)`)\s*\)"#)
            .expect("FINAL pattern is valid")
    })
}

fn code_block_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"```[a-zA-Z0-9_+-]*\n([\s\S]*?)\n```").expect("code block pattern is valid"))
}

/// The three outcomes of parsing an assistant reply, in spec §4.7's
/// priority order: a `FINAL(...)`, a fenced code block, or neither (the
/// model is stalling).
enum ParsedReply {
    Final(String),
    Code(String),
    Stall,
}

fn parse_assistant_reply(text: &str) -> ParsedReply {
    if let Some(caps) = final_pattern().captures(text) {
        let answer = caps
            .get(1)
            .or_else(|| caps.get(2))
            .or_else(|| caps.get(3))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        return ParsedReply::Final(answer);
    }
    if let Some(caps) = code_block_pattern().captures(text) {
        return ParsedReply::Code(caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default());
    }
    ParsedReply::Stall
}

/// Single-consumer reactor over [`Command`] (spec §4.7). Owns the receiver
/// half of the queue whose sender lives on [`RuntimeState`]; producers
/// (forked fibers, the public API, the sandbox bridge-forwarding task)
/// reach the queue only through `state.enqueue`.
pub struct Scheduler {
    state: Arc<RuntimeState>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Scheduler {
    pub fn new(state: Arc<RuntimeState>, commands: mpsc::UnboundedReceiver<Command>) -> Self {
        Self { state, commands }
    }

    /// Drive the completion to termination. Returns the root call's answer,
    /// or its terminal error. Exits as soon as the root call finalizes or
    /// fails (spec §6 `stream()` "terminating when root finalizes or
    /// fails"); any subtree still registered at that point (an abandoned
    /// `llm_query_batched` sibling, say) is closed via `close_subtree`
    /// before `run()` returns, so the root scope's closure really does
    /// transitively tear down everything beneath it rather than merely
    /// abandoning the queue.
    pub async fn run(mut self) -> Result<String> {
        while let Some(command) = self.commands.recv().await {
            let tag = command.tag();
            match command {
                Command::StartCall {
                    call_id,
                    depth,
                    query,
                    context,
                    parent_bridge_request_id,
                    tools,
                    output_json_schema,
                } => {
                    self.handle_start_call(call_id, depth, query, context, parent_bridge_request_id, tools, output_json_schema)
                        .await;
                }
                Command::GenerateStep { call_id } => {
                    self.handle_generate_step(call_id, tag).await;
                }
                Command::ExecuteCode { call_id, code } => {
                    self.handle_execute_code(call_id, code).await;
                }
                Command::CodeExecuted { call_id, output } => {
                    self.handle_code_executed(call_id, output, tag).await;
                }
                Command::HandleBridgeCall {
                    call_id,
                    bridge_request_id,
                    method,
                    args,
                } => {
                    self.handle_bridge_call(call_id, bridge_request_id, method, args, tag).await;
                }
                Command::Finalize { call_id, answer } => {
                    let is_root = call_id.as_str() == CallId::ROOT;
                    let finalized = self.handle_finalize(call_id, answer).await;
                    if is_root {
                        self.close_remaining_subtree().await;
                        return Ok(finalized);
                    }
                }
                Command::FailCall { call_id, error } => {
                    let is_root = call_id.as_str() == CallId::ROOT;
                    self.handle_fail_call(call_id, error.clone()).await;
                    if is_root {
                        self.close_remaining_subtree().await;
                        return Err(error);
                    }
                }
            }
        }
        Err(Error::unknown("command queue closed before the root call terminated"))
    }

    /// Close every call scope still registered under the root once the root
    /// itself has finalized or failed. `handle_finalize`/`handle_fail_call`
    /// already unregistered the root's own `CallContext`, so this only ever
    /// finds orphaned descendants -- e.g. an `llm_query_batched` sibling
    /// abandoned by the fail-fast open-question resolution (spec §9) whose
    /// own bridge-forwarding fiber would otherwise loop on its mpsc receiver
    /// forever, holding its sandbox subprocess alive indefinitely.
    async fn close_remaining_subtree(&self) {
        if let Err(err) = self.state.calls.close_subtree(&CallId::root(), &self.state.bridge_pending).await {
            warn!(error = %err, "error closing orphaned call scopes after root termination");
        }
    }

    fn warn_stale(&self, call_id: Option<CallId>, command_tag: &str) {
        self.state.events.publish(Event::new(
            self.state.completion_id.clone(),
            call_id.clone(),
            None,
            EventKind::SchedulerWarning {
                code: WarningCode::StaleCommandDropped,
                message: format!("{command_tag} dropped: call state missing"),
                call_id,
                command_tag: Some(command_tag.to_string()),
            },
        ));
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_start_call(
        &self,
        call_id: CallId,
        depth: u32,
        query: String,
        context: String,
        parent_bridge_request_id: Option<BridgeRequestId>,
        tools: Vec<String>,
        output_json_schema: Option<Value>,
    ) {
        let state = &self.state;

        if let Err(err) = state.budget.check_depth(depth, &call_id) {
            state.events.publish(Event::new(
                state.completion_id.clone(),
                Some(call_id.clone()),
                Some(depth),
                EventKind::CallFailed { error: err.to_string() },
            ));
            if let Some(bridge_id) = &parent_bridge_request_id {
                state.bridge_pending.fail(bridge_id, err.to_string());
            }
            return;
        }

        let (bridge_tx, mut bridge_rx) = mpsc::unbounded_channel::<BridgeCallEnvelope>();
        let sandbox = match state.sandbox_factory.create(call_id.clone(), depth, bridge_tx).await {
            Ok(sandbox) => sandbox,
            Err(err) => {
                state.events.publish(Event::new(
                    state.completion_id.clone(),
                    Some(call_id.clone()),
                    Some(depth),
                    EventKind::CallFailed { error: err.to_string() },
                ));
                if let Some(bridge_id) = &parent_bridge_request_id {
                    state.bridge_pending.fail(bridge_id, err.to_string());
                }
                return;
            }
        };

        let mut scope = CallScope::new(sandbox);
        if let Err(err) = scope.sandbox().set_variable("context", Value::String(context.clone())).await {
            let _ = scope.close().await;
            state.events.publish(Event::new(
                state.completion_id.clone(),
                Some(call_id.clone()),
                Some(depth),
                EventKind::CallFailed { error: err.to_string() },
            ));
            if let Some(bridge_id) = &parent_bridge_request_id {
                state.bridge_pending.fail(bridge_id, err.to_string());
            }
            return;
        }

        // Forward every bridge call this sandbox emits onto the command
        // queue; aborted when the scope closes so no stray forwarding task
        // outlives its call.
        let forwarding_state = Arc::clone(state);
        let forward_task = tokio::spawn(async move {
            while let Some(envelope) = bridge_rx.recv().await {
                forwarding_state.enqueue(Command::HandleBridgeCall {
                    call_id: envelope.call_id,
                    bridge_request_id: BridgeRequestId::from_raw(envelope.bridge_request_id),
                    method: envelope.method,
                    args: envelope.args,
                });
            }
        });
        scope.attach_task(forward_task);

        let ctx = CallContext::new(
            call_id.clone(),
            depth,
            query,
            context,
            parent_bridge_request_id,
            tools,
            output_json_schema,
            scope,
        );
        state.calls.register(ctx).await;

        state.events.publish(Event::new(
            state.completion_id.clone(),
            Some(call_id.clone()),
            Some(depth),
            EventKind::CallStarted,
        ));
        state.enqueue(Command::GenerateStep { call_id });
    }

    async fn handle_generate_step(&self, call_id: CallId, tag: &str) {
        let state = &self.state;

        if !state.calls.contains(&call_id).await {
            self.warn_stale(Some(call_id), tag);
            return;
        }

        if let Err(err) = state.budget.reserve_iteration(&call_id) {
            state.enqueue(Command::FailCall { call_id, error: err });
            return;
        }

        let snapshot = state
            .calls
            .with_mut(&call_id, |ctx| {
                ctx.iteration += 1;
                (ctx.iteration, ctx.depth, ctx.query.clone(), ctx.context.clone(), ctx.transcript.clone())
            })
            .await;
        let (iteration, depth, query, context, transcript) = match snapshot {
            Ok(v) => v,
            Err(_) => {
                self.warn_stale(Some(call_id), tag);
                return;
            }
        };

        state.events.publish(Event::new(
            state.completion_id.clone(),
            Some(call_id.clone()),
            Some(depth),
            EventKind::IterationStarted {
                iteration,
                iterations_remaining: state.budget.snapshot().iterations_remaining,
            },
        ));

        let prompt = state.prompt_builder.build_repl_prompt(ReplPromptParams {
            system_prompt: None,
            query: &query,
            context_length: Some(context.len()),
            context_metadata: None,
            context_preview: Some(&context),
            transcript: &transcript,
        });

        let is_sub_call = depth > 0;
        let response = match state.llm.generate(&call_id, depth, is_sub_call, prompt.0).await {
            Ok(response) => response,
            Err(err) => {
                state.enqueue(Command::FailCall { call_id, error: err });
                return;
            }
        };

        state.events.publish(Event::new(
            state.completion_id.clone(),
            Some(call_id.clone()),
            Some(depth),
            EventKind::ModelResponse {
                text: response.text.clone(),
                usage_tokens: resolve_usage_tokens(&response.usage),
            },
        ));

        let assistant_text = response.text;
        let parsed = state
            .calls
            .with_mut(&call_id, |ctx| {
                ctx.transcript.push(TranscriptEntry::new(assistant_text.clone()));
                parse_assistant_reply(&assistant_text)
            })
            .await;

        match parsed {
            Ok(ParsedReply::Final(answer)) => state.enqueue(Command::Finalize { call_id, answer }),
            Ok(ParsedReply::Code(code)) => state.enqueue(Command::ExecuteCode { call_id, code }),
            Ok(ParsedReply::Stall) => {
                if state.budget.snapshot().iterations_remaining > 0 {
                    state.enqueue(Command::GenerateStep { call_id });
                } else {
                    state.enqueue(Command::FailCall {
                        call_id: call_id.clone(),
                        error: Error::no_final_answer(state.config.max_iterations, call_id),
                    });
                }
            }
            Err(_) => self.warn_stale(Some(call_id), tag),
        }
    }

    async fn handle_execute_code(&self, call_id: CallId, code: String) {
        let state = &self.state;
        let depth = match state.calls.with_mut(&call_id, |ctx| ctx.depth).await {
            Ok(depth) => depth,
            Err(_) => {
                self.warn_stale(Some(call_id), "ExecuteCode");
                return;
            }
        };

        state.events.publish(Event::new(
            state.completion_id.clone(),
            Some(call_id.clone()),
            Some(depth),
            EventKind::CodeExecutionStarted { code: code.clone() },
        ));

        let sandbox = match state.calls.with_mut(&call_id, |ctx| ctx.scope.sandbox()).await {
            Ok(sandbox) => sandbox,
            Err(_) => {
                self.warn_stale(Some(call_id), "ExecuteCode");
                return;
            }
        };

        let forked_state = Arc::clone(state);
        let forked_call_id = call_id.clone();
        let handle = tokio::spawn(async move {
            match sandbox.execute(&code).await {
                Ok(output) => forked_state.enqueue(Command::CodeExecuted { call_id: forked_call_id, output }),
                Err(err) => {
                    let attached = state_attach_execution_error(&forked_state, &forked_call_id, &err).await;
                    if attached {
                        forked_state.enqueue(Command::GenerateStep { call_id: forked_call_id });
                    }
                }
            }
        });

        // Attach so closing the scope (e.g. a concurrent FailCall) aborts
        // the in-flight execution fiber.
        let _ = state.calls.with_mut(&call_id, |ctx| ctx.scope.attach_task(handle)).await;
    }

    async fn handle_code_executed(&self, call_id: CallId, output: String, tag: &str) {
        let state = &self.state;
        let max_chars = state.config.max_execution_output_chars;
        let truncated = truncate_output(&output, max_chars);

        let depth = match state
            .calls
            .with_mut(&call_id, |ctx| {
                ctx.attach_execution_output(truncated.clone());
                ctx.depth
            })
            .await
        {
            Ok(depth) => depth,
            Err(_) => {
                self.warn_stale(Some(call_id), tag);
                return;
            }
        };

        state.events.publish(Event::new(
            state.completion_id.clone(),
            Some(call_id.clone()),
            Some(depth),
            EventKind::CodeExecutionCompleted { output: truncated },
        ));
        state.enqueue(Command::GenerateStep { call_id });
    }

    async fn handle_bridge_call(&self, call_id: CallId, bridge_request_id: BridgeRequestId, method: String, args: Vec<Value>, tag: &str) {
        let state = &self.state;

        let depth = match state.calls.with_mut(&call_id, |ctx| ctx.depth).await {
            Ok(depth) => depth,
            Err(_) => {
                self.warn_stale(Some(call_id), tag);
                return;
            }
        };
        state.events.publish(Event::new(
            state.completion_id.clone(),
            Some(call_id.clone()),
            Some(depth),
            EventKind::BridgeCallReceived { method: method.clone() },
        ));

        let sandbox = match state.calls.with_mut(&call_id, |ctx| ctx.scope.sandbox()).await {
            Ok(sandbox) => sandbox,
            Err(_) => {
                self.warn_stale(Some(call_id), tag);
                return;
            }
        };

        match method.as_str() {
            "llm_query" => {
                let query = args.first().and_then(Value::as_str).unwrap_or_default().to_string();
                let context = args.get(1).and_then(Value::as_str).unwrap_or_default().to_string();
                self.dispatch_llm_query(call_id, depth, bridge_request_id, sandbox, query, context).await;
            }
            "llm_query_batched" => {
                let queries: Vec<String> = args
                    .first()
                    .and_then(Value::as_array)
                    .map(|a| a.iter().map(|v| v.as_str().unwrap_or_default().to_string()).collect())
                    .unwrap_or_default();
                let contexts: Vec<String> = args
                    .get(1)
                    .and_then(Value::as_array)
                    .map(|a| a.iter().map(|v| v.as_str().unwrap_or_default().to_string()).collect())
                    .unwrap_or_default();
                self.dispatch_llm_query_batched(call_id, depth, bridge_request_id, sandbox, queries, contexts).await;
            }
            other => {
                self.dispatch_tool_call(call_id, bridge_request_id, sandbox, other.to_string(), args).await;
            }
        }
    }

    async fn dispatch_llm_query(
        &self,
        call_id: CallId,
        depth: u32,
        bridge_request_id: BridgeRequestId,
        sandbox: Arc<dyn SandboxHandle>,
        query: String,
        context: String,
    ) {
        let state = &self.state;
        let rx = state.bridge_pending.register(bridge_request_id.clone());
        let _ = state
            .calls
            .with_mut(&call_id, |ctx| ctx.track_bridge_request(bridge_request_id.clone()))
            .await;
        let child_id = CallId::child_of(&call_id);

        state.enqueue(Command::StartCall {
            call_id: child_id,
            depth: depth + 1,
            query,
            context,
            parent_bridge_request_id: Some(bridge_request_id.clone()),
            tools: Vec::new(),
            output_json_schema: None,
        });

        let bridge_request_id_str = bridge_request_id.to_string();
        let handle = tokio::spawn(async move {
            match await_bridge(rx).await {
                Ok(value) => {
                    let _ = sandbox.deliver_bridge_result(&bridge_request_id_str, value).await;
                }
                Err(err) => {
                    let _ = sandbox.deliver_bridge_failure(&bridge_request_id_str, err.to_string()).await;
                }
            }
        });
        let _ = state.calls.with_mut(&call_id, |ctx| ctx.scope.attach_task(handle)).await;
    }

    async fn dispatch_llm_query_batched(
        &self,
        call_id: CallId,
        depth: u32,
        bridge_request_id: BridgeRequestId,
        sandbox: Arc<dyn SandboxHandle>,
        queries: Vec<String>,
        contexts: Vec<String>,
    ) {
        let state = &self.state;
        let mut receivers = Vec::with_capacity(queries.len());
        for (index, query) in queries.into_iter().enumerate() {
            let child_bridge_id = BridgeRequestId::new();
            let rx = state.bridge_pending.register(child_bridge_id.clone());
            let _ = state
                .calls
                .with_mut(&call_id, |ctx| ctx.track_bridge_request(child_bridge_id.clone()))
                .await;
            let context = contexts.get(index).cloned().unwrap_or_default();
            let child_id = CallId::child_of(&call_id);
            state.enqueue(Command::StartCall {
                call_id: child_id,
                depth: depth + 1,
                query,
                context,
                parent_bridge_request_id: Some(child_bridge_id),
                tools: Vec::new(),
                output_json_schema: None,
            });
            receivers.push(rx);
        }

        let bridge_request_id_str = bridge_request_id.to_string();
        let handle = tokio::spawn(async move {
            let mut answers = Vec::with_capacity(receivers.len());
            for rx in receivers {
                match await_bridge(rx).await {
                    Ok(value) => answers.push(value),
                    Err(err) => {
                        // Fail-fast (spec §9 open question): the first child
                        // failure fails the whole batch immediately.
                        let _ = sandbox.deliver_bridge_failure(&bridge_request_id_str, err.to_string()).await;
                        return;
                    }
                }
            }
            let _ = sandbox.deliver_bridge_result(&bridge_request_id_str, Value::Array(answers)).await;
        });
        let _ = state.calls.with_mut(&call_id, |ctx| ctx.scope.attach_task(handle)).await;
    }

    async fn dispatch_tool_call(
        &self,
        call_id: CallId,
        bridge_request_id: BridgeRequestId,
        sandbox: Arc<dyn SandboxHandle>,
        method: String,
        args: Vec<Value>,
    ) {
        let state = &self.state;
        let Some(tool) = state.tools.get(&method) else {
            let bridge_request_id_str = bridge_request_id.to_string();
            tokio::spawn(async move {
                let _ = sandbox
                    .deliver_bridge_failure(&bridge_request_id_str, format!("unknown bridge method: {method}"))
                    .await;
            });
            return;
        };

        let bridge_request_id_str = bridge_request_id.to_string();
        let timeout = tool.timeout();
        let handle = tokio::spawn(async move {
            let outcome = tokio::time::timeout(timeout, tool.handle(args)).await;
            match outcome {
                Ok(Ok(value)) => {
                    let _ = sandbox.deliver_bridge_result(&bridge_request_id_str, value).await;
                }
                Ok(Err(tool_err)) => {
                    let _ = sandbox.deliver_bridge_failure(&bridge_request_id_str, tool_err.to_string()).await;
                }
                Err(_) => {
                    let _ = sandbox.deliver_bridge_failure(&bridge_request_id_str, "tool call timed out".to_string()).await;
                }
            }
        });
        let _ = state.calls.with_mut(&call_id, |ctx| ctx.scope.attach_task(handle)).await;
    }

    /// Runs the optional output-extraction pass, delivers the answer to the
    /// parent bridge if any, and closes the scope. Returns the (possibly
    /// schema-coerced) answer, which is what `complete()` ultimately
    /// returns for the root call.
    async fn handle_finalize(&self, call_id: CallId, answer: String) -> String {
        let state = &self.state;

        let answer = if let Some(validator) = &state.output_validator {
            let schema_and_transcript = state
                .calls
                .with_mut(&call_id, |ctx| {
                    ctx.output_json_schema.clone().map(|schema| {
                        let text = ctx
                            .transcript
                            .last()
                            .map(|entry| entry.assistant_response.clone())
                            .unwrap_or_else(|| answer.clone());
                        (schema, text)
                    })
                })
                .await
                .ok()
                .flatten();
            match schema_and_transcript {
                Some((schema, text)) => match validator.parse_and_validate_json(&text, &schema, false) {
                    Ok(value) => value.to_string(),
                    Err(_) => answer,
                },
                None => answer,
            }
        } else {
            answer
        };

        let (depth, parent_bridge_request_id) = match state
            .calls
            .with_mut(&call_id, |ctx| (ctx.depth, ctx.parent_bridge_request_id.clone()))
            .await
        {
            Ok(v) => v,
            Err(_) => {
                self.warn_stale(Some(call_id), "Finalize");
                return answer;
            }
        };

        state.events.publish(Event::new(
            state.completion_id.clone(),
            Some(call_id.clone()),
            Some(depth),
            EventKind::CallFinalized { answer: answer.clone() },
        ));

        if let Some(bridge_id) = parent_bridge_request_id {
            state.bridge_pending.resolve(&bridge_id, Value::String(answer.clone()));
        }

        if let Err(err) = state.calls.unregister(&call_id, &state.bridge_pending).await {
            warn!(call_id = %call_id, error = %err, "error closing call scope during Finalize");
        }

        answer
    }

    async fn handle_fail_call(&self, call_id: CallId, error: Error) {
        let state = &self.state;

        let (depth, parent_bridge_request_id) = match state
            .calls
            .with_mut(&call_id, |ctx| (ctx.depth, ctx.parent_bridge_request_id.clone()))
            .await
        {
            Ok(v) => v,
            Err(_) => (0, None),
        };

        state.events.publish(Event::new(
            state.completion_id.clone(),
            Some(call_id.clone()),
            Some(depth),
            EventKind::CallFailed { error: error.to_string() },
        ));

        if let Some(bridge_id) = parent_bridge_request_id {
            state.bridge_pending.fail(&bridge_id, error.to_string());
        }

        if let Err(unregister_err) = state.calls.unregister(&call_id, &state.bridge_pending).await {
            warn!(call_id = %call_id, error = %unregister_err, "error closing call scope during FailCall");
        }
    }
}

/// Attach an execution error as the transcript's execution output. Returns
/// `false` (and leaves no trace) if the call is no longer registered, so
/// the caller can skip re-enqueuing `GenerateStep` for a stale execution.
async fn state_attach_execution_error(state: &Arc<RuntimeState>, call_id: &CallId, err: &Error) -> bool {
    let message = err.to_string();
    state
        .calls
        .with_mut(call_id, |ctx| ctx.attach_execution_output(message.clone()))
        .await
        .is_ok()
}

fn truncate_output(output: &str, max_chars: usize) -> String {
    if output.chars().count() <= max_chars {
        return output.to_string();
    }
    let mut truncated: String = output.chars().take(max_chars).collect();
    truncated.push_str("...[truncated]");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_final_with_double_quotes() {
        match parse_assistant_reply(r#"the answer is FINAL("42")"#) {
            ParsedReply::Final(answer) => assert_eq!(answer, "42"),
            _ => panic!("expected Final"),
        }
    }

    #[test]
    fn parses_final_with_single_and_backtick_quotes() {
        match parse_assistant_reply("FINAL('hi')") {
            ParsedReply::Final(answer) => assert_eq!(answer, "hi"),
            _ => panic!("expected Final"),
        }
        match parse_assistant_reply("FINAL(`hi`)") {
            ParsedReply::Final(answer) => assert_eq!(answer, "hi"),
            _ => panic!("expected Final"),
        }
    }

    #[test]
    fn parses_fenced_code_block() {
        let text = "let's compute:\n```js\nprint(3+4)\n```\n";
        match parse_assistant_reply(text) {
            ParsedReply::Code(code) => assert_eq!(code, "print(3+4)"),
            _ => panic!("expected Code"),
        }
    }

    #[test]
    fn final_takes_priority_over_code_block() {
        let text = "```js\nprint(1)\n```\nFINAL(\"done\")";
        match parse_assistant_reply(text) {
            ParsedReply::Final(answer) => assert_eq!(answer, "done"),
            _ => panic!("expected Final to take priority"),
        }
    }

    #[test]
    fn neither_final_nor_code_is_a_stall() {
        match parse_assistant_reply("I'm thinking about it.") {
            ParsedReply::Stall => {}
            _ => panic!("expected Stall"),
        }
    }

    #[test]
    fn truncate_output_respects_max_chars() {
        let output = "a".repeat(20);
        let truncated = truncate_output(&output, 5);
        assert!(truncated.starts_with("aaaaa"));
        assert!(truncated.contains("truncated"));
        assert_eq!(truncate_output("short", 100), "short");
    }
}
