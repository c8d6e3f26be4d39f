//! Standalone sandbox worker binary (spec §4.2).
//!
//! Speaks length-delimited JSON frames over stdin/stdout. Does not link
//! against anything host-specific; the only shared code is the wire types
//! and frame codec in `rlm_core::sandbox`.

use rlm_core::config::SandboxMode;
use rlm_core::sandbox::frame::blocking::{read_frame, write_frame};
use rlm_core::sandbox::{BridgeTransport, HostToWorker, VariableInfo, WorkerState, WorkerToHost};
use serde_json::Value;
use std::collections::HashSet;
use std::io::{self, BufReader, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

const DEFAULT_MAX_FRAME_BYTES: u64 = 4 * 1024 * 1024;

/// Bridges `llm_query`/`llm_query_batched`/tool calls out over stdout and
/// blocks reading stdin for the matching `BridgeResult`/`BridgeFailed`.
/// The worker is single-threaded, so a blocking round trip here is the
/// worker-side equivalent of the host's async suspend-and-resume.
struct StdioBridge<'a, R: Read, W: Write> {
    reader: &'a mut R,
    writer: &'a mut W,
    max_frame_bytes: u64,
    next_request_id: AtomicU64,
}

impl<'a, R: Read, W: Write> BridgeTransport for StdioBridge<'a, R, W> {
    fn call(&mut self, method: &str, args: &[Value]) -> Result<Value, String> {
        let request_id = format!("worker-bridge-{}", self.next_request_id.fetch_add(1, Ordering::Relaxed));
        let frame = WorkerToHost::BridgeCall {
            request_id: request_id.clone(),
            method: method.to_string(),
            args: args.to_vec(),
        };

        match write_frame(self.writer, &frame, self.max_frame_bytes) {
            Ok(true) => {}
            Ok(false) => return Err("BridgeCall exceeds max frame size".to_string()),
            Err(e) => return Err(format!("failed to send BridgeCall: {e}")),
        }

        loop {
            let incoming: Option<HostToWorker> = read_frame(self.reader, self.max_frame_bytes)
                .map_err(|e| format!("failed to read bridge reply: {e}"))?;
            match incoming {
                Some(HostToWorker::BridgeResult { request_id: rid, result }) if rid == request_id => {
                    return Ok(result);
                }
                Some(HostToWorker::BridgeFailed { request_id: rid, message }) if rid == request_id => {
                    return Err(message);
                }
                // Anything else arriving mid-bridge-call is unexpected under
                // this protocol (the worker never issues two outstanding
                // requests at once) but is ignored rather than treated as
                // fatal, so a stray frame cannot wedge the worker.
                Some(_) => continue,
                None => return Err("host disconnected while awaiting bridge reply".to_string()),
            }
        }
    }
}

fn classify(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn variable_info(name: &str, value: &Value) -> VariableInfo {
    let preview_full = render_preview(value);
    let preview = if preview_full.len() > 200 {
        format!("{}...", &preview_full[..200])
    } else {
        preview_full
    };
    let size = match value {
        Value::String(s) => Some(s.len() as u64),
        Value::Array(a) => Some(a.len() as u64),
        Value::Object(o) => Some(o.len() as u64),
        _ => None,
    };
    VariableInfo {
        name: name.to_string(),
        var_type: classify(value).to_string(),
        size,
        preview,
    }
}

fn render_preview(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn main() -> io::Result<()> {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut reader = BufReader::new(stdin.lock());
    let mut writer = stdout.lock();

    // Initial readiness signal; harmless if the host doesn't wait on it.
    let _ = write_frame(&mut writer, &WorkerToHost::Ready, DEFAULT_MAX_FRAME_BYTES);

    let mut state: Option<WorkerState> = None;
    let mut max_frame_bytes = DEFAULT_MAX_FRAME_BYTES;

    loop {
        let message: Option<HostToWorker> = match read_frame(&mut reader, max_frame_bytes) {
            Ok(m) => m,
            Err(_) => break,
        };
        let Some(message) = message else { break };

        match message {
            HostToWorker::Init {
                call_id,
                depth,
                sandbox_mode,
                max_frame_bytes: mfb,
                tools,
            } => {
                max_frame_bytes = mfb;
                let mode = if sandbox_mode == "strict" {
                    SandboxMode::Strict
                } else {
                    SandboxMode::Permissive
                };
                let tool_names: HashSet<String> = tools.into_iter().collect();
                state = Some(WorkerState::new(call_id, depth, mode, tool_names));
            }
            HostToWorker::ExecRequest { request_id, code } => {
                let Some(worker_state) = state.as_mut() else {
                    let _ = write_frame(
                        &mut writer,
                        &WorkerToHost::ExecError {
                            request_id,
                            message: "worker not initialized".to_string(),
                            stack: None,
                        },
                        max_frame_bytes,
                    );
                    continue;
                };

                let mut bridge = StdioBridge {
                    reader: &mut reader,
                    writer: &mut writer,
                    max_frame_bytes,
                    next_request_id: AtomicU64::new(1),
                };

                let reply = match worker_state.execute(&code, &mut bridge) {
                    Ok(output) => WorkerToHost::ExecResult { request_id, output },
                    Err(failure) => WorkerToHost::ExecError {
                        request_id,
                        message: failure.message,
                        stack: failure.stack,
                    },
                };

                match write_frame(&mut writer, &reply, max_frame_bytes) {
                    Ok(true) => {}
                    Ok(false) => {
                        let _ = write_frame(
                            &mut writer,
                            &WorkerToHost::ExecError {
                                request_id,
                                message: "Response exceeds max frame size".to_string(),
                                stack: None,
                            },
                            max_frame_bytes,
                        );
                    }
                    Err(_) => break,
                }
            }
            HostToWorker::SetVar { request_id, name, value } => {
                if let Some(worker_state) = state.as_mut() {
                    worker_state.vars.insert(name, value);
                    let _ = write_frame(&mut writer, &WorkerToHost::SetVarAck { request_id }, max_frame_bytes);
                } else {
                    let _ = write_frame(
                        &mut writer,
                        &WorkerToHost::SetVarError {
                            request_id,
                            message: "worker not initialized".to_string(),
                        },
                        max_frame_bytes,
                    );
                }
            }
            HostToWorker::GetVarRequest { request_id, name } => {
                let value = state
                    .as_ref()
                    .and_then(|s| s.vars.get(&name).cloned())
                    .unwrap_or(Value::Null);
                let _ = write_frame(&mut writer, &WorkerToHost::GetVarResult { request_id, value }, max_frame_bytes);
            }
            HostToWorker::ListVarsRequest { request_id } => {
                let variables = state
                    .as_ref()
                    .map(|s| s.vars.iter().map(|(k, v)| variable_info(k, v)).collect())
                    .unwrap_or_default();
                let _ = write_frame(
                    &mut writer,
                    &WorkerToHost::ListVarsResult { request_id, variables },
                    max_frame_bytes,
                );
            }
            HostToWorker::BridgeResult { .. } | HostToWorker::BridgeFailed { .. } => {
                // Only expected mid-`ExecRequest`, handled inside
                // `StdioBridge::call`. Arriving here means the host sent a
                // reply with no outstanding bridge call; ignore.
            }
            HostToWorker::Shutdown => break,
        }
    }

    Ok(())
}
