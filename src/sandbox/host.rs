//! Parent side of the sandbox worker IPC.
//!
//! Grounded on `rlm-core::repl::ReplHandle`/`ReplConfig`, generalized from
//! blocking newline-JSON-RPC over a Python subprocess to fully async
//! length-delimited framed I/O over a `tokio::process::Child`, with a
//! dedicated reader task that both resolves host-initiated requests and
//! forwards `BridgeCall` frames onward (spec §4.3).

use super::frame::{read_frame_async, write_frame_async};
use super::protocol::{HostToWorker, VariableInfo, WorkerToHost};
use crate::error::{Error, Result};
use crate::ids::{CallId, RequestIdAllocator};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;

/// Object-safe facade over a running sandbox, abstracting the concrete
/// process-based [`SandboxInstance`] behind a trait so the scheduler (and
/// its tests) can run against an in-memory fake with no subprocess.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    async fn execute(&self, code: &str) -> Result<String>;
    async fn set_variable(&self, name: &str, value: Value) -> Result<()>;
    async fn get_variable(&self, name: &str) -> Result<Value>;
    async fn list_variables(&self) -> Result<Vec<VariableInfo>>;
    async fn deliver_bridge_result(&self, bridge_request_id: &str, result: Value) -> Result<()>;
    async fn deliver_bridge_failure(&self, bridge_request_id: &str, message: String) -> Result<()>;
    /// Idempotent: safe to call more than once (spec §8 "two `Shutdown`
    /// messages ... second is a no-op"). Takes `&self` rather than
    /// consuming ownership so a [`crate::call_registry::CallScope`] can
    /// hand out cheap `Arc` clones to forked fibers while still owning the
    /// teardown call itself.
    async fn shutdown(&self) -> Result<()>;
}

/// Spec §6's `SandboxFactory.create(initOptions) -> SandboxInstance`. Unlike
/// `LanguageModelClient`, the core ships a concrete implementation
/// ([`ProcessSandboxFactory`]) since the sandbox worker/host protocol is
/// itself core, in-scope machinery (spec §4.2/§4.3) rather than an external
/// collaborator — only the *acquisition* of a handle is abstracted, so the
/// scheduler can be driven in tests against a fake without a subprocess.
#[async_trait]
pub trait SandboxFactory: Send + Sync {
    async fn create(
        &self,
        call_id: CallId,
        depth: u32,
        bridge_tx: mpsc::UnboundedSender<BridgeCallEnvelope>,
    ) -> Result<Arc<dyn SandboxHandle>>;
}

/// The real [`SandboxFactory`], spawning the `sandbox-worker` subprocess.
pub struct ProcessSandboxFactory {
    pub config: SandboxConfig,
}

#[async_trait]
impl SandboxFactory for ProcessSandboxFactory {
    async fn create(
        &self,
        call_id: CallId,
        depth: u32,
        bridge_tx: mpsc::UnboundedSender<BridgeCallEnvelope>,
    ) -> Result<Arc<dyn SandboxHandle>> {
        let instance = SandboxInstance::spawn(&self.config, call_id, depth, bridge_tx).await?;
        Ok(Arc::new(instance))
    }
}

/// A bridge call forwarded from the sandbox worker to the scheduler. The
/// scheduler is expected to eventually call back into
/// [`SandboxInstance::deliver_bridge_result`]/`deliver_bridge_failure`.
#[derive(Debug, Clone)]
pub struct BridgeCallEnvelope {
    pub call_id: CallId,
    pub bridge_request_id: String,
    pub method: String,
    pub args: Vec<Value>,
}

/// Configuration for spawning a sandbox worker subprocess.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub worker_path: String,
    pub max_frame_bytes: u64,
    pub sandbox_mode: crate::config::SandboxMode,
    pub tools: Vec<String>,
    pub shutdown_grace: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            worker_path: "sandbox-worker".to_string(),
            max_frame_bytes: 4 * 1024 * 1024,
            sandbox_mode: crate::config::SandboxMode::Permissive,
            tools: Vec::new(),
            shutdown_grace: Duration::from_millis(2_000),
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<WorkerToHost>>>>;

/// Demultiplex response frames from forwarded `BridgeCall` frames until
/// the worker exits or the frame stream breaks. Free function (rather than
/// inlined in `spawn`'s `tokio::spawn` closure) so it can be driven
/// directly against an in-memory pipe in tests, not just a real
/// subprocess.
async fn run_reader_loop<R: AsyncRead + Unpin>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    bridge_tx: mpsc::UnboundedSender<BridgeCallEnvelope>,
    call_id: CallId,
    max_frame_bytes: u64,
) {
    loop {
        let frame: Result<Option<WorkerToHost>> = read_frame_async(&mut reader, max_frame_bytes).await;
        match frame {
            Ok(Some(WorkerToHost::Ready)) => continue,
            Ok(Some(WorkerToHost::BridgeCall { request_id, method, args })) => {
                let _ = bridge_tx.send(BridgeCallEnvelope {
                    call_id: call_id.clone(),
                    bridge_request_id: request_id,
                    method,
                    args,
                });
            }
            Ok(Some(other)) => {
                if let Some(id) = other.request_id() {
                    if let Some(tx) = pending.lock().await.remove(&id) {
                        let _ = tx.send(other);
                    }
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    // Worker exited or the frame stream broke; any request still waiting
    // on a reply would otherwise hang forever on its oneshot. Dropping
    // every pending sender here fails each of them with `RecvError`,
    // which `request()` maps to "worker disconnected before replying"
    // (spec §4.3 "On worker exit or disconnect, all pending requests are
    // failed").
    pending.lock().await.clear();
}

/// A running sandbox worker subprocess, owned by exactly one `CallContext`
/// (spec §3 entity `SandboxInstance`).
pub struct SandboxInstance {
    child: Mutex<Child>,
    stdin: Arc<Mutex<ChildStdin>>,
    request_ids: RequestIdAllocator,
    pending: PendingMap,
    reader_task: tokio::task::JoinHandle<()>,
    max_frame_bytes: u64,
    shutdown_grace: Duration,
    call_id: CallId,
}

impl SandboxInstance {
    /// Spawn a worker subprocess, send `Init`, and wire up the reader task
    /// that demultiplexes response frames from forwarded `BridgeCall`
    /// frames.
    pub async fn spawn(
        config: &SandboxConfig,
        call_id: CallId,
        depth: u32,
        bridge_tx: mpsc::UnboundedSender<BridgeCallEnvelope>,
    ) -> Result<Self> {
        let mut cmd = Command::new(&config.worker_path);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::subprocess_comm(format!("failed to spawn sandbox worker: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::subprocess_comm("failed to get worker stdin handle"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::subprocess_comm("failed to get worker stdout handle"))?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader_task = {
            let pending = Arc::clone(&pending);
            let max_frame_bytes = config.max_frame_bytes;
            let bridge_tx = bridge_tx.clone();
            let call_id = call_id.clone();
            tokio::spawn(async move {
                run_reader_loop(BufReader::new(stdout), pending, bridge_tx, call_id, max_frame_bytes).await;
            })
        };

        let instance = Self {
            child: Mutex::new(child),
            stdin: Arc::new(Mutex::new(stdin)),
            request_ids: RequestIdAllocator::new(),
            pending,
            reader_task,
            max_frame_bytes: config.max_frame_bytes,
            shutdown_grace: config.shutdown_grace,
            call_id,
        };

        instance
            .send(&HostToWorker::Init {
                call_id: instance.call_id.to_string(),
                depth,
                sandbox_mode: match config.sandbox_mode {
                    crate::config::SandboxMode::Permissive => "permissive".to_string(),
                    crate::config::SandboxMode::Strict => "strict".to_string(),
                },
                max_frame_bytes: config.max_frame_bytes,
                tools: config.tools.clone(),
            })
            .await?;

        Ok(instance)
    }

    async fn send(&self, message: &HostToWorker) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        write_frame_async(&mut *stdin, message, self.max_frame_bytes).await?;
        Ok(())
    }

    async fn request(&self, request_id: u64, message: HostToWorker) -> Result<WorkerToHost> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);
        self.send(&message).await?;
        rx.await
            .map_err(|_| Error::subprocess_comm("worker disconnected before replying"))
    }

    /// Execute code in the sandbox. May suspend indefinitely while the
    /// executing code's bridge calls are serviced by the scheduler.
    pub async fn execute(&self, code: &str) -> Result<String> {
        let request_id = self.request_ids.next();
        let reply = self
            .request(request_id, HostToWorker::ExecRequest { request_id, code: code.to_string() })
            .await?;
        match reply {
            WorkerToHost::ExecResult { output, .. } => Ok(output),
            WorkerToHost::ExecError { message, .. } => Err(Error::sandbox(message)),
            other => Err(Error::subprocess_comm(format!("unexpected reply to ExecRequest: {other:?}"))),
        }
    }

    pub async fn set_variable(&self, name: &str, value: Value) -> Result<()> {
        let request_id = self.request_ids.next();
        let reply = self
            .request(
                request_id,
                HostToWorker::SetVar { request_id, name: name.to_string(), value },
            )
            .await?;
        match reply {
            WorkerToHost::SetVarAck { .. } => Ok(()),
            WorkerToHost::SetVarError { message, .. } => Err(Error::sandbox(message)),
            other => Err(Error::subprocess_comm(format!("unexpected reply to SetVar: {other:?}"))),
        }
    }

    pub async fn get_variable(&self, name: &str) -> Result<Value> {
        let request_id = self.request_ids.next();
        let reply = self
            .request(request_id, HostToWorker::GetVarRequest { request_id, name: name.to_string() })
            .await?;
        match reply {
            WorkerToHost::GetVarResult { value, .. } => Ok(value),
            other => Err(Error::subprocess_comm(format!("unexpected reply to GetVarRequest: {other:?}"))),
        }
    }

    pub async fn list_variables(&self) -> Result<Vec<VariableInfo>> {
        let request_id = self.request_ids.next();
        let reply = self
            .request(request_id, HostToWorker::ListVarsRequest { request_id })
            .await?;
        match reply {
            WorkerToHost::ListVarsResult { variables, .. } => Ok(variables),
            other => Err(Error::subprocess_comm(format!("unexpected reply to ListVarsRequest: {other:?}"))),
        }
    }

    /// Deliver a successful bridge resolution down to the worker.
    pub async fn deliver_bridge_result(&self, bridge_request_id: &str, result: Value) -> Result<()> {
        self.send(&HostToWorker::BridgeResult {
            request_id: bridge_request_id.to_string(),
            result,
        })
        .await
    }

    /// Deliver a bridge failure down to the worker.
    pub async fn deliver_bridge_failure(&self, bridge_request_id: &str, message: String) -> Result<()> {
        self.send(&HostToWorker::BridgeFailed {
            request_id: bridge_request_id.to_string(),
            message,
        })
        .await
    }

    /// Send `Shutdown` and wait up to the configured grace period before
    /// hard-killing the subprocess (spec §4.3). Idempotent: a second call
    /// re-sends `Shutdown` to an already-exited child, which is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        let _ = self.send(&HostToWorker::Shutdown).await;
        let mut child = self.child.lock().await;
        if timeout(self.shutdown_grace, child.wait()).await.is_err() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.reader_task.abort();
        Ok(())
    }
}

#[async_trait]
impl SandboxHandle for SandboxInstance {
    async fn execute(&self, code: &str) -> Result<String> {
        SandboxInstance::execute(self, code).await
    }

    async fn set_variable(&self, name: &str, value: Value) -> Result<()> {
        SandboxInstance::set_variable(self, name, value).await
    }

    async fn get_variable(&self, name: &str) -> Result<Value> {
        SandboxInstance::get_variable(self, name).await
    }

    async fn list_variables(&self) -> Result<Vec<VariableInfo>> {
        SandboxInstance::list_variables(self).await
    }

    async fn deliver_bridge_result(&self, bridge_request_id: &str, result: Value) -> Result<()> {
        SandboxInstance::deliver_bridge_result(self, bridge_request_id, result).await
    }

    async fn deliver_bridge_failure(&self, bridge_request_id: &str, message: String) -> Result<()> {
        SandboxInstance::deliver_bridge_failure(self, bridge_request_id, message).await
    }

    async fn shutdown(&self) -> Result<()> {
        SandboxInstance::shutdown(self).await
    }
}
