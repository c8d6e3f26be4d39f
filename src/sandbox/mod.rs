//! Sandbox subsystem: wire protocol (§4.2/§6), the length-delimited frame
//! codec shared by both ends, the async parent-side adapter (§4.3), and the
//! blocking worker-side execution engine that backs `src/bin/sandbox_worker.rs`.

pub mod frame;
pub mod host;
pub mod protocol;
pub mod worker;

pub use host::{
    BridgeCallEnvelope, ProcessSandboxFactory, SandboxConfig, SandboxFactory, SandboxHandle, SandboxInstance,
};
pub use protocol::{HostToWorker, VariableInfo, WorkerToHost};
pub use worker::{BridgeTransport, ExecFailure, WorkerState};
