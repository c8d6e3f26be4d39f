//! Wire format for the sandbox worker IPC (spec §4.2/§6).
//!
//! Frames are length-delimited JSON: a 4-byte big-endian length prefix
//! followed by that many bytes of UTF-8 JSON. Tags and field names here
//! must stay bit-identical between host and worker to interoperate, per
//! spec §6's note on the sandbox IPC interface.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A variable summary as returned by `ListVarsRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub preview: String,
}

/// Messages sent from host to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "tag")]
pub enum HostToWorker {
    Init {
        call_id: String,
        depth: u32,
        sandbox_mode: String,
        max_frame_bytes: u64,
        tools: Vec<String>,
    },
    ExecRequest {
        request_id: u64,
        code: String,
    },
    SetVar {
        request_id: u64,
        name: String,
        value: Value,
    },
    GetVarRequest {
        request_id: u64,
        name: String,
    },
    ListVarsRequest {
        request_id: u64,
    },
    BridgeResult {
        request_id: String,
        result: Value,
    },
    BridgeFailed {
        request_id: String,
        message: String,
    },
    Shutdown,
}

/// Messages sent from worker to host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "tag")]
pub enum WorkerToHost {
    Ready,
    BridgeCall {
        request_id: String,
        method: String,
        args: Vec<Value>,
    },
    ExecResult {
        request_id: u64,
        output: String,
    },
    ExecError {
        request_id: u64,
        message: String,
        stack: Option<String>,
    },
    SetVarAck {
        request_id: u64,
    },
    SetVarError {
        request_id: u64,
        message: String,
    },
    GetVarResult {
        request_id: u64,
        value: Value,
    },
    ListVarsResult {
        request_id: u64,
        variables: Vec<VariableInfo>,
    },
}

impl WorkerToHost {
    /// The `requestId` of host-initiated request/response pairs. `None` for
    /// `Ready` and `BridgeCall`, which are not correlated to a pending
    /// host-side callback (spec §4.3).
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::ExecResult { request_id, .. }
            | Self::ExecError { request_id, .. }
            | Self::SetVarAck { request_id }
            | Self::SetVarError { request_id, .. }
            | Self::GetVarResult { request_id, .. }
            | Self::ListVarsResult { request_id, .. } => Some(*request_id),
            Self::Ready | Self::BridgeCall { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_to_worker_roundtrips_through_json() {
        let msg = HostToWorker::ExecRequest {
            request_id: 7,
            code: "print(1+1)".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: HostToWorker = serde_json::from_str(&json).unwrap();
        match parsed {
            HostToWorker::ExecRequest { request_id, code } => {
                assert_eq!(request_id, 7);
                assert_eq!(code, "print(1+1)");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn worker_to_host_request_id_extraction() {
        let bridge = WorkerToHost::BridgeCall {
            request_id: "bridge-1".into(),
            method: "llm_query".into(),
            args: vec![],
        };
        assert_eq!(bridge.request_id(), None);

        let exec = WorkerToHost::ExecResult {
            request_id: 3,
            output: "ok".into(),
        };
        assert_eq!(exec.request_id(), Some(3));
    }
}
