//! Messages exchanged over a remoting connection.

use crate::adaptor::ObjectPath;
use crate::error::RemoteFault;
use crate::eval::EvaluationOptions;
use crate::server::{BreakEvent, BreakEventHandle, SessionOptions, StartInfo, TargetEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Envelope of a single frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// First frame of every connection, routes it to the waiting party.
    Hello { token: Uuid },
    Request { id: u64, body: Value },
    Response { id: u64, result: Result<Value, RemoteFault> },
    /// One-way message, the sender does not wait for anything.
    Notification { body: Value },
}

/// Operations of the debugger server, sent by the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerRequest {
    Run {
        start_info: StartInfo,
        options: SessionOptions,
    },
    AttachToProcess {
        pid: i64,
        options: SessionOptions,
    },
    Detach,
    Stop,
    Exit,
    Continue,
    StepLine,
    NextLine,
    StepInstruction,
    NextInstruction,
    Finish,
    InsertBreakEvent {
        event: BreakEvent,
        activate: bool,
    },
    RemoveBreakEvent {
        handle: BreakEventHandle,
    },
    EnableBreakEvent {
        handle: BreakEventHandle,
        enable: bool,
    },
    UpdateBreakEvent {
        handle: BreakEventHandle,
        event: BreakEvent,
    },
    GetThreads {
        pid: i64,
    },
    GetProcesses,
    GetThreadBacktrace {
        pid: i64,
        tid: i64,
    },
    SetActiveThread {
        pid: i64,
        tid: i64,
    },
    DisassembleFile {
        file: String,
    },
    InitializeMdb {
        cached_version: Option<String>,
        controller_pid: u32,
    },
    AllowBreakpointChanges,
    Backtrace {
        id: u64,
        request: BacktraceRequest,
    },
    ReleaseBacktrace {
        id: u64,
    },
}

/// Reference to a backtrace living in the server process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BacktraceRef {
    pub id: u64,
}

/// Operations of a remote backtrace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BacktraceRequest {
    FrameCount,
    GetStackFrames {
        first: usize,
        last: usize,
    },
    GetLocalVariables {
        frame: usize,
        options: EvaluationOptions,
    },
    GetParameters {
        frame: usize,
        options: EvaluationOptions,
    },
    GetThisReference {
        frame: usize,
        options: EvaluationOptions,
    },
    GetExpressionValues {
        frame: usize,
        expressions: Vec<String>,
        options: EvaluationOptions,
    },
    GetChildren {
        path: ObjectPath,
        index: usize,
        count: Option<usize>,
        options: EvaluationOptions,
    },
}

/// Callbacks of the controller, sent by the debugger server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControllerRequest {
    RegisterDebugger,
    WaitForExit,
    NotifyStarted,
    OnTargetEvent {
        event: TargetEvent,
    },
    OnTargetOutput {
        is_stderr: bool,
        line: String,
    },
    OnDebuggerOutput {
        is_stderr: bool,
        line: String,
    },
    OnCustomBreakpointAction {
        action_id: String,
        handle: BreakEventHandle,
    },
    UpdateBreakpoint {
        handle: BreakEventHandle,
        hit_count: i32,
        last_trace: Option<String>,
    },
    NotifySourceFileLoaded {
        files: Vec<String>,
    },
    NotifySourceFileUnloaded {
        files: Vec<String>,
    },
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::FaultCode;

    #[test]
    fn test_request_shape() {
        let body = serde_json::to_value(ServerRequest::RemoveBreakEvent {
            handle: BreakEventHandle(7),
        })
        .unwrap();
        assert_eq!(body["op"], "remove_break_event");
        assert_eq!(body["handle"], 7);

        let body = serde_json::to_value(ServerRequest::Continue).unwrap();
        assert_eq!(body, serde_json::json!({"op": "continue"}));
    }

    #[test]
    fn test_fault_response() {
        let msg = Message::Response {
            id: 3,
            result: Err(RemoteFault {
                code: FaultCode::ChangeNotAllowed,
                message: "nope".to_string(),
            }),
        };
        let raw = serde_json::to_string(&msg).unwrap();
        match serde_json::from_str::<Message>(&raw).unwrap() {
            Message::Response { id, result } => {
                assert_eq!(id, 3);
                assert_eq!(result.unwrap_err().code, FaultCode::ChangeNotAllowed);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
