//! Proxies that forward capability calls over a remoting [`Endpoint`].

use crate::adaptor::{ObjectPath, ObjectValue};
use crate::backtrace::{Backtrace, StackFrameInfo};
use crate::error::Error;
use crate::eval::EvaluationOptions;
use crate::remoting::proto::{BacktraceRef, BacktraceRequest, ControllerRequest, ServerRequest};
use crate::remoting::Endpoint;
use crate::server::{
    AssemblyLine, BreakEvent, BreakEventHandle, ControllerCallbacks, DebuggerServer,
    ProcessInfo, SessionOptions, StartInfo, TargetEvent, ThreadInfo,
};
use crate::weak_error;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// [`DebuggerServer`] living in another process.
pub struct RemoteServer {
    peer: Endpoint,
}

impl RemoteServer {
    pub fn new(peer: Endpoint) -> Self {
        Self { peer }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.peer
    }

    fn call<T: DeserializeOwned>(&self, req: ServerRequest) -> Result<T, Error> {
        self.peer.call(&req)
    }

    fn notify(&self, req: ServerRequest) -> Result<(), Error> {
        self.peer.notify(&req)
    }
}

impl DebuggerServer for RemoteServer {
    fn run(&self, start_info: &StartInfo, options: &SessionOptions) -> Result<(), Error> {
        self.notify(ServerRequest::Run {
            start_info: start_info.clone(),
            options: options.clone(),
        })
    }

    fn attach_to_process(&self, pid: i64, options: &SessionOptions) -> Result<(), Error> {
        self.notify(ServerRequest::AttachToProcess {
            pid,
            options: options.clone(),
        })
    }

    fn detach(&self) -> Result<(), Error> {
        self.notify(ServerRequest::Detach)
    }

    fn stop(&self) -> Result<(), Error> {
        self.notify(ServerRequest::Stop)
    }

    fn exit(&self) -> Result<(), Error> {
        self.notify(ServerRequest::Exit)
    }

    fn r#continue(&self) -> Result<(), Error> {
        self.notify(ServerRequest::Continue)
    }

    fn step_line(&self) -> Result<(), Error> {
        self.notify(ServerRequest::StepLine)
    }

    fn next_line(&self) -> Result<(), Error> {
        self.notify(ServerRequest::NextLine)
    }

    fn step_instruction(&self) -> Result<(), Error> {
        self.notify(ServerRequest::StepInstruction)
    }

    fn next_instruction(&self) -> Result<(), Error> {
        self.notify(ServerRequest::NextInstruction)
    }

    fn finish(&self) -> Result<(), Error> {
        self.notify(ServerRequest::Finish)
    }

    fn insert_break_event(
        &self,
        event: &BreakEvent,
        activate: bool,
    ) -> Result<BreakEventHandle, Error> {
        self.call(ServerRequest::InsertBreakEvent {
            event: event.clone(),
            activate,
        })
    }

    fn remove_break_event(&self, handle: BreakEventHandle) -> Result<(), Error> {
        self.call(ServerRequest::RemoveBreakEvent { handle })
    }

    fn enable_break_event(&self, handle: BreakEventHandle, enable: bool) -> Result<(), Error> {
        self.call(ServerRequest::EnableBreakEvent { handle, enable })
    }

    fn update_break_event(
        &self,
        handle: BreakEventHandle,
        event: &BreakEvent,
    ) -> Result<(), Error> {
        self.call(ServerRequest::UpdateBreakEvent {
            handle,
            event: event.clone(),
        })
    }

    fn get_threads(&self, pid: i64) -> Result<Vec<ThreadInfo>, Error> {
        self.call(ServerRequest::GetThreads { pid })
    }

    fn get_processes(&self) -> Result<Vec<ProcessInfo>, Error> {
        self.call(ServerRequest::GetProcesses)
    }

    fn get_thread_backtrace(&self, pid: i64, tid: i64) -> Result<Arc<dyn Backtrace>, Error> {
        let bt_ref: BacktraceRef = self.call(ServerRequest::GetThreadBacktrace { pid, tid })?;
        Ok(Arc::new(RemoteBacktrace {
            peer: self.peer.clone(),
            id: bt_ref.id,
        }))
    }

    fn set_active_thread(&self, pid: i64, tid: i64) -> Result<(), Error> {
        self.call(ServerRequest::SetActiveThread { pid, tid })
    }

    fn disassemble_file(&self, file: &str) -> Result<Vec<AssemblyLine>, Error> {
        self.call(ServerRequest::DisassembleFile {
            file: file.to_string(),
        })
    }

    fn initialize_mdb(
        &self,
        cached_version: Option<&str>,
        controller_pid: u32,
    ) -> Result<String, Error> {
        self.call(ServerRequest::InitializeMdb {
            cached_version: cached_version.map(ToString::to_string),
            controller_pid,
        })
    }

    fn allow_breakpoint_changes(&self) -> Result<bool, Error> {
        self.call(ServerRequest::AllowBreakpointChanges)
    }
}

/// [`Backtrace`] kept by the server, released when the proxy is dropped.
pub struct RemoteBacktrace {
    peer: Endpoint,
    id: u64,
}

impl RemoteBacktrace {
    fn call<T: DeserializeOwned>(&self, request: BacktraceRequest) -> Result<T, Error> {
        self.peer.call(&ServerRequest::Backtrace {
            id: self.id,
            request,
        })
    }
}

impl Drop for RemoteBacktrace {
    fn drop(&mut self) {
        if !self.peer.is_closed() {
            weak_error!(
                self.peer.notify(&ServerRequest::ReleaseBacktrace { id: self.id }),
                "release backtrace:"
            );
        }
    }
}

impl Backtrace for RemoteBacktrace {
    fn frame_count(&self) -> Result<usize, Error> {
        self.call(BacktraceRequest::FrameCount)
    }

    fn get_stack_frames(&self, first: usize, last: usize) -> Result<Vec<StackFrameInfo>, Error> {
        self.call(BacktraceRequest::GetStackFrames { first, last })
    }

    fn get_local_variables(
        &self,
        frame: usize,
        options: &EvaluationOptions,
    ) -> Result<Vec<ObjectValue>, Error> {
        self.call(BacktraceRequest::GetLocalVariables {
            frame,
            options: options.clone(),
        })
    }

    fn get_parameters(
        &self,
        frame: usize,
        options: &EvaluationOptions,
    ) -> Result<Vec<ObjectValue>, Error> {
        self.call(BacktraceRequest::GetParameters {
            frame,
            options: options.clone(),
        })
    }

    fn get_this_reference(
        &self,
        frame: usize,
        options: &EvaluationOptions,
    ) -> Result<Option<ObjectValue>, Error> {
        self.call(BacktraceRequest::GetThisReference {
            frame,
            options: options.clone(),
        })
    }

    fn get_expression_values(
        &self,
        frame: usize,
        expressions: &[String],
        options: &EvaluationOptions,
    ) -> Result<Vec<ObjectValue>, Error> {
        self.call(BacktraceRequest::GetExpressionValues {
            frame,
            expressions: expressions.to_vec(),
            options: options.clone(),
        })
    }

    fn get_children(
        &self,
        path: &ObjectPath,
        index: usize,
        count: Option<usize>,
        options: &EvaluationOptions,
    ) -> Result<Vec<ObjectValue>, Error> {
        self.call(BacktraceRequest::GetChildren {
            path: path.clone(),
            index,
            count,
            options: options.clone(),
        })
    }
}

/// [`ControllerCallbacks`] living in another process.
pub struct RemoteController {
    peer: Endpoint,
}

impl RemoteController {
    pub fn new(peer: Endpoint) -> Self {
        Self { peer }
    }

    /// Tell the controller this server is ready to take requests.
    pub fn register_debugger(&self) -> Result<(), Error> {
        self.peer.call(&ControllerRequest::RegisterDebugger)
    }

    fn notify(&self, req: ControllerRequest) -> Result<(), Error> {
        self.peer.notify(&req)
    }
}

impl ControllerCallbacks for RemoteController {
    fn wait_for_exit(&self) -> Result<(), Error> {
        self.peer.call(&ControllerRequest::WaitForExit)
    }

    fn notify_started(&self) -> Result<(), Error> {
        self.notify(ControllerRequest::NotifyStarted)
    }

    fn on_target_event(&self, event: &TargetEvent) -> Result<(), Error> {
        self.notify(ControllerRequest::OnTargetEvent {
            event: event.clone(),
        })
    }

    fn on_target_output(&self, is_stderr: bool, line: &str) -> Result<(), Error> {
        self.notify(ControllerRequest::OnTargetOutput {
            is_stderr,
            line: line.to_string(),
        })
    }

    fn on_debugger_output(&self, is_stderr: bool, line: &str) -> Result<(), Error> {
        self.notify(ControllerRequest::OnDebuggerOutput {
            is_stderr,
            line: line.to_string(),
        })
    }

    fn on_custom_breakpoint_action(
        &self,
        action_id: &str,
        handle: BreakEventHandle,
    ) -> Result<bool, Error> {
        self.peer.call(&ControllerRequest::OnCustomBreakpointAction {
            action_id: action_id.to_string(),
            handle,
        })
    }

    fn update_breakpoint(
        &self,
        handle: BreakEventHandle,
        hit_count: i32,
        last_trace: Option<&str>,
    ) -> Result<(), Error> {
        self.notify(ControllerRequest::UpdateBreakpoint {
            handle,
            hit_count,
            last_trace: last_trace.map(ToString::to_string),
        })
    }

    fn notify_source_file_loaded(&self, files: &[String]) -> Result<(), Error> {
        self.notify(ControllerRequest::NotifySourceFileLoaded {
            files: files.to_vec(),
        })
    }

    fn notify_source_file_unloaded(&self, files: &[String]) -> Result<(), Error> {
        self.notify(ControllerRequest::NotifySourceFileUnloaded {
            files: files.to_vec(),
        })
    }
}
