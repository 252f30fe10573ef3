//! Debugger server side: capability interfaces shared by both processes,
//! their remote proxies, the child process host and the emulated runtime.

pub mod emulator;
pub mod host;
mod remote;

use crate::backtrace::Backtrace;
use crate::error::Error;
use crate::eval::EvaluationOptions;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub use remote::{RemoteBacktrace, RemoteController, RemoteServer};

/// What to debug and how to start it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartInfo {
    pub executable: String,
    pub working_dir: Option<String>,
    pub arguments: Vec<String>,
    pub environment: IndexMap<String, String>,
    /// Toolchain installation prefix, the server binary is looked up under it.
    pub runtime_prefix: Option<String>,
    /// Modules treated as user code.
    pub user_modules: Vec<String>,
}

impl StartInfo {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub evaluation_options: EvaluationOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BreakEventKind {
    Breakpoint { file: String, line: u32 },
    /// Stop when a method with this name is entered.
    FunctionBreakpoint { function: String },
}

/// Breakpoint definition as requested by a front end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakEvent {
    pub kind: BreakEventKind,
    /// Stop only when this expression evaluates to `true`.
    pub condition: Option<String>,
    /// Don't stop, report the value of this template instead.
    pub trace_expression: Option<String>,
    /// Ask the front end whether to stop.
    pub custom_action_id: Option<String>,
}

impl BreakEvent {
    pub fn breakpoint(file: impl Into<String>, line: u32) -> Self {
        Self::new(BreakEventKind::Breakpoint {
            file: file.into(),
            line,
        })
    }

    pub fn function(function: impl Into<String>) -> Self {
        Self::new(BreakEventKind::FunctionBreakpoint {
            function: function.into(),
        })
    }

    fn new(kind: BreakEventKind) -> Self {
        Self {
            kind,
            condition: None,
            trace_expression: None,
            custom_action_id: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn with_trace(mut self, expression: impl Into<String>) -> Self {
        self.trace_expression = Some(expression.into());
        self
    }

    pub fn with_custom_action(mut self, action_id: impl Into<String>) -> Self {
        self.custom_action_id = Some(action_id.into());
        self
    }
}

impl Display for BreakEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            BreakEventKind::Breakpoint { file, line } => write!(f, "{file}:{line}"),
            BreakEventKind::FunctionBreakpoint { function } => write!(f, "{function}()"),
        }
    }
}

/// Native identity of a break event, assigned by the debugger server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BreakEventHandle(pub u32);

impl Display for BreakEventHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Session level identity of a break event, stable across server restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BreakEventId(pub u32);

impl Display for BreakEventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TargetEventKind {
    TargetStopped,
    TargetInterrupted,
    TargetHitBreakpoint,
    TargetExceptionThrown,
    TargetUnhandledException,
    TargetSignaled,
    TargetExited,
    ThreadStarted,
    ThreadStopped,
}

/// Something that happened to the debuggee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetEvent {
    pub kind: TargetEventKind,
    pub process_id: Option<i64>,
    pub thread_id: Option<i64>,
    /// Native handle of the break event that caused a stop.
    pub break_event: Option<BreakEventHandle>,
    /// Filled in by a session before the event reaches a front end.
    pub break_event_id: Option<BreakEventId>,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
}

impl TargetEvent {
    pub fn new(kind: TargetEventKind) -> Self {
        Self {
            kind,
            process_id: None,
            thread_id: None,
            break_event: None,
            break_event_id: None,
            exit_code: None,
            message: None,
        }
    }

    pub fn exited(exit_code: Option<i32>) -> Self {
        Self {
            exit_code,
            ..Self::new(TargetEventKind::TargetExited)
        }
    }

    pub fn is_exit(&self) -> bool {
        self.kind == TargetEventKind::TargetExited
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub process_id: i64,
    pub id: i64,
    pub name: String,
    /// Method the thread is currently in.
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyLine {
    pub address: u64,
    pub code: String,
    pub source_line: u32,
}

/// Operations of a debugger server, called by the controller.
///
/// Execution control methods return as soon as the request is accepted,
/// their outcome arrives later as a [`TargetEvent`].
pub trait DebuggerServer: Send + Sync {
    /// One way: a program that fails to load is reported as a `TargetExited` event.
    fn run(&self, start_info: &StartInfo, options: &SessionOptions) -> Result<(), Error>;
    fn attach_to_process(&self, pid: i64, options: &SessionOptions) -> Result<(), Error>;
    fn detach(&self) -> Result<(), Error>;
    /// Interrupt a running target.
    fn stop(&self) -> Result<(), Error>;
    /// Terminate the target and the server.
    fn exit(&self) -> Result<(), Error>;

    fn r#continue(&self) -> Result<(), Error>;
    fn step_line(&self) -> Result<(), Error>;
    fn next_line(&self) -> Result<(), Error>;
    fn step_instruction(&self) -> Result<(), Error>;
    fn next_instruction(&self) -> Result<(), Error>;
    fn finish(&self) -> Result<(), Error>;

    fn insert_break_event(
        &self,
        event: &BreakEvent,
        activate: bool,
    ) -> Result<BreakEventHandle, Error>;
    fn remove_break_event(&self, handle: BreakEventHandle) -> Result<(), Error>;
    fn enable_break_event(&self, handle: BreakEventHandle, enable: bool) -> Result<(), Error>;
    fn update_break_event(&self, handle: BreakEventHandle, event: &BreakEvent)
        -> Result<(), Error>;

    fn get_threads(&self, pid: i64) -> Result<Vec<ThreadInfo>, Error>;
    fn get_processes(&self) -> Result<Vec<ProcessInfo>, Error>;
    fn get_thread_backtrace(&self, pid: i64, tid: i64) -> Result<Arc<dyn Backtrace>, Error>;
    fn set_active_thread(&self, pid: i64, tid: i64) -> Result<(), Error>;
    fn disassemble_file(&self, file: &str) -> Result<Vec<AssemblyLine>, Error>;

    /// Runtime specific initialization, returns the detected runtime version.
    /// A known `cached_version` lets the server skip the detection.
    fn initialize_mdb(
        &self,
        cached_version: Option<&str>,
        controller_pid: u32,
    ) -> Result<String, Error>;

    /// Whether break events may be changed right now.
    fn allow_breakpoint_changes(&self) -> Result<bool, Error>;
}

/// Callbacks of the controller, called by a debugger server.
pub trait ControllerCallbacks: Send + Sync {
    /// Block until the controller asks the server to go away.
    fn wait_for_exit(&self) -> Result<(), Error>;
    fn notify_started(&self) -> Result<(), Error>;
    fn on_target_event(&self, event: &TargetEvent) -> Result<(), Error>;
    fn on_target_output(&self, is_stderr: bool, line: &str) -> Result<(), Error>;
    fn on_debugger_output(&self, is_stderr: bool, line: &str) -> Result<(), Error>;
    /// Return `true` if the target should stop at the break event.
    fn on_custom_breakpoint_action(
        &self,
        action_id: &str,
        handle: BreakEventHandle,
    ) -> Result<bool, Error>;
    /// `hit_count` of -1 and `last_trace` of `None` mean "unchanged".
    fn update_breakpoint(
        &self,
        handle: BreakEventHandle,
        hit_count: i32,
        last_trace: Option<&str>,
    ) -> Result<(), Error>;
    fn notify_source_file_loaded(&self, files: &[String]) -> Result<(), Error>;
    fn notify_source_file_unloaded(&self, files: &[String]) -> Result<(), Error>;
}
