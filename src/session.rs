//! Debug session state machine.
//!
//! A [`DebuggerSession`] turns front end commands into calls on the supervised
//! debugger server and server events into session state changes:
//!
//! ```text
//! Created -> Starting -> Attached -> Running <-> Stopped -> Exiting -> Terminated
//! ```
//!
//! Execution control returns as soon as the server accepted the command, the outcome
//! arrives later as a [`TargetEvent`]. `TargetExited` is the last event a front end sees.

use crate::backtrace::Backtrace;
use crate::config::Config;
use crate::controller::{DebuggerController, Launcher, SessionFrontend};
use crate::error::Error;
use crate::server::{
    AssemblyLine, BreakEvent, BreakEventHandle, BreakEventId, DebuggerServer, ProcessInfo,
    SessionOptions, StartInfo, TargetEvent, TargetEventKind, ThreadInfo,
};
use crate::{rd_debug, rd_info, rd_warn, weak_error};
use indexmap::IndexMap;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum SessionState {
    Created,
    Starting,
    Attached,
    Running,
    Stopped,
    Exiting,
    Terminated,
}

/// Break event known to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakEventStatus {
    pub event: BreakEvent,
    /// Native handle, `None` until the event reaches a debugger server.
    pub handle: Option<BreakEventHandle>,
    pub enabled: bool,
    pub hit_count: i32,
    pub last_trace: Option<String>,
}

/// Runtime versions by toolchain prefix, shared by all sessions of the process.
/// Entries are plain facts, an overwrite stores the same value again.
static RUNTIME_VERSIONS: Lazy<RwLock<HashMap<String, String>>> = Lazy::new(RwLock::default);

fn runtime_key(start_info: &StartInfo) -> String {
    start_info.runtime_prefix.clone().unwrap_or_default()
}

/// Runtime version detected for a toolchain prefix by some earlier session.
pub fn cached_runtime_version(runtime_prefix: &str) -> Option<String> {
    RUNTIME_VERSIONS
        .read()
        .unwrap()
        .get(runtime_prefix)
        .cloned()
}

struct SessionInner {
    controller: DebuggerController,
    listener: Arc<dyn SessionFrontend>,
    options: SessionOptions,
    state: Mutex<SessionState>,
    state_changed: Condvar,
    break_events: Mutex<IndexMap<BreakEventId, BreakEventStatus>>,
    next_id: AtomicU32,
    runtime_version: Mutex<Option<String>>,
}

impl SessionInner {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap()
    }

    fn set_state(&self, state: SessionState) {
        let mut current = self.state();
        if *current != state {
            rd_debug!(target: "session", "{} -> {state}", *current);
            *current = state;
        }
        self.state_changed.notify_all();
    }

    /// Move to `state` only from one of `from`, otherwise report the current state.
    fn transition(&self, from: &[SessionState], state: SessionState) -> Result<(), SessionState> {
        let mut current = self.state();
        if !from.contains(&current) {
            return Err(*current);
        }
        rd_debug!(target: "session", "{} -> {state}", *current);
        *current = state;
        self.state_changed.notify_all();
        Ok(())
    }

    fn break_event_id(&self, handle: BreakEventHandle) -> Option<BreakEventId> {
        self.break_events
            .lock()
            .unwrap()
            .iter()
            .find(|(_, status)| status.handle == Some(handle))
            .map(|(id, _)| *id)
    }

    fn handle_target_event(&self, event: &TargetEvent) {
        let mut event = event.clone();
        if let Some(handle) = event.break_event {
            event.break_event_id = self.break_event_id(handle);
        }

        {
            let mut state = self.state();
            if *state == SessionState::Terminated {
                rd_debug!(target: "session", "{} after termination dropped", event.kind);
                return;
            }
            let next = match event.kind {
                TargetEventKind::TargetExited => Some(SessionState::Terminated),
                TargetEventKind::ThreadStarted | TargetEventKind::ThreadStopped => None,
                _ => Some(SessionState::Stopped),
            };
            if let Some(next) = next {
                rd_debug!(target: "session", "{} -> {next} on {}", *state, event.kind);
                *state = next;
                self.state_changed.notify_all();
            }
        }

        self.listener.on_target_event(&event);
    }

    fn handle_breakpoint_update(
        &self,
        handle: BreakEventHandle,
        hit_count: i32,
        last_trace: Option<&str>,
    ) {
        {
            let mut events = self.break_events.lock().unwrap();
            let status = events
                .values_mut()
                .find(|status| status.handle == Some(handle));
            match status {
                Some(status) => {
                    if hit_count != -1 {
                        status.hit_count = hit_count;
                    }
                    if let Some(trace) = last_trace {
                        status.last_trace = Some(trace.to_string());
                    }
                }
                None => rd_debug!(target: "session", "update of unknown break event {handle}"),
            }
        }
        self.listener
            .on_breakpoint_update(handle, hit_count, last_trace);
    }
}

/// Receives controller callbacks on behalf of a session.
struct SessionSink(Weak<SessionInner>);

impl SessionFrontend for SessionSink {
    fn on_started(&self) {
        if let Some(inner) = self.0.upgrade() {
            inner.listener.on_started();
        }
    }

    fn on_target_event(&self, event: &TargetEvent) {
        if let Some(inner) = self.0.upgrade() {
            inner.handle_target_event(event);
        }
    }

    fn on_target_output(&self, is_stderr: bool, line: &str) {
        if let Some(inner) = self.0.upgrade() {
            inner.listener.on_target_output(is_stderr, line);
        }
    }

    fn on_debugger_output(&self, is_stderr: bool, line: &str) {
        if let Some(inner) = self.0.upgrade() {
            inner.listener.on_debugger_output(is_stderr, line);
        }
    }

    fn on_custom_breakpoint_action(&self, action_id: &str, handle: BreakEventHandle) -> bool {
        match self.0.upgrade() {
            Some(inner) => inner.listener.on_custom_breakpoint_action(action_id, handle),
            None => true,
        }
    }

    fn on_breakpoint_update(
        &self,
        handle: BreakEventHandle,
        hit_count: i32,
        last_trace: Option<&str>,
    ) {
        if let Some(inner) = self.0.upgrade() {
            inner.handle_breakpoint_update(handle, hit_count, last_trace);
        }
    }

    fn on_source_files_loaded(&self, files: &[String]) {
        if let Some(inner) = self.0.upgrade() {
            inner.listener.on_source_files_loaded(files);
        }
    }

    fn on_source_files_unloaded(&self, files: &[String]) {
        if let Some(inner) = self.0.upgrade() {
            inner.listener.on_source_files_unloaded(files);
        }
    }
}

/// One debug run of one debuggee.
pub struct DebuggerSession {
    inner: Arc<SessionInner>,
}

impl DebuggerSession {
    pub fn new(
        config: &Config,
        launcher: Arc<dyn Launcher>,
        listener: Arc<dyn SessionFrontend>,
    ) -> Self {
        let options = SessionOptions {
            evaluation_options: (&config.evaluation).into(),
        };
        let inner = Arc::new_cyclic(|weak: &Weak<SessionInner>| {
            let sink = Arc::new(SessionSink(weak.clone()));
            SessionInner {
                controller: DebuggerController::new(config.controller.clone(), sink, launcher),
                listener,
                options,
                state: Mutex::new(SessionState::Created),
                state_changed: Condvar::new(),
                break_events: Mutex::default(),
                next_id: AtomicU32::new(1),
                runtime_version: Mutex::default(),
            }
        });
        Self { inner }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state()
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub fn controller(&self) -> &DebuggerController {
        &self.inner.controller
    }

    /// Runtime version reported by the debugger server, known once attached.
    pub fn runtime_version(&self) -> Option<String> {
        self.inner.runtime_version.lock().unwrap().clone()
    }

    /// Block until `predicate` holds for the session state or `timeout` expires.
    /// Return the last observed state and whether the predicate holds for it.
    pub fn wait_until(
        &self,
        timeout: Duration,
        predicate: impl Fn(SessionState) -> bool,
    ) -> (SessionState, bool) {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state();
        loop {
            if predicate(*state) {
                return (*state, true);
            }
            let now = Instant::now();
            if now >= deadline {
                return (*state, false);
            }
            state = self
                .inner
                .state_changed
                .wait_timeout(state, deadline - now)
                .unwrap()
                .0;
        }
    }

    fn server(&self) -> Result<Arc<dyn DebuggerServer>, Error> {
        self.inner.controller.server().ok_or(Error::ServerNotRunning)
    }

    fn expect_state(&self, op: &'static str, expected: &[SessionState]) -> Result<SessionState, Error> {
        let state = self.state();
        if !expected.contains(&state) {
            return Err(Error::InvalidState {
                op,
                state: state.to_string(),
            });
        }
        Ok(state)
    }

    /// Launch a debugger server, initialize the runtime and push pending break events.
    fn attach(&self, op: &'static str, start_info: &StartInfo) -> Result<Arc<dyn DebuggerServer>, Error> {
        {
            let mut state = self.inner.state();
            if *state != SessionState::Created {
                return Err(Error::InvalidState {
                    op,
                    state: state.to_string(),
                });
            }
            *state = SessionState::Starting;
        }

        let server = match self.start_server(start_info) {
            Ok(server) => server,
            Err(e) => {
                rd_warn!(target: "session", "{op} failed: {e}");
                weak_error!(self.inner.controller.stop_debugger(), "stop debugger server:");
                self.inner.set_state(SessionState::Terminated);
                return Err(e);
            }
        };
        // exit may have been requested while the server was starting
        if let Err(state) = self
            .inner
            .transition(&[SessionState::Starting], SessionState::Attached)
        {
            rd_info!(target: "session", "{op} abandoned, session is {state}");
            weak_error!(self.inner.controller.stop_debugger(), "stop debugger server:");
            return Err(Error::InvalidState {
                op,
                state: state.to_string(),
            });
        }
        self.flush_break_events(server.as_ref());
        Ok(server)
    }

    fn start_server(&self, start_info: &StartInfo) -> Result<Arc<dyn DebuggerServer>, Error> {
        let server = self.inner.controller.start_debugger(start_info)?;

        let key = runtime_key(start_info);
        let cached = cached_runtime_version(&key);
        let version = server.initialize_mdb(cached.as_deref(), std::process::id())?;
        if cached.is_none() {
            rd_info!(target: "session", "runtime version {version}");
        }
        RUNTIME_VERSIONS.write().unwrap().insert(key, version.clone());
        *self.inner.runtime_version.lock().unwrap() = Some(version);
        Ok(server)
    }

    /// Send break events inserted before the server was up.
    fn flush_break_events(&self, server: &dyn DebuggerServer) {
        let pending: Vec<_> = self
            .inner
            .break_events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, status)| status.handle.is_none())
            .map(|(id, status)| (*id, status.event.clone(), status.enabled))
            .collect();

        for (id, event, enabled) in pending {
            let Some(handle) = weak_error!(
                server.insert_break_event(&event, enabled),
                "insert pending break event:"
            ) else {
                continue;
            };
            if let Some(status) = self.inner.break_events.lock().unwrap().get_mut(&id) {
                status.handle = Some(handle);
            }
        }
    }

    pub fn run(&self, start_info: &StartInfo) -> Result<(), Error> {
        let server = self.attach("run", start_info)?;
        self.to_running("run")?;
        server.run(start_info, &self.inner.options)
    }

    pub fn attach_to_process(&self, start_info: &StartInfo, pid: i64) -> Result<(), Error> {
        let server = self.attach("attach_to_process", start_info)?;
        self.to_running("attach_to_process")?;
        server.attach_to_process(pid, &self.inner.options)
    }

    fn to_running(&self, op: &'static str) -> Result<(), Error> {
        self.inner
            .transition(&[SessionState::Attached], SessionState::Running)
            .map_err(|state| Error::InvalidState {
                op,
                state: state.to_string(),
            })
    }

    /// Resume a stopped target with one of the execution control operations.
    fn resume(
        &self,
        op: &'static str,
        command: impl FnOnce(&dyn DebuggerServer) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let server = self.server()?;
        {
            let mut state = self.inner.state();
            if *state != SessionState::Stopped {
                return Err(Error::InvalidState {
                    op,
                    state: state.to_string(),
                });
            }
            // events of this very command may arrive before the call returns
            *state = SessionState::Running;
        }

        if let Err(e) = command(server.as_ref()) {
            let mut state = self.inner.state();
            if *state == SessionState::Running {
                *state = SessionState::Stopped;
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn r#continue(&self) -> Result<(), Error> {
        self.resume("continue", |s| s.r#continue())
    }

    pub fn step_line(&self) -> Result<(), Error> {
        self.resume("step_line", |s| s.step_line())
    }

    pub fn next_line(&self) -> Result<(), Error> {
        self.resume("next_line", |s| s.next_line())
    }

    pub fn step_instruction(&self) -> Result<(), Error> {
        self.resume("step_instruction", |s| s.step_instruction())
    }

    pub fn next_instruction(&self) -> Result<(), Error> {
        self.resume("next_instruction", |s| s.next_instruction())
    }

    pub fn finish(&self) -> Result<(), Error> {
        self.resume("finish", |s| s.finish())
    }

    /// Interrupt a running target.
    pub fn stop(&self) -> Result<(), Error> {
        self.expect_state("stop", &[SessionState::Running])?;
        self.server()?.stop()
    }

    pub fn detach(&self) -> Result<(), Error> {
        self.expect_state(
            "detach",
            &[
                SessionState::Attached,
                SessionState::Running,
                SessionState::Stopped,
            ],
        )?;
        self.inner.set_state(SessionState::Exiting);
        if let Ok(server) = self.server() {
            weak_error!(server.detach(), "detach:");
        }
        let result = self.inner.controller.stop_debugger();
        self.inner.set_state(SessionState::Terminated);
        result
    }

    /// Terminate the target and the debugger server. Nothing happens for a terminated session.
    pub fn exit(&self) -> Result<(), Error> {
        {
            let mut state = self.inner.state();
            match *state {
                SessionState::Terminated => return Ok(()),
                SessionState::Created => {
                    *state = SessionState::Terminated;
                    self.inner.state_changed.notify_all();
                    return Ok(());
                }
                _ => *state = SessionState::Exiting,
            }
            self.inner.state_changed.notify_all();
        }
        let result = self.inner.controller.exit();
        self.inner.set_state(SessionState::Terminated);
        result
    }

    /// Server to apply a break event change to, `None` if no server is attached yet.
    fn server_for_change(&self) -> Result<Option<Arc<dyn DebuggerServer>>, Error> {
        let attached = matches!(
            self.state(),
            SessionState::Attached | SessionState::Running | SessionState::Stopped
        );
        let Some(server) = self.inner.controller.server().filter(|_| attached) else {
            return Ok(None);
        };
        if !server.allow_breakpoint_changes()? {
            return Err(Error::ChangeNotAllowed);
        }
        Ok(Some(server))
    }

    pub fn insert_break_event(&self, event: BreakEvent) -> Result<BreakEventId, Error> {
        let handle = match self.server_for_change()? {
            Some(server) => Some(server.insert_break_event(&event, true)?),
            None => None,
        };
        let id = BreakEventId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        rd_debug!(target: "session", "break event {id} at {event}, handle {handle:?}");
        self.inner.break_events.lock().unwrap().insert(
            id,
            BreakEventStatus {
                event,
                handle,
                enabled: true,
                hit_count: 0,
                last_trace: None,
            },
        );
        Ok(id)
    }

    fn status(&self, id: BreakEventId) -> Result<BreakEventStatus, Error> {
        self.break_event(id).ok_or(Error::BreakEventNotFound(id.0))
    }

    pub fn remove_break_event(&self, id: BreakEventId) -> Result<(), Error> {
        let status = self.status(id)?;
        if let (Some(handle), Some(server)) = (status.handle, self.server_for_change()?) {
            server.remove_break_event(handle)?;
        }
        self.inner.break_events.lock().unwrap().shift_remove(&id);
        Ok(())
    }

    pub fn enable_break_event(&self, id: BreakEventId, enable: bool) -> Result<(), Error> {
        let status = self.status(id)?;
        if let (Some(handle), Some(server)) = (status.handle, self.server_for_change()?) {
            server.enable_break_event(handle, enable)?;
        }
        if let Some(status) = self.inner.break_events.lock().unwrap().get_mut(&id) {
            status.enabled = enable;
        }
        Ok(())
    }

    pub fn update_break_event(&self, id: BreakEventId, event: BreakEvent) -> Result<(), Error> {
        let status = self.status(id)?;
        if let (Some(handle), Some(server)) = (status.handle, self.server_for_change()?) {
            server.update_break_event(handle, &event)?;
        }
        if let Some(status) = self.inner.break_events.lock().unwrap().get_mut(&id) {
            status.event = event;
        }
        Ok(())
    }

    pub fn break_event(&self, id: BreakEventId) -> Option<BreakEventStatus> {
        self.inner.break_events.lock().unwrap().get(&id).cloned()
    }

    pub fn break_events(&self) -> Vec<(BreakEventId, BreakEventStatus)> {
        self.inner
            .break_events
            .lock()
            .unwrap()
            .iter()
            .map(|(id, status)| (*id, status.clone()))
            .collect()
    }

    /// Session identity of the break event with a native `handle`.
    pub fn find_break_event(&self, handle: BreakEventHandle) -> Option<BreakEventId> {
        self.inner.break_event_id(handle)
    }

    pub fn get_threads(&self, pid: i64) -> Result<Vec<ThreadInfo>, Error> {
        self.server()?.get_threads(pid)
    }

    pub fn get_processes(&self) -> Result<Vec<ProcessInfo>, Error> {
        self.server()?.get_processes()
    }

    pub fn get_backtrace(&self, pid: i64, tid: i64) -> Result<Arc<dyn Backtrace>, Error> {
        self.server()?.get_thread_backtrace(pid, tid)
    }

    pub fn set_active_thread(&self, pid: i64, tid: i64) -> Result<(), Error> {
        self.server()?.set_active_thread(pid, tid)
    }

    pub fn disassemble_file(&self, file: &str) -> Result<Vec<AssemblyLine>, Error> {
        self.server()?.disassemble_file(file)
    }
}
