//! Supervision of the child debugger server.
//!
//! [`DebuggerController`] owns exactly one debugger server at a time. It launches the
//! server through a [`Launcher`], waits until the server registers itself, relays
//! server callbacks to a [`SessionFrontend`] and tears the server down, politely
//! first and by force if it doesn't listen.

mod launcher;

use crate::config::ControllerConfig;
use crate::error::Error;
use crate::server::{
    BreakEventHandle, ControllerCallbacks, DebuggerServer, StartInfo, TargetEvent,
};
use crate::utils::ManualResetEvent;
use crate::{rd_debug, rd_info, rd_warn, weak_error};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread;
use std::time::{Duration, Instant};

pub use launcher::{InProcessLauncher, LaunchRequest, Launcher, ProcessLauncher, ServerProcess};

/// Receiver of everything the debugger server reports, implemented by a front end.
pub trait SessionFrontend: Send + Sync {
    fn on_started(&self) {}

    fn on_target_event(&self, _event: &TargetEvent) {}

    fn on_target_output(&self, _is_stderr: bool, _line: &str) {}

    fn on_debugger_output(&self, _is_stderr: bool, _line: &str) {}

    /// Return `true` if the target should stop at the break event.
    fn on_custom_breakpoint_action(&self, _action_id: &str, _handle: BreakEventHandle) -> bool {
        true
    }

    fn on_breakpoint_update(
        &self,
        _handle: BreakEventHandle,
        _hit_count: i32,
        _last_trace: Option<&str>,
    ) {
    }

    fn on_source_files_loaded(&self, _files: &[String]) {}

    fn on_source_files_unloaded(&self, _files: &[String]) {}
}

/// Why the last debugger server went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ExitReason {
    /// Stopped on request.
    Requested,
    /// Died on its own.
    ProcessDied,
}

/// Process and server reference, always changed together.
#[derive(Default)]
struct ServerState {
    process: Option<Box<dyn ServerProcess>>,
    server: Option<Arc<dyn DebuggerServer>>,
    /// Id of the most recently launched process.
    last_launched: Option<u32>,
    exit_reason: Option<ExitReason>,
}

struct Inner {
    config: ControllerConfig,
    frontend: Arc<dyn SessionFrontend>,
    launcher: Arc<dyn Launcher>,
    state: Mutex<ServerState>,
    /// Serializes launches.
    launch_lock: Mutex<()>,
    /// Set when the server registers itself.
    running: ManualResetEvent,
    /// Set when the server should exit, releases `WaitForExit`.
    exit_request: Arc<ManualResetEvent>,
    /// Set when the server process is gone.
    exited: ManualResetEvent,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.exit_request.set();
        let process = self.state.get_mut().ok().and_then(|s| s.process.take());
        if let Some(process) = process {
            weak_error!(process.kill(), "kill abandoned debugger server:");
        }
    }
}

/// Launches and supervises the debugger server of a session.
#[derive(Clone)]
pub struct DebuggerController {
    inner: Arc<Inner>,
}

impl DebuggerController {
    const LAUNCH_POLL: Duration = Duration::from_millis(100);

    pub fn new(
        config: ControllerConfig,
        frontend: Arc<dyn SessionFrontend>,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                frontend,
                launcher,
                state: Mutex::default(),
                launch_lock: Mutex::default(),
                running: ManualResetEvent::new(),
                exit_request: Arc::new(ManualResetEvent::new()),
                exited: ManualResetEvent::new(),
            }),
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle(Arc::downgrade(&self.inner))
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.inner.state.lock().unwrap()
    }

    /// Currently registered debugger server.
    pub fn server(&self) -> Option<Arc<dyn DebuggerServer>> {
        self.state().server.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state().server.is_some()
    }

    pub fn last_exit_reason(&self) -> Option<ExitReason> {
        self.state().exit_reason
    }

    /// Id of the most recently launched server process.
    pub fn last_launched(&self) -> Option<u32> {
        self.state().last_launched
    }

    /// Launch a debugger server and wait until it registers itself.
    /// A server that is already running is reused.
    pub fn start_debugger(&self, start_info: &StartInfo) -> Result<Arc<dyn DebuggerServer>, Error> {
        let _launch = self.inner.launch_lock.lock().unwrap();
        if let Some(server) = self.server() {
            return Ok(server);
        }

        self.inner.running.reset();
        self.inner.exit_request.reset();
        self.inner.exited.reset();

        // the process is known before it gets a chance to register or die
        let pid = {
            let mut state = self.state();
            let process = self.inner.launcher.launch(LaunchRequest {
                start_info: start_info.clone(),
                config: self.inner.config.clone(),
                controller: self.handle(),
            })?;
            let pid = process.id();
            state.process = Some(process);
            state.last_launched = Some(pid);
            state.exit_reason = None;
            pid
        };
        rd_info!(target: "controller", "debugger server launched, pid {pid}");

        let timeout = self.inner.config.launch_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            let slice = Self::LAUNCH_POLL.min(deadline.saturating_duration_since(now));
            if self.inner.running.wait_timeout(slice) {
                break;
            }
            if self.inner.exited.is_set() {
                rd_warn!(target: "controller", "debugger server {pid} died during launch");
                return Err(Error::ProcessDiedUnexpectedly);
            }
            if Instant::now() >= deadline {
                rd_warn!(target: "controller", "debugger server {pid} didn't register in {timeout:?}");
                let process = {
                    let mut state = self.state();
                    state.server = None;
                    state.exit_reason = Some(ExitReason::Requested);
                    state.process.take()
                };
                self.inner.exit_request.set();
                if let Some(process) = process {
                    weak_error!(process.kill(), "kill debugger server:");
                }
                return Err(Error::LaunchTimeout(timeout));
            }
        }

        self.server().ok_or(Error::ProcessDiedUnexpectedly)
    }

    /// Called by a debugger server that is ready to take requests.
    pub fn register_debugger(&self, server: Arc<dyn DebuggerServer>) {
        let mut state = self.state();
        if state.process.is_none() {
            rd_warn!(target: "controller", "registration of a debugger server that is not supervised, ignored");
            return;
        }
        state.server = Some(server);
        self.inner.running.set();
        rd_debug!(target: "controller", "debugger server registered");
    }

    /// Ask the server to exit and wait for it, kill it if it takes too long.
    /// Safe to call any number of times.
    pub fn stop_debugger(&self) -> Result<(), Error> {
        let process = {
            let mut state = self.state();
            let process = state.process.take();
            state.server = None;
            if process.is_some() {
                state.exit_reason = Some(ExitReason::Requested);
            }
            process
        };
        self.inner.exit_request.set();

        let Some(process) = process else {
            return Ok(());
        };

        let timeout = self.inner.config.stop_timeout();
        if !self.inner.exited.wait_timeout(timeout) {
            rd_warn!(target: "controller", "debugger server {} didn't exit in {timeout:?}, killing it", process.id());
            process.kill()?;
        }
        rd_info!(target: "controller", "debugger server {} stopped", process.id());
        Ok(())
    }

    /// Cooperative shutdown of the server and its target. Escalates to
    /// [`DebuggerController::stop_debugger`] and reports the target as exited if the
    /// server doesn't make it in time.
    pub fn exit(&self) -> Result<(), Error> {
        let Some(server) = self.server() else {
            return self.stop_debugger();
        };

        thread::Builder::new()
            .name("rdbg-exit".to_string())
            .spawn(move || weak_error!(server.exit(), "request exit:"))?;

        let timeout = self.inner.config.exit_timeout();
        if self.inner.exited.wait_timeout(timeout) {
            return self.stop_debugger();
        }

        rd_warn!(target: "controller", "debugger server didn't exit in {timeout:?}, stopping it");
        self.stop_debugger()?;
        let mut event = TargetEvent::exited(None);
        event.message = Some("debugger server was stopped".to_string());
        self.inner.frontend.on_target_event(&event);
        Ok(())
    }

    /// Called when the process with `id` is gone, whatever the reason.
    pub fn process_exited(&self, id: u32) {
        let died = {
            let mut state = self.state();
            if state.last_launched != Some(id) {
                rd_debug!(target: "controller", "outdated debugger server {id} exited");
                return;
            }
            let died = state.process.as_ref().map(|p| p.id()) == Some(id);
            if died {
                state.process = None;
                state.server = None;
                state.exit_reason = Some(ExitReason::ProcessDied);
            }
            died
        };
        self.inner.exited.set();

        if died {
            rd_warn!(target: "controller", "debugger server {id} died unexpectedly");
            let mut event = TargetEvent::exited(None);
            event.message = Some(Error::ProcessDiedUnexpectedly.to_string());
            self.inner.frontend.on_target_event(&event);
        } else {
            rd_debug!(target: "controller", "debugger server {id} exited");
        }
    }

    /// Relay a line printed by the server process.
    pub fn debugger_output(&self, is_stderr: bool, line: &str) {
        self.inner.frontend.on_debugger_output(is_stderr, line);
    }
}

impl ControllerCallbacks for DebuggerController {
    fn wait_for_exit(&self) -> Result<(), Error> {
        self.inner.exit_request.wait();
        Ok(())
    }

    fn notify_started(&self) -> Result<(), Error> {
        self.inner.frontend.on_started();
        Ok(())
    }

    fn on_target_event(&self, event: &TargetEvent) -> Result<(), Error> {
        self.inner.frontend.on_target_event(event);
        if event.is_exit() {
            // the server has nothing left to do, don't hold up event delivery while it goes
            let controller = self.clone();
            thread::Builder::new()
                .name("rdbg-teardown".to_string())
                .spawn(move || weak_error!(controller.stop_debugger(), "stop debugger server:"))?;
        }
        Ok(())
    }

    fn on_target_output(&self, is_stderr: bool, line: &str) -> Result<(), Error> {
        self.inner.frontend.on_target_output(is_stderr, line);
        Ok(())
    }

    fn on_debugger_output(&self, is_stderr: bool, line: &str) -> Result<(), Error> {
        self.inner.frontend.on_debugger_output(is_stderr, line);
        Ok(())
    }

    fn on_custom_breakpoint_action(
        &self,
        action_id: &str,
        handle: BreakEventHandle,
    ) -> Result<bool, Error> {
        Ok(self
            .inner
            .frontend
            .on_custom_breakpoint_action(action_id, handle))
    }

    fn update_breakpoint(
        &self,
        handle: BreakEventHandle,
        hit_count: i32,
        last_trace: Option<&str>,
    ) -> Result<(), Error> {
        self.inner
            .frontend
            .on_breakpoint_update(handle, hit_count, last_trace);
        Ok(())
    }

    fn notify_source_file_loaded(&self, files: &[String]) -> Result<(), Error> {
        self.inner.frontend.on_source_files_loaded(files);
        Ok(())
    }

    fn notify_source_file_unloaded(&self, files: &[String]) -> Result<(), Error> {
        self.inner.frontend.on_source_files_unloaded(files);
        Ok(())
    }
}

/// Weak reference to a [`DebuggerController`] held by whatever serves the
/// debugger server side, so a forgotten controller is not kept alive by its server.
#[derive(Clone)]
pub struct ControllerHandle(Weak<Inner>);

impl ControllerHandle {
    pub fn upgrade(&self) -> Option<DebuggerController> {
        self.0.upgrade().map(|inner| DebuggerController { inner })
    }

    fn controller(&self) -> Result<DebuggerController, Error> {
        self.upgrade().ok_or(Error::Disconnected)
    }

    pub fn register_debugger(&self, server: Arc<dyn DebuggerServer>) -> Result<(), Error> {
        self.controller()?.register_debugger(server);
        Ok(())
    }

    pub fn process_exited(&self, id: u32) {
        if let Some(controller) = self.upgrade() {
            controller.process_exited(id);
        }
    }

    pub fn debugger_output(&self, is_stderr: bool, line: &str) {
        if let Some(controller) = self.upgrade() {
            controller.debugger_output(is_stderr, line);
        }
    }
}

impl ControllerCallbacks for ControllerHandle {
    fn wait_for_exit(&self) -> Result<(), Error> {
        // don't keep the controller alive while waiting
        let exit_request = self.controller()?.inner.exit_request.clone();
        exit_request.wait();
        Ok(())
    }

    fn notify_started(&self) -> Result<(), Error> {
        self.controller()?.notify_started()
    }

    fn on_target_event(&self, event: &TargetEvent) -> Result<(), Error> {
        self.controller()?.on_target_event(event)
    }

    fn on_target_output(&self, is_stderr: bool, line: &str) -> Result<(), Error> {
        self.controller()?.on_target_output(is_stderr, line)
    }

    fn on_debugger_output(&self, is_stderr: bool, line: &str) -> Result<(), Error> {
        self.controller()?.on_debugger_output(is_stderr, line)
    }

    fn on_custom_breakpoint_action(
        &self,
        action_id: &str,
        handle: BreakEventHandle,
    ) -> Result<bool, Error> {
        self.controller()?
            .on_custom_breakpoint_action(action_id, handle)
    }

    fn update_breakpoint(
        &self,
        handle: BreakEventHandle,
        hit_count: i32,
        last_trace: Option<&str>,
    ) -> Result<(), Error> {
        self.controller()?
            .update_breakpoint(handle, hit_count, last_trace)
    }

    fn notify_source_file_loaded(&self, files: &[String]) -> Result<(), Error> {
        self.controller()?.notify_source_file_loaded(files)
    }

    fn notify_source_file_unloaded(&self, files: &[String]) -> Result<(), Error> {
        self.controller()?.notify_source_file_unloaded(files)
    }
}
