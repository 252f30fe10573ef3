use crate::config::ControllerConfig;
use crate::controller::ControllerHandle;
use crate::error::Error;
use crate::remoting::proto::ControllerRequest;
use crate::remoting::{register_channel, Dispatch, Endpoint, ObjRef};
use crate::server::emulator::EmulatedServer;
use crate::server::host::Handshake;
use crate::server::{ControllerCallbacks, RemoteServer, StartInfo};
use crate::utils::ManualResetEvent;
use crate::{rd_debug, rd_info, rd_warn, weak_error};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use uuid::Uuid;

/// File name of the debugger server executable.
pub const SERVER_BIN: &str = "rdbg-server";
const SUPPORT_LIBRARY: &str = "lib/rdbg/librdbg_support.so";

pub struct LaunchRequest {
    pub start_info: StartInfo,
    pub config: ControllerConfig,
    /// Where the launched server registers itself and reports its exit.
    pub controller: ControllerHandle,
}

/// Running debugger server.
pub trait ServerProcess: Send + Sync {
    fn id(&self) -> u32;

    /// Terminate at once. The exit is still reported through
    /// [`ControllerHandle::process_exited`].
    fn kill(&self) -> Result<(), Error>;
}

/// Strategy of bringing a debugger server to life.
pub trait Launcher: Send + Sync {
    /// Start a server, it registers itself later through the request controller handle.
    fn launch(&self, request: LaunchRequest) -> Result<Box<dyn ServerProcess>, Error>;
}

/// Serves [`ControllerRequest`]s coming from a debugger server process.
struct ControllerDispatcher {
    controller: ControllerHandle,
}

impl ControllerDispatcher {
    fn handle(&self, peer: &Endpoint, req: ControllerRequest) -> Result<Value, Error> {
        let controller = &self.controller;
        let reply = match req {
            ControllerRequest::RegisterDebugger => {
                controller.register_debugger(Arc::new(RemoteServer::new(peer.clone())))?;
                Value::Null
            }
            ControllerRequest::WaitForExit => {
                controller.wait_for_exit()?;
                Value::Null
            }
            ControllerRequest::NotifyStarted => {
                controller.notify_started()?;
                Value::Null
            }
            ControllerRequest::OnTargetEvent { event } => {
                controller.on_target_event(&event)?;
                Value::Null
            }
            ControllerRequest::OnTargetOutput { is_stderr, line } => {
                controller.on_target_output(is_stderr, &line)?;
                Value::Null
            }
            ControllerRequest::OnDebuggerOutput { is_stderr, line } => {
                controller.on_debugger_output(is_stderr, &line)?;
                Value::Null
            }
            ControllerRequest::OnCustomBreakpointAction { action_id, handle } => {
                Value::Bool(controller.on_custom_breakpoint_action(&action_id, handle)?)
            }
            ControllerRequest::UpdateBreakpoint {
                handle,
                hit_count,
                last_trace,
            } => {
                controller.update_breakpoint(handle, hit_count, last_trace.as_deref())?;
                Value::Null
            }
            ControllerRequest::NotifySourceFileLoaded { files } => {
                controller.notify_source_file_loaded(&files)?;
                Value::Null
            }
            ControllerRequest::NotifySourceFileUnloaded { files } => {
                controller.notify_source_file_unloaded(&files)?;
                Value::Null
            }
        };
        Ok(reply)
    }
}

impl Dispatch for ControllerDispatcher {
    fn dispatch_request(&self, peer: &Endpoint, body: Value) -> Result<Value, Error> {
        let req: ControllerRequest = serde_json::from_value(body)?;
        rd_debug!(target: "controller", "request {req:?}");
        self.handle(peer, req)
    }

    fn dispatch_notification(&self, peer: &Endpoint, body: Value) {
        let Some(req) = weak_error!(
            serde_json::from_value::<ControllerRequest>(body),
            "malformed notification:"
        ) else {
            return;
        };
        weak_error!(self.handle(peer, req), "controller notification:");
    }

    fn on_disconnect(&self) {
        rd_debug!(target: "controller", "debugger server disconnected");
    }
}

/// Find the debugger server executable: explicit configuration first, then the
/// runtime prefix, then next to the current executable, then `PATH`.
pub fn locate_server(config: &ControllerConfig, start_info: &StartInfo) -> Result<PathBuf, Error> {
    if let Some(path) = &config.server_path {
        if path.exists() {
            return Ok(path.clone());
        }
        return Err(Error::ServerNotFound(path.display().to_string()));
    }

    if let Some(prefix) = &start_info.runtime_prefix {
        let path = Path::new(prefix).join("bin").join(SERVER_BIN);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        // test binaries live one level deeper than the binaries they test
        let sibling = exe
            .ancestors()
            .skip(1)
            .take(2)
            .map(|dir| dir.join(SERVER_BIN))
            .find(|path| path.exists());
        if let Some(path) = sibling {
            return Ok(path);
        }
    }

    which::which(SERVER_BIN).map_err(|_| Error::ServerNotFound(SERVER_BIN.to_string()))
}

fn support_library(start_info: &StartInfo) -> String {
    let prefix = start_info.runtime_prefix.as_deref().unwrap_or("/usr");
    Path::new(prefix).join(SUPPORT_LIBRARY).display().to_string()
}

/// Launches `rdbg-server` as a child process connected over the remoting channel.
#[derive(Default)]
pub struct ProcessLauncher;

struct ChildServer {
    pid: u32,
}

impl ServerProcess for ChildServer {
    fn id(&self) -> u32 {
        self.pid
    }

    fn kill(&self) -> Result<(), Error> {
        match signal::kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(Error::IO(e.into())),
        }
    }
}

fn relay_output(stream: impl Read + Send + 'static, is_stderr: bool, controller: ControllerHandle) {
    let spawned = thread::Builder::new()
        .name("rdbg-relay".to_string())
        .spawn(move || {
            for line in BufReader::new(stream).lines() {
                match line {
                    Ok(line) => controller.debugger_output(is_stderr, &line),
                    Err(_) => break,
                }
            }
        });
    weak_error!(spawned, "spawn output relay:");
}

impl Launcher for ProcessLauncher {
    fn launch(&self, request: LaunchRequest) -> Result<Box<dyn ServerProcess>, Error> {
        let channel = register_channel(request.config.channel)?;
        let path = locate_server(&request.config, &request.start_info)?;

        let token = Uuid::new_v4();
        let handle = request.controller.clone();
        channel.expect(token, move |conn| {
            let dispatcher = Arc::new(ControllerDispatcher { controller: handle });
            weak_error!(Endpoint::accept(conn, dispatcher), "accept debugger server:");
        });

        rd_info!(target: "controller", "spawn {}", path.display());
        let spawned = Command::new(&path)
            .envs(&request.start_info.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                channel.forget(token);
                return Err(e.into());
            }
        };
        let process = ChildServer { pid: child.id() };

        let handshake = Handshake {
            support_library: support_library(&request.start_info),
            channel: channel.kind(),
            controller: ObjRef {
                channel: channel.kind(),
                address: channel.address().to_string(),
                token,
            },
        };
        let written = match child.stdin.take() {
            Some(mut stdin) => handshake.write(&mut stdin),
            None => Err(Error::Handshake("child stdin is not available".to_string())),
        };
        if let Err(e) = written {
            channel.forget(token);
            weak_error!(process.kill(), "kill debugger server:");
            _ = child.wait();
            return Err(e);
        }

        if let Some(stdout) = child.stdout.take() {
            relay_output(stdout, false, request.controller.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            relay_output(stderr, true, request.controller.clone());
        }

        let controller = request.controller;
        let pid = process.pid;
        thread::Builder::new()
            .name("rdbg-monitor".to_string())
            .spawn(move || {
                match child.wait() {
                    Ok(status) => rd_debug!(target: "controller", "debugger server {pid} exited with {status}"),
                    Err(e) => rd_warn!(target: "controller", "wait for debugger server {pid}: {e}"),
                }
                channel.forget(token);
                controller.process_exited(pid);
            })?;

        Ok(Box::new(process))
    }
}

/// Runs the emulated runtime on a thread of the current process, no remoting involved.
#[derive(Default)]
pub struct InProcessLauncher;

static NEXT_IN_PROCESS_ID: AtomicU32 = AtomicU32::new(1);

struct InProcessServer {
    id: u32,
    server: Arc<EmulatedServer>,
    killed: Arc<ManualResetEvent>,
}

impl ServerProcess for InProcessServer {
    fn id(&self) -> u32 {
        self.id
    }

    fn kill(&self) -> Result<(), Error> {
        self.server.shutdown();
        self.killed.set();
        Ok(())
    }
}

impl Launcher for InProcessLauncher {
    fn launch(&self, request: LaunchRequest) -> Result<Box<dyn ServerProcess>, Error> {
        let id = NEXT_IN_PROCESS_ID.fetch_add(1, Ordering::Relaxed);
        let controller = request.controller;
        let server = Arc::new(EmulatedServer::new(Arc::new(controller.clone())));
        let killed = Arc::new(ManualResetEvent::new());

        let (srv, kill_event) = (server.clone(), killed.clone());
        thread::Builder::new()
            .name("rdbg-in-process".to_string())
            .spawn(move || {
                if controller.register_debugger(srv.clone()).is_ok() {
                    // released by an exit request or by kill
                    let waiter = controller.clone();
                    let kill_watch = kill_event.clone();
                    let waiting = thread::Builder::new()
                        .name("rdbg-in-process-wait".to_string())
                        .spawn(move || {
                            _ = waiter.wait_for_exit();
                            kill_watch.set();
                        });
                    if weak_error!(waiting, "spawn exit waiter:").is_some() {
                        kill_event.wait();
                    }
                }
                srv.shutdown();
                controller.process_exited(id);
            })?;

        Ok(Box::new(InProcessServer { id, server, killed }))
    }
}
