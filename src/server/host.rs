//! Child process side of the remoting link: consume the bootstrap handshake,
//! call back the controller and serve it with the emulated runtime.

use crate::backtrace::Backtrace;
use crate::error::Error;
use crate::remoting::proto::{BacktraceRef, BacktraceRequest, ServerRequest};
use crate::remoting::{ChannelKind, Dispatch, Endpoint, ObjRef, Stream};
use crate::server::emulator::EmulatedServer;
use crate::server::{ControllerCallbacks, DebuggerServer, RemoteController};
use crate::{rd_debug, rd_info, weak_error};
use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Three lines written by the controller to the child stdin right after spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Location of the debugging support library.
    pub support_library: String,
    pub channel: ChannelKind,
    pub controller: ObjRef,
}

impl Handshake {
    /// Read exactly three lines, nothing after them is consumed.
    pub fn read(input: &mut impl BufRead) -> Result<Self, Error> {
        let mut next_line = |what: &str| -> Result<String, Error> {
            let mut line = String::new();
            if input.read_line(&mut line)? == 0 {
                return Err(Error::Handshake(format!("missing {what} line")));
            }
            Ok(line.trim_end_matches(['\r', '\n']).to_string())
        };

        let support_library = next_line("support library")?;
        let channel = next_line("channel kind")?;
        let channel = ChannelKind::from_str(&channel)
            .map_err(|_| Error::Handshake(format!("unknown channel kind `{channel}`")))?;
        let controller = ObjRef::decode(&next_line("controller reference")?)
            .map_err(|e| Error::Handshake(e.to_string()))?;
        if controller.channel != channel {
            return Err(Error::Handshake(format!(
                "controller is reachable over {}, not {channel}",
                controller.channel
            )));
        }

        Ok(Self {
            support_library,
            channel,
            controller,
        })
    }

    pub fn write(&self, out: &mut impl Write) -> Result<(), Error> {
        writeln!(out, "{}", self.support_library)?;
        writeln!(out, "{}", self.channel)?;
        writeln!(out, "{}", self.controller.encode()?)?;
        out.flush()?;
        Ok(())
    }
}

/// Serves [`ServerRequest`]s with a local [`DebuggerServer`].
#[derive(Default)]
pub struct ServerDispatcher {
    backend: OnceCell<Arc<dyn DebuggerServer>>,
    /// Backtraces handed out to the controller, by id.
    backtraces: Mutex<HashMap<u64, Arc<dyn Backtrace>>>,
    next_backtrace: AtomicU64,
}

fn reply<T: Serialize>(value: T) -> Result<Value, Error> {
    Ok(serde_json::to_value(value)?)
}

impl ServerDispatcher {
    pub fn attach(&self, backend: Arc<dyn DebuggerServer>) -> Result<(), Error> {
        self.backend.set(backend).map_err(|_| Error::InvalidState {
            op: "attach",
            state: "serving".to_string(),
        })
    }

    fn backend(&self) -> Result<&Arc<dyn DebuggerServer>, Error> {
        self.backend.get().ok_or(Error::ServerNotRunning)
    }

    /// Keep a backtrace alive until the controller releases it,
    /// backtraces outdated by a resume are dropped on the way.
    fn keep(&self, backtrace: Arc<dyn Backtrace>) -> u64 {
        let id = self.next_backtrace.fetch_add(1, Ordering::Relaxed) + 1;
        let mut backtraces = self.backtraces.lock().unwrap();
        backtraces.retain(|_, bt| bt.is_valid());
        backtraces.insert(id, backtrace);
        id
    }

    pub fn handle(&self, req: ServerRequest) -> Result<Value, Error> {
        let backend = self.backend()?;
        match req {
            ServerRequest::Run {
                start_info,
                options,
            } => reply(backend.run(&start_info, &options)?),
            ServerRequest::AttachToProcess { pid, options } => {
                reply(backend.attach_to_process(pid, &options)?)
            }
            ServerRequest::Detach => reply(backend.detach()?),
            ServerRequest::Stop => reply(backend.stop()?),
            ServerRequest::Exit => reply(backend.exit()?),
            ServerRequest::Continue => reply(backend.r#continue()?),
            ServerRequest::StepLine => reply(backend.step_line()?),
            ServerRequest::NextLine => reply(backend.next_line()?),
            ServerRequest::StepInstruction => reply(backend.step_instruction()?),
            ServerRequest::NextInstruction => reply(backend.next_instruction()?),
            ServerRequest::Finish => reply(backend.finish()?),
            ServerRequest::InsertBreakEvent { event, activate } => {
                reply(backend.insert_break_event(&event, activate)?)
            }
            ServerRequest::RemoveBreakEvent { handle } => {
                reply(backend.remove_break_event(handle)?)
            }
            ServerRequest::EnableBreakEvent { handle, enable } => {
                reply(backend.enable_break_event(handle, enable)?)
            }
            ServerRequest::UpdateBreakEvent { handle, event } => {
                reply(backend.update_break_event(handle, &event)?)
            }
            ServerRequest::GetThreads { pid } => reply(backend.get_threads(pid)?),
            ServerRequest::GetProcesses => reply(backend.get_processes()?),
            ServerRequest::GetThreadBacktrace { pid, tid } => {
                let backtrace = backend.get_thread_backtrace(pid, tid)?;
                reply(BacktraceRef {
                    id: self.keep(backtrace),
                })
            }
            ServerRequest::SetActiveThread { pid, tid } => {
                reply(backend.set_active_thread(pid, tid)?)
            }
            ServerRequest::DisassembleFile { file } => reply(backend.disassemble_file(&file)?),
            ServerRequest::InitializeMdb {
                cached_version,
                controller_pid,
            } => reply(backend.initialize_mdb(cached_version.as_deref(), controller_pid)?),
            ServerRequest::AllowBreakpointChanges => reply(backend.allow_breakpoint_changes()?),
            ServerRequest::Backtrace { id, request } => self.serve_backtrace(id, request),
            ServerRequest::ReleaseBacktrace { id } => {
                self.backtraces.lock().unwrap().remove(&id);
                reply(())
            }
        }
    }

    fn serve_backtrace(&self, id: u64, request: BacktraceRequest) -> Result<Value, Error> {
        let backtrace = self
            .backtraces
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::BacktraceNotFound(id))?;

        match request {
            BacktraceRequest::FrameCount => reply(backtrace.frame_count()?),
            BacktraceRequest::GetStackFrames { first, last } => {
                reply(backtrace.get_stack_frames(first, last)?)
            }
            BacktraceRequest::GetLocalVariables { frame, options } => {
                reply(backtrace.get_local_variables(frame, &options)?)
            }
            BacktraceRequest::GetParameters { frame, options } => {
                reply(backtrace.get_parameters(frame, &options)?)
            }
            BacktraceRequest::GetThisReference { frame, options } => {
                reply(backtrace.get_this_reference(frame, &options)?)
            }
            BacktraceRequest::GetExpressionValues {
                frame,
                expressions,
                options,
            } => reply(backtrace.get_expression_values(frame, &expressions, &options)?),
            BacktraceRequest::GetChildren {
                path,
                index,
                count,
                options,
            } => reply(backtrace.get_children(&path, index, count, &options)?),
        }
    }
}

impl Dispatch for ServerDispatcher {
    fn dispatch_request(&self, _: &Endpoint, body: Value) -> Result<Value, Error> {
        let req: ServerRequest = serde_json::from_value(body)?;
        rd_debug!(target: "server", "request {req:?}");
        self.handle(req)
    }

    fn dispatch_notification(&self, _: &Endpoint, body: Value) {
        let Some(req) = weak_error!(
            serde_json::from_value::<ServerRequest>(body),
            "malformed notification:"
        ) else {
            return;
        };
        rd_debug!(target: "server", "notification {req:?}");
        weak_error!(self.handle(req), "server notification:");
    }

    fn on_disconnect(&self) {
        rd_info!(target: "server", "controller disconnected");
        if let Some(backend) = self.backend.get() {
            weak_error!(backend.exit(), "exit after disconnect:");
        }
    }
}

/// Connect to the controller named by the handshake and serve it until it lets us go.
pub fn serve(handshake: &Handshake) -> Result<(), Error> {
    let obj_ref = &handshake.controller;
    rd_info!(
        target: "server",
        "connect to controller at {} over {}, support library {}",
        obj_ref.address,
        obj_ref.channel,
        handshake.support_library
    );

    let stream = Stream::connect(obj_ref.channel, &obj_ref.address)?;
    let dispatcher = Arc::new(ServerDispatcher::default());
    let peer = Endpoint::connect(stream, obj_ref.token, dispatcher.clone())?;
    let controller = Arc::new(RemoteController::new(peer.clone()));
    let server = Arc::new(EmulatedServer::new(controller.clone()));
    dispatcher.attach(server.clone())?;

    controller.register_debugger()?;
    let result = match controller.wait_for_exit() {
        Ok(()) | Err(Error::Disconnected) => Ok(()),
        Err(e) => Err(e),
    };

    rd_info!(target: "server", "shutting down");
    server.shutdown();
    peer.close();
    result
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server::emulator::Script;
    use crate::server::{
        BreakEvent, BreakEventHandle, ControllerCallbacks, SessionOptions, TargetEvent,
        TargetEventKind,
    };
    use std::io::Cursor;
    use std::sync::mpsc::{channel, Sender};
    use std::time::Duration;
    use uuid::Uuid;

    fn obj_ref(channel: ChannelKind) -> ObjRef {
        ObjRef {
            channel,
            address: "127.0.0.1:4711".to_string(),
            token: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_handshake_lines() {
        let handshake = Handshake {
            support_library: "/opt/runtime/lib/debugger-agent.so".to_string(),
            channel: ChannelKind::Tcp,
            controller: obj_ref(ChannelKind::Tcp),
        };
        let mut buf = vec![];
        handshake.write(&mut buf).unwrap();
        assert_eq!(String::from_utf8_lossy(&buf).lines().count(), 3);

        // anything after the third line stays unread
        buf.extend_from_slice(b"trailing\n");
        let mut input = Cursor::new(buf);
        assert_eq!(Handshake::read(&mut input).unwrap(), handshake);
        let mut rest = String::new();
        input.read_line(&mut rest).unwrap();
        assert_eq!(rest, "trailing\n");
    }

    #[test]
    fn test_broken_handshake() {
        let controller = obj_ref(ChannelKind::Unix).encode().unwrap();

        struct TestCase {
            input: String,
            reason: &'static str,
        }
        let cases = [
            TestCase {
                input: "lib\ntcp\n".to_string(),
                reason: "missing controller reference line",
            },
            TestCase {
                input: format!("lib\npipe\n{controller}\n"),
                reason: "unknown channel kind `pipe`",
            },
            TestCase {
                input: format!("lib\ntcp\n{controller}\n"),
                reason: "controller is reachable over unix, not tcp",
            },
        ];

        for case in cases {
            match Handshake::read(&mut Cursor::new(case.input)) {
                Err(Error::Handshake(reason)) => assert_eq!(reason, case.reason),
                other => panic!("unexpected result {other:?}"),
            }
        }

        assert!(matches!(
            Handshake::read(&mut Cursor::new("lib\ntcp\nnot base64!\n")),
            Err(Error::Handshake(_))
        ));
    }

    struct Events(Mutex<Sender<TargetEventKind>>);

    impl ControllerCallbacks for Events {
        fn wait_for_exit(&self) -> Result<(), Error> {
            Ok(())
        }
        fn notify_started(&self) -> Result<(), Error> {
            Ok(())
        }
        fn on_target_event(&self, event: &TargetEvent) -> Result<(), Error> {
            _ = self.0.lock().unwrap().send(event.kind);
            Ok(())
        }
        fn on_target_output(&self, _: bool, _: &str) -> Result<(), Error> {
            Ok(())
        }
        fn on_debugger_output(&self, _: bool, _: &str) -> Result<(), Error> {
            Ok(())
        }
        fn on_custom_breakpoint_action(&self, _: &str, _: BreakEventHandle) -> Result<bool, Error> {
            Ok(true)
        }
        fn update_breakpoint(&self, _: BreakEventHandle, _: i32, _: Option<&str>) -> Result<(), Error> {
            Ok(())
        }
        fn notify_source_file_loaded(&self, _: &[String]) -> Result<(), Error> {
            Ok(())
        }
        fn notify_source_file_unloaded(&self, _: &[String]) -> Result<(), Error> {
            Ok(())
        }
    }

    #[test]
    fn test_dispatch_requests() {
        let dispatcher = ServerDispatcher::default();
        assert!(matches!(
            dispatcher.handle(ServerRequest::GetProcesses),
            Err(Error::ServerNotRunning)
        ));

        let (tx, rx) = channel();
        let server = Arc::new(EmulatedServer::new(Arc::new(Events(Mutex::new(tx)))));
        dispatcher.attach(server.clone()).unwrap();

        let handle = dispatcher
            .handle(ServerRequest::InsertBreakEvent {
                event: BreakEvent::breakpoint("app.cs", 2),
                activate: true,
            })
            .unwrap();
        assert_eq!(handle, serde_json::json!(1));

        let script = Script::parse(
            r#"
file = "app.cs"
[[statements]]
line = 1
set = { answer = 42 }
[[statements]]
line = 2
"#,
        )
        .unwrap();
        server
            .runtime()
            .start(script, &SessionOptions::default())
            .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            TargetEventKind::TargetHitBreakpoint
        );

        let bt_ref: BacktraceRef = serde_json::from_value(
            dispatcher
                .handle(ServerRequest::GetThreadBacktrace {
                    pid: std::process::id() as i64,
                    tid: 1,
                })
                .unwrap(),
        )
        .unwrap();
        let count = dispatcher
            .handle(ServerRequest::Backtrace {
                id: bt_ref.id,
                request: BacktraceRequest::FrameCount,
            })
            .unwrap();
        assert_eq!(count, serde_json::json!(1));

        dispatcher
            .handle(ServerRequest::ReleaseBacktrace { id: bt_ref.id })
            .unwrap();
        assert!(matches!(
            dispatcher.handle(ServerRequest::Backtrace {
                id: bt_ref.id,
                request: BacktraceRequest::FrameCount,
            }),
            Err(Error::BacktraceNotFound(_))
        ));

        dispatcher.handle(ServerRequest::Continue).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            TargetEventKind::TargetExited
        );
    }
}
