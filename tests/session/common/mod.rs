use rdbg::config::Config;
use rdbg::controller::{ProcessLauncher, SessionFrontend};
use rdbg::server::{BreakEventHandle, StartInfo, TargetEvent, TargetEventKind};
use rdbg::session::{DebuggerSession, SessionState};
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub enum Observed {
    Event(TargetEvent),
    Output(String),
    Trace(BreakEventHandle, String),
}

pub struct TestFrontend {
    tx: Mutex<Sender<Observed>>,
}

impl TestFrontend {
    fn send(&self, observed: Observed) {
        _ = self.tx.lock().unwrap().send(observed);
    }
}

impl SessionFrontend for TestFrontend {
    fn on_target_event(&self, event: &TargetEvent) {
        self.send(Observed::Event(event.clone()));
    }

    fn on_target_output(&self, _: bool, line: &str) {
        self.send(Observed::Output(line.to_string()));
    }

    fn on_breakpoint_update(&self, handle: BreakEventHandle, _: i32, last_trace: Option<&str>) {
        if let Some(trace) = last_trace {
            self.send(Observed::Trace(handle, trace.to_string()));
        }
    }
}

pub struct TestSession {
    pub session: DebuggerSession,
    rx: Receiver<Observed>,
    pub output: Vec<String>,
    pub traces: Vec<(BreakEventHandle, String)>,
}

impl TestSession {
    pub fn new() -> Self {
        let (tx, rx) = channel();
        let frontend = Arc::new(TestFrontend { tx: Mutex::new(tx) });
        let session = DebuggerSession::new(&config(), Arc::new(ProcessLauncher), frontend);
        Self {
            session,
            rx,
            output: vec![],
            traces: vec![],
        }
    }

    /// Next target event, output seen on the way is collected.
    pub fn next_event(&mut self) -> TargetEvent {
        loop {
            match self.rx.recv_timeout(TIMEOUT).expect("no target event") {
                Observed::Event(event) => return event,
                Observed::Output(line) => self.output.push(line),
                Observed::Trace(handle, trace) => self.traces.push((handle, trace)),
            }
        }
    }

    pub fn next_stop(&mut self) -> TargetEvent {
        let event = self.next_event();
        assert!(!event.is_exit(), "target exited: {:?}", event.message);
        self.session
            .wait_until(TIMEOUT, |s| s == SessionState::Stopped);
        event
    }

    pub fn expect_exit(&mut self) -> TargetEvent {
        let event = self.next_event();
        assert_eq!(event.kind, TargetEventKind::TargetExited);
        let (state, reached) = self
            .session
            .wait_until(TIMEOUT, |s| s == SessionState::Terminated);
        assert!(reached, "session is {state}");
        event
    }

    pub fn server_pid(&self) -> u32 {
        self.session
            .controller()
            .last_launched()
            .expect("server was never launched")
    }
}

pub fn config() -> Config {
    let mut config = Config::default();
    config.controller.server_path = Some(PathBuf::from(env!("CARGO_BIN_EXE_rdbg-server")));
    config.controller.launch_timeout_ms = TIMEOUT.as_millis() as u64;
    config
}

pub fn hello_world() -> StartInfo {
    StartInfo::new("hello.toml").with_working_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/demos"))
}

#[macro_export]
macro_rules! assert_no_proc {
    ($pid:expr) => {
        let pid = sysinfo::Pid::from_u32($pid);
        let gone = (0..50).any(|_| {
            let sys = sysinfo::System::new_with_specifics(
                sysinfo::RefreshKind::new().with_processes(sysinfo::ProcessRefreshKind::new()),
            );
            let alive = sys
                .process(pid)
                .map(|p| p.status() != sysinfo::ProcessStatus::Zombie)
                .unwrap_or(false);
            if alive {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            !alive
        });
        assert!(gone, "process {} is still alive", $pid)
    };
}
