use crate::assert_no_proc;
use crate::common::{config, hello_world, TestSession, TIMEOUT};
use rdbg::controller::{DebuggerController, ExitReason, ProcessLauncher, SessionFrontend};
use rdbg::server::{BreakEvent, StartInfo};
use rdbg::session::SessionState;
use rdbg::Error;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serial_test::serial;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
#[serial]
fn test_server_death_is_reported() {
    let mut test = TestSession::new();
    test.session
        .insert_break_event(BreakEvent::breakpoint("Program.cs", 8))
        .unwrap();
    test.session.run(&hello_world()).unwrap();
    let pid = test.server_pid();
    test.next_stop();

    kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
    let event = test.expect_exit();
    assert!(event.message.is_some());
    assert_eq!(
        test.session.controller().last_exit_reason(),
        Some(ExitReason::ProcessDied)
    );
    assert_no_proc!(pid);
}

#[test]
#[serial]
fn test_missing_server_binary() {
    struct Nothing;
    impl SessionFrontend for Nothing {}

    let mut config = config();
    config.controller.server_path = Some(PathBuf::from("/nonexistent/rdbg-server"));
    let controller = DebuggerController::new(
        config.controller,
        Arc::new(Nothing),
        Arc::new(ProcessLauncher),
    );
    assert!(matches!(
        controller.start_debugger(&StartInfo::new("hello.toml")),
        Err(Error::ServerNotFound(_))
    ));
    assert!(!controller.is_running());
}

#[test]
#[serial]
fn test_server_is_reused_until_stopped() {
    struct Nothing;
    impl SessionFrontend for Nothing {}

    let controller = DebuggerController::new(
        config().controller,
        Arc::new(Nothing),
        Arc::new(ProcessLauncher),
    );
    let first = controller.start_debugger(&hello_world()).unwrap();
    let pid = controller.last_launched().unwrap();
    let second = controller.start_debugger(&hello_world()).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(controller.last_launched(), Some(pid));

    controller.stop_debugger().unwrap();
    controller.stop_debugger().unwrap();
    assert!(!controller.is_running());
    assert_eq!(controller.last_exit_reason(), Some(ExitReason::Requested));
    assert_no_proc!(pid);
}

#[test]
#[serial]
fn test_failed_program_load_terminates_session() {
    let mut test = TestSession::new();
    let info = StartInfo::new("missing.toml").with_working_dir(env!("CARGO_MANIFEST_DIR"));
    test.session.run(&info).unwrap();
    let event = test.expect_exit();
    assert!(event.message.unwrap().contains("missing.toml"));
    let (state, _) = test.session.wait_until(TIMEOUT, |s| s == SessionState::Terminated);
    assert_eq!(state, SessionState::Terminated);
}

#[test]
#[serial]
fn test_exit_while_launching_leaves_no_server() {
    for delay in [0, 2, 10, 25, 50] {
        let test = TestSession::new();
        let session = &test.session;
        thread::scope(|s| {
            let run = s.spawn(|| session.run(&hello_world()));
            thread::sleep(Duration::from_millis(delay));
            session.exit().unwrap();
            // run either completed or was abandoned, both are fine here
            _ = run.join().unwrap();
        });

        let (state, _) = session.wait_until(TIMEOUT, |s| s == SessionState::Terminated);
        assert_eq!(state, SessionState::Terminated, "delay {delay}ms");
        if let Some(pid) = session.controller().last_launched() {
            assert_no_proc!(pid);
        }
        assert!(!session.controller().is_running());
    }
}
