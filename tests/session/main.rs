mod common;

mod breakpoints;
mod supervision;
mod values;

use crate::common::{hello_world, TestSession};
use rdbg::session::SessionState;
use serial_test::serial;

#[test]
#[serial]
fn test_run_to_exit() {
    let mut test = TestSession::new();
    test.session.run(&hello_world()).unwrap();
    let pid = test.server_pid();
    assert!(test.session.runtime_version().is_some());

    let event = test.expect_exit();
    assert_eq!(event.exit_code, Some(0));
    assert_eq!(test.output, vec!["Hello, world!", "shipped", "bye!"]);

    test.session.exit().unwrap();
    assert_eq!(test.session.state(), SessionState::Terminated);
    assert_no_proc!(pid);
}

#[test]
#[serial]
fn test_exit_while_stopped() {
    let mut test = TestSession::new();
    test.session
        .insert_break_event(rdbg::server::BreakEvent::breakpoint("Program.cs", 8))
        .unwrap();
    test.session.run(&hello_world()).unwrap();
    let pid = test.server_pid();
    test.next_stop();

    test.session.exit().unwrap();
    assert_eq!(test.session.state(), SessionState::Terminated);
    assert!(!test.session.controller().is_running());
    assert_no_proc!(pid);
}
