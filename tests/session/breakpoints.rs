use crate::common::{hello_world, TestSession};
use rdbg::server::{BreakEvent, TargetEventKind};
use rdbg::session::SessionState;
use serial_test::serial;

#[test]
#[serial]
fn test_line_breakpoint_hit() {
    let mut test = TestSession::new();
    let id = test
        .session
        .insert_break_event(BreakEvent::breakpoint("Program.cs", 21))
        .unwrap();
    test.session.run(&hello_world()).unwrap();

    let event = test.next_stop();
    assert_eq!(event.kind, TargetEventKind::TargetHitBreakpoint);
    assert_eq!(event.break_event_id, Some(id));
    assert_eq!(test.output, vec!["Hello, world!"]);

    let status = test.session.break_event(id).unwrap();
    assert!(status.handle.is_some());
    assert_eq!(status.hit_count, 1);

    test.session.r#continue().unwrap();
    test.expect_exit();
    assert_eq!(test.output, vec!["Hello, world!", "shipped", "bye!"]);
}

#[test]
#[serial]
fn test_function_breakpoint_and_steps() {
    let mut test = TestSession::new();
    test.session
        .insert_break_event(BreakEvent::function("Ship"))
        .unwrap();
    test.session.run(&hello_world()).unwrap();
    let event = test.next_stop();
    let (pid, tid) = (event.process_id.unwrap(), event.thread_id.unwrap());

    let line = |test: &TestSession| {
        let bt = test.session.get_backtrace(pid, tid).unwrap();
        bt.get_stack_frames(0, 0).unwrap()[0].line
    };
    assert_eq!(line(&test), Some(20));

    test.session.step_line().unwrap();
    assert_eq!(test.next_stop().kind, TargetEventKind::TargetStopped);
    assert_eq!(line(&test), Some(21));

    test.session.finish().unwrap();
    test.next_stop();
    assert_eq!(line(&test), Some(10));
    assert_eq!(test.output, vec!["Hello, world!", "shipped"]);

    test.session.r#continue().unwrap();
    test.expect_exit();
}

#[test]
#[serial]
fn test_tracepoint_does_not_stop() {
    let mut test = TestSession::new();
    let id = test
        .session
        .insert_break_event(BreakEvent::breakpoint("Program.cs", 21).with_trace("attempt {attempts}"))
        .unwrap();
    test.session.run(&hello_world()).unwrap();

    test.expect_exit();
    let status = test.session.break_event(id).unwrap();
    let handle = status.handle.expect("break event was not sent to the server");
    assert_eq!(test.traces, vec![(handle, "attempt 1".to_string())]);
    assert_eq!(status.hit_count, 1);
    assert_eq!(status.last_trace.as_deref(), Some("attempt 1"));
}

#[test]
#[serial]
fn test_disabled_breakpoint_is_skipped() {
    let mut test = TestSession::new();
    let first = test
        .session
        .insert_break_event(BreakEvent::breakpoint("Program.cs", 8))
        .unwrap();
    let second = test
        .session
        .insert_break_event(BreakEvent::breakpoint("Program.cs", 21))
        .unwrap();
    test.session.enable_break_event(second, false).unwrap();
    test.session.run(&hello_world()).unwrap();

    assert_eq!(test.next_stop().break_event_id, Some(first));
    test.session.remove_break_event(first).unwrap();
    assert!(test.session.break_event(first).is_none());
    assert!(!test.session.break_event(second).unwrap().enabled);

    test.session.r#continue().unwrap();
    test.expect_exit();
    assert_eq!(test.session.state(), SessionState::Terminated);
}
