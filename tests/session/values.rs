use crate::common::{hello_world, TestSession};
use rdbg::eval::EvaluationOptions;
use rdbg::server::BreakEvent;
use rdbg::Error;
use serial_test::serial;

#[test]
#[serial]
fn test_remote_backtrace_values() {
    let mut test = TestSession::new();
    test.session
        .insert_break_event(BreakEvent::breakpoint("Program.cs", 21))
        .unwrap();
    test.session.run(&hello_world()).unwrap();
    let event = test.next_stop();

    let bt = test
        .session
        .get_backtrace(event.process_id.unwrap(), event.thread_id.unwrap())
        .unwrap();
    assert_eq!(bt.frame_count().unwrap(), 2);
    let frames = bt.get_stack_frames(0, usize::MAX).unwrap();
    assert!(frames[0].label.starts_with("Program.Ship("));
    assert_eq!(frames[0].file.as_deref(), Some("Program.cs"));
    assert_eq!(frames[1].line, Some(20));

    let options = EvaluationOptions::default();
    let params = bt.get_parameters(0, &options).unwrap();
    let params: Vec<_> = params
        .iter()
        .map(|p| (p.name.as_str(), p.value.as_str()))
        .collect();
    assert_eq!(params, vec![("order", "Order(12.5)"), ("attempts", "1")]);

    let watches: Vec<String> = [
        "order.Customer",
        "order.Items[1]",
        "order.Total",
        "order.Tint",
        "order.Describe()",
        "missing",
    ]
    .into_iter()
    .map(ToString::to_string)
    .collect();
    let values = bt.get_expression_values(0, &watches, &options).unwrap();
    let shown: Vec<_> = values.iter().map(|v| v.value.as_str()).collect();
    assert_eq!(
        &shown[..5],
        &[
            "\"Ann\" (#42)",
            "\"milk\"",
            "12.5",
            "Green",
            "\"order for Customer\""
        ]
    );
    assert_eq!(values.len(), 6);

    let order = bt.get_parameters(0, &options).unwrap().remove(0);
    assert!(order.has_children);
    let children = bt.get_children(&order.path, 0, None, &options).unwrap();
    assert!(children.iter().any(|c| c.name == "Customer"));

    // the snapshot dies with the stop
    test.session.r#continue().unwrap();
    test.expect_exit();
    assert!(bt.frame_count().is_err());
}

#[test]
#[serial]
fn test_properties_not_evaluated_without_invoke() {
    let mut test = TestSession::new();
    test.session
        .insert_break_event(BreakEvent::breakpoint("Program.cs", 21))
        .unwrap();
    test.session.run(&hello_world()).unwrap();
    let event = test.next_stop();
    let bt = test
        .session
        .get_backtrace(event.process_id.unwrap(), event.thread_id.unwrap())
        .unwrap();

    let options = EvaluationOptions {
        allow_target_invoke: false,
        ..EvaluationOptions::default()
    };
    let params = bt.get_parameters(0, &options).unwrap();
    // no ToString() call, the type name is shown
    assert_eq!(params[0].value, "{Order}");

    test.session.exit().unwrap();
    assert!(matches!(
        test.session.get_backtrace(1, 1),
        Err(Error::ServerNotRunning)
    ));
}
