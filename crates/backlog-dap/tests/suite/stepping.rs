use std::time::Duration;

use backlog_dap::events::ThreadReason;
use backlog_dap::SessionEvent;

use crate::harness::{is_exit, stops, Attached, ROUTES_SOURCE};

#[tokio::test]
async fn stepping_from_last_step_exits_thread_without_a_stop() {
    let mut t = Attached::start().await;
    t.breakpoints(&[13]).await;

    let exchange = t.engine.send("orders", "last");
    let (thread_id, _) = t.events.wait_stopped().await;
    assert_eq!(t.manager.exchange(thread_id).unwrap().step_id, "to-process");

    t.manager.step(thread_id).await.unwrap();
    let events = t.events.collect_for(Duration::from_millis(200)).await;
    assert!(events.iter().any(|event| is_exit(event, thread_id)), "{events:?}");
    assert!(stops(&events).is_empty(), "{events:?}");

    assert!(t.manager.exchange(thread_id).is_none());
    assert_eq!(t.engine.completed(), vec![exchange]);
}

#[tokio::test]
async fn stepping_from_inner_step_keeps_thread_identity() {
    let mut t = Attached::start().await;
    t.breakpoints(&[11]).await;

    t.engine.send("orders", "inner");
    let (thread_id, _) = t.events.wait_stopped().await;

    t.manager.step(thread_id).await.unwrap();
    let mut seen = Vec::new();
    let stopped = loop {
        let event = t.events.next().await;
        if let SessionEvent::Stopped { thread_id, .. } = event {
            break thread_id;
        }
        seen.push(event);
    };
    assert_eq!(stopped, thread_id);
    assert!(
        !seen.iter().any(|event| matches!(event, SessionEvent::Thread { reason: ThreadReason::Exited, .. })),
        "{seen:?}"
    );

    let frame = t.manager.stack_frame(thread_id).unwrap().unwrap();
    assert_eq!(frame.step_id, "set-priority");
    assert_eq!(frame.line, Some(12));
    assert_eq!(frame.source.as_deref(), Some(ROUTES_SOURCE));
}

#[tokio::test]
async fn stepping_through_a_route_ends_with_exit() {
    let mut t = Attached::start().await;
    t.breakpoints(&[12]).await;

    let exchange = t.engine.send("orders", "walk");
    let (thread_id, _) = t.events.wait_stopped().await;

    // set-priority -> to-process
    t.manager.step(thread_id).await.unwrap();
    let (again, _) = t.events.wait_stopped().await;
    assert_eq!(again, thread_id);
    assert_eq!(t.manager.exchange(thread_id).unwrap().step_id, "to-process");

    // to-process is last
    t.manager.step(thread_id).await.unwrap();
    t.events.wait_for(|event| is_exit(event, thread_id)).await;
    assert_eq!(t.engine.completed(), vec![exchange]);
}
