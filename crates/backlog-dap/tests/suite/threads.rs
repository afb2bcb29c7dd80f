use std::collections::BTreeSet;
use std::time::Duration;

use backlog_dap::events::StopReason;
use backlog_dap::session::UnitKind;
use backlog_dap::SessionError;
use backlog_wire::{BacklogClient, BacklogClientConfig};

use crate::harness::{is_exit, stops, Attached};

#[tokio::test]
async fn concurrent_suspensions_get_distinct_thread_ids() {
    let mut t = Attached::start().await;
    t.breakpoints(&[11, 21]).await;

    let orders = t.engine.send("orders", "a");
    let audit = t.engine.send("audit", "b");

    let (first, _) = t.events.wait_stopped().await;
    let (second, _) = t.events.wait_stopped().await;
    assert_ne!(first, second);

    let exchanges: BTreeSet<String> = [first, second]
        .into_iter()
        .map(|id| t.manager.exchange(id).unwrap().exchange_id)
        .collect();
    assert_eq!(exchanges, BTreeSet::from([orders, audit]));

    let units = t.manager.list_execution_units();
    assert_eq!(units.iter().filter(|u| u.kind == UnitKind::Exchange).count(), 2);
    assert_eq!(units.iter().filter(|u| u.kind == UnitKind::Route).count(), 3);
    let ids: BTreeSet<i64> = units.iter().map(|u| u.id).collect();
    assert_eq!(ids.len(), units.len());
}

#[tokio::test]
async fn resume_all_clears_threads_and_breakpoint_triggers_again() {
    let mut t = Attached::start().await;
    t.breakpoints(&[11]).await;

    let first_exchange = t.engine.send("orders", "one");
    let (first, _) = t.events.wait_stopped().await;

    t.manager.resume(None).await.unwrap();
    t.events.wait_for(|event| is_exit(event, first)).await;
    assert!(t.manager.exchange(first).is_none());
    assert_eq!(t.engine.completed(), vec![first_exchange]);

    let second_exchange = t.engine.send("orders", "two");
    let (second, _) = t.events.wait_stopped().await;
    assert_ne!(first, second);
    assert_eq!(t.manager.exchange(second).unwrap().exchange_id, second_exchange);
}

#[tokio::test]
async fn resuming_one_message_leaves_the_other_suspended() {
    let mut t = Attached::start().await;
    t.breakpoints(&[11, 21]).await;

    t.engine.send("orders", "a");
    let audit = t.engine.send("audit", "b");
    let (a, _) = t.events.wait_stopped().await;
    let (b, _) = t.events.wait_stopped().await;

    let orders_thread = if t.manager.exchange(a).unwrap().route_id == "orders" { a } else { b };
    let audit_thread = if orders_thread == a { b } else { a };

    t.manager.resume(Some(orders_thread)).await.unwrap();
    t.events.wait_for(|event| is_exit(event, orders_thread)).await;

    assert_eq!(t.engine.suspended(), vec![(audit, "log-audit".to_string())]);
    assert!(t.manager.exchange(audit_thread).is_some());

    // The remaining message is not reported again.
    let events = t.events.collect_for(Duration::from_millis(150)).await;
    assert!(stops(&events).is_empty(), "{events:?}");
}

#[tokio::test]
async fn operations_on_unknown_threads_are_no_ops() {
    let t = Attached::start().await;
    t.manager.resume(Some(9_999)).await.unwrap();
    t.manager.step(9_999).await.unwrap();
    t.manager.pause(Some(9_999)).await.unwrap();
    assert_eq!(t.manager.stack_frame(9_999).unwrap(), None);
}

#[tokio::test]
async fn message_released_by_the_engine_drops_its_thread() {
    let mut t = Attached::start().await;
    t.breakpoints(&[11]).await;
    t.engine.send("orders", "one");
    let (first, _) = t.events.wait_stopped().await;

    // Another client of the same engine lets the message go.
    let other = BacklogClient::connect(&t.engine.address(), BacklogClientConfig::default())
        .await
        .unwrap();
    other.resume("log-received").await.unwrap();
    t.events.wait_for(|event| is_exit(event, first)).await;
    assert!(t.manager.exchange(first).is_none());

    let second_exchange = t.engine.send("orders", "two");
    let (second, reason) = t.events.wait_stopped().await;
    assert_eq!(reason, StopReason::Breakpoint);
    assert_ne!(first, second);
    assert_eq!(t.manager.exchange(second).unwrap().exchange_id, second_exchange);
    other.shutdown();
}

#[tokio::test]
async fn rejected_resume_reports_the_held_message_again() {
    let mut t = Attached::start().await;
    t.breakpoints(&[11]).await;
    let exchange = t.engine.send("orders", "stuck");
    let (first, _) = t.events.wait_stopped().await;

    t.engine.reject_next("resume");
    let err = t.manager.resume(Some(first)).await.unwrap_err();
    assert!(matches!(err, SessionError::Backlog(_)), "{err:?}");

    // Still held by the engine, so it shows up again under a new thread.
    let (again, reason) = t.events.wait_stopped().await;
    assert_eq!(reason, StopReason::Breakpoint);
    assert_ne!(again, first);
    assert_eq!(t.manager.exchange(again).unwrap().exchange_id, exchange);
}
