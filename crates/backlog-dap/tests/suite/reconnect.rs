use std::time::Duration;

use backlog_dap::{LinkState, SessionOptions};
use backlog_wire::{mock::MockEngine, RetryPolicy};

use crate::harness::{eventually, fast_options, is_exit, stops, Attached};

#[tokio::test]
async fn engine_restart_replays_breakpoints() {
    let mut t = Attached::start().await;
    let bps = t.breakpoints(&[11]).await;
    assert!(bps[0].verified);

    t.engine.restart(Duration::from_millis(150));
    assert!(t.engine.breakpoints().is_empty());

    let engine = &t.engine;
    eventually(
        || engine.is_debugger_enabled() && engine.breakpoints().contains_key("log-received"),
        "breakpoints to be replayed",
    )
    .await;
    let manager = &t.manager;
    eventually(|| manager.link_state() == LinkState::Connected, "reconnection").await;
    assert!(t.engine.connection_count() >= 2);

    let exchange = t.engine.send("orders", "after restart");
    let (thread_id, _) = t.events.wait_stopped().await;
    assert_eq!(t.manager.exchange(thread_id).unwrap().exchange_id, exchange);
}

#[tokio::test]
async fn connection_loss_clears_suspended_threads() {
    let mut t = Attached::start().await;
    t.breakpoints(&[11]).await;
    t.engine.send("orders", "lost");
    let (thread_id, _) = t.events.wait_stopped().await;

    t.engine.restart(Duration::from_millis(50));
    t.events.wait_for(|event| is_exit(event, thread_id)).await;
    assert!(t.manager.exchange(thread_id).is_none());
}

#[tokio::test]
async fn permanent_outage_abandons_the_session() {
    let options = SessionOptions {
        reconnect: RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(20),
        },
        ..fast_options()
    };
    let mut t = Attached::start_with(MockEngine::spawn().await.unwrap(), options).await;
    t.breakpoints(&[11]).await;

    t.engine.set_available(false);
    t.engine.drop_connections();

    let manager = &t.manager;
    eventually(|| manager.link_state() == LinkState::Abandoned, "abandonment").await;

    // Idle from now on: a returning engine is not picked up again.
    t.engine.set_available(true);
    let events = t.events.collect_for(Duration::from_millis(200)).await;
    assert!(stops(&events).is_empty(), "{events:?}");
    assert_eq!(t.manager.link_state(), LinkState::Abandoned);

    // Still attached until the client detaches.
    assert!(t.manager.attach(&t.engine.address()).await);
    t.manager.terminate().await;
    assert_eq!(t.manager.link_state(), LinkState::Detached);
}

/// `orders` after a redeploy: a validation step now sits on line 11.
const REDEPLOYED_ROUTES: &str = r#"<routes>
  <route id="orders" sourceLineNumber="10" sourceLocation="OrderRoutes.java">
    <from id="from-orders" uri="direct:orders" sourceLineNumber="10" sourceLocation="OrderRoutes.java"/>
    <log id="validate-order" message="validating" sourceLineNumber="11" sourceLocation="OrderRoutes.java"/>
    <log id="log-received" message="received ${body}" sourceLineNumber="12" sourceLocation="OrderRoutes.java"/>
  </route>
</routes>"#;

#[tokio::test]
async fn replayed_breakpoints_resolve_against_the_new_routes() {
    let mut t = Attached::start().await;
    let bps = t.breakpoints(&[11]).await;
    assert_eq!(bps[0].step_id.as_deref(), Some("log-received"));

    t.engine.restart(Duration::from_millis(150));
    t.engine.replace_routes(REDEPLOYED_ROUTES).unwrap();

    let engine = &t.engine;
    eventually(
        || engine.breakpoints().contains_key("validate-order"),
        "breakpoint on the redeployed step",
    )
    .await;
    assert!(!t.engine.breakpoints().contains_key("log-received"));
    let manager = &t.manager;
    eventually(|| manager.link_state() == LinkState::Connected, "reconnection").await;

    let exchange = t.engine.send("orders", "redeployed");
    let (thread_id, _) = t.events.wait_stopped().await;
    let frame = t.manager.stack_frame(thread_id).unwrap().unwrap();
    assert_eq!(frame.step_id, "validate-order");
    assert_eq!(frame.line, Some(11));
    assert_eq!(t.manager.exchange(thread_id).unwrap().exchange_id, exchange);
}

#[tokio::test]
async fn breakpoints_set_while_reconnecting_reach_the_engine() {
    let mut t = Attached::start().await;
    t.engine.restart(Duration::from_millis(300));
    let manager = &t.manager;
    eventually(|| manager.link_state() == LinkState::Reconnecting, "reconnect attempts").await;

    let bps = t.breakpoints(&[12]).await;
    assert!(bps[0].verified);

    let engine = &t.engine;
    eventually(
        || engine.breakpoints().contains_key("set-priority"),
        "breakpoint to be registered",
    )
    .await;
    eventually(|| manager.link_state() == LinkState::Connected, "reconnection").await;

    let exchange = t.engine.send("orders", "late");
    let (thread_id, _) = t.events.wait_stopped().await;
    assert_eq!(t.manager.exchange(thread_id).unwrap().exchange_id, exchange);
}
