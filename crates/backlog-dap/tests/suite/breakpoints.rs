use backlog_dap::breakpoints::BreakpointSpec;
use backlog_dap::LinkState;
use backlog_wire::mock::{MockEngine, MockEngineConfig};

use crate::harness::{detached, Attached, ROUTES_SOURCE};

#[tokio::test]
async fn resolvable_lines_are_verified_and_registered() {
    let t = Attached::start().await;

    let bps = t.breakpoints(&[11, 99]).await;
    assert_eq!(bps.len(), 2);
    assert!(bps[0].verified);
    assert_eq!(bps[0].step_id.as_deref(), Some("log-received"));
    assert_eq!(bps[0].message, None);

    assert!(!bps[1].verified);
    assert_eq!(
        bps[1].message.as_deref(),
        Some(format!("cannot find related id for {ROUTES_SOURCE} l.99").as_str())
    );

    assert_eq!(
        t.engine.breakpoints().keys().cloned().collect::<Vec<_>>(),
        vec!["log-received".to_string()]
    );
}

#[tokio::test]
async fn engine_without_routes_reports_no_topology() {
    let engine = MockEngine::spawn_with_config(MockEngineConfig {
        routes_xml: None,
        ..MockEngineConfig::default()
    })
    .await
    .unwrap();
    let (manager, _events) = detached();
    assert!(manager.attach(&engine.address()).await);

    let bps = manager
        .set_breakpoints(ROUTES_SOURCE, &[BreakpointSpec::new(11)])
        .await;
    assert!(!bps[0].verified);
    assert!(bps[0]
        .message
        .as_deref()
        .unwrap()
        .starts_with("no active routes found"));
    assert!(engine.breakpoints().is_empty());
}

#[tokio::test]
async fn breakpoints_before_attach_are_unverified_and_not_kept() {
    let (manager, _events) = detached();
    assert_eq!(manager.link_state(), LinkState::Detached);

    let bps = manager
        .set_breakpoints(ROUTES_SOURCE, &[BreakpointSpec::new(11)])
        .await;
    assert!(!bps[0].verified);
    assert!(bps[0].message.as_deref().unwrap().contains("no active routes"));
}

#[tokio::test]
async fn rejected_condition_is_reported_as_internal_error() {
    let t = Attached::start().await;

    let bps = t
        .manager
        .set_breakpoints(
            ROUTES_SOURCE,
            &[BreakpointSpec::with_condition(11, "${body} contains 'x'")],
        )
        .await;
    assert!(!bps[0].verified);
    let message = bps[0].message.as_deref().unwrap();
    assert!(message.starts_with("internal error"), "{message}");
    assert!(message.contains("unsupported condition"), "{message}");
    assert!(t.engine.breakpoints().is_empty());
}

#[tokio::test]
async fn conditional_breakpoint_stops_only_matching_messages() {
    let mut t = Attached::start().await;
    let bps = t
        .manager
        .set_breakpoints(
            ROUTES_SOURCE,
            &[BreakpointSpec::with_condition(11, "${body} == 'stop'")],
        )
        .await;
    assert!(bps[0].verified);

    let skipped = t.engine.send("orders", "go");
    let held = t.engine.send("orders", "stop");
    assert_eq!(t.engine.completed(), vec![skipped]);

    let (thread_id, _) = t.events.wait_stopped().await;
    let thread = t.manager.exchange(thread_id).unwrap();
    assert_eq!(thread.exchange_id, held);
    assert_eq!(thread.snapshot.body.as_deref(), Some("stop"));
}

#[tokio::test]
async fn replacing_breakpoints_removes_stale_steps_from_engine() {
    let t = Attached::start().await;

    let first = t.breakpoints(&[11, 12]).await;
    assert_eq!(t.engine.breakpoints().len(), 2);

    let second = t.breakpoints(&[12]).await;
    assert_eq!(second[0].id, first[1].id);
    assert_eq!(
        t.engine.breakpoints().keys().cloned().collect::<Vec<_>>(),
        vec!["set-priority".to_string()]
    );

    t.manager.remove_breakpoint(second[0].id).await.unwrap();
    assert!(t.engine.breakpoints().is_empty());
}
