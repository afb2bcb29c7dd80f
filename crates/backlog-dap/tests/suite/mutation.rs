use backlog_dap::SessionError;
use backlog_wire::DebuggerSetting;

use crate::harness::Attached;

#[tokio::test]
async fn message_mutations_reach_engine_and_refresh_snapshot() {
    let mut t = Attached::start().await;
    t.breakpoints(&[11]).await;
    let exchange = t.engine.send_with_headers("orders", "hello", &[("kind", "retail")]);
    let (thread_id, _) = t.events.wait_stopped().await;

    t.manager.set_message_body(thread_id, "changed").await.unwrap();
    t.manager
        .set_message_header(thread_id, "kind", "wholesale")
        .await
        .unwrap();
    t.manager
        .set_exchange_property(thread_id, "audited", "yes")
        .await
        .unwrap();

    assert_eq!(t.engine.body(&exchange).as_deref(), Some("changed"));
    assert_eq!(t.engine.header(&exchange, "kind").as_deref(), Some("wholesale"));
    assert_eq!(t.engine.property(&exchange, "audited").as_deref(), Some("yes"));

    let snapshot = t.manager.exchange(thread_id).unwrap().snapshot;
    assert_eq!(snapshot.body.as_deref(), Some("changed"));
    assert_eq!(snapshot.header("kind").map(|h| h.value.as_str()), Some("wholesale"));
    assert_eq!(snapshot.property("audited").map(|p| p.value.as_str()), Some("yes"));
}

#[tokio::test]
async fn mutating_an_unknown_thread_fails() {
    let t = Attached::start().await;
    let err = t.manager.set_message_body(42, "x").await.unwrap_err();
    assert!(matches!(err, SessionError::UnknownThread(42)), "{err:?}");
}

#[tokio::test]
async fn debugger_settings_pass_through() {
    let mut t = Attached::start().await;
    t.breakpoints(&[11]).await;
    t.engine.send("orders", "count me");
    t.events.wait_stopped().await;

    let settings = t.manager.debugger_settings().await.unwrap();
    assert_eq!(settings.debug_counter, 1);

    t.manager
        .update_debugger_setting(DebuggerSetting::BodyMaxChars(64))
        .await
        .unwrap();
    t.manager
        .update_debugger_setting(DebuggerSetting::ResetDebugCounter)
        .await
        .unwrap();

    let settings = t.engine.settings();
    assert_eq!(settings.body_max_chars, 64);
    assert_eq!(settings.debug_counter, 0);
}
