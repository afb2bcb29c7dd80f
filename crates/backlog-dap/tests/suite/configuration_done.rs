use std::time::Duration;

use backlog_wire::mock::{MockEngine, MockEngineConfig};
use backlog_wire::Command;

use crate::harness::{fast_options, stops, Attached};

#[tokio::test]
async fn messages_held_at_startup_run_after_configuration_done() {
    let engine = MockEngine::spawn_with_config(MockEngineConfig {
        suspend_on_startup: true,
        ..MockEngineConfig::default()
    })
    .await
    .unwrap();
    let mut t = Attached::start_with(engine, fast_options()).await;
    t.breakpoints(&[11]).await;

    let exchange = t.engine.send("orders", "early");
    let events = t.events.collect_for(Duration::from_millis(150)).await;
    assert!(stops(&events).is_empty(), "{events:?}");

    t.manager.configuration_done().await.unwrap();
    assert_eq!(t.engine.count_calls(|c| *c == Command::AttachDebugger), 1);

    let (thread_id, _) = t.events.wait_stopped().await;
    assert_eq!(t.manager.exchange(thread_id).unwrap().exchange_id, exchange);
}
