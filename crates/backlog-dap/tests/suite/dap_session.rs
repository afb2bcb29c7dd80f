use std::time::Duration;

use backlog_wire::mock::MockEngine;
use serde_json::{json, Value};

use crate::harness::{DapClient, ROUTES_SOURCE, TIMEOUT};

fn find<'a>(items: &'a Value, name: &str) -> &'a Value {
    items
        .as_array()
        .and_then(|items| items.iter().find(|item| item["name"] == name))
        .unwrap_or_else(|| panic!("no entry named {name} in {items}"))
}

async fn attached(engine: &MockEngine) -> DapClient {
    let mut dap = DapClient::spawn();
    let init = dap.request("initialize", json!({"adapterID": "backlog"})).await;
    assert_eq!(init["success"], true);
    assert_eq!(init["body"]["supportsConfigurationDoneRequest"], true);
    assert_eq!(init["body"]["supportsSetVariable"], true);

    let attach = dap
        .request("attach", json!({"address": engine.address()}))
        .await;
    assert_eq!(attach["success"], true, "{attach}");
    dap.event("initialized", |_| true).await;
    dap
}

#[tokio::test]
async fn dap_session_breakpoint_inspect_step_continue() {
    let engine = MockEngine::spawn().await.unwrap();
    let mut dap = attached(&engine).await;

    let resp = dap
        .request(
            "setBreakpoints",
            json!({
                "source": {"path": ROUTES_SOURCE},
                "breakpoints": [{"line": 11}, {"line": 99}],
            }),
        )
        .await;
    let bps = &resp["body"]["breakpoints"];
    assert_eq!(bps[0]["verified"], true);
    assert_eq!(bps[0]["line"], 11);
    assert_eq!(bps[1]["verified"], false);
    assert!(bps[1]["message"]
        .as_str()
        .unwrap()
        .contains("cannot find related id"));

    let done = dap.request("configurationDone", json!({})).await;
    assert_eq!(done["success"], true);

    let exchange = engine.send_with_headers("orders", "hello", &[("kind", "retail")]);
    let thread_id = dap.stopped().await;

    let threads = dap.request("threads", json!({})).await;
    let names: Vec<&str> = threads["body"]["threads"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|thread| thread["name"].as_str())
        .collect();
    assert!(names.contains(&format!("Exchange {exchange}").as_str()), "{names:?}");
    assert!(names.contains(&"Route orders"), "{names:?}");

    let trace = dap
        .request("stackTrace", json!({"threadId": thread_id}))
        .await;
    let frame = &trace["body"]["stackFrames"][0];
    assert_eq!(frame["name"], "log-received");
    assert_eq!(frame["line"], 11);
    assert_eq!(frame["source"]["path"], ROUTES_SOURCE);
    assert_eq!(frame["source"]["name"], "OrderRoutes.java");

    let frame_id = frame["id"].clone();
    let scopes = dap.request("scopes", json!({"frameId": frame_id})).await;
    let scopes = &scopes["body"]["scopes"];
    let message_ref = find(scopes, "Message")["variablesReference"].clone();
    let debugger_ref = find(scopes, "Debugger")["variablesReference"].clone();

    let vars = dap
        .request("variables", json!({"variablesReference": message_ref}))
        .await;
    let vars = &vars["body"]["variables"];
    assert_eq!(find(vars, "Body")["value"], "hello");
    assert_eq!(find(vars, "Exchange ID")["value"], exchange.as_str());
    let headers_ref = find(vars, "Headers")["variablesReference"].clone();
    let headers = dap
        .request("variables", json!({"variablesReference": headers_ref}))
        .await;
    assert_eq!(find(&headers["body"]["variables"], "kind")["value"], "retail");

    let set = dap
        .request(
            "setVariable",
            json!({"variablesReference": message_ref, "name": "Body", "value": "changed"}),
        )
        .await;
    assert_eq!(set["success"], true, "{set}");
    assert_eq!(set["body"]["value"], "changed");
    assert_eq!(engine.body(&exchange).as_deref(), Some("changed"));

    let rejected = dap
        .request(
            "setVariable",
            json!({"variablesReference": message_ref, "name": "UID", "value": "3"}),
        )
        .await;
    assert_eq!(rejected["success"], false);
    let output = dap.event("output", |body| body["category"] == "stderr").await;
    assert!(output["body"]["output"].as_str().unwrap().contains("read-only"));

    let settings = dap
        .request("variables", json!({"variablesReference": debugger_ref}))
        .await;
    assert_eq!(find(&settings["body"]["variables"], "Debug counter")["value"], "1");
    let set = dap
        .request(
            "setVariable",
            json!({"variablesReference": debugger_ref, "name": "Max chars for body", "value": "64"}),
        )
        .await;
    assert_eq!(set["success"], true, "{set}");
    assert_eq!(engine.settings().body_max_chars, 64);

    let next = dap.request("next", json!({"threadId": thread_id})).await;
    assert_eq!(next["success"], true);
    dap.event("stopped", |body| body["threadId"] == thread_id).await;
    let trace = dap
        .request("stackTrace", json!({"threadId": thread_id}))
        .await;
    assert_eq!(trace["body"]["stackFrames"][0]["name"], "set-priority");

    let cont = dap.request("continue", json!({"threadId": thread_id})).await;
    assert_eq!(cont["success"], true);
    assert_eq!(cont["body"]["allThreadsContinued"], false);
    dap.event("thread", |body| {
        body["reason"] == "exited" && body["threadId"] == thread_id
    })
    .await;
    assert_eq!(engine.completed(), vec![exchange]);

    let disconnect = dap.request("disconnect", json!({})).await;
    assert_eq!(disconnect["success"], true);
    dap.event("terminated", |_| true).await;
    tokio::time::timeout(TIMEOUT, &mut dap.server)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(!engine.is_debugger_enabled());
}

#[tokio::test]
async fn dap_pause_and_continue_all_routes() {
    let engine = MockEngine::spawn().await.unwrap();
    let mut dap = attached(&engine).await;
    // Wait for the route threads to appear.
    dap.event("thread", |body| body["reason"] == "started").await;

    let pause = dap.request("pause", json!({"threadId": 0})).await;
    assert_eq!(pause["success"], true);
    for _ in 0..3 {
        let stopped = dap.event("stopped", |body| body["reason"] == "pause").await;
        assert_eq!(stopped["body"]["allThreadsStopped"], false);
    }
    assert_eq!(engine.route_started("orders"), Some(false));

    let cont = dap.request("continue", json!({})).await;
    assert_eq!(cont["body"]["allThreadsContinued"], true);
    for _ in 0..3 {
        dap.event("continued", |_| true).await;
    }
    assert_eq!(engine.route_started("billing"), Some(true));

    dap.request("terminate", json!({})).await;
    dap.event("terminated", |_| true).await;
}

#[tokio::test]
async fn dap_attach_failure_is_reported() {
    let mut dap = DapClient::spawn();
    dap.request("initialize", json!({})).await;

    let attach = dap
        .request("attach", json!({"host": "127.0.0.1", "port": 1}))
        .await;
    assert_eq!(attach["success"], false);
    let output = dap.event("output", |body| body["category"] == "stderr").await;
    assert!(output["body"]["output"]
        .as_str()
        .unwrap()
        .starts_with("Error when trying to connect the backlog debugger"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(dap.seen("initialized").is_empty());

    // Requests that need a session fail cleanly.
    let trace = dap.request("stackTrace", json!({"threadId": 1})).await;
    assert_eq!(trace["success"], true);
    assert_eq!(trace["body"]["stackFrames"], json!([]));
    let step = dap.request("next", json!({"threadId": 1})).await;
    assert_eq!(step["success"], false);
}

#[tokio::test]
async fn dap_breakpoint_response_matches_request_order() {
    let engine = MockEngine::spawn().await.unwrap();
    let mut dap = attached(&engine).await;

    let resp = dap
        .request(
            "setBreakpoints",
            json!({
                "source": {"path": ROUTES_SOURCE},
                "breakpoints": [{"line": 11}, {"line": -3}, {"line": 12}],
            }),
        )
        .await;
    assert_eq!(resp["success"], true, "{resp}");
    let bps = resp["body"]["breakpoints"].as_array().unwrap();
    assert_eq!(bps.len(), 3);
    assert_eq!(bps[0]["line"], 11);
    assert_eq!(bps[0]["verified"], true);
    assert_eq!(bps[1]["verified"], false);
    assert!(bps[1]["message"].is_string());
    assert_eq!(bps[2]["line"], 12);
    assert_eq!(bps[2]["verified"], true);

    let registered = engine.breakpoints();
    assert!(registered.contains_key("log-received"));
    assert!(registered.contains_key("set-priority"));
    assert_eq!(registered.len(), 2);

    dap.request("terminate", json!({})).await;
    dap.event("terminated", |_| true).await;
}
