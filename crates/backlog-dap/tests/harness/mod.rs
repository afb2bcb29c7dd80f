#![allow(dead_code)]

use std::time::Duration;

use backlog_dap::{
    breakpoints::{Breakpoint, BreakpointSpec},
    dap::{DapReader, DapWriter},
    events::{StopReason, ThreadReason},
    server::{self, ServerOptions},
    session::UnitKind,
    ConnectionManager, SessionEvent, SessionOptions,
};
use backlog_wire::{mock::MockEngine, BacklogClientConfig, RetryPolicy};
use serde_json::{json, Value};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Source path the client uses for `OrderRoutes.java`.
pub const ROUTES_SOURCE: &str = "/work/src/main/java/demo/OrderRoutes.java";

pub fn fast_options() -> SessionOptions {
    SessionOptions {
        client: BacklogClientConfig {
            connect_timeout: Duration::from_secs(1),
            reply_timeout: Duration::from_secs(2),
            ..BacklogClientConfig::default()
        },
        connect: RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(20),
        },
        reconnect: RetryPolicy {
            attempts: 100,
            delay: Duration::from_millis(20),
        },
        poll_interval: Duration::from_millis(25),
        join_timeout: Duration::from_secs(1),
    }
}

pub struct Events {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Events {
    pub async fn next(&mut self) -> SessionEvent {
        tokio::time::timeout(TIMEOUT, self.rx.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("event channel closed")
    }

    /// Skip events until one matches.
    pub async fn wait_for(&mut self, mut pred: impl FnMut(&SessionEvent) -> bool) -> SessionEvent {
        loop {
            let event = self.next().await;
            if pred(&event) {
                return event;
            }
        }
    }

    pub async fn wait_stopped(&mut self) -> (i64, StopReason) {
        match self
            .wait_for(|event| matches!(event, SessionEvent::Stopped { .. }))
            .await
        {
            SessionEvent::Stopped {
                thread_id, reason, ..
            } => (thread_id, reason),
            _ => unreachable!(),
        }
    }

    /// Everything emitted during `window`.
    pub async fn collect_for(&mut self, window: Duration) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, self.rx.recv()).await {
            out.push(event);
        }
        out
    }
}

pub fn is_exit(event: &SessionEvent, id: i64) -> bool {
    matches!(
        event,
        SessionEvent::Thread { thread_id, reason: ThreadReason::Exited } if *thread_id == id
    )
}

pub fn stops(events: &[SessionEvent]) -> Vec<(i64, StopReason, bool)> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Stopped {
                thread_id,
                reason,
                all_threads_stopped,
            } => Some((*thread_id, *reason, *all_threads_stopped)),
            _ => None,
        })
        .collect()
}

pub struct Attached {
    pub engine: MockEngine,
    pub manager: ConnectionManager,
    pub events: Events,
}

impl Attached {
    pub async fn start() -> Self {
        Self::start_with(MockEngine::spawn().await.unwrap(), fast_options()).await
    }

    pub async fn start_with(engine: MockEngine, options: SessionOptions) -> Self {
        let (manager, rx) = ConnectionManager::new(options);
        assert!(manager.attach(&engine.address()).await, "attach failed");
        let mut events = Events { rx };
        // The first poll reports every live route in one batch; consume the
        // whole batch so later waits only see new threads.
        let mut started = 0;
        loop {
            events
                .wait_for(|event| matches!(event, SessionEvent::Thread { reason: ThreadReason::Started, .. }))
                .await;
            started += 1;
            let routes = manager
                .list_execution_units()
                .into_iter()
                .filter(|unit| unit.kind == UnitKind::Route)
                .count();
            if started >= routes {
                break;
            }
        }
        Self {
            engine,
            manager,
            events,
        }
    }

    pub async fn breakpoints(&self, lines: &[u32]) -> Vec<Breakpoint> {
        let specs: Vec<BreakpointSpec> = lines.iter().copied().map(BreakpointSpec::new).collect();
        self.manager.set_breakpoints(ROUTES_SOURCE, &specs).await
    }
}

pub fn detached() -> (ConnectionManager, Events) {
    let (manager, rx) = ConnectionManager::new(fast_options());
    (manager, Events { rx })
}

/// A DAP client driving [`server::run`] over an in-memory duplex pipe.
pub struct DapClient {
    reader: DapReader<ReadHalf<DuplexStream>>,
    writer: DapWriter<WriteHalf<DuplexStream>>,
    seq: i64,
    backlog: Vec<Value>,
    pub server: tokio::task::JoinHandle<()>,
}

impl DapClient {
    pub fn spawn() -> Self {
        let options = ServerOptions {
            session: fast_options(),
            default_address: "127.0.0.1:1".to_string(),
        };
        let (client, server_side) = tokio::io::duplex(1024 * 1024);
        let (server_reader, server_writer) = tokio::io::split(server_side);
        let server = tokio::spawn(async move {
            server::run(server_reader, server_writer, options)
                .await
                .expect("server failed");
        });
        let (reader, writer) = tokio::io::split(client);
        Self {
            reader: DapReader::new(reader),
            writer: DapWriter::new(writer),
            seq: 0,
            backlog: Vec::new(),
            server,
        }
    }

    async fn read(&mut self) -> Value {
        tokio::time::timeout(TIMEOUT, self.reader.read_value())
            .await
            .expect("timed out waiting for a DAP message")
            .expect("failed to read DAP message")
            .expect("server closed the stream")
    }

    pub async fn request(&mut self, command: &str, arguments: Value) -> Value {
        self.seq += 1;
        let seq = self.seq;
        self.writer
            .write_value(&json!({
                "seq": seq,
                "type": "request",
                "command": command,
                "arguments": arguments,
            }))
            .await
            .unwrap();
        loop {
            let msg = self.read().await;
            if msg["type"] == "response" && msg["request_seq"] == seq {
                return msg;
            }
            self.backlog.push(msg);
        }
    }

    /// Next event named `name` matching `pred`, in arrival order.
    pub async fn event(&mut self, name: &str, pred: impl Fn(&Value) -> bool) -> Value {
        let matches = |msg: &Value| msg["type"] == "event" && msg["event"] == name && pred(&msg["body"]);
        if let Some(pos) = self.backlog.iter().position(|msg| matches(msg)) {
            return self.backlog.remove(pos);
        }
        loop {
            let msg = self.read().await;
            if matches(&msg) {
                return msg;
            }
            self.backlog.push(msg);
        }
    }

    pub async fn stopped(&mut self) -> i64 {
        let event = self.event("stopped", |_| true).await;
        event["body"]["threadId"].as_i64().unwrap()
    }

    pub fn seen(&self, name: &str) -> Vec<Value> {
        self.backlog
            .iter()
            .filter(|msg| msg["type"] == "event" && msg["event"] == name)
            .cloned()
            .collect()
    }
}

/// Poll `cond` until it holds.
pub async fn eventually(mut cond: impl FnMut() -> bool, what: &str) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn route_thread(manager: &ConnectionManager, route_id: &str) -> i64 {
    manager
        .list_execution_units()
        .into_iter()
        .find(|unit| unit.kind == UnitKind::Route && unit.name == route_id)
        .map(|unit| unit.id)
        .unwrap_or_else(|| panic!("no thread for route {route_id}"))
}
