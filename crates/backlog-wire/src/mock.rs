use std::{
    collections::{BTreeMap, BTreeSet},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde_json::{json, Value};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

use super::{
    codec::{decode_request, encode_reply, read_frame, ReplyFrame},
    poison::lock,
    snapshot::{ExchangeProperty, MessageHeader, MessageSnapshot},
    types::{Command, DebuggerSetting, DebuggerSettings},
};

/// Three routes declared in `OrderRoutes.java`.
///
/// | route     | step            | line |
/// |-----------|-----------------|------|
/// | `orders`  | `from-orders`   | 10   |
/// |           | `log-received`  | 11   |
/// |           | `set-priority`  | 12   |
/// |           | `to-process`    | 13   |
/// | `audit`   | `from-audit`    | 20   |
/// |           | `log-audit`     | 21   |
/// |           | `to-archive`    | 22   |
/// | `billing` | `from-billing`  | 30   |
/// |           | `bean-invoice`  | 31   |
pub const SAMPLE_ROUTES: &str = r#"<routes>
  <route id="orders" sourceLineNumber="10" sourceLocation="OrderRoutes.java">
    <from id="from-orders" uri="direct:orders" sourceLineNumber="10" sourceLocation="OrderRoutes.java"/>
    <log id="log-received" message="received ${body}" sourceLineNumber="11" sourceLocation="OrderRoutes.java"/>
    <setHeader id="set-priority" name="priority" sourceLineNumber="12" sourceLocation="OrderRoutes.java">
      <constant>normal</constant>
    </setHeader>
    <to id="to-process" uri="mock:process" sourceLineNumber="13" sourceLocation="OrderRoutes.java"/>
  </route>
  <route id="audit" sourceLineNumber="20" sourceLocation="OrderRoutes.java">
    <from id="from-audit" uri="direct:audit" sourceLineNumber="20" sourceLocation="OrderRoutes.java"/>
    <log id="log-audit" message="audit" sourceLineNumber="21" sourceLocation="OrderRoutes.java"/>
    <to id="to-archive" uri="mock:archive" sourceLineNumber="22" sourceLocation="OrderRoutes.java"/>
  </route>
  <route id="billing" sourceLineNumber="30" sourceLocation="OrderRoutes.java">
    <from id="from-billing" uri="direct:billing" sourceLineNumber="30" sourceLocation="OrderRoutes.java"/>
    <bean id="bean-invoice" ref="invoicer" sourceLineNumber="31" sourceLocation="OrderRoutes.java"/>
  </route>
</routes>"#;

/// A tiny routing engine with a backlog debugger, used for unit/integration
/// testing.
///
/// Messages sent with [`MockEngine::send`] walk their route's steps in
/// document order and suspend at breakpoints while the debugger is enabled.
/// Only `${body}` and `${header.name}` equality conditions are understood.
pub struct MockEngine {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

#[derive(Clone, Debug)]
pub struct MockEngineConfig {
    pub engine_name: String,
    /// Route definitions reported by `dumpRoutes`. `None` simulates an engine
    /// without a routing context.
    pub routes_xml: Option<String>,
    /// When false, `hello` reports that no backlog debugger is installed.
    pub debugger_available: bool,
    /// Hold every message at its first step until `attachDebugger` arrives.
    pub suspend_on_startup: bool,
}

impl Default for MockEngineConfig {
    fn default() -> Self {
        Self {
            engine_name: "mock-engine".to_string(),
            routes_xml: Some(SAMPLE_ROUTES.to_string()),
            debugger_available: true,
            suspend_on_startup: false,
        }
    }
}

impl MockEngine {
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(MockEngineConfig::default()).await
    }

    pub async fn spawn_with_config(config: MockEngineConfig) -> std::io::Result<Self> {
        let routes = match config.routes_xml.as_deref() {
            Some(xml) => parse_routes(xml)
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?,
            None => Vec::new(),
        };

        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let state = Arc::new(State::new(config, routes, shutdown.child_token()));
        let task_shutdown = shutdown.clone();
        let task_state = state.clone();

        tokio::spawn(async move {
            run(listener, task_state, task_shutdown).await;
        });

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `host:port` form accepted by the client.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Number of TCP connections accepted so far, refused ones included.
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// While unavailable, new connections are accepted and closed at once.
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    /// Close every open client connection.
    pub fn drop_connections(&self) {
        let mut generation = lock(&self.state.generation, "MockEngine.drop_connections");
        generation.cancel();
        *generation = self.shutdown.child_token();
    }

    /// Simulate an engine restart: drop connections, refuse new ones for
    /// `down_for`, and forget all debugger state. Routes survive.
    pub fn restart(&self, down_for: Duration) {
        self.set_available(false);
        self.drop_connections();
        lock(&self.state.engine, "MockEngine.restart").reset();

        let state = self.state.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(down_for) => {
                    state.available.store(true, Ordering::SeqCst);
                }
            }
        });
    }

    /// Start a message on `route_id` and run it until it suspends or completes.
    /// Returns the message's exchange id.
    pub fn send(&self, route_id: &str, body: &str) -> String {
        self.send_with_headers(route_id, body, &[])
    }

    pub fn send_with_headers(&self, route_id: &str, body: &str, headers: &[(&str, &str)]) -> String {
        let mut engine = lock(&self.state.engine, "MockEngine.send");
        engine.start_exchange(route_id, body, headers)
    }

    /// Append a route definition (a single `<route>` element).
    pub fn add_route(&self, xml: &str) -> Result<(), String> {
        let routes = parse_routes(xml)?;
        let mut engine = lock(&self.state.engine, "MockEngine.add_route");
        engine.routes.extend(routes);
        Ok(())
    }

    /// Make the next `op` request (wire name, e.g. `"resume"`) fail with a
    /// remote error without touching engine state.
    pub fn reject_next(&self, op: &'static str) {
        lock(&self.state.rejections, "MockEngine.reject_next").push(op);
    }

    /// Swap every route definition, e.g. while the engine is down for a
    /// redeploy.
    pub fn replace_routes(&self, xml: &str) -> Result<(), String> {
        let routes = parse_routes(xml)?;
        lock(&self.state.engine, "MockEngine.replace_routes").routes = routes;
        Ok(())
    }

    pub fn remove_route(&self, route_id: &str) -> bool {
        let mut engine = lock(&self.state.engine, "MockEngine.remove_route");
        let before = engine.routes.len();
        engine.routes.retain(|route| route.id != route_id);
        before != engine.routes.len()
    }

    pub fn route_started(&self, route_id: &str) -> Option<bool> {
        let engine = lock(&self.state.engine, "MockEngine.route_started");
        engine.route(route_id).map(|route| route.started)
    }

    pub fn is_debugger_enabled(&self) -> bool {
        lock(&self.state.engine, "MockEngine.is_debugger_enabled").enabled
    }

    /// Registered breakpoints, keyed by step id, with their condition text.
    pub fn breakpoints(&self) -> BTreeMap<String, Option<String>> {
        let engine = lock(&self.state.engine, "MockEngine.breakpoints");
        engine
            .breakpoints
            .iter()
            .map(|(step, condition)| (step.clone(), condition.as_ref().map(|c| c.text.clone())))
            .collect()
    }

    /// `(exchange id, step id)` of every suspended message.
    pub fn suspended(&self) -> Vec<(String, String)> {
        let engine = lock(&self.state.engine, "MockEngine.suspended");
        engine
            .exchanges
            .values()
            .filter_map(|exchange| {
                exchange
                    .suspended_at
                    .as_ref()
                    .map(|step| (exchange.id.clone(), step.clone()))
            })
            .collect()
    }

    /// Exchange ids that ran to the end of their route, in completion order.
    pub fn completed(&self) -> Vec<String> {
        lock(&self.state.engine, "MockEngine.completed").completed.clone()
    }

    pub fn body(&self, exchange_id: &str) -> Option<String> {
        let engine = lock(&self.state.engine, "MockEngine.body");
        engine.exchanges.get(exchange_id).map(|ex| ex.body.clone())
    }

    pub fn header(&self, exchange_id: &str, key: &str) -> Option<String> {
        let engine = lock(&self.state.engine, "MockEngine.header");
        engine
            .exchanges
            .get(exchange_id)
            .and_then(|ex| ex.headers.get(key).cloned())
    }

    pub fn property(&self, exchange_id: &str, key: &str) -> Option<String> {
        let engine = lock(&self.state.engine, "MockEngine.property");
        engine
            .exchanges
            .get(exchange_id)
            .and_then(|ex| ex.properties.get(key).cloned())
    }

    pub fn settings(&self) -> DebuggerSettings {
        lock(&self.state.engine, "MockEngine.settings").settings.clone()
    }

    /// Every command received so far, in arrival order.
    pub fn calls(&self) -> Vec<Command> {
        lock(&self.state.calls, "MockEngine.calls").clone()
    }

    pub fn count_calls(&self, predicate: impl Fn(&Command) -> bool) -> usize {
        lock(&self.state.calls, "MockEngine.count_calls")
            .iter()
            .filter(|command| predicate(command))
            .count()
    }
}

impl Drop for MockEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct State {
    config: MockEngineConfig,
    available: AtomicBool,
    connections: AtomicUsize,
    generation: Mutex<CancellationToken>,
    engine: Mutex<Engine>,
    calls: Mutex<Vec<Command>>,
    rejections: Mutex<Vec<&'static str>>,
}

impl State {
    fn new(config: MockEngineConfig, routes: Vec<MockRoute>, generation: CancellationToken) -> Self {
        let engine = Engine {
            has_context: config.routes_xml.is_some(),
            routes,
            enabled: false,
            holding: config.suspend_on_startup,
            breakpoints: BTreeMap::new(),
            exchanges: BTreeMap::new(),
            completed: Vec::new(),
            next_exchange: 1,
            next_uid: 1,
            settings: DebuggerSettings::default(),
        };
        Self {
            config,
            available: AtomicBool::new(true),
            connections: AtomicUsize::new(0),
            generation: Mutex::new(generation),
            engine: Mutex::new(engine),
            calls: Mutex::new(Vec::new()),
            rejections: Mutex::new(Vec::new()),
        }
    }

    fn handle(&self, command: Command) -> Result<Value, String> {
        lock(&self.calls, "State.handle").push(command.clone());
        {
            let mut rejections = lock(&self.rejections, "State.handle");
            if let Some(pos) = rejections.iter().position(|op| *op == command.name()) {
                rejections.remove(pos);
                return Err(format!("{} rejected", command.name()));
            }
        }
        if let Command::Hello = command {
            return Ok(json!({
                "debugger": self.config.debugger_available,
                "engine": self.config.engine_name,
            }));
        }
        lock(&self.engine, "State.handle").apply(command)
    }
}

#[derive(Debug, Clone)]
struct MockRoute {
    id: String,
    xml: String,
    steps: Vec<String>,
    started: bool,
}

#[derive(Debug, Clone)]
struct MockExchange {
    id: String,
    route: String,
    position: usize,
    body: String,
    headers: BTreeMap<String, String>,
    properties: BTreeMap<String, String>,
    suspended_at: Option<String>,
    queued: bool,
    stepping: bool,
    uid: i64,
}

#[derive(Debug, Clone)]
enum Operand {
    Body,
    Header(String),
}

#[derive(Debug, Clone)]
struct Condition {
    text: String,
    operand: Operand,
    negate: bool,
    expected: String,
}

impl Condition {
    fn parse(text: &str) -> Result<Self, String> {
        let (lhs, rhs, negate) = if let Some((lhs, rhs)) = text.split_once("!=") {
            (lhs, rhs, true)
        } else if let Some((lhs, rhs)) = text.split_once("==") {
            (lhs, rhs, false)
        } else {
            return Err(format!("unsupported condition {text:?}"));
        };

        let operand = match lhs.trim() {
            "${body}" => Operand::Body,
            other => {
                let name = other
                    .strip_prefix("${header.")
                    .or_else(|| other.strip_prefix("${headers."))
                    .and_then(|rest| rest.strip_suffix('}'))
                    .ok_or_else(|| format!("unsupported expression {other:?}"))?;
                Operand::Header(name.to_string())
            }
        };

        let rhs = rhs.trim();
        let expected = rhs
            .strip_prefix('\'')
            .and_then(|rest| rest.strip_suffix('\''))
            .or_else(|| rhs.strip_prefix('"').and_then(|rest| rest.strip_suffix('"')))
            .unwrap_or(rhs);

        Ok(Self {
            text: text.to_string(),
            operand,
            negate,
            expected: expected.to_string(),
        })
    }

    fn matches(&self, exchange: &MockExchange) -> bool {
        let actual = match &self.operand {
            Operand::Body => Some(exchange.body.as_str()),
            Operand::Header(name) => exchange.headers.get(name).map(String::as_str),
        };
        (actual == Some(self.expected.as_str())) != self.negate
    }
}

struct Engine {
    has_context: bool,
    routes: Vec<MockRoute>,
    enabled: bool,
    holding: bool,
    breakpoints: BTreeMap<String, Option<Condition>>,
    exchanges: BTreeMap<String, MockExchange>,
    completed: Vec<String>,
    next_exchange: u64,
    next_uid: i64,
    settings: DebuggerSettings,
}

impl Engine {
    fn reset(&mut self) {
        self.enabled = false;
        self.holding = false;
        self.breakpoints.clear();
        self.exchanges.clear();
        for route in &mut self.routes {
            route.started = true;
        }
        self.settings = DebuggerSettings::default();
    }

    fn route(&self, route_id: &str) -> Option<&MockRoute> {
        self.routes.iter().find(|route| route.id == route_id)
    }

    fn start_exchange(&mut self, route_id: &str, body: &str, headers: &[(&str, &str)]) -> String {
        let id = format!("EX-{:06}", self.next_exchange);
        self.next_exchange += 1;

        let started = self.route(route_id).map(|route| route.started).unwrap_or(false);
        let exchange = MockExchange {
            id: id.clone(),
            route: route_id.to_string(),
            position: 0,
            body: body.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            properties: BTreeMap::new(),
            suspended_at: None,
            queued: self.holding || !started,
            stepping: false,
            uid: 0,
        };
        let queued = exchange.queued;
        self.exchanges.insert(id.clone(), exchange);
        if !queued {
            self.advance(&id);
        }
        id
    }

    /// Run `exchange_id` forward from its current position until it suspends
    /// or falls off the end of its route.
    fn advance(&mut self, exchange_id: &str) {
        loop {
            let Some(exchange) = self.exchanges.get_mut(exchange_id) else {
                return;
            };
            let step = self
                .routes
                .iter()
                .find(|route| route.id == exchange.route)
                .and_then(|route| route.steps.get(exchange.position))
                .cloned();

            let Some(step) = step else {
                self.exchanges.remove(exchange_id);
                self.completed.push(exchange_id.to_string());
                return;
            };

            let hit = match self.breakpoints.get(&step) {
                Some(None) => true,
                Some(Some(condition)) => condition.matches(exchange),
                None => false,
            };
            if self.enabled && (exchange.stepping || hit) {
                exchange.suspended_at = Some(step);
                exchange.stepping = false;
                exchange.uid = self.next_uid;
                self.next_uid += 1;
                self.settings.debug_counter += 1;
                return;
            }
            exchange.position += 1;
        }
    }

    fn suspended_at(&self, step_id: &str) -> Option<&MockExchange> {
        self.exchanges
            .values()
            .find(|exchange| exchange.suspended_at.as_deref() == Some(step_id))
    }

    fn suspended_at_mut(&mut self, step_id: &str) -> Result<&mut MockExchange, String> {
        self.exchanges
            .values_mut()
            .find(|exchange| exchange.suspended_at.as_deref() == Some(step_id))
            .ok_or_else(|| format!("no message suspended at {step_id}"))
    }

    fn release(&mut self, step_id: &str, stepping: bool) {
        let Ok(exchange) = self.suspended_at_mut(step_id) else {
            return;
        };
        exchange.suspended_at = None;
        exchange.position += 1;
        exchange.stepping = stepping;
        let id = exchange.id.clone();
        self.advance(&id);
    }

    fn release_all(&mut self) {
        let steps: Vec<String> = self
            .exchanges
            .values()
            .filter_map(|exchange| exchange.suspended_at.clone())
            .collect();
        for step in steps {
            self.release(&step, false);
        }
    }

    fn run_queued(&mut self, route_id: Option<&str>) {
        if self.holding {
            return;
        }
        let queued: Vec<String> = self
            .exchanges
            .values()
            .filter(|exchange| exchange.queued)
            .filter(|exchange| route_id.map_or(true, |route| exchange.route == route))
            .filter(|exchange| {
                self.route(&exchange.route)
                    .map(|route| route.started)
                    .unwrap_or(false)
            })
            .map(|exchange| exchange.id.clone())
            .collect();
        for id in queued {
            if let Some(exchange) = self.exchanges.get_mut(&id) {
                exchange.queued = false;
            }
            self.advance(&id);
        }
    }

    fn snapshot(&self, exchange: &MockExchange) -> MessageSnapshot {
        MessageSnapshot {
            uid: exchange.uid,
            timestamp: "2024-01-01T00:00:00.000+0000".to_string(),
            route_id: exchange.route.clone(),
            to_node: exchange.suspended_at.clone().unwrap_or_default(),
            exchange_id: exchange.id.clone(),
            headers: exchange
                .headers
                .iter()
                .map(|(key, value)| MessageHeader {
                    key: key.clone(),
                    type_name: Some("java.lang.String".to_string()),
                    value: value.clone(),
                })
                .collect(),
            body: Some(exchange.body.clone()),
            exchange_properties: exchange
                .properties
                .iter()
                .map(|(name, value)| ExchangeProperty {
                    name: name.clone(),
                    type_name: Some("java.lang.String".to_string()),
                    value: value.clone(),
                })
                .collect(),
            exchange_variables: Vec::new(),
        }
    }

    fn routes_xml(&self) -> Option<String> {
        if !self.has_context {
            return None;
        }
        let mut xml = String::from("<routes>\n");
        for route in &self.routes {
            xml.push_str("  ");
            xml.push_str(&route.xml);
            xml.push('\n');
        }
        xml.push_str("</routes>");
        Some(xml)
    }

    fn route_mut(&mut self, route_id: &str) -> Result<&mut MockRoute, String> {
        self.routes
            .iter_mut()
            .find(|route| route.id == route_id)
            .ok_or_else(|| format!("unknown route {route_id}"))
    }

    fn apply(&mut self, command: Command) -> Result<Value, String> {
        match command {
            Command::Hello => Ok(Value::Null),
            Command::EnableDebugger => {
                self.enabled = true;
                Ok(Value::Null)
            }
            Command::DisableDebugger => {
                self.enabled = false;
                self.release_all();
                Ok(Value::Null)
            }
            Command::IsEnabled => Ok(Value::Bool(self.enabled)),
            Command::SuspendedStepIds => {
                let ids: BTreeSet<&str> = self
                    .exchanges
                    .values()
                    .filter_map(|exchange| exchange.suspended_at.as_deref())
                    .collect();
                Ok(json!(ids))
            }
            Command::DumpSnapshot { step_id } => Ok(self
                .suspended_at(&step_id)
                .map(|exchange| Value::String(self.snapshot(exchange).to_xml()))
                .unwrap_or(Value::Null)),
            Command::DumpRoutes => Ok(self.routes_xml().map(Value::String).unwrap_or(Value::Null)),
            Command::AddBreakpoint { step_id, condition } => {
                let condition = condition.as_deref().map(Condition::parse).transpose()?;
                self.breakpoints.insert(step_id, condition);
                Ok(Value::Null)
            }
            Command::RemoveBreakpoint { step_id } => {
                self.breakpoints.remove(&step_id);
                Ok(Value::Null)
            }
            Command::Resume { step_id } => {
                self.release(&step_id, false);
                Ok(Value::Null)
            }
            Command::ResumeAll => {
                self.release_all();
                Ok(Value::Null)
            }
            Command::Step { step_id } => {
                self.release(&step_id, true);
                Ok(Value::Null)
            }
            Command::LiveRouteIds => {
                let ids: Vec<&str> = self.routes.iter().map(|route| route.id.as_str()).collect();
                Ok(json!(ids))
            }
            Command::SuspendRoute { route_id } => {
                self.route_mut(&route_id)?.started = false;
                Ok(Value::Null)
            }
            Command::ResumeRoute { route_id } => {
                self.route_mut(&route_id)?.started = true;
                self.run_queued(Some(&route_id));
                Ok(Value::Null)
            }
            Command::AttachDebugger => {
                self.holding = false;
                self.run_queued(None);
                Ok(Value::Null)
            }
            Command::SetMessageBody { step_id, body } => {
                self.suspended_at_mut(&step_id)?.body = body;
                Ok(Value::Null)
            }
            Command::SetMessageHeader {
                step_id,
                key,
                value,
            } => {
                self.suspended_at_mut(&step_id)?.headers.insert(key, value);
                Ok(Value::Null)
            }
            Command::SetExchangeProperty {
                step_id,
                key,
                value,
            } => {
                self.suspended_at_mut(&step_id)?
                    .properties
                    .insert(key, value);
                Ok(Value::Null)
            }
            Command::DebuggerSettings => {
                serde_json::to_value(&self.settings).map_err(|err| err.to_string())
            }
            Command::UpdateSetting { setting } => {
                match setting {
                    DebuggerSetting::LoggingLevel(level) => self.settings.logging_level = level,
                    DebuggerSetting::BodyMaxChars(max) => self.settings.body_max_chars = max,
                    DebuggerSetting::FallbackTimeout(secs) => self.settings.fallback_timeout = secs,
                    DebuggerSetting::BodyIncludeFiles(on) => self.settings.body_include_files = on,
                    DebuggerSetting::BodyIncludeStreams(on) => {
                        self.settings.body_include_streams = on
                    }
                    DebuggerSetting::ResetDebugCounter => self.settings.debug_counter = 0,
                }
                Ok(Value::Null)
            }
        }
    }
}

fn parse_routes(xml: &str) -> Result<Vec<MockRoute>, String> {
    let doc = roxmltree::Document::parse(xml).map_err(|err| err.to_string())?;
    let mut routes = Vec::new();
    for node in doc
        .descendants()
        .filter(|node| node.is_element() && node.tag_name().name() == "route")
    {
        let id = node
            .attribute("id")
            .ok_or_else(|| "route without id".to_string())?
            .to_string();
        let steps = node
            .descendants()
            .filter(|step| step.is_element())
            .filter(|step| !matches!(step.tag_name().name(), "route" | "from"))
            .filter_map(|step| step.attribute("id").map(str::to_string))
            .collect();
        routes.push(MockRoute {
            id,
            xml: xml[node.range()].to_string(),
            steps,
            started: true,
        });
    }
    Ok(routes)
}

async fn run(listener: TcpListener, state: Arc<State>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let Ok((socket, _)) = accepted else {
            continue;
        };
        state.connections.fetch_add(1, Ordering::SeqCst);
        if !state.available.load(Ordering::SeqCst) {
            drop(socket);
            continue;
        }

        let token = lock(&state.generation, "run").clone();
        tokio::spawn(serve(socket, state.clone(), token));
    }
}

async fn serve(socket: TcpStream, state: Arc<State>, token: CancellationToken) {
    let (reader, mut writer) = socket.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        let read = tokio::select! {
            _ = token.cancelled() => return,
            res = read_frame(&mut reader, &mut buf) => res,
        };
        if !matches!(read, Ok(true)) {
            return;
        }

        let (id, command) = match decode_request(&buf) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(target: "backlog.wire", error = %err, "mock engine received malformed request");
                return;
            }
        };
        let reply = match state.handle(command) {
            Ok(ok) => ReplyFrame {
                id,
                ok: Some(ok),
                error: None,
            },
            Err(error) => ReplyFrame {
                id,
                ok: None,
                error: Some(error),
            },
        };
        let Ok(bytes) = encode_reply(&reply) else {
            return;
        };
        if token.is_cancelled() || writer.write_all(&bytes).await.is_err() {
            return;
        }
    }
}
