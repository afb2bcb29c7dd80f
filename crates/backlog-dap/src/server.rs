use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use backlog_config::AdapterConfig;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    breakpoints::{Breakpoint, BreakpointSpec},
    dap::{make_event, make_response, DapError, DapReader, DapWriter, Request},
    error::{SessionError, SessionResult},
    events::{OutputCategory, SessionEvent},
    session::{ConnectionManager, SessionOptions, UnitKind},
    variables::VariableStore,
};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Dap(#[from] DapError),
}

type Result<T> = std::result::Result<T, ServerError>;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub session: SessionOptions,
    /// Used when `attach` names neither `address` nor `host`/`port`.
    pub default_address: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::from(&AdapterConfig::default())
    }
}

impl From<&AdapterConfig> for ServerOptions {
    fn from(config: &AdapterConfig) -> Self {
        Self {
            session: SessionOptions::from(config),
            default_address: config.attach.address.clone(),
        }
    }
}

/// Run the adapter over stdio.
pub async fn run_stdio(config: &AdapterConfig) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    run(stdin, stdout, ServerOptions::from(config))
        .await
        .map_err(anyhow::Error::from)
}

struct Adapter {
    manager: ConnectionManager,
    variables: VariableStore,
    default_address: String,
}

enum Dispatch {
    Reply(Option<Value>),
    Attached,
    AttachFailed,
    Terminated,
}

pub async fn run<R, W>(reader: R, writer: W, options: ServerOptions) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let seq = Arc::new(AtomicI64::new(1));
    let (manager, events) = ConnectionManager::new(options.session);
    let adapter = Adapter {
        manager,
        variables: VariableStore::new(),
        default_address: options.default_address,
    };

    let writer_task = tokio::spawn(async move {
        let mut writer = DapWriter::new(writer);
        while let Some(msg) = out_rx.recv().await {
            if let Err(err) = writer.write_value(&msg).await {
                tracing::warn!(target: "backlog.dap", error = %err, "failed to write DAP message");
                break;
            }
        }
    });
    let event_task = spawn_event_task(events, out_tx.clone(), seq.clone());

    let mut reader = DapReader::new(reader);
    while let Some(request) = reader.read_request().await? {
        if request.message_type != "request" {
            continue;
        }
        tracing::debug!(target: "backlog.dap", command = %request.command, seq = request.seq, "request");

        match dispatch(&adapter, &request).await {
            Ok(Dispatch::Reply(body)) => send_response(&out_tx, &seq, &request, true, body, None),
            Ok(Dispatch::Attached) => {
                send_response(&out_tx, &seq, &request, true, None, None);
                send_event(&out_tx, &seq, "initialized", None);
            }
            Ok(Dispatch::AttachFailed) => send_response(
                &out_tx,
                &seq,
                &request,
                false,
                None,
                Some("failed to attach to the backlog debugger".to_string()),
            ),
            Ok(Dispatch::Terminated) => {
                send_response(&out_tx, &seq, &request, true, None, None);
                send_event(&out_tx, &seq, "terminated", None);
                break;
            }
            Err(err) => {
                tracing::debug!(target: "backlog.dap", command = %request.command, error = %err, "request failed");
                if request.command == "setVariable" {
                    let (name, body) = SessionEvent::Output {
                        category: OutputCategory::Stderr,
                        output: format!("{err}\n"),
                    }
                    .to_dap();
                    send_event(&out_tx, &seq, name, Some(body));
                }
                send_response(&out_tx, &seq, &request, false, None, Some(err.to_string()));
            }
        }
    }

    adapter.manager.terminate().await;
    event_task.abort();
    drop(out_tx);
    let _ = writer_task.await;
    Ok(())
}

async fn dispatch(adapter: &Adapter, request: &Request) -> SessionResult<Dispatch> {
    let manager = &adapter.manager;
    let body = match request.command.as_str() {
        "initialize" => Some(json!({
            "supportsConfigurationDoneRequest": true,
            "supportsConditionalBreakpoints": true,
            "supportsSetVariable": true,
            "supportsTerminateRequest": true,
            "supportsStepBack": false,
            "supportsEvaluateForHovers": false,
        })),
        "attach" => {
            let address = attach_address(&request.arguments, &adapter.default_address);
            return Ok(if manager.attach(&address).await {
                Dispatch::Attached
            } else {
                Dispatch::AttachFailed
            });
        }
        "configurationDone" => {
            if manager.is_attached() {
                manager.configuration_done().await?;
            }
            None
        }
        "setBreakpoints" => {
            let source = request
                .arguments
                .get("source")
                .and_then(|source| source.get("path").or_else(|| source.get("name")))
                .and_then(Value::as_str)
                .ok_or_else(|| invalid(request, "source.path"))?;
            let requested: Vec<Option<BreakpointSpec>> = request
                .arguments
                .get("breakpoints")
                .and_then(Value::as_array)
                .map(|arr| arr.iter().map(breakpoint_spec).collect())
                .unwrap_or_default();
            let specs: Vec<BreakpointSpec> = requested.iter().flatten().cloned().collect();
            let breakpoints = manager.set_breakpoints(source, &specs).await;
            let breakpoints = align_breakpoints(&requested, breakpoints.iter().map(breakpoint_json));
            Some(json!({ "breakpoints": breakpoints }))
        }
        "threads" => {
            let threads: Vec<Value> = manager
                .list_execution_units()
                .into_iter()
                .map(|unit| {
                    let name = match unit.kind {
                        UnitKind::Exchange => format!("Exchange {}", unit.name),
                        UnitKind::Route => format!("Route {}", unit.name),
                    };
                    json!({ "id": unit.id, "name": name })
                })
                .collect();
            Some(json!({ "threads": threads }))
        }
        "stackTrace" => {
            let thread_id = require_i64(request, "threadId")?;
            let frames: Vec<Value> = manager
                .stack_frame(thread_id)
                .unwrap_or(None)
                .into_iter()
                .map(|frame| {
                    let mut value = json!({
                        "id": frame.id,
                        "name": frame.step_id,
                        "line": frame.line.unwrap_or(0),
                        "column": 0,
                    });
                    if let (Some(path), Some(obj)) = (frame.source, value.as_object_mut()) {
                        let name = std::path::Path::new(&path)
                            .file_name()
                            .and_then(|name| name.to_str())
                            .unwrap_or(&path)
                            .to_string();
                        obj.insert("source".to_string(), json!({ "name": name, "path": path }));
                    }
                    value
                })
                .collect();
            Some(json!({ "stackFrames": frames, "totalFrames": frames.len() }))
        }
        "scopes" => {
            let frame_id = require_i64(request, "frameId")?;
            Some(json!({ "scopes": adapter.variables.scopes(frame_id) }))
        }
        "variables" => {
            let reference = require_i64(request, "variablesReference")?;
            let variables = adapter.variables.variables(manager, reference).await?;
            Some(json!({ "variables": variables }))
        }
        "setVariable" => {
            let reference = require_i64(request, "variablesReference")?;
            let name = require_str(request, "name")?;
            let value = require_str(request, "value")?;
            let value = adapter
                .variables
                .set_variable(manager, reference, name, value)
                .await?;
            Some(json!({ "value": value }))
        }
        "continue" => {
            let target = thread_target(request);
            adapter.variables.invalidate();
            manager.resume(target).await?;
            Some(json!({ "allThreadsContinued": target.is_none() }))
        }
        "pause" => {
            manager.pause(thread_target(request)).await?;
            None
        }
        "next" | "stepIn" | "stepOut" => {
            let thread_id = require_i64(request, "threadId")?;
            adapter.variables.invalidate();
            manager.step(thread_id).await?;
            None
        }
        "disconnect" | "terminate" => {
            manager.terminate().await;
            return Ok(Dispatch::Terminated);
        }
        other => {
            return Err(SessionError::InvalidRequest(format!("unsupported request {other}")));
        }
    };
    Ok(Dispatch::Reply(body))
}

/// `address` (`host:port`) wins; otherwise `host` and `port`, each falling
/// back to the configured default.
fn attach_address(arguments: &Value, default: &str) -> String {
    if let Some(address) = arguments.get("address").and_then(Value::as_str) {
        return address.to_string();
    }
    let (default_host, default_port) = default.rsplit_once(':').unwrap_or((default, "1099"));
    let host = arguments.get("host").and_then(Value::as_str);
    let port = arguments.get("port").and_then(Value::as_u64);
    match (host, port) {
        (None, None) => default.to_string(),
        (host, Some(port)) => format!("{}:{port}", host.unwrap_or(default_host)),
        (Some(host), None) => format!("{host}:{default_port}"),
    }
}

fn breakpoint_spec(value: &Value) -> Option<BreakpointSpec> {
    let line = value.get("line").and_then(Value::as_i64)?;
    let line = u32::try_from(line).ok().filter(|line| *line > 0)?;
    let condition = value
        .get("condition")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|condition| !condition.is_empty());
    Some(match condition {
        Some(condition) => BreakpointSpec::with_condition(line, condition),
        None => BreakpointSpec::new(line),
    })
}

/// One response entry per requested breakpoint, in request order. Entries
/// without a usable line are answered unverified.
fn align_breakpoints(requested: &[Option<BreakpointSpec>], mut resolved: impl Iterator<Item = Value>) -> Vec<Value> {
    requested
        .iter()
        .map(|spec| match spec.as_ref().and_then(|_| resolved.next()) {
            Some(value) => value,
            None => json!({
                "verified": false,
                "message": "breakpoint needs a positive line number",
            }),
        })
        .collect()
}

fn breakpoint_json(bp: &Breakpoint) -> Value {
    let mut value = json!({
        "id": bp.id,
        "verified": bp.verified,
        "line": bp.line,
        "source": { "path": bp.source },
    });
    if let (Some(message), Some(obj)) = (&bp.message, value.as_object_mut()) {
        obj.insert("message".to_string(), json!(message));
    }
    value
}

fn thread_target(request: &Request) -> Option<i64> {
    request
        .arguments
        .get("threadId")
        .and_then(Value::as_i64)
        .filter(|id| *id != 0)
}

fn invalid(request: &Request, field: &str) -> SessionError {
    SessionError::InvalidRequest(format!("{}.{field} is required", request.command))
}

fn require_i64(request: &Request, field: &str) -> SessionResult<i64> {
    request
        .arguments
        .get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| invalid(request, field))
}

fn require_str<'a>(request: &'a Request, field: &str) -> SessionResult<&'a str> {
    request
        .arguments
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| invalid(request, field))
}

fn send_event(tx: &mpsc::UnboundedSender<Value>, seq: &Arc<AtomicI64>, event: impl Into<String>, body: Option<Value>) {
    let s = seq.fetch_add(1, Ordering::Relaxed);
    let evt = make_event(s, event, body);
    let _ = tx.send(serde_json::to_value(evt).unwrap_or_else(|_| json!({})));
}

fn send_response(
    tx: &mpsc::UnboundedSender<Value>,
    seq: &Arc<AtomicI64>,
    request: &Request,
    success: bool,
    body: Option<Value>,
    message: Option<String>,
) {
    let s = seq.fetch_add(1, Ordering::Relaxed);
    let resp = make_response(s, request, success, body, message);
    let _ = tx.send(serde_json::to_value(resp).unwrap_or_else(|_| json!({})));
}

fn spawn_event_task(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    tx: mpsc::UnboundedSender<Value>,
    seq: Arc<AtomicI64>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let (name, body) = event.to_dap();
            send_event(&tx, &seq, name, Some(body));
        }
    })
}
