use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{tcp::OwnedReadHalf, TcpStream},
    sync::{oneshot, Mutex},
};
use tokio_util::sync::CancellationToken;

use super::{
    codec::{decode_reply, encode_request, read_frame},
    snapshot::MessageSnapshot,
    types::{
        BacklogError, Command, DebuggerSetting, DebuggerSettings, EngineInfo, Result, RetryPolicy,
    },
};

#[derive(Debug, Clone)]
pub struct BacklogClientConfig {
    pub connect_timeout: Duration,
    pub reply_timeout: Duration,
    pub pending_capacity: usize,
}

impl Default for BacklogClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(10),
            pending_capacity: 64,
        }
    }
}

#[derive(Debug)]
struct Inner {
    address: String,
    engine: EngineInfo,
    writer: Mutex<tokio::net::tcp::OwnedWriteHalf>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    config: BacklogClientConfig,
}

/// Live connection to an engine's backlog debugger.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone, Debug)]
pub struct BacklogClient {
    inner: Arc<Inner>,
}

impl BacklogClient {
    /// Connect once, without retrying.
    ///
    /// Fails with [`BacklogError::NoDebugger`] when the engine is reachable but
    /// has no backlog debugger installed.
    pub async fn connect(address: &str, config: BacklogClientConfig) -> Result<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| BacklogError::Timeout)??;
        let _ = stream.set_nodelay(true);

        let (reader, writer) = stream.into_split();
        let shutdown = CancellationToken::new();
        let mut inner = Inner {
            address: address.to_string(),
            engine: EngineInfo {
                debugger: false,
                engine: String::new(),
            },
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::with_capacity(config.pending_capacity)),
            next_id: AtomicU64::new(1),
            shutdown,
            config,
        };

        // `hello` is answered before the read loop exists, so the reply can be
        // stored on `Inner` before it is shared.
        let mut reader = BufReader::new(reader);
        let engine = hello(&mut reader, &inner).await?;
        inner.engine = engine;
        if !inner.engine.debugger {
            return Err(BacklogError::NoDebugger(inner.address.clone()));
        }

        let inner = Arc::new(inner);
        tokio::spawn(read_loop(reader, inner.clone()));

        tracing::debug!(
            target: "backlog.wire",
            address = %inner.address,
            engine = %inner.engine.engine,
            "connected to backlog debugger"
        );
        Ok(Self { inner })
    }

    /// Connect, retrying `policy.attempts` times with a fixed delay.
    ///
    /// A missing debugger is not retried: the engine answered, it just cannot
    /// be debugged.
    pub async fn connect_with_retry(
        address: &str,
        config: BacklogClientConfig,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let attempts = policy.attempts.max(1);
        let mut last = None;
        for attempt in 1..=attempts {
            match Self::connect(address, config.clone()).await {
                Ok(client) => return Ok(client),
                Err(err @ BacklogError::NoDebugger(_)) => return Err(err),
                Err(err) => {
                    tracing::debug!(
                        target: "backlog.wire",
                        address,
                        attempt,
                        error = %err,
                        "connect attempt failed"
                    );
                    last = Some(err);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(policy.delay).await;
            }
        }

        Err(BacklogError::ConnectFailed {
            address: address.to_string(),
            attempts,
            last: last.map(|err| err.to_string()).unwrap_or_default(),
        })
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn engine(&self) -> &EngineInfo {
        &self.inner.engine
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// A token that is cancelled when the client is shut down, either
    /// explicitly via [`BacklogClient::shutdown`] or implicitly when the
    /// connection closes.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    async fn send_command(&self, command: Command) -> Result<Value> {
        if self.inner.shutdown.is_cancelled() {
            return Err(BacklogError::ConnectionClosed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(id, tx);
        }

        let frame = encode_request(id, &command)?;
        let written = {
            let mut writer = self.inner.writer.lock().await;
            writer.write_all(&frame).await
        };
        if let Err(err) = written {
            self.remove_pending(id).await;
            return Err(err.into());
        }

        tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                self.remove_pending(id).await;
                Err(BacklogError::Cancelled)
            }
            res = tokio::time::timeout(self.inner.config.reply_timeout, rx) => {
                match res {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(_closed)) => Err(BacklogError::ConnectionClosed),
                    Err(_elapsed) => {
                        self.remove_pending(id).await;
                        tracing::warn!(
                            target: "backlog.wire",
                            op = command.name(),
                            "engine did not reply in time"
                        );
                        Err(BacklogError::Timeout)
                    }
                }
            }
        }
    }

    async fn call<T: DeserializeOwned>(&self, command: Command) -> Result<T> {
        let value = self.send_command(command).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn call_unit(&self, command: Command) -> Result<()> {
        self.send_command(command).await.map(|_| ())
    }

    async fn remove_pending(&self, id: u64) {
        let mut pending = self.inner.pending.lock().await;
        pending.remove(&id);
    }

    pub async fn enable_debugger(&self) -> Result<()> {
        self.call_unit(Command::EnableDebugger).await
    }

    pub async fn disable_debugger(&self) -> Result<()> {
        self.call_unit(Command::DisableDebugger).await
    }

    pub async fn is_enabled(&self) -> Result<bool> {
        self.call(Command::IsEnabled).await
    }

    /// Step ids where a message is currently suspended.
    pub async fn suspended_step_ids(&self) -> Result<Vec<String>> {
        self.call(Command::SuspendedStepIds).await
    }

    /// Snapshot of the message suspended at `step_id`, or `None` when nothing
    /// is suspended there any more.
    pub async fn dump_snapshot(&self, step_id: &str) -> Result<Option<MessageSnapshot>> {
        let xml: Option<String> = self
            .call(Command::DumpSnapshot {
                step_id: step_id.to_string(),
            })
            .await?;
        match xml {
            Some(xml) if !xml.trim().is_empty() => MessageSnapshot::parse(&xml).map(Some),
            _ => Ok(None),
        }
    }

    /// Route definitions with source line annotations, or `None` when the
    /// engine has no routing context.
    pub async fn dump_routes(&self) -> Result<Option<String>> {
        self.call(Command::DumpRoutes).await
    }

    pub async fn add_breakpoint(&self, step_id: &str, condition: Option<&str>) -> Result<()> {
        self.call_unit(Command::AddBreakpoint {
            step_id: step_id.to_string(),
            condition: condition.map(str::to_string),
        })
        .await
    }

    pub async fn remove_breakpoint(&self, step_id: &str) -> Result<()> {
        self.call_unit(Command::RemoveBreakpoint {
            step_id: step_id.to_string(),
        })
        .await
    }

    pub async fn resume(&self, step_id: &str) -> Result<()> {
        self.call_unit(Command::Resume {
            step_id: step_id.to_string(),
        })
        .await
    }

    pub async fn resume_all(&self) -> Result<()> {
        self.call_unit(Command::ResumeAll).await
    }

    pub async fn step(&self, step_id: &str) -> Result<()> {
        self.call_unit(Command::Step {
            step_id: step_id.to_string(),
        })
        .await
    }

    pub async fn live_route_ids(&self) -> Result<Vec<String>> {
        self.call(Command::LiveRouteIds).await
    }

    pub async fn suspend_route(&self, route_id: &str) -> Result<()> {
        self.call_unit(Command::SuspendRoute {
            route_id: route_id.to_string(),
        })
        .await
    }

    pub async fn resume_route(&self, route_id: &str) -> Result<()> {
        self.call_unit(Command::ResumeRoute {
            route_id: route_id.to_string(),
        })
        .await
    }

    /// Release messages held by the engine's suspend-on-startup mode.
    pub async fn attach_debugger(&self) -> Result<()> {
        self.call_unit(Command::AttachDebugger).await
    }

    pub async fn set_message_body(&self, step_id: &str, body: &str) -> Result<()> {
        self.call_unit(Command::SetMessageBody {
            step_id: step_id.to_string(),
            body: body.to_string(),
        })
        .await
    }

    pub async fn set_message_header(&self, step_id: &str, key: &str, value: &str) -> Result<()> {
        self.call_unit(Command::SetMessageHeader {
            step_id: step_id.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
    }

    pub async fn set_exchange_property(&self, step_id: &str, key: &str, value: &str) -> Result<()> {
        self.call_unit(Command::SetExchangeProperty {
            step_id: step_id.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
    }

    pub async fn debugger_settings(&self) -> Result<DebuggerSettings> {
        self.call(Command::DebuggerSettings).await
    }

    pub async fn update_setting(&self, setting: DebuggerSetting) -> Result<()> {
        self.call_unit(Command::UpdateSetting { setting }).await
    }
}

async fn hello(reader: &mut BufReader<OwnedReadHalf>, inner: &Inner) -> Result<EngineInfo> {
    let exchange = async {
        let frame = encode_request(0, &Command::Hello)?;
        {
            let mut writer = inner.writer.lock().await;
            writer.write_all(&frame).await?;
        }

        let mut buf = Vec::new();
        if !read_frame(reader, &mut buf).await? {
            return Err(BacklogError::ConnectionClosed);
        }
        let reply = decode_reply(&buf)?;
        if reply.id != 0 {
            return Err(BacklogError::Protocol(format!(
                "unexpected reply id {} to hello",
                reply.id
            )));
        }
        let info: EngineInfo = serde_json::from_value(reply.into_result()?)?;
        Ok::<_, BacklogError>(info)
    };

    tokio::time::timeout(inner.config.connect_timeout, exchange)
        .await
        .map_err(|_| BacklogError::Timeout)?
}

async fn read_loop(mut reader: BufReader<OwnedReadHalf>, inner: Arc<Inner>) {
    let mut buf = Vec::new();

    loop {
        let read = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = read_frame(&mut reader, &mut buf) => res,
        };

        match read {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(target: "backlog.wire", address = %inner.address, "engine closed the connection");
                break;
            }
            Err(err) => {
                tracing::debug!(target: "backlog.wire", address = %inner.address, error = %err, "connection failed");
                break;
            }
        }

        let reply = match decode_reply(&buf) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(target: "backlog.wire", error = %err, "dropping malformed reply frame");
                break;
            }
        };

        let tx = {
            let mut pending = inner.pending.lock().await;
            pending.remove(&reply.id)
        };
        if let Some(tx) = tx {
            let _ = tx.send(reply.into_result());
        }
    }

    inner.shutdown.cancel();

    let pending = {
        let mut pending = inner.pending.lock().await;
        std::mem::take(&mut *pending)
    };
    for (_id, tx) in pending {
        let _ = tx.send(Err(BacklogError::ConnectionClosed));
    }
}
