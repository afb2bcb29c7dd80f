//! Session and connection management.
//!
//! A [`ConnectionManager`] holds at most one attached [`Session`]. The session
//! owns the engine connection, the route topology, the breakpoint registry and
//! the execution-unit tracker, and runs a single background poll loop that
//! turns the engine's polled state into [`SessionEvent`]s.
//!
//! Transport faults never surface per operation. They move the link to
//! [`LinkState::Faulted`]; the poll loop then clears every thread, reconnects
//! within a bounded budget and replays the registered breakpoints, or gives up
//! and leaves the session idle in [`LinkState::Abandoned`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backlog_config::AdapterConfig;
use backlog_wire::{
    BacklogClient, BacklogClientConfig, BacklogError, DebuggerSetting, DebuggerSettings,
    MessageSnapshot, RetryPolicy,
};
use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::breakpoints::{Breakpoint, BreakpointRegistry, BreakpointSpec, Resolution};
use crate::error::{SessionError, SessionResult};
use crate::events::{OutputCategory, SessionEvent, StopReason};
use crate::topology::Topology;
use crate::tracker::{ExchangeThread, ExecutionUnit, ExecutionUnitTracker, RouteThread, Suspension};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client: BacklogClientConfig,
    /// Budget for the initial attach.
    pub connect: RetryPolicy,
    /// Budget for reconnecting after a transport fault.
    pub reconnect: RetryPolicy,
    pub poll_interval: Duration,
    pub join_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            client: BacklogClientConfig::default(),
            connect: RetryPolicy::default(),
            reconnect: RetryPolicy {
                attempts: 50,
                delay: Duration::from_millis(100),
            },
            poll_interval: Duration::from_secs(1),
            join_timeout: Duration::from_secs(2),
        }
    }
}

impl From<&AdapterConfig> for SessionOptions {
    fn from(config: &AdapterConfig) -> Self {
        Self {
            client: BacklogClientConfig {
                reply_timeout: config.attach.reply_timeout(),
                ..BacklogClientConfig::default()
            },
            connect: RetryPolicy {
                attempts: config.attach.connect_attempts,
                delay: config.attach.connect_delay(),
            },
            reconnect: RetryPolicy {
                attempts: config.session.reconnect_attempts,
                delay: config.session.reconnect_delay(),
            },
            poll_interval: config.session.poll_interval(),
            join_timeout: config.session.join_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No session.
    Detached,
    Connected,
    Faulted,
    Reconnecting,
    /// Reconnection budget exhausted; the session stays idle until detach.
    Abandoned,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Exchange,
    Route,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub id: i64,
    pub kind: UnitKind,
    pub name: String,
}

/// The single frame of a suspended message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrameInfo {
    pub id: i64,
    pub step_id: String,
    pub source: Option<String>,
    pub line: Option<u32>,
}

pub struct ConnectionManager {
    options: SessionOptions,
    events: mpsc::UnboundedSender<SessionEvent>,
    attach_lock: tokio::sync::Mutex<()>,
    session: RwLock<Option<Arc<Session>>>,
}

impl ConnectionManager {
    pub fn new(options: SessionOptions) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let manager = Self {
            options,
            events,
            attach_lock: tokio::sync::Mutex::new(()),
            session: RwLock::new(None),
        };
        (manager, rx)
    }

    fn active(&self) -> SessionResult<Arc<Session>> {
        self.session.read().clone().ok_or(SessionError::NotAttached)
    }

    pub fn is_attached(&self) -> bool {
        self.session.read().is_some()
    }

    pub fn link_state(&self) -> LinkState {
        self.active()
            .map(|session| session.link_state())
            .unwrap_or(LinkState::Detached)
    }

    /// Connect to the engine at `address` (`host:port`) and start polling.
    ///
    /// Idempotent: while a session exists this returns `true` without
    /// reconnecting. On failure a diagnostic output event is emitted.
    pub async fn attach(&self, address: &str) -> bool {
        let _guard = self.attach_lock.lock().await;
        if self.is_attached() {
            tracing::debug!(target: "backlog.session", address, "already attached");
            return true;
        }

        tracing::info!(target: "backlog.session", address, "attaching to backlog debugger");
        let connected =
            BacklogClient::connect_with_retry(address, self.options.client.clone(), self.options.connect)
                .await;
        let started = match connected {
            Ok(client) => {
                Session::start(address, client, self.options.clone(), self.events.clone()).await
            }
            Err(err) => Err(err),
        };

        match started {
            Ok(session) => {
                *self.session.write() = Some(session);
                true
            }
            Err(err) => {
                tracing::error!(target: "backlog.session", address, error = %err, "attach failed");
                let _ = self.events.send(SessionEvent::Output {
                    category: OutputCategory::Stderr,
                    output: attach_failure_message(address, &err),
                });
                false
            }
        }
    }

    /// Replace the breakpoints of `source`. Without a session every entry is
    /// unverified and nothing is kept.
    pub async fn set_breakpoints(&self, source: &str, specs: &[BreakpointSpec]) -> Vec<Breakpoint> {
        match self.active() {
            Ok(session) => session.set_breakpoints(source, specs).await,
            Err(_) => {
                let registry = BreakpointRegistry::new();
                let mut breakpoints = registry.prepare(source, specs);
                for bp in &mut breakpoints {
                    bp.apply(Resolution::NoTopology);
                }
                breakpoints
            }
        }
    }

    pub async fn remove_breakpoint(&self, id: i64) -> SessionResult<()> {
        self.active()?.remove_breakpoint(id).await
    }

    pub fn list_execution_units(&self) -> Vec<UnitInfo> {
        let Ok(session) = self.active() else {
            return Vec::new();
        };
        session
            .tracker
            .list()
            .into_iter()
            .map(|unit| match unit {
                ExecutionUnit::Exchange(thread) => UnitInfo {
                    id: thread.id,
                    kind: UnitKind::Exchange,
                    name: thread.exchange_id,
                },
                ExecutionUnit::Route(thread) => UnitInfo {
                    id: thread.id,
                    kind: UnitKind::Route,
                    name: thread.route_id,
                },
            })
            .collect()
    }

    /// Resume one execution unit, or everything when `thread_id` is `None`.
    pub async fn resume(&self, thread_id: Option<i64>) -> SessionResult<()> {
        self.active()?.resume(thread_id).await
    }

    /// Pause one route, or every route when `thread_id` is `None`.
    pub async fn pause(&self, thread_id: Option<i64>) -> SessionResult<()> {
        self.active()?.pause(thread_id).await
    }

    pub async fn step(&self, thread_id: i64) -> SessionResult<()> {
        self.active()?.step(thread_id).await
    }

    /// Snapshot of the message suspended at `step_id`, if one still is.
    pub async fn snapshot(&self, step_id: &str) -> SessionResult<Option<MessageSnapshot>> {
        self.active()?.snapshot(step_id).await
    }

    pub fn exchange(&self, thread_id: i64) -> Option<ExchangeThread> {
        self.active().ok()?.tracker.exchange(thread_id)
    }

    pub fn stack_frame(&self, thread_id: i64) -> SessionResult<Option<StackFrameInfo>> {
        Ok(self.active()?.stack_frame(thread_id))
    }

    pub async fn set_message_body(&self, thread_id: i64, body: &str) -> SessionResult<()> {
        let session = self.active()?;
        let (thread, client) = session.suspended(thread_id)?;
        let result = client.set_message_body(&thread.step_id, body).await;
        session.after_mutation(&client, &thread, result).await
    }

    pub async fn set_message_header(&self, thread_id: i64, key: &str, value: &str) -> SessionResult<()> {
        let session = self.active()?;
        let (thread, client) = session.suspended(thread_id)?;
        let result = client.set_message_header(&thread.step_id, key, value).await;
        session.after_mutation(&client, &thread, result).await
    }

    pub async fn set_exchange_property(&self, thread_id: i64, key: &str, value: &str) -> SessionResult<()> {
        let session = self.active()?;
        let (thread, client) = session.suspended(thread_id)?;
        let result = client.set_exchange_property(&thread.step_id, key, value).await;
        session.after_mutation(&client, &thread, result).await
    }

    pub async fn debugger_settings(&self) -> SessionResult<DebuggerSettings> {
        let session = self.active()?;
        let client = session.gateway().ok_or(SessionError::NotAttached)?;
        match client.debugger_settings().await {
            Ok(settings) => Ok(settings),
            Err(err) => {
                if err.is_transport_fault() {
                    session.mark_faulted(&err);
                }
                Err(err.into())
            }
        }
    }

    pub async fn update_debugger_setting(&self, setting: DebuggerSetting) -> SessionResult<()> {
        let session = self.active()?;
        let Some(client) = session.gateway() else {
            return Ok(());
        };
        session.absorb(client.update_setting(setting).await)?;
        Ok(())
    }

    /// Release messages held by the engine's suspend-on-startup mode.
    pub async fn configuration_done(&self) -> SessionResult<()> {
        let session = self.active()?;
        let Some(client) = session.gateway() else {
            return Ok(());
        };
        session.absorb(client.attach_debugger().await)?;
        Ok(())
    }

    /// Stop polling, disable the remote debugger and drop the session.
    /// Idempotent.
    pub async fn terminate(&self) {
        let session = self.session.write().take();
        if let Some(session) = session {
            session.shutdown().await;
            tracing::info!(target: "backlog.session", address = %session.address, "session terminated");
        }
    }
}

fn attach_failure_message(address: &str, err: &BacklogError) -> String {
    format!(
        "Error when trying to connect the backlog debugger: {err}\n\
         Please check that the engine under debug meets the following requirements:\n \
         - the backlog debugger is installed and enabled\n \
         - its debugger endpoint is reachable at {address}\n\
         The adapter log may contain more details (see `logging.file`).\n"
    )
}

/// Counts in-flight step commands; the poll loop reports no new stops while
/// any is pending.
struct SteppingGuard<'a>(&'a AtomicUsize);

impl<'a> SteppingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for SteppingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Session {
    address: String,
    options: SessionOptions,
    gateway: RwLock<Option<BacklogClient>>,
    topology: RwLock<Topology>,
    registry: BreakpointRegistry,
    tracker: ExecutionUnitTracker,
    /// Step ids already reported as stopped.
    notified: DashSet<String>,
    stepping: AtomicUsize,
    /// Breakpoints were committed without reaching the engine.
    replay_pending: AtomicBool,
    link: Mutex<LinkState>,
    wake: Notify,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<SessionEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    async fn start(
        address: &str,
        client: BacklogClient,
        options: SessionOptions,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<Self>, BacklogError> {
        let topology = match prepare(&client).await {
            Ok(topology) => topology,
            Err(err) => {
                client.shutdown();
                return Err(err);
            }
        };

        let session = Arc::new(Session {
            address: address.to_string(),
            options,
            gateway: RwLock::new(Some(client)),
            topology: RwLock::new(topology),
            registry: BreakpointRegistry::new(),
            tracker: ExecutionUnitTracker::new(),
            notified: DashSet::new(),
            stepping: AtomicUsize::new(0),
            replay_pending: AtomicBool::new(false),
            link: Mutex::new(LinkState::Connected),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            events,
            task: Mutex::new(None),
        });

        let handle = tokio::spawn(session.clone().poll_loop());
        *session.task.lock() = Some(handle);
        Ok(session)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn gateway(&self) -> Option<BacklogClient> {
        self.gateway.read().clone()
    }

    fn link_state(&self) -> LinkState {
        *self.link.lock()
    }

    fn transition(&self, from: LinkState, to: LinkState) -> bool {
        let mut link = self.link.lock();
        if *link == from {
            *link = to;
            true
        } else {
            false
        }
    }

    fn is_stepping(&self) -> bool {
        self.stepping.load(Ordering::SeqCst) > 0
    }

    fn mark_faulted(&self, err: &BacklogError) {
        if self.transition(LinkState::Connected, LinkState::Faulted) {
            tracing::warn!(
                target: "backlog.session",
                address = %self.address,
                error = %err,
                "connection to engine lost"
            );
        }
        self.wake.notify_one();
    }

    /// Turn a transport fault into `Ok(None)` after flagging the link.
    fn absorb<T>(&self, result: Result<T, BacklogError>) -> SessionResult<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_transport_fault() => {
                self.mark_faulted(&err);
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.options.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.wake.notified() => {}
            }

            match self.link_state() {
                LinkState::Connected => {}
                LinkState::Faulted => {
                    self.recover().await;
                    continue;
                }
                _ => break,
            }

            let Some(client) = self.gateway() else {
                continue;
            };
            match self.tick(&client).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(target: "backlog.session", "remote debugger disabled; polling stopped");
                    break;
                }
                Err(err) if err.is_transport_fault() => self.mark_faulted(&err),
                Err(err) => {
                    tracing::warn!(target: "backlog.session", error = %err, "poll failed");
                }
            }
        }

        tracing::debug!(target: "backlog.session", "poll loop exited");
    }

    /// One poll. Returns `false` once the remote debugger is disabled.
    async fn tick(&self, client: &BacklogClient) -> Result<bool, BacklogError> {
        if !client.is_enabled().await? {
            return Ok(false);
        }

        if self.replay_pending.swap(false, Ordering::SeqCst) {
            let topology = self.topology.read().clone();
            if let Err(err) = self.replay(client, &topology).await {
                self.replay_pending.store(true, Ordering::SeqCst);
                return Err(err);
            }
        }

        if !self.is_stepping() {
            let suspended = client.suspended_step_ids().await?;
            let mut interrupted = false;
            for step_id in &suspended {
                if self.is_stepping() || self.cancel.is_cancelled() {
                    interrupted = true;
                    break;
                }
                if self.notified.contains(step_id) {
                    continue;
                }
                let snapshot = match client.dump_snapshot(step_id).await {
                    Ok(Some(snapshot)) => snapshot,
                    // The message moved on between the two queries.
                    Ok(None) => continue,
                    Err(err) if err.is_transport_fault() => return Err(err),
                    Err(err) => {
                        tracing::warn!(
                            target: "backlog.session",
                            step = %step_id,
                            error = %err,
                            "skipping unreadable snapshot"
                        );
                        continue;
                    }
                };
                self.notified.insert(step_id.clone());
                self.on_suspended(step_id.clone(), snapshot);
            }
            if !interrupted && !self.is_stepping() {
                self.forget_released(&suspended);
            }
        }

        let live = client.live_route_ids().await?;
        let diff = self.tracker.sync_routes(&live);
        for id in diff.exited {
            self.emit(SessionEvent::exited(id));
        }
        for id in diff.started {
            self.emit(SessionEvent::started(id));
        }
        Ok(true)
    }

    fn on_suspended(&self, step_id: String, snapshot: MessageSnapshot) {
        let (source, line) = match self.registry.find_by_step(&step_id) {
            Some(bp) => (Some(bp.source), Some(bp.line)),
            None => {
                let line = self
                    .topology
                    .read()
                    .snapshot()
                    .and_then(|topology| topology.node(&step_id))
                    .and_then(|node| node.line);
                (None, line)
            }
        };

        tracing::debug!(
            target: "backlog.session",
            step = %step_id,
            exchange = %snapshot.exchange_id,
            "message suspended"
        );
        let upsert = self.tracker.upsert_exchange(Suspension {
            step_id,
            snapshot,
            source,
            line,
        });
        if upsert.created {
            self.emit(SessionEvent::started(upsert.id));
        }
        self.emit(SessionEvent::Stopped {
            thread_id: upsert.id,
            reason: StopReason::Breakpoint,
            all_threads_stopped: false,
        });
    }

    /// Drop what the engine no longer holds: notified steps without a
    /// suspended message, and exchange threads whose step was released
    /// behind our back (fallback timeout, another debugger client).
    fn forget_released(&self, suspended: &[String]) {
        let held: HashSet<&str> = suspended.iter().map(String::as_str).collect();
        self.notified.retain(|step_id| held.contains(step_id.as_str()));
        for id in self
            .tracker
            .retain_exchanges(|thread| held.contains(thread.step_id.as_str()))
        {
            tracing::debug!(target: "backlog.session", thread_id = id, "message released by the engine");
            self.emit(SessionEvent::exited(id));
        }
    }

    async fn recover(&self) {
        if !self.transition(LinkState::Faulted, LinkState::Reconnecting) {
            return;
        }
        let stale = self.gateway.write().take();
        if let Some(stale) = stale {
            stale.shutdown();
        }
        for id in self.tracker.clear() {
            self.emit(SessionEvent::exited(id));
        }
        self.notified.clear();
        // Restoring replays the whole registry.
        self.replay_pending.store(false, Ordering::SeqCst);

        let policy = self.options.reconnect;
        let attempts = policy.attempts.max(1);
        for attempt in 1..=attempts {
            if self.cancel.is_cancelled() {
                return;
            }
            match BacklogClient::connect(&self.address, self.options.client.clone()).await {
                Ok(client) => match self.restore(&client).await {
                    Ok(()) => {
                        if self.cancel.is_cancelled() {
                            client.shutdown();
                            return;
                        }
                        *self.gateway.write() = Some(client);
                        self.transition(LinkState::Reconnecting, LinkState::Connected);
                        tracing::info!(
                            target: "backlog.session",
                            address = %self.address,
                            attempt,
                            "reconnected to engine"
                        );
                        return;
                    }
                    Err(err) => {
                        client.shutdown();
                        tracing::debug!(target: "backlog.session", attempt, error = %err, "restoring session failed");
                    }
                },
                Err(err) => {
                    tracing::debug!(target: "backlog.session", attempt, error = %err, "reconnect attempt failed");
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(policy.delay) => {}
                }
            }
        }

        if self.transition(LinkState::Reconnecting, LinkState::Abandoned) {
            tracing::error!(
                target: "backlog.session",
                address = %self.address,
                attempts,
                "giving up on reconnecting to the engine"
            );
        }
    }

    /// Bring a fresh connection to the state the session expects: debugger
    /// enabled, topology reloaded, every registered breakpoint re-resolved and
    /// re-registered.
    async fn restore(&self, client: &BacklogClient) -> Result<(), BacklogError> {
        let topology = prepare(client).await?;
        *self.topology.write() = topology.clone();
        self.replay(client, &topology).await
    }

    /// Re-resolve every registered breakpoint against `topology` and register
    /// it on the engine. Only transport faults are returned.
    async fn replay(&self, client: &BacklogClient, topology: &Topology) -> Result<(), BacklogError> {
        for before in self.registry.all() {
            let mut bp = before.clone();
            let resolution = match Resolution::resolve(topology, &bp.source, bp.line) {
                Resolution::Resolved(step_id) => {
                    match client.add_breakpoint(&step_id, bp.condition.as_deref()).await {
                        Ok(()) => Resolution::Resolved(step_id),
                        Err(err) if err.is_transport_fault() => return Err(err),
                        Err(err) => Resolution::Internal(err.to_string()),
                    }
                }
                other => other,
            };
            bp.apply(resolution);
            if self.registry.update(&before, &bp) {
                continue;
            }

            // Replaced or removed meanwhile: undo our registration if nothing
            // references the step any more, and send the newer entry next tick.
            self.replay_pending.store(true, Ordering::SeqCst);
            if let Some(step_id) = bp.step_id.as_deref() {
                if self.registry.find_by_step(step_id).is_none() {
                    match client.remove_breakpoint(step_id).await {
                        Err(err) if err.is_transport_fault() => return Err(err),
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    async fn set_breakpoints(&self, source: &str, specs: &[BreakpointSpec]) -> Vec<Breakpoint> {
        let topology = self.topology.read().clone();
        let client = self.gateway();
        let mut breakpoints = self.registry.prepare(source, specs);
        let mut unsent = false;

        for bp in &mut breakpoints {
            let resolution = match Resolution::resolve(&topology, source, bp.line) {
                Resolution::Resolved(step_id) => match &client {
                    Some(client) => {
                        match client.add_breakpoint(&step_id, bp.condition.as_deref()).await {
                            Ok(()) => Resolution::Resolved(step_id),
                            // Registered on replay once the link is back.
                            Err(err) if err.is_transport_fault() => {
                                self.mark_faulted(&err);
                                unsent = true;
                                Resolution::Resolved(step_id)
                            }
                            Err(err) => Resolution::Internal(err.to_string()),
                        }
                    }
                    // Reconnecting: the next replay re-resolves and sends it.
                    None => {
                        unsent = true;
                        Resolution::Resolved(step_id)
                    }
                },
                other => other,
            };
            bp.apply(resolution);
        }

        let stale = self.registry.commit(source, &breakpoints);
        if unsent {
            self.replay_pending.store(true, Ordering::SeqCst);
            self.wake.notify_one();
        }
        if let Some(client) = client {
            for step_id in stale {
                if let Err(err) = self.absorb(client.remove_breakpoint(&step_id).await) {
                    tracing::warn!(target: "backlog.session", step = %step_id, error = %err, "failed to remove breakpoint");
                }
            }
        }
        breakpoints
    }

    async fn remove_breakpoint(&self, id: i64) -> SessionResult<()> {
        let Some((removed, still_used)) = self.registry.remove_by_id(id) else {
            return Ok(());
        };
        let (Some(step_id), false, Some(client)) = (removed.step_id, still_used, self.gateway())
        else {
            return Ok(());
        };
        self.absorb(client.remove_breakpoint(&step_id).await)?;
        Ok(())
    }

    async fn resume(&self, thread_id: Option<i64>) -> SessionResult<()> {
        let client = self.gateway();
        let Some(thread_id) = thread_id else {
            for id in self.tracker.drain_exchanges() {
                self.emit(SessionEvent::exited(id));
            }
            if let Some(client) = &client {
                self.absorb(client.resume_all().await)?;
            }
            self.notified.clear();

            for route in self.tracker.routes().into_iter().filter(|route| route.paused) {
                if let Err(err) = self.resume_route(client.as_ref(), &route).await {
                    tracing::warn!(target: "backlog.session", route = %route.route_id, error = %err, "failed to resume route");
                }
            }
            return Ok(());
        };

        match self.tracker.get(thread_id) {
            None => {
                tracing::debug!(target: "backlog.session", thread_id, "resume for unknown thread ignored");
            }
            Some(ExecutionUnit::Exchange(thread)) => {
                self.tracker.remove(thread_id);
                self.emit(SessionEvent::exited(thread_id));
                let resumed = match &client {
                    Some(client) => self.absorb(client.resume(&thread.step_id).await).map(drop),
                    None => Ok(()),
                };
                self.notified.remove(&thread.step_id);
                resumed?;
            }
            Some(ExecutionUnit::Route(route)) => self.resume_route(client.as_ref(), &route).await?,
        }
        Ok(())
    }

    async fn resume_route(&self, client: Option<&BacklogClient>, route: &RouteThread) -> SessionResult<()> {
        let Some(client) = client else {
            return Ok(());
        };
        if self.absorb(client.resume_route(&route.route_id).await)?.is_some() {
            self.tracker.set_route_paused(route.id, false);
            self.emit(SessionEvent::Continued {
                thread_id: route.id,
                all_threads_continued: false,
            });
        }
        Ok(())
    }

    async fn pause(&self, thread_id: Option<i64>) -> SessionResult<()> {
        let routes = match thread_id {
            None => self.tracker.routes(),
            Some(id) => match self.tracker.get(id) {
                Some(ExecutionUnit::Route(route)) => vec![route],
                Some(ExecutionUnit::Exchange(_)) => {
                    tracing::debug!(target: "backlog.session", thread_id = id, "suspended messages cannot be paused");
                    Vec::new()
                }
                None => Vec::new(),
            },
        };
        let Some(client) = self.gateway() else {
            return Ok(());
        };

        for route in routes {
            match self.absorb(client.suspend_route(&route.route_id).await) {
                Ok(Some(())) => {
                    self.tracker.set_route_paused(route.id, true);
                    self.emit(SessionEvent::Stopped {
                        thread_id: route.id,
                        reason: StopReason::Pause,
                        all_threads_stopped: false,
                    });
                }
                Ok(None) => break,
                Err(err) if thread_id.is_none() => {
                    tracing::warn!(target: "backlog.session", route = %route.route_id, error = %err, "failed to pause route");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Step the message of `thread_id` to the next step.
    ///
    /// When the current step is the last of its route the thread is removed
    /// and its exit reported before the engine is asked to step, so no stop
    /// follows. Otherwise the thread keeps its id and the poll loop reports it
    /// stopped at the next step.
    async fn step(&self, thread_id: i64) -> SessionResult<()> {
        let Some(thread) = self.tracker.exchange(thread_id) else {
            tracing::debug!(target: "backlog.session", thread_id, "step for unknown thread ignored");
            return Ok(());
        };
        let Some(client) = self.gateway() else {
            return Ok(());
        };

        let _stepping = SteppingGuard::enter(&self.stepping);
        let last = self
            .topology
            .read()
            .snapshot()
            .is_some_and(|topology| topology.is_last_in_route(&thread.step_id));
        if last {
            self.tracker.remove(thread_id);
            self.emit(SessionEvent::exited(thread_id));
        }

        self.absorb(client.step(&thread.step_id).await)?;
        self.notified.remove(&thread.step_id);
        Ok(())
    }

    async fn snapshot(&self, step_id: &str) -> SessionResult<Option<MessageSnapshot>> {
        let Some(client) = self.gateway() else {
            return Ok(None);
        };
        Ok(self.absorb(client.dump_snapshot(step_id).await)?.flatten())
    }

    fn stack_frame(&self, thread_id: i64) -> Option<StackFrameInfo> {
        let thread = self.tracker.exchange(thread_id)?;
        let node = self
            .topology
            .read()
            .snapshot()
            .and_then(|topology| topology.node(&thread.step_id).cloned());
        Some(StackFrameInfo {
            id: thread.id,
            source: thread
                .source
                .clone()
                .or_else(|| node.as_ref().and_then(|node| node.source.clone())),
            line: thread.line.or_else(|| node.as_ref().and_then(|node| node.line)),
            step_id: thread.step_id,
        })
    }

    fn suspended(&self, thread_id: i64) -> SessionResult<(ExchangeThread, BacklogClient)> {
        let thread = self
            .tracker
            .exchange(thread_id)
            .ok_or(SessionError::UnknownThread(thread_id))?;
        let client = self.gateway().ok_or(SessionError::NotAttached)?;
        Ok((thread, client))
    }

    /// Finish a message mutation by refreshing the thread's captured snapshot.
    async fn after_mutation(
        &self,
        client: &BacklogClient,
        thread: &ExchangeThread,
        result: Result<(), BacklogError>,
    ) -> SessionResult<()> {
        if self.absorb(result)?.is_none() {
            return Ok(());
        }
        let refreshed = self.absorb(client.dump_snapshot(&thread.step_id).await)?.flatten();
        if let Some(snapshot) = refreshed.filter(|snapshot| snapshot.exchange_id == thread.exchange_id) {
            self.tracker.update_snapshot(thread.id, snapshot);
        }
        Ok(())
    }

    async fn shutdown(&self) {
        *self.link.lock() = LinkState::Terminated;
        self.cancel.cancel();

        let client = self.gateway.write().take();
        if let Some(client) = client {
            match tokio::time::timeout(self.options.join_timeout, client.disable_debugger()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::debug!(target: "backlog.session", error = %err, "failed to disable remote debugger");
                }
                Err(_) => {
                    tracing::debug!(target: "backlog.session", "timed out disabling remote debugger");
                }
            }
            client.shutdown();
        }

        let handle = self.task.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(self.options.join_timeout, &mut handle).await.is_err() {
                tracing::warn!(target: "backlog.session", "poll loop did not stop in time; aborting it");
                handle.abort();
            }
        }
    }
}

/// Enable the remote debugger and load the route topology.
async fn prepare(client: &BacklogClient) -> Result<Topology, BacklogError> {
    client.enable_debugger().await?;
    let dump = client.dump_routes().await?;
    let topology = Topology::from_dump(dump.as_deref());
    match &topology {
        Topology::Absent => {
            tracing::warn!(target: "backlog.session", "no routes found in the engine");
        }
        Topology::Unreadable(cause) => {
            tracing::warn!(target: "backlog.session", error = %cause, "cannot parse route definitions");
        }
        Topology::Loaded(snapshot) => {
            tracing::debug!(target: "backlog.session", routes = snapshot.route_count(), "route topology loaded");
        }
    }
    Ok(topology)
}
