use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BacklogError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out waiting for engine reply")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("connection closed")]
    ConnectionClosed,

    /// The engine answered, but refused the request.
    #[error("engine rejected request: {0}")]
    Remote(String),

    #[error("no backlog debugger found on connection with {0}")]
    NoDebugger(String),

    #[error("could not connect to {address} after {attempts} attempts: {last}")]
    ConnectFailed {
        address: String,
        attempts: u32,
        last: String,
    },

    #[error("malformed message snapshot: {0}")]
    Snapshot(String),
}

impl BacklogError {
    /// Whether the error means the connection itself is unusable.
    ///
    /// Remote rejections and malformed payloads leave the connection intact.
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            BacklogError::Io(_)
                | BacklogError::Timeout
                | BacklogError::Cancelled
                | BacklogError::ConnectionClosed
        )
    }
}

pub type Result<T> = std::result::Result<T, BacklogError>;

/// Bounded retry used for the initial connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(200),
        }
    }
}

/// Reply to the `hello` exchange that opens every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub debugger: bool,
    #[serde(default)]
    pub engine: String,
}

/// Tunables of the remote debugger, as reported by `debuggerSettings`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebuggerSettings {
    pub logging_level: String,
    pub body_max_chars: i32,
    pub debug_counter: i64,
    pub fallback_timeout: i64,
    pub body_include_files: bool,
    pub body_include_streams: bool,
}

impl Default for DebuggerSettings {
    fn default() -> Self {
        Self {
            logging_level: "INFO".to_string(),
            body_max_chars: 128 * 1024,
            debug_counter: 0,
            fallback_timeout: 300,
            body_include_files: true,
            body_include_streams: false,
        }
    }
}

/// A single writable debugger setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "value", rename_all = "camelCase")]
pub enum DebuggerSetting {
    LoggingLevel(String),
    BodyMaxChars(i32),
    FallbackTimeout(i64),
    BodyIncludeFiles(bool),
    BodyIncludeStreams(bool),
    ResetDebugCounter,
}

/// Requests understood by the engine.
///
/// Encoded as `{"op": "<name>", "args": {...}}`; unit variants carry no `args`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "camelCase")]
pub enum Command {
    Hello,
    EnableDebugger,
    DisableDebugger,
    IsEnabled,
    SuspendedStepIds,
    #[serde(rename_all = "camelCase")]
    DumpSnapshot {
        step_id: String,
    },
    DumpRoutes,
    #[serde(rename_all = "camelCase")]
    AddBreakpoint {
        step_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        condition: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RemoveBreakpoint {
        step_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Resume {
        step_id: String,
    },
    ResumeAll,
    #[serde(rename_all = "camelCase")]
    Step {
        step_id: String,
    },
    LiveRouteIds,
    #[serde(rename_all = "camelCase")]
    SuspendRoute {
        route_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ResumeRoute {
        route_id: String,
    },
    AttachDebugger,
    #[serde(rename_all = "camelCase")]
    SetMessageBody {
        step_id: String,
        body: String,
    },
    #[serde(rename_all = "camelCase")]
    SetMessageHeader {
        step_id: String,
        key: String,
        value: String,
    },
    #[serde(rename_all = "camelCase")]
    SetExchangeProperty {
        step_id: String,
        key: String,
        value: String,
    },
    DebuggerSettings,
    UpdateSetting {
        setting: DebuggerSetting,
    },
}

impl Command {
    /// Wire name of the operation, used for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Hello => "hello",
            Command::EnableDebugger => "enableDebugger",
            Command::DisableDebugger => "disableDebugger",
            Command::IsEnabled => "isEnabled",
            Command::SuspendedStepIds => "suspendedStepIds",
            Command::DumpSnapshot { .. } => "dumpSnapshot",
            Command::DumpRoutes => "dumpRoutes",
            Command::AddBreakpoint { .. } => "addBreakpoint",
            Command::RemoveBreakpoint { .. } => "removeBreakpoint",
            Command::Resume { .. } => "resume",
            Command::ResumeAll => "resumeAll",
            Command::Step { .. } => "step",
            Command::LiveRouteIds => "liveRouteIds",
            Command::SuspendRoute { .. } => "suspendRoute",
            Command::ResumeRoute { .. } => "resumeRoute",
            Command::AttachDebugger => "attachDebugger",
            Command::SetMessageBody { .. } => "setMessageBody",
            Command::SetMessageHeader { .. } => "setMessageHeader",
            Command::SetExchangeProperty { .. } => "setExchangeProperty",
            Command::DebuggerSettings => "debuggerSettings",
            Command::UpdateSetting { .. } => "updateSetting",
        }
    }
}
