//! Scopes and variables of a suspended message.
//!
//! Each stack frame (one per suspended message, frame id = thread id) exposes
//! four scopes: the remote debugger's settings, the processor, the exchange
//! and the message. Nested containers (headers, exchange properties and
//! exchange variables) get their own `variablesReference`.

use std::collections::HashMap;

use backlog_wire::{DebuggerSetting, DebuggerSettings};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::{SessionError, SessionResult};
use crate::session::ConnectionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Debugger,
    Processor,
    Exchange,
    Message,
}

impl Scope {
    const ALL: [Scope; 4] = [Scope::Debugger, Scope::Processor, Scope::Exchange, Scope::Message];

    pub fn name(self) -> &'static str {
        match self {
            Scope::Debugger => "Debugger",
            Scope::Processor => "Processor",
            Scope::Exchange => "Exchange",
            Scope::Message => "Message",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum VarRef {
    Scope { thread_id: i64, scope: Scope },
    Headers { thread_id: i64 },
    Properties { thread_id: i64 },
    ExchangeVariables { thread_id: i64 },
}

struct HandleTable<T> {
    next: i64,
    map: HashMap<i64, T>,
    reverse: HashMap<T, i64>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self {
            next: 0,
            map: HashMap::new(),
            reverse: HashMap::new(),
        }
    }
}

impl<T: Copy + Eq + std::hash::Hash> HandleTable<T> {
    /// Handle for `value`, reusing the one handed out earlier.
    fn alloc(&mut self, value: T) -> i64 {
        if let Some(id) = self.reverse.get(&value) {
            return *id;
        }
        self.next += 1;
        let id = self.next;
        self.map.insert(id, value);
        self.reverse.insert(value, id);
        id
    }

    fn get(&self, id: i64) -> Option<T> {
        self.map.get(&id).copied()
    }

    fn clear(&mut self) {
        self.map.clear();
        self.reverse.clear();
    }
}

/// `variablesReference` bookkeeping; references are only valid while stopped.
#[derive(Default)]
pub struct VariableStore {
    handles: Mutex<HandleTable<VarRef>>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every handed-out reference, e.g. when execution continues.
    pub fn invalidate(&self) {
        self.handles.lock().clear();
    }

    fn alloc(&self, var_ref: VarRef) -> i64 {
        self.handles.lock().alloc(var_ref)
    }

    fn lookup(&self, reference: i64) -> SessionResult<VarRef> {
        self.handles
            .lock()
            .get(reference)
            .ok_or(SessionError::UnknownVariablesReference(reference))
    }

    pub fn scopes(&self, frame_id: i64) -> Vec<Value> {
        Scope::ALL
            .into_iter()
            .map(|scope| {
                let reference = self.alloc(VarRef::Scope {
                    thread_id: frame_id,
                    scope,
                });
                json!({
                    "name": scope.name(),
                    "variablesReference": reference,
                    "expensive": scope == Scope::Debugger,
                })
            })
            .collect()
    }

    pub async fn variables(&self, manager: &ConnectionManager, reference: i64) -> SessionResult<Vec<Value>> {
        let var_ref = self.lookup(reference)?;

        if let VarRef::Scope {
            scope: Scope::Debugger,
            ..
        } = var_ref
        {
            let settings = manager.debugger_settings().await?;
            return Ok(settings_variables(&settings));
        }

        let thread_id = match var_ref {
            VarRef::Scope { thread_id, .. }
            | VarRef::Headers { thread_id }
            | VarRef::Properties { thread_id }
            | VarRef::ExchangeVariables { thread_id } => thread_id,
        };
        // The message moved on or was resumed.
        let Some(thread) = manager.exchange(thread_id) else {
            return Ok(Vec::new());
        };
        let snapshot = &thread.snapshot;

        let variables = match var_ref {
            VarRef::Scope { scope, .. } => match scope {
                Scope::Debugger => Vec::new(),
                Scope::Processor => vec![
                    variable("Processor Id", &thread.step_id, 0),
                    variable("Route Id", &thread.route_id, 0),
                ],
                Scope::Exchange => vec![
                    variable("ID", &snapshot.exchange_id, 0),
                    variable("To node", &snapshot.to_node, 0),
                    variable("Route ID", &snapshot.route_id, 0),
                    variable(
                        "Properties",
                        &count_label(snapshot.exchange_properties.len()),
                        self.alloc(VarRef::Properties { thread_id }),
                    ),
                    variable(
                        "Variables",
                        &count_label(snapshot.exchange_variables.len()),
                        self.alloc(VarRef::ExchangeVariables { thread_id }),
                    ),
                ],
                Scope::Message => vec![
                    variable("Exchange ID", &snapshot.exchange_id, 0),
                    variable("UID", &snapshot.uid.to_string(), 0),
                    variable("Body", snapshot.body.as_deref().unwrap_or_default(), 0),
                    variable(
                        "Headers",
                        &count_label(snapshot.headers.len()),
                        self.alloc(VarRef::Headers { thread_id }),
                    ),
                ],
            },
            VarRef::Headers { .. } => snapshot
                .headers
                .iter()
                .map(|header| typed_variable(&header.key, &header.value, header.type_name.as_deref()))
                .collect(),
            VarRef::Properties { .. } => snapshot
                .exchange_properties
                .iter()
                .map(|property| {
                    typed_variable(&property.name, &property.value, property.type_name.as_deref())
                })
                .collect(),
            VarRef::ExchangeVariables { .. } => snapshot
                .exchange_variables
                .iter()
                .map(|var| typed_variable(&var.key, &var.value, var.type_name.as_deref()))
                .collect(),
        };
        Ok(variables)
    }

    /// Apply a `setVariable` request and return the value to display.
    pub async fn set_variable(
        &self,
        manager: &ConnectionManager,
        reference: i64,
        name: &str,
        value: &str,
    ) -> SessionResult<String> {
        match self.lookup(reference)? {
            VarRef::Scope {
                scope: Scope::Debugger,
                ..
            } => {
                manager.update_debugger_setting(parse_setting(name, value)?).await?;
            }
            VarRef::Scope {
                thread_id,
                scope: Scope::Message,
            } if name == "Body" => {
                manager.set_message_body(thread_id, value).await?;
            }
            VarRef::Headers { thread_id } => {
                manager.set_message_header(thread_id, name, value).await?;
            }
            VarRef::Properties { thread_id } => {
                manager.set_exchange_property(thread_id, name, value).await?;
            }
            _ => {
                return Err(SessionError::InvalidRequest(format!("{name} is read-only")));
            }
        }
        Ok(value.to_string())
    }
}

fn parse_setting(name: &str, value: &str) -> SessionResult<DebuggerSetting> {
    let value = value.trim();
    let invalid = || SessionError::InvalidRequest(format!("invalid value for {name}: {value}"));
    let setting = match name {
        "Logging level" => DebuggerSetting::LoggingLevel(value.to_ascii_uppercase()),
        "Max chars for body" => DebuggerSetting::BodyMaxChars(value.parse().map_err(|_| invalid())?),
        "Fallback timeout" => DebuggerSetting::FallbackTimeout(value.parse().map_err(|_| invalid())?),
        "Body include files" => DebuggerSetting::BodyIncludeFiles(value.parse().map_err(|_| invalid())?),
        "Body include streams" => DebuggerSetting::BodyIncludeStreams(value.parse().map_err(|_| invalid())?),
        "Debug counter" => match value.parse::<i64>() {
            Ok(0) => DebuggerSetting::ResetDebugCounter,
            _ => {
                return Err(SessionError::InvalidRequest(
                    "the debug counter can only be reset to 0".to_string(),
                ))
            }
        },
        _ => return Err(SessionError::InvalidRequest(format!("{name} is read-only"))),
    };
    Ok(setting)
}

fn settings_variables(settings: &DebuggerSettings) -> Vec<Value> {
    vec![
        variable("Logging level", &settings.logging_level, 0),
        variable("Max chars for body", &settings.body_max_chars.to_string(), 0),
        variable("Debug counter", &settings.debug_counter.to_string(), 0),
        variable("Fallback timeout", &settings.fallback_timeout.to_string(), 0),
        variable("Body include files", &settings.body_include_files.to_string(), 0),
        variable("Body include streams", &settings.body_include_streams.to_string(), 0),
    ]
}

fn count_label(count: usize) -> String {
    format!("size = {count}")
}

fn variable(name: &str, value: &str, variables_reference: i64) -> Value {
    json!({
        "name": name,
        "value": value,
        "variablesReference": variables_reference,
    })
}

fn typed_variable(name: &str, value: &str, type_name: Option<&str>) -> Value {
    let mut var = variable(name, value, 0);
    if let (Some(type_name), Some(obj)) = (type_name, var.as_object_mut()) {
        obj.insert("type".to_string(), json!(type_name));
    }
    var
}
