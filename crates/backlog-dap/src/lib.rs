//! Debug Adapter Protocol bridge for a routing engine's backlog debugger.
//!
//! The engine can only be polled: it reports which steps hold a suspended
//! message and answers snapshot/breakpoint/step/resume commands. This crate
//! turns that into a push-style DAP session:
//! - [`session::ConnectionManager`] owns the connection, the poll loop and the
//!   reconnection state machine, and emits [`events::SessionEvent`]s.
//! - [`topology`] and [`breakpoints`] resolve source lines to step ids.
//! - [`tracker`] assigns thread ids to suspended messages and live routes.
//! - [`server`] speaks DAP over stdio (or any async byte stream).

pub mod breakpoints;
pub mod dap;
pub mod error;
pub mod events;
pub mod hardening;
pub mod server;
pub mod session;
pub mod topology;
pub mod tracker;
pub mod variables;

pub use crate::error::{SessionError, SessionResult};
pub use crate::events::SessionEvent;
pub use crate::session::{ConnectionManager, LinkState, SessionOptions};
