//! Wire-level access to a routing engine's remote backlog debugger.
//!
//! The engine exposes a polled command/query surface: list suspended step ids,
//! dump a suspended message, add or remove breakpoints, resume, step, and
//! suspend or resume whole routes. [`BacklogClient`] speaks that surface over a
//! line-delimited JSON connection and is cancellation-aware (`tokio`).
//!
//! The client holds no debugging state beyond the live connection; retry for
//! steady-state faults belongs to the caller.

mod client;
mod codec;
pub mod snapshot;
pub mod types;

pub use client::{BacklogClient, BacklogClientConfig};
pub use snapshot::{ExchangeProperty, ExchangeVariable, MessageHeader, MessageSnapshot};
pub use types::{
    BacklogError, Command, DebuggerSetting, DebuggerSettings, EngineInfo, Result, RetryPolicy,
};

// The mock engine is only needed for tests and downstream integration suites.
// Compile it for this crate's own unit tests unconditionally (via `cfg(test)`),
// while keeping it behind the `test-support` feature for normal builds.
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
#[cfg(any(test, feature = "test-support"))]
mod poison;
