#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::implicit_hasher)]

//! vcr-debug library: the debug tunnel and the pieces around it.
//!
//! - `tunnel` — relay connection, dispatcher, local executor, websocket bridge
//! - `gateway` — local HTTP server for calls to remote providers
//! - `process` — app launcher and process-tree kill
//! - `session` — deploy / ready / proxy / app / teardown orchestration
//! - `config` — configuration loading
//!
//! ## Architecture
//!
//! ```text
//! tunnel/
//!   message.rs     — wire envelopes (execute, execute-response, websocket, execute-remote)
//!   transport.rs   — reconnecting websocket, backoff ladder, leg dialing
//!   client.rs      — inbound dispatch loop, outbound writer, remote requests
//!   executor.rs    — execute → HTTP call to the local app
//!   bridge.rs      — websocket → proxy leg + app leg, frames copied both ways
//!   registry.rs    — pending remote responses by request id
//!   log.rs         — verbose message tracing
//!   error.rs       — TunnelError
//! gateway.rs       — catch-all handler, debugger proxy server lifecycle
//! process/
//!   mod.rs         — CommandGenerator, debug environment
//!   tree.rs        — children-first tree kill (/proc, ps, or PowerShell)
//! session.rs       — collaborator traits, host template, run_debug_session
//! config.rs        — TOML + env-var configuration
//! ```

pub mod config;
pub mod gateway;
pub mod process;
pub mod session;
pub mod tunnel;

#[cfg(test)]
mod testutil;

pub use config::Config;
pub use tunnel::{TunnelClient, TunnelError};
