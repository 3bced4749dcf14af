//! `hotswap-core` — transparent restart proxy for MCP stdio servers.
//!
//! The proxy sits between an MCP client and a worker process speaking
//! newline-delimited JSON-RPC over stdio. When the worker writes the restart
//! sentinel to its stderr (or simply dies), the proxy replaces it with a
//! fresh process and replays the client's original `initialize` handshake,
//! so the client keeps talking to the same session without noticing.
//!
//! # Architecture
//!
//! ```text
//! client stdin ──▶ LineReader ──▶ validate ──▶ Handshake::observe ──▶ worker stdin
//!                                     │
//!                                     └─ Block ──▶ ClientSink (error response)
//!
//! worker stdout ──▶ forward_stdout ──▶ ClientSink ──▶ client stdout
//! worker stderr ──▶ scan_stderr ──▶ WorkerEvent ──▶ Coordinator
//!                                                     │
//!                         terminate ◀─────────────────┤
//!                         Supervisor::start + replay ◀┘
//! ```
//!
//! Every lifecycle step lands in the [`AuditLog`] as one JSON line.

pub mod audit;
pub mod channel;
pub mod config;
pub mod error;
pub mod handshake;
pub mod jsonrpc;
pub mod proxy;
pub mod restart;
pub mod validate;
pub mod worker;

pub use audit::{AuditLevel, AuditLog};
pub use config::{ProxyConfig, RestartConfig, WorkerConfig, DEFAULT_SENTINEL};
pub use error::{ProxyError, Result};
pub use handshake::{Handshake, HandshakeSnapshot};
pub use proxy::Proxy;
pub use restart::{RestartState, StateCell};
pub use validate::{validate, Verdict};
pub use worker::{Supervisor, Worker, WorkerEvent};
