//! sandgate - egress and version-control gatekeeper for sandboxed coding agents
//!
//! An autonomous agent with private data, untrusted input and a way to
//! communicate out is one prompt injection away from exfiltration. sandgate
//! removes the third leg: every outbound request and every `git`/`gh`
//! command from the sandbox passes through it and gets an explicit verdict.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────── sandbox (one per session) ───────────────────┐
//! │   agent ──► git/gh shim ──────────┐         all other egress ──┐     │
//! └───────────────────────────────────┼────────────────────────────┼─────┘
//!                                     │ POST /api/v1/command       │ TCP
//! ┌───────────────────────────────────▼────────────────────────────▼─────┐
//! │                               sandgate                               │
//! │  ┌────────────────────┐  ┌──────────────────┐  ┌──────────────────┐  │
//! │  │ Dispatcher (axum)  │  │ Session registry │  │ Traffic engine   │  │
//! │  │ commands, sessions │◄─┤ id, branch, addr ├─►│ TLS intercept,   │  │
//! │  │ audit, reload      │  └──────────────────┘  │ HTTP/1.1 framing │  │
//! │  └─────────┬──────────┘                        └────────┬─────────┘  │
//! │  ┌─────────▼──────────┐  ┌──────────────────┐  ┌────────▼─────────┐  │
//! │  │ Command policy     │  │ Secret scanner   │  │ Traffic policy   │  │
//! │  │ classify, refspecs ├─►│ patterns / HTTP  │◄─┤ routes, domains, │  │
//! │  │ assigned branch    │  │ / process        │  │ content          │  │
//! │  └─────────┬──────────┘  └──────────────────┘  └────────┬─────────┘  │
//! │  ┌─────────▼──────────┐  ┌──────────────────────────────▼─────────┐  │
//! │  │ Workspace executor │  │ Decision log (hash-chained JSON lines) │  │
//! │  └────────────────────┘  └────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every decision fails closed: any error on the way to a verdict is a
//! denial, never an allow.
//!
//! ## Modules
//!
//! - [`gateway`]: lifecycle and the dispatcher API
//! - [`command`]: git/gh classification and the command policy engine
//! - [`traffic`]: interception, framing, CA and upstream connections
//! - [`policy`]: domain, route and content rules with hot reload
//! - [`scanner`]: secret scanner backends
//! - [`session`]: session registry
//! - [`workspace`]: path translation and command execution
//! - [`audit`]: decision log
//! - [`config`]: configuration management

pub mod api;
pub mod audit;
pub mod command;
pub mod config;
pub mod error;
pub mod gateway;
pub mod policy;
pub mod scanner;
pub mod session;
pub mod traffic;
pub mod verdict;
pub mod workspace;

pub use config::SandgateConfig;
pub use error::{Error, Result};
