//! Session identity context
//!
//! Sessions are registered by the external provisioner before first use and
//! never mutated afterwards. Each carries the single branch the sandbox may
//! write to, and a cancellation token that fires on deregistration.

mod manager;

pub use manager::{Session, SessionInfo, SessionManager, SessionState};
