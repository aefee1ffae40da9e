//! Gateway server for sandgate
//!
//! Owns the session registry, both policy engines and the decision log,
//! and serves the dispatcher and admin APIs next to the traffic listener.

mod handler;
mod server;

pub use handler::{admin_router, dispatcher_router};
pub use server::{Gateway, GatewayBuilder, GatewayState, GatewayStatus};

#[cfg(test)]
pub(crate) use server::tests::{test_config, test_gateway};
