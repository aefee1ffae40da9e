//! TLS-intercepting traffic engine
//!
//! Every outbound connection from a sandbox lands on one listener. The
//! engine terminates TLS with a per-host leaf from the sandbox CA, decodes
//! the request, asks the traffic policy for a verdict and only then opens
//! the upstream connection.

pub mod ca;
pub mod codec;
pub mod proxy;
pub mod request;
pub mod upstream;

pub use ca::CertificateAuthority;
pub use proxy::TrafficEngine;
pub use request::{Headers, Scheme, TrafficRequest};
pub use upstream::Upstream;
