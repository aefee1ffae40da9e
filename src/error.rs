//! sandgate error types

use thiserror::Error;

/// sandgate error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session registry error
    #[error("Session error: {0}")]
    Session(String),

    /// Policy compilation or reload error
    #[error("Policy error: {0}")]
    Policy(String),

    /// Secret scanner failure
    #[error("Scanner error: {0}")]
    Scanner(String),

    /// Traffic interception error
    #[error("Traffic error: {0}")]
    Traffic(String),

    /// Certificate authority / TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Upstream connection failure
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Workspace path translation or git execution error
    #[error("Workspace error: {0}")]
    Workspace(String),

    /// Audit sink error
    #[error("Audit error: {0}")]
    Audit(String),

    /// Gateway lifecycle error
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for sandgate operations
pub type Result<T> = std::result::Result<T, Error>;

