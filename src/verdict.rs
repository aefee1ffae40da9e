//! Verdicts shared by the command and traffic engines

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable reason attached to every denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DenyReason {
    /// Argument vector or refspec failed to parse
    ParseError,
    /// An option that rebinds config, directories or executables
    ForbiddenOption,
    /// Verb is categorically denied
    DeniedVerb,
    /// Verb is not in the classification table
    UnknownVerb,
    /// A touched ref is not the assigned branch
    BranchMismatch,
    /// Remote destination is a URL or path, not a configured remote name
    UrlDestinationNotRemote,
    /// Remote name is not in the configured set
    RemoteNotConfigured,
    /// Checkout config could redirect a credentialed remote operation
    UnsafeRepositoryConfig,
    /// Push would delete a remote ref
    BranchDeletion,
    /// Refspec contains a glob
    WildcardRefspec,
    /// Push destination is not a branch
    NonBranchDestination,
    /// Current branch could not be determined (detached HEAD, no repo)
    CurrentBranchUnknown,
    /// Hosting CLI targeted a repository other than the configured one
    RepositoryOverride,
    /// Input the scanner cannot see (e.g. a body file)
    UninspectableInput,
    /// Working directory outside the session workspace
    InvalidWorkingDirectory,
    /// Secret scanner reported a credential
    SecretMatch,
    /// Secret scanner errored, timed out or was unreachable
    ScannerUnavailable,
    /// Session was torn down before the decision finished
    SessionDeregistered,
    /// No session is registered for the caller
    UnregisteredSession,
    /// Host is on the domain deny list
    BlockedDomain,
    /// Method and path match a denied API route
    BlockedRoute,
    /// Request framing could not be parsed
    MalformedTraffic,
    /// Request body exceeds the inspection cap
    BodyTooLarge,
    /// Host header disagrees with the intercepted destination
    HostMismatch,
    /// Protocol upgrade would leave the stream uninspected
    ProtocolUpgrade,
}

impl DenyReason {
    /// Stable code used in responses and audit records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ParseError => "parse-error",
            Self::ForbiddenOption => "forbidden-option",
            Self::DeniedVerb => "denied-verb",
            Self::UnknownVerb => "unknown-verb",
            Self::BranchMismatch => "branch-mismatch",
            Self::UrlDestinationNotRemote => "url-destination-not-remote",
            Self::RemoteNotConfigured => "remote-not-configured",
            Self::UnsafeRepositoryConfig => "unsafe-repository-config",
            Self::BranchDeletion => "branch-deletion",
            Self::WildcardRefspec => "wildcard-refspec",
            Self::NonBranchDestination => "non-branch-destination",
            Self::CurrentBranchUnknown => "current-branch-unknown",
            Self::RepositoryOverride => "repository-override",
            Self::UninspectableInput => "uninspectable-input",
            Self::InvalidWorkingDirectory => "invalid-working-directory",
            Self::SecretMatch => "secret-match",
            Self::ScannerUnavailable => "scanner-unavailable",
            Self::SessionDeregistered => "session-deregistered",
            Self::UnregisteredSession => "unregistered-session",
            Self::BlockedDomain => "blocked-domain",
            Self::BlockedRoute => "blocked-route",
            Self::MalformedTraffic => "malformed-traffic",
            Self::BodyTooLarge => "body-too-large",
            Self::HostMismatch => "host-mismatch",
            Self::ProtocolUpgrade => "protocol-upgrade",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Outcome of a policy decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    /// Proceed
    Allow,
    /// Proceed, surfacing a warning to the session
    AllowWithWarning { warning: String },
    /// Refuse, with a reason code and a human-readable message
    Deny { reason: DenyReason, message: String },
}

/// Verdict discriminant, used for filtering audit queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictKind {
    Allow,
    AllowWithWarning,
    Deny,
}

impl Verdict {
    pub fn warn(warning: impl Into<String>) -> Self {
        Self::AllowWithWarning {
            warning: warning.into(),
        }
    }

    pub fn deny(reason: DenyReason, message: impl Into<String>) -> Self {
        Self::Deny {
            reason,
            message: message.into(),
        }
    }

    /// Whether the guarded action may proceed.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Deny { .. })
    }

    pub fn kind(&self) -> VerdictKind {
        match self {
            Self::Allow => VerdictKind::Allow,
            Self::AllowWithWarning { .. } => VerdictKind::AllowWithWarning,
            Self::Deny { .. } => VerdictKind::Deny,
        }
    }

    /// Deny reason, if this is a denial.
    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Self::Deny { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Human-readable text for the session: the warning or denial message.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Allow => None,
            Self::AllowWithWarning { warning } => Some(warning),
            Self::Deny { message, .. } => Some(message),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => f.write_str("allow"),
            Self::AllowWithWarning { .. } => f.write_str("allow_with_warning"),
            Self::Deny { reason, .. } => write!(f, "deny({})", reason),
        }
    }
}
