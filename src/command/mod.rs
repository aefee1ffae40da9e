//! Command classifier and policy engine
//!
//! Every git and gh invocation from a sandbox arrives here as an argument
//! vector. It is parsed, classified and decided before anything runs.
//!
//! ## Flow
//!
//! ```text
//! request ─► session lookup ─► cwd translation ─► parse + classify
//!                                                      │
//!           ┌──────────┬─────────┬────────────┬───────┴──────┬──────────┐
//!         LOCAL     BRANCH     MERGE      REMOTE_READ   REMOTE_WRITE   DENIED
//!         allow     warn     on-branch   remote check   refspecs +     deny
//!                                                       secret scan
//!                                                      │
//!                           liveness check ─► audit ─► execute (if allowed)
//! ```
//!
//! Parse failures deny. Nothing here mutates shared state except the
//! decision log.

pub mod args;
pub mod category;
pub mod engine;
pub mod hosting;
pub mod refspec;

pub use category::Category;
pub use engine::{
    CommandDecision, CommandPolicyEngine, CommandRequest, CommandResponse, ExecOutput, Execution,
    Workspace,
};

use crate::verdict::{DenyReason, Verdict};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Intermediate result of a check: `Err` always carries a denial.
pub(crate) type Checked<T> = std::result::Result<T, Verdict>;

pub(crate) fn denied(reason: DenyReason, message: impl Into<String>) -> Verdict {
    Verdict::deny(reason, message)
}

/// Mediated program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Program {
    Git,
    Gh,
}

impl Program {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "git" => Some(Self::Git),
            "gh" => Some(Self::Gh),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Git => "git",
            Self::Gh => "gh",
        }
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
