//! Verb classification

use crate::verdict::{DenyReason, Verdict};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Command category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Repository-local read or edit
    Local,
    /// Branch listing, creation or switching
    Branch,
    /// History rewriting onto the current branch
    Merge,
    /// Network read from a configured remote
    RemoteRead,
    /// Network write to a configured remote
    RemoteWrite,
    /// Never permitted
    Denied,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Branch => "branch",
            Self::Merge => "merge",
            Self::RemoteRead => "remote_read",
            Self::RemoteWrite => "remote_write",
            Self::Denied => "denied",
        }
    }

    /// Whether executing this category needs hosting credentials.
    pub fn needs_credentials(&self) -> bool {
        matches!(self, Self::RemoteRead | Self::RemoteWrite)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of a git verb. Total: anything unlisted is `Denied`.
pub fn git_category(verb: &str) -> Category {
    match verb {
        "add" | "rm" | "mv" | "status" | "log" | "diff" | "show" | "stash" | "reset"
        | "restore" | "rev-parse" | "ls-files" | "blame" | "shortlog" | "describe" | "tag"
        | "commit" | "grep" | "rev-list" | "cat-file" | "ls-tree" | "reflog" | "show-ref"
        | "for-each-ref" | "format-patch" | "clean" | "apply" | "notes" | "whatchanged"
        | "count-objects" => Category::Local,
        "branch" | "checkout" | "switch" => Category::Branch,
        "merge" | "rebase" | "cherry-pick" | "revert" => Category::Merge,
        "fetch" | "pull" | "ls-remote" => Category::RemoteRead,
        "push" => Category::RemoteWrite,
        _ => Category::Denied,
    }
}

/// The denial for a `Denied` git verb, with a message the agent can act on.
pub fn git_denial(verb: &str) -> Verdict {
    let message = match verb {
        "remote" => "remote management is not permitted",
        "clone" => "clone is not permitted; use the provided workspace",
        "submodule" => "submodules are not supported",
        "credential" | "credential-cache" | "credential-store" => {
            "credential management is not permitted"
        }
        "config" => {
            "direct git configuration is not permitted; identity and settings are managed by the dispatcher"
        }
        "worktree" => "additional worktrees are not permitted; use the provided workspace",
        "filter-branch" => "history rewriting with filter-branch is not permitted",
        "send-email" => "sending patches by email is not permitted",
        "daemon" => "serving repositories is not permitted",
        "archive" => "archive is not permitted",
        "hook" => "running hooks directly is not permitted",
        "bisect" => "bisect is not supported",
        "difftool" | "mergetool" => "external diff and merge tools are not permitted",
        _ => {
            return Verdict::deny(
                DenyReason::UnknownVerb,
                format!("git {} is not a recognised command", verb),
            )
        }
    };
    Verdict::deny(DenyReason::DeniedVerb, format!("git {}: {}", verb, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table() {
        assert_eq!(git_category("status"), Category::Local);
        assert_eq!(git_category("commit"), Category::Local);
        assert_eq!(git_category("switch"), Category::Branch);
        assert_eq!(git_category("cherry-pick"), Category::Merge);
        assert_eq!(git_category("ls-remote"), Category::RemoteRead);
        assert_eq!(git_category("push"), Category::RemoteWrite);
        assert_eq!(git_category("remote"), Category::Denied);
        assert_eq!(git_category("frobnicate"), Category::Denied);
        assert_eq!(git_category("PUSH"), Category::Denied);
    }

    #[test]
    fn test_denials() {
        assert_eq!(
            git_denial("clone").deny_reason(),
            Some(DenyReason::DeniedVerb)
        );
        assert_eq!(
            git_denial("credential-store").deny_reason(),
            Some(DenyReason::DeniedVerb)
        );
        let unknown = git_denial("frobnicate");
        assert_eq!(unknown.deny_reason(), Some(DenyReason::UnknownVerb));
        assert!(unknown.message().unwrap().contains("frobnicate"));
    }

    #[test]
    fn test_credentials() {
        assert!(Category::RemoteWrite.needs_credentials());
        assert!(Category::RemoteRead.needs_credentials());
        assert!(!Category::Merge.needs_credentials());
        assert_eq!(
            serde_json::to_value(Category::RemoteRead).unwrap(),
            "remote_read"
        );
    }
}
