//! Push grammar: options, destination and refspecs
//!
//! ```text
//! push      := option* [repository refspec*]
//! refspec   := ["+"] src [":" dst] | ["+"] ":" dst
//! ```
//!
//! Parsing is purely syntactic. Resolving a refspec to the remote branch it
//! writes needs the current branch, which the engine supplies.

use super::{denied, Checked};
use crate::verdict::DenyReason;

/// Ref-name syntax accepted for branches (a subset of `git check-ref-format`).
pub fn is_valid_ref_name(name: &str) -> bool {
    if name.is_empty() || name == "@" || name == "HEAD" {
        return false;
    }
    if name.starts_with('-') || name.starts_with('/') || name.ends_with('/') {
        return false;
    }
    if name.ends_with('.') || name.ends_with(".lock") {
        return false;
    }
    if name.contains("..") || name.contains("//") || name.contains("@{") {
        return false;
    }
    if name
        .chars()
        .any(|c| c.is_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return false;
    }
    !name
        .split('/')
        .any(|component| component.starts_with('.') || component.ends_with(".lock"))
}

/// Whether a repository argument names a location rather than a remote.
///
/// Covers `scheme://`, `file:`, scp-like `host:path`, and absolute,
/// relative or home-relative filesystem paths.
pub fn is_url_like(repository: &str) -> bool {
    repository.contains("://")
        || repository.contains(':')
        || repository.contains('/')
        || repository.contains('\\')
        || repository.starts_with('.')
        || repository.starts_with('~')
}

/// Check a repository argument against the configured remotes.
pub fn check_destination(repository: &str, remotes: &[String]) -> Checked<()> {
    if is_url_like(repository) {
        return Err(denied(
            DenyReason::UrlDestinationNotRemote,
            format!(
                "'{}' is a URL or path; only configured remotes ({}) may be used",
                repository,
                remotes.join(", ")
            ),
        ));
    }
    if !remotes.iter().any(|r| r == repository) {
        return Err(denied(
            DenyReason::RemoteNotConfigured,
            format!(
                "remote '{}' is not configured; allowed remotes: {}",
                repository,
                remotes.join(", ")
            ),
        ));
    }
    Ok(())
}

/// One parsed refspec, before resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refspec {
    /// Local side; empty for a deletion
    pub src: String,
    /// Remote side, when written with a colon
    pub dst: Option<String>,
    /// Leading `+`
    pub force: bool,
}

impl Refspec {
    /// Parse `["+"] src [":" dst] | ["+"] ":" dst`.
    pub fn parse(raw: &str) -> Checked<Self> {
        let (force, body) = match raw.strip_prefix('+') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };

        if body.is_empty() {
            return Err(denied(DenyReason::ParseError, "empty refspec"));
        }
        if body.matches(':').count() > 1 {
            return Err(denied(
                DenyReason::ParseError,
                format!("refspec '{}' has more than one ':'", raw),
            ));
        }

        let refspec = match body.split_once(':') {
            Some((src, dst)) => {
                if dst.is_empty() {
                    return Err(denied(
                        DenyReason::ParseError,
                        format!("refspec '{}' has an empty destination", raw),
                    ));
                }
                Self {
                    src: src.to_string(),
                    dst: Some(dst.to_string()),
                    force,
                }
            }
            None => Self {
                src: body.to_string(),
                dst: None,
                force,
            },
        };

        if refspec.src.is_empty() {
            return Err(denied(
                DenyReason::BranchDeletion,
                format!("refspec '{}' would delete a remote branch", raw),
            ));
        }
        if refspec.src.starts_with('-') {
            return Err(denied(
                DenyReason::ParseError,
                format!("refspec '{}' looks like an option", raw),
            ));
        }
        if refspec.src.contains('*') || refspec.dst.as_deref().is_some_and(|d| d.contains('*')) {
            return Err(denied(
                DenyReason::WildcardRefspec,
                format!("wildcard refspec '{}' is not permitted", raw),
            ));
        }

        Ok(refspec)
    }

    /// Remote branch this refspec writes.
    ///
    /// `HEAD`/`@` sources resolve to `current_branch`; `refs/heads/<b>`
    /// resolves to `<b>`; any other `refs/` namespace is rejected.
    pub fn destination(&self, current_branch: Option<&str>) -> Checked<String> {
        let target = match &self.dst {
            Some(dst) => dst.as_str(),
            None if self.src == "HEAD" || self.src == "@" => {
                return current_branch
                    .map(str::to_string)
                    .ok_or_else(current_branch_unknown)
            }
            None => self.src.as_str(),
        };
        branch_from_ref(target)
    }
}

fn current_branch_unknown() -> crate::verdict::Verdict {
    denied(
        DenyReason::CurrentBranchUnknown,
        "cannot determine the current branch (detached HEAD?)",
    )
}

fn branch_from_ref(target: &str) -> Checked<String> {
    let branch = if let Some(branch) = target.strip_prefix("refs/heads/") {
        branch
    } else if target.starts_with("refs/") {
        return Err(denied(
            DenyReason::NonBranchDestination,
            format!("'{}' is not a branch", target),
        ));
    } else {
        target
    };

    if !is_valid_ref_name(branch) {
        return Err(denied(
            DenyReason::ParseError,
            format!("'{}' is not a valid branch name", branch),
        ));
    }
    Ok(branch.to_string())
}

/// A parsed `git push`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushCommand {
    /// Explicit repository (positional or `--repo=`)
    pub repository: Option<String>,
    /// Refspecs in argument order
    pub refspecs: Vec<Refspec>,
    /// `-f`/`--force`/`--force-with-lease`
    pub force: bool,
}

impl PushCommand {
    /// Remote branches written, in argument order.
    pub fn destinations(&self, current_branch: Option<&str>) -> Checked<Vec<String>> {
        if self.refspecs.is_empty() {
            return current_branch
                .map(|b| vec![b.to_string()])
                .ok_or_else(current_branch_unknown);
        }
        self.refspecs
            .iter()
            .map(|r| r.destination(current_branch))
            .collect()
    }

    /// Local revisions pushed, paired with their remote branches.
    pub fn outgoing(&self, current_branch: Option<&str>) -> Checked<Vec<(String, String)>> {
        let destinations = self.destinations(current_branch)?;
        if self.refspecs.is_empty() {
            return Ok(destinations
                .into_iter()
                .map(|dst| ("HEAD".to_string(), dst))
                .collect());
        }
        Ok(self
            .refspecs
            .iter()
            .zip(destinations)
            .map(|(r, dst)| (r.src.clone(), dst))
            .collect())
    }
}

const BOOLEAN_OPTIONS: &[&str] = &[
    "--force",
    "--force-if-includes",
    "--no-force-if-includes",
    "--set-upstream",
    "--dry-run",
    "--verbose",
    "--quiet",
    "--porcelain",
    "--progress",
    "--no-progress",
    "--atomic",
    "--no-atomic",
    "--verify",
    "--no-verify",
    "--thin",
    "--no-thin",
    "--ipv4",
    "--ipv6",
    "--signed",
    "--no-signed",
    "--no-force-with-lease",
];

const DENIED_OPTIONS: &[&str] = &[
    "--all",
    "--branches",
    "--mirror",
    "--tags",
    "--follow-tags",
    "--delete",
    "--prune",
    "--receive-pack",
    "--exec",
    "--recurse-submodules",
];

/// Short flags that take no value
const SHORT_FLAGS: &str = "fuvnq46";

/// Parse the arguments following `push`.
pub fn parse_push(args: &[String]) -> Checked<PushCommand> {
    let mut push = PushCommand::default();
    let mut positional: Vec<&str> = Vec::new();
    let mut repo_option: Option<String> = None;
    let mut iter = args.iter();
    let mut options_done = false;

    while let Some(arg) = iter.next() {
        if options_done || !arg.starts_with('-') || arg == "-" {
            positional.push(arg);
            continue;
        }
        if arg == "--" {
            options_done = true;
            continue;
        }

        if let Some(long) = arg.strip_prefix("--") {
            let (name, value) = match long.split_once('=') {
                Some((n, v)) => (format!("--{}", n), Some(v)),
                None => (arg.clone(), None),
            };

            if DENIED_OPTIONS.contains(&name.as_str()) {
                return Err(denied(
                    DenyReason::ForbiddenOption,
                    format!("git push {} is not permitted", name),
                ));
            }

            match name.as_str() {
                "--force" if value.is_none() => push.force = true,
                "--force-with-lease" => push.force = true,
                "--signed" => {}
                "--repo" => match value {
                    Some(v) if !v.is_empty() => repo_option = Some(v.to_string()),
                    _ => {
                        let v = iter.next().ok_or_else(|| {
                            denied(DenyReason::ParseError, "--repo requires a value")
                        })?;
                        repo_option = Some(v.clone());
                    }
                },
                "--push-option" => {
                    if value.is_none() && iter.next().is_none() {
                        return Err(denied(
                            DenyReason::ParseError,
                            "--push-option requires a value",
                        ));
                    }
                }
                n if BOOLEAN_OPTIONS.contains(&n) && value.is_none() => {}
                _ => {
                    return Err(denied(
                        DenyReason::ParseError,
                        format!("unrecognised git push option '{}'", arg),
                    ))
                }
            }
            continue;
        }

        // Bundled short flags, e.g. -fu, -o value, -ovalue
        let mut chars = arg[1..].char_indices();
        while let Some((idx, c)) = chars.next() {
            match c {
                'd' => {
                    return Err(denied(
                        DenyReason::ForbiddenOption,
                        "git push -d is not permitted",
                    ))
                }
                'o' => {
                    let rest = &arg[1 + idx + 1..];
                    if rest.is_empty() && iter.next().is_none() {
                        return Err(denied(DenyReason::ParseError, "-o requires a value"));
                    }
                    break;
                }
                'f' => push.force = true,
                c if SHORT_FLAGS.contains(c) => {}
                _ => {
                    return Err(denied(
                        DenyReason::ParseError,
                        format!("unrecognised git push option '-{}'", c),
                    ))
                }
            }
        }
    }

    let mut positional = positional.into_iter();
    match (repo_option, positional.next()) {
        (Some(_), Some(_)) => {
            return Err(denied(
                DenyReason::ParseError,
                "repository given both with --repo and positionally",
            ))
        }
        (Some(repo), None) => push.repository = Some(repo),
        (None, Some(repo)) => push.repository = Some(repo.to_string()),
        (None, None) => {}
    }

    for raw in positional {
        push.refspecs.push(Refspec::parse(raw)?);
    }
    if push.refspecs.iter().any(|r| r.force) {
        push.force = true;
    }

    Ok(push)
}
