//! git argument vector: global options, verb, verb arguments

use super::{denied, Checked};
use crate::verdict::DenyReason;

/// Global options that only affect output or pathspec matching
const ALLOWED_GLOBAL: &[&str] = &[
    "--no-pager",
    "-P",
    "-p",
    "--paginate",
    "--no-replace-objects",
    "--literal-pathspecs",
    "--glob-pathspecs",
    "--noglob-pathspecs",
    "--icase-pathspecs",
    "--no-optional-locks",
    "--no-advice",
];

/// Global options that rebind configuration, directories or executables
const FORBIDDEN_GLOBAL: &[&str] = &[
    "--config-env",
    "--git-dir",
    "--work-tree",
    "--namespace",
    "--exec-path",
    "--bare",
    "--super-prefix",
];

/// Options that make any verb run an external program
const FORBIDDEN_ANYWHERE: &[&str] = &["--ext-diff"];

/// A git invocation split at the verb
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitArgs {
    /// Subcommand; `None` for `git --version` / `git --help`
    pub verb: Option<String>,
    /// Arguments after the verb
    pub args: Vec<String>,
}

/// Split global options from the verb, rejecting anything that could
/// redirect git at another repository, config or binary.
pub fn split_git(argv: &[String]) -> Checked<GitArgs> {
    let mut iter = argv.iter().enumerate();

    while let Some((idx, arg)) = iter.next() {
        if !arg.starts_with('-') {
            let args = argv[idx + 1..].to_vec();
            check_anywhere(&args)?;
            return Ok(GitArgs {
                verb: Some(arg.clone()),
                args,
            });
        }

        let name = arg.split_once('=').map(|(n, _)| n).unwrap_or(arg);

        if name == "--version" || name == "--help" || name == "-h" {
            return Ok(GitArgs {
                verb: None,
                args: Vec::new(),
            });
        }
        if ALLOWED_GLOBAL.contains(&name) {
            continue;
        }
        if FORBIDDEN_GLOBAL.contains(&name)
            || (arg.starts_with("-c") && !arg.starts_with("--"))
            || (arg.starts_with("-C") && !arg.starts_with("--"))
        {
            return Err(denied(
                DenyReason::ForbiddenOption,
                format!("git {} is not permitted", name),
            ));
        }
        return Err(denied(
            DenyReason::ParseError,
            format!("unrecognised git option '{}'", arg),
        ));
    }

    Err(denied(DenyReason::ParseError, "no git command given"))
}

fn check_anywhere(args: &[String]) -> Checked<()> {
    for arg in args {
        if arg == "--" {
            break;
        }
        if FORBIDDEN_ANYWHERE.contains(&arg.as_str()) {
            return Err(denied(
                DenyReason::ForbiddenOption,
                format!("{} runs an external program and is not permitted", arg),
            ));
        }
    }
    Ok(())
}

/// Positional arguments, skipping options and the values of the listed
/// separate-value options. Everything after `--` is positional.
pub fn positionals<'a>(args: &'a [String], value_options: &[&str]) -> Vec<&'a str> {
    let mut out = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--" {
            out.extend(iter.map(String::as_str));
            break;
        }
        if arg.starts_with('-') && arg != "-" {
            if !arg.contains('=') && value_options.contains(&arg.as_str()) {
                iter.next();
            }
            continue;
        }
        out.push(arg.as_str());
    }
    out
}

/// Whether an option is present, in `--name` or `--name=value` form.
pub fn has_option(args: &[String], names: &[&str]) -> bool {
    args.iter().take_while(|a| *a != "--").any(|arg| {
        let name = arg.split_once('=').map(|(n, _)| n).unwrap_or(arg);
        names.contains(&name)
    })
}
