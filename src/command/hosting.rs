//! Hosting CLI (`gh <group> <action>`) classification

use super::category::Category;
use super::{denied, Checked};
use crate::verdict::DenyReason;

/// A classified `gh` invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhCommand {
    pub group: Option<String>,
    pub action: Option<String>,
    pub category: Category,
    /// `--head` of `pr create`
    pub head: Option<String>,
}

impl GhCommand {
    pub fn is_pr_create(&self) -> bool {
        self.group.as_deref() == Some("pr") && self.action.as_deref() == Some("create")
    }

    pub fn verb(&self) -> String {
        match (&self.group, &self.action) {
            (Some(g), Some(a)) => format!("{} {}", g, a),
            (Some(g), None) => g.clone(),
            _ => String::new(),
        }
    }
}

fn action_category(group: &str, action: Option<&str>) -> Category {
    match (group, action) {
        ("pr", Some("list" | "view" | "diff" | "checks" | "status"))
        | ("issue", Some("list" | "view" | "status"))
        | ("repo", Some("view" | "list"))
        | ("run", Some("list" | "view" | "watch"))
        | ("workflow", Some("list" | "view"))
        | ("release", Some("list" | "view" | "download"))
        | ("search", Some(_))
        | ("label", Some("list")) => Category::RemoteRead,
        ("pr" | "issue", Some("create" | "comment" | "edit")) => Category::RemoteWrite,
        _ => Category::Denied,
    }
}

fn denial_message(group: &str, action: Option<&str>) -> String {
    match (group, action) {
        ("pr", Some("merge")) => {
            "merging pull requests is not permitted; a human must review and merge".to_string()
        }
        ("repo", Some("delete")) => "deleting repositories is not permitted".to_string(),
        ("api", _) => "direct API access is not permitted".to_string(),
        ("auth", _) => "authentication is managed by the dispatcher".to_string(),
        ("secret" | "variable", _) => "managing repository secrets is not permitted".to_string(),
        ("workflow", Some("run")) => "triggering workflows is not permitted".to_string(),
        ("extension" | "alias" | "config", _) => {
            format!("gh {} is not permitted", group)
        }
        (g, Some(a)) => format!("gh {} {} is not permitted", g, a),
        (g, None) => format!("gh {} is not permitted", g),
    }
}

/// Flags that take a separate value
const VALUE_FLAGS: &[&str] = &[
    "-R", "--repo", "-H", "--head", "-B", "--base", "-t", "--title", "-b", "--body", "-l",
    "--label", "-a", "--assignee", "-r", "--reviewer", "-m", "--milestone", "-p", "--project",
    "-L", "--limit", "-s", "--state", "-S", "--search", "-A", "--author", "--json", "-q", "--jq",
    "--template", "-T", "-D", "--dir", "--pattern",
];

fn flag_value<'a>(
    arg: &'a str,
    iter: &mut impl Iterator<Item = &'a String>,
    short: &str,
    long: &str,
) -> Option<Checked<String>> {
    if arg == short || arg == long {
        return Some(
            iter.next()
                .cloned()
                .ok_or_else(|| denied(DenyReason::ParseError, format!("{} requires a value", arg))),
        );
    }
    if let Some(v) = arg.strip_prefix(&format!("{}=", long)) {
        return Some(Ok(v.to_string()));
    }
    if let Some(v) = arg.strip_prefix(short) {
        if !v.is_empty() && !short.starts_with("--") {
            return Some(Ok(v.trim_start_matches('=').to_string()));
        }
    }
    None
}

/// Classify a `gh` argument vector.
///
/// `repository` is the only `owner/name` the CLI may target; without one
/// configured, any explicit `--repo` is refused.
pub fn classify_gh(argv: &[String], repository: Option<&str>) -> Checked<GhCommand> {
    let Some(first) = argv.first() else {
        return Err(denied(DenyReason::ParseError, "no gh command given"));
    };

    if first == "--version" || first == "--help" || first == "version" {
        return Ok(GhCommand {
            group: None,
            action: None,
            category: Category::Local,
            head: None,
        });
    }
    if first.starts_with('-') {
        return Err(denied(
            DenyReason::ParseError,
            format!("expected a gh command before '{}'", first),
        ));
    }

    let group = first.clone();
    let action = argv
        .get(1)
        .filter(|a| !a.starts_with('-'))
        .cloned();

    let category = action_category(&group, action.as_deref());
    if category == Category::Denied {
        return Err(denied(
            DenyReason::DeniedVerb,
            denial_message(&group, action.as_deref()),
        ));
    }

    let mut head = None;
    let skip = if action.is_some() { 2 } else { 1 };
    let mut iter = argv[skip..].iter();
    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }
        if arg == "-F" || arg.starts_with("--body-file") || (arg.starts_with("-F") && arg.len() > 2)
        {
            return Err(denied(
                DenyReason::UninspectableInput,
                "--body-file cannot be inspected; pass the text with --body",
            ));
        }
        if let Some(value) = flag_value(arg, &mut iter, "-R", "--repo") {
            let value = value?;
            if repository != Some(value.as_str()) {
                return Err(denied(
                    DenyReason::RepositoryOverride,
                    format!(
                        "gh may only target {}, not '{}'",
                        repository.unwrap_or("the configured repository"),
                        value
                    ),
                ));
            }
            continue;
        }
        if let Some(value) = flag_value(arg, &mut iter, "-H", "--head") {
            head = Some(value?);
            continue;
        }
        if !arg.contains('=') && VALUE_FLAGS.contains(&arg.as_str()) {
            iter.next();
        }
    }

    Ok(GhCommand {
        group: Some(group),
        action,
        category,
        head,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPO: Option<&str> = Some("acme/widgets");

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn reason(list: &[&str]) -> DenyReason {
        classify_gh(&args(list), REPO)
            .unwrap_err()
            .deny_reason()
            .unwrap()
    }

    #[test]
    fn test_read_actions() {
        for list in [
            vec!["pr", "list"],
            vec!["pr", "view", "12"],
            vec!["issue", "status"],
            vec!["run", "watch", "99"],
            vec!["search", "code", "foo"],
            vec!["label", "list"],
            vec!["release", "download", "v1"],
        ] {
            let gh = classify_gh(&args(&list), REPO).unwrap();
            assert_eq!(gh.category, Category::RemoteRead, "{:?}", list);
        }
    }

    #[test]
    fn test_write_actions() {
        let gh = classify_gh(&args(&["pr", "create", "--title", "x", "--head", "feature-a"]), REPO)
            .unwrap();
        assert_eq!(gh.category, Category::RemoteWrite);
        assert!(gh.is_pr_create());
        assert_eq!(gh.head.as_deref(), Some("feature-a"));

        let gh = classify_gh(&args(&["issue", "comment", "3", "-b", "done"]), REPO).unwrap();
        assert_eq!(gh.category, Category::RemoteWrite);
        assert_eq!(gh.verb(), "issue comment");
    }

    #[test]
    fn test_denied_actions() {
        assert_eq!(reason(&["pr", "merge", "12"]), DenyReason::DeniedVerb);
        assert_eq!(reason(&["repo", "delete"]), DenyReason::DeniedVerb);
        assert_eq!(reason(&["api", "/user"]), DenyReason::DeniedVerb);
        assert_eq!(reason(&["auth", "token"]), DenyReason::DeniedVerb);
        assert_eq!(reason(&["secret", "list"]), DenyReason::DeniedVerb);
        assert_eq!(reason(&["workflow", "run", "ci"]), DenyReason::DeniedVerb);
        assert_eq!(reason(&["extension", "install", "x"]), DenyReason::DeniedVerb);
        assert_eq!(reason(&["pr"]), DenyReason::DeniedVerb);
        assert_eq!(reason(&["--repo", "x/y", "pr", "list"]), DenyReason::ParseError);
    }

    #[test]
    fn test_repository_override() {
        assert_eq!(
            reason(&["pr", "list", "-R", "other/repo"]),
            DenyReason::RepositoryOverride
        );
        assert_eq!(
            reason(&["pr", "list", "--repo=other/repo"]),
            DenyReason::RepositoryOverride
        );
        assert_eq!(
            reason(&["pr", "list", "-Rother/repo"]),
            DenyReason::RepositoryOverride
        );
        assert!(classify_gh(&args(&["pr", "list", "--repo", "acme/widgets"]), REPO).is_ok());

        let err = classify_gh(&args(&["pr", "list", "-R", "acme/widgets"]), None).unwrap_err();
        assert_eq!(err.deny_reason(), Some(DenyReason::RepositoryOverride));
    }

    #[test]
    fn test_body_file_uninspectable() {
        assert_eq!(
            reason(&["pr", "create", "--body-file", "notes.md"]),
            DenyReason::UninspectableInput
        );
        assert_eq!(
            reason(&["issue", "comment", "1", "-F", "-"]),
            DenyReason::UninspectableInput
        );
    }

    #[test]
    fn test_flag_values_not_mistaken_for_flags() {
        // The title value "-R" is consumed as a value, not parsed as --repo
        let gh = classify_gh(&args(&["pr", "create", "--title", "-R", "--head", "a"]), REPO).unwrap();
        assert_eq!(gh.head.as_deref(), Some("a"));
    }
}
