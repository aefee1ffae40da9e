//! Domain and route rule tables

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Rule action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Proceed to the content stage
    #[default]
    Allow,
    /// Deny without scanning
    Deny,
}

/// Host pattern, compiled from its textual form.
///
/// * `example.com`  matches `example.com` and every subdomain
/// * `=example.com` matches `example.com` only
/// * `*.example.*`  glob; `*` matches within one label
#[derive(Debug, Clone)]
pub enum HostPattern {
    Exact(String),
    Suffix(String),
    Glob(Regex),
}

impl HostPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let pattern = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
        if pattern.is_empty() {
            return Err(Error::Policy("empty host pattern".to_string()));
        }

        if let Some(exact) = pattern.strip_prefix('=') {
            return Ok(Self::Exact(exact.to_string()));
        }
        if pattern.contains('*') || pattern.contains('?') {
            let mut re = String::from("^");
            for c in pattern.chars() {
                match c {
                    '*' => re.push_str("[^.]*"),
                    '?' => re.push_str("[^.]"),
                    c => re.push_str(&regex::escape(&c.to_string())),
                }
            }
            re.push('$');
            let regex = Regex::new(&re)
                .map_err(|e| Error::Policy(format!("Invalid host glob '{}': {}", pattern, e)))?;
            return Ok(Self::Glob(regex));
        }
        Ok(Self::Suffix(pattern))
    }

    /// `host` must already be lowercase without a trailing dot.
    pub fn matches(&self, host: &str) -> bool {
        match self {
            Self::Exact(h) => host == h,
            Self::Suffix(d) => {
                host == d
                    || (host.len() > d.len()
                        && host.ends_with(d.as_str())
                        && host.as_bytes()[host.len() - d.len() - 1] == b'.')
            }
            Self::Glob(re) => re.is_match(host),
        }
    }
}

/// Normalize a host for matching.
pub fn canonical_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Host rule as configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRule {
    /// Host pattern
    pub host: String,
    /// Action on match
    pub action: RuleAction,
}

/// Method and path rule as configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    /// Host patterns the rule applies to
    pub hosts: Vec<String>,
    /// HTTP method; `*` matches any
    pub method: String,
    /// Regex matched case-insensitively from the start of the normalized
    /// path (query excluded)
    pub path: String,
    /// Action on match
    pub action: RuleAction,
    /// Short description used in denial messages
    #[serde(default)]
    pub description: Option<String>,
    /// Regex searched in the body; when set the rule only matches bodies
    /// containing it, or bodies that cannot be read (content-encoded)
    #[serde(default)]
    pub body: Option<String>,
}

/// Headers the content stage skips for matching hosts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderExemption {
    /// Host pattern
    pub host: String,
    /// Header names, case-insensitive
    pub headers: Vec<String>,
}

/// Known paste and file-drop hosts
pub fn default_domain_rules() -> Vec<DomainRule> {
    [
        "pastebin.com",
        "paste.ee",
        "hastebin.com",
        "dpaste.org",
        "file.io",
        "transfer.sh",
        "0x0.st",
        "ix.io",
        "sprunge.us",
        "termbin.com",
    ]
    .iter()
    .map(|host| DomainRule {
        host: host.to_string(),
        action: RuleAction::Deny,
    })
    .collect()
}

/// Hosting API endpoints an agent must never reach
pub fn default_route_rules() -> Vec<RouteRule> {
    let rule = |method: &str, path: &str, description: &str| RouteRule {
        hosts: vec!["=api.github.com".to_string(), "=github.com".to_string()],
        method: method.to_string(),
        path: path.to_string(),
        action: RuleAction::Deny,
        description: Some(description.to_string()),
        body: None,
    };

    vec![
        RouteRule {
            hosts: vec!["=api.github.com".to_string()],
            method: "POST".to_string(),
            path: r"/graphql/?$".to_string(),
            action: RuleAction::Deny,
            description: Some("merging or deleting through GraphQL".to_string()),
            body: Some(
                r"\b(mergePullRequest|enablePullRequestAutoMerge|mergeBranch|deleteRef|deleteRepository|updateRefs|deleteBranchProtectionRule|updateBranchProtectionRule)\b"
                    .to_string(),
            ),
        },
        rule("PUT", r"/repos/[^/]+/[^/]+/pulls/\d+/merge", "merging pull requests"),
        rule("DELETE", r"/repos/.*", "deleting repository resources"),
        rule("DELETE", r"/orgs/.*", "deleting organization resources"),
        rule("DELETE", r"/user/.*", "deleting user resources"),
        rule("GET", r"/repos/[^/]+/[^/]+/actions/secrets.*", "reading Actions secrets"),
        rule("GET", r"/orgs/[^/]+/actions/secrets.*", "reading Actions secrets"),
        rule("PATCH", r"/repos/[^/]+/[^/]+/?$", "changing repository settings"),
        rule("PUT", r"/repos/[^/]+/[^/]+/collaborators.*", "managing collaborators"),
        rule("POST", r"/repos/[^/]+/[^/]+/hooks", "creating webhooks"),
        rule("PATCH", r"/repos/[^/]+/[^/]+/hooks/\d+", "modifying webhooks"),
        rule(
            "PUT",
            r"/repos/[^/]+/[^/]+/branches/[^/]+/protection",
            "changing branch protection",
        ),
        rule(
            "DELETE",
            r"/repos/[^/]+/[^/]+/branches/[^/]+/protection",
            "changing branch protection",
        ),
    ]
}

/// A route rule with its regexes compiled
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    pub hosts: Vec<HostPattern>,
    pub method: String,
    pub path: Regex,
    pub body: Option<regex::bytes::Regex>,
    pub action: RuleAction,
    pub label: String,
}

/// A domain rule with its pattern compiled
#[derive(Debug, Clone)]
pub struct CompiledDomain {
    pub host: HostPattern,
    pub action: RuleAction,
    pub label: String,
}

/// Which rule decided a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleMatch {
    Route { action: RuleAction, label: String },
    Domain { action: RuleAction, label: String },
    Default(RuleAction),
}

impl RuleMatch {
    pub fn action(&self) -> RuleAction {
        match self {
            Self::Route { action, .. } | Self::Domain { action, .. } => *action,
            Self::Default(action) => *action,
        }
    }
}

/// Compiled, immutable rule table
#[derive(Debug, Clone)]
pub struct RuleTable {
    routes: Vec<CompiledRoute>,
    domains: Vec<CompiledDomain>,
    exemptions: Vec<(HostPattern, Vec<String>)>,
    default_action: RuleAction,
}

impl RuleTable {
    /// Compile rules; any invalid pattern fails the whole table.
    pub fn compile(
        routes: &[RouteRule],
        domains: &[DomainRule],
        exemptions: &[HeaderExemption],
        default_action: RuleAction,
    ) -> Result<Self> {
        let routes = routes
            .iter()
            .map(|r| {
                let path = Regex::new(&format!("(?i)^(?:{})", r.path)).map_err(|e| {
                    Error::Policy(format!("Invalid route path pattern '{}': {}", r.path, e))
                })?;
                let body = r
                    .body
                    .as_deref()
                    .map(|pattern| {
                        regex::bytes::Regex::new(pattern).map_err(|e| {
                            Error::Policy(format!("Invalid route body pattern '{}': {}", pattern, e))
                        })
                    })
                    .transpose()?;
                let hosts = r
                    .hosts
                    .iter()
                    .map(|h| HostPattern::parse(h))
                    .collect::<Result<Vec<_>>>()?;
                if hosts.is_empty() {
                    return Err(Error::Policy(format!(
                        "Route rule '{} {}' names no hosts",
                        r.method, r.path
                    )));
                }
                Ok(CompiledRoute {
                    hosts,
                    method: r.method.to_ascii_uppercase(),
                    path,
                    body,
                    action: r.action,
                    label: r
                        .description
                        .clone()
                        .unwrap_or_else(|| format!("{} {}", r.method, r.path)),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let domains = domains
            .iter()
            .map(|d| {
                Ok(CompiledDomain {
                    host: HostPattern::parse(&d.host)?,
                    action: d.action,
                    label: d.host.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let exemptions = exemptions
            .iter()
            .map(|e| {
                Ok((
                    HostPattern::parse(&e.host)?,
                    e.headers.iter().map(|h| h.to_ascii_lowercase()).collect(),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            routes,
            domains,
            exemptions,
            default_action,
        })
    }

    /// First matching route rule, then first matching domain rule, then
    /// the default action. `body` is `None` when it cannot be read.
    pub fn decide(&self, method: &str, host: &str, path: &str, body: Option<&[u8]>) -> RuleMatch {
        let host = canonical_host(host);

        for route in &self.routes {
            let body_matches = match (&route.body, body) {
                (None, _) | (Some(_), None) => true,
                (Some(pattern), Some(body)) => pattern.is_match(body),
            };
            if (route.method == "*" || route.method.eq_ignore_ascii_case(method))
                && route.hosts.iter().any(|h| h.matches(&host))
                && route.path.is_match(path)
                && body_matches
            {
                return RuleMatch::Route {
                    action: route.action,
                    label: route.label.clone(),
                };
            }
        }

        for domain in &self.domains {
            if domain.host.matches(&host) {
                return RuleMatch::Domain {
                    action: domain.action,
                    label: domain.label.clone(),
                };
            }
        }

        RuleMatch::Default(self.default_action)
    }

    /// Whether `header` is exempt from scanning for `host`.
    pub fn is_exempt(&self, host: &str, header: &str) -> bool {
        let host = canonical_host(host);
        self.exemptions.iter().any(|(pattern, headers)| {
            pattern.matches(&host) && headers.iter().any(|h| h.eq_ignore_ascii_case(header))
        })
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: Option<&[u8]> = Some(&[]);

    fn default_table() -> RuleTable {
        RuleTable::compile(
            &default_route_rules(),
            &default_domain_rules(),
            &[],
            RuleAction::Allow,
        )
        .unwrap()
    }

    #[test]
    fn test_host_patterns() {
        let suffix = HostPattern::parse("pastebin.com").unwrap();
        assert!(suffix.matches("pastebin.com"));
        assert!(suffix.matches("www.pastebin.com"));
        assert!(!suffix.matches("notpastebin.com"));

        let exact = HostPattern::parse("=github.com").unwrap();
        assert!(exact.matches("github.com"));
        assert!(!exact.matches("api.github.com"));

        let glob = HostPattern::parse("*.ngrok-*.app").unwrap();
        assert!(glob.matches("abc.ngrok-free.app"));
        assert!(!glob.matches("a.b.ngrok-free.app"));
    }

    #[test]
    fn test_domain_stage() {
        let table = default_table();
        assert!(matches!(
            table.decide("POST", "pastebin.com", "/api/api_post.php", EMPTY),
            RuleMatch::Domain { action: RuleAction::Deny, .. }
        ));
        assert!(matches!(
            table.decide("GET", "Transfer.SH.", "/", EMPTY),
            RuleMatch::Domain { action: RuleAction::Deny, .. }
        ));
        assert_eq!(
            table.decide("GET", "crates.io", "/", EMPTY),
            RuleMatch::Default(RuleAction::Allow)
        );
    }

    #[test]
    fn test_route_stage() {
        let table = default_table();
        assert_eq!(
            table.decide("PUT", "api.github.com", "/repos/acme/w/pulls/7/merge", EMPTY).action(),
            RuleAction::Deny
        );
        assert_eq!(
            table.decide("DELETE", "api.github.com", "/repos/acme/w", EMPTY).action(),
            RuleAction::Deny
        );
        assert_eq!(
            table.decide("PATCH", "api.github.com", "/repos/acme/w", EMPTY).action(),
            RuleAction::Deny
        );
        assert_eq!(
            table.decide("GET", "api.github.com", "/repos/acme/w/actions/secrets", EMPTY).action(),
            RuleAction::Deny
        );
        // Reads and PR creation pass the route stage
        assert_eq!(
            table.decide("GET", "api.github.com", "/repos/acme/w/pulls", EMPTY).action(),
            RuleAction::Allow
        );
        assert_eq!(
            table.decide("POST", "api.github.com", "/repos/acme/w/pulls", EMPTY).action(),
            RuleAction::Allow
        );
        // Other hosts are unaffected
        assert_eq!(
            table.decide("DELETE", "example.com", "/repos/x", EMPTY).action(),
            RuleAction::Allow
        );
    }

    #[test]
    fn test_graphql_body_rule() {
        let table = default_table();
        let merge = br#"{"query":"mutation { mergePullRequest(input: {pullRequestId: \"X\"}) { clientMutationId } }"}"#;
        let aliased = br#"{"query":"mutation { m: mergePullRequest(input: {}) { clientMutationId } }"}"#;
        let create = br#"{"query":"mutation { createPullRequest(input: {}) { clientMutationId } }"}"#;

        for body in [&merge[..], &aliased[..]] {
            assert!(matches!(
                table.decide("POST", "api.github.com", "/graphql", Some(body)),
                RuleMatch::Route { action: RuleAction::Deny, .. }
            ));
        }
        assert_eq!(
            table.decide("POST", "api.github.com", "/graphql", Some(&create[..])).action(),
            RuleAction::Allow
        );
        // A body the stage cannot read is treated as matching
        assert_eq!(
            table.decide("POST", "api.github.com", "/graphql", None).action(),
            RuleAction::Deny
        );
    }

    #[test]
    fn test_route_paths_match_case_insensitively() {
        let table = default_table();
        assert_eq!(
            table.decide("PUT", "api.github.com", "/Repos/acme/w/pulls/7/MERGE", EMPTY).action(),
            RuleAction::Deny
        );
    }

    #[test]
    fn test_ordering_first_match_wins() {
        let table = RuleTable::compile(
            &[],
            &[
                DomainRule {
                    host: "=safe.pastebin.com".to_string(),
                    action: RuleAction::Allow,
                },
                DomainRule {
                    host: "pastebin.com".to_string(),
                    action: RuleAction::Deny,
                },
            ],
            &[],
            RuleAction::Deny,
        )
        .unwrap();
        assert_eq!(table.decide("GET", "safe.pastebin.com", "/", EMPTY).action(), RuleAction::Allow);
        assert_eq!(table.decide("GET", "pastebin.com", "/", EMPTY).action(), RuleAction::Deny);
        assert_eq!(
            table.decide("GET", "other.org", "/", EMPTY),
            RuleMatch::Default(RuleAction::Deny)
        );
    }

    #[test]
    fn test_exemptions() {
        let table = RuleTable::compile(
            &[],
            &[],
            &[HeaderExemption {
                host: "=api.anthropic.com".to_string(),
                headers: vec!["X-Api-Key".to_string()],
            }],
            RuleAction::Allow,
        )
        .unwrap();
        assert!(table.is_exempt("api.anthropic.com", "x-api-key"));
        assert!(!table.is_exempt("evil.com", "x-api-key"));
        assert!(!table.is_exempt("api.anthropic.com", "authorization"));
    }

    #[test]
    fn test_invalid_route_rejected() {
        let bad = RouteRule {
            hosts: vec!["x.com".to_string()],
            method: "GET".to_string(),
            path: "(".to_string(),
            action: RuleAction::Deny,
            description: None,
            body: None,
        };
        assert!(RuleTable::compile(&[bad.clone()], &[], &[], RuleAction::Allow).is_err());

        let bad_body = RouteRule {
            path: "/x".to_string(),
            body: Some("[".to_string()),
            ..bad
        };
        assert!(RuleTable::compile(&[bad_body], &[], &[], RuleAction::Allow).is_err());
    }
}
