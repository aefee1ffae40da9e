//! sandgate configuration management

use crate::error::{Error, Result};
use crate::scanner::{default_secret_patterns, SecretPattern};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use crate::policy::{
    default_domain_rules, default_route_rules, DomainRule, HeaderExemption, RouteRule, RuleAction,
};

/// Main sandgate configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandgateConfig {
    /// Command interface, reachable from sessions
    pub dispatcher: DispatcherConfig,

    /// Session provisioning and operations API, for the orchestrator only
    pub admin: AdminConfig,

    /// Traffic interception listener
    pub proxy: ProxyConfig,

    /// Secret scanner backends
    pub scanner: ScannerConfig,

    /// Per-branch workspaces and command execution
    pub workspace: WorkspaceConfig,

    /// Hosting provider repository and remotes
    pub hosting: HostingConfig,

    /// Decision log
    pub audit: AuditConfig,

    /// Domain, route and content policy
    pub policy: PolicyConfig,
}

impl SandgateConfig {
    /// Load configuration from a TOML or YAML file, chosen by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::parse(&content, path)
    }

    /// Parse configuration text; `path` selects the format.
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(content)
                .map_err(|e| Error::Config(format!("Invalid YAML config: {}", e)))?,
            _ => toml::from_str(content)
                .map_err(|e| Error::Config(format!("Invalid TOML config: {}", e)))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.proxy.max_connections == 0 {
            return Err(Error::Config(
                "proxy.max_connections must be greater than zero".to_string(),
            ));
        }
        if self.admin.port != 0 && self.admin.port == self.dispatcher.port {
            return Err(Error::Config(
                "admin.port must differ from dispatcher.port".to_string(),
            ));
        }
        if self.scanner.timeout_ms == 0 {
            return Err(Error::Config(
                "scanner.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if !self.hosting.remotes.is_empty()
            && !self.hosting.remotes.contains_key(&self.hosting.default_remote)
        {
            return Err(Error::Config(format!(
                "hosting.default_remote '{}' is not listed in hosting.remotes",
                self.hosting.default_remote
            )));
        }
        for (name, url) in &self.hosting.remotes {
            if url.trim().is_empty() || url.starts_with('-') {
                return Err(Error::Config(format!(
                    "hosting.remotes.{} must be a repository URL",
                    name
                )));
            }
        }
        if let Some(repo) = &self.hosting.repository {
            let parts: Vec<&str> = repo.split('/').collect();
            if parts.len() != 2 || parts.iter().any(|p| p.is_empty()) {
                return Err(Error::Config(format!(
                    "hosting.repository must be 'owner/name', got '{}'",
                    repo
                )));
            }
        }
        Ok(())
    }
}

/// Default config file location
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sandgate")
        .join("config.toml")
}

fn data_dir() -> PathBuf {
    dirs_next::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sandgate")
}

/// Dispatcher API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8077,
        }
    }
}

/// Admin API configuration. Sessions must not be able to reach this
/// listener: it registers and tears down sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8078,
        }
    }
}

/// Traffic interception configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Maximum concurrent intercepted connections
    pub max_connections: usize,

    /// Largest request body that will be inspected and forwarded
    pub max_body_bytes: usize,

    /// Upstream TCP connect timeout
    pub connect_timeout_ms: u64,

    /// TLS handshake timeout (both directions)
    pub handshake_timeout_ms: u64,

    /// CA certificate (PEM); generated on first start when missing
    pub ca_cert: PathBuf,

    /// CA private key (PEM)
    pub ca_key: PathBuf,

    /// Extra PEM root certificates trusted for upstream connections
    pub extra_roots: Vec<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        let base = data_dir().join("ca");
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 1024,
            max_body_bytes: 10 * 1024 * 1024,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            ca_cert: base.join("ca.pem"),
            ca_key: base.join("ca-key.pem"),
            extra_roots: Vec::new(),
        }
    }
}

/// Scanner backend kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScannerBackendKind {
    /// In-process regex patterns from the policy
    Patterns,
    /// HTTP analysis service
    Http,
    /// External scanner binary
    Process,
}

/// Secret scanner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Backends consulted on every scan, in order
    pub backends: Vec<ScannerBackendKind>,

    /// Deadline for one whole scan
    pub timeout_ms: u64,

    /// HTTP analysis service settings
    pub http: Option<HttpScannerConfig>,

    /// External process settings
    pub process: Option<ProcessScannerConfig>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            backends: vec![ScannerBackendKind::Patterns],
            timeout_ms: 30_000,
            http: None,
            process: None,
        }
    }
}

/// HTTP analysis service (`POST {url}/analyze/prompt`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpScannerConfig {
    /// Base URL of the service
    pub url: String,

    /// Environment variable holding the bearer token
    #[serde(default)]
    pub token_env: Option<String>,

    /// Payloads shorter than this are not sent
    #[serde(default = "default_min_length")]
    pub min_length: usize,

    /// A scanner score below this counts as a finding
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f64,
}

fn default_min_length() -> usize {
    10
}

fn default_score_threshold() -> f64 {
    1.0
}

/// External scanner process: payload on stdin, verdict by exit code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessScannerConfig {
    /// Program to run
    pub command: String,

    /// Arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Exit codes that mean "secret found"; 0 is clean, anything else is an error
    #[serde(default = "default_match_exit_codes")]
    pub match_exit_codes: Vec<i32>,
}

fn default_match_exit_codes() -> Vec<i32> {
    vec![183]
}

/// Workspace and execution configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Directory holding one checkout per assigned branch
    pub root: PathBuf,

    /// Workspace path as seen inside the sandbox
    pub agent_path: PathBuf,

    /// git binary
    pub git_path: String,

    /// gh binary
    pub gh_path: String,

    /// Per-command execution timeout
    pub command_timeout_secs: u64,

    /// Commits scanned when the remote branch does not exist yet
    pub fallback_commits: usize,

    /// Author and committer name
    pub author_name: String,

    /// Author and committer email
    pub author_email: String,

    /// Environment variable holding the hosting token
    pub token_env: String,

    /// Where the askpass helper script is written
    pub askpass_path: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/workspaces"),
            agent_path: PathBuf::from("/home/dev/workspace"),
            git_path: "git".to_string(),
            gh_path: "gh".to_string(),
            command_timeout_secs: 300,
            fallback_commits: 20,
            author_name: "sandgate-agent".to_string(),
            author_email: "agent@sandgate.local".to_string(),
            token_env: "GITHUB_PAT".to_string(),
            askpass_path: data_dir().join("askpass.sh"),
        }
    }
}

/// Hosting provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostingConfig {
    /// The only repository the hosting CLI may target (`owner/name`)
    pub repository: Option<String>,

    /// Remotes commands may use, by name, with the URL each one is pinned
    /// to. Credentialed git runs ignore whatever the checkout's own config
    /// says about them.
    pub remotes: BTreeMap<String, String>,

    /// Remote used when a push names none
    pub default_remote: String,
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self {
            repository: None,
            remotes: BTreeMap::new(),
            default_remote: "origin".to_string(),
        }
    }
}

impl HostingConfig {
    /// Configured remote names
    pub fn remote_names(&self) -> Vec<String> {
        self.remotes.keys().cloned().collect()
    }
}

/// Decision log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSON lines file; `None` keeps decisions in memory only
    pub path: Option<PathBuf>,

    /// Decisions kept in memory for queries
    pub recent_capacity: usize,

    /// Broadcast channel capacity for live subscribers
    pub broadcast_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: Some(data_dir().join("decisions.jsonl")),
            recent_capacity: 1000,
            broadcast_capacity: 256,
        }
    }
}

/// Traffic policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Verdict when no domain or route rule matches
    pub default_action: RuleAction,

    /// Method and path rules, evaluated first
    pub route_rules: Vec<RouteRule>,

    /// Host rules, evaluated after route rules
    pub domain_rules: Vec<DomainRule>,

    /// Headers skipped by the content scan for matching hosts
    pub header_exemptions: Vec<HeaderExemption>,

    /// Credential patterns for the in-process scanner
    pub secret_patterns: Vec<SecretPattern>,

    /// Also scan base64-decoded segments
    pub decode_base64: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_action: RuleAction::Allow,
            route_rules: default_route_rules(),
            domain_rules: default_domain_rules(),
            header_exemptions: Vec::new(),
            secret_patterns: default_secret_patterns(),
            decode_base64: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SandgateConfig::default();
        config.validate().unwrap();
        assert_eq!(config.workspace.command_timeout_secs, 300);
        assert_eq!(config.hosting.default_remote, "origin");
        assert!(!config.policy.domain_rules.is_empty());
    }

    #[test]
    fn test_parse_toml() {
        let text = r#"
[dispatcher]
port = 9000

[hosting]
repository = "acme/widgets"

[hosting.remotes]
origin = "https://github.com/acme/widgets.git"
upstream = "https://github.com/upstream/widgets.git"

[scanner]
backends = ["patterns", "process"]
timeout_ms = 5000

[scanner.process]
command = "trufflehog"
args = ["--stdin"]

[[policy.domain_rules]]
host = "*.example.net"
action = "deny"
"#;
        let config = SandgateConfig::parse(text, Path::new("config.toml")).unwrap();
        assert_eq!(config.dispatcher.port, 9000);
        assert_eq!(config.hosting.repository.as_deref(), Some("acme/widgets"));
        assert_eq!(
            config.hosting.remotes.get("origin").map(String::as_str),
            Some("https://github.com/acme/widgets.git")
        );
        assert_eq!(config.hosting.remote_names(), vec!["origin", "upstream"]);
        assert_eq!(config.scanner.backends.len(), 2);
        assert_eq!(
            config.scanner.process.unwrap().match_exit_codes,
            vec![183]
        );
        assert_eq!(config.policy.domain_rules.len(), 1);
        // Unset sections keep their defaults
        assert_eq!(config.proxy.port, 8080);
    }

    #[test]
    fn test_parse_yaml() {
        let text = "proxy:\n  port: 3128\n  max_body_bytes: 1024\n";
        let config = SandgateConfig::parse(text, Path::new("config.yaml")).unwrap();
        assert_eq!(config.proxy.port, 3128);
        assert_eq!(config.proxy.max_body_bytes, 1024);
    }

    #[test]
    fn test_admin_listener_separate() {
        let config = SandgateConfig::default();
        assert_eq!(config.admin.host, "127.0.0.1");
        assert_ne!(config.admin.port, config.dispatcher.port);

        let text = "[dispatcher]\nport = 9000\n\n[admin]\nport = 9000\n";
        assert!(SandgateConfig::parse(text, Path::new("c.toml")).is_err());
    }

    #[test]
    fn test_invalid_repository() {
        let text = "[hosting]\nrepository = \"no-slash\"\n";
        assert!(SandgateConfig::parse(text, Path::new("c.toml")).is_err());
    }

    #[test]
    fn test_default_remote_must_be_listed() {
        let text = "[hosting.remotes]\nupstream = \"https://github.com/u/w.git\"\n";
        assert!(SandgateConfig::parse(text, Path::new("c.toml")).is_err());

        let text = "[hosting.remotes]\norigin = \"\"\n";
        assert!(SandgateConfig::parse(text, Path::new("c.toml")).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandgate.toml");
        std::fs::write(&path, "[workspace]\nroot = \"/srv/ws\"\n").unwrap();
        let config = SandgateConfig::load(&path).unwrap();
        assert_eq!(config.workspace.root, PathBuf::from("/srv/ws"));
        assert!(SandgateConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
