//! git/gh execution in per-branch checkouts

use crate::command::{ExecOutput, Execution, Program, Workspace};
use crate::config::{HostingConfig, WorkspaceConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use zeroize::Zeroizing;

/// Environment variable the askpass helper reads the token from
const TOKEN_VAR: &str = "SANDGATE_GIT_TOKEN";

/// Static helper: answers git's username and password prompts from the
/// child's own environment, so the token never touches disk.
const ASKPASS_SCRIPT: &str = r#"#!/bin/sh
case "$1" in
  Username*) echo "x-access-token" ;;
  *) echo "$SANDGATE_GIT_TOKEN" ;;
esac
"#;

/// State inspection deadline
const INSPECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings passed with `-c` on every git run. Command-line config wins
/// over anything in the checkout for single-valued keys.
const PINNED_CONFIG: &[&str] = &[
    "core.hooksPath=/dev/null",
    "core.fsmonitor=false",
    "credential.helper=",
    "push.default=current",
    "push.followTags=false",
    "push.recurseSubmodules=no",
    "fetch.recurseSubmodules=false",
    "submodule.recurse=false",
    "protocol.ext.allow=never",
];

/// Config sections a checkout may not set at all: they can reroute
/// transport or hand credentials to another program.
const UNTRUSTED_SECTIONS: &[&str] = &["http.", "url.", "credential."];

const UNTRUSTED_KEYS: &[&str] = &["core.sshcommand", "core.gitproxy", "core.askpass"];

/// Per-remote settings that do not affect where data or credentials go
const HARMLESS_REMOTE_KEYS: &[&str] = &[
    "fetch",
    "tagopt",
    "prune",
    "prunetags",
    "skipdefaultupdate",
    "skipfetchall",
];

/// Workspace backed by real git and gh binaries
pub struct GitWorkspace {
    git: String,
    gh: String,
    timeout: Duration,
    fallback_commits: usize,
    author_name: String,
    author_email: String,
    home: PathBuf,
    askpass: PathBuf,
    repository: Option<String>,
    remotes: BTreeMap<String, String>,
    token: Option<Zeroizing<String>>,
}

impl GitWorkspace {
    /// Create a new workspace runner; reads the hosting token from the
    /// configured environment variable.
    pub fn new(config: &WorkspaceConfig, hosting: &HostingConfig) -> Self {
        let token = std::env::var(&config.token_env).ok().map(Zeroizing::new);
        if token.is_none() {
            tracing::warn!(
                env = %config.token_env,
                "No hosting token configured; remote operations will run unauthenticated"
            );
        }

        Self {
            git: config.git_path.clone(),
            gh: config.gh_path.clone(),
            timeout: Duration::from_secs(config.command_timeout_secs),
            fallback_commits: config.fallback_commits,
            author_name: config.author_name.clone(),
            author_email: config.author_email.clone(),
            home: config.root.clone(),
            askpass: config.askpass_path.clone(),
            repository: hosting.repository.clone(),
            remotes: hosting.remotes.clone(),
            token,
        }
    }

    /// Replace the token (tests, rotation).
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.map(Zeroizing::new);
        self
    }

    /// Write the askpass helper. Idempotent.
    pub async fn install_askpass(&self) -> Result<()> {
        if let Some(parent) = self.askpass.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Workspace(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }
        tokio::fs::write(&self.askpass, ASKPASS_SCRIPT)
            .await
            .map_err(|e| {
                Error::Workspace(format!(
                    "Failed to write askpass helper {}: {}",
                    self.askpass.display(),
                    e
                ))
            })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&self.askpass, std::fs::Permissions::from_mode(0o700))
                .await?;
        }

        tracing::debug!(path = %self.askpass.display(), "Installed askpass helper");
        Ok(())
    }

    /// Base command: cleared environment plus managed identity.
    fn command(&self, program: Program, workdir: &Path) -> Command {
        let binary = match program {
            Program::Git => &self.git,
            Program::Gh => &self.gh,
        };
        let mut cmd = Command::new(binary);
        cmd.current_dir(workdir)
            .env_clear()
            .env("PATH", std::env::var_os("PATH").unwrap_or_default())
            .env("HOME", &self.home)
            .env("LANG", "C.UTF-8")
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env("GIT_AUTHOR_NAME", &self.author_name)
            .env("GIT_AUTHOR_EMAIL", &self.author_email)
            .env("GIT_COMMITTER_NAME", &self.author_name)
            .env("GIT_COMMITTER_EMAIL", &self.author_email)
            .env("GH_PROMPT_DISABLED", "1")
            .env("NO_COLOR", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match program {
            Program::Git => {
                cmd.env("GIT_CONFIG_GLOBAL", "/dev/null");
            }
            Program::Gh => {
                if let Some(repo) = &self.repository {
                    cmd.env("GH_REPO", repo);
                }
            }
        }
        cmd
    }

    /// `-c` arguments for every git run: fixed settings plus each configured
    /// remote's URL.
    fn pinned_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(PINNED_CONFIG.len() * 2 + self.remotes.len() * 4);
        for setting in PINNED_CONFIG {
            args.push("-c".to_string());
            args.push(setting.to_string());
        }
        for (name, url) in &self.remotes {
            args.push("-c".to_string());
            args.push(format!("remote.{}.url={}", name, url));
            args.push("-c".to_string());
            args.push(format!("remote.{}.pushurl={}", name, url));
        }
        args
    }

    /// The checkout's own config (local file and its includes), without
    /// the pinned settings.
    async fn repository_config(&self, workdir: &Path) -> Result<Vec<(String, String)>> {
        let mut cmd = self.command(Program::Git, workdir);
        cmd.args(["config", "--list", "-z"]);
        let output = tokio::time::timeout(INSPECT_TIMEOUT, cmd.output())
            .await
            .map_err(|_| Error::Workspace("git config --list timed out".to_string()))?
            .map_err(|e| Error::Workspace(format!("Failed to run git: {}", e)))?;
        if !output.status.success() {
            return Err(Error::Workspace(format!(
                "git config --list failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_config_list(&output.stdout))
    }

    fn add_credentials(&self, cmd: &mut Command, program: Program) {
        let Some(token) = &self.token else { return };
        match program {
            Program::Git => {
                cmd.env("GIT_ASKPASS", &self.askpass)
                    .env(TOKEN_VAR, token.as_str());
            }
            Program::Gh => {
                cmd.env("GH_TOKEN", token.as_str());
            }
        }
    }

    /// Run git for inspection and return stdout on success.
    async fn inspect(&self, workdir: &Path, args: &[&str]) -> Result<Vec<u8>> {
        let mut cmd = self.command(Program::Git, workdir);
        cmd.args(self.pinned_args()).args(args);
        let output = tokio::time::timeout(INSPECT_TIMEOUT, cmd.output())
            .await
            .map_err(|_| Error::Workspace(format!("git {} timed out", args.join(" "))))?
            .map_err(|e| Error::Workspace(format!("Failed to run git: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Workspace(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl Workspace for GitWorkspace {
    async fn current_branch(&self, workdir: &Path) -> Option<String> {
        let stdout = self
            .inspect(workdir, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await
            .ok()?;
        let branch = String::from_utf8_lossy(&stdout).trim().to_string();
        if branch.is_empty() || branch == "HEAD" {
            None
        } else {
            Some(branch)
        }
    }

    async fn outgoing_changeset(
        &self,
        workdir: &Path,
        remote: &str,
        src: &str,
        dst: &str,
    ) -> Result<Vec<u8>> {
        if src.starts_with('-') {
            return Err(Error::Workspace(format!("invalid revision '{}'", src)));
        }

        let remote_ref = format!("refs/remotes/{}/{}", remote, dst);
        let has_remote = self
            .inspect(workdir, &["rev-parse", "--verify", "--quiet", &remote_ref])
            .await
            .is_ok();

        if has_remote {
            let range = format!("{}..{}", remote_ref, src);
            self.inspect(
                workdir,
                &["log", "-p", "--no-color", "--no-ext-diff", &range, "--"],
            )
            .await
        } else {
            let count = format!("-{}", self.fallback_commits);
            self.inspect(
                workdir,
                &["log", "-p", "--no-color", "--no-ext-diff", &count, src, "--"],
            )
            .await
        }
    }

    async fn verify_remotes(&self, workdir: &Path) -> Result<()> {
        if self.remotes.is_empty() {
            return Err(Error::Workspace(
                "no remote URLs are pinned in hosting.remotes".to_string(),
            ));
        }
        let entries = self.repository_config(workdir).await?;
        check_repository_config(&entries, &self.remotes).map_err(Error::Workspace)
    }

    async fn execute(&self, execution: Execution<'_>) -> ExecOutput {
        let mut cmd = self.command(execution.program, execution.workdir);
        if execution.program == Program::Git {
            cmd.args(self.pinned_args());
        }
        cmd.args(execution.args);
        if execution.credentials {
            self.add_credentials(&mut cmd, execution.program);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecOutput::failed(format!(
                    "failed to execute {}: {}",
                    execution.program, e
                ))
            }
        };

        tokio::select! {
            _ = execution.cancel.cancelled() => {
                tracing::info!(program = %execution.program, "Session deregistered; command cancelled");
                ExecOutput::failed("session deregistered; command cancelled")
            }
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => match result {
                Ok(Ok(output)) => ExecOutput {
                    exit_code: output.status.code().unwrap_or(1),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                },
                Ok(Err(e)) => ExecOutput::failed(format!("failed to execute {}: {}", execution.program, e)),
                Err(_) => ExecOutput::failed(format!(
                    "{} command timed out after {} seconds",
                    execution.program,
                    self.timeout.as_secs()
                )),
            },
        }
    }
}

/// Parse `git config --list -z`: `key\nvalue\0`, or `key\0` for a bare
/// boolean.
fn parse_config_list(raw: &[u8]) -> Vec<(String, String)> {
    String::from_utf8_lossy(raw)
        .split('\0')
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('\n') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (entry.to_string(), String::new()),
        })
        .collect()
}

/// Reject checkout config that could send a credentialed operation
/// somewhere other than the pinned remotes. Keys arrive as git prints them:
/// section and variable lowercase, subsection verbatim.
fn check_repository_config(
    entries: &[(String, String)],
    remotes: &BTreeMap<String, String>,
) -> std::result::Result<(), String> {
    let names_remote = |value: &str| value == "." || remotes.contains_key(value);

    for (key, value) in entries {
        if UNTRUSTED_SECTIONS.iter().any(|s| key.starts_with(s))
            || UNTRUSTED_KEYS.contains(&key.as_str())
        {
            return Err(format!("'{}' is set in the checkout", key));
        }

        if key == "remote.pushdefault" && !names_remote(value.as_str()) {
            return Err(format!("remote.pushDefault names '{}'", value));
        }

        if let Some(rest) = key.strip_prefix("remote.") {
            if let Some((name, var)) = rest.rsplit_once('.') {
                if let Some(pinned) = remotes.get(name) {
                    match var {
                        "url" | "pushurl" if value == pinned => {}
                        "url" | "pushurl" => {
                            return Err(format!("{} points at '{}', not '{}'", key, value, pinned))
                        }
                        v if HARMLESS_REMOTE_KEYS.contains(&v) => {}
                        _ => return Err(format!("'{}' is set in the checkout", key)),
                    }
                }
            }
        }

        if let Some(rest) = key.strip_prefix("branch.") {
            if let Some((_, var)) = rest.rsplit_once('.') {
                if matches!(var, "remote" | "pushremote") && !names_remote(value.as_str()) {
                    return Err(format!("{} names '{}'", key, value));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn workspace(dir: &Path) -> GitWorkspace {
        let config = WorkspaceConfig {
            root: dir.to_path_buf(),
            askpass_path: dir.join("askpass.sh"),
            command_timeout_secs: 5,
            ..Default::default()
        };
        GitWorkspace::new(&config, &HostingConfig::default()).with_token(None)
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn run(ws: &GitWorkspace, dir: &Path, list: &[&str]) -> ExecOutput {
        let argv = args(list);
        ws.execute(Execution {
            program: Program::Git,
            args: &argv,
            workdir: dir,
            credentials: false,
            cancel: CancellationToken::new(),
        })
        .await
    }

    #[tokio::test]
    async fn test_branch_and_changeset() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("feature-a");
        std::fs::create_dir_all(&repo).unwrap();
        let ws = workspace(tmp.path());

        assert_eq!(run(&ws, &repo, &["init", "-q"]).await.exit_code, 0);
        run(&ws, &repo, &["symbolic-ref", "HEAD", "refs/heads/feature-a"]).await;
        assert_eq!(ws.current_branch(&repo).await, None);

        std::fs::write(repo.join("notes.txt"), "hello changeset\n").unwrap();
        assert_eq!(run(&ws, &repo, &["add", "notes.txt"]).await.exit_code, 0);
        let commit = run(&ws, &repo, &["commit", "-q", "-m", "first"]).await;
        assert_eq!(commit.exit_code, 0, "{}", commit.stderr);

        assert_eq!(
            ws.current_branch(&repo).await.as_deref(),
            Some("feature-a")
        );

        // No remote-tracking ref: falls back to recent commits
        let patch = ws
            .outgoing_changeset(&repo, "origin", "HEAD", "feature-a")
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&patch).contains("+hello changeset"));

        assert!(ws
            .outgoing_changeset(&repo, "origin", "--output=/tmp/x", "feature-a")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_identity_applied() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("b");
        std::fs::create_dir_all(&repo).unwrap();
        let ws = workspace(tmp.path());

        run(&ws, &repo, &["init", "-q"]).await;
        std::fs::write(repo.join("f"), "x").unwrap();
        run(&ws, &repo, &["add", "f"]).await;
        run(&ws, &repo, &["commit", "-q", "-m", "m"]).await;

        let log = run(&ws, &repo, &["log", "-1", "--format=%an <%ae>"]).await;
        assert_eq!(log.stdout.trim(), "sandgate-agent <agent@sandgate.local>");
    }

    #[tokio::test]
    async fn test_cancellation_stops_command() {
        let tmp = tempfile::tempdir().unwrap();
        let config = WorkspaceConfig {
            root: tmp.path().to_path_buf(),
            gh_path: "sleep".to_string(),
            command_timeout_secs: 30,
            ..Default::default()
        };
        let ws = GitWorkspace::new(&config, &HostingConfig::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let argv = args(&["10"]);
        let output = ws
            .execute(Execution {
                program: Program::Gh,
                args: &argv,
                workdir: tmp.path(),
                credentials: false,
                cancel,
            })
            .await;
        assert_eq!(output.exit_code, 1);
        assert!(output.stderr.contains("cancelled"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let config = WorkspaceConfig {
            root: tmp.path().to_path_buf(),
            gh_path: "sleep".to_string(),
            command_timeout_secs: 1,
            ..Default::default()
        };
        let ws = GitWorkspace::new(&config, &HostingConfig::default());
        let argv = args(&["5"]);
        let output = ws
            .execute(Execution {
                program: Program::Gh,
                args: &argv,
                workdir: tmp.path(),
                credentials: false,
                cancel: CancellationToken::new(),
            })
            .await;
        assert_eq!(output.exit_code, 1);
        assert!(output.stderr.contains("timed out"));
    }

    fn pinned(url: &str) -> BTreeMap<String, String> {
        [("origin".to_string(), url.to_string())].into_iter().collect()
    }

    fn entries(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_config_list() {
        let parsed = parse_config_list(b"remote.origin.url\nhttps://x/y.git\0core.bare\nfalse\0core.flag\0");
        assert_eq!(
            parsed,
            entries(&[
                ("remote.origin.url", "https://x/y.git"),
                ("core.bare", "false"),
                ("core.flag", ""),
            ])
        );
    }

    #[test]
    fn test_repository_config_checks() {
        let remotes = pinned("https://github.com/acme/widgets.git");

        let ok = entries(&[
            ("core.bare", "false"),
            ("remote.origin.url", "https://github.com/acme/widgets.git"),
            ("remote.origin.fetch", "+refs/heads/*:refs/remotes/origin/*"),
            ("branch.feature-a.remote", "origin"),
            ("branch.feature-a.merge", "refs/heads/feature-a"),
            ("branch.scratch.remote", "."),
            ("remote.scratch.url", "https://elsewhere.example/x.git"),
        ]);
        assert!(check_repository_config(&ok, &remotes).is_ok());

        for bad in [
            ("remote.origin.url", "https://evil.example/x.git"),
            ("remote.origin.pushurl", "/tmp/evil.git"),
            ("remote.origin.push", "refs/heads/*:refs/heads/*"),
            ("remote.origin.mirror", "true"),
            ("remote.origin.receivepack", "sh -c id"),
            ("url.https://evil.example/.insteadof", "https://github.com/"),
            ("url.https://evil.example/.pushinsteadof", "https://github.com/"),
            ("http.proxy", "http://evil.example:8080"),
            ("http.https://github.com/.sslverify", "false"),
            ("credential.helper", "!sh -c 'cat > /tmp/leak'"),
            ("core.sshcommand", "ssh -o ProxyCommand=evil"),
            ("branch.feature-a.pushremote", "https://evil.example/x.git"),
            ("branch.feature-a.remote", "scratch"),
            ("remote.pushdefault", "scratch"),
        ] {
            let err = check_repository_config(&entries(&[bad]), &remotes).unwrap_err();
            assert!(err.contains(bad.0) || err.contains("pushDefault"), "{:?}: {}", bad, err);
        }
    }

    fn git_cmd(dir: &Path, list: &[&str]) -> std::process::Output {
        std::process::Command::new("git")
            .current_dir(dir)
            .env("GIT_CONFIG_GLOBAL", "/dev/null")
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .args(list)
            .output()
            .unwrap()
    }

    #[tokio::test]
    async fn test_credentialed_push_ignores_checkout_remote_and_hooks() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let good = tmp.path().join("good.git");
        let evil = tmp.path().join("evil.git");
        let leak = tmp.path().join("leak");
        let repo = tmp.path().join("feature-a");
        for bare in [&good, &evil] {
            assert!(git_cmd(tmp.path(), &["init", "-q", "--bare", bare.to_str().unwrap()])
                .status
                .success());
        }
        std::fs::create_dir_all(&repo).unwrap();

        let config = WorkspaceConfig {
            root: tmp.path().to_path_buf(),
            askpass_path: tmp.path().join("askpass.sh"),
            command_timeout_secs: 10,
            ..Default::default()
        };
        let hosting = HostingConfig {
            remotes: pinned(good.to_str().unwrap()),
            ..Default::default()
        };
        let ws = GitWorkspace::new(&config, &hosting).with_token(Some("SUPERSECRET_TOKEN".to_string()));

        run(&ws, &repo, &["init", "-q"]).await;
        run(&ws, &repo, &["checkout", "-q", "-b", "feature-a"]).await;
        std::fs::write(repo.join("f"), "x").unwrap();
        run(&ws, &repo, &["add", "f"]).await;
        assert_eq!(run(&ws, &repo, &["commit", "-q", "-m", "m"]).await.exit_code, 0);

        // What an agent with write access to the checkout could plant
        git_cmd(&repo, &["remote", "add", "origin", evil.to_str().unwrap()]);
        let hook = repo.join(".git/hooks/pre-push");
        std::fs::write(
            &hook,
            format!("#!/bin/sh\necho \"$SANDGATE_GIT_TOKEN\" > {}\n", leak.display()),
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let err = ws.verify_remotes(&repo).await.unwrap_err();
        assert!(err.to_string().contains("remote.origin.url"), "{}", err);

        // Even if it ran, the push goes to the pinned URL and no hook fires
        let argv = args(&["push", "origin", "feature-a"]);
        let output = ws
            .execute(Execution {
                program: Program::Git,
                args: &argv,
                workdir: &repo,
                credentials: true,
                cancel: CancellationToken::new(),
            })
            .await;
        assert_eq!(output.exit_code, 0, "{}", output.stderr);

        let refs = |dir: &Path| String::from_utf8_lossy(&git_cmd(dir, &["for-each-ref"]).stdout).into_owned();
        assert!(refs(&good).contains("refs/heads/feature-a"));
        assert!(refs(&evil).is_empty());
        assert!(!leak.exists());
    }

    #[tokio::test]
    async fn test_askpass_reads_token_from_env() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace(tmp.path());
        ws.install_askpass().await.unwrap();

        let output = tokio::process::Command::new(tmp.path().join("askpass.sh"))
            .arg("Password for 'https://github.com': ")
            .env(TOKEN_VAR, "tok123")
            .output()
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "tok123");

        let script = std::fs::read_to_string(tmp.path().join("askpass.sh")).unwrap();
        assert!(!script.contains("tok123"));
    }
}
