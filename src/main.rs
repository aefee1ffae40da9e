//! sandgate - egress and version-control gatekeeper for sandboxed coding agents
//!
//! Runs the dispatcher and traffic engine, and doubles as the session-side
//! shim that forwards `git`/`gh` invocations to the dispatcher.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sandgate::{
    audit::verify_file,
    command::{CommandRequest, CommandResponse},
    config::{default_config_path, SandgateConfig},
    gateway::GatewayBuilder,
    policy::PolicyStore,
    traffic::CertificateAuthority,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_DISPATCHER_URL: &str = "http://127.0.0.1:8077";

#[derive(Parser)]
#[command(name = "sandgate")]
#[command(version)]
#[command(about = "Egress and version-control gatekeeper for sandboxed coding agents")]
struct Cli {
    /// Configuration file path (TOML or YAML)
    #[arg(short, long, env = "SANDGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the dispatcher and the traffic engine
    Serve {
        /// Override the dispatcher port
        #[arg(long)]
        dispatcher_port: Option<u16>,

        /// Override the admin API port
        #[arg(long)]
        admin_port: Option<u16>,

        /// Override the traffic listener port
        #[arg(long)]
        proxy_port: Option<u16>,
    },

    /// Validate the configuration and compile the traffic policy
    Check,

    /// Print the sandbox CA certificate, generating it if missing
    Ca {
        /// Replace an existing CA with a freshly generated one
        #[arg(long)]
        regenerate: bool,
    },

    /// Forward a git or gh invocation to the dispatcher (runs in the sandbox)
    Shim {
        /// `git` or `gh`
        program: String,

        /// Arguments passed through unchanged
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Decision log maintenance
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },

    /// Run diagnostics
    Doctor,

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[derive(Subcommand)]
enum AuditCommands {
    /// Verify the hash chain of a decision log file
    Verify {
        /// Log file; defaults to the configured audit path
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    match cli.command {
        Commands::Shim { program, args } => {
            let code = run_shim(program, args).await?;
            std::process::exit(code);
        }
        Commands::Serve {
            dispatcher_port,
            admin_port,
            proxy_port,
        } => {
            let (config, path) = load_config(cli.config)?;
            let ports = Ports {
                dispatcher: dispatcher_port,
                admin: admin_port,
                proxy: proxy_port,
            };
            run_serve(config, path, ports).await
        }
        Commands::Check => {
            let (config, path) = load_config(cli.config)?;
            run_check(&config, path)
        }
        Commands::Ca { regenerate } => {
            let (config, _) = load_config(cli.config)?;
            run_ca(&config, regenerate)
        }
        Commands::Audit {
            command: AuditCommands::Verify { path },
        } => {
            let (config, _) = load_config(cli.config)?;
            run_audit_verify(&config, path).await
        }
        Commands::Doctor => {
            let (config, path) = load_config(cli.config)?;
            run_doctor(&config, path).await
        }
        Commands::Config { default: true } => show_config(&SandgateConfig::default()),
        Commands::Config { default: false } => {
            let (config, _) = load_config(cli.config)?;
            show_config(&config)
        }
    }
}

fn init_logging(cli: &Cli) {
    let default_level = match (&cli.command, cli.verbose) {
        (_, true) => "debug",
        // Shim logs land on the agent's terminal
        (Commands::Shim { .. }, false) => "warn",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("sandgate={},tower_http=info", default_level).into());
    let json = cli.log_format == LogFormat::Json;

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .init();
}

/// Explicit path, else the per-user default if it exists, else built-in defaults.
fn load_config(explicit: Option<PathBuf>) -> Result<(SandgateConfig, Option<PathBuf>)> {
    let path = explicit.or_else(|| Some(default_config_path()).filter(|p| p.exists()));
    match path {
        Some(path) => {
            let config = SandgateConfig::load(&path)?;
            tracing::debug!(path = %path.display(), "Loaded configuration");
            Ok((config, Some(path)))
        }
        None => Ok((SandgateConfig::default(), None)),
    }
}

/// Listener port overrides from the command line
struct Ports {
    dispatcher: Option<u16>,
    admin: Option<u16>,
    proxy: Option<u16>,
}

async fn run_serve(config: SandgateConfig, path: Option<PathBuf>, ports: Ports) -> Result<()> {
    let mut builder = GatewayBuilder::new().config(config);
    if let Some(path) = path {
        builder = builder.config_path(path);
    }
    if let Some(port) = ports.dispatcher {
        builder = builder.dispatcher_port(port);
    }
    if let Some(port) = ports.admin {
        builder = builder.admin_port(port);
    }
    if let Some(port) = ports.proxy {
        builder = builder.proxy_port(port);
    }

    let gateway = Arc::new(builder.build().await?);
    gateway.start().await?;

    tracing::info!("sandgate is running. Press Ctrl+C to stop, send SIGHUP to reload policy.");
    wait_for_shutdown(&gateway).await?;

    tracing::info!("Shutting down...");
    gateway.stop().await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(gateway: &Arc<sandgate::gateway::Gateway>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return Ok(result?),
            _ = terminate.recv() => return Ok(()),
            _ = hangup.recv() => match gateway.reload_policy().await {
                Ok(generation) => tracing::info!(generation, "Reloaded policy"),
                Err(e) => tracing::error!("Policy reload failed, keeping current policy: {}", e),
            },
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_gateway: &Arc<sandgate::gateway::Gateway>) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn run_check(config: &SandgateConfig, path: Option<PathBuf>) -> Result<()> {
    let store = PolicyStore::new(&config.policy)?;
    let snapshot = store.snapshot();
    match path {
        Some(path) => println!("✓ {} is valid", path.display()),
        None => println!("✓ Built-in defaults are valid"),
    }
    println!("  route rules:     {}", snapshot.table.route_count());
    println!("  domain rules:    {}", snapshot.table.domain_count());
    println!("  secret patterns: {}", snapshot.patterns.len());
    println!("  default action:  {:?}", config.policy.default_action);
    Ok(())
}

fn run_ca(config: &SandgateConfig, regenerate: bool) -> Result<()> {
    let proxy = &config.proxy;
    let ca = if regenerate {
        let ca = CertificateAuthority::generate()?;
        ca.write(&proxy.ca_cert, &proxy.ca_key)?;
        eprintln!("Wrote new CA to {}", proxy.ca_cert.display());
        ca
    } else {
        CertificateAuthority::load_or_generate(&proxy.ca_cert, &proxy.ca_key)?
    };
    print!("{}", ca.cert_pem());
    Ok(())
}

/// Forward one invocation and return the exit code to use.
async fn run_shim(program: String, args: Vec<String>) -> Result<i32> {
    let session_id = std::env::var("SANDGATE_SESSION_ID")
        .context("SANDGATE_SESSION_ID is not set; this shell is not a sandgate session")?;
    let base = std::env::var("SANDGATE_DISPATCHER_URL")
        .unwrap_or_else(|_| DEFAULT_DISPATCHER_URL.to_string());
    let cwd = std::env::current_dir()
        .context("cannot determine working directory")?
        .to_string_lossy()
        .into_owned();

    let request = CommandRequest {
        program,
        args,
        cwd,
        session_id,
        peer: None,
    };

    let url = format!("{}/api/v1/command", base.trim_end_matches('/'));
    let response = match reqwest::Client::new().post(&url).json(&request).send().await {
        Ok(response) => response,
        Err(e) => {
            eprintln!("sandgate: dispatcher unreachable at {}: {}", base, e);
            return Ok(1);
        }
    };
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        eprintln!("sandgate: dispatcher returned {}: {}", status, body);
        return Ok(1);
    }

    let reply: CommandResponse = response
        .json()
        .await
        .context("dispatcher sent an invalid response")?;
    std::io::stdout().write_all(reply.stdout.as_bytes())?;
    std::io::stderr().write_all(reply.stderr.as_bytes())?;
    Ok(reply.exit_code)
}

async fn run_audit_verify(config: &SandgateConfig, path: Option<PathBuf>) -> Result<()> {
    let Some(path) = path.or_else(|| config.audit.path.clone()) else {
        bail!("no log file given and the configured audit log is in-memory");
    };
    match verify_file(&path).await {
        Ok(count) => {
            println!("✓ {}: {} records, chain intact", path.display(), count);
            Ok(())
        }
        Err(e) => bail!("{}: {}", path.display(), e),
    }
}

async fn run_doctor(config: &SandgateConfig, path: Option<PathBuf>) -> Result<()> {
    println!("🔍 sandgate doctor");
    println!();

    println!("Checking configuration...");
    match path {
        Some(path) => println!("  ✓ Configuration file: {}", path.display()),
        None => println!("  ℹ No configuration file found (using defaults)"),
    }
    match PolicyStore::new(&config.policy) {
        Ok(_) => println!("  ✓ Traffic policy compiles"),
        Err(e) => println!("  ✗ Traffic policy: {}", e),
    }
    match &config.hosting.repository {
        Some(repo) => println!("  ✓ Hosting repository: {}", repo),
        None => println!("  ℹ No hosting repository set; every `gh -R` will be denied"),
    }
    if config.hosting.remotes.is_empty() {
        println!("  ℹ No pinned remotes in hosting.remotes; every fetch and push will be denied");
    }
    for (name, url) in &config.hosting.remotes {
        println!("  ✓ Remote {} pinned to {}", name, url);
    }
    if config.admin.host != "127.0.0.1" && config.admin.host != "localhost" {
        println!(
            "  ℹ Admin API binds {}; make sure sessions cannot reach it",
            config.admin.host
        );
    }

    println!();
    println!("Checking tools...");
    for tool in [&config.workspace.git_path, &config.workspace.gh_path] {
        match tokio::process::Command::new(tool).arg("--version").output().await {
            Ok(out) if out.status.success() => {
                let version = String::from_utf8_lossy(&out.stdout);
                println!("  ✓ {}", version.lines().next().unwrap_or(tool.as_str()));
            }
            _ => println!("  ✗ {} not found or not runnable", tool),
        }
    }

    println!();
    println!("Checking workspace...");
    let root = &config.workspace.root;
    if root.is_dir() {
        println!("  ✓ Workspace root: {}", root.display());
    } else {
        println!("  ✗ Workspace root missing: {}", root.display());
    }
    if std::env::var_os(&config.workspace.token_env).is_some() {
        println!("  ✓ Token variable {} is set", config.workspace.token_env);
    } else {
        println!(
            "  ℹ Token variable {} is not set; remote operations run without credentials",
            config.workspace.token_env
        );
    }

    println!();
    println!("Checking certificate authority...");
    let proxy = &config.proxy;
    if proxy.ca_cert.exists() && proxy.ca_key.exists() {
        match CertificateAuthority::load_or_generate(&proxy.ca_cert, &proxy.ca_key) {
            Ok(_) => println!("  ✓ CA loaded from {}", proxy.ca_cert.display()),
            Err(e) => println!("  ✗ CA unusable: {}", e),
        }
    } else {
        println!("  ℹ No CA yet; one is generated on first start");
    }

    println!();
    println!("Doctor check complete!");
    Ok(())
}

fn show_config(config: &SandgateConfig) -> Result<()> {
    let toml = toml::to_string_pretty(config)?;
    println!("{}", toml);
    Ok(())
}
