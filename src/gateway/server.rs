//! Gateway server implementation

use crate::audit::DecisionLog;
use crate::command::{CommandPolicyEngine, Workspace};
use crate::config::SandgateConfig;
use crate::error::{Error, Result};
use crate::policy::{PolicyStore, TrafficPolicy};
use crate::scanner::{build_scanner, BoundedScanner};
use crate::session::SessionManager;
use crate::traffic::{CertificateAuthority, TrafficEngine};
use crate::workspace::{GitWorkspace, WorkspacePaths};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Gateway server state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayState {
    /// Not started
    Stopped,
    /// Starting up
    Starting,
    /// Running
    Running,
    /// Shutting down
    ShuttingDown,
}

/// Addresses the listeners actually bound to
#[derive(Debug, Clone, Copy)]
struct Bound {
    dispatcher: SocketAddr,
    admin: SocketAddr,
    proxy: SocketAddr,
}

/// sandgate gateway: owns every component and its three listeners
pub struct Gateway {
    config: SandgateConfig,
    config_path: Option<PathBuf>,
    state: Arc<RwLock<GatewayState>>,
    sessions: Arc<SessionManager>,
    store: Arc<PolicyStore>,
    log: Arc<DecisionLog>,
    commands: Arc<CommandPolicyEngine>,
    traffic: Arc<TrafficEngine>,
    ca: Arc<CertificateAuthority>,
    shutdown: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    bound: RwLock<Option<Bound>>,
}

/// Components a caller may supply instead of building them from config
#[derive(Default)]
struct Overrides {
    workspace: Option<Arc<dyn Workspace>>,
    scanner: Option<BoundedScanner>,
    ca: Option<CertificateAuthority>,
}

impl Gateway {
    /// Create a new gateway with the given configuration
    pub async fn new(config: SandgateConfig) -> Result<Self> {
        Self::assemble(config, None, Overrides::default()).await
    }

    async fn assemble(
        config: SandgateConfig,
        config_path: Option<PathBuf>,
        overrides: Overrides,
    ) -> Result<Self> {
        config.validate()?;

        let sessions = Arc::new(SessionManager::new());
        let store = Arc::new(PolicyStore::new(&config.policy)?);
        let scanner = match overrides.scanner {
            Some(scanner) => scanner,
            None => build_scanner(&config.scanner, store.clone())?,
        };
        let log = DecisionLog::open(&config.audit).await?;

        let workspace: Arc<dyn Workspace> = match overrides.workspace {
            Some(workspace) => workspace,
            None => {
                let git = GitWorkspace::new(&config.workspace, &config.hosting);
                git.install_askpass().await?;
                Arc::new(git)
            }
        };
        let paths = WorkspacePaths::new(
            config.workspace.agent_path.clone(),
            config.workspace.root.clone(),
        );
        let commands = Arc::new(CommandPolicyEngine::new(
            sessions.clone(),
            workspace,
            scanner.clone(),
            log.clone(),
            config.hosting.clone(),
            paths,
        ));

        let ca = Arc::new(match overrides.ca {
            Some(ca) => ca,
            None => {
                CertificateAuthority::load_or_generate(&config.proxy.ca_cert, &config.proxy.ca_key)?
            }
        });
        let traffic = Arc::new(TrafficEngine::new(
            &config.proxy,
            sessions.clone(),
            TrafficPolicy::new(store.clone(), scanner),
            log.clone(),
            ca.clone(),
        )?);

        Ok(Self {
            config,
            config_path,
            state: Arc::new(RwLock::new(GatewayState::Stopped)),
            sessions,
            store,
            log,
            commands,
            traffic,
            ca,
            shutdown: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
            bound: RwLock::new(None),
        })
    }

    /// Get current state
    pub async fn state(&self) -> GatewayState {
        *self.state.read().await
    }

    /// Bind the dispatcher, admin and traffic listeners and start serving.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != GatewayState::Stopped {
            return Err(Error::Gateway("Gateway already running".to_string()));
        }
        *state = GatewayState::Starting;
        drop(state);

        tracing::info!("Starting sandgate gateway");

        let listeners = self.bind().await;
        let (dispatcher, admin, proxy) = match listeners {
            Ok(listeners) => listeners,
            Err(e) => {
                *self.state.write().await = GatewayState::Stopped;
                return Err(e);
            }
        };
        let bound = Bound {
            dispatcher: dispatcher.local_addr()?,
            admin: admin.local_addr()?,
            proxy: proxy.local_addr()?,
        };
        *self.bound.write().await = Some(bound);

        let token = CancellationToken::new();
        *self.shutdown.lock().await = token.clone();

        // The command route authenticates callers by peer address.
        let app = crate::api::build_app(self.clone());
        let api_token = token.clone();
        let api_task = tokio::spawn(async move {
            let result = axum::serve(
                dispatcher,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { api_token.cancelled().await })
            .await;
            if let Err(e) = result {
                tracing::error!("Dispatcher API failed: {}", e);
            }
        });

        let admin_app = crate::api::build_admin_app(self.clone());
        let admin_token = token.clone();
        let admin_task = tokio::spawn(async move {
            let result = axum::serve(admin, admin_app)
                .with_graceful_shutdown(async move { admin_token.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!("Admin API failed: {}", e);
            }
        });

        let traffic = self.traffic.clone();
        let traffic_task = tokio::spawn(async move {
            if let Err(e) = traffic.serve(proxy, token).await {
                tracing::error!("Traffic engine failed: {}", e);
            }
        });

        self.tasks
            .lock()
            .await
            .extend([api_task, admin_task, traffic_task]);
        *self.state.write().await = GatewayState::Running;

        tracing::info!(
            dispatcher = %bound.dispatcher,
            admin = %bound.admin,
            proxy = %bound.proxy,
            "sandgate gateway started"
        );

        Ok(())
    }

    async fn bind(&self) -> Result<(TcpListener, TcpListener, TcpListener)> {
        let config = &self.config;
        let dispatcher = bind_listener(
            "dispatcher",
            &config.dispatcher.host,
            config.dispatcher.port,
        )
        .await?;
        let admin = bind_listener("admin API", &config.admin.host, config.admin.port).await?;
        let proxy = bind_listener("traffic listener", &config.proxy.host, config.proxy.port).await?;
        Ok((dispatcher, admin, proxy))
    }

    /// Stop the gateway: close every listener, deregister every session
    /// (cancelling in-flight work) and flush the decision log.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state != GatewayState::Running {
            return Ok(());
        }
        *state = GatewayState::ShuttingDown;
        drop(state);

        tracing::info!("Stopping sandgate gateway");

        self.shutdown.lock().await.cancel();
        let removed = self.sessions.deregister_all().await;
        if removed > 0 {
            tracing::info!(sessions = removed, "Deregistered sessions on shutdown");
        }

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Gateway task ended abnormally: {}", e);
            }
        }
        self.log.flush().await;
        *self.bound.write().await = None;

        *self.state.write().await = GatewayState::Stopped;
        tracing::info!("sandgate gateway stopped");

        Ok(())
    }

    /// Re-read the policy section from the config file and swap it in.
    ///
    /// Without a config file the in-memory policy is recompiled. Other
    /// sections of the file are ignored until restart.
    pub async fn reload_policy(&self) -> Result<u64> {
        let policy = match &self.config_path {
            Some(path) => SandgateConfig::load(path)?.policy,
            None => self.config.policy.clone(),
        };
        self.store.reload(&policy)
    }

    /// Get session manager
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Get command policy engine
    pub fn commands(&self) -> &Arc<CommandPolicyEngine> {
        &self.commands
    }

    /// Get the decision log
    pub fn log(&self) -> &Arc<DecisionLog> {
        &self.log
    }

    /// Get the live policy store
    pub fn policy(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Get the sandbox certificate authority
    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    /// Get configuration
    pub fn config(&self) -> &SandgateConfig {
        &self.config
    }

    /// Dispatcher API address, once started
    pub async fn dispatcher_addr(&self) -> Option<SocketAddr> {
        self.bound.read().await.map(|b| b.dispatcher)
    }

    /// Admin API address, once started
    pub async fn admin_addr(&self) -> Option<SocketAddr> {
        self.bound.read().await.map(|b| b.admin)
    }

    /// Traffic listener address, once started
    pub async fn proxy_addr(&self) -> Option<SocketAddr> {
        self.bound.read().await.map(|b| b.proxy)
    }

    /// Get gateway status information
    pub async fn status(&self) -> GatewayStatus {
        let bound = *self.bound.read().await;
        GatewayStatus {
            state: self.state().await,
            version: env!("CARGO_PKG_VERSION").to_string(),
            session_count: self.sessions.count().await,
            policy_generation: self.store.snapshot().generation,
            dispatcher_addr: bound.map(|b| b.dispatcher.to_string()),
            admin_addr: bound.map(|b| b.admin.to_string()),
            proxy_addr: bound.map(|b| b.proxy.to_string()),
        }
    }
}

/// Gateway status information
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
    pub state: GatewayState,
    pub version: String,
    /// Number of registered sessions
    pub session_count: usize,
    /// Bumped on every successful policy reload
    pub policy_generation: u64,
    pub dispatcher_addr: Option<String>,
    pub admin_addr: Option<String>,
    pub proxy_addr: Option<String>,
}

async fn bind_listener(name: &str, host: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((host, port)).await.map_err(|e| {
        Error::Gateway(format!(
            "Failed to bind {} on {}:{}: {}",
            name, host, port, e
        ))
    })
}

/// Builder for Gateway
pub struct GatewayBuilder {
    config: SandgateConfig,
    config_path: Option<PathBuf>,
    overrides: Overrides,
}

impl GatewayBuilder {
    /// Create a new builder with default config
    pub fn new() -> Self {
        Self {
            config: SandgateConfig::default(),
            config_path: None,
            overrides: Overrides::default(),
        }
    }

    /// Set the configuration
    pub fn config(mut self, config: SandgateConfig) -> Self {
        self.config = config;
        self
    }

    /// File the configuration was loaded from; policy reloads re-read it
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Set the dispatcher port
    pub fn dispatcher_port(mut self, port: u16) -> Self {
        self.config.dispatcher.port = port;
        self
    }

    /// Set the admin API port
    pub fn admin_port(mut self, port: u16) -> Self {
        self.config.admin.port = port;
        self
    }

    /// Set the traffic listener port
    pub fn proxy_port(mut self, port: u16) -> Self {
        self.config.proxy.port = port;
        self
    }

    /// Use this workspace instead of the git-backed one
    pub fn workspace(mut self, workspace: Arc<dyn Workspace>) -> Self {
        self.overrides.workspace = Some(workspace);
        self
    }

    /// Use this scanner instead of the configured backends
    pub fn scanner(mut self, scanner: BoundedScanner) -> Self {
        self.overrides.scanner = Some(scanner);
        self
    }

    /// Use this CA instead of loading one from disk
    pub fn ca(mut self, ca: CertificateAuthority) -> Self {
        self.overrides.ca = Some(ca);
        self
    }

    /// Build the gateway
    pub async fn build(self) -> Result<Gateway> {
        Gateway::assemble(self.config, self.config_path, self.overrides).await
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}
