mod sse;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::routing::get;
use axum::Router;
use berth_events::{Broker, Poller, PollerConfig};
use berth_git::GitProvider;
use berth_queue::{Dispatcher, DispatcherConfig};
use berth_sandbox::{DockerSandboxProvider, MockSandboxProvider, SandboxProvider};
use berth_services::{
    SandboxService, ServiceConfig, SessionCommitExecutor, SessionDeleteExecutor,
    SessionInitExecutor, SessionService, StoreWorkspaceSource, WorkspaceInitExecutor,
    WorkspaceService,
};
use berth_store::{Driver, Store};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "berth-server", about = "berth — coding-agent workbench backend")]
struct Cli {
    /// Database connection string
    #[arg(long, env = "DATABASE_DSN", default_value = "sqlite://berth.db?mode=rwc")]
    database_dsn: String,

    /// Database backend: sqlite | postgres
    #[arg(long, env = "DATABASE_DRIVER", default_value = "sqlite")]
    database_driver: String,

    /// Root directory for per-workspace clones
    #[arg(long, env = "WORKSPACE_DIR", default_value = "./workspaces")]
    workspace_dir: PathBuf,

    /// Expected sandbox image; reconciliation replaces sandboxes running
    /// anything else
    #[arg(long, env = "SANDBOX_IMAGE", default_value = "berth/agent:latest")]
    sandbox_image: String,

    /// Sandbox backend: docker | mock
    #[arg(long, env = "SANDBOX_BACKEND", default_value = "docker")]
    sandbox_backend: String,

    /// Idle timeout in seconds, passed to the provider and enforced by the
    /// eviction loop
    #[arg(long, env = "SANDBOX_IDLE_TIMEOUT", default_value_t = 1800)]
    sandbox_idle_timeout: u64,

    /// Dispatcher fallback poll interval (ms)
    #[arg(long, env = "DISPATCHER_POLL_INTERVAL", default_value_t = 1000)]
    dispatcher_poll_interval: u64,

    /// Lease heartbeat interval (ms)
    #[arg(long, env = "DISPATCHER_HEARTBEAT_INTERVAL", default_value_t = 5000)]
    dispatcher_heartbeat_interval: u64,

    /// Lease duration granted per heartbeat (ms)
    #[arg(long, env = "DISPATCHER_HEARTBEAT_TIMEOUT", default_value_t = 15000)]
    dispatcher_heartbeat_timeout: u64,

    /// Hard per-job execution deadline (ms)
    #[arg(long, env = "DISPATCHER_JOB_TIMEOUT", default_value_t = 300_000)]
    dispatcher_job_timeout: u64,

    /// Grace past lease expiry before the reaper steals a job (ms)
    #[arg(long, env = "DISPATCHER_STALE_JOB_TIMEOUT", default_value_t = 10_000)]
    dispatcher_stale_job_timeout: u64,

    /// Dispatcher worker count
    #[arg(long, env = "DISPATCHER_WORKERS", default_value_t = 2)]
    dispatcher_workers: usize,

    /// 32-byte hex key for sealing credentials at rest
    #[arg(long, env = "ENCRYPTION_KEY")]
    encryption_key: Option<String>,

    /// HTTP listen address
    #[arg(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    listen_addr: String,
}

/// The key is consumed by the credential-sealing layer above the core;
/// here it is only validated so a bad deployment fails at startup.
fn validate_encryption_key(key: &str) -> Result<()> {
    if key.len() != 64 || !key.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("ENCRYPTION_KEY must be 32 bytes, hex-encoded (64 hex chars)");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("berth=info")),
        )
        .init();

    let cli = Cli::parse();

    if let Some(key) = &cli.encryption_key {
        validate_encryption_key(key)?;
    } else {
        tracing::warn!("ENCRYPTION_KEY not set; credential storage is unavailable");
    }

    let driver = Driver::from_name(&cli.database_driver)
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    tracing::info!(dsn = %cli.database_dsn, "connecting to database");
    let store = Store::connect(&cli.database_dsn, driver)
        .await
        .context("database connection / migration failed")?;

    std::fs::create_dir_all(&cli.workspace_dir)?;
    let git = GitProvider::new(cli.workspace_dir.clone())
        .with_sources(Arc::new(StoreWorkspaceSource::new(store.clone())));

    let sandbox: Arc<dyn SandboxProvider> = match cli.sandbox_backend.as_str() {
        "docker" => Arc::new(DockerSandboxProvider::new(cli.sandbox_image.clone())),
        "mock" => Arc::new(MockSandboxProvider::new(cli.sandbox_image.clone())),
        other => bail!("unknown sandbox backend: {other}"),
    };

    let dispatcher_config = DispatcherConfig {
        workers: cli.dispatcher_workers,
        poll_interval: Duration::from_millis(cli.dispatcher_poll_interval),
        heartbeat_interval: Duration::from_millis(cli.dispatcher_heartbeat_interval),
        lease_duration: Duration::from_millis(cli.dispatcher_heartbeat_timeout),
        job_timeout: Duration::from_millis(cli.dispatcher_job_timeout),
        stale_grace: Duration::from_millis(cli.dispatcher_stale_job_timeout),
        ..DispatcherConfig::default()
    };
    let mut dispatcher = Dispatcher::new(store.clone(), dispatcher_config);
    let queue = dispatcher.client();

    let service_config = ServiceConfig {
        idle_timeout: Duration::from_secs(cli.sandbox_idle_timeout),
        ..ServiceConfig::default()
    };

    let workspaces = Arc::new(WorkspaceService::new(
        store.clone(),
        git.clone(),
        queue.clone(),
    ));
    let sessions = Arc::new(SessionService::new(
        store.clone(),
        git.clone(),
        sandbox.clone(),
        queue.clone(),
        service_config.clone(),
    ));

    dispatcher.register(Arc::new(WorkspaceInitExecutor::new(workspaces.clone())));
    dispatcher.register(Arc::new(SessionInitExecutor::new(sessions.clone())));
    dispatcher.register(Arc::new(SessionCommitExecutor::new(sessions.clone())));
    dispatcher.register(Arc::new(SessionDeleteExecutor::new(sessions.clone())));
    let dispatcher = Arc::new(dispatcher);

    let broker = Broker::new();
    let gate = Arc::new(SandboxService::new(
        store.clone(),
        sandbox.clone(),
        queue.clone(),
        broker.clone(),
        service_config,
    ));

    // Bring live sandbox state back in line with the database before any
    // worker starts executing jobs.
    tracing::info!("reconciling sandboxes against the store");
    gate.reconcile_sandboxes().await?;
    gate.reconcile_session_states().await?;

    let _dispatcher_tasks = dispatcher.clone().spawn();
    let poller = Poller::new(store.clone(), broker.clone(), PollerConfig::default());
    let _poller_task = tokio::spawn(poller.run());
    let _eviction_task = gate.clone().spawn_idle_eviction();

    let state = sse::AppState {
        store: store.clone(),
        broker: broker.clone(),
    };
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/projects/:project_id/events", get(sse::project_events))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&cli.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen_addr))?;
    tracing::info!(addr = %cli.listen_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    Ok(())
}
