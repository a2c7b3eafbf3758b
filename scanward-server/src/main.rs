use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scanward_config::{ConfigLoader, ConfigSource};
use scanward_core::container::Podman;
use scanward_core::engine::KeslControl;
use scanward_core::orchestration::{Collaborators, ScanOrchestrator};
use scanward_core::registry::RegistryClient;
use scanward_core::restart::RestartCoordinator;
use scanward_core::watcher::UpdateWatcher;
use scanward_server::{AppState, create_app, startup};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "scanward-server")]
#[command(about = "Antivirus scan service for uploaded files and container images")]
struct Cli {
    /// Server port (overrides config)
    #[arg(short, long, env = "SCANWARD_PORT")]
    port: Option<u16>,

    /// Configuration file (TOML or JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Environment file to read instead of `./.env`
    #[arg(long)]
    env_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = cli.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = cli.env_file {
        loader = loader.with_env_file(path);
    }
    let load = loader.load().context("failed to load configuration")?;
    let mut config = load.config;
    if let Some(port) = cli.port {
        config.common.port = port;
    }

    let default_filter = format!("{},tower_http=warn", config.common.log_level.trim());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if load.env_file_loaded {
        info!("loaded .env file");
    }
    match &load.source {
        ConfigSource::Default => info!("no configuration file found, using defaults"),
        ConfigSource::EnvInline => info!("configuration read from environment"),
        ConfigSource::EnvPath(path) | ConfigSource::File(path) => {
            info!(path = %path.display(), "configuration file loaded")
        }
    }
    if !load.overrides.is_empty() {
        info!(overrides = ?load.overrides, "environment overrides applied");
    }

    startup::prepare_directories(&config).await?;

    let kesl = Arc::new(KeslControl::new(
        &config.engine.control_path,
        &config.engine.service_path,
        config.control.general_timeout(),
        config.control.update_task_timeout(),
    ));
    let gate = Arc::new(RestartCoordinator::new(
        kesl.clone(),
        config.control.restart_poll_interval(),
    ));
    let collaborators = Collaborators {
        engine: kesl.clone(),
        runtime: Arc::new(Podman::new(
            &config.runtime.podman_path,
            config.runtime.privileged,
            &config.common.cert_dir,
            config.control.general_timeout(),
        )),
        registry: Arc::new(
            RegistryClient::new(config.control.general_timeout()).context("failed to build registry client")?,
        ),
        gate: gate.clone(),
    };

    let orchestrator = ScanOrchestrator::start(
        &config.common.database_path,
        collaborators,
        config.orchestrator_settings(),
    )
    .await
    .with_context(|| format!("failed to open job store {}", config.common.database_path.display()))?;
    let orchestrator = Arc::new(orchestrator);

    let outcome = startup::bootstrap_engine(&kesl, &config).await;

    let shutdown = CancellationToken::new();
    let watcher = UpdateWatcher::new(kesl.clone(), gate, config.control.restart_poll_interval())
        .spawn(shutdown.child_token());

    let state = AppState {
        orchestrator,
        engine: kesl.clone(),
        tmp_path: config.common.tmp_path.clone(),
        api_key: config.api_key().map(Arc::from),
    };
    let app = create_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "scanward server listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    shutdown.cancel();
    if let Err(err) = watcher.await {
        warn!(error = %err, "update watcher ended abnormally");
    }
    startup::shutdown_engine(&kesl, outcome).await;
    info!("scanward server stopped");

    served.context("server error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "unable to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested");
}
