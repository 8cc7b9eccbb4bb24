//! Agent startup and shutdown sequence

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use warden_backend::{select_backend, BackendKind};
use warden_core::{AgentConfiguration, BUILD_INFO};
use warden_engine::{HealthReporter, ReconciliationEngine};

use crate::logging::{self, StartupBuffer};

pub const DEFAULT_CONFIG_FILE: &str = "config.json";

const HEALTH_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "warden-agent")]
#[command(about = "IPsec host agent: applies connection policy and keeps tunnels up")]
#[command(version = warden_core::VERSION)]
pub struct Args {
    /// Configuration file (JSON or YAML) [default: config.json next to the executable]
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Platform backend
    #[arg(long, default_value_t = BackendKind::Auto)]
    pub backend: BackendKind,

    /// Validate the configuration and exit
    #[arg(long)]
    pub check: bool,
}

impl Args {
    pub fn config_path(&self, base_dir: &Path) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| base_dir.join(DEFAULT_CONFIG_FILE))
    }
}

/// Directory holding the running executable.
pub fn base_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub async fn run(args: Args) -> Result<()> {
    let base_dir = base_dir();
    let config_path = args.config_path(&base_dir);

    let mut startup = StartupBuffer::new();
    startup.info(format!("Starting {}", BUILD_INFO));

    let config = warden_core::load(&config_path).with_context(|| {
        format!(
            "failed to load configuration from {}",
            config_path.display()
        )
    })?;

    if args.check {
        println!(
            "Configuration is valid: {} connection(s)",
            config.connections().len()
        );
        return Ok(());
    }

    report_configuration(&config, &config_path, &mut startup);

    let _log_guard = logging::init(&config, &base_dir, &mut startup)?;
    startup.flush();

    let config = Arc::new(config);
    let backend = select_backend(args.backend, &config, &base_dir);
    let engine = ReconciliationEngine::new(config.clone(), backend);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let health = config.health_api_port().map(|port| {
        let reporter = HealthReporter::new(engine.clone());
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = reporter.serve(port, shutdown).await {
                error!("Health API error: {}", e);
            }
        })
    });
    if health.is_none() {
        info!("Health API disabled (no api_port configured)");
    }

    let engine_task = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(shutdown_rx).await }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Engine and health server both watch this.
    let _ = shutdown_tx.send(true);

    engine_task.await.context("reconciliation loop panicked")?;
    if let Some(handle) = health {
        if tokio::time::timeout(HEALTH_SHUTDOWN_GRACE, handle).await.is_err() {
            warn!("Health API did not stop within {:?}", HEALTH_SHUTDOWN_GRACE);
        }
    }

    info!("Shutdown complete, final state {}", engine.state());
    Ok(())
}

/// Queue what the loader found until a log sink exists.
pub fn report_configuration(
    config: &AgentConfiguration,
    path: &Path,
    startup: &mut StartupBuffer,
) {
    startup.info(format!("Configuration loaded from {}", path.display()));
    for line in config.summary() {
        startup.info(line);
    }
    for name in config.duplicate_names() {
        startup.warn(format!(
            "Connection name '{}' is declared more than once",
            name
        ));
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
