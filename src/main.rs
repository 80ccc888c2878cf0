//! pggateway - PostgreSQL wire-protocol gateway
//!
//! Loads the YAML configuration, builds every plugin registry, binds the
//! listeners and serves until Ctrl+C / SIGTERM.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pggateway::{config, Config, Result, Server};

#[derive(Parser)]
#[command(name = "pggateway")]
#[command(version)]
#[command(about = "PostgreSQL wire-protocol gateway with pluggable authentication")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "pggateway.yaml")]
    config: PathBuf,

    /// Enable verbose/debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Validate the configuration and plugin settings, then exit
    #[arg(long)]
    check: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins, then --verbose, then "info"
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "debug" } else { "info" })
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match config::load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load {:?}: {}", cli.config, e);
            return ExitCode::FAILURE;
        }
    };
    info!("Loaded configuration from {:?}", cli.config);

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    if config.procs > 0 {
        runtime.worker_threads(config.procs);
    }
    let runtime = match runtime.enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config, cli.check)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config, check: bool) -> Result<()> {
    let server = Arc::new(Server::new(&config)?);
    if check {
        info!(
            "Configuration OK: {} listener(s)",
            config.listeners.len()
        );
        return Ok(());
    }

    info!("Starting pggateway v{}", env!("CARGO_PKG_VERSION"));

    let mut running = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.start().await }
    });

    tokio::select! {
        result = &mut running => {
            return result.unwrap_or_else(|e| {
                Err(pggateway::GatewayError::Connection(format!("server task failed: {}", e)))
            });
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    server.close();
    match running.await {
        Ok(result) => result,
        Err(e) => Err(pggateway::GatewayError::Connection(format!(
            "server task failed: {}",
            e
        ))),
    }
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
