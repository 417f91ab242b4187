use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ratewarden::config::{GatewayConfig, LogFormat};
use ratewarden::http::{AppState, HttpServer};

/// Rate limiting and anti-bot reverse proxy.
#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about)]
struct Args {
    /// Configuration file (YAML or TOML)
    #[arg(short, long, env = "RATEWARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Data-plane listen address
    #[arg(long)]
    gateway_addr: Option<SocketAddr>,

    /// Admin API listen address
    #[arg(long)]
    admin_addr: Option<SocketAddr>,

    /// YAML file of rules to seed at startup
    #[arg(long)]
    rules: Option<PathBuf>,

    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = GatewayConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.gateway_addr {
        config.server.gateway_addr = addr;
    }
    if let Some(addr) = args.admin_addr {
        config.server.admin_addr = addr;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    init_tracing(&config);

    info!("Starting Ratewarden gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        gateway_addr = %config.server.gateway_addr,
        admin_addr = %config.server.admin_addr,
        "Configuration loaded"
    );

    let rules_path = args
        .rules
        .or_else(|| config.rate_limiting.rules_path.as_ref().map(PathBuf::from));

    let state = AppState::new(config)?;
    if let Some(path) = rules_path {
        let seeded = state.rules.load_file(&path)?;
        info!(count = seeded.len(), "Seed rules loaded");
    }

    let server = HttpServer::bind(state).await?;
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Ratewarden gateway stopped");
    Ok(())
}

fn init_tracing(config: &GatewayConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
