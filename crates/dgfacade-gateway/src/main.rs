//! The `dgfacade` daemon entry point.
//!
//! Exit codes: 0 clean shutdown, 1 fatal startup failure, 2 config error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use dgfacade_core::GatewayError;
use dgfacade_gateway::Gateway;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dgfacade", about = "Configuration-driven request gateway", version)]
struct Cli {
    /// Config root directory.
    #[arg(long, env = "DGFACADE_CONFIG_DIR", default_value = "config")]
    config_dir: PathBuf,

    /// Log filter (overridden by RUST_LOG).
    #[arg(long, env = "DGFACADE_LOG", default_value = "info")]
    log_filter: String,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_filter.clone()));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                error!(error = %err, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
                return;
            },
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = term.recv() => info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli);

    let gateway = match Gateway::build(&cli.config_dir) {
        Ok(gateway) => gateway,
        Err(err @ GatewayError::ConfigError(_)) => {
            error!(error = %err, "configuration error");
            return ExitCode::from(2);
        },
        Err(err) => {
            error!(error = %err, "startup failed");
            return ExitCode::from(1);
        },
    };

    gateway.start().await;
    wait_for_signal().await;
    gateway.shutdown().await;
    ExitCode::SUCCESS
}
