//! The OpenClause daemon binary: gateway, approvals, or archiver,
//! selected by subcommand. Configuration comes from the environment
//! (see `openclause_core::config`); logging is controlled by `RUST_LOG`
//! with the `--log-level` flag as the fallback filter.

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use openclause_core::config::{ApprovalsConfig, ArchiverConfig, GatewayConfig};

#[derive(Parser, Debug)]
#[command(name = "openclause", version, about = "OpenClause policy-enforcement plane")]
struct Args {
    /// Log level used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value = "json")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    /// JSON lines, one event per line.
    Json,
    /// Human-readable console output.
    Text,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent-facing gateway.
    Gateway,
    /// Run the approvals service and notification dispatcher.
    Approvals,
    /// Run the evidence archiver.
    Archiver,
}

fn init_tracing(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    match args.log_format {
        LogFormat::Json => {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    match args.command {
        Command::Gateway => openclause_daemon::gateway::run(GatewayConfig::from_env()).await,
        Command::Approvals => {
            openclause_daemon::approvals_http::run(ApprovalsConfig::from_env()).await
        }
        Command::Archiver => openclause_daemon::archiver_run::run(ArchiverConfig::from_env()).await,
    }
}
