use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use crossbridge_host::{BridgeHost, HostConfig, server};

#[derive(Parser)]
#[command(name = "crossbridge", about = "Lifecycle bridges to external runtimes and a JavaScript sandbox")]
struct Cli {
    /// Config file (defaults to ~/.crossbridge/config.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the management surface as JSON lines on stdin/stdout
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the protocol
    let filter = EnvFilter::from_env("CROSSBRIDGE_LOG");
    if cli.log_json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let config = HostConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve => {
            let (host, events) = BridgeHost::new(&config);
            tracing::info!(
                interpreter = %config.process.interpreter,
                callback_limit = ?config.callback_limit(),
                "Serving crossbridge on stdio"
            );

            let mut stdout = tokio::io::stdout();
            server::serve(&host, events, tokio::io::stdin(), &mut stdout).await?;
        }
    }

    tracing::info!("crossbridge shutting down");
    Ok(())
}
