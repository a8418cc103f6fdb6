//! wakegate - lazy-start HTTP/WebSocket reverse-proxy gateway.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use wakegate_common::config::Config;
use wakegate_common::logging::init_logging;

/// wakegate - lazy-start reverse proxy for on-demand upstream services.
#[derive(Parser, Debug)]
#[command(name = "wakegate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Lazy-start HTTP/WebSocket reverse-proxy gateway", long_about = None)]
struct Cli {
    /// Path to the config file (defaults to ~/.config/wakegate/config.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the main listener host from the config file.
    #[arg(long)]
    host: Option<String>,

    /// Override the main listener port from the config file.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    init_logging(&config.logging);
    install_panic_hook();

    tracing::info!("wakegate v{}", env!("CARGO_PKG_VERSION"));

    let ctx = wakegate::build_context(config)?;

    let reaper_ctx = ctx.clone();
    let reaper_handle = tokio::spawn(async move { wakegate::reaper::run(reaper_ctx).await });

    tokio::select! {
        result = wakegate::listeners::run(ctx.clone()) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "listener set exited with an error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    reaper_handle.abort();
    wakegate::shutdown_all(&ctx).await;

    Ok(())
}

/// A panicking task must not take down the whole process (spec §6:
/// "uncaughtException and unhandledRejection are logged and do not exit the
/// process"). Tokio already isolates a panicking task's own `JoinHandle`;
/// this hook just makes sure the panic is logged through `tracing` rather
/// than printed raw to stderr.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(panic = %info, "panic in background task");
        default_hook(info);
    }));
}
