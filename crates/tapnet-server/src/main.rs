//! `tapnetd` entry point: the TAP lease manager service.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tapnet_core::LeaseManager;
use tapnet_server::{build_router, ServerConfig};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "tapnetd", about = "TAP interface lease manager service")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short = 'c', long = "config", default_value = "tapnet.toml")]
    config: PathBuf,

    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Verbose logging.
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive(format!("tapnet_server={default_level}").parse()?)
                .add_directive(format!("tapnet_core={default_level}").parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting tapnetd");

    // Unusable configuration aborts before the listener is bound.
    let mut config = ServerConfig::load(&args.config).context("loading configuration")?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let manager = LeaseManager::new(config.core.clone()).context("initializing lease manager")?;
    let router = build_router(manager.clone());

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    tracing::info!(addr = %config.listen, "Resource API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            tracing::info!("Received shutdown signal");
        })
        .await
        .context("serving HTTP")?;

    // Kill and reap every worker before exiting.
    manager.release_all().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
