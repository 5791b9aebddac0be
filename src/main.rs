use anyhow::Result;
use clap::Parser;
use tracing_subscriber::prelude::*;

use relaymesh::config::RelayArgs;
use relaymesh::relay::Relay;

#[tokio::main]
async fn main() -> Result<()> {
    let args = RelayArgs::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let relay = Relay::new(args).await?;

    wait_for_shutdown_signal().await;
    tracing::info!("Shutting down gracefully by signal..");
    relay.shutdown().await;

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
