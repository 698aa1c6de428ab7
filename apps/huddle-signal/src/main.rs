mod cli;

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use huddle_signal::{config::Config, hub::SignalingHub};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let result = match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_server().await,
        Commands::Probe {
            url,
            room,
            name,
            secs,
        } => cli::run_probe(url, room, name, secs).await,
    };

    if let Err(err) = result {
        error!("huddle-signal failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run_server() -> anyhow::Result<()> {
    let config = Config::from_env();
    let addr = config.bind_addr();
    info!(
        heartbeat_timeout_secs = config.heartbeat_timeout_secs,
        reservation_ttl_secs = config.reservation_ttl_secs,
        admin_succession = ?config.admin_succession,
        "starting huddle signaling server"
    );

    let hub = Arc::new(SignalingHub::new(config));
    let _maintenance = hub.spawn_maintenance();

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("huddle-signal listening on {}", addr);
    huddle_signal::serve(listener, hub).await?;
    Ok(())
}
