//! blobsync - host-relayed blob position sharing
//!
//! Headless node: hosts a session or joins one, driving a wandering demo blob.

mod config;
mod demo;

use anyhow::Result;
use blobsync_client::{Session, SessionRole};
use clap::{Parser, Subcommand};
use demo::{DemoBlob, LogPresenter};
use std::path::PathBuf;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Share blob positions through a relaying host", long_about = None)]
struct Cli {
    /// Session config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Stop after this many ticks instead of running until Ctrl-C
    #[arg(long)]
    ticks: Option<u64>,

    #[command(subcommand)]
    role: RoleCommand,
}

#[derive(Subcommand, Debug)]
enum RoleCommand {
    /// Host a session on the configured ports
    Host,
    /// Join the session hosted at HOST (name or address, optional :port)
    Join {
        /// Host to join
        host: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with INFO level by default (can be overridden via RUST_LOG env var)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting blobsync v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => config::load_from_path(path),
        None => config::load(),
    };
    let role = match cli.role {
        RoleCommand::Host => SessionRole::Host,
        RoleCommand::Join { host } => SessionRole::Join { host },
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, shutting down");
                cancel.cancel();
            }
        });
    }

    let mut session = Session::start_with_cancel(role, &config, cancel.clone()).await?;
    if let Some(addr) = session.control_addr() {
        info!("Hosting on {}; peers join with `blobsync join <this host>`", addr);
    }

    let mut blob = DemoBlob::new(rand::thread_rng());
    let mut presenter = LogPresenter::default();
    session.mark_presentation_ready();

    let tick_interval = config.tick_interval();
    let dt = tick_interval.as_secs_f32();
    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut ticks = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        blob.step(dt);
        let report = session.tick(&blob, &mut presenter).await?;
        debug!(?report, "Tick {}", ticks);

        ticks += 1;
        if cli.ticks.is_some_and(|max| ticks >= max) {
            info!("Reached {} ticks", ticks);
            break;
        }
        if !session.is_connected() {
            warn!("Lost the host, leaving");
            break;
        }
    }

    session.shutdown().await;
    Ok(())
}
