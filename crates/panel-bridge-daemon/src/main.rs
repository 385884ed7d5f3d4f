//! panel-bridge daemon
//!
//! Connects to the running compositor and serves shell components over a
//! Unix socket.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use panel_bridge::commands::register_builtin_commands;
use panel_bridge::ipc::IpcServer;
use panel_bridge::pump::{spawn_liveness_monitor, EventPump};
use panel_bridge::translate::BackendTranslator;
use panel_bridge::BridgeContext;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "panel-bridged")]
#[command(about = "Compositor event bridge and IPC server for desktop shells")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/panel-bridge/config.kdl")]
    config: String,

    /// Socket path (overrides config setting)
    #[arg(short, long)]
    socket: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Expand tilde in config path
    let config_path: PathBuf = shellexpand::tilde(&args.config).into_owned().into();

    let mut config = panel_bridge_config::load_config(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    if let Some(socket) = args.socket {
        config.server.socket_path = Some(socket);
    }

    // RUST_LOG wins over the configured level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.global.log_level.as_filter())),
        )
        .init();

    tracing::info!("Loaded configuration from {}", config_path.display());

    let ctx = BridgeContext::new(config);
    register_builtin_commands(&ctx);

    let server = IpcServer::bind(ctx.socket_path().to_path_buf())?;

    if let Err(e) = ctx.facade.reconnect() {
        tracing::warn!("Compositor not available yet: {}", e);
    }

    EventPump::new(
        ctx.facade.clone(),
        BackendTranslator,
        ctx.queue.clone(),
        &ctx.config.events,
    )
    .spawn()
    .context("Failed to start event pump thread")?;

    let liveness = spawn_liveness_monitor(
        ctx.facade.clone(),
        ctx.config.compositor.liveness_interval(),
    );
    let distributor = tokio::spawn(ctx.distributor().run());

    tracing::info!("panel-bridge daemon running");

    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = server.serve(ctx.clone()) => result?,
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }

    tracing::info!("Shutting down...");

    liveness.abort();
    ctx.queue.close();
    ctx.facade.close();
    // The pump thread may still be blocked on a compositor read; it is
    // abandoned with the process.
    if let Err(e) = distributor.await {
        tracing::warn!(error = %e, "Event distributor ended abnormally");
    }

    Ok(())
}
