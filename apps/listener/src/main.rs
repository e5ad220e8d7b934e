//! djroom - headless listener for DJ rooms.
//!
//! Joins a room on a DJ server, reports what happens there and plays the
//! current track through a local player, in sync with the room.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use djroom_core::{LogNotifier, ProcessSink, SessionOrchestrator};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;

/// djroom - listen along in a DJ room.
#[derive(Parser, Debug)]
#[command(name = "djroom")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Hostname or IP address of the DJ server.
    host: String,

    /// Short name of the room to join.
    room: String,

    /// Server port (overrides config file).
    #[arg(short = 'p', long, env = "DJROOM_PORT")]
    port: Option<u16>,

    /// Do not play audio; only report what is playing.
    #[arg(long)]
    no_audio: bool,

    /// Audio output device passed to the player (overrides config file).
    #[arg(long, env = "DJROOM_AUDIO_DEVICE")]
    audio_device: Option<String>,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,

    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .filter_module("tungstenite", log::LevelFilter::Warn)
        .filter_module("tokio_tungstenite", log::LevelFilter::Warn)
        .format_timestamp_millis()
        .init();

    log::info!("djroom v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ClientConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(device) = args.audio_device {
        config.audio_device = Some(device);
    }
    if args.no_audio {
        config.no_audio = true;
    }

    let core_config = config.to_core_config(&args.host, &args.room);
    core_config.validate().context("Invalid configuration")?;

    log::info!(
        "Configuration: server={}:{}, room={}, audio={}",
        args.host,
        config.port,
        args.room,
        if config.no_audio { "off" } else { config.player.program.as_str() }
    );

    let sink = Arc::new(ProcessSink::new(config.player.clone()));
    let orchestrator = SessionOrchestrator::new(core_config, sink, Arc::new(LogNotifier));

    let cancel = CancellationToken::new();
    let session = orchestrator.run(cancel.clone());
    tokio::pin!(session);

    let result = tokio::select! {
        result = &mut session => result,
        _ = shutdown_signal() => {
            log::info!("Shutdown signal received, leaving the room...");
            cancel.cancel();
            session.await
        }
    };

    let reason = result.context("Session failed")?;
    log::info!("Session over: {}", reason);
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
