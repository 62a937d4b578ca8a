//! live-session - Main entry point
//!
//! Runs one broadcaster or viewer session against an SFU signaling endpoint
//! using the synthetic media engine, logging every status change.

mod args;

use args::Args;
use clap::Parser;
use live_session_core::config::Config;
use live_session_core::engine::synthetic::{SyntheticCapture, SyntheticDeviceFactory, SyntheticSink};
use live_session_core::webrtc::{ConnectionState, MediaContext, Role, SessionSupervisor};
use log::{error, info, warn};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let mut config = match args.load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config {:?}: {}, using defaults", args.config, e);
            Config::default()
        }
    };

    let log_level = if args.verbose {
        "debug".to_string()
    } else {
        config.logging.level.clone()
    };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("LIVE_SESSION_LOG").unwrap_or(log_level))
        .filter_module("tungstenite", log::LevelFilter::Warn)
        .filter_module("tokio_tungstenite", log::LevelFilter::Warn)
        .init();

    info!("live-session v{}", env!("CARGO_PKG_VERSION"));

    if let Some(url) = args.url.as_ref() {
        info!("Overriding signaling URL to {}", url);
        config.signaling.url = url.clone();
    }

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    let role = Role::from(args.role);
    let media = match role {
        Role::Broadcaster => MediaContext::Broadcast {
            capture: SyntheticCapture::new(),
        },
        Role::Viewer => MediaContext::View {
            sink: SyntheticSink::new(),
        },
    };

    let supervisor = SessionSupervisor::new(config, SyntheticDeviceFactory::new());
    let mut status = supervisor.start(role, &args.stream_id, media)?;

    // Wait for shutdown signal or the session ending on its own
    let shutdown = async {
        let _ = signal::ctrl_c().await;
        info!("Shutdown signal received");
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Initiating graceful shutdown...");
                break;
            }
            changed = status.changed() => {
                let snapshot = status.borrow_and_update().clone();
                match serde_json::to_string(&snapshot) {
                    Ok(json) => info!("Status: {}", json),
                    Err(e) => warn!("Failed to serialize status: {}", e),
                }
                if changed.is_err() || snapshot.state == ConnectionState::Closed {
                    info!("Session ended");
                    break;
                }
            }
        }
    }

    supervisor.stop().await;
    info!("live-session stopped");
    Ok(())
}
