//! pairsignal - Main entry point
//!
//! Runs either the broadcast relay or one peer of the handshake.

mod args;

use args::{Args, Command};
use clap::Parser;
use log::{error, info, warn};
use pairsignal::config::Config;
use pairsignal::transport::{run_relay_server, ReconnectPolicy, RelayChannel, SignalingChannel};
use pairsignal::webrtc::{
    ConnectionState, NegotiationCoordinator, PeerConnectionAdapter, Role, WebRtcPeerConnection,
};
use std::env;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // The config picks the default log level, so read it before logging starts
    let loaded = args.load_config();
    let config_level = loaded
        .as_ref()
        .map(|cfg| cfg.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    let log_level = if args.verbose { "debug".to_string() } else { config_level };

    // Initialize logging with noise filtering for third-party WebRTC crates
    env_logger::Builder::new()
        .parse_filters(&env::var("PAIRSIGNAL_LOG").unwrap_or(log_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("pairsignal v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match loaded {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }
    };
    args.apply_overrides(&mut config);

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e.into());
    }

    match args.command {
        Command::Relay { .. } => run_relay(&config).await,
        Command::Offer { .. } => run_peer(&config, Role::Offerer).await,
        Command::Answer { .. } => run_peer(&config, Role::Answerer).await,
    }
}

async fn run_relay(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = CancellationToken::new();
    let server = tokio::spawn({
        let config = config.relay.clone();
        let shutdown = shutdown.clone();
        async move { run_relay_server(&config, shutdown).await }
    });

    let _ = signal::ctrl_c().await;
    info!("Shutdown signal received");
    shutdown.cancel();

    server.await??;
    Ok(())
}

async fn run_peer(config: &Config, role: Role) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting {} against {}", role, config.signaling.endpoint);

    let channel = Arc::new(
        RelayChannel::connect(&config.signaling.endpoint, ReconnectPolicy::from(&config.signaling))
            .await?,
    );
    let peer = Arc::new(WebRtcPeerConnection::new(&config.webrtc, role).await?);
    let mut connection = peer.watch_connection_state();

    let handle = NegotiationCoordinator::new(
        role,
        peer.clone(),
        channel.clone(),
        &config.negotiation,
        config.tags.clone(),
    )
    .spawn();
    let mut state = handle.watch_state();

    let shutdown = async {
        let _ = signal::ctrl_c().await;
        info!("Shutdown signal received");
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Initiating graceful shutdown...");
                handle.cancel();
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                info!("{} negotiation state: {}", handle.role(), current);
            }
            changed = connection.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *connection.borrow_and_update();
                if current == ConnectionState::Failed {
                    warn!("Peer connection failed, waiting for ICE to recover");
                }
            }
        }
    }

    let result = handle.join().await;
    channel.close();

    match result {
        Ok(outcome) => {
            info!("Negotiation finished: {:?}", outcome);
            Ok(())
        }
        Err(e) => {
            error!("Negotiation failed: {}", e);
            Err(e.into())
        }
    }
}
