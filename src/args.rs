use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pairsignal::config;

#[derive(Parser, Debug)]
#[command(name = "pairsignal")]
#[command(author = "Pairsignal Team")]
#[command(version)]
#[command(about = "Two-party WebRTC signaling over a broadcast relay", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/pairsignal.toml")]
    pub config: PathBuf,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the broadcast relay
    Relay {
        /// Listen address
        #[arg(long)]
        host: Option<String>,

        /// Listen port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Negotiate as the offering (sending) peer
    Offer {
        /// Relay WebSocket URL
        #[arg(short, long)]
        endpoint: Option<String>,
    },
    /// Negotiate as the answering (receiving) peer
    Answer {
        /// Relay WebSocket URL
        #[arg(short, long)]
        endpoint: Option<String>,
    },
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, config::ConfigError> {
        config::Config::load(&self.config)
    }

    /// Fold command line overrides into `config`
    pub fn apply_overrides(&self, config: &mut config::Config) {
        match &self.command {
            Command::Relay { host, port } => {
                if let Some(host) = host {
                    config.relay.host = host.clone();
                }
                if let Some(port) = port {
                    config.relay.port = *port;
                }
            }
            Command::Offer { endpoint } | Command::Answer { endpoint } => {
                if let Some(endpoint) = endpoint {
                    config.signaling.endpoint = endpoint.clone();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_override() {
        let args = Args::parse_from(["pairsignal", "offer", "--endpoint", "ws://relay:9000/chat"]);
        let mut config = config::Config::default();
        args.apply_overrides(&mut config);
        assert_eq!(config.signaling.endpoint, "ws://relay:9000/chat");
    }

    #[test]
    fn test_relay_overrides() {
        let args = Args::parse_from(["pairsignal", "-v", "relay", "--port", "9001"]);
        assert!(args.verbose);
        let mut config = config::Config::default();
        args.apply_overrides(&mut config);
        assert_eq!(config.relay.port, 9001);
        assert_eq!(config.relay.host, "0.0.0.0");
    }
}
