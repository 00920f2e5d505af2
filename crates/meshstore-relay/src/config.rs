//! Configuration for `relayd` (spec §4.9 "Relay server").

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// relayd - meshstore relay and communication-initiation server
#[derive(Parser, Debug, Clone)]
#[command(name = "relayd")]
#[command(about = "Relay server for meshstore pairing, chum sync, and relayed connections")]
pub struct RelayConfig {
    /// Listen address for incoming WebSocket connections
    #[arg(short, long, default_value = "0.0.0.0:8765")]
    pub listen: SocketAddr,

    /// Directory holding this relay's own keystore
    #[arg(short, long, default_value = "./data/relayd")]
    pub data_dir: PathBuf,

    /// Secret used to encrypt the relay's keystore at rest, if set
    #[arg(long, env = "MESHSTORE_RELAY_SECRET")]
    pub secret: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl RelayConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.log_format != "json" && self.log_format != "pretty" {
            anyhow::bail!("log-format must be 'json' or 'pretty', got {}", self.log_format);
        }
        Ok(())
    }
}

/// Persisted relay identity, analogous to [`meshstore_core::store::Keystore`]
/// but scoped to just the relay's own box keypair (a relay never signs or
/// stores application objects).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayIdentity {
    pub box_public: [u8; 32],
    pub box_secret: [u8; 32],
}
