//! relayd - meshstore relay and communication-initiation server
//!
//! Accepts WebSocket connections, authenticates registrants, and forwards
//! frames between a registrant's spare connection and a caller without
//! inspecting their contents once a handover completes.

mod config;

use clap::Parser;
use config::{RelayConfig, RelayIdentity};
use meshstore_core::blob_store::BlobStore;
use meshstore_core::crypto;
use meshstore_relay::RelayServer;
use std::process::ExitCode;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const IDENTITY_FILE: &str = "relay_identity";
const IDENTITY_SALT_LEN: usize = 16;

fn load_or_create_identity(blobs: &BlobStore, config: &RelayConfig) -> anyhow::Result<RelayIdentity> {
    let existing = blobs.read_aux(IDENTITY_FILE)?;
    if existing.is_empty() {
        let (box_public, box_secret) = crypto::new_box_keypair();
        let identity = RelayIdentity { box_public, box_secret };
        persist_identity(blobs, config, &identity)?;
        return Ok(identity);
    }
    decode_identity(&existing, config)
}

fn persist_identity(blobs: &BlobStore, config: &RelayConfig, identity: &RelayIdentity) -> anyhow::Result<()> {
    let plain = serde_json::to_vec(identity)?;
    let bytes = match &config.secret {
        Some(secret) => {
            let mut salt = vec![0u8; IDENTITY_SALT_LEN];
            salt.copy_from_slice(&crypto::random_nonce()[..IDENTITY_SALT_LEN]);
            let key = crypto::derive_symmetric_from_secret(secret.as_bytes(), &salt)?;
            let encrypted = crypto::symmetric_encrypt_embed_nonce(&plain, &key, None)?;
            let mut out = salt;
            out.extend_from_slice(&encrypted);
            out
        }
        None => plain,
    };
    blobs.replace_aux(IDENTITY_FILE, &bytes)?;
    Ok(())
}

fn decode_identity(bytes: &[u8], config: &RelayConfig) -> anyhow::Result<RelayIdentity> {
    let plain = match &config.secret {
        Some(secret) => {
            if bytes.len() < IDENTITY_SALT_LEN {
                anyhow::bail!("relay identity file shorter than salt prefix");
            }
            let (salt, rest) = bytes.split_at(IDENTITY_SALT_LEN);
            let key = crypto::derive_symmetric_from_secret(secret.as_bytes(), salt)?;
            crypto::symmetric_decrypt_embed_nonce(rest, &key)?
        }
        None => bytes.to_vec(),
    };
    Ok(serde_json::from_slice(&plain)?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = RelayConfig::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("meshstore_relay=info".parse().unwrap()))
        .init();

    if let Err(e) = config.validate() {
        error!("invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    info!("relayd v{} starting on {}", env!("CARGO_PKG_VERSION"), config.listen);

    let blobs = match BlobStore::open(&config.data_dir) {
        Ok(b) => b,
        Err(e) => {
            error!("failed to open data directory: {e}");
            return ExitCode::FAILURE;
        }
    };
    let identity = match load_or_create_identity(&blobs, &config) {
        Ok(i) => i,
        Err(e) => {
            error!("failed to load relay identity: {e}");
            return ExitCode::FAILURE;
        }
    };

    let server = RelayServer::new(identity.box_public, identity.box_secret);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    if let Err(e) = server.run(config.listen, shutdown_rx).await {
        error!("relay server error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
