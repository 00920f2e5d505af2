//! Instance configuration (spec §6 "Configuration")
//!
//! `InstanceOptions` is persisted/loaded as JSON the way the teacher's
//! `gossipd::config::NodeState` is (plain `serde` derive, no `clap` — only the
//! `relayd` binary has a CLI surface; this is a library-level settings object
//! handed in by whatever embeds `meshstore-core`).

use crate::recipe::Recipe;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default relay URL used when an instance doesn't override `comm_server_url`.
pub const DEFAULT_COMM_SERVER_URL: &str = "wss://relay.meshstore.example";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceOptions {
    /// Instance display name.
    pub name: String,
    /// Person email, the primary identity.
    pub email: String,
    /// Password used in scrypt-based keystore encryption. Absent when
    /// `encrypt_storage` is false.
    #[serde(default)]
    pub secret: Option<String>,
    /// Storage root.
    pub directory: PathBuf,
    /// Whether the keystore is encrypted on disk.
    #[serde(default)]
    pub encrypt_storage: bool,
    /// Serializer schemas known at startup.
    #[serde(default)]
    pub initial_recipes: Vec<Recipe>,
    /// Types participating in C5 reverse-index maintenance, for objects.
    #[serde(default)]
    pub initially_enabled_reverse_map_types: Vec<String>,
    /// Types participating in C5 reverse-index maintenance, for id-objects.
    #[serde(default)]
    pub initially_enabled_reverse_map_types_for_id_objects: Vec<String>,
    /// Relay URL default.
    #[serde(default = "default_comm_server_url")]
    pub comm_server_url: String,
}

fn default_comm_server_url() -> String {
    DEFAULT_COMM_SERVER_URL.to_string()
}

impl InstanceOptions {
    /// Construct with every optional field at its default, only the required
    /// identity and storage fields filled in.
    pub fn new(name: impl Into<String>, email: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            secret: None,
            directory: directory.into(),
            encrypt_storage: false,
            initial_recipes: Vec::new(),
            initially_enabled_reverse_map_types: Vec::new(),
            initially_enabled_reverse_map_types_for_id_objects: Vec::new(),
            comm_server_url: default_comm_server_url(),
        }
    }

    /// Reject configurations that can't be brought up: `encrypt_storage`
    /// without a `secret` leaves the keystore unopenable, and an empty name
    /// or email means there's no primary identity to derive keys for.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("instance name cannot be empty");
        }
        if self.email.trim().is_empty() {
            anyhow::bail!("instance email cannot be empty");
        }
        if self.encrypt_storage && self.secret.as_deref().unwrap_or("").is_empty() {
            anyhow::bail!("encrypt_storage is set but no secret was provided");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let opts = InstanceOptions::new("alice-laptop", "alice@example.com", "/tmp/meshstore");
        let json = serde_json::to_string(&opts).unwrap();
        let back: InstanceOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "alice-laptop");
        assert_eq!(back.comm_server_url, DEFAULT_COMM_SERVER_URL);
        assert!(!back.encrypt_storage);
    }

    #[test]
    fn encrypt_storage_without_secret_fails_validation() {
        let mut opts = InstanceOptions::new("n", "e@x.com", "/tmp/d");
        opts.encrypt_storage = true;
        assert!(opts.validate().is_err());
        opts.secret = Some("hunter2".to_string());
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn blank_name_fails_validation() {
        let opts = InstanceOptions::new("  ", "e@x.com", "/tmp/d");
        assert!(opts.validate().is_err());
    }
}
