//! meshstore-core: content-addressed object store, channel log, and trust graph.
//!
//! # Modules
//!
//! - [`hash`]: `Hash`/`ObjectHash`/`IdHash` identity types (C1's SHA-256 base)
//! - [`crypto`]: nonce/key generation, symmetric and peer encryption, signatures, scrypt (C1)
//! - [`recipe`]/[`object`]: the dynamic schema and value tree objects are built from
//! - [`canonical`]: deterministic encode/decode between `ObjectInstance` and bytes (C2)
//! - [`blob_store`]: content-addressed byte storage (C3)
//! - [`version_map`]: per-IdHash append-only version history (part of C4)
//! - [`events`]: store-event pub/sub (C4)
//! - [`object_store`]: store/get/get_by_id, versioned vs. unversioned (C4)
//! - [`reverse_index`]: back-link maintenance (C5)
//! - [`channel`]: per-(channel, owner) time-ordered logs and merge-iteration (C6)
//! - [`trust`]: key trust resolution (C7)
//! - [`config`]: instance configuration
//! - [`store`]: top-level `Store` wiring everything together

pub mod blob_store;
pub mod canonical;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod hash;
pub mod object;
pub mod object_store;
pub mod recipe;
pub mod reverse_index;
pub mod store;
pub mod trust;
pub mod version_map;

pub use error::{Error, Result};
pub use store::Store;
