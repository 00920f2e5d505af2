//! meshstore-relay: relay client protocol, pairing, and chum sync (spec §4.9).
//!
//! # Modules
//!
//! - [`protocol`]: the JSON command vocabulary shared by every sub-protocol here.
//! - [`challenge`]: the bit-inversion challenge/response primitive.
//! - [`ws_bridge`]: adapts a WebSocket onto the byte stream `meshstore_net::Connection` expects.
//! - [`listener`]: `RelayListener`, the relay client protocol (register, authenticate, spare pool).
//! - [`handshake`]: communication-initiation handshake and person-and-key identity exchange.
//! - [`pairing`]: invitations, `accept_invitation`, and post-pairing trust signing.
//! - [`chum`]: the sync protocol's want-list/blob exchange and dependency closure walk.
//! - [`relay_server`]: the `relayd` binary's server-side connection handling.
//!
//! `config` (the `relayd` CLI's argument parsing) is binary-only and lives in
//! `main.rs`, the way a relay's identity is relayd's concern, not a library one.

pub mod challenge;
pub mod chum;
pub mod handshake;
pub mod listener;
pub mod pairing;
pub mod protocol;
pub mod relay_server;
pub mod ws_bridge;

pub use chum::ChumFilter;
pub use handshake::{LocalIdentity, RemoteIdentity, Role};
pub use listener::{ListenerState, RelayListener, RelayListenerConfig};
pub use pairing::Invitation;
pub use relay_server::RelayServer;
