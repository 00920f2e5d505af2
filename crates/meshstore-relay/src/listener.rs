//! Relay client protocol: `RelayListener` (spec §4.9 "Relay client
//! protocol").
//!
//! A listener dials a relay, registers its public key, authenticates via the
//! same bit-inversion challenge as [`crate::challenge`] (under distinct
//! command names, since the relay's own handshake and the person-and-key
//! handshake run over different connections), then keeps a pool of
//! `spareConnectionLimit` spare connections parked at the relay so an
//! incoming caller gets a `connection_handover` without waiting for a fresh
//! TLS/WebSocket round trip.

use crate::challenge;
use crate::protocol;
use crate::ws_bridge;
use futures_util::stream::{FuturesUnordered, StreamExt};
use meshstore_core::error::{Error, Result};
use meshstore_net::Connection;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

pub const DEFAULT_SPARE_CONNECTION_LIMIT: usize = 5;
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(20);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// `{not listening -> connecting -> listening}`, mirroring the connection
/// core's own state machine one layer up (spec §4.9).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerState {
    NotListening,
    Connecting,
    Listening,
}

#[derive(Clone, Debug)]
pub struct RelayListenerConfig {
    pub relay_url: String,
    pub relay_box_public: [u8; 32],
    pub spare_connection_limit: usize,
    pub reconnect_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl RelayListenerConfig {
    pub fn new(relay_url: impl Into<String>, relay_box_public: [u8; 32]) -> Self {
        Self {
            relay_url: relay_url.into(),
            relay_box_public,
            spare_connection_limit: DEFAULT_SPARE_CONNECTION_LIMIT,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Dial `config.relay_url`, bridge the WebSocket onto a [`Connection`], and
/// run the relay's own `register` -> `authentication_request` ->
/// `authentication_response` -> `authentication_success` handshake
/// (distinct command names from [`crate::challenge`]'s person-and-key
/// `challenge`/`challenge_response`, carried over this same bit-inversion
/// primitive).
pub async fn dial_and_authenticate(
    relay_url: &str,
    relay_box_public: &[u8; 32],
    own_box_public: &[u8; 32],
    own_box_secret: &[u8; 32],
    timeout: Duration,
) -> Result<(Arc<Connection>, Duration)> {
    let (ws, _response) = tokio_tungstenite::connect_async(relay_url)
        .await
        .map_err(|e| Error::NetworkError(e.to_string()))?;
    let io = ws_bridge::bridge(ws);
    let conn = Connection::spawn(io);

    conn.send_json(&serde_json::json!({
        "command": protocol::REGISTER,
        "publicKey": hex::encode(own_box_public),
    }))?;

    let request = conn.wait_for_json_with(protocol::AUTHENTICATION_REQUEST, "command", timeout).await?;
    let sealed_hex = request
        .get("challenge")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| Error::UnexpectedMessage("authentication_request missing challenge".into()))?;
    let sealed = hex::decode(sealed_hex).map_err(|e| Error::MalformedKey(e.to_string()))?;
    let plain = challenge::open(&sealed, own_box_secret, relay_box_public)?;
    let inverted: Vec<u8> = plain.iter().map(|b| !b).collect();
    let resealed = challenge::seal(&inverted, own_box_secret, relay_box_public)?;

    conn.send_json(&serde_json::json!({
        "command": protocol::AUTHENTICATION_RESPONSE,
        "response": hex::encode(resealed),
    }))?;

    let success = conn.wait_for_json_with(protocol::AUTHENTICATION_SUCCESS, "command", timeout).await?;
    let ping_interval = success
        .get("pingInterval")
        .and_then(serde_json::Value::as_u64)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_PING_INTERVAL);

    Ok((conn, ping_interval))
}

/// Maintains a pool of spare connections at a relay and forwards each one
/// that receives a `connection_handover` down `handover_tx`.
pub struct RelayListener {
    config: RelayListenerConfig,
    state_tx: watch::Sender<ListenerState>,
    active_spares: AtomicUsize,
}

impl RelayListener {
    pub fn new(config: RelayListenerConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ListenerState::NotListening);
        Arc::new(Self { config, state_tx, active_spares: AtomicUsize::new(0) })
    }

    pub fn watch_state(&self) -> watch::Receiver<ListenerState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ListenerState {
        *self.state_tx.borrow()
    }

    /// Run forever, redialing on error after `reconnect_timeout`. Spawn this
    /// with `tokio::spawn` and drop the handle to stop it.
    pub async fn run(self: Arc<Self>, own_box_public: [u8; 32], own_box_secret: [u8; 32], handover_tx: mpsc::UnboundedSender<Arc<Connection>>) {
        loop {
            let _ = self.state_tx.send(ListenerState::Connecting);
            if let Err(e) = self.clone().maintain_spares(own_box_public, own_box_secret, handover_tx.clone()).await {
                warn!("relay listener error: {e}");
            }
            let _ = self.state_tx.send(ListenerState::NotListening);
            self.active_spares.store(0, Ordering::SeqCst);
            tokio::time::sleep(self.config.reconnect_timeout).await;
        }
    }

    async fn maintain_spares(self: Arc<Self>, own_box_public: [u8; 32], own_box_secret: [u8; 32], handover_tx: mpsc::UnboundedSender<Arc<Connection>>) -> Result<()> {
        let mut pending = FuturesUnordered::new();
        for _ in 0..self.config.spare_connection_limit {
            pending.push(self.clone().run_one_spare(own_box_public, own_box_secret, handover_tx.clone()));
        }

        while let Some(result) = pending.next().await {
            result?;
            if self.active_spares.load(Ordering::SeqCst) > 0 {
                let _ = self.state_tx.send(ListenerState::Listening);
            }
            pending.push(self.clone().run_one_spare(own_box_public, own_box_secret, handover_tx.clone()));
        }
        Ok(())
    }

    /// Dial, authenticate, park as a spare, and block until the relay hands
    /// this connection to a caller (or it drops). One pool slot's lifecycle.
    async fn run_one_spare(self: Arc<Self>, own_box_public: [u8; 32], own_box_secret: [u8; 32], handover_tx: mpsc::UnboundedSender<Arc<Connection>>) -> Result<()> {
        let (conn, ping_interval) =
            dial_and_authenticate(&self.config.relay_url, &self.config.relay_box_public, &own_box_public, &own_box_secret, self.config.handshake_timeout).await?;
        conn.start_keepalive(ping_interval, PONG_TIMEOUT);

        self.active_spares.fetch_add(1, Ordering::SeqCst);
        let _ = self.state_tx.send(ListenerState::Listening);

        let outcome = conn.wait_for_json_with(protocol::CONNECTION_HANDOVER, "command", Duration::from_secs(3600 * 24)).await;
        self.active_spares.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Ok(_) => {
                debug!("relay handed a connection over");
                handover_tx.send(conn).map_err(|_| Error::ConnectionClosed)?;
                Ok(())
            }
            Err(Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let config = RelayListenerConfig::new("wss://relay.example", [0u8; 32]);
        assert_eq!(config.spare_connection_limit, DEFAULT_SPARE_CONNECTION_LIMIT);
        assert_eq!(config.reconnect_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn authenticate_as_registrant_completes_against_a_cooperating_relay() {
        use meshstore_core::crypto::new_box_keypair;
        use tokio::io::duplex;

        let (relay_box_public, relay_box_secret) = new_box_keypair();
        let (own_box_public, own_box_secret) = new_box_keypair();

        let (relay_io, registrant_io) = duplex(8192);
        let relay_conn = Connection::spawn(relay_io);
        let registrant_conn = Connection::spawn(registrant_io);

        let relay_task = tokio::spawn(async move {
            let register = relay_conn.wait_for_json_with(protocol::REGISTER, "command", Duration::from_secs(1)).await.unwrap();
            let declared_key = register.get("publicKey").and_then(serde_json::Value::as_str).unwrap();
            assert_eq!(declared_key, hex::encode(own_box_public));

            let plain = b"0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcd".to_vec();
            let sealed = challenge::seal(&plain, &relay_box_secret, &own_box_public).unwrap();
            relay_conn
                .send_json(&serde_json::json!({"command": protocol::AUTHENTICATION_REQUEST, "challenge": hex::encode(sealed)}))
                .unwrap();

            let response = relay_conn.wait_for_json_with(protocol::AUTHENTICATION_RESPONSE, "command", Duration::from_secs(1)).await.unwrap();
            let response_hex = response.get("response").and_then(serde_json::Value::as_str).unwrap();
            let sealed_response = hex::decode(response_hex).unwrap();
            let opened = challenge::open(&sealed_response, &relay_box_secret, &own_box_public).unwrap();
            let expected_inverted: Vec<u8> = plain.iter().map(|b| !b).collect();
            assert_eq!(opened, expected_inverted);

            relay_conn
                .send_json(&serde_json::json!({"command": protocol::AUTHENTICATION_SUCCESS, "pingInterval": 15000}))
                .unwrap();
        });

        let (conn, ping_interval) =
            dial_and_authenticate_over(&registrant_conn, &relay_box_public, &own_box_public, &own_box_secret, Duration::from_secs(1))
                .await
                .unwrap();
        drop(conn);
        assert_eq!(ping_interval, Duration::from_millis(15000));
        relay_task.await.unwrap();
    }

    /// Test-only variant of [`dial_and_authenticate`] that runs the same
    /// handshake over an already-established `Connection`, so the
    /// registrant side can be exercised without a real WebSocket dial.
    async fn dial_and_authenticate_over(
        conn: &Arc<Connection>,
        relay_box_public: &[u8; 32],
        own_box_public: &[u8; 32],
        own_box_secret: &[u8; 32],
        timeout: Duration,
    ) -> Result<(Arc<Connection>, Duration)> {
        conn.send_json(&serde_json::json!({"command": protocol::REGISTER, "publicKey": hex::encode(own_box_public)}))?;
        let request = conn.wait_for_json_with(protocol::AUTHENTICATION_REQUEST, "command", timeout).await?;
        let sealed_hex = request.get("challenge").and_then(serde_json::Value::as_str).unwrap();
        let sealed = hex::decode(sealed_hex).unwrap();
        let plain = challenge::open(&sealed, own_box_secret, relay_box_public)?;
        let inverted: Vec<u8> = plain.iter().map(|b| !b).collect();
        let resealed = challenge::seal(&inverted, own_box_secret, relay_box_public)?;
        conn.send_json(&serde_json::json!({"command": protocol::AUTHENTICATION_RESPONSE, "response": hex::encode(resealed)}))?;
        let success = conn.wait_for_json_with(protocol::AUTHENTICATION_SUCCESS, "command", timeout).await?;
        let ping_interval = success.get("pingInterval").and_then(serde_json::Value::as_u64).map(Duration::from_millis).unwrap_or(DEFAULT_PING_INTERVAL);
        Ok((conn.clone(), ping_interval))
    }
}
