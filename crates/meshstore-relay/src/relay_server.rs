//! The `relayd` server side: registration, authentication, and blind frame
//! forwarding between a registrant's spare connection and a caller (spec
//! §4.9 "Relay server"). Grounded on `gossipd::server::Server`'s
//! `tokio::select!` accept loop, substituting `accept_async` + the
//! WebSocket bridge for raw TCP.

use crate::challenge;
use crate::protocol;
use crate::ws_bridge;
use meshstore_core::error::{Error, Result};
use meshstore_net::{Connection, Frame, FrameType};
use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{info, warn};

const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL_MS: u64 = 20_000;

/// Spare connections parked by the registrant's box public key, waiting for
/// a `connection_handover`.
pub struct RelayServer {
    box_public: [u8; 32],
    box_secret: [u8; 32],
    spares: Mutex<HashMap<[u8; 32], Arc<Connection>>>,
}

impl RelayServer {
    pub fn new(box_public: [u8; 32], box_secret: [u8; 32]) -> Arc<Self> {
        Arc::new(Self { box_public, box_secret, spares: Mutex::new(HashMap::new()) })
    }

    /// Accept loop: one task per connection, torn down on `shutdown_rx`
    /// (the same shape as `gossipd`'s `Server::run`).
    pub async fn run(self: Arc<Self>, bind_addr: SocketAddr, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        info!("relayd listening on {bind_addr}");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_connection(stream).await {
                            warn!("relay connection from {peer} ended: {e}");
                        }
                    });
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("relayd shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let ws = tokio_tungstenite::accept_async(stream).await.map_err(|e| Error::NetworkError(e.to_string()))?;
        let io = ws_bridge::bridge(ws);
        let conn = Connection::spawn(io);

        let first = conn.wait_for_message(REGISTER_TIMEOUT).await?;
        let text = first.as_text().map_err(|e| Error::UnexpectedMessage(e.to_string()))?;
        let msg: serde_json::Value = serde_json::from_str(text)?;

        match msg.get("command").and_then(serde_json::Value::as_str) {
            Some(protocol::REGISTER) => self.handle_register(conn, &msg).await,
            Some(protocol::COMMUNICATION_REQUEST) => self.handle_caller(conn, &msg).await,
            Some(other) => Err(Error::UnexpectedMessage(format!("unexpected first command {other}"))),
            None => Err(Error::UnexpectedMessage("first message missing command".into())),
        }
    }

    /// Authenticate a registrant, then park it as a spare until either a
    /// caller claims it (removed from the map by [`Self::handle_caller`]) or
    /// it disconnects.
    async fn handle_register(&self, conn: Arc<Connection>, msg: &serde_json::Value) -> Result<()> {
        let public_hex = msg
            .get("publicKey")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| Error::UnexpectedMessage("register missing publicKey".into()))?;
        let public_bytes = hex::decode(public_hex).map_err(|e| Error::MalformedKey(e.to_string()))?;
        let public_key: [u8; 32] = public_bytes.try_into().map_err(|_| Error::MalformedKey("publicKey is not 32 bytes".into()))?;

        let mut plain = vec![0u8; challenge::CHALLENGE_LEN];
        OsRng.fill_bytes(&mut plain);
        let sealed = challenge::seal(&plain, &self.box_secret, &public_key)?;
        conn.send_json(&serde_json::json!({"command": protocol::AUTHENTICATION_REQUEST, "challenge": hex::encode(sealed)}))?;

        let response = conn.wait_for_json_with(protocol::AUTHENTICATION_RESPONSE, "command", REGISTER_TIMEOUT).await?;
        let response_hex = response
            .get("response")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| Error::UnexpectedMessage("authentication_response missing response".into()))?;
        let sealed_response = hex::decode(response_hex).map_err(|e| Error::MalformedKey(e.to_string()))?;
        let opened = challenge::open(&sealed_response, &self.box_secret, &public_key)?;
        let expected: Vec<u8> = plain.iter().map(|b| !b).collect();
        if opened != expected {
            return Err(Error::AuthenticationFailed);
        }

        conn.send_json(&serde_json::json!({"command": protocol::AUTHENTICATION_SUCCESS, "pingInterval": PING_INTERVAL_MS}))?;
        conn.start_keepalive(Duration::from_millis(PING_INTERVAL_MS), Duration::from_secs(10));

        self.spares.lock().insert(public_key, conn.clone());
        // Park until the connection closes (handed over, or the registrant
        // disconnected); `recv_any` returns ConnectionClosed either way, the
        // handover itself is delivered by handle_caller writing directly to
        // the parked connection.
        let _ = conn.recv_any().await;
        self.spares.lock().remove(&public_key);
        Ok(())
    }

    /// A caller requesting `communication_request{targetPublicKey}`: hand
    /// the matching spare over and then blindly forward frames both ways.
    async fn handle_caller(&self, caller: Arc<Connection>, msg: &serde_json::Value) -> Result<()> {
        let target_hex = msg
            .get("targetPublicKey")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| Error::UnexpectedMessage("communication_request missing targetPublicKey".into()))?;
        let target_bytes = hex::decode(target_hex).map_err(|e| Error::MalformedKey(e.to_string()))?;
        let target: [u8; 32] = target_bytes.try_into().map_err(|_| Error::MalformedKey("targetPublicKey is not 32 bytes".into()))?;

        let spare = self
            .spares
            .lock()
            .remove(&target)
            .ok_or_else(|| Error::NotFound(format!("no spare connection registered for {target_hex}")))?;

        spare.send_json(&serde_json::json!({"command": protocol::CONNECTION_HANDOVER}))?;
        relay_frames(caller, spare).await
    }
}

/// Opaque bidirectional pipe between two already-established connections.
/// The relay never inspects what it forwards past this point.
async fn relay_frames(a: Arc<Connection>, b: Arc<Connection>) -> Result<()> {
    loop {
        tokio::select! {
            frame = a.recv_any() => forward(&b, frame?)?,
            frame = b.recv_any() => forward(&a, frame?)?,
        }
    }
}

fn forward(to: &Connection, frame: Frame) -> Result<()> {
    match frame.frame_type {
        FrameType::Text => to.send_text(String::from_utf8_lossy(&frame.payload).into_owned()),
        FrameType::Binary => to.send_binary(frame.payload),
        FrameType::Ping | FrameType::Pong => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshstore_core::crypto::new_box_keypair;
    use tokio::io::duplex;

    #[tokio::test]
    async fn handle_register_authenticates_and_parks_then_releases_on_handover() {
        let (relay_box_public, relay_box_secret) = new_box_keypair();
        let (registrant_public, registrant_secret) = new_box_keypair();
        let server = RelayServer::new(relay_box_public, relay_box_secret);

        let (registrant_io, relay_io) = duplex(8192);
        let registrant_conn = Connection::spawn(registrant_io);
        let relay_conn = Connection::spawn(relay_io);

        let server_clone = server.clone();
        let server_task = tokio::spawn(async move {
            let msg = serde_json::json!({"command": protocol::REGISTER, "publicKey": hex::encode(registrant_public)});
            server_clone.handle_register(relay_conn, &msg).await
        });

        let request = registrant_conn.wait_for_json_with(protocol::AUTHENTICATION_REQUEST, "command", Duration::from_secs(1)).await.unwrap();
        let sealed_hex = request.get("challenge").and_then(serde_json::Value::as_str).unwrap();
        let sealed = hex::decode(sealed_hex).unwrap();
        let plain = challenge::open(&sealed, &registrant_secret, &relay_box_public).unwrap();
        let inverted: Vec<u8> = plain.iter().map(|b| !b).collect();
        let resealed = challenge::seal(&inverted, &registrant_secret, &relay_box_public).unwrap();
        registrant_conn
            .send_json(&serde_json::json!({"command": protocol::AUTHENTICATION_RESPONSE, "response": hex::encode(resealed)}))
            .unwrap();

        registrant_conn.wait_for_json_with(protocol::AUTHENTICATION_SUCCESS, "command", Duration::from_secs(1)).await.unwrap();
        assert!(server.spares.lock().contains_key(&registrant_public));

        // Dropping every handle (rather than calling `close`, which only
        // flips local state) ends the reader/writer tasks and actually
        // closes the duplex pair, so the relay side observes real EOF.
        drop(registrant_conn);
        server_task.await.unwrap().unwrap();
        assert!(!server.spares.lock().contains_key(&registrant_public));
    }
}
