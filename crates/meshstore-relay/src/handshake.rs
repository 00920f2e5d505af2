//! Communication-initiation handshake and person-and-key exchange (spec §4.9
//! "Communication-initiation handshake", "Person-and-key exchange").
//!
//! Modeled as an explicit finite-state machine per Design Notes ("Coroutine-
//! style challenge/response dance" -> named states) rather than implicit
//! `await` chaining: each stage is one function, called in the fixed order
//! the spec lays out, with the caller choosing [`Role`] up front.

use crate::challenge;
use crate::pairing;
use crate::protocol;
use meshstore_core::error::{Error, Result};
use meshstore_core::hash::IdHash;
use meshstore_core::store::Store;
use meshstore_net::Connection;
use std::time::Duration;

/// Which side of the transport this peer is. Per spec §4.9, "the side that
/// initiated the transport responds first" in the person-and-key challenge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Receiver,
}

fn parse_hex32(value: &serde_json::Value, field: &str) -> Result<[u8; 32]> {
    let s = value
        .get(field)
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| Error::UnexpectedMessage(format!("missing field {field}")))?;
    let bytes = hex::decode(s).map_err(|e| Error::MalformedKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| Error::MalformedKey(format!("{field} is not 32 bytes")))
}

/// `initiator -> communication_request{sourcePublicKey, targetPublicKey}`,
/// `receiver <- communication_ready` (spec §4.9).
pub async fn communication_initiation(
    conn: &Connection,
    role: Role,
    source_public_key: &[u8; 32],
    target_public_key: &[u8; 32],
    timeout: Duration,
) -> Result<()> {
    match role {
        Role::Initiator => {
            conn.send_json(&serde_json::json!({
                "command": protocol::COMMUNICATION_REQUEST,
                "sourcePublicKey": hex::encode(source_public_key),
                "targetPublicKey": hex::encode(target_public_key),
            }))?;
            conn.wait_for_json_with(protocol::COMMUNICATION_READY, "command", timeout).await?;
            Ok(())
        }
        Role::Receiver => {
            let request = conn
                .wait_for_json_with(protocol::COMMUNICATION_REQUEST, "command", timeout)
                .await?;
            let declared_target = parse_hex32(&request, "targetPublicKey")?;
            if &declared_target != target_public_key {
                return Err(Error::AuthenticationFailed);
            }
            conn.send_json(&serde_json::json!({"command": protocol::COMMUNICATION_READY}))?;
            Ok(())
        }
    }
}

/// This instance's identity, as presented during person-and-key exchange.
#[derive(Clone, Debug)]
pub struct LocalIdentity {
    pub email: String,
    pub sign_public: [u8; 32],
    pub box_public: [u8; 32],
    pub box_secret: [u8; 32],
}

/// What we learn about the peer from identity exchange plus the mutual
/// challenge: enough to build a [`crate::pairing::OneInstanceEndpoint`].
#[derive(Clone, Debug)]
pub struct RemoteIdentity {
    pub person_id_hash: IdHash,
    pub email: String,
    pub sign_public: [u8; 32],
    pub box_public: [u8; 32],
}

/// Both peers send their `PersonId` id-object and default `Keys` (spec §4.9).
pub async fn exchange_identities(conn: &Connection, store: &Store, local: &LocalIdentity, timeout: Duration) -> Result<RemoteIdentity> {
    conn.send_json(&serde_json::json!({
        "command": protocol::IDENTITY,
        "personEmail": local.email,
        "signPublic": hex::encode(local.sign_public),
        "boxPublic": hex::encode(local.box_public),
    }))?;

    let msg = conn.wait_for_json_with(protocol::IDENTITY, "command", timeout).await?;
    let email = msg
        .get("personEmail")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| Error::UnexpectedMessage("identity missing personEmail".into()))?
        .to_string();
    let sign_public = parse_hex32(&msg, "signPublic")?;
    let box_public = parse_hex32(&msg, "boxPublic")?;

    let person_id_hash = pairing::store_person_id(store, &email)?;
    Ok(RemoteIdentity { person_id_hash, email, sign_public, box_public })
}

/// Each side challenges the other with 64 random bytes sealed to the peer's
/// box key; the side that initiated the transport answers first (spec §4.9,
/// §8 property 10).
pub async fn mutual_challenge(conn: &Connection, local: &LocalIdentity, their_box_public: &[u8; 32], role: Role, timeout: Duration) -> Result<()> {
    let my_sec = local.box_secret;
    let their_pub = *their_box_public;

    let issue_once = || {
        challenge::issue(
            &my_sec,
            &their_pub,
            |sealed| async move {
                conn.send_json(&serde_json::json!({"command": protocol::CHALLENGE, "payload": hex::encode(sealed)}))
            },
            || async move {
                let msg = conn.wait_for_json_with(protocol::CHALLENGE_RESPONSE, "command", timeout).await?;
                let payload = msg
                    .get("payload")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| Error::UnexpectedMessage("challenge_response missing payload".into()))?;
                hex::decode(payload).map_err(|e| Error::MalformedKey(e.to_string()))
            },
        )
    };

    let answer_once = || {
        challenge::answer(
            &my_sec,
            &their_pub,
            || async move {
                let msg = conn.wait_for_json_with(protocol::CHALLENGE, "command", timeout).await?;
                let payload = msg
                    .get("payload")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| Error::UnexpectedMessage("challenge missing payload".into()))?;
                hex::decode(payload).map_err(|e| Error::MalformedKey(e.to_string()))
            },
            |sealed| async move {
                conn.send_json(&serde_json::json!({"command": protocol::CHALLENGE_RESPONSE, "payload": hex::encode(sealed)}))
            },
        )
    };

    match role {
        Role::Initiator => {
            answer_once().await?;
            issue_once().await
        }
        Role::Receiver => {
            issue_once().await?;
            answer_once().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshstore_core::config::InstanceOptions;
    use meshstore_core::crypto::{new_box_keypair, new_sign_keypair};
    use tokio::io::duplex;

    fn local_identity(email: &str) -> LocalIdentity {
        let (box_public, box_secret) = new_box_keypair();
        let (sign_public, _) = new_sign_keypair();
        LocalIdentity { email: email.to_string(), sign_public, box_public, box_secret }
    }

    fn test_store(dir: &std::path::Path) -> Store {
        Store::open(InstanceOptions::new("n", "e@x.com", dir)).unwrap()
    }

    #[tokio::test]
    async fn communication_initiation_round_trips() {
        let (a_io, b_io) = duplex(4096);
        let initiator = Connection::spawn(a_io);
        let receiver = Connection::spawn(b_io);
        let source = [1u8; 32];
        let target = [2u8; 32];

        let a = tokio::spawn({
            let initiator = initiator.clone();
            async move { communication_initiation(&initiator, Role::Initiator, &source, &target, Duration::from_secs(1)).await }
        });
        let b = tokio::spawn(async move { communication_initiation(&receiver, Role::Receiver, &source, &target, Duration::from_secs(1)).await });

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn mutual_challenge_succeeds_both_directions() {
        let alice = local_identity("alice@example.com");
        let bob = local_identity("bob@example.com");
        let (a_io, b_io) = duplex(8192);
        let a_conn = Connection::spawn(a_io);
        let b_conn = Connection::spawn(b_io);

        let (alice_box_public, bob_box_public) = (alice.box_public, bob.box_public);
        let a = tokio::spawn({
            let alice = alice.clone();
            async move { mutual_challenge(&a_conn, &alice, &bob_box_public, Role::Initiator, Duration::from_secs(1)).await }
        });
        let b = tokio::spawn(async move { mutual_challenge(&b_conn, &bob, &alice_box_public, Role::Receiver, Duration::from_secs(1)).await });

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn exchange_identities_resolves_remote_person() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let store_a = test_store(dir_a.path());
        let store_b = test_store(dir_b.path());

        let alice = local_identity("alice@example.com");
        let bob = local_identity("bob@example.com");
        let (a_io, b_io) = duplex(8192);
        let a_conn = Connection::spawn(a_io);
        let b_conn = Connection::spawn(b_io);

        let a = tokio::spawn(async move { exchange_identities(&a_conn, &store_a, &alice, Duration::from_secs(1)).await });
        let b = tokio::spawn(async move { exchange_identities(&b_conn, &store_b, &bob, Duration::from_secs(1)).await });

        let remote_for_a = a.await.unwrap().unwrap();
        let remote_for_b = b.await.unwrap().unwrap();
        assert_eq!(remote_for_a.email, "bob@example.com");
        assert_eq!(remote_for_b.email, "alice@example.com");
    }
}
