//! Invitations and pairing (spec §4.9 "Pairing").
//!
//! An [`Invitation`] is a one-time token embedded in a URL a human shares
//! out-of-band (QR code, chat link, ...). Accepting one dials the relay
//! named in the URL, runs the communication-initiation handshake and the
//! person-and-key mutual challenge (both in [`crate::handshake`]), records
//! a `OneInstanceEndpoint` so future syncs know how to reach the peer, and
//! grants the peer's signing key trust.

use crate::handshake::{self, LocalIdentity, RemoteIdentity, Role};
use meshstore_core::crypto;
use meshstore_core::error::{Error, Result};
use meshstore_core::hash::IdHash;
use meshstore_core::object::{ObjectInstance, Value};
use meshstore_core::recipe::{Discipline, FieldRule, PrimitiveKind, Recipe, RuleKind};
use meshstore_core::store::Store;
use meshstore_core::trust::{Certificate, CertificateKind, IssuerRights};
use meshstore_net::Connection;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_TRIES: u32 = 4;
pub const RETRY_DELAY: Duration = Duration::from_secs(2);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// Recipes pairing needs registered before [`Store::open`]: `PersonId`
/// (the versioned identity every other object references by IdHash),
/// `OneInstanceEndpoint` (how to reach a paired peer), mirroring how
/// [`meshstore_core::channel::built_in_recipes`] supplies C6's own schemas.
pub fn built_in_recipes() -> Vec<Recipe> {
    vec![
        Recipe::new(
            "PersonId",
            Discipline::Versioned,
            vec![FieldRule::new("email", RuleKind::Primitive(PrimitiveKind::String)).identifying()],
        ),
        Recipe::new(
            "OneInstanceEndpoint",
            Discipline::Versioned,
            vec![
                FieldRule::new("personId", RuleKind::Reference(meshstore_core::recipe::ReferenceKind::Id)).identifying(),
                FieldRule::new("url", RuleKind::Primitive(PrimitiveKind::String)),
                FieldRule::new("signPublic", RuleKind::Primitive(PrimitiveKind::String)),
                FieldRule::new("boxPublic", RuleKind::Primitive(PrimitiveKind::String)),
            ],
        ),
    ]
}

/// A one-time invitation to pair, as shared out-of-band (spec §4.9).
#[derive(Clone, Debug, PartialEq)]
pub struct Invitation {
    pub token: String,
    pub url: String,
    pub target_public_key: [u8; 32],
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
                out.push(bytes[i]);
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse `<prefix>#<urlencoded-json>`, falling back to treating the whole
/// string as JSON when there is no `#` (spec §4.9 "Invitation URL").
pub fn parse_invitation_url(raw: &str) -> Result<Invitation> {
    let json_part = match raw.split_once('#') {
        Some((_, fragment)) => percent_decode(fragment),
        None => raw.to_string(),
    };
    let parsed: serde_json::Value =
        serde_json::from_str(&json_part).map_err(|e| Error::UnexpectedMessage(format!("invalid invitation JSON: {e}")))?;

    let token = parsed
        .get("token")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| Error::UnexpectedMessage("invitation missing token".into()))?
        .to_string();
    let url = parsed
        .get("url")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| Error::UnexpectedMessage("invitation missing url".into()))?
        .to_string();
    let target_hex = parsed
        .get("targetPublicKey")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| Error::UnexpectedMessage("invitation missing targetPublicKey".into()))?;
    let target_bytes = hex::decode(target_hex).map_err(|e| Error::MalformedKey(e.to_string()))?;
    let target_public_key: [u8; 32] = target_bytes
        .try_into()
        .map_err(|_| Error::MalformedKey("targetPublicKey is not 32 bytes".into()))?;

    Ok(Invitation { token, url, target_public_key })
}

/// Store (or fetch the existing) `PersonId` for an email address, as both
/// local identity and the projection of a freshly met peer rely on (spec
/// §4.4 "Store id-object").
pub fn store_person_id(store: &Store, email: &str) -> Result<IdHash> {
    let obj = ObjectInstance::new("PersonId").with_field("email", Value::String(email.to_string()));
    store.objects().store_id_object(&obj)
}

fn store_one_instance_endpoint(store: &Store, remote: &RemoteIdentity, url: &str, now: i64) -> Result<()> {
    let obj = ObjectInstance::new("OneInstanceEndpoint")
        .with_field("personId", Value::RefId(remote.person_id_hash))
        .with_field("url", Value::String(url.to_string()))
        .with_field("signPublic", Value::String(hex::encode(remote.sign_public)))
        .with_field("boxPublic", Value::String(hex::encode(remote.box_public)));
    store.store_versioned(obj, now as u64)?;
    Ok(())
}

/// Grant the peer's signing key trust once pairing completes (spec §4.9 "a
/// successful pairing also issues a `TrustKeysCertificate`"). Root keys are
/// trusted directly but need explicit [`IssuerRights`] before they can issue
/// certificates for someone else (spec §4.7), so this grants the local root
/// key full rights on first use.
///
/// Also records a `Keys` object for the remote person (spec §4.7 "keys for a
/// person come from that person's profiles"), so a later `keys_of(remote
/// person)` finds this key without needing to replay this pairing.
fn sign_and_trust(store: &Store, remote: &RemoteIdentity, now: u64) -> Result<()> {
    let local_key_id = store.intern_key(store.keystore().sign_public);
    let remote_key_id = store.intern_key(remote.sign_public);

    let keys_obj = ObjectInstance::new("Keys")
        .with_field("person", Value::RefId(remote.person_id_hash))
        .with_field("signKeys", Value::Set(vec![Value::Bytes(remote.sign_public.to_vec())]));
    store.store_versioned(keys_obj, now)?;

    let signed_bytes = remote.sign_public.to_vec();
    let signature = crypto::sign(&signed_bytes, &store.keystore().sign_secret)?;

    let mut trust = store.trust_mut();
    trust.set_issuer_rights(local_key_id, IssuerRights { can_declare_for_everybody: true, can_declare_for_self: true });
    trust.add_certificate(Certificate {
        target_key: remote_key_id,
        candidate_issuer_keys: vec![(local_key_id, store.keystore().sign_public)],
        signed_bytes,
        signature,
        kind: CertificateKind::TrustKeysCertificate,
    });
    Ok(())
}

fn retryable(err: &Error) -> bool {
    matches!(err, Error::Timeout | Error::NetworkError(_) | Error::ConnectionClosed)
}

/// Accept an invitation: dial the relay (via `connect`, retried per spec
/// §4.9's `maxTries`/2s backoff), run the handshake, and record trust.
/// `connect` is injected rather than hard-coded to a WebSocket dial so this
/// can be exercised over an in-memory duplex pair in tests, the same way
/// [`crate::challenge::issue`]/`answer` take `send`/`recv` closures.
pub async fn accept_invitation<C, Fut>(
    store: &Store,
    local: &LocalIdentity,
    invitation: &Invitation,
    now: i64,
    connect: C,
) -> Result<RemoteIdentity>
where
    C: Fn() -> Fut,
    Fut: Future<Output = Result<Arc<Connection>>>,
{
    let mut last_err = Error::Timeout;
    for attempt in 0..DEFAULT_MAX_TRIES {
        if attempt > 0 {
            tokio::time::sleep(RETRY_DELAY).await;
        }
        match try_accept_once(store, local, invitation, now, &connect).await {
            Ok(remote) => return Ok(remote),
            Err(e) if retryable(&e) => last_err = e,
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}

async fn try_accept_once<C, Fut>(store: &Store, local: &LocalIdentity, invitation: &Invitation, now: i64, connect: &C) -> Result<RemoteIdentity>
where
    C: Fn() -> Fut,
    Fut: Future<Output = Result<Arc<Connection>>>,
{
    let conn = connect().await?;
    handshake::communication_initiation(&conn, Role::Initiator, &local.box_public, &invitation.target_public_key, HANDSHAKE_TIMEOUT).await?;
    let remote = handshake::exchange_identities(&conn, store, local, HANDSHAKE_TIMEOUT).await?;
    handshake::mutual_challenge(&conn, local, &remote.box_public, Role::Initiator, HANDSHAKE_TIMEOUT).await?;
    store_one_instance_endpoint(store, &remote, &invitation.url, now)?;
    sign_and_trust(store, &remote, now as u64)?;
    Ok(remote)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fragment_style_invitation_url() {
        let json = serde_json::json!({
            "token": "abc123",
            "url": "wss://relay.example/ws",
            "targetPublicKey": hex::encode([7u8; 32]),
        });
        let encoded = serde_json::to_string(&json).unwrap().replace(':', "%3A").replace(' ', "%20");
        let url = format!("https://pair.example/invite#{encoded}");

        let invitation = parse_invitation_url(&url).unwrap();
        assert_eq!(invitation.token, "abc123");
        assert_eq!(invitation.url, "wss://relay.example/ws");
        assert_eq!(invitation.target_public_key, [7u8; 32]);
    }

    #[test]
    fn parses_bare_json_invitation() {
        let json = serde_json::json!({
            "token": "xyz",
            "url": "wss://relay.example/ws",
            "targetPublicKey": hex::encode([9u8; 32]),
        })
        .to_string();
        let invitation = parse_invitation_url(&json).unwrap();
        assert_eq!(invitation.token, "xyz");
    }

    #[test]
    fn rejects_invitation_missing_fields() {
        let json = serde_json::json!({"token": "abc"}).to_string();
        assert!(parse_invitation_url(&json).is_err());
    }
}
