//! Sync protocol ("chum") (spec §4.9 "Sync protocol (chum)").
//!
//! Once two instances are paired, either side can open a sync round: a
//! `synchronisation` marker exchange, then a want-list exchange
//! (`chum_want`/`chum_blob`/`chum_sent_done`) carrying the dependency
//! closure of whatever root hashes the caller asked for, leaves first so a
//! receiver never stores an object before the blobs/ids it refers to.
//!
//! `RefId` references are deliberately not followed here: resolving an
//! IdHash means syncing a whole version map, not fetching one blob, and is
//! out of scope for this closure walk (see `DESIGN.md`).

use crate::protocol;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use meshstore_core::error::{Error, Result};
use meshstore_core::hash::ObjectHash;
use meshstore_core::object::Value as ObjValue;
use meshstore_core::store::Store;
use meshstore_net::Connection;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Caller-supplied predicate deciding whether a hash in a requested closure
/// is actually allowed to leave this instance (spec §4.9 "an injected filter
/// predicate governs which objects actually cross the wire").
pub type ChumFilter = Arc<dyn Fn(&ObjectHash) -> bool + Send + Sync>;

pub fn allow_all() -> ChumFilter {
    Arc::new(|_| true)
}

fn collect_references(value: &ObjValue, out: &mut Vec<ObjectHash>) {
    match value {
        ObjValue::RefObject(h) | ObjValue::RefBlob(h) | ObjValue::RefClob(h) => out.push(*h),
        ObjValue::List(items) | ObjValue::Bag(items) | ObjValue::Set(items) => {
            for item in items {
                collect_references(item, out);
            }
        }
        ObjValue::Mapping(pairs) => {
            for (k, v) in pairs {
                collect_references(k, out);
                collect_references(v, out);
            }
        }
        ObjValue::Object(inner) => {
            for (_, v) in &inner.fields {
                collect_references(v, out);
            }
        }
        _ => {}
    }
}

/// Leaves-first dependency closure of `root`: every hash `root` (transitively)
/// references via `RefObject`/`RefBlob`/`RefClob`, followed by `root` itself.
/// A hash that doesn't decode as a recipe-known object (a raw blob/clob leaf)
/// is treated as having no further references.
pub fn closure(store: &Store, root: ObjectHash) -> Vec<ObjectHash> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(store, root, &mut visited, &mut order);
    order
}

fn visit(store: &Store, hash: ObjectHash, visited: &mut HashSet<ObjectHash>, order: &mut Vec<ObjectHash>) {
    if !visited.insert(hash) {
        return;
    }
    if let Ok(obj) = store.objects().get(hash, None) {
        let mut refs = Vec::new();
        for (_, v) in &obj.fields {
            collect_references(v, &mut refs);
        }
        for r in refs {
            visit(store, r, visited, order);
        }
    }
    order.push(hash);
}

/// `synchronisation` marker: both sides send, then both wait, so this never
/// deadlocks regardless of who calls it first.
pub async fn synchronise(conn: &Connection, timeout: Duration) -> Result<()> {
    conn.send_json(&serde_json::json!({"command": protocol::SYNCHRONISATION}))?;
    conn.wait_for_json_with(protocol::SYNCHRONISATION, "command", timeout).await?;
    Ok(())
}

fn hashes_field(msg: &serde_json::Value, field: &str) -> Result<Vec<ObjectHash>> {
    msg.get(field)
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| Error::UnexpectedMessage(format!("chum message missing {field}")))?
        .iter()
        .map(|v| {
            let s = v.as_str().ok_or_else(|| Error::UnexpectedMessage(format!("{field} entry is not a string")))?;
            ObjectHash::from_hex(s)
        })
        .collect()
}

/// Run one sync round: send the closures of `want`'s roots, service the
/// peer's own `chum_want`, and return every hash the peer sent us. Turn-based
/// over a single `Connection` (mirrors [`crate::handshake`]'s direct JSON
/// framing rather than going through [`meshstore_net::RequestMultiplexer`],
/// since chum has its own request/response vocabulary already).
pub async fn run(conn: &Connection, store: &Store, filter: ChumFilter, want: Vec<ObjectHash>, timeout: Duration) -> Result<Vec<ObjectHash>> {
    synchronise(conn, timeout).await?;

    conn.send_json(&serde_json::json!({
        "command": protocol::CHUM_WANT,
        "hashes": want.iter().map(ObjectHash::to_hex).collect::<Vec<_>>(),
    }))?;

    let mut received = Vec::new();
    let mut already_sent: HashSet<ObjectHash> = HashSet::new();
    let mut sent_done = false;
    let mut peer_done = false;
    let mut serviced_want = false;

    while !(sent_done && peer_done) {
        let frame = conn.wait_for_message(timeout).await?;
        let text = frame.as_text().map_err(|e| Error::UnexpectedMessage(e.to_string()))?;
        let msg: serde_json::Value = serde_json::from_str(text)?;
        let command = msg.get("command").and_then(serde_json::Value::as_str).unwrap_or_default();

        match command {
            protocol::CHUM_WANT if !serviced_want => {
                serviced_want = true;
                for root in hashes_field(&msg, "hashes")? {
                    for dep in closure(store, root) {
                        if already_sent.contains(&dep) || !filter(&dep) {
                            continue;
                        }
                        let bytes = store.objects().blobs().get(dep.0)?;
                        conn.send_json(&serde_json::json!({
                            "command": protocol::CHUM_BLOB,
                            "hash": dep.to_hex(),
                            "data": BASE64.encode(bytes),
                        }))?;
                        already_sent.insert(dep);
                    }
                }
                conn.send_json(&serde_json::json!({"command": protocol::CHUM_SENT_DONE}))?;
                sent_done = true;
            }
            protocol::CHUM_WANT => {
                // A peer re-sending chum_want after we already serviced one is a
                // protocol violation for this single-round exchange.
                return Err(Error::UnexpectedMessage("duplicate chum_want in one round".into()));
            }
            protocol::CHUM_BLOB => {
                let hash_hex = msg
                    .get("hash")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| Error::UnexpectedMessage("chum_blob missing hash".into()))?;
                let claimed = ObjectHash::from_hex(hash_hex)?;
                let data_b64 = msg
                    .get("data")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| Error::UnexpectedMessage("chum_blob missing data".into()))?;
                let bytes = BASE64.decode(data_b64).map_err(|e| Error::UnexpectedMessage(e.to_string()))?;
                let put = store.objects().blobs().put(&bytes)?;
                let actual = ObjectHash::new(put.hash);
                if actual != claimed {
                    return Err(Error::MalformedHash(format!("chum_blob hash mismatch: claimed {claimed}, computed {actual}")));
                }
                received.push(actual);
            }
            protocol::CHUM_SENT_DONE => {
                peer_done = true;
            }
            other => return Err(Error::UnexpectedMessage(format!("unexpected chum command {other}"))),
        }
    }

    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshstore_core::config::InstanceOptions;
    use meshstore_core::object::{ObjectInstance, Value};
    use meshstore_core::recipe::{Discipline, FieldRule, PrimitiveKind, Recipe, ReferenceKind, RuleKind};
    use tokio::io::duplex;

    fn opts(dir: &std::path::Path) -> InstanceOptions {
        let mut opts = InstanceOptions::new("n", "e@x.com", dir);
        opts.initial_recipes.push(Recipe::new(
            "Leaf",
            Discipline::Unversioned,
            vec![FieldRule::new("n", RuleKind::Primitive(PrimitiveKind::Integer))],
        ));
        opts.initial_recipes.push(Recipe::new(
            "Parent",
            Discipline::Unversioned,
            vec![FieldRule::new("child", RuleKind::Reference(ReferenceKind::Object))],
        ));
        opts
    }

    #[test]
    fn closure_orders_leaves_before_parent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(opts(dir.path())).unwrap();

        let leaf = store.store_unversioned(ObjectInstance::new("Leaf").with_field("n", Value::Integer(1))).unwrap();
        let parent = store
            .store_unversioned(ObjectInstance::new("Parent").with_field("child", Value::RefObject(leaf.hash)))
            .unwrap();

        let order = closure(&store, parent.hash);
        let leaf_pos = order.iter().position(|h| *h == leaf.hash).unwrap();
        let parent_pos = order.iter().position(|h| *h == parent.hash).unwrap();
        assert!(leaf_pos < parent_pos);
    }

    #[tokio::test]
    async fn run_transfers_closure_to_the_requester() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let store_a = Store::open(opts(dir_a.path())).unwrap();
        let store_b = Store::open(opts(dir_b.path())).unwrap();

        let leaf = store_a.store_unversioned(ObjectInstance::new("Leaf").with_field("n", Value::Integer(7))).unwrap();
        let parent = store_a
            .store_unversioned(ObjectInstance::new("Parent").with_field("child", Value::RefObject(leaf.hash)))
            .unwrap();

        let (a_io, b_io) = duplex(1 << 16);
        let conn_a = Connection::spawn(a_io);
        let conn_b = Connection::spawn(b_io);

        let want = vec![parent.hash];
        let a = tokio::spawn(async move { run(&conn_a, &store_a, allow_all(), Vec::new(), Duration::from_secs(2)).await });
        let b = tokio::spawn(async move { run(&conn_b, &store_b, allow_all(), want, Duration::from_secs(2)).await });

        let received_by_b = b.await.unwrap().unwrap();
        let received_by_a = a.await.unwrap().unwrap();

        assert!(received_by_b.contains(&leaf.hash));
        assert!(received_by_b.contains(&parent.hash));
        assert!(received_by_a.is_empty());

        let dir_b_check = Store::open(opts(dir_b.path())).unwrap();
        assert!(dir_b_check.objects().blobs().exists(leaf.hash.0));
        assert!(dir_b_check.objects().blobs().exists(parent.hash.0));
    }
}
