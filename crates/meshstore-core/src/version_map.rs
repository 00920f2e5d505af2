//! Version maps (spec §4.4, §6, C4)
//!
//! Per-IdHash append-only list of `(timestamp, ObjectHash)` entries, one file
//! per IdHash under `<dir>/versions/<id-hash-hex>`. Each record is a fixed
//! 146-byte line: 16-digit zero-padded timestamp, `.`, 64-hex data hash, `.`,
//! 64-hex metadata hash (spec §6) — no separator between records, so "last
//! entry" is `seek(size - 146)` and the whole file is `size / 146` records.
//!
//! Every mutation rewrites the file atomically via [`crate::blob_store::BlobStore::replace_aux`]
//! rather than appending in place (spec §4.4: "each append is an atomic
//! replacement of the per-id-hash file"), which also lets merge/elide-duplicate
//! keep the file sorted so the seek-based last-entry read stays correct even
//! after a CRDT merge reorders arrivals.

use crate::blob_store::BlobStore;
use crate::error::{Error, Result};
use crate::hash::{Hash, IdHash, ObjectHash};

pub const RECORD_LEN: usize = 146;
const TIMESTAMP_LEN: usize = 16;
const HASH_HEX_LEN: usize = 64;

/// One entry in a version map: a point in time plus the data it pointed to.
/// `metadata_hash` is the hash of the VersionNode object materializing this
/// entry (spec §4.4 step (e)).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionEntry {
    pub timestamp: u64,
    pub data_hash: ObjectHash,
    pub metadata_hash: ObjectHash,
}

impl VersionEntry {
    fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        let ts = format!("{:016}", self.timestamp);
        out[0..TIMESTAMP_LEN].copy_from_slice(ts.as_bytes());
        out[TIMESTAMP_LEN] = b'.';
        out[TIMESTAMP_LEN + 1..TIMESTAMP_LEN + 1 + HASH_HEX_LEN]
            .copy_from_slice(self.data_hash.to_hex().as_bytes());
        let dot2 = TIMESTAMP_LEN + 1 + HASH_HEX_LEN;
        out[dot2] = b'.';
        out[dot2 + 1..dot2 + 1 + HASH_HEX_LEN].copy_from_slice(self.metadata_hash.to_hex().as_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != RECORD_LEN {
            return Err(Error::MalformedHash(format!(
                "version-map record must be {RECORD_LEN} bytes, found {}",
                bytes.len()
            )));
        }
        let text = std::str::from_utf8(bytes).map_err(|e| Error::MalformedHash(e.to_string()))?;
        let ts_str = &text[0..TIMESTAMP_LEN];
        if text.as_bytes()[TIMESTAMP_LEN] != b'.' {
            return Err(Error::MalformedHash("missing separator after timestamp".into()));
        }
        let data_str = &text[TIMESTAMP_LEN + 1..TIMESTAMP_LEN + 1 + HASH_HEX_LEN];
        let dot2 = TIMESTAMP_LEN + 1 + HASH_HEX_LEN;
        if text.as_bytes()[dot2] != b'.' {
            return Err(Error::MalformedHash("missing separator after data hash".into()));
        }
        let meta_str = &text[dot2 + 1..dot2 + 1 + HASH_HEX_LEN];

        let timestamp: u64 = ts_str.parse().map_err(|_| Error::MalformedHash(format!("bad timestamp {ts_str}")))?;
        let data_hash = ObjectHash::new(Hash::from_hex(data_str)?);
        let metadata_hash = ObjectHash::new(Hash::from_hex(meta_str)?);
        Ok(VersionEntry { timestamp, data_hash, metadata_hash })
    }
}

fn filename(id: IdHash) -> String {
    format!("versions/{}", id.to_hex())
}

/// Read every entry in ascending `(timestamp, data_hash)` order.
pub fn read_all(store: &BlobStore, id: IdHash) -> Result<Vec<VersionEntry>> {
    let bytes = store.read_aux(&filename(id))?;
    if bytes.len() % RECORD_LEN != 0 {
        return Err(Error::MalformedHash(format!(
            "version-map file for {} has size {} not a multiple of {RECORD_LEN}",
            id, bytes.len()
        )));
    }
    bytes.chunks(RECORD_LEN).map(VersionEntry::decode).collect()
}

/// The latest entry as defined by spec §3: maximum timestamp, ties broken by
/// lexicographic ObjectHash. Since the file is kept sorted ascending on every
/// write, this is simply the last record — `seek(size - RECORD_LEN)` in the
/// literal sense when reading from a real file handle; here `read_all` already
/// did the read, so this just indexes the tail.
pub fn latest(store: &BlobStore, id: IdHash) -> Result<Option<VersionEntry>> {
    Ok(read_all(store, id)?.into_iter().last())
}

fn sort_key(e: &VersionEntry) -> (u64, [u8; 32]) {
    (e.timestamp, (e.data_hash.0).0)
}

/// Append one entry, eliding an exact duplicate. Allocates no timestamp itself;
/// the caller (C4's store-versioned-object operation) is responsible for
/// monotonicity ("never less than the current map head timestamp + 1").
pub fn append(store: &BlobStore, id: IdHash, entry: VersionEntry) -> Result<()> {
    let mut entries = read_all(store, id)?;
    if entries.iter().any(|e| *e == entry) {
        return Ok(());
    }
    entries.push(entry);
    write_sorted(store, id, entries)
}

/// CRDT merge: union of two replicas' entry sets, duplicates elided, no
/// tombstones (spec §4.4 "CRDT semantics for version maps").
pub fn merge(store: &BlobStore, id: IdHash, remote: &[VersionEntry]) -> Result<()> {
    let mut entries = read_all(store, id)?;
    for e in remote {
        if !entries.contains(e) {
            entries.push(*e);
        }
    }
    write_sorted(store, id, entries)
}

fn write_sorted(store: &BlobStore, id: IdHash, mut entries: Vec<VersionEntry>) -> Result<()> {
    entries.sort_by_key(sort_key);
    entries.dedup();
    let mut bytes = Vec::with_capacity(entries.len() * RECORD_LEN);
    for e in &entries {
        bytes.extend_from_slice(&e.encode());
    }
    store.replace_aux(&filename(id), &bytes)
}

/// Allocate the next monotone timestamp for `id`: wall-clock `now`, but never
/// less than the current head timestamp plus one (spec §4.4 step (c)).
pub fn next_timestamp(store: &BlobStore, id: IdHash, now: u64) -> Result<u64> {
    match latest(store, id)? {
        Some(head) if head.timestamp >= now => Ok(head.timestamp + 1),
        _ => Ok(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_id() -> IdHash {
        IdHash::new(Hash::of(b"person-1"))
    }

    fn entry(ts: u64, tag: u8) -> VersionEntry {
        VersionEntry {
            timestamp: ts,
            data_hash: ObjectHash::new(Hash::of(&[tag])),
            metadata_hash: ObjectHash::new(Hash::of(&[tag, tag])),
        }
    }

    #[test]
    fn record_round_trips_through_encode_decode() {
        let e = entry(42, 7);
        let encoded = e.encode();
        assert_eq!(encoded.len(), RECORD_LEN);
        assert_eq!(VersionEntry::decode(&encoded).unwrap(), e);
    }

    #[test]
    fn append_elides_exact_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let id = sample_id();

        append(&store, id, entry(1, 1)).unwrap();
        append(&store, id, entry(1, 1)).unwrap();

        assert_eq!(read_all(&store, id).unwrap().len(), 1);
    }

    #[test]
    fn latest_picks_max_timestamp_tie_broken_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let id = sample_id();

        append(&store, id, entry(5, 1)).unwrap();
        append(&store, id, entry(10, 2)).unwrap();
        append(&store, id, entry(10, 1)).unwrap();

        let head = latest(&store, id).unwrap().unwrap();
        assert_eq!(head.timestamp, 10);
        // tie at timestamp 10 broken by lexicographic data hash
        let other = entry(10, 2).data_hash;
        let lower = entry(10, 1).data_hash;
        let expected = if other.to_hex() > lower.to_hex() { other } else { lower };
        assert_eq!(head.data_hash, expected);
    }

    #[test]
    fn merge_unions_two_replicas_without_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let id = sample_id();

        append(&store, id, entry(1, 1)).unwrap();
        let remote = vec![entry(1, 1), entry(2, 2)];
        merge(&store, id, &remote).unwrap();

        let entries = read_all(&store, id).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(latest(&store, id).unwrap().unwrap().timestamp, 2);
    }

    #[test]
    fn next_timestamp_never_goes_backward() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        let id = sample_id();

        append(&store, id, entry(100, 1)).unwrap();
        assert_eq!(next_timestamp(&store, id, 50).unwrap(), 101);
        assert_eq!(next_timestamp(&store, id, 200).unwrap(), 200);
    }
}
