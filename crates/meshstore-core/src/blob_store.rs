//! Blob store (spec §4.3, C3)
//!
//! A mapping from [`Hash`] to bytes, backed directly by the filesystem: each
//! blob lives at `<dir>/blobs/<hex>`. Storage layout is opaque per spec — any
//! durable mapping suffices so long as writes are atomic against reader
//! observation — so writes go through a temp file plus rename rather than
//! `sled`, since C4/C5 require exact on-disk line formats `sled`'s own encoding
//! would not give us.

use crate::error::{Error, Result};
use crate::hash::Hash;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Whether a `put` created a new blob or found one already present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutStatus {
    New,
    Exists,
}

/// Result of [`BlobStore::put`].
#[derive(Clone, Copy, Debug)]
pub struct PutResult {
    pub hash: Hash,
    pub status: PutStatus,
}

/// Content-addressed blob storage rooted at a directory. `append` serializes
/// writes per filename via a per-name mutex (spec §4.5 sync model), used by the
/// reverse-index maintainer for its `<hash>.Object.<Type>` files.
pub struct BlobStore {
    dir: PathBuf,
    append_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BlobStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, append_locks: Mutex::new(HashMap::new()) })
    }

    fn blob_path(&self, hash: Hash) -> PathBuf {
        self.dir.join(hash.to_hex())
    }

    /// Idempotent: writing the same bytes twice returns `status: Exists` the
    /// second time.
    pub fn put(&self, bytes: &[u8]) -> Result<PutResult> {
        let hash = Hash::of(bytes);
        let path = self.blob_path(hash);
        if path.exists() {
            return Ok(PutResult { hash, status: PutStatus::Exists });
        }
        atomic_write(&path, bytes)?;
        Ok(PutResult { hash, status: PutStatus::New })
    }

    pub fn get(&self, hash: Hash) -> Result<Vec<u8>> {
        fs::read(self.blob_path(hash)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(hash.to_hex())
            } else {
                Error::Io(e)
            }
        })
    }

    pub fn exists(&self, hash: Hash) -> bool {
        self.blob_path(hash).exists()
    }

    fn lock_for(&self, filename: &str) -> Arc<Mutex<()>> {
        self.append_locks
            .lock()
            .entry(filename.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append `bytes` to `filename` under the store's directory, serialized per
    /// filename. Used by C5 for reverse-map files.
    pub fn append(&self, filename: &str, bytes: &[u8]) -> Result<()> {
        let lock = self.lock_for(filename);
        let _guard = lock.lock();
        let path = self.dir.join(filename);
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Read the full contents of `filename`, or an empty vec if it doesn't exist.
    pub fn read_aux(&self, filename: &str) -> Result<Vec<u8>> {
        match fs::read(self.dir.join(filename)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Overwrite `filename` atomically, serialized per filename. Used by C4 for
    /// version-map files, whose "last entry" access depends on every write
    /// being a full atomic replacement (spec §4.4).
    pub fn replace_aux(&self, filename: &str, bytes: &[u8]) -> Result<()> {
        let lock = self.lock_for(filename);
        let _guard = lock.lock();
        atomic_write(&self.dir.join(filename), bytes)
    }

    /// Path to an auxiliary file under the store directory, for callers (like
    /// the version map) that need `seek`-based access rather than a full read.
    pub fn aux_path(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let first = store.put(b"hello").unwrap();
        assert_eq!(first.status, PutStatus::New);

        let second = store.put(b"hello").unwrap();
        assert_eq!(second.status, PutStatus::Exists);
        assert_eq!(first.hash, second.hash);
    }

    #[test]
    fn get_roundtrips_and_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        let result = store.put(b"payload").unwrap();
        assert_eq!(store.get(result.hash).unwrap(), b"payload");
        assert!(store.exists(result.hash));

        let missing = Hash::of(b"never written");
        assert!(matches!(store.get(missing), Err(Error::NotFound(_))));
        assert!(!store.exists(missing));
    }

    #[test]
    fn append_accumulates_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        store.append("reverse.map", b"line-one\n").unwrap();
        store.append("reverse.map", b"line-two\n").unwrap();

        assert_eq!(store.read_aux("reverse.map").unwrap(), b"line-one\nline-two\n");
    }

    #[test]
    fn replace_aux_overwrites_fully() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();

        store.replace_aux("versions.map", b"first").unwrap();
        store.replace_aux("versions.map", b"second").unwrap();

        assert_eq!(store.read_aux("versions.map").unwrap(), b"second");
    }
}
