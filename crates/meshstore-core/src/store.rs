//! Top-level instance (spec §6 "Configuration", §6 "Exit of long-running tools")
//!
//! Wires C1 (crypto/keystore) through C7 (trust graph) into one handle:
//! `Store::open` reads or creates the local keystore, builds the recipe and
//! reverse-index registries from [`InstanceOptions`], and opens the blob
//! store at `directory`. Every store-facing call first checks
//! [`Error::ShutdownInProgress`] the way a request arriving after
//! `gossipd`'s SIGINT handler fires would be rejected.

use crate::blob_store::BlobStore;
use crate::channel::{self, ChannelIterator, ChannelQuery};
use crate::config::InstanceOptions;
use crate::crypto;
use crate::error::{Error, Result};
use crate::events::EventHub;
use crate::hash::{IdHash, ObjectHash};
use crate::object::ObjectInstance;
use crate::object_store::{ObjectStore, UnversionedStoreResult, VersionedStoreResult};
use crate::recipe::RecipeRegistry;
use crate::reverse_index::{PropertyFilter, ReverseIndexRegistry};
use crate::trust::{KeyId, RootMode, TrustGraph};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const KEYSTORE_FILE: &str = "keystore";
const KEYSTORE_SALT_LEN: usize = 16;

/// The local instance's own keypairs (spec §4.1), persisted at rest.
#[derive(Clone, Serialize, Deserialize)]
pub struct Keystore {
    pub box_public: [u8; crypto::BOX_PUBLIC_LEN],
    pub box_secret: [u8; crypto::BOX_SECRET_LEN],
    pub sign_public: [u8; crypto::SIGN_PUBLIC_LEN],
    pub sign_secret: [u8; crypto::SIGN_SECRET_LEN],
}

impl Keystore {
    fn generate() -> Self {
        let (box_public, box_secret) = crypto::new_box_keypair();
        let (sign_public, sign_secret) = crypto::new_sign_keypair();
        Self { box_public, box_secret, sign_public, sign_secret }
    }

    fn load_or_create(blobs: &BlobStore, config: &InstanceOptions) -> Result<Self> {
        let existing = blobs.read_aux(KEYSTORE_FILE)?;
        if existing.is_empty() {
            let fresh = Self::generate();
            fresh.persist(blobs, config)?;
            return Ok(fresh);
        }
        Self::decode(&existing, config)
    }

    fn persist(&self, blobs: &BlobStore, config: &InstanceOptions) -> Result<()> {
        let plain = serde_json::to_vec(self)?;
        let bytes = if config.encrypt_storage {
            let secret = config
                .secret
                .as_deref()
                .ok_or_else(|| Error::MalformedKey("encrypt_storage requires a secret".into()))?;
            let mut salt = vec![0u8; KEYSTORE_SALT_LEN];
            salt.copy_from_slice(&crypto::random_nonce()[..KEYSTORE_SALT_LEN]);
            let key = crypto::derive_symmetric_from_secret(secret.as_bytes(), &salt)?;
            let encrypted = crypto::symmetric_encrypt_embed_nonce(&plain, &key, None)?;
            let mut out = salt;
            out.extend_from_slice(&encrypted);
            out
        } else {
            plain
        };
        blobs.replace_aux(KEYSTORE_FILE, &bytes)
    }

    fn decode(bytes: &[u8], config: &InstanceOptions) -> Result<Self> {
        let plain = if config.encrypt_storage {
            let secret = config
                .secret
                .as_deref()
                .ok_or_else(|| Error::MalformedKey("encrypt_storage requires a secret".into()))?;
            if bytes.len() < KEYSTORE_SALT_LEN {
                return Err(Error::MalformedSalt("keystore file shorter than salt prefix".into()));
            }
            let (salt, rest) = bytes.split_at(KEYSTORE_SALT_LEN);
            let key = crypto::derive_symmetric_from_secret(secret.as_bytes(), salt)?;
            crypto::symmetric_decrypt_embed_nonce(rest, &key)?
        } else {
            bytes.to_vec()
        };
        Ok(serde_json::from_slice(&plain)?)
    }
}

/// Maps raw 32-byte Ed25519 public keys to the opaque [`KeyId`] handles
/// [`TrustGraph`] works with.
#[derive(Default)]
struct KeyInterner {
    ids: HashMap<[u8; 32], KeyId>,
    next: KeyId,
}

impl KeyInterner {
    fn intern(&mut self, key: [u8; 32]) -> KeyId {
        if let Some(&id) = self.ids.get(&key) {
            return id;
        }
        let id = self.next;
        self.next += 1;
        self.ids.insert(key, id);
        id
    }

    fn public_key(&self, id: KeyId) -> Option<[u8; 32]> {
        self.ids.iter().find(|(_, &v)| v == id).map(|(&k, _)| k)
    }
}

/// Wires C1-C7 into one handle an application embeds. C8/C9 (connection core,
/// relay/pairing) build on top of this rather than inside it.
pub struct Store {
    config: InstanceOptions,
    objects: ObjectStore,
    keystore: Keystore,
    keys: RwLock<KeyInterner>,
    trust: RwLock<TrustGraph>,
    shutting_down: AtomicBool,
}

impl Store {
    /// Open (creating if absent) the instance described by `config`. Only the
    /// local identity counts as a trust root ([`RootMode::MainId`]); call
    /// [`Store::trust_mut`] to add certificates as they're synced in.
    pub fn open(config: InstanceOptions) -> Result<Self> {
        config.validate().map_err(|e| Error::RecipeRuleViolation(e.to_string()))?;

        let blobs = BlobStore::open(&config.directory)?;
        let keystore = Keystore::load_or_create(&blobs, &config)?;

        let mut recipes = RecipeRegistry::new();
        for recipe in channel::built_in_recipes() {
            recipes.register(recipe);
        }
        for recipe in crate::trust::built_in_recipes() {
            recipes.register(recipe);
        }
        for recipe in config.initial_recipes.clone() {
            recipes.register(recipe);
        }

        let mut reverse = ReverseIndexRegistry::new();
        for type_name in &config.initially_enabled_reverse_map_types {
            reverse.enable(type_name.clone(), PropertyFilter::All)?;
        }
        for type_name in &config.initially_enabled_reverse_map_types_for_id_objects {
            reverse.enable(type_name.clone(), PropertyFilter::All)?;
        }

        let mut keys = KeyInterner::default();
        let own_key_id = keys.intern(keystore.sign_public);
        let trust = TrustGraph::new([own_key_id], RootMode::MainId);

        let objects = ObjectStore::new(blobs, recipes, reverse, EventHub::default());

        Ok(Self {
            config,
            objects,
            keystore,
            keys: RwLock::new(keys),
            trust: RwLock::new(trust),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &InstanceOptions {
        &self.config
    }

    pub fn keystore(&self) -> &Keystore {
        &self.keystore
    }

    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    /// Resolve the [`KeyId`] for a raw Ed25519 public key, interning it if new.
    pub fn intern_key(&self, public: [u8; 32]) -> KeyId {
        self.keys.write().intern(public)
    }

    /// Inverse of [`Store::intern_key`]: the raw public key an interned
    /// [`KeyId`] stands for, if it has been interned locally.
    pub fn public_key(&self, id: KeyId) -> Option<[u8; 32]> {
        self.keys.read().public_key(id)
    }

    pub fn is_trusted(&self, key: KeyId) -> bool {
        self.trust.read().is_trusted(key)
    }

    /// `keys_of(person)` (spec §4.7), resolved against this instance's object
    /// store.
    pub fn keys_of(&self, person: IdHash) -> Result<Vec<[u8; 32]>> {
        crate::trust::keys_of(&self.objects, person)
    }

    /// Mutable access to the trust graph, e.g. to add certificates observed
    /// during sync.
    pub fn trust_mut(&self) -> parking_lot::RwLockWriteGuard<'_, TrustGraph> {
        self.trust.write()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShutdownInProgress);
        }
        Ok(())
    }

    pub fn store_unversioned(&self, obj: ObjectInstance) -> Result<UnversionedStoreResult> {
        self.ensure_running()?;
        self.objects.store_unversioned(obj)
    }

    pub fn store_versioned(&self, obj: ObjectInstance, now: u64) -> Result<VersionedStoreResult> {
        self.ensure_running()?;
        self.objects.store_versioned(obj, now)
    }

    pub fn get(&self, hash: ObjectHash, expect_type: Option<&str>) -> Result<ObjectInstance> {
        self.ensure_running()?;
        self.objects.get(hash, expect_type)
    }

    pub fn get_by_id(&self, id_hash: IdHash) -> Result<Option<ObjectInstance>> {
        self.ensure_running()?;
        self.objects.get_by_id(id_hash)
    }

    /// Append to a channel at the current wall-clock time (spec §4.6).
    pub fn channel_append(&self, channel_id: &str, owner: Option<IdHash>, payload: ObjectInstance) -> Result<ObjectHash> {
        self.ensure_running()?;
        let now = now_unix();
        channel::append(&self.objects, channel_id, owner, payload, now as i64, now)
    }

    pub fn channel_iter(&self, channel_id: &str, owner: Option<IdHash>, query: ChannelQuery) -> Result<ChannelIterator<'_>> {
        self.ensure_running()?;
        ChannelIterator::new(&self.objects, channel_id, owner, query)
    }

    /// Begin a graceful shutdown: subsequent calls fail with
    /// [`Error::ShutdownInProgress`]. Version-map and reverse-index writes are
    /// already synchronous full-file replacements (spec §4.4/§4.5), so there is
    /// nothing buffered left to flush; this only gates new work, the way
    /// SIGINT in a long-running tool stops accepting requests before it exits.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Value;
    use crate::recipe::{Discipline, FieldRule, PrimitiveKind, Recipe, RuleKind};

    fn config(dir: &std::path::Path) -> InstanceOptions {
        let mut opts = InstanceOptions::new("alice-laptop", "alice@example.com", dir);
        opts.initial_recipes.push(Recipe::new(
            "BodyTemperature",
            Discipline::Unversioned,
            vec![FieldRule::new("temperature", RuleKind::Primitive(PrimitiveKind::Integer))],
        ));
        opts
    }

    #[test]
    fn open_generates_and_persists_a_keystore() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(config(dir.path())).unwrap();
        let first_public = store.keystore().sign_public;

        drop(store);
        let reopened = Store::open(config(dir.path())).unwrap();
        assert_eq!(reopened.keystore().sign_public, first_public);
    }

    #[test]
    fn own_identity_is_a_trust_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(config(dir.path())).unwrap();
        let own_id = store.intern_key(store.keystore().sign_public);
        assert!(store.is_trusted(own_id));
    }

    #[test]
    fn shutdown_rejects_further_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(config(dir.path())).unwrap();
        store.shutdown();

        let obj = ObjectInstance::new("BodyTemperature").with_field("temperature", Value::Integer(37));
        assert!(matches!(store.store_unversioned(obj), Err(Error::ShutdownInProgress)));
    }

    #[test]
    fn encrypted_keystore_round_trips_with_secret() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = config(dir.path());
        opts.encrypt_storage = true;
        opts.secret = Some("hunter2".to_string());

        let store = Store::open(opts.clone()).unwrap();
        let first_public = store.keystore().sign_public;
        drop(store);

        let reopened = Store::open(opts).unwrap();
        assert_eq!(reopened.keystore().sign_public, first_public);
    }
}
