//! Trust graph (spec §4.7, C7)
//!
//! Resolves whether a given signing key is transitively trusted, starting from
//! a set of root keys (the local device's own complete keypairs) and walking
//! certificates attached to Person profiles. The DFS is memoized per key and
//! guarded against cycles, the way `is_trusted` is specified: a cycle means
//! "not trusted", not an error.
//!
//! `keys_of` (spec §4.7 "keys for a person") and the certificate verification
//! step both touch the object store, so this module also owns the `Keys`
//! recipe (the reverse-index-enabled type a person's public keys are recorded
//! under).

use crate::crypto;
use crate::error::Result;
use crate::hash::IdHash;
use crate::object::Value;
use crate::object_store::ObjectStore;
use crate::recipe::{Discipline, FieldRule, PrimitiveKind, Recipe, ReferenceKind, RuleKind};
use crate::reverse_index::TargetKind;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// `Keys{person, signKeys}`: every version ever stored is reverse-indexed
/// against `person`'s id-hash (spec §4.7 "each profile enumerates keys in
/// SignKey descriptions"; `Keys` is the type spec §4.9's person-and-key
/// exchange sends as "their default Keys object", and is already a
/// [`crate::reverse_index::CORE_ENABLED_TYPES`] entry).
pub fn built_in_recipes() -> Vec<Recipe> {
    vec![Recipe::new(
        "Keys",
        Discipline::Versioned,
        vec![
            FieldRule::new("person", RuleKind::Reference(ReferenceKind::Id)).identifying(),
            FieldRule::new("signKeys", RuleKind::Set(Box::new(RuleKind::Primitive(PrimitiveKind::Bytes)))),
        ],
    )]
}

/// `keys_of(person) = ⋃ keys in any Keys object referencing person` (spec
/// §4.7). Walks every `Keys` version the reverse index has ever recorded
/// against `person`'s id-hash, not just the latest, so a revoked-then-rotated
/// key a certificate still references can be found.
pub fn keys_of(objects: &ObjectStore, person: IdHash) -> Result<Vec<[u8; 32]>> {
    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    for hash in objects.referencing(person.0, TargetKind::Id, "Keys")? {
        let obj = objects.get(hash, Some("Keys"))?;
        let Some(Value::Set(items)) = obj.field("signKeys") else { continue };
        for item in items {
            if let Value::Bytes(bytes) = item {
                if let Ok(key) = <[u8; 32]>::try_from(bytes.as_slice()) {
                    if seen.insert(key) {
                        keys.push(key);
                    }
                }
            }
        }
    }
    Ok(keys)
}

/// Which local identities count as trust roots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootMode {
    /// Only the main identity's keys are roots.
    MainId,
    /// Every local identity's keys are roots.
    All,
}

/// A certificate attached to a profile, carrying a signature from some issuer
/// key. `TrustKeysCertificate` requires the issuer to hold
/// `RightToDeclareTrustedKeysForEverybody`; `AffirmationCertificate` requires
/// `RightToDeclareTrustedKeysForSelf` (spec §4.7 step 5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertificateKind {
    TrustKeysCertificate,
    AffirmationCertificate,
}

/// One certificate on a profile: which key it targets, the raw bytes the
/// issuer signed plus the detached signature over them, and which of the
/// target's known issuer candidates actually produced that signature is
/// resolved during trust derivation (spec §4.7 step 3: "identify the *used*
/// key `u` by verifying the signature"), not asserted by the caller.
#[derive(Clone, Debug)]
pub struct Certificate {
    pub target_key: KeyId,
    /// Every key `keys_of(issuer)` returned at the time this certificate was
    /// recorded, paired with the [`KeyId`] each was interned under.
    pub candidate_issuer_keys: Vec<(KeyId, [u8; 32])>,
    pub signed_bytes: Vec<u8>,
    pub signature: [u8; 64],
    pub kind: CertificateKind,
}

/// Issuer rights, scanned from certificates on the issuer's own Person object
/// signed by a root key (spec §4.7 step 4).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IssuerRights {
    pub can_declare_for_everybody: bool,
    pub can_declare_for_self: bool,
}

/// Opaque key identifiers are represented as `u64` here; the caller (the
/// object-store layer) is responsible for mapping real Ed25519 public keys to
/// stable integer handles before building the graph, the same way a
/// `[u8; 32]` peer id gets interned in the net layer.
pub type KeyId = u64;

/// All the graph-shaped data `is_trusted` needs: which certificates exist per
/// target key, and each issuer key's rights.
pub struct TrustGraph {
    root_mode: RootMode,
    root_keys: HashSet<KeyId>,
    certs_by_target: HashMap<KeyId, Vec<Certificate>>,
    rights_by_issuer: HashMap<KeyId, IssuerRights>,
    memo: RwLock<HashMap<KeyId, bool>>,
}

impl TrustGraph {
    /// `root_keys` should be just the main identity's keys under
    /// [`RootMode::MainId`], or every local identity's keys under
    /// [`RootMode::All`] — the caller decides which set to pass in based on
    /// `mode`; `TrustGraph` itself only remembers `mode` for introspection.
    pub fn new(root_keys: impl IntoIterator<Item = KeyId>, mode: RootMode) -> Self {
        Self {
            root_mode: mode,
            root_keys: root_keys.into_iter().collect(),
            certs_by_target: HashMap::new(),
            rights_by_issuer: HashMap::new(),
            memo: RwLock::new(HashMap::new()),
        }
    }

    pub fn root_mode(&self) -> RootMode {
        self.root_mode
    }

    /// Add another key to the root set, e.g. when [`RootMode::All`] picks up a
    /// newly paired local identity.
    pub fn add_root_key(&mut self, key: KeyId) {
        self.root_keys.insert(key);
        self.invalidate_cache();
    }

    pub fn add_certificate(&mut self, cert: Certificate) {
        self.certs_by_target.entry(cert.target_key).or_default().push(cert);
        self.invalidate_cache();
    }

    pub fn set_issuer_rights(&mut self, issuer: KeyId, rights: IssuerRights) {
        self.rights_by_issuer.insert(issuer, rights);
        self.invalidate_cache();
    }

    /// Cache is invalidated whenever a new profile, key, or certificate
    /// version appears for any tracked person (spec §4.7).
    pub fn invalidate_cache(&mut self) {
        self.memo.write().clear();
    }

    /// `is_trusted(k)`: memoized DFS per spec §4.7 steps 1-6.
    pub fn is_trusted(&self, key: KeyId) -> bool {
        let mut stack = HashSet::new();
        self.is_trusted_inner(key, &mut stack)
    }

    fn is_trusted_inner(&self, key: KeyId, stack: &mut HashSet<KeyId>) -> bool {
        if self.root_keys.contains(&key) {
            return true;
        }
        if let Some(cached) = self.memo.read().get(&key).copied() {
            return cached;
        }
        if !stack.insert(key) {
            // cycle: treat as not trusted, don't cache (a different entry point
            // into the same cycle might still resolve it via a root).
            return false;
        }

        let trusted = self
            .certs_by_target
            .get(&key)
            .into_iter()
            .flatten()
            .any(|cert| self.certificate_grants_trust(cert, stack));

        stack.remove(&key);
        self.memo.write().insert(key, trusted);
        trusted
    }

    /// Identify the candidate key that actually produced `cert.signature`
    /// (spec §4.7 step 3), then check that key's rights grant this
    /// certificate's kind, and that the used key is itself trusted.
    fn certificate_grants_trust(&self, cert: &Certificate, stack: &mut HashSet<KeyId>) -> bool {
        let Some(&(used_key, _)) = cert
            .candidate_issuer_keys
            .iter()
            .find(|(_, public)| crypto::verify(&cert.signed_bytes, &cert.signature, public))
        else {
            return false;
        };

        let rights = self.rights_by_issuer.get(&used_key).copied().unwrap_or_default();
        let grants = match cert.kind {
            CertificateKind::TrustKeysCertificate => rights.can_declare_for_everybody,
            CertificateKind::AffirmationCertificate => rights.can_declare_for_self,
        };
        grants && self.is_trusted_inner(used_key, stack)
    }
}
