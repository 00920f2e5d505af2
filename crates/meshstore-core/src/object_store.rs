//! Object store (spec §4.4, C4)
//!
//! Sits on top of the blob store (C3) and canonical serializer (C2): stores
//! structured objects, distinguishes unversioned from versioned recipes, and
//! maintains id-hashes and version maps. Every write also triggers C5 reverse
//! index maintenance and a C6-consumed [`StoreEvent`].

use crate::blob_store::{BlobStore, PutStatus};
use crate::canonical;
use crate::error::{Error, Result};
use crate::events::{EventHub, StoreEvent};
use crate::hash::{IdHash, ObjectHash};
use crate::object::ObjectInstance;
use crate::recipe::{Discipline, Recipe, RecipeRegistry, ReferenceKind, RuleKind};
use crate::reverse_index::{self, ReverseIndexRegistry, TargetKind};
use crate::version_map::{self, VersionEntry};

/// Outcome of storing an unversioned object.
#[derive(Clone, Debug)]
pub struct UnversionedStoreResult {
    pub obj: ObjectInstance,
    pub hash: ObjectHash,
    pub status: PutStatus,
}

/// Outcome of storing a versioned object.
#[derive(Clone, Debug)]
pub struct VersionedStoreResult {
    pub obj: ObjectInstance,
    pub hash: ObjectHash,
    pub id_hash: IdHash,
    pub timestamp: u64,
}

/// Wires C2-C5 together: canonical serializer, blob store, version maps,
/// reverse-index maintenance, and the event hub objects flow through on write.
pub struct ObjectStore {
    blobs: BlobStore,
    recipes: RecipeRegistry,
    reverse: ReverseIndexRegistry,
    events: EventHub,
}

impl ObjectStore {
    pub fn new(blobs: BlobStore, recipes: RecipeRegistry, reverse: ReverseIndexRegistry, events: EventHub) -> Self {
        Self { blobs, recipes, reverse, events }
    }

    pub fn recipes(&self) -> &RecipeRegistry {
        &self.recipes
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Escape hatch for callers (the top-level `Store`) that need to persist
    /// auxiliary, non-content-addressed files (the local keystore) alongside
    /// the object store's blobs.
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Every parent (of `referencing_type`) the reverse index has recorded as
    /// pointing at `target` (spec §4.5, C5). `keys_of` (spec §4.7) is the
    /// reason this needs to be public: C7 has to read back the reverse index
    /// C5 maintains, rather than walking it from inside this module.
    pub fn referencing(&self, target: crate::hash::Hash, kind: TargetKind, referencing_type: &str) -> Result<Vec<ObjectHash>> {
        reverse_index::referencing(&self.blobs, target, kind, referencing_type)
    }

    /// Store an object of an unversioned type (spec §4.4 "Store unversioned object").
    pub fn store_unversioned(&self, obj: ObjectInstance) -> Result<UnversionedStoreResult> {
        let recipe = self.recipes.get(&obj.type_name)?;
        if recipe.discipline != Discipline::Unversioned {
            return Err(Error::RecipeRuleViolation(format!(
                "{} is a versioned recipe; use store_versioned",
                recipe.name
            )));
        }

        let bytes = canonical::canonical_bytes(&obj, &self.recipes)?;
        let put = self.blobs.put(&bytes)?;
        let hash = ObjectHash::new(put.hash);

        if put.status == PutStatus::New {
            self.update_reverse_index(&obj, recipe, hash)?;
        }

        self.events.publish(StoreEvent::UnversionedObjectStored(hash));
        Ok(UnversionedStoreResult { obj, hash, status: put.status })
    }

    /// Store an object of a versioned type (spec §4.4 "Store versioned object").
    pub fn store_versioned(&self, obj: ObjectInstance, now: u64) -> Result<VersionedStoreResult> {
        let recipe = self.recipes.get(&obj.type_name)?.clone();
        if recipe.discipline != Discipline::Versioned {
            return Err(Error::RecipeRuleViolation(format!(
                "{} is an unversioned recipe; use store_unversioned",
                recipe.name
            )));
        }

        let bytes = canonical::canonical_bytes(&obj, &self.recipes)?;
        let put = self.blobs.put(&bytes)?;
        let hash = ObjectHash::new(put.hash);
        let id_hash = IdHash::new(canonical::id_hash(&obj, &self.recipes)?);

        let timestamp = version_map::next_timestamp(&self.blobs, id_hash, now)?;

        // VersionNode: the metadata object materializing this entry, linking to the
        // stored version's hash. Stored unversioned like any other object.
        let version_node = ObjectInstance::new("VersionNode")
            .with_field("idHash", crate::object::Value::RefId(id_hash))
            .with_field("hash", crate::object::Value::RefObject(hash))
            .with_field("timestamp", crate::object::Value::Integer(timestamp as i64));
        let node_bytes = canonical::canonical_bytes(&version_node, &self.recipes)?;
        let node_put = self.blobs.put(&node_bytes)?;
        let metadata_hash = ObjectHash::new(node_put.hash);

        version_map::append(&self.blobs, id_hash, VersionEntry { timestamp, data_hash: hash, metadata_hash })?;

        if put.status == PutStatus::New {
            self.update_reverse_index(&obj, &recipe, hash)?;
        }

        self.events.publish(StoreEvent::VersionedObjectStored { id_hash, hash, timestamp });
        Ok(VersionedStoreResult { obj, hash, id_hash, timestamp })
    }

    /// Store only the identifying subset of a versioned object (spec §4.4
    /// "Store id-object"): used when only the logical entity, not a specific
    /// version, needs to be addressable.
    pub fn store_id_object(&self, obj: &ObjectInstance) -> Result<IdHash> {
        let recipe = self.recipes.get(&obj.type_name)?;
        let id_hash = IdHash::new(canonical::id_hash(obj, &self.recipes)?);
        let projected = obj.project_identifying(recipe);
        let bytes = canonical::canonical_bytes(&projected, &self.recipes)?;
        self.blobs.put(&bytes)?;
        Ok(id_hash)
    }

    /// `get(h)`: parsed object from the blob store. `expect_type`, if given,
    /// fails *WrongType* on a mismatch. Up-converts legacy alias type names per
    /// spec §4.4: a recipe name recognized only as an alias decodes under its
    /// canonical recipe, so the returned object already carries any defaulted
    /// fields the canonical recipe adds; the on-disk bytes are untouched.
    pub fn get(&self, hash: ObjectHash, expect_type: Option<&str>) -> Result<ObjectInstance> {
        let bytes = self.blobs.get(hash.0)?;
        let obj = canonical::decode(&bytes, &self.recipes)?;
        if let Some(expected) = expect_type {
            if obj.type_name != expected {
                return Err(Error::WrongType { expected: expected.to_string(), found: obj.type_name.clone() });
            }
        }
        Ok(obj)
    }

    /// `get_by_id(id_h)`: the latest version, per spec §3 ("latest" = max
    /// timestamp, ties broken by lexicographic ObjectHash).
    pub fn get_by_id(&self, id_hash: IdHash) -> Result<Option<ObjectInstance>> {
        match version_map::latest(&self.blobs, id_hash)? {
            Some(entry) => Ok(Some(self.get(entry.data_hash, None)?)),
            None => Ok(None),
        }
    }

    /// CRDT merge of a remote replica's version-map entries for `id_hash`.
    pub fn merge_version_map(&self, id_hash: IdHash, remote: &[VersionEntry]) -> Result<()> {
        version_map::merge(&self.blobs, id_hash, remote)
    }

    fn update_reverse_index(&self, obj: &ObjectInstance, recipe: &Recipe, parent_hash: ObjectHash) -> Result<()> {
        for rule in &recipe.fields {
            let Some(value) = obj.field(&rule.name) else { continue };
            self.record_field_references(&rule.rule, value, &recipe.name, parent_hash)?;
        }
        Ok(())
    }

    fn record_field_references(
        &self,
        rule: &RuleKind,
        value: &crate::object::Value,
        referencing_type: &str,
        parent_hash: ObjectHash,
    ) -> Result<()> {
        use crate::object::Value;
        let _ = rule;
        match value {
            Value::RefObject(h) | Value::RefBlob(h) | Value::RefClob(h) => {
                reverse_index::record_reference(&self.blobs, &self.reverse, h.0, TargetKind::Object, referencing_type, parent_hash)?;
            }
            Value::RefId(h) => {
                reverse_index::record_reference(&self.blobs, &self.reverse, h.0, TargetKind::Id, referencing_type, parent_hash)?;
            }
            Value::List(items) | Value::Bag(items) | Value::Set(items) => {
                let inner = match rule {
                    RuleKind::OrderedList(inner) | RuleKind::Bag(inner) | RuleKind::Set(inner) => inner.as_ref(),
                    _ => return Ok(()),
                };
                for item in items {
                    self.record_field_references(inner, item, referencing_type, parent_hash)?;
                }
            }
            Value::Mapping(pairs) => {
                let (key_rule, val_rule) = match rule {
                    RuleKind::Mapping(key_rule, val_rule) => (key_rule.as_ref(), val_rule.as_ref()),
                    _ => return Ok(()),
                };
                for (k, v) in pairs {
                    self.record_field_references(key_rule, k, referencing_type, parent_hash)?;
                    self.record_field_references(val_rule, v, referencing_type, parent_hash)?;
                }
            }
            Value::Object(inner) => {
                let nested_recipe = self.recipes.get(&inner.type_name)?.clone();
                for nested_rule in &nested_recipe.fields {
                    let Some(nested_value) = inner.field(&nested_rule.name) else { continue };
                    self.record_field_references(&nested_rule.rule, nested_value, referencing_type, parent_hash)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Value;
    use crate::recipe::{Discipline, FieldRule, PrimitiveKind};

    fn registry() -> RecipeRegistry {
        let mut reg = RecipeRegistry::new();
        reg.register(Recipe::new(
            "BodyTemperature",
            Discipline::Unversioned,
            vec![FieldRule::new("temperature", RuleKind::Primitive(PrimitiveKind::Integer))],
        ));
        reg.register(Recipe::new(
            "Profile",
            Discipline::Versioned,
            vec![
                FieldRule::new("personId", RuleKind::Primitive(PrimitiveKind::String)).identifying(),
                FieldRule::new("nickname", RuleKind::Primitive(PrimitiveKind::String)),
            ],
        ));
        reg.register(Recipe::new(
            "VersionNode",
            Discipline::Unversioned,
            vec![
                FieldRule::new("idHash", RuleKind::Reference(ReferenceKind::Id)),
                FieldRule::new("hash", RuleKind::Reference(ReferenceKind::Object)),
                FieldRule::new("timestamp", RuleKind::Primitive(PrimitiveKind::Integer)),
            ],
        ));
        reg
    }

    fn new_store() -> (ObjectStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::open(dir.path()).unwrap();
        let store = ObjectStore::new(blobs, registry(), ReverseIndexRegistry::new(), EventHub::default());
        (store, dir)
    }

    #[test]
    fn store_unversioned_is_idempotent_and_retrievable() {
        let (store, _dir) = new_store();
        let obj = ObjectInstance::new("BodyTemperature").with_field("temperature", Value::Integer(37));

        let first = store.store_unversioned(obj.clone()).unwrap();
        assert_eq!(first.status, PutStatus::New);

        let second = store.store_unversioned(obj).unwrap();
        assert_eq!(second.status, PutStatus::Exists);
        assert_eq!(first.hash, second.hash);

        let fetched = store.get(first.hash, Some("BodyTemperature")).unwrap();
        assert_eq!(fetched.type_name, "BodyTemperature");
    }

    #[test]
    fn store_versioned_tracks_latest_by_id_hash() {
        let (store, _dir) = new_store();
        let v1 = ObjectInstance::new("Profile")
            .with_field("personId", Value::String("p1".into()))
            .with_field("nickname", Value::String("alice".into()));
        let r1 = store.store_versioned(v1, 100).unwrap();

        let v2 = ObjectInstance::new("Profile")
            .with_field("personId", Value::String("p1".into()))
            .with_field("nickname", Value::String("ally".into()));
        let r2 = store.store_versioned(v2, 200).unwrap();

        assert_eq!(r1.id_hash, r2.id_hash);
        let latest = store.get_by_id(r1.id_hash).unwrap().unwrap();
        assert_eq!(latest.type_name, "Profile");

        let entries = version_map::read_all(&store.blobs, r1.id_hash).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn wrong_type_request_is_rejected() {
        let (store, _dir) = new_store();
        let obj = ObjectInstance::new("BodyTemperature").with_field("temperature", Value::Integer(37));
        let result = store.store_unversioned(obj).unwrap();

        assert!(matches!(store.get(result.hash, Some("Profile")), Err(Error::WrongType { .. })));
    }

    #[test]
    fn storing_to_the_wrong_discipline_is_rejected() {
        let (store, _dir) = new_store();
        let obj = ObjectInstance::new("Profile")
            .with_field("personId", Value::String("p1".into()))
            .with_field("nickname", Value::String("a".into()));
        assert!(store.store_unversioned(obj).is_err());
    }
}
