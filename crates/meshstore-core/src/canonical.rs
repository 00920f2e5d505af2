//! Canonical serializer (spec §4.2, C2)
//!
//! Renders an [`ObjectInstance`] to a deterministic byte form ("microdata" in the
//! source this spec distills; any equivalent deterministic encoding is a valid
//! implementation choice per §4.2). Fields are walked in *recipe-declared* order,
//! never the object's construction order, so `{a:1,b:2}` and `{b:2,a:1}` for the
//! same recipe produce byte-identical output (scenario S6). Hashing an object is
//! `SHA-256(encode(obj))`; the id-hash is `SHA-256(encode(project(obj, identifying)))`.

use crate::error::{Error, Result};
use crate::hash::{Hash, IdHash, ObjectHash};
use crate::object::{ObjectInstance, Value};
use crate::recipe::{PrimitiveKind, Recipe, RecipeRegistry, ReferenceKind, RuleKind};

// Tag bytes for the microdata encoding. Chosen so that no tag value collides with
// another at the same recursion depth; `decode_value` below switches on these.
mod tag {
    pub const ROOT: u8 = b'R';
    pub const STRING: u8 = b'S';
    pub const INTEGER: u8 = b'I';
    pub const FLOAT: u8 = b'F';
    pub const BOOLEAN: u8 = b'B';
    pub const BYTES: u8 = b'b';
    pub const REF_OBJECT: u8 = b'O';
    pub const REF_ID: u8 = b'D';
    pub const REF_BLOB: u8 = b'L';
    pub const REF_CLOB: u8 = b'C';
    pub const LIST: u8 = b'[';
    pub const BAG: u8 = b'G';
    pub const SET: u8 = b'T';
    pub const MAPPING: u8 = b'M';
    pub const NESTED: u8 = b'N';
    pub const ABSENT: u8 = b'A';
}

fn write_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// Reject NaN/+-Infinity and normalize -0.0 to +0.0, per §4.2 ForbiddenValue.
fn normalize_float(v: f64) -> Result<f64> {
    if v.is_nan() || v.is_infinite() {
        return Err(Error::ForbiddenValue(format!("non-finite float: {v}")));
    }
    if v == 0.0 && v.is_sign_negative() {
        return Ok(0.0);
    }
    Ok(v)
}

fn encode_value(value: &Value, rule: &RuleKind, registry: &RecipeRegistry, buf: &mut Vec<u8>) -> Result<()> {
    match (rule, value) {
        (RuleKind::Primitive(PrimitiveKind::String), Value::String(s)) => {
            buf.push(tag::STRING);
            write_len_prefixed(buf, s.as_bytes());
        }
        (RuleKind::Primitive(PrimitiveKind::Integer), Value::Integer(i)) => {
            buf.push(tag::INTEGER);
            buf.extend_from_slice(&i.to_be_bytes());
        }
        (RuleKind::Primitive(PrimitiveKind::Float), Value::Float(f)) => {
            let f = normalize_float(*f)?;
            buf.push(tag::FLOAT);
            buf.extend_from_slice(&f.to_be_bytes());
        }
        (RuleKind::Primitive(PrimitiveKind::Boolean), Value::Boolean(b)) => {
            buf.push(tag::BOOLEAN);
            buf.push(if *b { 1 } else { 0 });
        }
        (RuleKind::Primitive(PrimitiveKind::Bytes), Value::Bytes(b)) => {
            buf.push(tag::BYTES);
            write_len_prefixed(buf, b);
        }
        (RuleKind::Reference(ReferenceKind::Object), Value::RefObject(h)) => {
            buf.push(tag::REF_OBJECT);
            buf.extend_from_slice(h.to_hex().as_bytes());
        }
        (RuleKind::Reference(ReferenceKind::Id), Value::RefId(h)) => {
            buf.push(tag::REF_ID);
            buf.extend_from_slice(h.to_hex().as_bytes());
        }
        (RuleKind::Reference(ReferenceKind::Blob), Value::RefBlob(h)) => {
            buf.push(tag::REF_BLOB);
            buf.extend_from_slice(h.to_hex().as_bytes());
        }
        (RuleKind::Reference(ReferenceKind::Clob), Value::RefClob(h)) => {
            buf.push(tag::REF_CLOB);
            buf.extend_from_slice(h.to_hex().as_bytes());
        }
        (RuleKind::OrderedList(inner), Value::List(items)) => {
            buf.push(tag::LIST);
            buf.extend_from_slice(&(items.len() as u64).to_be_bytes());
            for item in items {
                encode_value(item, inner, registry, buf)?;
            }
        }
        (RuleKind::Bag(inner), Value::Bag(items)) => {
            let mut encoded: Vec<Vec<u8>> = items
                .iter()
                .map(|item| {
                    let mut b = Vec::new();
                    encode_value(item, inner, registry, &mut b).map(|_| b)
                })
                .collect::<Result<_>>()?;
            encoded.sort();
            buf.push(tag::BAG);
            buf.extend_from_slice(&(encoded.len() as u64).to_be_bytes());
            for e in encoded {
                buf.extend_from_slice(&e);
            }
        }
        (RuleKind::Set(inner), Value::Set(items)) => {
            let mut encoded: Vec<Vec<u8>> = items
                .iter()
                .map(|item| {
                    let mut b = Vec::new();
                    encode_value(item, inner, registry, &mut b).map(|_| b)
                })
                .collect::<Result<_>>()?;
            encoded.sort();
            encoded.dedup();
            buf.push(tag::SET);
            buf.extend_from_slice(&(encoded.len() as u64).to_be_bytes());
            for e in encoded {
                buf.extend_from_slice(&e);
            }
        }
        (RuleKind::Mapping(key_rule, val_rule), Value::Mapping(pairs)) => {
            let mut encoded: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(pairs.len());
            for (k, v) in pairs {
                let mut kb = Vec::new();
                encode_value(k, key_rule, registry, &mut kb)?;
                let mut vb = Vec::new();
                encode_value(v, val_rule, registry, &mut vb)?;
                encoded.push((kb, vb));
            }
            encoded.sort_by(|a, b| a.0.cmp(&b.0));
            if encoded.windows(2).any(|w| w[0].0 == w[1].0) {
                return Err(Error::RecipeRuleViolation("duplicate mapping key".into()));
            }
            buf.push(tag::MAPPING);
            buf.extend_from_slice(&(encoded.len() as u64).to_be_bytes());
            for (k, v) in encoded {
                buf.extend_from_slice(&k);
                buf.extend_from_slice(&v);
            }
        }
        (RuleKind::NestedObject(expected_type), Value::Object(inner)) => {
            if &inner.type_name != expected_type {
                return Err(Error::RecipeRuleViolation(format!(
                    "expected nested object of type {expected_type}, found {}",
                    inner.type_name
                )));
            }
            buf.push(tag::NESTED);
            encode_inner(inner, registry, buf)?;
        }
        (rule, value) => {
            return Err(Error::RecipeRuleViolation(format!(
                "value {value:?} does not match rule {rule:?}"
            )))
        }
    }
    Ok(())
}

fn encode_inner(obj: &ObjectInstance, registry: &RecipeRegistry, buf: &mut Vec<u8>) -> Result<()> {
    let recipe = registry.get(&obj.type_name)?;
    write_len_prefixed(buf, recipe.name.as_bytes());
    // Field count of the recipe as it stood when this object was written. A
    // reader resolving this type through a later, wider recipe (alias
    // up-conversion, spec §4.4) uses this count to know where the as-encoded
    // fields end rather than assuming its own recipe's field count.
    buf.extend_from_slice(&(recipe.fields.len() as u64).to_be_bytes());
    for rule in &recipe.fields {
        write_len_prefixed(buf, rule.name.as_bytes());
        match obj.field(&rule.name) {
            Some(value) => encode_value(value, &rule.rule, registry, buf)?,
            None if rule.optional => buf.push(tag::ABSENT),
            None => {
                return Err(Error::RecipeRuleViolation(format!(
                    "missing required field {} on {}",
                    rule.name, recipe.name
                )))
            }
        }
    }
    Ok(())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(Error::RecipeRuleViolation("truncated canonical bytes".into()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn peek_u8(&self) -> Result<u8> {
        self.bytes
            .get(self.pos)
            .copied()
            .ok_or_else(|| Error::RecipeRuleViolation("truncated canonical bytes".into()))
    }

    fn take_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn take_len_prefixed(&mut self) -> Result<Vec<u8>> {
        let len = self.take_u64()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn take_hex_hash(&mut self) -> Result<Hash> {
        let hex = self.take(64)?;
        Hash::from_hex(std::str::from_utf8(hex).map_err(|e| Error::MalformedHash(e.to_string()))?)
    }
}

fn decode_value(cursor: &mut Cursor, rule: &RuleKind, registry: &RecipeRegistry) -> Result<Value> {
    let t = cursor.take_u8()?;
    match (t, rule) {
        (tag::STRING, RuleKind::Primitive(PrimitiveKind::String)) => {
            let bytes = cursor.take_len_prefixed()?;
            Ok(Value::String(String::from_utf8(bytes).map_err(|e| Error::RecipeRuleViolation(e.to_string()))?))
        }
        (tag::INTEGER, RuleKind::Primitive(PrimitiveKind::Integer)) => {
            Ok(Value::Integer(i64::from_be_bytes(cursor.take(8)?.try_into().unwrap())))
        }
        (tag::FLOAT, RuleKind::Primitive(PrimitiveKind::Float)) => {
            Ok(Value::Float(f64::from_be_bytes(cursor.take(8)?.try_into().unwrap())))
        }
        (tag::BOOLEAN, RuleKind::Primitive(PrimitiveKind::Boolean)) => Ok(Value::Boolean(cursor.take_u8()? != 0)),
        (tag::BYTES, RuleKind::Primitive(PrimitiveKind::Bytes)) => Ok(Value::Bytes(cursor.take_len_prefixed()?)),
        (tag::REF_OBJECT, RuleKind::Reference(ReferenceKind::Object)) => Ok(Value::RefObject(ObjectHash::new(cursor.take_hex_hash()?))),
        (tag::REF_ID, RuleKind::Reference(ReferenceKind::Id)) => Ok(Value::RefId(IdHash::new(cursor.take_hex_hash()?))),
        (tag::REF_BLOB, RuleKind::Reference(ReferenceKind::Blob)) => Ok(Value::RefBlob(ObjectHash::new(cursor.take_hex_hash()?))),
        (tag::REF_CLOB, RuleKind::Reference(ReferenceKind::Clob)) => Ok(Value::RefClob(ObjectHash::new(cursor.take_hex_hash()?))),
        (tag::LIST, RuleKind::OrderedList(inner)) => {
            let count = cursor.take_u64()?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(decode_value(cursor, inner, registry)?);
            }
            Ok(Value::List(items))
        }
        (tag::BAG, RuleKind::Bag(inner)) => {
            let count = cursor.take_u64()?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(decode_value(cursor, inner, registry)?);
            }
            Ok(Value::Bag(items))
        }
        (tag::SET, RuleKind::Set(inner)) => {
            let count = cursor.take_u64()?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(decode_value(cursor, inner, registry)?);
            }
            Ok(Value::Set(items))
        }
        (tag::MAPPING, RuleKind::Mapping(key_rule, val_rule)) => {
            let count = cursor.take_u64()?;
            let mut pairs = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let k = decode_value(cursor, key_rule, registry)?;
                let v = decode_value(cursor, val_rule, registry)?;
                pairs.push((k, v));
            }
            Ok(Value::Mapping(pairs))
        }
        (tag::NESTED, RuleKind::NestedObject(expected_type)) => {
            let inner = decode_inner(cursor, registry)?;
            if &inner.type_name != expected_type {
                return Err(Error::RecipeRuleViolation(format!(
                    "expected nested object of type {expected_type}, found {}",
                    inner.type_name
                )));
            }
            Ok(Value::Object(Box::new(inner)))
        }
        (t, rule) => Err(Error::RecipeRuleViolation(format!("tag {t} does not match rule {rule:?}"))),
    }
}

/// Decode the fields actually present on the wire, then default (leave absent)
/// any field the *canonical* recipe declares that the as-encoded bytes don't
/// cover (spec §4.4 "up-conversion"). `recipe` is already resolved through any
/// alias, so it may be wider than the recipe that wrote these bytes; the
/// as-encoded field count (not `recipe.fields.len()`) tells us where the
/// written fields end.
fn decode_inner(cursor: &mut Cursor, registry: &RecipeRegistry) -> Result<ObjectInstance> {
    let name_bytes = cursor.take_len_prefixed()?;
    let type_name = String::from_utf8(name_bytes).map_err(|e| Error::RecipeRuleViolation(e.to_string()))?;
    let (recipe, _) = registry.resolve(&type_name)?;
    let recipe = recipe.clone();

    let encoded_count = cursor.take_u64()?;
    let mut fields = Vec::with_capacity(encoded_count as usize);
    for _ in 0..encoded_count {
        let field_name_bytes = cursor.take_len_prefixed()?;
        let field_name = String::from_utf8(field_name_bytes).map_err(|e| Error::RecipeRuleViolation(e.to_string()))?;
        let rule = recipe
            .fields
            .iter()
            .find(|f| f.name == field_name)
            .ok_or_else(|| Error::RecipeRuleViolation(format!("unknown field {field_name} on {}", recipe.name)))?;
        if cursor.peek_u8()? == tag::ABSENT {
            cursor.take_u8()?;
            continue;
        }
        let value = decode_value(cursor, &rule.rule, registry)?;
        fields.push((field_name, value));
    }
    Ok(ObjectInstance { type_name: recipe.name.clone(), fields })
}

/// Decode bytes produced by [`canonical_bytes`] back into an [`ObjectInstance`],
/// resolving legacy type aliases through `registry` the same way a reader of a
/// persisted object does (spec §4.4 "up-conversion").
pub fn decode(bytes: &[u8], registry: &RecipeRegistry) -> Result<ObjectInstance> {
    let mut cursor = Cursor::new(bytes);
    if cursor.take_u8()? != tag::ROOT {
        return Err(Error::RecipeRuleViolation("not a canonical object: missing root tag".into()));
    }
    decode_inner(&mut cursor, registry)
}

/// Encode `obj` against its own recipe in `registry`.
pub fn canonical_bytes(obj: &ObjectInstance, registry: &RecipeRegistry) -> Result<Vec<u8>> {
    let mut buf = vec![tag::ROOT];
    encode_inner(obj, registry, &mut buf)?;
    Ok(buf)
}

/// Encode `obj` against an explicit recipe override (used for the id-hash
/// projection, whose recipe is a filtered subset rather than the registry entry).
fn canonical_bytes_with_recipe(obj: &ObjectInstance, recipe: &Recipe, registry: &RecipeRegistry) -> Result<Vec<u8>> {
    let mut buf = vec![tag::ROOT];
    write_len_prefixed(&mut buf, recipe.name.as_bytes());
    buf.extend_from_slice(&(recipe.fields.len() as u64).to_be_bytes());
    for rule in &recipe.fields {
        write_len_prefixed(&mut buf, rule.name.as_bytes());
        match obj.field(&rule.name) {
            Some(value) => encode_value(value, &rule.rule, registry, &mut buf)?,
            None if rule.optional => buf.push(tag::ABSENT),
            None => {
                return Err(Error::RecipeRuleViolation(format!(
                    "missing required identifying field {} on {}",
                    rule.name, recipe.name
                )))
            }
        }
    }
    Ok(buf)
}

/// `ObjectHash = SHA-256(canonical_bytes(obj))`.
pub fn object_hash(obj: &ObjectInstance, registry: &RecipeRegistry) -> Result<Hash> {
    Ok(Hash::of(&canonical_bytes(obj, registry)?))
}

/// `IdHash = SHA-256(canonical_bytes(project(obj, identifying_fields)))`.
pub fn id_hash(obj: &ObjectInstance, registry: &RecipeRegistry) -> Result<Hash> {
    let recipe = registry.get(&obj.type_name)?;
    let projection_recipe = recipe.id_projection();
    let projected = obj.project_identifying(recipe);
    Ok(Hash::of(&canonical_bytes_with_recipe(&projected, &projection_recipe, registry)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{Discipline, FieldRule, PrimitiveKind};

    fn temp_registry() -> RecipeRegistry {
        let mut reg = RecipeRegistry::new();
        reg.register(Recipe::new(
            "BodyTemperature",
            Discipline::Unversioned,
            vec![FieldRule::new("temperature", RuleKind::Primitive(PrimitiveKind::Integer))],
        ));
        reg
    }

    #[test]
    fn field_order_does_not_affect_bytes() {
        let mut reg = RecipeRegistry::new();
        reg.register(Recipe::new(
            "Pair",
            Discipline::Unversioned,
            vec![
                FieldRule::new("a", RuleKind::Primitive(PrimitiveKind::Integer)),
                FieldRule::new("b", RuleKind::Primitive(PrimitiveKind::Integer)),
            ],
        ));

        let ab = ObjectInstance::new("Pair")
            .with_field("a", Value::Integer(1))
            .with_field("b", Value::Integer(2));
        let ba = ObjectInstance::new("Pair")
            .with_field("b", Value::Integer(2))
            .with_field("a", Value::Integer(1));

        assert_eq!(canonical_bytes(&ab, &reg).unwrap(), canonical_bytes(&ba, &reg).unwrap());
    }

    #[test]
    fn store_and_retrieve_hash_matches() {
        let reg = temp_registry();
        let obj = ObjectInstance::new("BodyTemperature").with_field("temperature", Value::Integer(37));
        let h1 = object_hash(&obj, &reg).unwrap();
        let h2 = object_hash(&obj, &reg).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn rejects_nan_and_infinity() {
        let mut reg = RecipeRegistry::new();
        reg.register(Recipe::new(
            "Measurement",
            Discipline::Unversioned,
            vec![FieldRule::new("value", RuleKind::Primitive(PrimitiveKind::Float))],
        ));
        let nan_obj = ObjectInstance::new("Measurement").with_field("value", Value::Float(f64::NAN));
        assert!(canonical_bytes(&nan_obj, &reg).is_err());

        let inf_obj = ObjectInstance::new("Measurement").with_field("value", Value::Float(f64::INFINITY));
        assert!(canonical_bytes(&inf_obj, &reg).is_err());
    }

    #[test]
    fn negative_zero_normalizes_to_positive() {
        let mut reg = RecipeRegistry::new();
        reg.register(Recipe::new(
            "Measurement",
            Discipline::Unversioned,
            vec![FieldRule::new("value", RuleKind::Primitive(PrimitiveKind::Float))],
        ));
        let neg = ObjectInstance::new("Measurement").with_field("value", Value::Float(-0.0));
        let pos = ObjectInstance::new("Measurement").with_field("value", Value::Float(0.0));
        assert_eq!(canonical_bytes(&neg, &reg).unwrap(), canonical_bytes(&pos, &reg).unwrap());
    }

    #[test]
    fn id_hash_ignores_non_identifying_fields() {
        let mut reg = RecipeRegistry::new();
        reg.register(Recipe::new(
            "Profile",
            Discipline::Versioned,
            vec![
                FieldRule::new("personId", RuleKind::Primitive(PrimitiveKind::String)).identifying(),
                FieldRule::new("nickname", RuleKind::Primitive(PrimitiveKind::String)),
            ],
        ));

        let v1 = ObjectInstance::new("Profile")
            .with_field("personId", Value::String("p1".into()))
            .with_field("nickname", Value::String("alice".into()));
        let v2 = ObjectInstance::new("Profile")
            .with_field("personId", Value::String("p1".into()))
            .with_field("nickname", Value::String("ally".into()));

        assert_eq!(id_hash(&v1, &reg).unwrap(), id_hash(&v2, &reg).unwrap());
        assert_ne!(object_hash(&v1, &reg).unwrap(), object_hash(&v2, &reg).unwrap());
    }

    #[test]
    fn decode_reconstructs_the_encoded_object() {
        let mut reg = RecipeRegistry::new();
        reg.register(Recipe::new(
            "Profile",
            Discipline::Versioned,
            vec![
                FieldRule::new("personId", RuleKind::Primitive(PrimitiveKind::String)).identifying(),
                FieldRule::new("nickname", RuleKind::Primitive(PrimitiveKind::String)).optional(),
            ],
        ));
        let obj = ObjectInstance::new("Profile").with_field("personId", Value::String("p1".into()));

        let bytes = canonical_bytes(&obj, &reg).unwrap();
        let decoded = decode(&bytes, &reg).unwrap();
        assert_eq!(decoded.type_name, "Profile");
        assert_eq!(decoded.field("personId"), Some(&Value::String("p1".into())));
        assert_eq!(decoded.field("nickname"), None);
    }

    #[test]
    fn set_dedups_and_sorts_independent_of_insertion_order() {
        let mut reg = RecipeRegistry::new();
        reg.register(Recipe::new(
            "Tags",
            Discipline::Unversioned,
            vec![FieldRule::new(
                "tags",
                RuleKind::Set(Box::new(RuleKind::Primitive(PrimitiveKind::String))),
            )],
        ));

        let a = ObjectInstance::new("Tags").with_field(
            "tags",
            Value::Set(vec![Value::String("b".into()), Value::String("a".into()), Value::String("a".into())]),
        );
        let b = ObjectInstance::new("Tags").with_field(
            "tags",
            Value::Set(vec![Value::String("a".into()), Value::String("b".into())]),
        );

        assert_eq!(canonical_bytes(&a, &reg).unwrap(), canonical_bytes(&b, &reg).unwrap());
    }

    #[test]
    fn decoding_through_an_alias_defaults_fields_absent_from_the_narrower_recipe() {
        // Encode under the recipe as it stood at write time: one field.
        let mut writer_reg = RecipeRegistry::new();
        writer_reg.register(Recipe::new(
            "DocumentInfo_1_0_0",
            Discipline::Versioned,
            vec![FieldRule::new("id", RuleKind::Primitive(PrimitiveKind::String)).identifying()],
        ));
        let obj = ObjectInstance::new("DocumentInfo_1_0_0").with_field("id", Value::String("doc1".into()));
        let bytes = canonical_bytes(&obj, &writer_reg).unwrap();

        // A later reader knows a wider recipe and an alias from the old name.
        let mut reader_reg = RecipeRegistry::new();
        reader_reg.register(Recipe::new(
            "DocumentInfo_1_1_0",
            Discipline::Versioned,
            vec![
                FieldRule::new("id", RuleKind::Primitive(PrimitiveKind::String)).identifying(),
                FieldRule::new("title", RuleKind::Primitive(PrimitiveKind::String)).optional(),
            ],
        ));
        reader_reg.register_alias("DocumentInfo_1_0_0", "DocumentInfo_1_1_0");

        let decoded = decode(&bytes, &reader_reg).unwrap();
        assert_eq!(decoded.type_name, "DocumentInfo_1_1_0");
        assert_eq!(decoded.field("id"), Some(&Value::String("doc1".into())));
        assert_eq!(decoded.field("title"), None);
    }
}
