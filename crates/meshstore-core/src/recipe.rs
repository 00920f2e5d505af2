//! Recipe schemas (spec §3, §4.2, Design Notes "dynamic duck-typed object identification")
//!
//! A [`Recipe`] is the runtime schema for one object type: an ordered list of field
//! rules. The canonical serializer walks a recipe's fields in *declared* order, never
//! in whatever order a caller happened to populate an [`crate::object::ObjectInstance`],
//! which is what makes byte-equal serializations possible regardless of construction
//! order (spec §4.2, scenario S6). Recipes are registered at start-up from
//! `InstanceOptions::initial_recipes` rather than hand-written per type, so adding a
//! type is data, not code.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Non-reference leaf kinds a field can hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrimitiveKind {
    String,
    Integer,
    Float,
    Boolean,
    Bytes,
}

/// The four reference kinds spec §3 distinguishes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceKind {
    /// ObjectHash of any object.
    Object,
    /// IdHash of a versioned entity.
    Id,
    /// ObjectHash tagged BLOB.
    Blob,
    /// ObjectHash tagged CLOB (UTF-8 text blob).
    Clob,
}

/// What a field rule accepts. Containers nest recursively via `Box`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RuleKind {
    Primitive(PrimitiveKind),
    Reference(ReferenceKind),
    /// A nested object following another (or the same) recipe.
    NestedObject(String),
    /// Ordered sequence.
    OrderedList(Box<RuleKind>),
    /// Unordered multi-set (duplicates kept, canonical order is encoded-byte order).
    Bag(Box<RuleKind>),
    /// Unordered set (duplicates elided).
    Set(Box<RuleKind>),
    /// Mapping; canonical order is encoded-key-byte order.
    Mapping(Box<RuleKind>, Box<RuleKind>),
}

/// One field's rule within a recipe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    pub name: String,
    pub rule: RuleKind,
    /// Part of the identifying subset used to compute the IdHash (spec §3).
    pub identifying: bool,
    /// Field may be absent.
    pub optional: bool,
}

impl FieldRule {
    pub fn new(name: impl Into<String>, rule: RuleKind) -> Self {
        Self { name: name.into(), rule, identifying: false, optional: false }
    }

    pub fn identifying(mut self) -> Self {
        self.identifying = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Versioned vs. unversioned discipline (spec §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Discipline {
    /// No concept of successor; stored once by ObjectHash.
    Unversioned,
    /// Has an identifying subset; tracked by a VersionMap keyed on IdHash.
    Versioned,
}

/// Schema for one object type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub name: String,
    pub discipline: Discipline,
    pub fields: Vec<FieldRule>,
}

impl Recipe {
    pub fn new(name: impl Into<String>, discipline: Discipline, fields: Vec<FieldRule>) -> Self {
        Self { name: name.into(), discipline, fields }
    }

    /// Fields marked identifying, in declared order.
    pub fn identifying_fields(&self) -> Vec<&FieldRule> {
        self.fields.iter().filter(|f| f.identifying).collect()
    }

    /// A synthetic recipe containing only the identifying subset, used to compute
    /// the IdHash projection (spec §4.2 "project(obj, identifying_fields)").
    pub fn id_projection(&self) -> Recipe {
        Recipe {
            name: self.name.clone(),
            discipline: self.discipline,
            fields: self.identifying_fields().into_iter().cloned().collect(),
        }
    }
}

/// Registry of known recipes plus legacy-name aliases (spec §4.4 up-conversion:
/// `DocumentInfo` recognized as an alias of `DocumentInfo_1_1_0`).
#[derive(Clone, Debug, Default)]
pub struct RecipeRegistry {
    recipes: HashMap<String, Recipe>,
    /// legacy alias -> canonical recipe name. Resolving through an alias tells
    /// the canonical decoder to decode against the wider recipe; any field the
    /// canonical recipe has that the as-encoded bytes don't is filled in with
    /// its absent/default value at decode time (`canonical::decode_inner`),
    /// not stored here.
    aliases: HashMap<String, String>,
}

impl RecipeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, recipe: Recipe) {
        self.recipes.insert(recipe.name.clone(), recipe);
    }

    /// Register a legacy alias that up-converts to `canonical`.
    pub fn register_alias(&mut self, alias: impl Into<String>, canonical: impl Into<String>) {
        self.aliases.insert(alias.into(), canonical.into());
    }

    /// Resolve a possibly-legacy type name to its canonical recipe, returning
    /// whether up-conversion occurred.
    pub fn resolve(&self, type_name: &str) -> Result<(&Recipe, bool)> {
        if let Some(recipe) = self.recipes.get(type_name) {
            return Ok((recipe, false));
        }
        if let Some(canonical) = self.aliases.get(type_name) {
            if let Some(recipe) = self.recipes.get(canonical) {
                return Ok((recipe, true));
            }
        }
        Err(Error::UnknownType(type_name.to_string()))
    }

    pub fn get(&self, type_name: &str) -> Result<&Recipe> {
        self.recipes
            .get(type_name)
            .ok_or_else(|| Error::UnknownType(type_name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_recipe() -> Recipe {
        Recipe::new(
            "BodyTemperature",
            Discipline::Unversioned,
            vec![FieldRule::new("temperature", RuleKind::Primitive(PrimitiveKind::Float))],
        )
    }

    #[test]
    fn registry_resolves_direct_and_alias() {
        let mut reg = RecipeRegistry::new();
        reg.register(sample_recipe());
        reg.register_alias("DocumentInfo", "DocumentInfo_1_1_0");
        reg.register(Recipe::new(
            "DocumentInfo_1_1_0",
            Discipline::Versioned,
            vec![FieldRule::new("id", RuleKind::Primitive(PrimitiveKind::String)).identifying()],
        ));

        let (recipe, upconverted) = reg.resolve("BodyTemperature").unwrap();
        assert_eq!(recipe.name, "BodyTemperature");
        assert!(!upconverted);

        let (recipe, upconverted) = reg.resolve("DocumentInfo").unwrap();
        assert_eq!(recipe.name, "DocumentInfo_1_1_0");
        assert!(upconverted);

        assert!(reg.resolve("NoSuchType").is_err());
    }

    #[test]
    fn identifying_fields_filtered() {
        let recipe = Recipe::new(
            "Profile",
            Discipline::Versioned,
            vec![
                FieldRule::new("personId", RuleKind::Primitive(PrimitiveKind::String)).identifying(),
                FieldRule::new("nickname", RuleKind::Primitive(PrimitiveKind::String)),
            ],
        );
        let ids = recipe.identifying_fields();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids[0].name, "personId");
    }
}
