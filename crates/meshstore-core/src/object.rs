//! The dynamic object value tree (spec §3, Design Notes "tagged sum").
//!
//! Rather than hand-writing one Rust struct per recipe, objects are represented as
//! a generic [`Value`] tree plus a type tag ([`ObjectInstance`]); the canonical
//! serializer (`crate::canonical`) is recipe-table driven and walks whichever
//! recipe the registry has for `type_name`. This is what lets `initialRecipes`
//! (spec §6) add object types at start-up without new Rust code.

use crate::hash::{IdHash, ObjectHash};
use crate::recipe::{FieldRule, Recipe};

/// A field's value. Containers and nested objects recurse.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Bytes(Vec<u8>),
    RefObject(ObjectHash),
    RefId(IdHash),
    RefBlob(ObjectHash),
    RefClob(ObjectHash),
    List(Vec<Value>),
    Bag(Vec<Value>),
    Set(Vec<Value>),
    Mapping(Vec<(Value, Value)>),
    Object(Box<ObjectInstance>),
}

/// A concrete object: a type tag plus its fields, in whatever order the caller
/// populated them (the canonical serializer reorders per recipe, so construction
/// order never affects the hash).
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectInstance {
    pub type_name: String,
    pub fields: Vec<(String, Value)>,
}

impl ObjectInstance {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self { type_name: type_name.into(), fields: Vec::new() }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.push((name.into(), value));
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Project to the subset of fields a recipe marks identifying (spec §4.2).
    pub fn project_identifying(&self, recipe: &Recipe) -> ObjectInstance {
        let wanted: Vec<&FieldRule> = recipe.identifying_fields();
        let fields = wanted
            .into_iter()
            .filter_map(|rule| self.field(&rule.name).map(|v| (rule.name.clone(), v.clone())))
            .collect();
        ObjectInstance { type_name: self.type_name.clone(), fields }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{Discipline, PrimitiveKind, RuleKind};

    #[test]
    fn project_identifying_keeps_only_marked_fields() {
        let recipe = Recipe::new(
            "Profile",
            Discipline::Versioned,
            vec![
                FieldRule::new("personId", RuleKind::Primitive(PrimitiveKind::String)).identifying(),
                FieldRule::new("nickname", RuleKind::Primitive(PrimitiveKind::String)),
            ],
        );
        let obj = ObjectInstance::new("Profile")
            .with_field("nickname", Value::String("alice".into()))
            .with_field("personId", Value::String("p1".into()));

        let projected = obj.project_identifying(&recipe);
        assert_eq!(projected.fields.len(), 1);
        assert_eq!(projected.field("personId"), Some(&Value::String("p1".into())));
        assert_eq!(projected.field("nickname"), None);
    }
}
