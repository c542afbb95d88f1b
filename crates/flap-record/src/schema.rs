//! Static schema descriptors.
//!
//! Each class is declared once at startup as a [`ClassDef`]: an ordered table
//! of attribute name, semantic type, and index flags, plus the validators the
//! class runs before every save. Relationships are declared separately as
//! [`AssociationDef`]s. A [`SchemaRegistry`] checks the whole declaration for
//! consistency and is immutable afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use flap_types::{AttrType, Attributes, Value};

use crate::error::{RecordError, RecordResult};
use crate::validation::{Presence, Validator};

/// Pseudo-attribute naming the record id in queries.
pub const ID_ATTRIBUTE: &str = "id";

/// Characters that would make keys ambiguous.
const FORBIDDEN_NAME_CHARS: &[char] = &[':', '/', ' ', '\t', '\n', '\r'];

/// One declared attribute.
#[derive(Clone, Debug, PartialEq)]
pub struct AttributeDef {
    pub name: String,
    pub attr_type: AttrType,
    /// Maintained in an equality index (`C::by_A:set:<value>`).
    pub indexed: bool,
    /// Maintained in a unique index (`C::by_A:unique`).
    pub unique: bool,
    /// Additionally maintained in a rank-ordered index; implies `indexed`.
    pub sortable: bool,
    /// Applied when a record is constructed without this attribute.
    pub default: Option<Value>,
}

impl AttributeDef {
    fn new(name: &str, attr_type: AttrType) -> Self {
        Self {
            name: name.to_string(),
            attr_type,
            indexed: false,
            unique: false,
            sortable: false,
            default: None,
        }
    }
}

/// Declaration of one record class.
pub struct ClassDef {
    name: String,
    attributes: Vec<AttributeDef>,
    validators: Vec<Box<dyn Validator>>,
    problems: Vec<String>,
}

impl ClassDef {
    /// Start declaring a class with no attributes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            validators: Vec::new(),
            problems: Vec::new(),
        }
    }

    /// Declare a class from an attribute table and its indexed and unique
    /// subsets.
    pub fn define(
        name: impl Into<String>,
        attributes: &[(&str, AttrType)],
        indexed: &[&str],
        unique: &[&str],
    ) -> Self {
        let mut class = Self::new(name);
        for (attr, ty) in attributes {
            class = class.attribute(attr, *ty);
        }
        for attr in indexed {
            class = class.indexed(attr);
        }
        for attr in unique {
            class = class.unique(attr);
        }
        class
    }

    pub fn attribute(mut self, name: &str, attr_type: AttrType) -> Self {
        if name == ID_ATTRIBUTE {
            self.problems.push(format!("{}: `id` is reserved", self.name));
        } else if let Err(reason) = check_name(name) {
            self.problems
                .push(format!("{}: attribute {name:?} {reason}", self.name));
        } else if self.attribute_def(name).is_some() {
            self.problems
                .push(format!("{}: attribute {name} declared twice", self.name));
        } else {
            self.attributes.push(AttributeDef::new(name, attr_type));
        }
        self
    }

    pub fn indexed(self, name: &str) -> Self {
        self.modify(name, "indexed", |a| a.indexed = true)
    }

    pub fn unique(self, name: &str) -> Self {
        self.modify(name, "unique", |a| a.unique = true)
    }

    pub fn sortable(self, name: &str) -> Self {
        self.modify(name, "sortable", |a| {
            a.indexed = true;
            a.sortable = true;
        })
    }

    pub fn default_value(self, name: &str, value: impl Into<Value>) -> Self {
        let value = value.into().canonical();
        self.modify(name, "default", move |a| a.default = Some(value))
    }

    /// Attach the built-in presence check for `name`.
    pub fn required(mut self, name: &str) -> Self {
        if self.attribute_def(name).is_none() {
            self.problems
                .push(format!("{}: required attribute {name} is not declared", self.name));
            return self;
        }
        self.validators.push(Box::new(Presence::new(name)));
        self
    }

    /// Attach a custom validator. Validators run in attachment order.
    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    fn modify(mut self, name: &str, what: &str, f: impl FnOnce(&mut AttributeDef)) -> Self {
        match self.attributes.iter_mut().find(|a| a.name == name) {
            Some(attr) => f(attr),
            None => self
                .problems
                .push(format!("{}: {what} attribute {name} is not declared", self.name)),
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attribute_def(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Attributes in declaration order.
    pub fn attributes(&self) -> impl Iterator<Item = &AttributeDef> {
        self.attributes.iter()
    }

    pub fn unique_attributes(&self) -> impl Iterator<Item = &AttributeDef> {
        self.attributes.iter().filter(|a| a.unique)
    }

    pub fn validators(&self) -> &[Box<dyn Validator>] {
        &self.validators
    }

    /// Default values for a freshly constructed record.
    pub fn defaults(&self) -> Attributes {
        self.attributes
            .iter()
            .filter_map(|a| a.default.clone().map(|v| (a.name.clone(), v)))
            .collect()
    }

    fn check(&self) -> Vec<String> {
        let mut problems = self.problems.clone();
        if let Err(reason) = check_name(&self.name) {
            problems.push(format!("class name {:?} {reason}", self.name));
        }
        for attr in &self.attributes {
            if let Some(default) = &attr.default {
                if default.attr_type() != attr.attr_type {
                    problems.push(format!(
                        "{}: default for {} is a {}, expected {}",
                        self.name,
                        attr.name,
                        default.attr_type(),
                        attr.attr_type
                    ));
                }
            }
        }
        problems
    }
}

impl fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let validators: Vec<&str> = self.validators.iter().map(|v| v.name()).collect();
        f.debug_struct("ClassDef")
            .field("name", &self.name)
            .field("attributes", &self.attributes)
            .field("validators", &validators)
            .finish()
    }
}

pub(crate) fn check_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("must not be empty".into());
    }
    if let Some(ch) = name.chars().find(|c| FORBIDDEN_NAME_CHARS.contains(c)) {
        return Err(format!("contains forbidden character {ch:?}"));
    }
    Ok(())
}

/// How many targets an owner may link, and whether the target links back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cardinality {
    /// Owner-side link set only; the target has no back-pointer.
    OneToMany,
    /// Symmetric link sets on both sides, always updated together.
    ManyToMany,
}

/// A named relation from an owner class to a target class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssociationDef {
    pub owner: String,
    pub name: String,
    pub target: String,
    pub cardinality: Cardinality,
    /// The relation name on the target that mirrors this one.
    pub inverse: Option<String>,
}

impl AssociationDef {
    pub fn is_symmetric(&self) -> bool {
        self.cardinality == Cardinality::ManyToMany
    }
}

/// Collects class and association declarations before validation.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    classes: Vec<ClassDef>,
    associations: Vec<AssociationDef>,
}

impl SchemaBuilder {
    pub fn class(mut self, class: ClassDef) -> Self {
        self.classes.push(class);
        self
    }

    /// One-to-many: `owner.name` holds target ids.
    pub fn has_many(mut self, owner: &str, name: &str, target: &str) -> Self {
        self.associations.push(AssociationDef {
            owner: owner.into(),
            name: name.into(),
            target: target.into(),
            cardinality: Cardinality::OneToMany,
            inverse: None,
        });
        self
    }

    /// Many-to-many: `owner.name` and `target.inverse` mirror each other.
    pub fn has_and_belongs_to_many(
        mut self,
        owner: &str,
        name: &str,
        target: &str,
        inverse: &str,
    ) -> Self {
        self.associations.push(AssociationDef {
            owner: owner.into(),
            name: name.into(),
            target: target.into(),
            cardinality: Cardinality::ManyToMany,
            inverse: Some(inverse.into()),
        });
        self
    }

    /// Validate every declaration and freeze the schema.
    pub fn build(self) -> RecordResult<SchemaRegistry> {
        let mut problems = Vec::new();
        let mut classes = BTreeMap::new();

        for class in self.classes {
            problems.extend(class.check());
            let name = class.name.clone();
            if classes.insert(name.clone(), Arc::new(class)).is_some() {
                problems.push(format!("class {name} declared twice"));
            }
        }

        let mut associations: BTreeMap<(String, String), AssociationDef> = BTreeMap::new();
        let mut declare = |assoc: AssociationDef, problems: &mut Vec<String>| {
            let key = (assoc.owner.clone(), assoc.name.clone());
            if associations.insert(key, assoc.clone()).is_some() {
                problems.push(format!("association {}.{} declared twice", assoc.owner, assoc.name));
            }
        };

        for assoc in self.associations {
            for class in [&assoc.owner, &assoc.target] {
                if !classes.contains_key(class) {
                    problems.push(format!(
                        "association {}.{} refers to unknown class {class}",
                        assoc.owner, assoc.name
                    ));
                }
            }
            if let Err(reason) = check_name(&assoc.name) {
                problems.push(format!("association name {:?} {reason}", assoc.name));
            }
            if let Some(owner) = classes.get(&assoc.owner) {
                if owner.attribute_def(&assoc.name).is_some() {
                    problems.push(format!(
                        "association {}.{} shadows an attribute",
                        assoc.owner, assoc.name
                    ));
                }
            }

            if let (Cardinality::ManyToMany, Some(inverse)) = (assoc.cardinality, &assoc.inverse) {
                declare(
                    AssociationDef {
                        owner: assoc.target.clone(),
                        name: inverse.clone(),
                        target: assoc.owner.clone(),
                        cardinality: Cardinality::ManyToMany,
                        inverse: Some(assoc.name.clone()),
                    },
                    &mut problems,
                );
            }
            declare(assoc, &mut problems);
        }

        if !problems.is_empty() {
            return Err(RecordError::Schema(problems.join("; ")));
        }

        Ok(SchemaRegistry {
            classes,
            associations,
        })
    }
}

/// The frozen set of classes and associations known to a store.
#[derive(Debug)]
pub struct SchemaRegistry {
    classes: BTreeMap<String, Arc<ClassDef>>,
    associations: BTreeMap<(String, String), AssociationDef>,
}

impl SchemaRegistry {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn class(&self, name: &str) -> RecordResult<Arc<ClassDef>> {
        self.classes
            .get(name)
            .cloned()
            .ok_or_else(|| RecordError::UnknownClass(name.to_string()))
    }

    /// All classes, ordered by name.
    pub fn classes(&self) -> impl Iterator<Item = &Arc<ClassDef>> {
        self.classes.values()
    }

    pub fn association(&self, class: &str, relation: &str) -> RecordResult<&AssociationDef> {
        self.associations
            .get(&(class.to_string(), relation.to_string()))
            .ok_or_else(|| RecordError::UnknownAssociation {
                class: class.to_string(),
                relation: relation.to_string(),
            })
    }

    /// Associations whose owner side is `class` (including registered
    /// inverses of many-to-many relations).
    pub fn associations_of<'a>(
        &'a self,
        class: &'a str,
    ) -> impl Iterator<Item = &'a AssociationDef> + 'a {
        self.associations.values().filter(move |a| a.owner == class)
    }

    /// Associations that point at `class` as their target.
    pub fn associations_targeting<'a>(
        &'a self,
        class: &'a str,
    ) -> impl Iterator<Item = &'a AssociationDef> + 'a {
        self.associations.values().filter(move |a| a.target == class)
    }
}
