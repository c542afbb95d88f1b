//! Validator abstraction.
//!
//! A validator is a named, pure check over a candidate record's id and
//! attributes that returns every violation it finds. A class holds an ordered
//! list of validators and all of them always run, so a failed save reports
//! every problem at once.

use std::fmt;
use std::sync::Arc;

use flap_types::Attributes;

/// What kind of rule a violation broke.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViolationKind {
    /// A required attribute is missing or blank.
    Required,
    /// A value does not conform to the attribute's declared type.
    Type,
    /// A unique attribute (or the id) collides with another record.
    Unique,
    /// A class-specific rule, named by its validator.
    Custom(String),
}

/// A single failed predicate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    /// The attribute at fault, when the rule is attribute-scoped.
    pub attribute: Option<String>,
    pub kind: ViolationKind,
    pub message: String,
}

impl Violation {
    pub fn required(attribute: impl Into<String>) -> Self {
        Self {
            attribute: Some(attribute.into()),
            kind: ViolationKind::Required,
            message: "can't be blank".into(),
        }
    }

    pub fn type_mismatch(attribute: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            attribute: Some(attribute.into()),
            kind: ViolationKind::Type,
            message: message.into(),
        }
    }

    pub fn unique(attribute: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            attribute: Some(attribute.into()),
            kind: ViolationKind::Unique,
            message: message.into(),
        }
    }

    pub fn custom(
        validator: impl Into<String>,
        attribute: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            attribute: attribute.map(str::to_string),
            kind: ViolationKind::Custom(validator.into()),
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.attribute {
            Some(attr) => write!(f, "{attr} {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Every violation found for one candidate record, in validator order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationErrors(Vec<Violation>);

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, violation: Violation) {
        self.0.push(violation);
    }

    pub fn extend(&mut self, violations: impl IntoIterator<Item = Violation>) {
        self.0.extend(violations);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Violation> {
        self.0.iter()
    }

    /// Messages for one attribute, e.g. `["can't be blank"]`.
    pub fn on(&self, attribute: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|v| v.attribute.as_deref() == Some(attribute))
            .map(|v| v.message.as_str())
            .collect()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(", "))
    }
}

impl IntoIterator for ValidationErrors {
    type Item = Violation;
    type IntoIter = std::vec::IntoIter<Violation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// A named check over a candidate record.
pub trait Validator: Send + Sync {
    /// Stable name, used for [`ViolationKind::Custom`].
    fn name(&self) -> &str;

    /// Return every violation; an empty vector means the record passes.
    fn validate(&self, id: &str, attrs: &Attributes) -> Vec<Violation>;
}

/// Built-in presence check: the attribute must be set and non-blank.
#[derive(Clone, Debug)]
pub struct Presence {
    attribute: String,
}

impl Presence {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
        }
    }
}

impl Validator for Presence {
    fn name(&self) -> &str {
        "presence"
    }

    fn validate(&self, _id: &str, attrs: &Attributes) -> Vec<Violation> {
        match attrs.get(&self.attribute) {
            Some(v) if !v.is_blank() => Vec::new(),
            _ => vec![Violation::required(&self.attribute)],
        }
    }
}

type CheckFn = dyn Fn(&str, &Attributes) -> Vec<Violation> + Send + Sync;

/// Validator backed by a closure.
#[derive(Clone)]
pub struct FnValidator {
    name: String,
    check: Arc<CheckFn>,
}

impl FnValidator {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&str, &Attributes) -> Vec<Violation> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }
}

impl Validator for FnValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, id: &str, attrs: &Attributes) -> Vec<Violation> {
        (self.check)(id, attrs)
    }
}

impl fmt::Debug for FnValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnValidator").field("name", &self.name).finish()
    }
}
