//! Deterministic mapping from (class, id, purpose) to backend keys.
//!
//! For class `C`, record id `I`, attribute `A`, relation `R`:
//!
//! | Purpose               | Key                       | Kind       |
//! |-----------------------|---------------------------|------------|
//! | attribute hash        | `C:I:attrs`               | hash       |
//! | class id set          | `C::ids`                  | set        |
//! | equality index        | `C::by_A:set:<value>`     | set        |
//! | sortable index        | `C::by_A:sorted:<value>`  | sorted set |
//! | unique index          | `C::by_A:unique`          | hash       |
//! | association link set  | `C:I:R_ids`               | set        |
//! | creation rank counter | `C::rank`                 | counter    |
//! | class lock            | `C::lock`                 | lock key   |
//!
//! With a namespace `N`, every key is prefixed with `N/`.

/// Key builder for one store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeySpace {
    namespace: Option<String>,
}

impl KeySpace {
    pub fn new(namespace: Option<String>) -> Self {
        Self { namespace }
    }

    fn class(&self, class: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}/{class}"),
            None => class.to_string(),
        }
    }

    /// Prefix shared by every key of a class.
    pub fn class_prefix(&self, class: &str) -> String {
        format!("{}:", self.class(class))
    }

    pub fn attrs(&self, class: &str, id: &str) -> String {
        format!("{}:{id}:attrs", self.class(class))
    }

    pub fn ids(&self, class: &str) -> String {
        format!("{}::ids", self.class(class))
    }

    pub fn index_set(&self, class: &str, attribute: &str, encoded: &str) -> String {
        format!("{}::by_{attribute}:set:{encoded}", self.class(class))
    }

    pub fn index_sorted(&self, class: &str, attribute: &str, encoded: &str) -> String {
        format!("{}::by_{attribute}:sorted:{encoded}", self.class(class))
    }

    pub fn unique(&self, class: &str, attribute: &str) -> String {
        format!("{}::by_{attribute}:unique", self.class(class))
    }

    pub fn link(&self, class: &str, id: &str, relation: &str) -> String {
        format!("{}:{id}:{relation}_ids", self.class(class))
    }

    pub fn rank(&self, class: &str) -> String {
        format!("{}::rank", self.class(class))
    }

    pub fn lock(&self, class: &str) -> String {
        format!("{}::lock", self.class(class))
    }
}
