use std::collections::BTreeSet;

use flap_record::{AttrType, ClassDef, Filter, Record, RecordResult, RecordStore};

use crate::model::{model, Model};

/// A label grouping checks, and the target of rule tag matching.
#[derive(Clone, Debug)]
pub struct Tag {
    record: Record,
}

model!(Tag, "tag");

impl Tag {
    pub const CHECKS: &'static str = "checks";
    pub const RULES: &'static str = "rules";

    pub fn class_def() -> ClassDef {
        ClassDef::new(Self::CLASS)
            .attribute("name", AttrType::String)
            .unique("name")
            .required("name")
    }

    /// Look a tag up through the unique name index.
    pub fn find_by_name(store: &RecordStore, name: &str) -> RecordResult<Option<Self>> {
        Ok(store
            .intersect(Self::CLASS, Filter::new().eq("name", name))?
            .first()?
            .map(Self::wrap))
    }

    pub fn name(&self) -> RecordResult<Option<&str>> {
        self.record.get_str("name")
    }

    pub fn set_name(&mut self, name: &str) -> RecordResult<()> {
        self.record.set("name", name)
    }

    pub fn check_ids(&self, store: &RecordStore) -> RecordResult<BTreeSet<String>> {
        self.linked_ids(store, Self::CHECKS)
    }

    pub fn rule_ids(&self, store: &RecordStore) -> RecordResult<BTreeSet<String>> {
        self.linked_ids(store, Self::RULES)
    }
}
